//! Function-code codecs.
//!
//! One codec per supported function code: decode the request fields from
//! the ADU, enforce the parameter bounds the application protocol
//! defines, call the matching [`ModbusDevice`] method and serialise the
//! response PDU. Bounds are checked before the device is consulted, and
//! the first failure wins.
//!
//! Codecs never see framing: the dispatcher gets the ADU with the CRC
//! already stripped and verified, and the response PDU it stages is
//! addressed and check-summed by the caller.

use heapless::Vec;

use crate::bytes::be16_get;
use crate::slave::{Exception, FunctionCode};
use crate::MAX_PDU_LEN;

/// Staged response PDU: function code plus payload.
pub(crate) type ResponsePdu = Vec<u8, MAX_PDU_LEN>;

/// Most coils/discrete inputs in one read (0x07D0).
const MAX_READ_BITS: u16 = 2000;
/// Most coils in one write (0x07B0).
const MAX_WRITE_BITS: u16 = 1968;
/// Most registers in one read (0x007D).
const MAX_READ_REGISTERS: u16 = 125;
/// Most registers in one write (0x007B).
const MAX_WRITE_REGISTERS: u16 = 123;
/// Most registers in the write half of read/write-multiple (0x0079).
const MAX_RW_WRITE_REGISTERS: u16 = 121;

/// Wire encoding of an energised coil in Write Single Coil.
const COIL_ON: u16 = 0xFF00;
/// Wire encoding of a de-energised coil in Write Single Coil.
const COIL_OFF: u16 = 0x0000;

/// Data model of the device behind the slave.
///
/// One method per supported function code. Every method defaults to
/// [`Exception::IllegalFunction`], so an implementation picks exactly the
/// codes its device supports and the engine answers the rest with the
/// proper exception.
///
/// The engine decodes and bounds-checks all request parameters before
/// calling in, and owns all framing; implementations only move data and
/// report [`Exception`]s. Multi-byte register values on the wire are
/// big-endian; use [`bytes::be16_set`](crate::bytes::be16_set) and
/// [`bytes::be16_get`](crate::bytes::be16_get) on the raw regions.
pub trait ModbusDevice {
    /// Read `count` coils starting at `addr` into `dst`, one bit per
    /// coil, LSB of `dst[0]` first. `dst` holds exactly
    /// ceil(`count`/8) zeroed bytes; pad bits stay zero.
    fn read_coils(&mut self, addr: u16, count: u16, dst: &mut [u8]) -> Result<(), Exception> {
        let _ = (addr, count, dst);
        Err(Exception::IllegalFunction)
    }

    /// Read `count` discrete inputs starting at `addr` into `dst`, packed
    /// like [`ModbusDevice::read_coils`].
    fn read_discrete_inputs(
        &mut self,
        addr: u16,
        count: u16,
        dst: &mut [u8],
    ) -> Result<(), Exception> {
        let _ = (addr, count, dst);
        Err(Exception::IllegalFunction)
    }

    /// Read `count` holding registers starting at `addr` into `dst` as
    /// big-endian pairs. `dst` holds exactly 2·`count` bytes.
    fn read_holding_registers(
        &mut self,
        addr: u16,
        count: u16,
        dst: &mut [u8],
    ) -> Result<(), Exception> {
        let _ = (addr, count, dst);
        Err(Exception::IllegalFunction)
    }

    /// Read `count` input registers starting at `addr` into `dst` as
    /// big-endian pairs.
    fn read_input_registers(
        &mut self,
        addr: u16,
        count: u16,
        dst: &mut [u8],
    ) -> Result<(), Exception> {
        let _ = (addr, count, dst);
        Err(Exception::IllegalFunction)
    }

    /// Force the coil at `addr` on or off.
    fn write_single_coil(&mut self, addr: u16, on: bool) -> Result<(), Exception> {
        let _ = (addr, on);
        Err(Exception::IllegalFunction)
    }

    /// Write one holding register.
    fn write_single_register(&mut self, addr: u16, value: u16) -> Result<(), Exception> {
        let _ = (addr, value);
        Err(Exception::IllegalFunction)
    }

    /// Force `count` coils starting at `addr` from the packed bits in
    /// `src` (LSB of `src[0]` first, ceil(`count`/8) bytes).
    fn write_multiple_coils(
        &mut self,
        addr: u16,
        count: u16,
        src: &[u8],
    ) -> Result<(), Exception> {
        let _ = (addr, count, src);
        Err(Exception::IllegalFunction)
    }

    /// Write `count` holding registers starting at `addr` from the
    /// big-endian pairs in `src` (2·`count` bytes).
    fn write_multiple_registers(
        &mut self,
        addr: u16,
        count: u16,
        src: &[u8],
    ) -> Result<(), Exception> {
        let _ = (addr, count, src);
        Err(Exception::IllegalFunction)
    }

    /// Modify the holding register at `addr` to
    /// `(current AND and_mask) OR (or_mask AND NOT and_mask)`.
    fn mask_write_register(
        &mut self,
        addr: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<(), Exception> {
        let _ = (addr, and_mask, or_mask);
        Err(Exception::IllegalFunction)
    }

    /// Combined register write and read. The write takes effect before
    /// the read is served: `read_dst` (2·`read_count` big-endian bytes)
    /// must reflect `write_data` (2·`write_count` big-endian bytes)
    /// wherever the two windows overlap.
    #[allow(clippy::too_many_arguments)]
    fn read_write_multiple_registers(
        &mut self,
        read_addr: u16,
        read_count: u16,
        write_addr: u16,
        write_count: u16,
        write_data: &[u8],
        read_dst: &mut [u8],
    ) -> Result<(), Exception> {
        let _ = (read_addr, read_count, write_addr, write_count, write_data, read_dst);
        Err(Exception::IllegalFunction)
    }
}

/// Route a validated request body (ADU minus CRC) to its codec.
///
/// Unknown function codes are rejected here, before any device method is
/// looked at.
pub(crate) fn dispatch<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    let function = FunctionCode::from_u8(body[1]).ok_or(Exception::IllegalFunction)?;
    match function {
        FunctionCode::ReadCoils => read_coils(body, device, pdu),
        FunctionCode::ReadDiscreteInputs => read_discrete_inputs(body, device, pdu),
        FunctionCode::ReadHoldingRegisters => read_holding_registers(body, device, pdu),
        FunctionCode::ReadInputRegisters => read_input_registers(body, device, pdu),
        FunctionCode::WriteSingleCoil => write_single_coil(body, device, pdu),
        FunctionCode::WriteSingleRegister => write_single_register(body, device, pdu),
        FunctionCode::WriteMultipleCoils => write_multiple_coils(body, device, pdu),
        FunctionCode::WriteMultipleRegisters => write_multiple_registers(body, device, pdu),
        FunctionCode::MaskWriteRegister => mask_write_register(body, device, pdu),
        FunctionCode::ReadWriteMultipleRegisters => {
            read_write_multiple_registers(body, device, pdu)
        }
    }
}

fn stage(pdu: &mut ResponsePdu, byte: u8) -> Result<(), Exception> {
    pdu.push(byte).map_err(|_| Exception::SlaveDeviceFailure)
}

fn stage_slice(pdu: &mut ResponsePdu, bytes: &[u8]) -> Result<(), Exception> {
    pdu.extend_from_slice(bytes)
        .map_err(|_| Exception::SlaveDeviceFailure)
}

/// Grow the PDU by `len` zeroed bytes and return the new region.
fn stage_region(pdu: &mut ResponsePdu, len: usize) -> Result<&mut [u8], Exception> {
    let start = pdu.len();
    pdu.resize_default(start + len)
        .map_err(|_| Exception::SlaveDeviceFailure)?;
    Ok(&mut pdu[start..])
}

/// 0x01 Read Coils.
fn read_coils<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    if body.len() < 6 {
        return Err(Exception::IllegalDataValue);
    }
    let addr = be16_get(&body[2..]);
    let count = be16_get(&body[4..]);
    if count == 0 || count > MAX_READ_BITS {
        return Err(Exception::IllegalDataValue);
    }
    let byte_count = ((count + 7) / 8) as usize;
    stage(pdu, FunctionCode::ReadCoils as u8)?;
    stage(pdu, byte_count as u8)?;
    let dst = stage_region(pdu, byte_count)?;
    device.read_coils(addr, count, dst)
}

/// 0x02 Read Discrete Inputs.
fn read_discrete_inputs<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    if body.len() < 6 {
        return Err(Exception::IllegalDataValue);
    }
    let addr = be16_get(&body[2..]);
    let count = be16_get(&body[4..]);
    if count == 0 || count > MAX_READ_BITS {
        return Err(Exception::IllegalDataValue);
    }
    let byte_count = ((count + 7) / 8) as usize;
    stage(pdu, FunctionCode::ReadDiscreteInputs as u8)?;
    stage(pdu, byte_count as u8)?;
    let dst = stage_region(pdu, byte_count)?;
    device.read_discrete_inputs(addr, count, dst)
}

/// 0x03 Read Holding Registers.
fn read_holding_registers<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    if body.len() < 6 {
        return Err(Exception::IllegalDataValue);
    }
    let addr = be16_get(&body[2..]);
    let count = be16_get(&body[4..]);
    if count == 0 || count > MAX_READ_REGISTERS {
        return Err(Exception::IllegalDataValue);
    }
    let byte_count = (count * 2) as usize;
    stage(pdu, FunctionCode::ReadHoldingRegisters as u8)?;
    stage(pdu, byte_count as u8)?;
    let dst = stage_region(pdu, byte_count)?;
    device.read_holding_registers(addr, count, dst)
}

/// 0x04 Read Input Registers.
fn read_input_registers<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    if body.len() < 6 {
        return Err(Exception::IllegalDataValue);
    }
    let addr = be16_get(&body[2..]);
    let count = be16_get(&body[4..]);
    if count == 0 || count > MAX_READ_REGISTERS {
        return Err(Exception::IllegalDataValue);
    }
    let byte_count = (count * 2) as usize;
    stage(pdu, FunctionCode::ReadInputRegisters as u8)?;
    stage(pdu, byte_count as u8)?;
    let dst = stage_region(pdu, byte_count)?;
    device.read_input_registers(addr, count, dst)
}

/// 0x05 Write Single Coil. Echoes the request PDU.
fn write_single_coil<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    if body.len() < 6 {
        return Err(Exception::IllegalDataValue);
    }
    let addr = be16_get(&body[2..]);
    let on = match be16_get(&body[4..]) {
        COIL_ON => true,
        COIL_OFF => false,
        _ => return Err(Exception::IllegalDataValue),
    };
    device.write_single_coil(addr, on)?;
    stage(pdu, FunctionCode::WriteSingleCoil as u8)?;
    stage_slice(pdu, &body[2..6])
}

/// 0x06 Write Single Register. Echoes the request PDU.
fn write_single_register<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    if body.len() < 6 {
        return Err(Exception::IllegalDataValue);
    }
    let addr = be16_get(&body[2..]);
    let value = be16_get(&body[4..]);
    device.write_single_register(addr, value)?;
    stage(pdu, FunctionCode::WriteSingleRegister as u8)?;
    stage_slice(pdu, &body[2..6])
}

/// 0x0F Write Multiple Coils. Echoes start address and quantity.
fn write_multiple_coils<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    if body.len() < 7 {
        return Err(Exception::IllegalDataValue);
    }
    let addr = be16_get(&body[2..]);
    let count = be16_get(&body[4..]);
    let byte_count = body[6] as usize;
    if count == 0 || count > MAX_WRITE_BITS {
        return Err(Exception::IllegalDataValue);
    }
    if byte_count != ((count + 7) / 8) as usize {
        return Err(Exception::IllegalDataValue);
    }
    if body.len() < 7 + byte_count {
        return Err(Exception::IllegalDataValue);
    }
    device.write_multiple_coils(addr, count, &body[7..7 + byte_count])?;
    stage(pdu, FunctionCode::WriteMultipleCoils as u8)?;
    stage_slice(pdu, &body[2..6])
}

/// 0x10 Write Multiple Registers. Echoes start address and quantity.
fn write_multiple_registers<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    if body.len() < 7 {
        return Err(Exception::IllegalDataValue);
    }
    let addr = be16_get(&body[2..]);
    let count = be16_get(&body[4..]);
    let byte_count = body[6] as usize;
    if count == 0 || count > MAX_WRITE_REGISTERS {
        return Err(Exception::IllegalDataValue);
    }
    if byte_count != (count * 2) as usize {
        return Err(Exception::IllegalDataValue);
    }
    if body.len() < 7 + byte_count {
        return Err(Exception::IllegalDataValue);
    }
    device.write_multiple_registers(addr, count, &body[7..7 + byte_count])?;
    stage(pdu, FunctionCode::WriteMultipleRegisters as u8)?;
    stage_slice(pdu, &body[2..6])
}

/// 0x16 Mask Write Register. Echoes the request PDU.
fn mask_write_register<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    if body.len() < 8 {
        return Err(Exception::IllegalDataValue);
    }
    let addr = be16_get(&body[2..]);
    let and_mask = be16_get(&body[4..]);
    let or_mask = be16_get(&body[6..]);
    device.mask_write_register(addr, and_mask, or_mask)?;
    stage(pdu, FunctionCode::MaskWriteRegister as u8)?;
    stage_slice(pdu, &body[2..8])
}

/// 0x17 Read/Write Multiple Registers. The device applies the write
/// before serving the read.
fn read_write_multiple_registers<D: ModbusDevice>(
    body: &[u8],
    device: &mut D,
    pdu: &mut ResponsePdu,
) -> Result<(), Exception> {
    if body.len() < 11 {
        return Err(Exception::IllegalDataValue);
    }
    let read_addr = be16_get(&body[2..]);
    let read_count = be16_get(&body[4..]);
    let write_addr = be16_get(&body[6..]);
    let write_count = be16_get(&body[8..]);
    let write_bytes = body[10] as usize;
    if read_count == 0 || read_count > MAX_READ_REGISTERS {
        return Err(Exception::IllegalDataValue);
    }
    if write_count == 0 || write_count > MAX_RW_WRITE_REGISTERS {
        return Err(Exception::IllegalDataValue);
    }
    if write_bytes != (write_count * 2) as usize {
        return Err(Exception::IllegalDataValue);
    }
    if body.len() < 11 + write_bytes {
        return Err(Exception::IllegalDataValue);
    }
    let read_bytes = (read_count * 2) as usize;
    stage(pdu, FunctionCode::ReadWriteMultipleRegisters as u8)?;
    stage(pdu, read_bytes as u8)?;
    let read_dst = stage_region(pdu, read_bytes)?;
    device.read_write_multiple_registers(
        read_addr,
        read_count,
        write_addr,
        write_count,
        &body[11..11 + write_bytes],
        read_dst,
    )
}
