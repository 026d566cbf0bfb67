//! Slave instance: timing-driven receiver, frame validation and dispatch.
//!
//! ## Receiver state machine
//!
//! Frames on the bus are delimited by silence. After each received byte
//! the host restarts a timer that fires at 1.5 and 3.5 character times;
//! between those marks the line must stay quiet or the frame is suspect.
//!
//! - `Idle` -> `Reception` on the first byte of a frame.
//! - `Reception` -> `ControlAndWaiting` on the 1.5t mark (or on buffer
//!   overflow, which also poisons the frame).
//! - `ControlAndWaiting` -> `Idle` on the 3.5t mark, latching the frame
//!   for the main context when it survived the window intact.
//!
//! Timer events outside their state are ignored, which absorbs spurious
//! ticks while the line is idle.
//!
//! ## Hand-off
//!
//! The 3.5t event is the only producer of the frame-available flag.
//! [`Slave::poll`] takes ownership of the buffer by raising
//! processing-frame, during which the receive path drops incoming bytes,
//! and releases both flags when the frame is answered or discarded.

use heapless::Vec;

use crate::bytes::le16_get;
use crate::crc::crc16;
use crate::handlers::{self, ModbusDevice};
use crate::{BROADCAST_ADDRESS, MAX_FRAME_LEN, MAX_PDU_LEN, MAX_SLAVE_ADDRESS, MIN_FRAME_LEN};

/// Exception response marker, or'ed into the echoed function code.
const EXCEPTION_MASK: u8 = 0x80;

/// Function codes understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    MaskWriteRegister = 0x16,
    ReadWriteMultipleRegisters = 0x17,
}

impl FunctionCode {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x16 => Some(Self::MaskWriteRegister),
            0x17 => Some(Self::ReadWriteMultipleRegisters),
            _ => None,
        }
    }
}

/// Exception codes reported back to the master.
///
/// Data-access handlers return these through their `Result`; the engine
/// adds [`Exception::IllegalFunction`] for unknown or unimplemented codes
/// and [`Exception::IllegalDataValue`] for out-of-range request
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum Exception {
    /// Function not supported by this device.
    IllegalFunction = 0x01,
    /// Register or coil address outside the device data model.
    IllegalDataAddress = 0x02,
    /// Request parameter or value not acceptable.
    IllegalDataValue = 0x03,
    /// Unrecoverable failure while serving the request.
    SlaveDeviceFailure = 0x04,
}

/// Rejected slave configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum ConfigError {
    /// Own address outside 1..=247. Address 0 is reserved for broadcast.
    InvalidAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Reception,
    ControlAndWaiting,
}

/// A Modbus RTU slave instance.
///
/// See the [crate docs](crate) for the wiring contract.
pub struct Slave {
    address: u8,
    state: State,
    frame: [u8; MAX_FRAME_LEN],
    frame_len: u16,
    frame_ok: bool,
    frame_available: bool,
    processing_frame: bool,
}

impl Slave {
    /// Create a slave answering on `address`.
    pub fn new(address: u8) -> Result<Self, ConfigError> {
        if address == BROADCAST_ADDRESS || address > MAX_SLAVE_ADDRESS {
            return Err(ConfigError::InvalidAddress);
        }
        Ok(Self {
            address,
            state: State::Idle,
            frame: [0; MAX_FRAME_LEN],
            frame_len: 0,
            frame_ok: true,
            frame_available: false,
            processing_frame: false,
        })
    }

    /// The unicast address this slave answers to.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Change the unicast address, e.g. after the master rewrote it
    /// through a holding register.
    pub fn set_address(&mut self, address: u8) -> Result<(), ConfigError> {
        if address == BROADCAST_ADDRESS || address > MAX_SLAVE_ADDRESS {
            return Err(ConfigError::InvalidAddress);
        }
        self.address = address;
        Ok(())
    }

    /// True once a frame is latched and waiting for [`Slave::poll`].
    pub fn frame_pending(&self) -> bool {
        self.frame_available
    }

    /// Feed one received byte; call from the UART receive interrupt.
    ///
    /// Dropped while the main context owns the latched frame.
    pub fn rx_byte(&mut self, byte: u8) {
        if self.processing_frame {
            return;
        }
        match self.state {
            State::Idle => {
                self.frame_ok = true;
                self.frame[0] = byte;
                self.frame_len = 1;
                self.state = State::Reception;
            }
            State::Reception => {
                if (self.frame_len as usize) < MAX_FRAME_LEN {
                    self.frame[self.frame_len as usize] = byte;
                    self.frame_len += 1;
                } else {
                    // Overflow: poison the frame, stop appending for the
                    // rest of the window.
                    self.frame_ok = false;
                    self.state = State::ControlAndWaiting;
                }
            }
            // Gap violation inside the 3.5t window; the latched bytes
            // stand and the byte is discarded.
            State::ControlAndWaiting => {}
        }
    }

    /// 1.5 character times of silence after the last byte; call from the
    /// timer interrupt.
    pub fn t1_5_elapsed(&mut self) {
        if self.state == State::Reception {
            self.state = State::ControlAndWaiting;
        }
    }

    /// 3.5 character times of silence: the frame boundary. Hands an
    /// intact frame to the main context; an overflowed one is dropped.
    /// Call from the timer interrupt.
    pub fn t3_5_elapsed(&mut self) {
        if self.state == State::ControlAndWaiting {
            if self.frame_ok {
                self.frame_available = true;
            }
            self.state = State::Idle;
        }
    }

    /// Serve the latched frame, if any; call from the main loop.
    ///
    /// Validates framing, runs the request against `device` and hands the
    /// response ADU to `write`. Invalid frames and broadcasts produce no
    /// response. `write` may block on the UART; nothing else here does.
    pub fn poll<D, W>(&mut self, device: &mut D, write: W)
    where
        D: ModbusDevice,
        W: FnMut(&[u8]),
    {
        if !self.frame_available {
            return;
        }
        self.processing_frame = true;
        self.respond(device, write);
        self.frame_available = false;
        self.processing_frame = false;
        self.frame_len = 0;
    }

    fn respond<D, W>(&self, device: &mut D, mut write: W)
    where
        D: ModbusDevice,
        W: FnMut(&[u8]),
    {
        let frame = &self.frame[..self.frame_len as usize];
        if frame.len() < MIN_FRAME_LEN {
            return;
        }
        if frame[0] != self.address && frame[0] != BROADCAST_ADDRESS {
            // Another slave's traffic.
            return;
        }
        let body = &frame[..frame.len() - 2];
        if le16_get(&frame[frame.len() - 2..]) != crc16(body) {
            #[cfg(not(test))]
            defmt::trace!("frame dropped: crc mismatch");
            return;
        }

        // The request runs even for broadcasts; only the answer is
        // suppressed.
        let mut pdu = Vec::<u8, MAX_PDU_LEN>::new();
        let result = handlers::dispatch(body, device, &mut pdu);
        if frame[0] == BROADCAST_ADDRESS {
            return;
        }
        if let Some(adu) = frame_response(self.address, body[1], result, &pdu) {
            write(&adu);
        }
    }
}

/// Assemble the response ADU: address, normal or exception PDU, CRC.
///
/// An exception discards whatever the handler staged and is encoded as
/// the request's function code with [`EXCEPTION_MASK`] set, followed by
/// the exception code.
fn frame_response(
    address: u8,
    function: u8,
    result: Result<(), Exception>,
    pdu: &[u8],
) -> Option<Vec<u8, MAX_FRAME_LEN>> {
    let mut adu = Vec::new();
    adu.push(address).ok()?;
    match result {
        Ok(()) => adu.extend_from_slice(pdu).ok()?,
        Err(exception) => {
            adu.push(function | EXCEPTION_MASK).ok()?;
            adu.push(exception as u8).ok()?;
        }
    }
    let crc = crc16(&adu);
    adu.extend_from_slice(&crc.to_le_bytes()).ok()?;
    Some(adu)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoDevice;

    impl ModbusDevice for NoDevice {}

    #[test]
    fn test_init_success() {
        let slave = Slave::new(0x01).unwrap();
        assert_eq!(slave.address(), 0x01);
        assert_eq!(slave.state, State::Idle);
        assert_eq!(slave.frame_len, 0);
        assert!(slave.frame_ok);
        assert!(!slave.frame_available);
        assert!(!slave.processing_frame);
    }

    #[test]
    fn test_init_rejects_broadcast_address() {
        assert!(matches!(Slave::new(0), Err(ConfigError::InvalidAddress)));
    }

    #[test]
    fn test_init_rejects_reserved_addresses() {
        assert!(matches!(Slave::new(248), Err(ConfigError::InvalidAddress)));
        assert!(matches!(Slave::new(255), Err(ConfigError::InvalidAddress)));
        assert!(Slave::new(247).is_ok());
        assert!(Slave::new(1).is_ok());
    }

    #[test]
    fn test_set_address() {
        let mut slave = Slave::new(0x01).unwrap();
        slave.set_address(0x05).unwrap();
        assert_eq!(slave.address(), 0x05);
        assert_eq!(slave.set_address(0), Err(ConfigError::InvalidAddress));
        assert_eq!(slave.address(), 0x05);
    }

    #[test]
    fn test_rx_first_byte_transition() {
        let mut slave = Slave::new(0x01).unwrap();
        slave.rx_byte(0x01);
        assert_eq!(slave.state, State::Reception);
        assert_eq!(slave.frame_len, 1);
        assert_eq!(slave.frame[0], 0x01);
        assert!(slave.frame_ok);
    }

    #[test]
    fn test_rx_multiple_bytes() {
        let mut slave = Slave::new(0x01).unwrap();
        for byte in [0x01, 0x03, 0x00, 0x00] {
            slave.rx_byte(byte);
        }
        assert_eq!(slave.state, State::Reception);
        assert_eq!(slave.frame_len, 4);
        assert_eq!(&slave.frame[..4], &[0x01, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_rx_frame_overflow() {
        let mut slave = Slave::new(0x01).unwrap();
        for i in 0..MAX_FRAME_LEN {
            slave.rx_byte(i as u8);
        }
        assert_eq!(slave.frame_len as usize, MAX_FRAME_LEN);
        assert!(slave.frame_ok);

        // One more byte tips it over.
        slave.rx_byte(0xFF);
        assert!(!slave.frame_ok);
        assert_eq!(slave.state, State::ControlAndWaiting);
        assert_eq!(slave.frame_len as usize, MAX_FRAME_LEN);
    }

    #[test]
    fn test_rx_ignored_during_processing() {
        let mut slave = Slave::new(0x01).unwrap();
        slave.processing_frame = true;
        slave.rx_byte(0x01);
        assert_eq!(slave.state, State::Idle);
        assert_eq!(slave.frame_len, 0);
    }

    #[test]
    fn test_1_5t_transition() {
        let mut slave = Slave::new(0x01).unwrap();
        slave.rx_byte(0x01);
        slave.t1_5_elapsed();
        assert_eq!(slave.state, State::ControlAndWaiting);
    }

    #[test]
    fn test_1_5t_ignores_other_states() {
        let mut slave = Slave::new(0x01).unwrap();
        slave.t1_5_elapsed();
        assert_eq!(slave.state, State::Idle);

        slave.state = State::ControlAndWaiting;
        slave.t1_5_elapsed();
        assert_eq!(slave.state, State::ControlAndWaiting);
    }

    #[test]
    fn test_3_5t_latches_valid_frame() {
        let mut slave = Slave::new(0x01).unwrap();
        slave.state = State::ControlAndWaiting;
        slave.frame_ok = true;
        slave.t3_5_elapsed();
        assert_eq!(slave.state, State::Idle);
        assert!(slave.frame_available);
    }

    #[test]
    fn test_3_5t_drops_poisoned_frame() {
        let mut slave = Slave::new(0x01).unwrap();
        slave.state = State::ControlAndWaiting;
        slave.frame_ok = false;
        slave.t3_5_elapsed();
        assert_eq!(slave.state, State::Idle);
        assert!(!slave.frame_available);
    }

    #[test]
    fn test_3_5t_ignores_other_states() {
        let mut slave = Slave::new(0x01).unwrap();
        slave.t3_5_elapsed();
        assert_eq!(slave.state, State::Idle);
        assert!(!slave.frame_available);

        slave.state = State::Reception;
        slave.t3_5_elapsed();
        assert_eq!(slave.state, State::Reception);
        assert!(!slave.frame_available);
    }

    #[test]
    fn test_poll_without_pending_frame_is_noop() {
        let mut slave = Slave::new(0x01).unwrap();
        let mut called = false;
        slave.poll(&mut NoDevice, |_| called = true);
        assert!(!called);
        assert_eq!(slave.state, State::Idle);
    }

    #[test]
    fn test_poll_releases_buffer() {
        let mut slave = Slave::new(0x01).unwrap();
        // Short garbage frame, valid hand-off.
        for byte in [0x01, 0x03, 0x00] {
            slave.rx_byte(byte);
        }
        slave.t1_5_elapsed();
        slave.t3_5_elapsed();
        assert!(slave.frame_pending());

        slave.poll(&mut NoDevice, |_| {});
        assert!(!slave.frame_pending());
        assert!(!slave.processing_frame);
        assert_eq!(slave.frame_len, 0);
    }

    #[test]
    fn test_frame_response_crc_trailer() {
        let adu = frame_response(0x01, 0x03, Ok(()), &[0x03, 0x02, 0x01, 0xF4]).unwrap();
        assert_eq!(&adu[..5], &[0x01, 0x03, 0x02, 0x01, 0xF4]);
        let crc = crc16(&adu[..5]);
        assert_eq!(le16_get(&adu[5..]), crc);
    }

    #[test]
    fn test_frame_response_exception_layout() {
        let adu = frame_response(0x01, 0x42, Err(Exception::IllegalFunction), &[]).unwrap();
        assert_eq!(&adu[..3], &[0x01, 0xC2, 0x01]);
        assert_eq!(adu.len(), 5);
        assert_eq!(le16_get(&adu[3..]), crc16(&adu[..3]));
    }
}
