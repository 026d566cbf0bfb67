//! Modbus RTU slave protocol engine.
//!
//! Receives request ADUs byte-by-byte from an interrupt-driven UART,
//! delimits frames with the 1.5/3.5 character-time silent intervals,
//! validates RTU framing (length, own/broadcast address, trailing CRC-16)
//! and dispatches the embedded PDU to a user [`ModbusDevice`]
//! implementation. Responses are framed by the engine and handed to a
//! transmit callback; broadcast requests are executed but never answered.
//!
//! ## Supported function codes
//!
//! - 0x01 Read Coils, 0x02 Read Discrete Inputs
//! - 0x03 Read Holding Registers, 0x04 Read Input Registers
//! - 0x05 Write Single Coil, 0x06 Write Single Register
//! - 0x0F Write Multiple Coils, 0x10 Write Multiple Registers
//! - 0x16 Mask Write Register, 0x17 Read/Write Multiple Registers
//!
//! Anything else is answered with the IllegalFunction exception.
//!
//! ## Wiring
//!
//! One [`Slave`] per serial line, usually `'static`. Three execution
//! contexts drive it:
//!
//! - [`Slave::rx_byte`] from the UART receive interrupt, once per byte;
//! - [`Slave::t1_5_elapsed`] and [`Slave::t3_5_elapsed`] from a timer
//!   interrupt restarted on every received byte;
//! - [`Slave::poll`] from the main loop, with the device data model and
//!   the transmit primitive.
//!
//! Sharing the instance between those contexts goes through the host's
//! usual exclusion primitive (an RTIC resource lock or a critical
//! section). The engine itself never blocks and allocates nothing.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

pub mod bytes;
pub mod crc;

mod handlers;
mod slave;

pub use handlers::ModbusDevice;
pub use slave::{ConfigError, Exception, FunctionCode, Slave};

/// Largest ADU on the wire: address, PDU and trailing CRC.
pub const MAX_FRAME_LEN: usize = 256;

/// Largest PDU: function code plus payload.
pub const MAX_PDU_LEN: usize = 253;

/// Smallest deliverable frame: address, function code and CRC.
pub const MIN_FRAME_LEN: usize = 4;

/// Requests sent here are executed by every slave and answered by none.
pub const BROADCAST_ADDRESS: u8 = 0;

/// Highest assignable unicast address.
pub const MAX_SLAVE_ADDRESS: u8 = 247;
