//! Optical link protocol: byte framing and the command set.

pub mod optic;
pub mod uart;

pub use optic::{ACK, NAK, Opcode, checksum, page_address};
pub use uart::{BitTiming, UartDecoder};
