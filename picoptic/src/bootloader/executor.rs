//! Command execution against flash, ADC and speaker.

use crate::bootloader::hal::{AnalogChannel, Hardware, REFERENCE_SETTLE_TICKS, SpeakerDrive};
use crate::bootloader::soft_uart::SoftUart;
use crate::protocol::optic::{
    ACK, MAX_FRAME_LEN, NAK, Opcode, PAGE_BYTES, PAGE_COUNT, PAGE_WORDS, checksum, page_address,
};
use log::debug;

/// One received command frame: opcode followed by its payload.
///
/// Sized for the largest frame (opcode, page index, 64 data bytes and the
/// checksum).
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    bytes: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self {
            bytes: [0; MAX_FRAME_LEN],
            len: 0,
        }
    }
}

impl CommandBuffer {
    /// Start a new frame with `opcode`, discarding any previous one.
    pub fn start(&mut self, opcode: u8) {
        self.bytes[0] = opcode;
        self.len = 1;
    }

    /// Append a payload byte. Bytes beyond the buffer are dropped.
    pub fn push(&mut self, byte: u8) {
        if self.len < MAX_FRAME_LEN {
            self.bytes[self.len] = byte;
            self.len += 1;
        }
    }

    /// Discard the frame.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Raw opcode byte, if a frame is started.
    pub fn opcode_byte(&self) -> Option<u8> {
        (self.len > 0).then_some(self.bytes[0])
    }

    /// Payload bytes received so far.
    pub fn payload(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            &self.bytes[1..self.len]
        }
    }
}

/// Result of executing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Command recognised and carried out.
    Completed,
    /// Write rejected because of a checksum mismatch.
    ChecksumRejected,
    /// Opcode not recognised.
    Unknown,
    /// Control has passed to the application.
    Launched,
}

/// Execute a complete frame and send its response.
pub fn execute<H: Hardware>(hw: &mut H, uart: &SoftUart, frame: &CommandBuffer) -> Outcome {
    let Some(byte) = frame.opcode_byte() else {
        return Outcome::Unknown;
    };
    let payload = frame.payload();

    match Opcode::from_byte(byte) {
        Some(op) if payload.len() != op.payload_len() => {
            debug!("'{op}' frame has {} payload bytes", payload.len());
            uart.transmit(hw, NAK);
            Outcome::Unknown
        },
        Some(Opcode::Write) => write_page(hw, uart, payload),
        Some(Opcode::Read) => {
            read_page(hw, uart, payload[0]);
            Outcome::Completed
        },
        Some(Opcode::Battery) => {
            battery(hw, uart);
            Outcome::Completed
        },
        Some(Opcode::Execute) => {
            uart.transmit(hw, ACK);
            hw.launch_firmware();
            Outcome::Launched
        },
        Some(Opcode::Speaker) => {
            speaker(hw, uart, payload[0], payload[1]);
            Outcome::Completed
        },
        None => {
            debug!("unknown opcode 0x{byte:02X}");
            uart.transmit(hw, NAK);
            Outcome::Unknown
        },
    }
}

fn page_base(page: u8) -> u16 {
    page_address(page % PAGE_COUNT as u8)
}

fn write_page<H: Hardware>(hw: &mut H, uart: &SoftUart, payload: &[u8]) -> Outcome {
    let (body, trailer) = payload.split_at(1 + PAGE_BYTES);
    let computed = checksum(body);
    if computed != trailer[0] {
        debug!(
            "write checksum mismatch: computed 0x{computed:02X}, received 0x{:02X}",
            trailer[0]
        );
        uart.transmit(hw, NAK);
        uart.transmit(hw, computed);
        return Outcome::ChecksumRejected;
    }

    let base = page_base(body[0]);
    hw.erase_page(base);
    for (offset, pair) in body[1..]
        .chunks_exact(2)
        .enumerate()
    {
        hw.write_word(base + offset as u16, u16::from_be_bytes([pair[0], pair[1]]));
    }
    uart.transmit(hw, ACK);
    Outcome::Completed
}

fn read_page<H: Hardware>(hw: &mut H, uart: &SoftUart, page: u8) {
    uart.transmit(hw, ACK);
    let base = page_base(page);
    let mut sum = page;
    for offset in 0..PAGE_WORDS as u16 {
        let [hi, lo] = hw
            .read_word(base + offset)
            .to_be_bytes();
        uart.transmit(hw, hi);
        uart.transmit(hw, lo);
        sum = sum
            .wrapping_add(hi)
            .wrapping_add(lo);
    }
    uart.transmit(hw, sum);
}

fn battery<H: Hardware>(hw: &mut H, uart: &SoftUart) {
    uart.transmit(hw, ACK);
    hw.set_reference(true);
    hw.delay(REFERENCE_SETTLE_TICKS);
    let [hi, lo] = hw
        .sample_analog(AnalogChannel::Reference)
        .to_be_bytes();
    uart.transmit(hw, hi);
    uart.transmit(hw, lo);
    hw.set_reference(false);
}

fn speaker<H: Hardware>(hw: &mut H, uart: &SoftUart, period: u8, repeat_high: u8) {
    uart.transmit(hw, ACK);
    let half_cycles = u32::from(repeat_high) << 8;
    for _ in 0..half_cycles {
        hw.delay(u16::from(period));
        hw.set_speaker(SpeakerDrive::Forward);
        hw.delay(u16::from(period));
        hw.set_speaker(SpeakerDrive::Reverse);
    }
    hw.set_speaker(SpeakerDrive::Off);
    uart.transmit(hw, ACK);
}
