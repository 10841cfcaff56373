//! Optical bootloader command protocol.
//!
//! ## Exchange Format
//!
//! Every command is a one-byte ASCII opcode followed by a fixed-size payload.
//! The device answers the opcode with the total frame length it expects
//! (opcode included), the host sends exactly that many payload bytes, and the
//! device answers with ACK/NAK followed by the opcode's result bytes.
//!
//! ```text
//! host   -> | opcode |
//! device <- | frame length |
//! host   -> | payload (frame length - 1 bytes) |
//! device <- | ACK/NAK | result... |
//! ```
//!
//! ## Write Payload
//!
//! ```text
//! +------+-----+-----+-----+-----+-----+-----+-------+
//! | page | hi0 | lo0 | hi1 | lo1 | ... | lo31| csum  |
//! +------+-----+-----+-----+-----+-----+-----+-------+
//! |  1   |            64 bytes, big-endian    |   1   |
//! +------+-----+-----+-----+-----+-----+-----+-------+
//! ```
//!
//! The checksum is the 8-bit wrapping sum of the page index and the 64 data
//! bytes. Read responses carry the same layout minus the page index.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Positive acknowledge.
pub const ACK: u8 = 0x06;

/// Negative acknowledge.
pub const NAK: u8 = 0x15;

/// Words per flash page.
pub const PAGE_WORDS: usize = 32;

/// Bytes per flash page on the wire.
pub const PAGE_BYTES: usize = PAGE_WORDS * 2;

/// Number of flash pages.
pub const PAGE_COUNT: usize = 128;

/// Program memory size in words.
pub const FLASH_WORDS: usize = PAGE_WORDS * PAGE_COUNT;

/// Pages reserved for the bootloader itself.
pub const PROTECTED_PAGES: u8 = 16;

/// Word address of the application reset vector.
pub const APPLICATION_START: u16 = PROTECTED_PAGES as u16 * PAGE_WORDS as u16;

/// Value of an unprogrammed flash word.
pub const ERASED_WORD: u16 = 0x3FFF;

/// Size of a write payload (page index, data, checksum).
pub const WRITE_PAYLOAD_LEN: usize = 1 + PAGE_BYTES + 1;

/// Largest frame the device buffers (opcode plus write payload).
pub const MAX_FRAME_LEN: usize = 1 + WRITE_PAYLOAD_LEN;

/// Voltage of the internal fixed reference.
pub const REFERENCE_VOLTS: f32 = 1.024;

/// Full-scale value of a left-justified ADC result.
pub const ADC_FULL_SCALE: f32 = 65535.0;

/// Bootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Erase and write one page.
    Write = b'W',
    /// Read back one page.
    Read = b'R',
    /// Sample the supply voltage through the fixed reference.
    Battery = b'B',
    /// Launch the application.
    Execute = b'X',
    /// Play a tone on the speaker.
    Speaker = b'S',
}

impl Opcode {
    /// All opcodes the device understands.
    pub const ALL: [Self; 5] = [
        Self::Write,
        Self::Read,
        Self::Battery,
        Self::Execute,
        Self::Speaker,
    ];

    /// Wire byte of this opcode.
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Look up an opcode by its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.byte() == byte)
    }

    /// Number of payload bytes following the opcode.
    pub fn payload_len(self) -> usize {
        match self {
            Self::Write => WRITE_PAYLOAD_LEN,
            Self::Read => 1,
            Self::Battery | Self::Execute => 0,
            Self::Speaker => 2,
        }
    }

    /// Frame length the device announces after receiving the opcode.
    pub fn frame_len(self) -> u8 {
        (self.payload_len() + 1) as u8
    }

    /// Number of result bytes following the ACK.
    pub fn response_len(self) -> usize {
        match self {
            Self::Write | Self::Execute => 0,
            Self::Read => PAGE_BYTES + 1,
            Self::Battery => 2,
            Self::Speaker => 1,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", char::from(self.byte()))
    }
}

/// 8-bit wrapping sum used by write payloads and read responses.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Word address of the first word of `page`.
pub fn page_address(page: u8) -> u16 {
    u16::from(page) * PAGE_WORDS as u16
}

/// Whether `page` lies inside the bootloader.
pub fn is_protected(page: u8) -> bool {
    page < PROTECTED_PAGES
}

/// Serialize page words as big-endian bytes.
pub fn page_bytes(words: &[u16; PAGE_WORDS]) -> [u8; PAGE_BYTES] {
    let mut bytes = [0u8; PAGE_BYTES];
    BigEndian::write_u16_into(words, &mut bytes);
    bytes
}

/// Deserialize big-endian page bytes into words.
pub fn page_words(bytes: &[u8; PAGE_BYTES]) -> [u16; PAGE_WORDS] {
    let mut words = [0u16; PAGE_WORDS];
    BigEndian::read_u16_into(bytes, &mut words);
    words
}

/// Build the `W` payload for one page.
pub fn write_payload(page: u8, words: &[u16; PAGE_WORDS]) -> [u8; WRITE_PAYLOAD_LEN] {
    let mut payload = [0u8; WRITE_PAYLOAD_LEN];
    payload[0] = page;
    payload[1..=PAGE_BYTES].copy_from_slice(&page_bytes(words));
    payload[WRITE_PAYLOAD_LEN - 1] = checksum(&payload[..=PAGE_BYTES]);
    payload
}

/// Build the `R` payload for one page.
pub fn read_payload(page: u8) -> [u8; 1] {
    [page]
}

/// Build the `S` payload: half-period delay and repeat count high byte.
pub fn speaker_payload(period: u8, repeat_high: u8) -> [u8; 2] {
    [period, repeat_high]
}

/// Convert a raw reference sample to the supply voltage it implies.
///
/// The ADC measures the fixed reference against the supply, so a lower
/// supply gives a larger reading. A zero reading is reported as infinity.
pub fn battery_volts(raw: u16) -> f32 {
    REFERENCE_VOLTS / (f32::from(raw) / ADC_FULL_SCALE)
}

/// Raw reference sample a device would report at `volts` supply.
///
/// Inverse of [`battery_volts`], quantised to the converter's 10-bit
/// left-justified result.
pub fn battery_raw(volts: f32) -> u16 {
    let fraction = (REFERENCE_VOLTS / volts).clamp(0.0, 1.0);
    let counts = (fraction * 1023.0).round() as u16;
    counts << 6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_lengths() {
        assert_eq!(Opcode::Write.frame_len(), 67);
        assert_eq!(Opcode::Read.frame_len(), 2);
        assert_eq!(Opcode::Battery.frame_len(), 1);
        assert_eq!(Opcode::Execute.frame_len(), 1);
        assert_eq!(Opcode::Speaker.frame_len(), 3);
        assert_eq!(Opcode::Read.response_len(), 65);
        assert_eq!(Opcode::from_byte(b'R'), Some(Opcode::Read));
        assert_eq!(Opcode::from_byte(b'Q'), None);
        assert_eq!(Opcode::Speaker.to_string(), "S");
    }

    #[test]
    fn test_checksum_is_sum_mod_256() {
        let bytes: Vec<u8> = (0..=255u8).chain(0..=255u8).collect();
        let expected = bytes.iter().map(|&b| u32::from(b)).sum::<u32>() % 256;
        assert_eq!(u32::from(checksum(&bytes)), expected);
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
    }

    #[test]
    fn test_checksum_detects_single_byte_corruption() {
        let payload = write_payload(20, &[0x1234; PAGE_WORDS]);
        let original = checksum(&payload[..=PAGE_BYTES]);
        for index in 0..=PAGE_BYTES {
            for delta in [1u8, 0x55, 0x80, 0xFF] {
                let mut corrupted = payload;
                corrupted[index] = corrupted[index].wrapping_add(delta);
                assert_ne!(checksum(&corrupted[..=PAGE_BYTES]), original);
            }
        }
    }

    #[test]
    fn test_write_payload_layout() {
        let mut words = [ERASED_WORD; PAGE_WORDS];
        words[0] = 0x0102;
        words[31] = 0x3A4B;
        let payload = write_payload(17, &words);

        assert_eq!(payload.len(), 66);
        assert_eq!(payload[0], 17);
        assert_eq!(&payload[1..3], &[0x01, 0x02]);
        assert_eq!(&payload[3..5], &[0x3F, 0xFF]);
        assert_eq!(&payload[63..65], &[0x3A, 0x4B]);
        assert_eq!(payload[65], checksum(&payload[..65]));
        assert_eq!(page_words(&page_bytes(&words)), words);
    }

    #[test]
    fn test_battery_conversion() {
        assert!((battery_volts(0x8000) - 2.048).abs() < 0.001);
        let raw = battery_raw(3.0);
        assert!((battery_volts(raw) - 3.0).abs() < 0.01);
        assert!(battery_volts(battery_raw(1.8)) < 2.0);
        assert_eq!(page_address(16), APPLICATION_START);
        assert!(is_protected(5));
        assert!(!is_protected(16));
    }
}
