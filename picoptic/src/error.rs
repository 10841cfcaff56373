//! Error types for picoptic.

use std::io;
use thiserror::Error;

/// Result type for picoptic operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for picoptic operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed firmware image.
    #[error("line {line}: {kind}")]
    Hex {
        /// 1-based line number in the image file.
        line: usize,
        /// What was wrong with the record.
        kind: HexError,
    },

    /// Image data outside the target's program memory.
    #[error("line {line}: address 0x{address:08X} out of range")]
    OutOfRange {
        /// 1-based line number in the image file.
        line: usize,
        /// Byte address of the offending data.
        address: u32,
    },

    /// Image data inside the bootloader's protected pages.
    #[error("attempted to write protected page {page} (word address 0x{:04X})", u16::from(*page) * 32)]
    ProtectedPage {
        /// Page index.
        page: u8,
    },

    /// Supply voltage below the configured minimum.
    #[error("battery voltage {volts:.3} V is below the minimum of {minimum:.3} V")]
    LowBattery {
        /// Measured supply voltage.
        volts: f32,
        /// Configured minimum.
        minimum: f32,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device protocol mismatch.
    #[error("Device protocol mismatch - {0}")]
    Protocol(String),

    /// Device refused to execute a command.
    #[error("Device was unable to execute command '{opcode}'{}", checksum.map(|c| format!(" (device checksum 0x{c:02X})")).unwrap_or_default())]
    Nak {
        /// Opcode character of the refused command.
        opcode: char,
        /// Checksum the device computed, when it reports one.
        checksum: Option<u8>,
    },

    /// Read-back data differs from what was written.
    #[error("verify failed for page {page}")]
    VerifyMismatch {
        /// Page index.
        page: u8,
    },

    /// A page could not be programmed within the attempt budget.
    #[error("download failed: page {page} not verified after {attempts} attempts")]
    DownloadFailed {
        /// Page index.
        page: u8,
        /// Number of write/verify attempts made.
        attempts: u32,
    },

    /// Operation interrupted by the embedding application.
    #[error("Interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the page write/verify loop may try again after this error.
    ///
    /// Only link corruption (a rejected checksum or a bad read-back) is
    /// retried; channel loss and protocol disagreement abort the session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Nak { .. } | Self::VerifyMismatch { .. })
    }
}

/// Reasons a single Intel-HEX record is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HexError {
    /// Line does not begin with ':'.
    #[error("record does not start with ':'")]
    MissingStartCode,

    /// Odd number of hex digits.
    #[error("record is of incorrect length")]
    OddLength,

    /// Non hex digit characters.
    #[error("record contains bad characters")]
    BadCharacter,

    /// Fewer than the five fixed bytes.
    #[error("record length below minimum")]
    TooShort,

    /// Byte count field disagrees with the record length.
    #[error("record length/byte count field mismatch")]
    LengthMismatch,

    /// Trailing checksum is wrong.
    #[error("checksum mismatch (expected 0x{expected:02X}, found 0x{found:02X})")]
    ChecksumMismatch {
        /// Checksum computed over the record.
        expected: u8,
        /// Checksum stored in the record.
        found: u8,
    },

    /// End-of-file record with data.
    #[error("bad byte count for \"end of file\" record")]
    EofByteCount,

    /// Extended linear address record at a non-zero address.
    #[error("bad address for \"extended linear address\" record")]
    ExtendedAddressField,

    /// Extended linear address record without exactly two data bytes.
    #[error("incorrect byte count for \"extended linear address\" record")]
    ExtendedAddressByteCount,

    /// Record type outside data/EOF/extended linear address.
    #[error("record type 0x{0:02X} is not supported")]
    UnsupportedType(u8),
}
