//! Intel-HEX records.
//!
//! Only the three record types a PIC toolchain emits for this part are
//! understood: data (00), end of file (01) and extended linear address (04).
//!
//! ```text
//! :LLAAAATT<data...>CC
//!  |  |   |          +- two's complement of the sum of all preceding bytes
//!  |  |   +------------ record type
//!  |  +---------------- 16-bit address, big-endian
//!  +------------------- byte count of <data>
//! ```

use crate::error::HexError;
use std::fmt;

/// Fixed bytes in every record: count, address (2), type, checksum.
const FIXED_BYTES: usize = 5;

/// Record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Data bytes at the record address.
    Data,
    /// Marks the end of the image.
    EndOfFile,
    /// Sets bits 16-31 of subsequent addresses.
    ExtendedLinearAddress,
    /// Any type this loader does not handle.
    Unsupported(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Data,
            0x01 => Self::EndOfFile,
            0x04 => Self::ExtendedLinearAddress,
            other => Self::Unsupported(other),
        }
    }
}

impl RecordType {
    /// Type byte as written in a record.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::EndOfFile => 0x01,
            Self::ExtendedLinearAddress => 0x04,
            Self::Unsupported(other) => other,
        }
    }
}

/// One decoded and checksum-verified record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Record type.
    pub record_type: RecordType,
    /// 16-bit address field.
    pub address: u16,
    /// Data bytes; the byte count is `data.len()`.
    pub data: Vec<u8>,
}

impl HexRecord {
    /// Data record.
    pub fn data(address: u16, data: &[u8]) -> Self {
        Self {
            record_type: RecordType::Data,
            address,
            data: data.to_vec(),
        }
    }

    /// End-of-file record.
    pub fn end_of_file() -> Self {
        Self {
            record_type: RecordType::EndOfFile,
            address: 0,
            data: Vec::new(),
        }
    }

    /// Extended linear address record setting the upper address half.
    pub fn extended_linear_address(upper: u16) -> Self {
        Self {
            record_type: RecordType::ExtendedLinearAddress,
            address: 0,
            data: upper
                .to_be_bytes()
                .to_vec(),
        }
    }

    /// Decode one line. A trailing `\n` or `\r\n` is ignored.
    pub fn parse(line: &str) -> Result<Self, HexError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let digits = line
            .strip_prefix(':')
            .ok_or(HexError::MissingStartCode)?;
        if digits.len() % 2 != 0 {
            return Err(HexError::OddLength);
        }
        if !digits
            .bytes()
            .all(|c| c.is_ascii_hexdigit())
        {
            return Err(HexError::BadCharacter);
        }

        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| HexError::BadCharacter)?;

        if bytes.len() < FIXED_BYTES {
            return Err(HexError::TooShort);
        }
        if bytes.len() != FIXED_BYTES + usize::from(bytes[0]) {
            return Err(HexError::LengthMismatch);
        }

        let (body, trailer) = bytes.split_at(bytes.len() - 1);
        let expected = record_checksum(body);
        if expected != trailer[0] {
            return Err(HexError::ChecksumMismatch {
                expected,
                found: trailer[0],
            });
        }

        Ok(Self {
            record_type: RecordType::from(body[3]),
            address: u16::from_be_bytes([body[1], body[2]]),
            data: body[4..].to_vec(),
        })
    }

    /// Byte count field.
    pub fn byte_count(&self) -> u8 {
        self.data.len() as u8
    }

    /// Checksum this record carries when encoded.
    pub fn checksum(&self) -> u8 {
        record_checksum(&self.header_and_data())
    }

    fn header_and_data(&self) -> Vec<u8> {
        let [hi, lo] = self
            .address
            .to_be_bytes();
        let mut bytes = vec![
            self.byte_count(),
            hi,
            lo,
            self.record_type
                .as_u8(),
        ];
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

impl fmt::Display for HexRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":")?;
        for byte in self.header_and_data() {
            write!(f, "{byte:02X}")?;
        }
        write!(f, "{:02X}", self.checksum())
    }
}

/// Two's complement of the byte sum.
fn record_checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_record() {
        let record = HexRecord::parse(":0400100001020304E2\r\n").unwrap();
        assert_eq!(record.record_type, RecordType::Data);
        assert_eq!(record.address, 0x0010);
        assert_eq!(record.data, vec![1, 2, 3, 4]);
        assert_eq!(record.checksum(), 0xE2);
    }

    #[test]
    fn test_parse_standard_records() {
        assert_eq!(
            HexRecord::parse(":00000001FF").unwrap(),
            HexRecord::end_of_file()
        );
        assert_eq!(
            HexRecord::parse(":020000040001F9").unwrap(),
            HexRecord::extended_linear_address(1)
        );
        assert_eq!(
            HexRecord::parse(":00000003FD")
                .unwrap()
                .record_type,
            RecordType::Unsupported(3)
        );
    }

    #[test]
    fn test_rejects_malformed_lines() {
        assert_eq!(
            HexRecord::parse("00000001FF"),
            Err(HexError::MissingStartCode)
        );
        assert_eq!(HexRecord::parse(":00000001F"), Err(HexError::OddLength));
        assert_eq!(HexRecord::parse(":0000000GFF"), Err(HexError::BadCharacter));
        assert_eq!(HexRecord::parse(":00000001"), Err(HexError::TooShort));
        assert_eq!(
            HexRecord::parse(":0200000001FD"),
            Err(HexError::LengthMismatch)
        );
        assert_eq!(
            HexRecord::parse(":00000001FE"),
            Err(HexError::ChecksumMismatch {
                expected: 0xFF,
                found: 0xFE
            })
        );
    }

    #[test]
    fn test_display_matches_parse() {
        let record = HexRecord::data(0x0400, &[0x8C, 0x30, 0xFF, 0x3F]);
        let text = record.to_string();
        assert_eq!(text, ":040400008C30FF3FFE");
        assert_eq!(HexRecord::parse(&text).unwrap(), record);
    }
}
