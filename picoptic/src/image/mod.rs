//! Firmware image handling.
//!
//! An Intel-HEX file is flattened into a [`MemoryImage`]: one 16-bit cell per
//! program word of the target, erased cells reading `0x3FFF`. HEX addresses
//! are byte addresses; word `n` is made of bytes `2n` (low) and `2n + 1`
//! (high).

pub mod ihex;

use crate::error::{Error, HexError, Result};
use crate::protocol::optic::{ERASED_WORD, FLASH_WORDS, PAGE_COUNT, PAGE_WORDS};
use ihex::{HexRecord, RecordType};
use log::{debug, warn};
use std::fmt::Write as _;
use std::path::Path;

/// One past the highest byte address that maps into program memory.
pub const PROGRAM_BYTES: u32 = (FLASH_WORDS * 2) as u32;

/// Words per page-map row.
pub const MAP_ROW_WORDS: usize = 0x40;

/// Implemented bits of a program word.
const WORD_MASK: u16 = 0x3FFF;

/// Data bytes per record written by [`MemoryImage::to_hex`].
const RECORD_BYTES: usize = 16;

/// How lenient the loader is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Skip data beyond program memory (configuration words, EEPROM data)
    /// instead of failing.
    pub ignore_out_of_range: bool,
}

/// Flat program memory contents.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryImage {
    words: Vec<u16>,
}

impl Default for MemoryImage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImage")
            .field("programmed_words", &self.programmed_words())
            .field(
                "programmed_pages",
                &self
                    .programmed_pages()
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl MemoryImage {
    /// Fully erased image.
    pub fn new() -> Self {
        Self {
            words: vec![ERASED_WORD; FLASH_WORDS],
        }
    }

    /// Read and parse an Intel-HEX file.
    pub fn from_file<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_hex(&text, options)
    }

    /// Parse Intel-HEX text.
    ///
    /// Loading stops at the end-of-file record. Any malformed record fails
    /// the whole load with its 1-based line number.
    pub fn from_hex(text: &str, options: &LoadOptions) -> Result<Self> {
        let mut image = Self::new();
        let mut base: u32 = 0;

        for (index, raw) in text
            .lines()
            .enumerate()
        {
            let line = index + 1;
            if raw
                .trim()
                .is_empty()
            {
                continue;
            }
            let hex_error = |kind: HexError| Error::Hex { line, kind };
            let record = HexRecord::parse(raw).map_err(hex_error)?;

            match record.record_type {
                RecordType::Data => {
                    let start = base.saturating_add(u32::from(record.address));
                    image.place(line, start, &record.data, options)?;
                },
                RecordType::EndOfFile => {
                    if !record
                        .data
                        .is_empty()
                    {
                        return Err(hex_error(HexError::EofByteCount));
                    }
                    debug!("End of file record at line {line}");
                    return Ok(image);
                },
                RecordType::ExtendedLinearAddress => {
                    if record.address != 0 {
                        return Err(hex_error(HexError::ExtendedAddressField));
                    }
                    let [hi, lo] = record.data[..] else {
                        return Err(hex_error(HexError::ExtendedAddressByteCount));
                    };
                    base = u32::from(u16::from_be_bytes([hi, lo])) << 16;
                },
                RecordType::Unsupported(kind) => {
                    return Err(hex_error(HexError::UnsupportedType(kind)));
                },
            }
        }

        warn!("No end of file record, using image as read");
        Ok(image)
    }

    fn place(&mut self, line: usize, start: u32, data: &[u8], options: &LoadOptions) -> Result<()> {
        for (offset, &byte) in data
            .iter()
            .enumerate()
        {
            let address = start.saturating_add(offset as u32);
            if address >= PROGRAM_BYTES {
                if options.ignore_out_of_range {
                    warn!("line {line}: skipping data at 0x{address:08X}, outside program memory");
                    return Ok(());
                }
                return Err(Error::OutOfRange { line, address });
            }

            let word = &mut self.words[(address / 2) as usize];
            *word = if address % 2 == 0 {
                (*word & 0xFF00) | u16::from(byte)
            } else {
                if (u16::from(byte) << 8) & !WORD_MASK != 0 {
                    warn!(
                        "line {line}: dropping bits 14-15 of word 0x{:04X}",
                        address / 2
                    );
                }
                ((*word & 0x00FF) | (u16::from(byte) << 8)) & WORD_MASK
            };
        }
        Ok(())
    }

    /// Word at `addr`.
    pub fn word(&self, addr: u16) -> u16 {
        self.words[usize::from(addr) % FLASH_WORDS]
    }

    /// All words.
    pub fn words(&self) -> &[u16] {
        &self.words
    }

    /// The 32 words of page `index`.
    pub fn page(&self, index: u8) -> [u16; PAGE_WORDS] {
        let base = usize::from(index) % PAGE_COUNT * PAGE_WORDS;
        let mut page = [ERASED_WORD; PAGE_WORDS];
        page.copy_from_slice(&self.words[base..base + PAGE_WORDS]);
        page
    }

    /// Whether any word of page `index` differs from the erased value.
    pub fn is_page_programmed(&self, index: u8) -> bool {
        self.page(index)
            .iter()
            .any(|&w| w != ERASED_WORD)
    }

    /// Indices of pages holding data, ascending.
    pub fn programmed_pages(&self) -> impl Iterator<Item = u8> + '_ {
        (0..PAGE_COUNT as u8).filter(|&page| self.is_page_programmed(page))
    }

    /// Number of non-erased words.
    pub fn programmed_words(&self) -> usize {
        self.words
            .iter()
            .filter(|&&w| w != ERASED_WORD)
            .count()
    }

    /// Text map of programmed words, one row per 64 words.
    ///
    /// Each row is the word address of its first cell followed by `X` for
    /// programmed and `-` for erased words. Empty rows are left out.
    pub fn page_map(&self) -> String {
        let mut map = String::new();
        for (row, chunk) in self
            .words
            .chunks(MAP_ROW_WORDS)
            .enumerate()
        {
            if chunk
                .iter()
                .all(|&w| w == ERASED_WORD)
            {
                continue;
            }
            let cells: String = chunk
                .iter()
                .map(|&w| if w == ERASED_WORD { '-' } else { 'X' })
                .collect();
            let _ = writeln!(map, "{:08X} {cells}", row * MAP_ROW_WORDS);
        }
        map
    }

    /// Encode as Intel-HEX: 16-byte data records covering every programmed
    /// word, then an end-of-file record.
    pub fn to_hex(&self) -> String {
        let words_per_record = RECORD_BYTES / 2;
        let mut out = String::new();
        for (index, chunk) in self
            .words
            .chunks(words_per_record)
            .enumerate()
        {
            if chunk
                .iter()
                .all(|&w| w == ERASED_WORD)
            {
                continue;
            }
            let bytes: Vec<u8> = chunk
                .iter()
                .flat_map(|w| w.to_le_bytes())
                .collect();
            let address = (index * RECORD_BYTES) as u16;
            let _ = writeln!(out, "{}", HexRecord::data(address, &bytes));
        }
        let _ = writeln!(out, "{}", HexRecord::end_of_file());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> Result<MemoryImage> {
        MemoryImage::from_hex(text, &LoadOptions::default())
    }

    #[test]
    fn test_single_data_record() {
        // Two words at word address 0x200 (byte address 0x400).
        let image = load(":040400008C30FF3FFE\n:00000001FF\n").unwrap();
        assert_eq!(image.word(0x200), 0x308C);
        assert_eq!(image.word(0x201), 0x3FFF);
        assert_eq!(image.programmed_words(), 1);
        assert_eq!(
            image
                .programmed_pages()
                .collect::<Vec<_>>(),
            vec![16]
        );
        assert!(image.is_page_programmed(16));
        assert!(!image.is_page_programmed(17));
        assert_eq!(image.page(16)[0], 0x308C);
    }

    #[test]
    fn test_odd_byte_sets_high_half_only() {
        let image = load(":010401002BCF\n:00000001FF\n").unwrap();
        assert_eq!(image.word(0x200), 0x2BFF);
    }

    #[test]
    fn test_words_keep_only_fourteen_bits() {
        // 0xC123 at word 0x200.
        let image = load(":0204000023C116\n:00000001FF\n").unwrap();
        assert_eq!(image.word(0x200), 0x0123);
        assert!(image.words().iter().all(|&w| w <= ERASED_WORD));
    }

    #[test]
    fn test_stops_at_end_of_file() {
        let image = load(":00000001FF\n:040400008C30FF3FFE\n").unwrap();
        assert_eq!(image.programmed_words(), 0);
    }

    #[test]
    fn test_skips_blank_lines_and_crlf() {
        let image = load("\r\n:040400008C30FF3FFE\r\n\r\n:00000001FF\r\n").unwrap();
        assert_eq!(image.word(0x200), 0x308C);
    }

    #[test]
    fn test_extended_address_with_bad_byte_count_fails() {
        let err = load(":0100000400FB\n:00000001FF\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Hex {
                line: 1,
                kind: HexError::ExtendedAddressByteCount
            }
        ));
    }

    #[test]
    fn test_extended_address_with_nonzero_address_fails() {
        let err = load(":020010040000EA\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Hex {
                kind: HexError::ExtendedAddressField,
                ..
            }
        ));
    }

    #[test]
    fn test_end_of_file_with_data_fails() {
        let err = load(":040400008C30FF3FFE\n:0100000100FE\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Hex {
                line: 2,
                kind: HexError::EofByteCount
            }
        ));
    }

    #[test]
    fn test_unsupported_record_type_fails() {
        let err = load(":00000003FD\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Hex {
                kind: HexError::UnsupportedType(3),
                ..
            }
        ));
    }

    #[test]
    fn test_checksum_error_reports_line() {
        let err = load(":040400008C30FF3FFE\n:040400008C30FF3FFF\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Hex {
                line: 2,
                kind: HexError::ChecksumMismatch { .. }
            }
        ));
    }

    #[test]
    fn test_out_of_range_data() {
        // Configuration word area at byte address 0x2000.
        let text = ":01200000AB34\n:00000001FF\n";
        let err = load(text).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfRange {
                line: 1,
                address: 0x2000
            }
        ));

        let options = LoadOptions {
            ignore_out_of_range: true,
        };
        let image = MemoryImage::from_hex(text, &options).unwrap();
        assert_eq!(image.programmed_words(), 0);
    }

    #[test]
    fn test_extended_base_moves_data_out_of_range() {
        let err = load(":020000040001F9\n:01000000AA55\n").unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfRange {
                line: 2,
                address: 0x0001_0000
            }
        ));
    }

    #[test]
    fn test_round_trip() {
        let mut image = MemoryImage::new();
        for addr in 0x200..0x230 {
            image.words[addr] = (addr as u16 * 7) & 0x3FFF;
        }
        image.words[0x7FF] = 0x0123;
        let reparsed = load(&image.to_hex()).unwrap();
        assert_eq!(reparsed, image);
        assert!(image.to_hex().ends_with(":00000001FF\n"));
    }

    #[test]
    fn test_page_map_rows() {
        let image = load(":040400008C30FF3FFE\n:00000001FF\n").unwrap();
        let map = image.page_map();
        let lines: Vec<&str> = map.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("00000200 X-"));
        assert_eq!(lines[0].len(), 9 + MAP_ROW_WORDS);
    }

    #[test]
    fn test_from_file_reports_missing_file() {
        let err = MemoryImage::from_file("/nonexistent/image.hex", &LoadOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
