//! Host download session.
//!
//! [`OpticFlasher`] drives the bootloader command set over any [`Port`]:
//! every command is an opcode, a length announcement from the device, the
//! payload, and an ACK or NAK followed by the result bytes. A download is
//! battery check, then write and read-back of every programmed page, then
//! a chime and the jump to the application.
//!
//! ## Example
//!
//! ```rust,no_run
//! use picoptic::{LoadOptions, MemoryImage, NativePort, OpticFlasher, SessionOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = MemoryImage::from_file("blink.hex", &LoadOptions::default())?;
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 9600)?;
//!
//!     let mut flasher = OpticFlasher::new(port, SessionOptions::default());
//!     flasher.settle()?;
//!     flasher.download(&image, |page, done, total| {
//!         println!("page {page}: {done}/{total}");
//!     })?;
//!     flasher.close()?;
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::MemoryImage;
use crate::port::Port;
use crate::protocol::optic::{
    ACK, ERASED_WORD, NAK, Opcode, PAGE_BYTES, PAGE_WORDS, PROTECTED_PAGES, battery_volts,
    checksum, is_protected, page_words, read_payload, speaker_payload, write_payload,
};
use log::{debug, info, trace, warn};
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Pause between the two notes of the completion chime.
const CHIME_GAP: Duration = Duration::from_millis(100);

/// Session policy and timing.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionOptions {
    /// Skip image data in the bootloader pages instead of failing.
    pub ignore_protected: bool,
    /// Carry on when the battery reads below `min_battery_volts`.
    pub ignore_battery: bool,
    /// Lowest acceptable supply voltage.
    pub min_battery_volts: f32,
    /// Write and read-back attempts per page.
    pub max_attempts: u32,
    /// Play the completion chime before launching.
    pub chime: bool,
    /// After a page fails for good, try to leave an erased application entry
    /// page behind so the device stays in the bootloader.
    pub invalidate_on_failure: bool,
    /// Sleep between polls of the port.
    pub poll_interval: Duration,
    /// Polls to wait for the frame length announcement.
    pub ack_poll_limit: u32,
    /// Polls to wait for a complete response.
    pub response_poll_limit: u32,
    /// Times the opcode is sent before giving up on an announcement.
    pub opcode_attempts: u32,
    /// Idle time after opening the port before the first command.
    pub settle_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ignore_protected: false,
            ignore_battery: false,
            min_battery_volts: 2.0,
            max_attempts: 3,
            chime: true,
            invalidate_on_failure: false,
            poll_interval: Duration::from_millis(1),
            ack_poll_limit: 500,
            response_poll_limit: 1000,
            opcode_attempts: 3,
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// What a completed download did.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DownloadSummary {
    /// Supply voltage measured before writing.
    pub battery_volts: f32,
    /// Pages written and verified, in order.
    pub pages_written: Vec<u8>,
    /// Protected pages whose data was left out.
    pub pages_skipped: Vec<u8>,
    /// Extra attempts spent on pages that eventually verified.
    pub retries: u32,
}

type InterruptChecker = Arc<dyn Fn() -> bool + Send + Sync>;

/// Download session over one port.
pub struct OpticFlasher<P: Port> {
    port: P,
    options: SessionOptions,
    interrupt: Option<InterruptChecker>,
}

impl<P: Port> OpticFlasher<P> {
    /// Start a session on an open port.
    pub fn new(port: P, options: SessionOptions) -> Self {
        Self {
            port,
            options,
            interrupt: None,
        }
    }

    /// Use `checker` instead of the library-wide interrupt checker.
    #[must_use]
    pub fn with_interrupt_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.interrupt = Some(Arc::new(checker));
        self
    }

    /// Session options.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Wait for the adapter and the device to settle after opening.
    pub fn settle(&mut self) -> Result<()> {
        debug!("Settling for {:?}", self.options.settle_delay);
        thread::sleep(self.options.settle_delay);
        self.port
            .clear_buffers()
    }

    /// Close the port.
    pub fn close(&mut self) -> Result<()> {
        self.port
            .close()
    }

    fn interrupted(&self) -> bool {
        match &self.interrupt {
            Some(checker) => checker(),
            None => crate::is_interrupted_requested(),
        }
    }

    fn pause(&self) {
        if !self
            .options
            .poll_interval
            .is_zero()
        {
            thread::sleep(self.options.poll_interval);
        }
    }

    /// Poll until `needed` bytes are pending or `limit` polls have passed.
    fn wait_for(&mut self, needed: usize, limit: u32) -> Result<usize> {
        let mut available = 0;
        for _ in 0..limit {
            self.pause();
            available = self
                .port
                .bytes_available()?;
            if available >= needed {
                break;
            }
        }
        Ok(available)
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.port
            .read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn discard_pending(&mut self) -> Result<()> {
        self.port
            .clear_buffers()?;
        let stale = self
            .port
            .bytes_available()?;
        if stale > 0 {
            let mut junk = vec![0u8; stale];
            self.port
                .read_exact(&mut junk)?;
            debug!("Discarded {stale} stale bytes");
        }
        Ok(())
    }

    /// Run one command and return the result bytes that follow the ACK.
    pub fn command(
        &mut self,
        opcode: Opcode,
        payload: &[u8],
        response_len: usize,
    ) -> Result<Vec<u8>> {
        if payload.len() != opcode.payload_len() {
            return Err(Error::Protocol(format!(
                "'{opcode}' takes {} payload bytes, got {}",
                opcode.payload_len(),
                payload.len()
            )));
        }
        self.discard_pending()?;

        let mut available = 0;
        for attempt in 1..=self.options.opcode_attempts {
            trace!("Sending opcode '{opcode}' (attempt {attempt})");
            self.port
                .write_all_bytes(&[opcode.byte()])?;
            available = self.wait_for(1, self.options.ack_poll_limit)?;
            if available > 0 {
                break;
            }
            debug!(
                "No announcement for '{opcode}' (attempt {attempt}/{})",
                self.options.opcode_attempts
            );
        }
        if available == 0 {
            return Err(Error::Timeout(format!(
                "device does not respond to command '{opcode}'"
            )));
        }

        let announced = self.read_byte()?;
        if usize::from(announced) != payload.len() + 1 {
            return Err(Error::Protocol(format!(
                "command size ('{opcode}' announced {announced}, expected {})",
                payload.len() + 1
            )));
        }

        if !payload.is_empty() {
            self.port
                .write_all_bytes(payload)?;
        }

        let available = self.wait_for(response_len + 1, self.options.response_poll_limit)?;
        if available == 0 {
            return Err(Error::Timeout(format!(
                "response to '{opcode}' was not received in a timely fashion"
            )));
        }

        match self.read_byte()? {
            ACK => {},
            NAK => {
                let checksum = self.nak_checksum(opcode, available - 1)?;
                return Err(Error::Nak {
                    opcode: char::from(opcode.byte()),
                    checksum,
                });
            },
            other => {
                return Err(Error::Protocol(format!(
                    "response format ('{opcode}' answered 0x{other:02X})"
                )));
            },
        }

        let remaining = available - 1;
        if remaining != response_len {
            return Err(Error::Protocol(format!(
                "response size ('{opcode}' sent {remaining} bytes, expected {response_len})"
            )));
        }

        let mut response = vec![0u8; response_len];
        self.port
            .read_exact(&mut response)?;
        trace!("'{opcode}' response: {response:02X?}");
        Ok(response)
    }

    /// A refused write is followed by the checksum the device computed.
    fn nak_checksum(&mut self, opcode: Opcode, pending: usize) -> Result<Option<u8>> {
        if opcode != Opcode::Write {
            return Ok(None);
        }
        let pending = if pending == 0 {
            self.wait_for(1, self.options.ack_poll_limit)?
        } else {
            pending
        };
        if pending == 0 {
            return Ok(None);
        }
        self.read_byte()
            .map(Some)
    }

    /// Measure the device supply voltage.
    pub fn battery_voltage(&mut self) -> Result<f32> {
        let raw = self.command(Opcode::Battery, &[], Opcode::Battery.response_len())?;
        let raw = u16::from_be_bytes([raw[0], raw[1]]);
        debug!("Reference sample 0x{raw:04X}");
        Ok(battery_volts(raw))
    }

    /// Measure the supply and refuse to continue below the minimum.
    pub fn check_battery(&mut self) -> Result<f32> {
        let volts = self.battery_voltage()?;
        info!("Battery voltage is {volts:.3} V");

        let minimum = self.options.min_battery_volts;
        if volts < minimum {
            if !self.options.ignore_battery {
                return Err(Error::LowBattery { volts, minimum });
            }
            warn!("Battery voltage {volts:.3} V is below {minimum:.3} V, continuing anyway");
        }
        Ok(volts)
    }

    /// Erase and write one page.
    pub fn write_page(&mut self, page: u8, words: &[u16; PAGE_WORDS]) -> Result<()> {
        debug!("Writing page {page}");
        self.command(Opcode::Write, &write_payload(page, words), 0)
            .map(drop)
    }

    /// Read one page back.
    ///
    /// A response whose checksum does not add up is reported as a verify
    /// failure so the caller can retry it.
    pub fn read_page(&mut self, page: u8) -> Result<[u16; PAGE_WORDS]> {
        let response = self.command(
            Opcode::Read,
            &read_payload(page),
            Opcode::Read.response_len(),
        )?;
        let (data, trailer) = response.split_at(PAGE_BYTES);
        let expected = checksum(data).wrapping_add(page);
        if expected != trailer[0] {
            debug!(
                "Read checksum mismatch on page {page}: 0x{expected:02X} != 0x{:02X}",
                trailer[0]
            );
            return Err(Error::VerifyMismatch { page });
        }

        let bytes: [u8; PAGE_BYTES] = data
            .try_into()
            .map_err(|_| Error::Protocol("response size".into()))?;
        Ok(page_words(&bytes))
    }

    /// Read a page back and compare it with `words`.
    pub fn verify_page(&mut self, page: u8, words: &[u16; PAGE_WORDS]) -> Result<()> {
        let stored = self.read_page(page)?;
        if let Some(offset) = stored
            .iter()
            .zip(words)
            .position(|(a, b)| a != b)
        {
            debug!(
                "Page {page} word {offset}: read 0x{:04X}, wrote 0x{:04X}",
                stored[offset], words[offset]
            );
            return Err(Error::VerifyMismatch { page });
        }
        Ok(())
    }

    /// Write and verify a page, retrying link corruption.
    ///
    /// Returns the number of attempts used.
    pub fn program_page(&mut self, page: u8, words: &[u16; PAGE_WORDS]) -> Result<u32> {
        let attempts = self.options.max_attempts;
        for attempt in 1..=attempts {
            if attempt > 1 {
                info!("Trying page {page} again ({attempt}/{attempts})");
            }
            match self
                .write_page(page, words)
                .and_then(|()| self.verify_page(page, words))
            {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_retryable() => {
                    warn!("Page {page} attempt {attempt}/{attempts} failed: {e}");
                },
                Err(e) => return Err(e),
            }
        }

        if self.options.invalidate_on_failure {
            self.invalidate();
        }
        Err(Error::DownloadFailed { page, attempts })
    }

    /// Best effort: erase the application entry page.
    fn invalidate(&mut self) {
        warn!("Erasing application entry page {PROTECTED_PAGES}");
        if let Err(e) = self.write_page(PROTECTED_PAGES, &[ERASED_WORD; PAGE_WORDS]) {
            warn!("Could not erase application entry page: {e}");
        }
    }

    /// Play the completion chime.
    pub fn chime(&mut self) -> Result<()> {
        self.command(
            Opcode::Speaker,
            &speaker_payload(50, 2),
            Opcode::Speaker.response_len(),
        )?;
        thread::sleep(CHIME_GAP);
        self.command(
            Opcode::Speaker,
            &speaker_payload(48, 4),
            Opcode::Speaker.response_len(),
        )?;
        Ok(())
    }

    /// Start the application. The device does not answer once it has left
    /// the bootloader, so nothing is read back.
    pub fn launch(&mut self) -> Result<()> {
        self.port
            .write_all_bytes(&[Opcode::Execute.byte()])?;
        info!("Application launched");
        Ok(())
    }

    /// Program every page of `image` that holds data.
    ///
    /// `progress` is called after each verified page with the page index,
    /// the number of pages done and the total.
    pub fn download<F>(&mut self, image: &MemoryImage, mut progress: F) -> Result<DownloadSummary>
    where
        F: FnMut(u8, usize, usize),
    {
        let mut pages = Vec::new();
        let mut pages_skipped = Vec::new();
        for page in image.programmed_pages() {
            if is_protected(page) {
                if !self.options.ignore_protected {
                    return Err(Error::ProtectedPage { page });
                }
                warn!("Ignoring data in protected page {page}");
                pages_skipped.push(page);
            } else {
                pages.push(page);
            }
        }

        let battery_volts = self.check_battery()?;

        info!("Downloading {} pages", pages.len());
        let total = pages.len();
        let mut retries = 0;
        for (index, &page) in pages
            .iter()
            .enumerate()
        {
            if self.interrupted() {
                warn!("Download interrupted before page {page}");
                return Err(Error::Interrupted);
            }
            let attempts = self.program_page(page, &image.page(page))?;
            retries += attempts - 1;
            progress(page, index + 1, total);
        }
        info!("Download successful");

        if self.options.chime {
            if let Err(e) = self.chime() {
                warn!("Chime failed: {e}");
            }
        }
        self.launch()?;

        Ok(DownloadSummary {
            battery_volts,
            pages_written: pages,
            pages_skipped,
            retries,
        })
    }
}
