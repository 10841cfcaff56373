//! # picoptic
//!
//! Firmware download over light for small PIC microcontrollers.
//!
//! The target runs a bootloader that reads a bit-banged serial signal from a
//! light sensor through its ADC and answers on a single output pin. This
//! crate holds both ends of that link:
//!
//! - Intel-HEX loading into a flat program memory image
//! - The wire protocol (opcodes, payloads, checksums) and 8-N-1 bit codec
//! - The device-side command interpreter, written against a small hardware
//!   trait, with a cycle-counting simulator
//! - The host-side download session with retries and read-back verification
//!
//! ## Features
//!
//! - `native` (default): serial port support via `serialport`
//! - `serde`: serialization of session options and summaries
//!
//! ## Example
//!
//! ```rust,no_run
//! use picoptic::{LoadOptions, MemoryImage, OpticFlasher, SessionOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = MemoryImage::from_file("firmware.hex", &LoadOptions::default())?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let port = picoptic::NativePort::open_simple("/dev/ttyUSB0", 9600)?;
//!         let mut flasher = OpticFlasher::new(port, SessionOptions::default());
//!         flasher.settle()?;
//!         let summary = flasher.download(&image, |page, done, total| {
//!             println!("page {page}: {done}/{total}");
//!         })?;
//!         println!("battery {:.2} V", summary.battery_volts);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod bootloader;
pub mod error;
pub mod host;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    bootloader::{Bootloader, SimulatedChip, SimulatedPort},
    error::{Error, HexError, Result},
    host::{BridgeKind, DetectedPort, auto_detect_port, discover_adapter_ports, discover_ports},
    image::{LoadOptions, MemoryImage, ihex::HexRecord},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{BitTiming, Opcode},
    session::{DownloadSummary, OpticFlasher, SessionOptions},
};
