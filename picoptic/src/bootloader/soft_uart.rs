//! Software UART over the light sensor and the output pin.

use crate::bootloader::hal::{AnalogChannel, Hardware, is_mark};
use crate::protocol::uart::{BitTiming, frame_bits};
use log::trace;

/// Stop bit sampled low.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingError;

/// Bit-banged receiver and transmitter sharing one timing.
#[derive(Debug, Clone, Copy)]
pub struct SoftUart {
    timing: BitTiming,
}

impl SoftUart {
    /// Create a software UART.
    pub fn new(timing: BitTiming) -> Self {
        Self { timing }
    }

    /// Timing in use.
    pub fn timing(&self) -> &BitTiming {
        &self.timing
    }

    /// Take one light sample and classify it.
    pub fn sample<H: Hardware>(&self, hw: &mut H) -> bool {
        is_mark(hw.sample_analog(AnalogChannel::LightSensor))
    }

    /// Receive the rest of a frame whose start bit was just sampled.
    pub fn receive<H: Hardware>(&self, hw: &mut H) -> Result<u8, FramingError> {
        hw.delay(
            self.timing
                .first_sample_delay(),
        );

        let mut byte = 0u8;
        for _ in 0..8 {
            byte = (byte >> 1) | if self.sample(hw) { 0x80 } else { 0x00 };
            hw.delay(
                self.timing
                    .inter_sample_delay(),
            );
        }

        if self.sample(hw) {
            trace!("rx 0x{byte:02X}");
            Ok(byte)
        } else {
            trace!("rx framing error (data 0x{byte:02X})");
            Err(FramingError)
        }
    }

    /// Transmit one byte on the output pin.
    pub fn transmit<H: Hardware>(&self, hw: &mut H, byte: u8) {
        let bit_ticks = self.timing.bit_ticks();
        for level in frame_bits(byte) {
            hw.set_line(level);
            hw.delay(bit_ticks);
        }
    }
}
