//! Hardware access used by the bootloader.
//!
//! The command interpreter only touches the chip through [`Hardware`]: the
//! ADC, the fixed voltage reference, one output pin for the return channel,
//! the speaker pins, a calibrated busy delay and the self-programming flash
//! controller. Every operation that waits on a peripheral busy flag blocks
//! until the flag clears; on real hardware this always terminates.

/// ADC input selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogChannel {
    /// Light sensor carrying the incoming optical signal.
    LightSensor,
    /// Internal fixed voltage reference (1.024 V).
    Reference,
}

/// Speaker pin drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeakerDrive {
    /// Both pins released.
    #[default]
    Off,
    /// Current through the speaker one way.
    Forward,
    /// Current through the speaker the other way.
    Reverse,
}

/// ADC high byte above which the light sensor reads as a mark (logic 1).
pub const LIGHT_THRESHOLD: u8 = 42;

/// Delay ticks allowed for the voltage reference to settle after it reports
/// ready.
pub const REFERENCE_SETTLE_TICKS: u16 = 1000;

/// Classify a left-justified light sample as a logic level.
pub fn is_mark(sample: u16) -> bool {
    (sample >> 8) as u8 > LIGHT_THRESHOLD
}

/// Narrow hardware interface of the bootloader.
pub trait Hardware {
    /// Run one conversion on `channel` and return the left-justified result.
    fn sample_analog(&mut self, channel: AnalogChannel) -> u16;

    /// Enable the fixed reference and wait until it reports stable, or
    /// disable it and restore the light sensor configuration.
    fn set_reference(&mut self, enabled: bool);

    /// Drive the return-channel output pin.
    fn set_line(&mut self, level: bool);

    /// Drive the speaker pins.
    fn set_speaker(&mut self, drive: SpeakerDrive);

    /// Busy wait for `ticks` units of ten instruction cycles.
    fn delay(&mut self, ticks: u16);

    /// Erase the 32-word page starting at word address `addr`.
    fn erase_page(&mut self, addr: u16);

    /// Program one word.
    fn write_word(&mut self, addr: u16, value: u16);

    /// Read one word.
    fn read_word(&mut self, addr: u16) -> u16;

    /// Return all I/O to its reset state and jump to the application entry.
    ///
    /// Does not return on hardware.
    fn launch_firmware(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold() {
        assert!(is_mark(0xC000));
        assert!(is_mark(0x2B00));
        assert!(!is_mark(0x2A40));
        assert!(!is_mark(0x0000));
    }
}
