//! Device-resident command interpreter.
//!
//! The bootloader occupies flash pages 0-15 of the target and listens for
//! commands on the light sensor. Its main loop is a polling state machine:
//!
//! ```text
//!            mark seen            opcode (frame length > 1)
//! WaitMark ------------> WaitCommand ----------------------> WaitPayload
//!    ^                     |    ^                                 |
//!    |   framing error     |    |      execute (last byte)        |
//!    +---------------------+    +---------------------------------+
//!    ^                                                            |
//!    +------------------------ framing error ---------------------+
//! ```
//!
//! Opcodes without payload execute straight from `WaitCommand`. An inactivity
//! countdown launches the installed application if no command completes
//! before it runs out; the first executed command cancels it for good.

pub mod executor;
pub mod hal;
pub mod sim;
pub mod soft_uart;

use crate::protocol::optic::Opcode;
use crate::protocol::uart::BitTiming;
use executor::{CommandBuffer, Outcome};
use hal::Hardware;
use log::{debug, info};
use soft_uart::SoftUart;

pub use executor::execute;
pub use hal::{AnalogChannel, SpeakerDrive};
pub use sim::{SimulatedChip, SimulatedPort};

/// Main loop iterations before the installed application is launched.
pub const DEFAULT_COUNTDOWN: u32 = 100_000;

/// Frame assembler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the line to go idle (mark) before trusting edges.
    WaitMark,
    /// Waiting for an opcode.
    WaitCommand,
    /// Collecting payload bytes.
    WaitPayload {
        /// Bytes still expected.
        remaining: usize,
    },
    /// Control passed to the application.
    Launched,
}

/// Bootloader main loop over some hardware.
pub struct Bootloader<H: Hardware> {
    hw: H,
    uart: SoftUart,
    state: State,
    frame: CommandBuffer,
    countdown: Option<u32>,
    executed: usize,
    framing_errors: usize,
}

impl<H: Hardware> Bootloader<H> {
    /// Create a bootloader in its power-up state.
    pub fn new(hw: H, timing: BitTiming) -> Self {
        Self {
            hw,
            uart: SoftUart::new(timing),
            state: State::WaitMark,
            frame: CommandBuffer::default(),
            countdown: Some(DEFAULT_COUNTDOWN),
            executed: 0,
            framing_errors: 0,
        }
    }

    /// Override the inactivity countdown (`None` disables it).
    #[must_use]
    pub fn with_countdown(mut self, countdown: Option<u32>) -> Self {
        self.countdown = countdown;
        self
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Remaining countdown, `None` once cancelled.
    pub fn countdown(&self) -> Option<u32> {
        self.countdown
    }

    /// Number of frames executed so far.
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Number of received bytes dropped on a framing error.
    pub fn framing_errors(&self) -> usize {
        self.framing_errors
    }

    /// Whether control has passed to the application.
    pub fn is_launched(&self) -> bool {
        self.state == State::Launched
    }

    /// Get a reference to the hardware.
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// Get a mutable reference to the hardware.
    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Consume the bootloader and return the hardware.
    pub fn into_hardware(self) -> H {
        self.hw
    }

    /// Run the main loop until control passes to the application.
    ///
    /// Without a countdown this only returns after an `X` command.
    pub fn run(&mut self) {
        while !self.is_launched() {
            self.poll();
        }
    }

    /// One main loop iteration: tick the countdown, take one light sample
    /// and, on a start bit, receive and process a whole byte.
    pub fn poll(&mut self) -> State {
        if self.is_launched() {
            return self.state;
        }

        if let Some(remaining) = self.countdown {
            if remaining <= 1 {
                info!("No command received, launching application");
                self.launch();
                return self.state;
            }
            self.countdown = Some(remaining - 1);
        }

        let mark = self.uart.sample(&mut self.hw);
        match self.state {
            State::WaitMark => {
                if mark {
                    self.state = State::WaitCommand;
                }
            },
            State::WaitCommand | State::WaitPayload { .. } => {
                if !mark {
                    match self.uart.receive(&mut self.hw) {
                        Ok(byte) => self.accept(byte),
                        Err(_) => {
                            debug!("Framing error in {:?}, waiting for mark", self.state);
                            self.framing_errors += 1;
                            self.frame.clear();
                            self.state = State::WaitMark;
                        },
                    }
                }
            },
            State::Launched => {},
        }
        self.state
    }

    fn accept(&mut self, byte: u8) {
        match self.state {
            State::WaitCommand => {
                self.frame.start(byte);
                let frame_len = Opcode::from_byte(byte).map_or(0, Opcode::frame_len);
                self.uart
                    .transmit(&mut self.hw, frame_len);
                if frame_len <= 1 {
                    self.execute();
                } else {
                    self.state = State::WaitPayload {
                        remaining: usize::from(frame_len) - 1,
                    };
                }
            },
            State::WaitPayload { remaining } => {
                self.frame.push(byte);
                if remaining <= 1 {
                    self.execute();
                } else {
                    self.state = State::WaitPayload {
                        remaining: remaining - 1,
                    };
                }
            },
            State::WaitMark | State::Launched => {},
        }
    }

    fn execute(&mut self) {
        let outcome = execute(&mut self.hw, &self.uart, &self.frame);
        self.frame.clear();
        debug!("Executed frame: {outcome:?}");

        match outcome {
            Outcome::Launched => {
                self.executed += 1;
                self.state = State::Launched;
            },
            Outcome::Completed | Outcome::ChecksumRejected => {
                self.executed += 1;
                self.countdown = None;
                self.state = State::WaitCommand;
            },
            Outcome::Unknown => {
                self.state = State::WaitCommand;
            },
        }
    }

    fn launch(&mut self) {
        self.hw.launch_firmware();
        self.state = State::Launched;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::optic::{
        ACK, ERASED_WORD, NAK, PAGE_WORDS, page_address, page_bytes, read_payload,
        speaker_payload, write_payload,
    };
    use crate::protocol::uart::frame_bits;

    fn bootloader() -> Bootloader<SimulatedChip> {
        ready(
            Bootloader::new(SimulatedChip::new(BitTiming::default()), BitTiming::default())
                .with_countdown(None),
        )
    }

    /// Let the device see the idle line before anything is sent.
    fn ready(mut boot: Bootloader<SimulatedChip>) -> Bootloader<SimulatedChip> {
        boot.poll();
        assert_eq!(boot.state(), State::WaitCommand);
        boot
    }

    /// Run the loop for `ms` milliseconds of device time and collect output.
    fn run_for(boot: &mut Bootloader<SimulatedChip>, ms: u64) -> Vec<u8> {
        let until = boot.hardware().clock() + boot.hardware().millis(ms);
        while boot.hardware().clock() < until && !boot.is_launched() {
            boot.poll();
        }
        boot.hardware_mut().take_output()
    }

    fn exchange(boot: &mut Bootloader<SimulatedChip>, opcode: u8, payload: &[u8]) -> Vec<u8> {
        boot.hardware_mut().send_light(&[opcode]);
        let mut out = run_for(boot, 5);
        boot.hardware_mut().send_light(payload);
        out.extend(run_for(boot, 400));
        out
    }

    #[test]
    fn test_waits_for_mark_before_framing() {
        let mut boot = Bootloader::new(SimulatedChip::new(BitTiming::default()), BitTiming::default())
            .with_countdown(None);
        boot.hardware_mut().hold_dark(true);
        for _ in 0..50 {
            boot.poll();
        }
        assert_eq!(boot.state(), State::WaitMark);
        assert!(boot.hardware_mut().take_output().is_empty());

        boot.hardware_mut().hold_dark(false);
        boot.poll();
        assert_eq!(boot.state(), State::WaitCommand);
    }

    #[test]
    fn test_announces_frame_length() {
        let mut boot = bootloader();
        boot.hardware_mut().send_light(b"R");
        let out = run_for(&mut boot, 5);
        assert_eq!(out, vec![2]);
        assert_eq!(boot.state(), State::WaitPayload { remaining: 1 });
    }

    #[test]
    fn test_write_then_read_returns_written_bytes() {
        let mut boot = bootloader();
        let words: [u16; PAGE_WORDS] = std::array::from_fn(|i| 0x0100 + i as u16);
        let payload = write_payload(20, &words);

        let out = exchange(&mut boot, b'W', &payload);
        assert_eq!(out, vec![67, ACK]);
        assert_eq!(boot.hardware().word(page_address(20) + 3), 0x0103);

        let out = exchange(&mut boot, b'R', &read_payload(20));
        assert_eq!(out[0], 2);
        assert_eq!(out[1], ACK);
        assert_eq!(&out[2..66], &page_bytes(&words)[..]);
        assert_eq!(out[66], payload[65]);
        assert_eq!(boot.executed(), 2);
    }

    #[test]
    fn test_bad_write_checksum_is_refused() {
        let mut boot = bootloader();
        let mut payload = write_payload(20, &[0x0AAA; PAGE_WORDS]);
        let good = payload[65];
        payload[65] = good.wrapping_add(1);

        let out = exchange(&mut boot, b'W', &payload);
        assert_eq!(out, vec![67, NAK, good]);
        assert_eq!(boot.hardware().word(page_address(20)), ERASED_WORD);
        assert_eq!(boot.hardware().page_erases(20), 0);
    }

    #[test]
    fn test_battery_reports_reference_sample() {
        let mut boot = bootloader();
        boot.hardware_mut().set_supply_volts(3.3);
        let out = exchange(&mut boot, b'B', &[]);
        assert_eq!(out.len(), 4);
        assert_eq!(&out[..2], &[1, ACK]);
        let raw = u16::from_be_bytes([out[2], out[3]]);
        let volts = crate::protocol::optic::battery_volts(raw);
        assert!((volts - 3.3).abs() < 0.02, "got {volts}");
        assert!(!boot.hardware().reference_enabled());
    }

    #[test]
    fn test_speaker_toggles_and_acks_twice() {
        let mut boot = bootloader();
        let out = exchange(&mut boot, b'S', &speaker_payload(10, 1));
        assert_eq!(out, vec![3, ACK, ACK]);
        assert_eq!(boot.hardware().speaker_toggles(), 512);
        assert_eq!(boot.hardware().speaker(), SpeakerDrive::Off);
    }

    #[test]
    fn test_unknown_opcode_naks_without_cancelling_countdown() {
        let mut boot = ready(Bootloader::new(
            SimulatedChip::new(BitTiming::default()),
            BitTiming::default(),
        ));
        let before = boot.countdown();
        boot.hardware_mut().send_light(b"Q");
        let out = run_for(&mut boot, 5);
        assert_eq!(out, vec![0, NAK]);
        assert!(boot.countdown().is_some());
        assert!(boot.countdown() < before);
        assert_eq!(boot.executed(), 0);
        assert_eq!(boot.state(), State::WaitCommand);
    }

    #[test]
    fn test_execute_launches_application() {
        let mut boot = bootloader();
        boot.hardware_mut().send_light(b"X");
        let out = run_for(&mut boot, 5);
        assert_eq!(out, vec![1, ACK]);
        assert!(boot.is_launched());
        assert_eq!(boot.hardware().launches(), 1);
    }

    #[test]
    fn test_countdown_launches_when_idle() {
        let mut boot = Bootloader::new(SimulatedChip::new(BitTiming::default()), BitTiming::default())
            .with_countdown(Some(500));
        boot.run();
        assert!(boot.is_launched());
        assert_eq!(boot.hardware().launches(), 1);
    }

    #[test]
    fn test_completed_command_cancels_countdown() {
        let mut boot = ready(
            Bootloader::new(SimulatedChip::new(BitTiming::default()), BitTiming::default())
                .with_countdown(Some(5_000)),
        );
        let out = exchange(&mut boot, b'B', &[]);
        assert_eq!(&out[..2], &[1, ACK]);
        assert_eq!(out.len(), 4);
        assert_eq!(boot.countdown(), None);
        run_for(&mut boot, 1_000);
        assert!(!boot.is_launched());
    }

    #[test]
    fn test_framing_error_discards_partial_frame() {
        let mut boot = bootloader();
        let payload = write_payload(20, &[0x0123; PAGE_WORDS]);

        boot.hardware_mut().send_light(b"W");
        assert_eq!(run_for(&mut boot, 5), vec![67]);

        // Part of the payload, then a frame whose stop bit reads low.
        boot.hardware_mut().send_light(&payload[..30]);
        let mut broken = frame_bits(0x55);
        broken[9] = false;
        boot.hardware_mut().send_levels(&broken);

        let deadline = boot.hardware().clock() + boot.hardware().millis(100);
        while boot.framing_errors() == 0 && boot.hardware().clock() < deadline {
            boot.poll();
        }
        assert_eq!(boot.framing_errors(), 1);
        assert_eq!(boot.state(), State::WaitMark);
        assert_eq!(boot.executed(), 0);
        assert_eq!(boot.hardware().page_erases(20), 0);

        // Line recovers and a fresh frame is accepted from scratch.
        run_for(&mut boot, 10);
        assert_eq!(boot.state(), State::WaitCommand);
        let out = exchange(&mut boot, b'R', &read_payload(20));
        assert_eq!(&out[..2], &[2, ACK]);
        assert_eq!(out.len(), 67);
        assert_eq!(boot.executed(), 1);
        assert_eq!(boot.hardware().page_erases(20), 0);
    }
}
