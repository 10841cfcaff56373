//! Cycle-counting simulation of the target chip and its optical link.
//!
//! [`SimulatedChip`] implements [`Hardware`] on a virtual instruction-cycle
//! clock: delays advance the clock, every ADC conversion costs the sampling
//! overhead from [`BitTiming`], and flash operations take their nominal
//! programming time. The light sensor reads a queue of timed line levels
//! produced by the host side; the output pin is recorded and decoded like a
//! hardware UART would.
//!
//! [`SimulatedPort`] wraps a whole [`Bootloader`] behind the host [`Port`]
//! trait so a download session can run end to end without hardware.

use crate::bootloader::hal::{AnalogChannel, Hardware, SpeakerDrive};
use crate::bootloader::{Bootloader, State};
use crate::error::Result;
use crate::port::Port;
use crate::protocol::optic::{
    APPLICATION_START, ERASED_WORD, FLASH_WORDS, PAGE_COUNT, PAGE_WORDS, battery_raw,
};
use crate::protocol::uart::{BitTiming, CYCLES_PER_TICK, UartDecoder, frame_bits};
use log::trace;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::time::Duration;

/// ADC reading of a lit sensor.
const BRIGHT_SAMPLE: u16 = 0xC040;

/// ADC reading of a dark sensor.
const DARK_SAMPLE: u16 = 0x0800;

/// Instruction cycles to erase one page (2 ms at 4 MIPS).
const ERASE_CYCLES: u64 = 8_000;

/// Instruction cycles per programmed word (a 2 ms row write every 8 words).
const WRITE_CYCLES: u64 = 1_000;

/// Mask of implemented bits in a program word.
const WORD_MASK: u16 = 0x3FFF;

/// Simulated PIC16F182x with an optical receiver.
#[derive(Debug)]
pub struct SimulatedChip {
    timing: BitTiming,
    clock: u64,
    flash: Vec<u16>,
    incoming: VecDeque<bool>,
    incoming_start: u64,
    incoming_consumed: u64,
    bytes_received: usize,
    corrupt: HashSet<usize>,
    dark: bool,
    decoder: UartDecoder,
    supply_volts: f32,
    reference: bool,
    speaker: SpeakerDrive,
    speaker_toggles: u64,
    stuck: HashMap<u16, u16>,
    erases: Vec<u32>,
    launches: usize,
}

impl SimulatedChip {
    /// Create a chip with a bootloader image in the protected pages and
    /// erased application flash.
    pub fn new(timing: BitTiming) -> Self {
        let flash = (0..FLASH_WORDS as u16)
            .map(|addr| {
                if addr < APPLICATION_START {
                    addr & WORD_MASK
                } else {
                    ERASED_WORD
                }
            })
            .collect();

        Self {
            timing,
            clock: 0,
            flash,
            incoming: VecDeque::new(),
            incoming_start: 0,
            incoming_consumed: 0,
            bytes_received: 0,
            corrupt: HashSet::new(),
            dark: false,
            decoder: UartDecoder::new(timing),
            supply_volts: 3.0,
            reference: false,
            speaker: SpeakerDrive::Off,
            speaker_toggles: 0,
            stuck: HashMap::new(),
            erases: vec![0; PAGE_COUNT],
            launches: 0,
        }
    }

    /// Current time in instruction cycles.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Instruction cycles in `ms` milliseconds.
    pub fn millis(&self, ms: u64) -> u64 {
        ms * u64::from(self.timing.instruction_hz) / 1000
    }

    /// Advance the clock without running any code.
    pub fn advance(&mut self, cycles: u64) {
        self.clock += cycles;
    }

    /// Modulate bytes onto the light sensor, after anything already queued.
    pub fn send_light(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            let byte = if self.corrupt.remove(&self.bytes_received) {
                trace!("corrupting incoming byte #{}", self.bytes_received);
                byte ^ 0x10
            } else {
                byte
            };
            self.bytes_received += 1;
            self.send_levels(&frame_bits(byte));
        }
    }

    /// Queue raw line levels, one bit period each.
    pub fn send_levels(&mut self, levels: &[bool]) {
        self.expire_incoming();
        if self.incoming.is_empty() {
            self.incoming_start = self.clock;
            self.incoming_consumed = 0;
        }
        self.incoming.extend(levels);
    }

    /// Flip one data bit of the `index`-th byte ever sent to the chip.
    pub fn corrupt_incoming(&mut self, index: usize) {
        self.corrupt.insert(index);
    }

    /// Cover the sensor (line reads low) regardless of what is queued.
    pub fn hold_dark(&mut self, dark: bool) {
        self.dark = dark;
    }

    /// Bytes decoded from the output pin since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        self.decoder
            .decode_until(self.clock, &mut out);
        out
    }

    /// Set the supply voltage seen by the reference measurement.
    pub fn set_supply_volts(&mut self, volts: f32) {
        self.supply_volts = volts;
    }

    /// Make a flash word read back as `value` whatever is written.
    pub fn stick_word(&mut self, addr: u16, value: u16) {
        self.stuck.insert(addr, value);
    }

    /// Program word at `addr` as stored.
    pub fn word(&self, addr: u16) -> u16 {
        self.stuck
            .get(&addr)
            .copied()
            .unwrap_or(self.flash[usize::from(addr) % FLASH_WORDS])
    }

    /// Load a word directly, bypassing the flash controller.
    pub fn preload(&mut self, addr: u16, value: u16) {
        self.flash[usize::from(addr) % FLASH_WORDS] = value & WORD_MASK;
    }

    /// How many times page `page` has been erased.
    pub fn page_erases(&self, page: u8) -> u32 {
        self.erases[usize::from(page) % PAGE_COUNT]
    }

    /// Whether the fixed reference is currently enabled.
    pub fn reference_enabled(&self) -> bool {
        self.reference
    }

    /// Current speaker drive.
    pub fn speaker(&self) -> SpeakerDrive {
        self.speaker
    }

    /// Number of forward/reverse speaker transitions driven.
    pub fn speaker_toggles(&self) -> u64 {
        self.speaker_toggles
    }

    /// Number of jumps to the application.
    pub fn launches(&self) -> usize {
        self.launches
    }

    /// Drop queued bits whose period has fully passed.
    fn expire_incoming(&mut self) {
        while !self.incoming.is_empty() {
            let end = self.incoming_start
                + self
                    .timing
                    .half_bit_cycles(2 * (self.incoming_consumed + 1));
            if end > self.clock {
                break;
            }
            self.incoming.pop_front();
            self.incoming_consumed += 1;
        }
    }

    fn line_level(&mut self) -> bool {
        self.expire_incoming();
        !self.dark
            && self
                .incoming
                .front()
                .copied()
                .unwrap_or(true)
    }
}

impl Hardware for SimulatedChip {
    fn sample_analog(&mut self, channel: AnalogChannel) -> u16 {
        let sample = match channel {
            AnalogChannel::LightSensor => {
                if self.line_level() {
                    BRIGHT_SAMPLE
                } else {
                    DARK_SAMPLE
                }
            },
            AnalogChannel::Reference if self.reference => battery_raw(self.supply_volts),
            AnalogChannel::Reference => 0,
        };
        self.clock += u64::from(self.timing.sample_ticks) * CYCLES_PER_TICK;
        sample
    }

    fn set_reference(&mut self, enabled: bool) {
        self.reference = enabled;
    }

    fn set_line(&mut self, level: bool) {
        self.decoder
            .push(self.clock, level);
    }

    fn set_speaker(&mut self, drive: SpeakerDrive) {
        if drive != SpeakerDrive::Off {
            self.speaker_toggles += 1;
        }
        self.speaker = drive;
    }

    fn delay(&mut self, ticks: u16) {
        self.clock += u64::from(ticks) * CYCLES_PER_TICK;
    }

    fn erase_page(&mut self, addr: u16) {
        let base = usize::from(addr) / PAGE_WORDS * PAGE_WORDS % FLASH_WORDS;
        self.flash[base..base + PAGE_WORDS].fill(ERASED_WORD);
        self.erases[base / PAGE_WORDS] += 1;
        self.clock += ERASE_CYCLES;
    }

    fn write_word(&mut self, addr: u16, value: u16) {
        self.preload(addr, value);
        self.clock += WRITE_CYCLES;
    }

    fn read_word(&mut self, addr: u16) -> u16 {
        self.word(addr)
    }

    fn launch_firmware(&mut self) {
        self.reference = false;
        self.speaker = SpeakerDrive::Off;
        self.decoder
            .push(self.clock, true);
        self.launches += 1;
    }
}

/// Host port connected to a simulated device.
///
/// Every `bytes_available` or `read` call runs the device for one
/// millisecond of simulated time, standing in for the wall-clock time a
/// real port would let pass between polls.
pub struct SimulatedPort {
    device: Bootloader<SimulatedChip>,
    rx: VecDeque<u8>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
    slice: u64,
}

impl SimulatedPort {
    /// Connect to a freshly powered simulated device.
    pub fn new(chip: SimulatedChip) -> Self {
        let timing = chip.timing;
        Self::with_bootloader(Bootloader::new(chip, timing))
    }

    /// Connect to an already configured bootloader.
    ///
    /// The line is left idle for one slice first so the device has seen a
    /// mark before the host sends anything.
    pub fn with_bootloader(device: Bootloader<SimulatedChip>) -> Self {
        let chip = device.hardware();
        let slice = chip.millis(1);
        let baud_rate = chip.timing.baud;
        let mut port = Self {
            device,
            rx: VecDeque::new(),
            name: "sim".to_string(),
            timeout: Duration::from_millis(1000),
            baud_rate,
            slice,
        };
        port.step();
        port
    }

    /// The simulated device.
    pub fn device(&self) -> &Bootloader<SimulatedChip> {
        &self.device
    }

    /// Mutable access to the simulated device.
    pub fn device_mut(&mut self) -> &mut Bootloader<SimulatedChip> {
        &mut self.device
    }

    /// Consume the port and return the device.
    pub fn into_device(self) -> Bootloader<SimulatedChip> {
        self.device
    }

    /// Let the device run for `ms` milliseconds without host activity.
    pub fn idle(&mut self, ms: u64) {
        for _ in 0..ms {
            self.step();
        }
    }

    fn step(&mut self) {
        let until = self
            .device
            .hardware()
            .clock()
            + self.slice;
        while self
            .device
            .hardware()
            .clock()
            < until
        {
            if self.device.poll() == State::Launched {
                let now = self
                    .device
                    .hardware()
                    .clock();
                self.device
                    .hardware_mut()
                    .advance(until.saturating_sub(now));
                break;
            }
        }
        let out = self
            .device
            .hardware_mut()
            .take_output();
        self.rx.extend(out);
    }
}

impl Port for SimulatedPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        self.step();
        Ok(self.rx.len())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Read for SimulatedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            self.step();
        }
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf
            .iter_mut()
            .zip(self.rx.drain(..n))
        {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device
            .hardware_mut()
            .send_light(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
