//! Bit-level serial codec shared by both ends of the optical link.
//!
//! Frames are 8-N-1: one start bit (low), eight data bits least significant
//! first, one stop bit (high). The device has no UART, so both directions
//! are software timed in units of delay ticks (ten instruction cycles each).

use std::collections::VecDeque;

/// Instruction cycles per delay tick.
pub const CYCLES_PER_TICK: u64 = 10;

/// Bits per frame including start and stop.
pub const FRAME_BITS: usize = 10;

/// Bit timing derived from the instruction clock and the baud rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    /// Instruction clock in Hz (oscillator / 4).
    pub instruction_hz: u32,
    /// Line rate in bits per second.
    pub baud: u32,
    /// Delay ticks consumed by one ADC sample including loop overhead.
    pub sample_ticks: u16,
}

impl Default for BitTiming {
    fn default() -> Self {
        Self {
            instruction_hz: 4_000_000,
            baud: 9600,
            sample_ticks: 13,
        }
    }
}

impl BitTiming {
    /// Delay ticks in one bit period.
    pub fn bit_ticks(&self) -> u16 {
        (u64::from(self.instruction_hz) / CYCLES_PER_TICK / u64::from(self.baud)) as u16
    }

    /// Delay ticks from a start edge to the middle of bit 0.
    ///
    /// 1.3 bit times rather than 1.5 to absorb start detection latency.
    pub fn start_ticks(&self) -> u16 {
        self.bit_ticks() * 13 / 10
    }

    /// Delay after detecting a start bit, before sampling bit 0.
    pub fn first_sample_delay(&self) -> u16 {
        self.start_ticks()
            .saturating_sub(self.sample_ticks)
    }

    /// Delay between consecutive bit samples.
    pub fn inter_sample_delay(&self) -> u16 {
        self.bit_ticks()
            .saturating_sub(self.sample_ticks)
    }

    /// Instruction cycles from a start edge to `half_bits` half bit periods.
    pub fn half_bit_cycles(&self, half_bits: u64) -> u64 {
        half_bits * u64::from(self.instruction_hz) / (2 * u64::from(self.baud))
    }
}

/// Line levels of one frame, in transmit order.
pub fn frame_bits(byte: u8) -> [bool; FRAME_BITS] {
    let mut bits = [true; FRAME_BITS];
    bits[0] = false;
    for (i, bit) in bits[1..=8]
        .iter_mut()
        .enumerate()
    {
        *bit = (byte >> i) & 1 == 1;
    }
    bits
}

/// Recover a byte from ten sampled frame levels.
///
/// Returns `None` on a framing error (start bit high or stop bit low).
pub fn decode_frame(bits: &[bool; FRAME_BITS]) -> Option<u8> {
    if bits[0] || !bits[9] {
        return None;
    }
    Some(
        bits[1..=8]
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, &bit)| acc | (u8::from(bit) << i)),
    )
}

/// Decodes bytes from a timed trace of line levels.
///
/// This is the receiving half of a hardware UART, used to listen to the
/// device's bit-banged output in simulation. Levels are pushed as
/// transitions stamped in instruction cycles; bytes become available once
/// the stop bit has been sampled.
#[derive(Debug)]
pub struct UartDecoder {
    timing: BitTiming,
    transitions: VecDeque<(u64, bool)>,
    level: bool,
    cursor: u64,
    framing_errors: usize,
}

impl UartDecoder {
    /// Create a decoder for an idle (high) line.
    pub fn new(timing: BitTiming) -> Self {
        Self {
            timing,
            transitions: VecDeque::new(),
            level: true,
            cursor: 0,
            framing_errors: 0,
        }
    }

    /// Record the line changing to `level` at cycle `at`.
    pub fn push(&mut self, at: u64, level: bool) {
        let last = self
            .transitions
            .back()
            .map_or(self.level, |&(_, l)| l);
        if last != level {
            self.transitions.push_back((at, level));
        }
    }

    /// Number of frames dropped because the stop bit read low.
    pub fn framing_errors(&self) -> usize {
        self.framing_errors
    }

    /// Decode every frame whose stop bit lies before cycle `now`.
    pub fn decode_until(&mut self, now: u64, out: &mut Vec<u8>) {
        loop {
            let Some(start) = self.next_falling_edge() else {
                return;
            };
            let stop_at = start + self.timing.half_bit_cycles(19);
            if stop_at > now {
                return;
            }

            let mut bits = [true; FRAME_BITS];
            for (k, bit) in bits
                .iter_mut()
                .enumerate()
            {
                *bit = self.level_at(start + self.timing.half_bit_cycles(2 * k as u64 + 1));
            }

            self.cursor = stop_at;
            self.forget_before(stop_at);
            match decode_frame(&bits) {
                Some(byte) => out.push(byte),
                None => self.framing_errors += 1,
            }
        }
    }

    fn next_falling_edge(&self) -> Option<u64> {
        let mut level = self.level;
        for &(at, l) in &self.transitions {
            if at >= self.cursor && level && !l {
                return Some(at);
            }
            level = l;
        }
        None
    }

    fn level_at(&self, at: u64) -> bool {
        self.transitions
            .iter()
            .take_while(|&&(t, _)| t <= at)
            .last()
            .map_or(self.level, |&(_, l)| l)
    }

    fn forget_before(&mut self, at: u64) {
        while let Some(&(t, l)) = self.transitions.front() {
            if t > at {
                break;
            }
            self.level = l;
            self.transitions.pop_front();
        }
    }
}
