use std::ops::{Bound, RangeBounds};

use rand::Rng;

use crate::sim::interrupt::InterruptController;

use super::ExternalDevice;

#[derive(Clone, Copy)]
struct SampleRange {
    start: u32,
    end: u32,
    end_incl: bool
}
impl SampleRange {
    fn new(r: impl RangeBounds<u32>) -> Self {
        let start = match r.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.saturating_add(1),
            Bound::Unbounded    => 0,
        };
        let (end, end_incl) = match r.end_bound() {
            Bound::Included(&s) => (s, true),
            Bound::Excluded(&s) => (s, false),
            Bound::Unbounded => (u32::MAX, true),
        };

        // empty ranges collapse to their start
        match (end_incl, start < end, start == end) {
            (true, false, false) | (false, false, _) => Self { start, end: start, end_incl: true },
            _ => Self { start, end, end_incl }
        }
    }
}
impl std::fmt::Debug for SampleRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleRange { start, end, end_incl: true } => (start..=end).fmt(f),
            SampleRange { start, end, end_incl: false } => (start..end).fmt(f),
        }
    }
}
impl RangeBounds<u32> for SampleRange {
    fn start_bound(&self) -> Bound<&u32> {
        Bound::Included(&self.start)
    }

    fn end_bound(&self) -> Bound<&u32> {
        match self.end_incl {
            true => Bound::Included(&self.end),
            false => Bound::Excluded(&self.end),
        }
    }
}

/// A timer device that raises a timer interrupt after a configured number (or range) of instructions.
///
/// The interrupt carries the number of instructions the timer waited.
///
/// If the interrupt is rejected because a timer interrupt is already pending,
/// the timer tries again after the next instruction instead of starting a new interval.
#[derive(Debug)]
pub struct TimerDevice {
    generator: Box<rand::rngs::StdRng>,
    range: SampleRange,
    interval: u32,
    time: u32,

    /// Whether this timer can trigger an interrupt.
    pub enabled: bool,
}
impl TimerDevice {
    /// Creates a new timer device.
    /// - `seed`: Sets the seed for the timer's RNG. This can be `None`
    ///     if RNG does not need to be deterministic or if range can only be exactly one value.
    /// - `range`: Sets the range of possible number of instructions before interrupt trigger.
    ///
    /// The timer starts out disabled.
    pub fn new(seed: Option<u64>, range: impl RangeBounds<u32>) -> Self {
        use rand::SeedableRng;
        use rand::rngs::StdRng;

        let generator = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let mut timer = Self {
            generator: Box::new(generator),
            range: SampleRange::new(range),
            interval: 0,
            time: 0,
            enabled: false
        };
        timer.reset_remaining();

        timer
    }

    /// Gets the range of possible number of instructions before the interrupt is triggered.
    pub fn get_range(&self) -> impl RangeBounds<u32> {
        self.range
    }
    /// Sets the number of instructions before the interrupt is triggered to a range of values.
    pub fn set_range(&mut self, r: impl RangeBounds<u32>) -> &mut Self {
        self.range = SampleRange::new(r);
        self
    }
    /// Sets the number of instructions before the interrupt is triggered to an exact number.
    pub fn set_exact(&mut self, n: u32) -> &mut Self {
        self.set_range(n..=n)
    }

    /// Gets the number of instructions remaining until the interrupt triggers.
    pub fn get_remaining(&self) -> u32 {
        self.time
    }
    /// Starts a new interval.
    pub fn reset_remaining(&mut self) {
        self.interval = self.try_generate_time();
        self.time = self.interval;
    }
    /// Generates a new random time.
    fn try_generate_time(&mut self) -> u32 {
        match self.range {
            SampleRange { start, end, end_incl: true } => self.generator.gen_range(start..=end),
            SampleRange { start, end, end_incl: false } => self.generator.gen_range(start..end),
        }
    }
}
impl Default for TimerDevice {
    /// Creates a timer with default parameters.
    ///
    /// The default parameters here are:
    /// - non-deterministic RNG
    /// - Triggers a timer interrupt every 50 instructions
    /// - Disabled
    fn default() -> Self {
        Self::new(None, 50..=50)
    }
}
impl ExternalDevice for TimerDevice {
    fn io_read(&mut self, _offset: u32, _effectful: bool) -> Option<u32> {
        None
    }

    fn io_write(&mut self, _offset: u32, _data: u32) -> bool {
        false
    }

    fn io_reset(&mut self) {
        self.reset_remaining();
    }

    fn poll_interrupt(&mut self, ctrl: &InterruptController, _mmio_base: u32) {
        if !self.enabled { return };

        match self.time {
            0 | 1 => {
                self.time = 0;
                if ctrl.register_timer(self.interval) {
                    self.reset_remaining();
                }
            },
            _ => self.time -= 1,
        }
    }
}
