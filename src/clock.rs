//! The shared monotonic time source.
//!
//! Every timestamp in the pipeline comes from a single free-running 32-bit
//! counter.  The units are device-specific and never leave the node: only
//! deltas are persisted, and all delta arithmetic is wrapping.  Routing every
//! sample through the [`Clock`] trait lets tests substitute a deterministic
//! counter.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Instant,
};

/// Clock ticks per second for the production clock.
///
/// [`MonotonicClock`] counts microseconds, so intervals expressed in ticks
/// (the save hold, the POST_TIME suppression window) default to multiples of
/// this value.
pub const TICKS_PER_SECOND: u32 = 1_000_000;

/// A free-running monotonic 32-bit counter.
///
/// The counter wraps; consumers must compute deltas with wrapping
/// subtraction and never compare two samples directly.
pub trait Clock: Send + Sync {
    /// Samples the current counter value.
    fn now(&self) -> u32;
}

/// Production clock: microseconds elapsed since the clock was created,
/// truncated to 32 bits.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u32 {
        self.origin.elapsed().as_micros() as u32
    }
}

/// A settable clock for tests.
///
/// Starts at zero and only moves when told to, which makes timestamp-derived
/// encodings (delta varints, low-resolution truncation, save-hold aging)
/// fully deterministic.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU32,
}

impl ManualClock {
    pub fn new(ticks: u32) -> Self {
        Self {
            ticks: AtomicU32::new(ticks),
        }
    }

    /// Sets the counter to an absolute value.
    pub fn set(&self, ticks: u32) {
        self.ticks.store(ticks, Ordering::Release);
    }

    /// Advances the counter, wrapping at 2^32 like the real counter does.
    pub fn advance(&self, ticks: u32) {
        let current = self.ticks.load(Ordering::Acquire);
        self.ticks
            .store(current.wrapping_add(ticks), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u32 {
        self.ticks.load(Ordering::Acquire)
    }
}

impl<C> Clock for std::sync::Arc<C>
where
    C: Clock + ?Sized,
{
    fn now(&self) -> u32 {
        (**self).now()
    }
}
