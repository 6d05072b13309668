//! # Air-quality event logging and durability pipeline
//!
//! This library implements the data path of a small networked sensor node:
//! events from sensor producers are compressed into fixed-size buffers, the
//! buffers are persisted to a ring of flash sectors, and the sectors are
//! shipped to a remote collector which acknowledges them with a cursor.
//!
//! ## Design constraints
//!
//! These constraints, or more often, invariants, are the groundwork for
//! ensuring that the design can stay simple and understandable:
//! - one RAM buffer is exactly one flash sector (4096 bytes by default)
//! - unused buffer bytes are kept at `0xFF` so a partially-filled buffer can
//!   be re-programmed in place on NOR-style storage (one-to-zero bit
//!   transitions only)
//! - every event header starts with a byte that has at least one zero bit in
//!   its low five bits, so a `0xFF` byte unambiguously terminates the stream
//! - buffer indices are monotonically increasing, process-wide, and stored
//!   redundantly as `(index, !index)` in the first eight bytes
//! - producers append, the flusher drains to flash, the poster drains flash
//!   to the network; control flow is strictly forward
//!
//! ## Pipeline stages
//!
//! At a high level, producers call [`RamRing::append`] (usually through an
//! [`EventWriter`] handle which hides the rotation/retry protocol).  The
//! flusher task copies completed (or sufficiently aged) buffers into the
//! flash sector ring, rewriting the current sector in place when only a
//! suffix changed.  The poster task picks the oldest unacknowledged sector,
//! signs it with a keyed SHA3-224 tag, POSTs it over plain TCP, and records
//! the `(index, size)` cursor the collector returns.
//!
//! Data loss is allowed by design in two places: the RAM ring drops its
//! oldest buffer if the flusher cannot keep up, and a sector that fails to
//! program after repeated retries is abandoned.  Everything else is covered
//! by the recovery paths: sector headers that do not decode as bitwise
//! complements are ignored at startup, and the poster cursor is re-derived
//! from the collector's acknowledgements.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod clock;
pub mod codec;
pub mod flash;
pub mod pipeline;
pub mod poster;
pub mod ring;
#[cfg(test)]
mod test_util;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use pipeline::{
    ConfigBuildError, Pipeline, PipelineConfig, PipelineConfigBuilder, StartError, StartupInfo,
};
pub use poster::{PosterConfig, PosterConfigError, WallClockHint};
pub use ring::{EventFlags, EventWriter, RamRing, RingConfig, WriteCandidate};

/// Plantower PMS3003 particle counter sample.
pub const EVENT_PMS3003: u16 = 1;

/// Plantower PMS1003/PMS5003/PMS7003 particle counter sample.
pub const EVENT_PMS5003: u16 = 2;

/// Collector round-trip time correlation, logged by the poster.
///
/// Payload: `sent_time(4) ‖ recv_sec(4) ‖ recv_usec(4)`, little-endian.
pub const EVENT_POST_TIME: u16 = 3;

/// Node startup, logged once per boot.
///
/// Payload: reset-info blob followed by a little-endian `u32` clock
/// calibration value.
pub const EVENT_STARTUP: u16 = 4;
