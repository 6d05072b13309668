//! The in-RAM ring of append-only buffers.
//!
//! Data is collected into buffers the size of one flash sector.  The ring
//! holds a small FIFO of them: the head is the only buffer being appended
//! to, the tail is the oldest buffer not yet fully saved.  If the flusher
//! cannot keep up and the ring wraps, the tail buffer is dropped; losing old
//! data is preferred over stalling producers.
//!
//! Appending is a compare-and-retry protocol.  A producer computes its
//! payload (possibly delta-encoded against earlier events it wrote) against
//! a buffer index it observed, and passes that index to [`RamRing::append`].
//! If the head has moved on, nothing is written and the new index comes
//! back; the producer must reset any per-buffer encoding state and retry.
//! [`EventWriter`] packages that loop.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;

use crate::{
    clock::{Clock, TICKS_PER_SECOND},
    codec::{self, BLOCK_INDEX_LEN, LOW_RES_MASK, MAX_HEADER_LEN},
};

/// Buffer size in bytes; must equal the flash sector size.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Number of buffers in the ring.
pub const DEFAULT_NUM_BUFFERS: usize = 4;

/// How long the head buffer may sit with unsaved events before the flusher
/// saves it even though it is not full, in clock ticks.
pub const DEFAULT_SAVE_HOLD_TICKS: u32 = 120 * TICKS_PER_SECOND;

/// Per-event append options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventFlags {
    /// Allow the timestamp's low 13 bits to be cleared for a more compact
    /// encoding, effectively moving the event back in time a little.  The
    /// truncation is skipped whenever it would step backwards past the
    /// previous event's time.
    pub low_res_time: bool,
    /// Skip the append entirely if the previous event in the same buffer has
    /// the same code and size.  Used for events that acknowledge server
    /// responses, so an idle node does not fill its log with only those.
    pub no_repeat: bool,
}

/// RAM ring tuning.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RingConfig {
    /// Size of each buffer; must equal the flash sector size.
    pub buffer_size: usize,
    /// Number of buffers in the FIFO; at least two.
    pub num_buffers: usize,
    /// Age, in clock ticks, after which a partially filled head buffer is
    /// offered to the flusher.
    pub save_hold_ticks: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            num_buffers: DEFAULT_NUM_BUFFERS,
            save_hold_ticks: DEFAULT_SAVE_HOLD_TICKS,
        }
    }
}

/// A buffer the flusher should save, copied out of the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteCandidate {
    /// The buffer's index.
    pub index: u32,
    /// Number of valid bytes, including the eight-byte index.
    pub size: usize,
    /// Number of bytes already durably saved.
    pub start: usize,
}

struct Dbuf {
    /// Initialized to all-ones bits; the first eight bytes carry the
    /// redundant index, everything past `size` stays `0xFF`.
    data: Box<[u8]>,
    size: usize,
    save_size: usize,
    /// Timestamp of the oldest event not yet saved, used to age-trigger a
    /// save of a partially filled head.
    write_time: u32,
}

impl Dbuf {
    fn new(buffer_size: usize) -> Self {
        Self {
            data: vec![0xff; buffer_size].into_boxed_slice(),
            size: 0,
            save_size: 0,
            write_time: 0,
        }
    }

    fn reset(&mut self, index: u32, time: u32) {
        self.data.fill(0xff);
        codec::encode_block_index(&mut self.data, index);
        self.size = BLOCK_INDEX_LEN;
        self.save_size = 0;
        self.write_time = time;
    }

    fn index(&self) -> u32 {
        u32::from_le_bytes(self.data[0..4].try_into().expect("buffer holds an index"))
    }
}

struct RingState {
    bufs: Vec<Dbuf>,
    head: usize,
    tail: usize,
    /// Prior-event state for the repeat-header compression; reset whenever
    /// the head buffer changes, since each buffer stands alone.
    last_code: u16,
    last_size: u32,
    last_time: u32,
}

impl RingState {
    fn next_slot(&self, slot: usize) -> usize {
        (slot + 1) % self.bufs.len()
    }

    /// Moves the head to a fresh buffer carrying `index`, dropping the tail
    /// if the ring wrapped.  The head buffer is reused in place when it is
    /// the only live buffer and fully saved; retaining a fully saved
    /// non-reused head would break the drain ordering.
    fn rotate(&mut self, index: u32, time: u32) {
        let head = &self.bufs[self.head];
        let reuse = self.head == self.tail && head.size == head.save_size;
        if !reuse {
            self.head = self.next_slot(self.head);
            if self.head == self.tail {
                trace!(
                    dropped_index = self.bufs[self.tail].index(),
                    "RAM ring wrapped; dropping oldest buffer."
                );
                self.tail = self.next_slot(self.tail);
            }
        }
        self.bufs[self.head].reset(index, time);
        self.last_code = 0;
        self.last_size = 0;
        self.last_time = 0;
    }
}

/// The ring of in-RAM buffers shared by all producers.
pub struct RamRing {
    buffer_size: usize,
    save_hold: u32,
    clock: Arc<dyn Clock>,
    state: Mutex<RingState>,
    data_notify: Notify,
}

impl RamRing {
    /// Creates the ring with its head carrying `first_index`.
    ///
    /// `first_index` must be above every index already on flash so that
    /// index assignment stays process-wide monotonic across reboots.
    pub fn new(config: &RingConfig, clock: Arc<dyn Clock>, first_index: u32) -> Self {
        debug_assert!(config.num_buffers >= 2);
        debug_assert!(config.buffer_size > BLOCK_INDEX_LEN + MAX_HEADER_LEN);

        let mut bufs: Vec<_> = (0..config.num_buffers)
            .map(|_| Dbuf::new(config.buffer_size))
            .collect();
        bufs[0].reset(first_index, clock.now());

        Self {
            buffer_size: config.buffer_size,
            save_hold: config.save_hold_ticks,
            clock,
            state: Mutex::new(RingState {
                bufs,
                head: 0,
                tail: 0,
                last_code: 0,
                last_size: 0,
                last_time: 0,
            }),
            data_notify: Notify::new(),
        }
    }

    /// The index of the buffer currently accepting events.
    pub fn head_index(&self) -> u32 {
        let state = self.state.lock();
        state.bufs[state.head].index()
    }

    /// Appends one event, or tells the caller to re-encode.
    ///
    /// The caller asserts the head index it encoded against.  On a mismatch,
    /// or when the event does not fit and the ring rotates, the current head
    /// index is returned and nothing is written; the caller must reset any
    /// delta-encoding state and retry against the returned index.  The
    /// returned index equals `expected_index` exactly when the event was
    /// consumed (written, suppressed by `no_repeat`, or dropped as
    /// oversized).
    pub fn append(&self, expected_index: u32, code: u16, payload: &[u8], flags: EventFlags) -> u32 {
        debug_assert!(codec::code_is_encodable(code));

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let current_index = state.bufs[state.head].index();
        if expected_index != current_index {
            return current_index;
        }

        let raw_time = self.clock.now();
        let mut time = raw_time;
        if flags.low_res_time {
            // Truncating can only step backwards past the previous event if
            // the previous time has nonzero low bits and shares the same
            // high bits; skip it then, as a backward step would decode as a
            // wrap and a huge forward jump.
            if state.last_time & LOW_RES_MASK == 0
                || state.last_time & !LOW_RES_MASK != time & !LOW_RES_MASK
            {
                time &= !LOW_RES_MASK;
            }
        }
        let delta = time.wrapping_sub(state.last_time);

        let size = payload.len() as u32;
        let repeat = code == state.last_code && size == state.last_size;
        if repeat && flags.no_repeat {
            return expected_index;
        }

        let truncated = flags.low_res_time && delta & LOW_RES_MASK == 0;
        let mut header = [0u8; MAX_HEADER_LEN];
        let header_len = codec::encode_event_header(&mut header, repeat, truncated, code, size, delta);
        let total = header_len + payload.len();

        if total > self.buffer_size - BLOCK_INDEX_LEN {
            // Cannot ever fit; consume it so the producer does not spin.
            warn!(code, size = payload.len(), "Dropping oversized event.");
            return expected_index;
        }

        if state.bufs[state.head].size + total > self.buffer_size {
            let next_index = expected_index.wrapping_add(1);
            state.rotate(next_index, raw_time);
            return next_index;
        }

        let head = &mut state.bufs[state.head];
        if head.size <= BLOCK_INDEX_LEN || head.size == head.save_size {
            // First write to the buffer, or first since the last save; pin
            // the age so fresh content is not saved immediately.
            head.write_time = time;
        }
        head.data[head.size..head.size + header_len].copy_from_slice(&header[..header_len]);
        head.data[head.size + header_len..head.size + total].copy_from_slice(payload);
        head.size += total;

        state.last_code = code;
        state.last_size = size;
        state.last_time = time;
        drop(guard);

        self.data_notify.notify_one();
        expected_index
    }

    /// Picks the next buffer worth saving and copies it into `out`.
    ///
    /// Buffers come back in index order: the tail first if it has unsaved
    /// bytes, otherwise the head once it has real content, unsaved bytes,
    /// and has been idle past the save hold.  The full buffer is always
    /// copied (trailing `0xFF` included) because a failed flash write means
    /// the whole buffer moves to the next sector.
    pub fn get_buffer_to_write(&self, out: &mut [u8]) -> Option<WriteCandidate> {
        debug_assert_eq!(out.len(), self.buffer_size);
        let state = self.state.lock();

        if state.tail != state.head {
            let tail = &state.bufs[state.tail];
            if tail.size > tail.save_size {
                out.copy_from_slice(&tail.data);
                return Some(WriteCandidate {
                    index: tail.index(),
                    size: tail.size,
                    start: tail.save_size,
                });
            }
            return None;
        }

        let head = &state.bufs[state.head];
        if head.size > BLOCK_INDEX_LEN && head.size > head.save_size {
            let age = self.clock.now().wrapping_sub(head.write_time);
            if age > self.save_hold {
                out.copy_from_slice(&head.data);
                return Some(WriteCandidate {
                    index: head.index(),
                    size: head.size,
                    start: head.save_size,
                });
            }
        }
        None
    }

    /// Records that `size` bytes of the buffer carrying `index` are durably
    /// on flash.
    ///
    /// Frees fully saved buffers from the tail; the head is never freed as
    /// it likely has room for more events.  A no-op when the index is no
    /// longer in the ring, which happens if the ring wrapped while the
    /// flusher was writing.
    pub fn note_buffer_written(&self, index: u32, size: usize) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut slot = state.tail;
        loop {
            if state.bufs[slot].index() == index {
                break;
            }
            if slot == state.head {
                return;
            }
            slot = state.next_slot(slot);
        }

        state.bufs[slot].save_size = size;
        // More content may have been appended since the copy was taken, so
        // this can be a little late for some of it; that only delays the
        // next age-triggered save.
        state.bufs[slot].write_time = self.clock.now();

        while state.tail != state.head {
            let tail = &state.bufs[state.tail];
            if tail.save_size == tail.size {
                state.tail = state.next_slot(state.tail);
            } else {
                break;
            }
        }
    }

    /// Resolves when a producer has appended new data since the last call.
    pub async fn data_ready(&self) {
        self.data_notify.notified().await;
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let state = self.state.lock();
        let mut slot = state.tail;
        let mut previous: Option<u32> = None;
        loop {
            let buf = &state.bufs[slot];
            assert!(buf.save_size <= buf.size);
            assert!(buf.size <= self.buffer_size);
            assert!(buf.size >= BLOCK_INDEX_LEN);
            assert!(
                buf.data[buf.size..].iter().all(|&b| b == 0xff),
                "unused region must stay erased"
            );
            if let Some(prev) = previous {
                assert_eq!(
                    buf.index(),
                    prev.wrapping_add(1),
                    "live buffer indices must be consecutive"
                );
            }
            previous = Some(buf.index());
            if slot == state.head {
                break;
            }
            slot = state.next_slot(slot);
        }
    }
}

/// A producer handle that hides the append retry protocol.
///
/// Each producer task owns one writer.  The writer tracks the buffer index
/// its events were encoded against and retries transparently when the ring
/// rotates underneath it.
pub struct EventWriter {
    ring: Arc<RamRing>,
    index: u32,
}

impl EventWriter {
    pub fn new(ring: Arc<RamRing>) -> Self {
        let index = ring.head_index();
        Self { ring, index }
    }

    /// Appends an event whose payload does not depend on buffer-local state.
    pub fn append(&mut self, code: u16, payload: &[u8], flags: EventFlags) {
        loop {
            let result = self.ring.append(self.index, code, payload, flags);
            if result == self.index {
                return;
            }
            self.index = result;
        }
    }

    /// Appends an event re-encoding its payload on every rotation.
    ///
    /// `encode` is called once up front and again each time the ring moves
    /// to a new buffer, so producers that delta-encode against their own
    /// earlier events can reset that state and produce a standalone payload
    /// for the fresh buffer.
    pub fn append_with<F>(&mut self, code: u16, flags: EventFlags, mut encode: F)
    where
        F: FnMut() -> Vec<u8>,
    {
        let mut payload = encode();
        loop {
            let result = self.ring.append(self.index, code, &payload, flags);
            if result == self.index {
                return;
            }
            self.index = result;
            payload = encode();
        }
    }

    /// The buffer index this writer last encoded against.
    pub fn current_index(&self) -> u32 {
        self.index
    }
}
