//! # The flash sector ring
//!
//! Completed RAM buffers are written to a ring of erase blocks on persistent
//! storage.  Blocks remain there even after the collector acknowledges them,
//! until the ring wraps and overwrites them; that gives the collector a
//! window to request old data again, and supports local inspection.
//!
//! ## Finding the head
//!
//! In operation only the head of the ring matters.  At startup it has to be
//! recovered as reliably as possible, which is what the redundant
//! monotonically increasing index in the first eight bytes of every sector
//! is for: scan everything, take the largest index that decodes, and start
//! one past it.  The index is not expected to wrap in practical usage (a
//! sector a minute for eight thousand years), which avoids handling index
//! wraparound here.  If a write fails the same index is retried on the next
//! sector, after erasing the failed one so its index no longer decodes.
//!
//! ## Partial writes
//!
//! Sectors carry no length field; the event stream is terminated by the
//! `0xFF` erased-cell padding, and a sector whose buffer gained more events
//! since the last save is re-programmed in place.  That is sound because
//! programming NOR flash can only clear bits and the unprogrammed tail is
//! still all-ones.  Every program cycle is verified by reading the sector
//! back; on a mismatch the sector is sacrificed and the whole buffer moves
//! to the next one.
//!
//! ## Posting order
//!
//! The poster asks for the oldest block past the collector's cursor.  The
//! search walks backward from the head while the indices decrease one by
//! one; a break in that ordering means the older data is corrupt and the
//! walk stops.  An unreadable block is reported to the collector as a
//! four-byte stub carrying just its index, and the cursor skips past it so
//! the poster cannot spin on it.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Deserialize;
use tokio::sync::{Mutex, Notify};

use crate::{
    codec::{self, BLOCK_INDEX_LEN},
    ring::{RamRing, WriteCandidate},
};

mod media;

pub use media::{FaultKind, FaultOp, FileFlash, FlashMedia, MediaError, MemoryFlash};

#[cfg(test)]
mod tests;

/// Default number of sectors in the ring.
///
/// Sized for a 4 MB part: 1024 sectors, minus 256 reserved at the front for
/// code, minus 9 at the end for system parameters and calibration data.
pub const DEFAULT_SECTOR_COUNT: u32 = 759;

/// Default wait between unsignaled drain passes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(120);

/// How far past the newest index recovery scans for a duplicate.
///
/// A bad sector causes its index to be reused on the next sector; if the bad
/// sector later reads back as valid anyway, the duplicate with the higher
/// sector position is the live one.
const RECOVERY_FORWARD_SCAN: u32 = 128;

/// Fresh-sector write attempts before a buffer is abandoned.
const MAX_WRITE_RETRIES: u32 = 32;

/// Flash ring tuning.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlashConfig {
    /// Upper bound on how long the flusher sleeps between drain passes when
    /// no producer signals new data.
    pub flush_interval: Duration,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// The confirmed prefix acknowledged by the collector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PostCursor {
    index: u32,
    size: u32,
}

/// A block chosen for posting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostCandidate {
    /// The block's index.
    pub index: u32,
    /// Byte offset within the block where the returned slice starts,
    /// word-aligned down from the acknowledged size.
    pub start: u32,
    /// Length of the slice, with trailing erased bytes stripped.
    pub size: usize,
}

/// Counters for the failure recovery paths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlashStats {
    /// Erase or program cycles that failed or did not verify.
    pub write_failures: u64,
    /// Failed sectors whose index could not be invalidated by erasing.
    pub invalidate_failures: u64,
}

struct FlashState {
    /// Sector the next write lands in.
    head: u32,
    /// Whether the head sector already holds a verified copy of the current
    /// buffer.  Cleared whenever the head moves; a fresh head is not touched
    /// until there is data for it, which keeps unused sectors unworn.
    initialized: bool,
    cursor: PostCursor,
    /// Whether a drain has stored data the poster has not yet seen.  Lets
    /// the poster skip the sector scan when there is definitely nothing to
    /// do.
    maybe_to_post: bool,
}

/// The durable stage of the pipeline.
///
/// One flusher task drains the RAM ring into sectors; the poster and the
/// status queries read them back.  All head and cursor state lives behind a
/// single async mutex because it is consulted and updated across flash I/O.
pub struct FlashRing<M: FlashMedia> {
    media: M,
    flush_interval: Duration,
    state: Mutex<FlashState>,
    post_notify: Notify,
    write_failures: AtomicU64,
    invalidate_failures: AtomicU64,
}

fn next_sector(sector: u32, count: u32) -> u32 {
    if sector + 1 >= count {
        0
    } else {
        sector + 1
    }
}

fn previous_sector(sector: u32, count: u32) -> u32 {
    if sector == 0 {
        count - 1
    } else {
        sector - 1
    }
}

fn stripped_len(buf: &[u8]) -> usize {
    let mut size = buf.len();
    while size > 0 && buf[size - 1] == 0xff {
        size -= 1;
    }
    size
}

async fn decode_sector_index<M: FlashMedia>(media: &M, sector: u32) -> Option<u32> {
    let mut words = [0u8; BLOCK_INDEX_LEN];
    // A sector that cannot be read is treated the same as one that does not
    // decode.
    media.read(sector, 0, &mut words).await.ok()?;
    codec::decode_block_index(&words)
}

impl<M: FlashMedia> FlashRing<M> {
    /// Opens the ring, recovering the write head from whatever the sectors
    /// hold.
    ///
    /// Returns the ring and the next block index to assign, one past the
    /// largest index found; the RAM ring must start there so indices stay
    /// monotonic across reboots.
    pub async fn open(media: M, config: &FlashConfig) -> (Self, u32) {
        let count = media.sector_count();

        let mut most_recent: Option<(u32, u32)> = None;
        for sector in 0..count {
            if let Some(index) = decode_sector_index(&media, sector).await {
                match most_recent {
                    Some((_, largest)) if index < largest => {}
                    _ => most_recent = Some((sector, index)),
                }
            }
        }

        let (head, next_index) = match most_recent {
            Some((sector, largest)) => {
                // A duplicate of the largest index further along the ring
                // means a failed sector was retried; the copy written last
                // is the one the head must follow.
                let mut best = sector;
                let mut probe = next_sector(sector, count);
                // Never probe more than one full lap, or the last probe
                // position would win instead of the last written duplicate.
                for _ in 0..RECOVERY_FORWARD_SCAN.min(count.saturating_sub(1)) {
                    if decode_sector_index(&media, probe).await == Some(largest) {
                        best = probe;
                    }
                    probe = next_sector(probe, count);
                }
                debug!(
                    sector = best,
                    index = largest,
                    "Recovered most recent sector."
                );
                (next_sector(best, count), largest.wrapping_add(1))
            }
            None => {
                debug!("No valid sectors found; starting empty.");
                (0, 0)
            }
        };

        let ring = Self {
            media,
            flush_interval: config.flush_interval,
            state: Mutex::new(FlashState {
                head,
                initialized: false,
                cursor: PostCursor::default(),
                // Assume there may be unposted data after a reboot; the
                // first drain pass settles the truth.
                maybe_to_post: true,
            }),
            post_notify: Notify::new(),
            write_failures: AtomicU64::new(0),
            invalidate_failures: AtomicU64::new(0),
        };
        (ring, next_index)
    }

    /// Runs the flusher: wait for new data (or the flush interval), then
    /// drain every pending buffer to flash.
    pub async fn run_flusher(self: Arc<Self>, ring: Arc<RamRing>) {
        loop {
            let _ = tokio::time::timeout(self.flush_interval, ring.data_ready()).await;
            self.drain(&ring).await;
        }
    }

    /// Drains every buffer the RAM ring offers, returning how many blocks
    /// were processed.
    ///
    /// Every processed buffer is acknowledged back to the RAM ring, even
    /// when all write attempts failed; dropping data beats wedging the
    /// pipeline behind an unwritable sector.
    pub async fn drain(&self, ring: &RamRing) -> usize {
        let mut copy = vec![0u8; self.media.sector_size()];
        let mut processed = 0;
        while let Some(candidate) = ring.get_buffer_to_write(&mut copy) {
            self.write_block(&copy, candidate).await;
            ring.note_buffer_written(candidate.index, candidate.size);
            self.post_notify.notify_one();
            processed += 1;
        }
        processed
    }

    async fn write_block(&self, buf: &[u8], candidate: WriteCandidate) {
        let WriteCandidate { index, size, start } = candidate;
        let count = self.media.sector_count();
        let mut state = self.state.lock().await;

        if state.initialized {
            if decode_sector_index(&self.media, state.head).await == Some(index) {
                // The buffer gained content since its last save; program
                // just the changed suffix, word-aligned.
                let aligned_start = start & !3;
                let aligned_end = (size + 3) & !3;
                let programmed = self
                    .media
                    .program(state.head, aligned_start, &buf[aligned_start..aligned_end])
                    .await;
                if programmed.is_ok() && self.verify_sector(state.head, buf).await {
                    state.maybe_to_post = true;
                    return;
                }
                self.handle_write_failure(&mut state).await;
            } else {
                // The head sector holds an older index (or none); move on.
                state.head = next_sector(state.head, count);
                state.initialized = false;
            }
        }

        // At an uninitialized sector with a full buffer to write.
        let mut retries = 0;
        loop {
            if !self.sector_erased(state.head).await {
                if let Err(error) = self.media.erase(state.head).await {
                    debug!(%error, sector = state.head, "Erase failed; attempting the write anyway.");
                }
            }
            let programmed = self.media.program(state.head, 0, &buf[..size]).await;
            if programmed.is_ok() && self.verify_sector(state.head, buf).await {
                state.initialized = true;
                break;
            }
            self.handle_write_failure(&mut state).await;
            retries += 1;
            if retries > MAX_WRITE_RETRIES {
                error!(index, "Abandoning block after repeated write failures.");
                break;
            }
        }
        state.maybe_to_post = true;
    }

    /// Reads a sector back and compares it against the full buffer image.
    async fn verify_sector(&self, sector: u32, expected: &[u8]) -> bool {
        let mut readback = vec![0u8; self.media.sector_size()];
        match self.media.read(sector, 0, &mut readback).await {
            Ok(()) => readback == expected,
            Err(_) => false,
        }
    }

    async fn sector_erased(&self, sector: u32) -> bool {
        let mut readback = vec![0u8; self.media.sector_size()];
        match self.media.read(sector, 0, &mut readback).await {
            Ok(()) => readback.iter().all(|&b| b == 0xff),
            Err(_) => false,
        }
    }

    /// Neutralizes the current head sector after a failed write and moves
    /// past it.
    ///
    /// The erase matters more than the data: if the sector's index still
    /// decodes it would shadow the retried copy at recovery, so a failure to
    /// invalidate it is counted separately.
    async fn handle_write_failure(&self, state: &mut FlashState) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        warn!(sector = state.head, "Flash write failed.");
        if decode_sector_index(&self.media, state.head).await.is_some() {
            let _ = self.media.erase(state.head).await;
            if decode_sector_index(&self.media, state.head).await.is_some() {
                self.invalidate_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    sector = state.head,
                    "Could not invalidate sector index after write failure."
                );
            }
        }
        state.head = next_sector(state.head, self.media.sector_count());
        state.initialized = false;
    }

    /// Chooses the next block to send, preferring contiguous progress from
    /// the collector's cursor.
    ///
    /// `out` must be one sector long and receives the slice described by the
    /// returned candidate: the block's bytes from `start`, trailing erased
    /// bytes stripped.  Returns `None` when everything is acknowledged.
    pub async fn get_block_to_post(&self, out: &mut [u8]) -> Option<PostCandidate> {
        let sector_size = self.media.sector_size();
        debug_assert_eq!(out.len(), sector_size);
        let count = self.media.sector_count();
        let mut state = self.state.lock().await;

        // Best candidate so far: the sector and index of the oldest block
        // known to be past the cursor.
        let mut candidate: Option<(u32, u32)> = None;

        if state.initialized {
            if let Some(index) = decode_sector_index(&self.media, state.head).await {
                if state.cursor.index > index {
                    // The collector acknowledged an index newer than
                    // anything on flash, which can only follow an erase;
                    // resynchronize downward.
                    state.cursor = PostCursor { index, size: 0 };
                }
                if index == state.cursor.index {
                    if (state.cursor.size as usize) < sector_size {
                        let start = (state.cursor.size & !3) as usize;
                        if self
                            .media
                            .read(state.head, start, &mut out[..sector_size - start])
                            .await
                            .is_ok()
                        {
                            let mut size = stripped_len(&out[..sector_size - start]);
                            if start + size <= state.cursor.size as usize {
                                // The alignment above re-read bytes that are
                                // already acknowledged; nothing new.
                                size = 0;
                            }
                            state.maybe_to_post = size != 0;
                            return (size != 0).then_some(PostCandidate {
                                index,
                                start: start as u32,
                                size,
                            });
                        }
                    }
                    // The current sector is fully acknowledged.
                    state.maybe_to_post = false;
                    return None;
                }
                candidate = Some((state.head, index));
            }
        }

        // Walk backward from the head while indices decrease one by one.
        let mut sector = previous_sector(state.head, count);
        loop {
            if let Some(index) = decode_sector_index(&self.media, sector).await {
                if let Some((_, oldest)) = candidate {
                    if index != oldest.wrapping_sub(1) {
                        // Ordering break: what lies beyond is stale or
                        // corrupt.
                        break;
                    }
                }
                if state.cursor.index > index {
                    state.cursor = PostCursor { index, size: 0 };
                }
                if index == state.cursor.index && (state.cursor.size as usize) < sector_size {
                    // The acknowledged block may have grown after it was
                    // posted; resend its unacknowledged suffix.
                    let start = (state.cursor.size & !3) as usize;
                    if self
                        .media
                        .read(sector, start, &mut out[..sector_size - start])
                        .await
                        .is_ok()
                    {
                        let size = stripped_len(&out[..sector_size - start]);
                        if start + size > state.cursor.size as usize {
                            state.maybe_to_post = true;
                            return Some(PostCandidate {
                                index,
                                start: start as u32,
                                size,
                            });
                        }
                    }
                    // On a read failure just send the next block instead.
                }
                if index <= state.cursor.index {
                    break;
                }
                let improves = match candidate {
                    Some((_, oldest)) => index < oldest,
                    None => true,
                };
                if improves {
                    candidate = Some((sector, index));
                }
            }
            sector = previous_sector(sector, count);
            if sector == state.head {
                break;
            }
        }

        let Some((sector, index)) = candidate else {
            state.maybe_to_post = false;
            return None;
        };

        if self.media.read(sector, 0, &mut out[..sector_size]).await.is_ok() {
            let size = stripped_len(&out[..sector_size]);
            state.maybe_to_post = size != 0;
            (size != 0).then_some(PostCandidate {
                index,
                start: 0,
                size,
            })
        } else {
            // Unreadable block: hand the collector a stub of just the index
            // bytes and move the cursor past it.
            warn!(index, sector, "Unreadable block; posting a stub.");
            out[..4].copy_from_slice(&index.to_le_bytes());
            state.cursor = PostCursor {
                index,
                size: sector_size as u32,
            };
            state.maybe_to_post = true;
            Some(PostCandidate {
                index,
                start: 0,
                size: 4,
            })
        }
    }

    /// Records the collector's acknowledged cursor.
    ///
    /// Only the poster calls this.  An implausible cursor (pointing past the
    /// head) is corrected on the next candidate search rather than here.
    pub async fn note_block_posted(&self, index: u32, size: u32) {
        let mut state = self.state.lock().await;
        state.cursor = PostCursor { index, size };
    }

    /// Cheap check whether a candidate search could find anything.
    ///
    /// Set by drains, cleared by candidate searches that come up empty.
    /// Data arriving after the check wakes the poster through its
    /// notification, so a stale `false` is never missed for long.
    pub async fn maybe_block_to_post(&self) -> bool {
        self.state.lock().await.maybe_to_post
    }

    /// Resolves when a drain has made new data durable.
    pub async fn post_ready(&self) {
        self.post_notify.notified().await;
    }

    /// Stripped length of the newest block with index at or below
    /// `requested_index`, for the status UI's content-length probe.
    ///
    /// Falls back to the oldest block in the ring when every index is newer
    /// than requested, and to `(0, 0)` when the ring holds nothing.
    pub async fn block_size(&self, requested_index: u32) -> (u32, usize) {
        let sector_size = self.media.sector_size();
        let count = self.media.sector_count();
        let mut buf = vec![0u8; sector_size];
        let state = self.state.lock().await;

        let mut fallback: Option<(u32, u32)> = None;
        if state.initialized {
            if let Some(index) = decode_sector_index(&self.media, state.head).await {
                fallback = Some((state.head, index));
                if index <= requested_index
                    && self.media.read(state.head, 0, &mut buf).await.is_ok()
                {
                    return (index, stripped_len(&buf));
                }
            }
        }

        let mut sector = previous_sector(state.head, count);
        loop {
            if let Some(index) = decode_sector_index(&self.media, sector).await {
                fallback = Some((sector, index));
                if index <= requested_index && self.media.read(sector, 0, &mut buf).await.is_ok() {
                    return (index, stripped_len(&buf));
                }
            }
            sector = previous_sector(sector, count);
            if sector == state.head {
                break;
            }
        }

        if let Some((sector, index)) = fallback {
            if self.media.read(sector, 0, &mut buf).await.is_ok() {
                return (index, stripped_len(&buf));
            }
        }
        (0, 0)
    }

    /// Copies `start..end` of the block carrying `index` into `out`.
    ///
    /// Returns `false` when the block is no longer in the ring (it may have
    /// been overwritten since a size probe) or the range is invalid; the
    /// status UI detects the resulting short response by its content-length.
    pub async fn read_block_range(
        &self,
        index: u32,
        start: usize,
        end: usize,
        out: &mut [u8],
    ) -> bool {
        let sector_size = self.media.sector_size();
        if start > end || end > sector_size || out.len() < end - start {
            return false;
        }
        let count = self.media.sector_count();
        let mut buf = vec![0u8; sector_size];
        let state = self.state.lock().await;

        if state.initialized
            && decode_sector_index(&self.media, state.head).await == Some(index)
            && self.media.read(state.head, 0, &mut buf).await.is_ok()
        {
            out[..end - start].copy_from_slice(&buf[start..end]);
            return true;
        }

        let mut sector = previous_sector(state.head, count);
        loop {
            if decode_sector_index(&self.media, sector).await == Some(index)
                && self.media.read(sector, 0, &mut buf).await.is_ok()
            {
                out[..end - start].copy_from_slice(&buf[start..end]);
                return true;
            }
            sector = previous_sector(sector, count);
            if sector == state.head {
                return false;
            }
        }
    }

    /// Erases every sector and resets the ring to empty.
    ///
    /// Returns whether every sector verified blank afterwards.
    pub async fn erase_all(&self) -> bool {
        let count = self.media.sector_count();
        let mut state = self.state.lock().await;
        let mut success = true;

        for sector in 0..count {
            if !self.sector_erased(sector).await
                && (self.media.erase(sector).await.is_err() || !self.sector_erased(sector).await)
            {
                success = false;
            }
        }

        state.head = 0;
        state.initialized = false;
        state.cursor = PostCursor::default();
        state.maybe_to_post = false;
        success
    }

    /// Size of one block, in bytes.
    pub fn sector_size(&self) -> usize {
        self.media.sector_size()
    }

    /// Snapshot of the failure counters.
    pub fn stats(&self) -> FlashStats {
        FlashStats {
            write_failures: self.write_failures.load(Ordering::Relaxed),
            invalidate_failures: self.invalidate_failures.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) async fn head_position(&self) -> (u32, bool) {
        let state = self.state.lock().await;
        (state.head, state.initialized)
    }

    #[cfg(test)]
    pub(crate) async fn cursor(&self) -> (u32, u32) {
        let state = self.state.lock().await;
        (state.cursor.index, state.cursor.size)
    }
}
