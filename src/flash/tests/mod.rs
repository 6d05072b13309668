use std::sync::Arc;

use crate::{
    clock::{Clock, ManualClock},
    codec,
    flash::{FlashConfig, FlashRing, MemoryFlash},
    ring::{RamRing, RingConfig},
};

mod posting;
mod queries;
mod recovery;

pub(crate) const SECTOR_SIZE: usize = 256;
pub(crate) const SECTOR_COUNT: u32 = 8;

/// Lays a valid block image directly into a sector, as a previous boot
/// would have left it.
pub(crate) fn stamp_block(media: &MemoryFlash, sector: u32, index: u32, content: &[u8]) {
    let mut block = vec![0xffu8; SECTOR_SIZE];
    codec::encode_block_index(&mut block, index);
    block[codec::BLOCK_INDEX_LEN..codec::BLOCK_INDEX_LEN + content.len()].copy_from_slice(content);
    media.write_raw(sector, 0, &block);
}

pub(crate) async fn open_ring(media: &Arc<MemoryFlash>) -> (FlashRing<Arc<MemoryFlash>>, u32) {
    FlashRing::open(Arc::clone(media), &FlashConfig::default()).await
}

pub(crate) fn test_media() -> Arc<MemoryFlash> {
    Arc::new(MemoryFlash::new(SECTOR_SIZE, SECTOR_COUNT))
}

/// A RAM ring whose buffers match the test sector geometry.
pub(crate) fn test_ram(first_index: u32) -> (Arc<RamRing>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let config = RingConfig {
        buffer_size: SECTOR_SIZE,
        num_buffers: 4,
        // Zero hold: the head is offered as soon as the clock moves at all.
        save_hold_ticks: 0,
    };
    let ring = Arc::new(RamRing::new(
        &config,
        Arc::clone(&clock) as Arc<dyn Clock>,
        first_index,
    ));
    (ring, clock)
}

/// Copies the current post candidate out, asserting one exists.
pub(crate) async fn must_post(
    ring: &FlashRing<Arc<MemoryFlash>>,
) -> (crate::flash::PostCandidate, Vec<u8>) {
    let mut out = vec![0u8; SECTOR_SIZE];
    let candidate = ring
        .get_block_to_post(&mut out)
        .await
        .expect("a post candidate should be available");
    (candidate, out)
}
