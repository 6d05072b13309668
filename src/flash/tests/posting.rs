use pretty_assertions::assert_eq;

use super::*;
use crate::{
    flash::{FaultKind, FaultOp},
    ring::EventFlags,
};

/// Lays down blocks 20..=25 in sectors 0..=5, each with a distinct body.
fn stamp_run(media: &MemoryFlash) {
    for offset in 0..6u32 {
        let body = vec![0x20 + offset as u8; 40 + offset as usize];
        stamp_block(media, offset, 20 + offset, &body);
    }
}

#[tokio::test]
async fn oldest_unacknowledged_block_goes_first() {
    let media = test_media();
    stamp_run(&media);
    let (flash, _) = open_ring(&media).await;

    let (candidate, out) = must_post(&flash).await;
    assert_eq!(candidate.index, 20);
    assert_eq!(candidate.start, 0);
    // Full block, trailing erased bytes stripped.
    assert_eq!(candidate.size, codec::BLOCK_INDEX_LEN + 40);
    assert_eq!(codec::decode_block_index(&out[..8]), Some(20));
}

#[tokio::test]
async fn cursor_acknowledgement_advances_the_candidate() {
    let media = test_media();
    stamp_run(&media);
    let (flash, _) = open_ring(&media).await;

    // The collector confirms everything through block 23 in full.
    flash.note_block_posted(23, SECTOR_SIZE as u32).await;
    let (candidate, _) = must_post(&flash).await;
    assert_eq!(candidate.index, 24);
    assert_eq!(candidate.start, 0);

    // Then a partial acknowledgement of block 24: the next proposal is the
    // word-aligned unconfirmed suffix of the same block.
    let confirmed = (codec::BLOCK_INDEX_LEN + 22) as u32;
    flash.note_block_posted(24, confirmed).await;
    let (candidate, out) = must_post(&flash).await;
    assert_eq!(candidate.index, 24);
    assert_eq!(candidate.start, confirmed & !3);
    let full = codec::BLOCK_INDEX_LEN + 44;
    assert_eq!(candidate.size, full - (confirmed & !3) as usize);
    // The slice picks up exactly at the aligned start of block 24's body.
    assert_eq!(out[0], 0x24);
    assert!(out[..candidate.size].iter().all(|&b| b == 0x24));
}

#[tokio::test]
async fn fully_acknowledged_ring_proposes_nothing() {
    let media = test_media();
    stamp_run(&media);
    let (flash, _) = open_ring(&media).await;

    flash.note_block_posted(25, SECTOR_SIZE as u32).await;
    let mut out = vec![0u8; SECTOR_SIZE];
    assert_eq!(flash.get_block_to_post(&mut out).await, None);
    assert!(!flash.maybe_block_to_post().await);
}

#[tokio::test]
async fn initialized_head_resends_its_unconfirmed_suffix() {
    let media = test_media();
    let (flash, next_index) = open_ring(&media).await;
    let (ram, clock) = test_ram(next_index);

    assert_eq!(ram.append(0, 2, &[0x55; 60], EventFlags::default()), 0);
    clock.advance(1);
    assert_eq!(flash.drain(&ram).await, 1);

    // First proposal: the whole head block.
    let (candidate, _) = must_post(&flash).await;
    assert_eq!((candidate.index, candidate.start), (0, 0));
    let full = candidate.size;

    // The collector confirms a prefix; the remainder is re-proposed from a
    // word-aligned start.
    flash.note_block_posted(0, 30).await;
    let (candidate, _) = must_post(&flash).await;
    assert_eq!(candidate.index, 0);
    assert_eq!(candidate.start, 28);
    assert_eq!(candidate.size, full - 28);

    // Confirming everything silences the head.
    flash.note_block_posted(0, full as u32).await;
    let mut out = vec![0u8; SECTOR_SIZE];
    assert_eq!(flash.get_block_to_post(&mut out).await, None);
}

#[tokio::test]
async fn alignment_overlap_is_not_resent() {
    let media = test_media();
    let (flash, next_index) = open_ring(&media).await;
    let (ram, clock) = test_ram(next_index);

    assert_eq!(ram.append(0, 2, &[0x55; 60], EventFlags::default()), 0);
    clock.advance(1);
    assert_eq!(flash.drain(&ram).await, 1);
    let (candidate, _) = must_post(&flash).await;
    let full = candidate.size;

    // An unaligned acknowledgement of the full content: aligning the start
    // down re-reads a few confirmed bytes, which must not count as new.
    flash.note_block_posted(0, full as u32).await;
    assert!(full % 4 != 0, "test needs an unaligned content size");
    let mut out = vec![0u8; SECTOR_SIZE];
    assert_eq!(flash.get_block_to_post(&mut out).await, None);
}

#[tokio::test]
async fn cursor_past_the_head_is_reset_downward() {
    let media = test_media();
    stamp_run(&media);
    let (flash, _) = open_ring(&media).await;

    // Implausible cursor, as after an external erase: newer than anything
    // on flash.
    flash.note_block_posted(1000, 0).await;
    let (candidate, _) = must_post(&flash).await;
    // The search resynchronized downward and proposes the newest block.
    assert_eq!(candidate.index, 25);
    assert_eq!(candidate.start, 0);
    assert_eq!(flash.cursor().await, (25, 0));
}

#[tokio::test]
async fn unreadable_block_is_stubbed_and_skipped() {
    let media = test_media();
    stamp_block(&media, 0, 5, b"older");
    stamp_block(&media, 1, 6, b"newer");
    let (flash, _) = open_ring(&media).await;

    // The index probe (eight bytes) still reads, but any full-sector read
    // of sector 0 fails.
    media.inject_fault_min_len(FaultOp::Read, 0, FaultKind::Error, 10, 9);

    let (candidate, out) = must_post(&flash).await;
    assert_eq!(candidate.index, 5);
    assert_eq!(candidate.size, 4);
    assert_eq!(out[..4], 5u32.to_le_bytes());
    // The cursor skipped past the bad block so the poster cannot loop on
    // it.
    assert_eq!(flash.cursor().await, (5, SECTOR_SIZE as u32));

    let (candidate, _) = must_post(&flash).await;
    assert_eq!(candidate.index, 6);
}

#[tokio::test]
async fn ordering_break_stops_the_backward_scan() {
    let media = test_media();
    // Sector 3 holds the newest run 8,9; sector 1 holds a stale block from
    // a wrapped-over era whose index does not chain.
    stamp_block(&media, 1, 3, b"stale era");
    stamp_block(&media, 2, 8, b"current");
    stamp_block(&media, 3, 9, b"current");
    let (flash, next_index) = open_ring(&media).await;
    assert_eq!(next_index, 10);

    // The scan walks 9, 8, then hits 3 where it expected 7 and stops; the
    // oldest proposable block is 8.
    let (candidate, _) = must_post(&flash).await;
    assert_eq!(candidate.index, 8);
}

#[tokio::test]
async fn maybe_flag_tracks_drains_and_empty_scans() {
    let media = test_media();
    let (flash, next_index) = open_ring(&media).await;
    let (ram, clock) = test_ram(next_index);

    // Conservatively true right after recovery.
    assert!(flash.maybe_block_to_post().await);

    // An empty scan clears it.
    let mut out = vec![0u8; SECTOR_SIZE];
    assert_eq!(flash.get_block_to_post(&mut out).await, None);
    assert!(!flash.maybe_block_to_post().await);

    // A drain sets it again.
    assert_eq!(ram.append(0, 2, &[1; 8], EventFlags::default()), 0);
    clock.advance(1);
    assert_eq!(flash.drain(&ram).await, 1);
    assert!(flash.maybe_block_to_post().await);
}
