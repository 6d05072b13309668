use pretty_assertions::assert_eq;

use super::*;
use crate::ring::EventFlags;

#[tokio::test]
async fn block_size_finds_the_newest_block_at_or_below_the_request() {
    let media = test_media();
    stamp_block(&media, 0, 10, &[0xaa; 30]);
    stamp_block(&media, 1, 11, &[0xbb; 50]);
    stamp_block(&media, 2, 12, &[0xcc; 70]);
    let (flash, _) = open_ring(&media).await;

    assert_eq!(flash.block_size(u32::MAX).await, (12, 78));
    assert_eq!(flash.block_size(12).await, (12, 78));
    assert_eq!(flash.block_size(11).await, (11, 58));

    // Older than anything in the ring: the oldest block answers, so the
    // status UI can learn both ends of the range from one probe.
    assert_eq!(flash.block_size(5).await, (10, 38));
}

#[tokio::test]
async fn block_size_covers_the_live_head() {
    let media = test_media();
    let (flash, next_index) = open_ring(&media).await;
    let (ram, clock) = test_ram(next_index);

    assert_eq!(ram.append(0, 2, &[0x11; 20], EventFlags::default()), 0);
    clock.advance(1);
    assert_eq!(flash.drain(&ram).await, 1);

    let (index, size) = flash.block_size(u32::MAX).await;
    assert_eq!(index, 0);
    // Index words, a three-byte header, and the payload.
    assert_eq!(size, codec::BLOCK_INDEX_LEN + 3 + 20);
}

#[tokio::test]
async fn block_size_of_an_empty_ring_is_zero() {
    let media = test_media();
    let (flash, _) = open_ring(&media).await;
    assert_eq!(flash.block_size(u32::MAX).await, (0, 0));
}

#[tokio::test]
async fn block_range_returns_exact_bytes() {
    let media = test_media();
    stamp_block(&media, 0, 10, &[0xaa; 30]);
    stamp_block(&media, 1, 11, &[0xbb; 50]);
    let (flash, _) = open_ring(&media).await;

    let mut out = vec![0u8; 16];
    assert!(flash.read_block_range(11, 8, 24, &mut out).await);
    assert_eq!(out, vec![0xbb; 16]);

    // Reading across the stream into the padding is fine; the bytes are
    // whatever the sector holds.
    let mut out = vec![0u8; 8];
    assert!(flash.read_block_range(10, 36, 44, &mut out).await);
    assert_eq!(&out[0..2], &[0xaa, 0xaa]);
    assert_eq!(&out[2..], &[0xff; 6]);
}

#[tokio::test]
async fn block_range_misses_are_explicit() {
    let media = test_media();
    stamp_block(&media, 0, 10, &[0xaa; 30]);
    let (flash, _) = open_ring(&media).await;

    let mut out = vec![0u8; 16];
    // An index that has left (or never entered) the ring.
    assert!(!flash.read_block_range(99, 0, 16, &mut out).await);
    // Invalid ranges never touch the media.
    assert!(!flash.read_block_range(10, 24, 8, &mut out).await);
    assert!(!flash.read_block_range(10, 0, SECTOR_SIZE + 1, &mut out).await);
    assert!(!flash.read_block_range(10, 0, 32, &mut out).await);
}

#[tokio::test]
async fn erase_all_blanks_the_region_and_resets_state() {
    let media = test_media();
    stamp_block(&media, 0, 10, &[0xaa; 30]);
    stamp_block(&media, 1, 11, &[0xbb; 50]);
    let (flash, _) = open_ring(&media).await;
    flash.note_block_posted(10, 100).await;

    assert!(flash.erase_all().await);

    for sector in 0..SECTOR_COUNT {
        assert!(media.raw_sector(sector).iter().all(|&b| b == 0xff));
    }
    assert_eq!(flash.head_position().await, (0, false));
    assert_eq!(flash.cursor().await, (0, 0));
    assert_eq!(flash.block_size(u32::MAX).await, (0, 0));
    let mut out = vec![0u8; SECTOR_SIZE];
    assert_eq!(flash.get_block_to_post(&mut out).await, None);
}
