use rand::{rngs::StdRng, Rng, SeedableRng};

use super::*;

#[tokio::test]
async fn empty_region_starts_at_sector_zero_index_zero() {
    let media = test_media();
    let (ring, next_index) = open_ring(&media).await;
    assert_eq!(next_index, 0);
    assert_eq!(ring.head_position().await, (0, false));
}

#[tokio::test]
async fn head_lands_one_past_the_most_recent_sector() {
    let media = test_media();
    stamp_block(&media, 0, 10, b"ten");
    stamp_block(&media, 1, 11, b"eleven");
    stamp_block(&media, 2, 12, b"twelve");

    let (ring, next_index) = open_ring(&media).await;
    assert_eq!(next_index, 13);
    assert_eq!(ring.head_position().await, (3, false));
}

#[tokio::test]
async fn corrupt_redundant_word_disqualifies_a_sector() {
    let media = test_media();
    stamp_block(&media, 0, 10, b"ten");
    stamp_block(&media, 1, 11, b"eleven");
    stamp_block(&media, 2, 12, b"twelve");
    // Damage the inverted copy of sector 2's index: the words no longer
    // complement, so recovery must fall back to index 11.
    media.write_raw(2, 4, &[0x00, 0x00, 0x00, 0x00]);

    let (ring, next_index) = open_ring(&media).await;
    assert_eq!(next_index, 12);
    assert_eq!(ring.head_position().await, (2, false));
}

#[tokio::test]
async fn duplicate_index_past_the_wrap_wins() {
    let media = test_media();
    // A failed sector retried with the same index, with the retry landing
    // past the wrap point: sector 0 was written after sector 7.
    stamp_block(&media, 6, 4, b"four");
    stamp_block(&media, 7, 5, b"five, bad");
    stamp_block(&media, 0, 5, b"five, retried");

    let (ring, next_index) = open_ring(&media).await;
    assert_eq!(next_index, 6);
    assert_eq!(ring.head_position().await, (1, false));
}

#[tokio::test]
async fn head_wraps_at_the_region_end() {
    let media = test_media();
    stamp_block(&media, SECTOR_COUNT - 1, 42, b"last");

    let (ring, next_index) = open_ring(&media).await;
    assert_eq!(next_index, 43);
    assert_eq!(ring.head_position().await, (0, false));
}

#[tokio::test]
async fn random_sector_soups_recover_the_largest_index() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..50 {
        let media = test_media();
        let mut largest = None;
        for sector in 0..SECTOR_COUNT {
            match rng.gen_range(0..3) {
                // Erased.
                0 => {}
                // Valid block with a random index.
                1 => {
                    let index = rng.gen_range(0..1000u32);
                    stamp_block(&media, sector, index, b"x");
                    largest = Some(largest.map_or(index, |l: u32| l.max(index)));
                }
                // Garbage that must not decode.
                _ => {
                    let noise: Vec<u8> = (0..16).map(|_| rng.gen::<u8>() | 1).collect();
                    media.write_raw(sector, 0, &noise);
                }
            }
        }

        let (_ring, next_index) = open_ring(&media).await;
        assert_eq!(next_index, largest.map_or(0, |l| l + 1));
    }
}
