//! Sector and raid-line addressing helpers.
//!
//! All reconstruction arithmetic goes through these helpers so every offset
//! is expressed once and every access is bounds checked by slicing.

use std::ops::Range;

use super::{RAIDLINE, RAIDSECTOR};

/// Byte range inside reconstructed output for data shard `part` (1..=5)
/// of the raid line starting at shard offset `shard_offset`.
///
/// `shard_offset` is a byte offset within each shard and must be sector
/// aligned; the line it names occupies `RAIDLINE` output bytes.
pub fn line_sector_range(shard_offset: usize, part: usize) -> Range<usize> {
    debug_assert!(shard_offset % RAIDSECTOR == 0);
    debug_assert!((1..=5).contains(&part));
    let line = shard_offset / RAIDSECTOR;
    let start = line * RAIDLINE + (part - 1) * RAIDSECTOR;
    start..start + RAIDSECTOR
}

/// XOR `src` into `dest` byte by byte over their common length.
pub fn xor_into(dest: &mut [u8], src: &[u8]) {
    for (d, s) in dest.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

/// Rebuild one sector of a missing shard at `offset` from the shards that
/// are present (`None` marks the missing shard).
pub(crate) fn recover_sector(dest: &mut [u8], shards: &[Option<&[u8]>], offset: usize) {
    dest.fill(0);
    for shard in shards.iter().flatten() {
        xor_into(dest, &shard[offset..offset + RAIDSECTOR]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_sector_range_positions() {
        assert_eq!(line_sector_range(0, 1), 0..16);
        assert_eq!(line_sector_range(0, 5), 64..80);
        assert_eq!(line_sector_range(16, 1), 80..96);
        assert_eq!(line_sector_range(32, 3), 192..208);
    }

    #[test]
    fn test_xor_into_uses_common_length() {
        let mut dest = [0xFFu8; 4];
        xor_into(&mut dest, &[0x0F, 0xF0]);
        assert_eq!(dest, [0xF0, 0x0F, 0xFF, 0xFF]);
    }

    #[test]
    fn test_recover_sector_from_parity() {
        let a = [1u8; 16];
        let b = [2u8; 16];
        let parity = [3u8; 16];
        let shards: [Option<&[u8]>; 4] = [Some(&parity), Some(&a), None, Some(&b)];

        let mut out = [0xAAu8; 16];
        recover_sector(&mut out, &shards, 0);
        assert_eq!(out, [0u8; 16]);
    }
}
