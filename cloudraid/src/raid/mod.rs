//! CloudRAID shard geometry and reconstruction.
//!
//! A CloudRAID file is stored as six shards. Shard 0 holds parity; shards
//! 1-5 hold the file's bytes interleaved in 16-byte sectors:
//!
//! ```text
//! file:    | s1 | s2 | s3 | s4 | s5 | s1'| s2'| s3'| s4'| s5'| ...
//!          \________ raid line _______/
//!
//! shard 0: | s1^s2^s3^s4^s5 | s1'^s2'^s3'^s4'^s5' | ...
//! shard 1: | s1 | s1'| ...
//! shard 5: | s5 | s5'| ...
//! ```
//!
//! Any single shard can be rebuilt from the other five by XOR, so a transfer
//! only ever needs five of them. [`RaidBufferManager`] turns six
//! independently paced shard streams back into one ordered byte stream.

mod buffer;
mod faulty;
mod piece;
mod sector;

pub use buffer::{RaidBufferManager, RaidRange, RaidSetup};
pub use faulty::{FaultyServers, FAULTY_SERVER_MEMORY_HOURS};
pub use piece::{FilePiece, PieceBuf};
pub use sector::{line_sector_range, xor_into};

/// Total shards per file.
pub const RAIDPARTS: usize = 6;

/// Shards carrying file data (1..=5).
pub const DATA_PARTS: usize = RAIDPARTS - 1;

/// Minimum recoverable unit.
pub const RAIDSECTOR: usize = 16;

/// Logical file bytes per raid line.
pub const RAIDLINE: usize = DATA_PARTS * RAIDSECTOR;

/// Exact byte length of shard `part` for a file of `file_size` bytes.
///
/// Full raid lines contribute one sector to every shard. The residual tail
/// (`file_size % 80`) is dealt out sector by sector to shards 1..5; the
/// parity shard is always as long as shard 1.
pub fn raid_part_size(part: usize, file_size: u64) -> u64 {
    debug_assert!(part < RAIDPARTS);
    let line = RAIDLINE as u64;
    let sector = RAIDSECTOR as i64;
    let residual = file_size % line;

    let preceding = part.saturating_sub(1) as i64;
    let tail = (residual as i64 - preceding * sector).clamp(0, sector);

    (file_size - residual) / DATA_PARTS as u64 + tail as u64
}

/// Split `data` into its six shard byte streams.
pub fn encode_shards(data: &[u8]) -> [Vec<u8>; RAIDPARTS] {
    let size = data.len() as u64;
    let mut shards: [Vec<u8>; RAIDPARTS] =
        std::array::from_fn(|part| Vec::with_capacity(raid_part_size(part, size) as usize));

    for line in data.chunks(RAIDLINE) {
        let mut parity = [0u8; RAIDSECTOR];
        for (j, sector) in line.chunks(RAIDSECTOR).enumerate() {
            shards[j + 1].extend_from_slice(sector);
            xor_into(&mut parity[..sector.len()], sector);
        }
        let parity_len = line.len().min(RAIDSECTOR);
        shards[0].extend_from_slice(&parity[..parity_len]);
    }
    shards
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_sizes_full_lines() {
        for part in 0..RAIDPARTS {
            assert_eq!(raid_part_size(part, 800), 160);
        }
    }

    #[test]
    fn test_part_sizes_with_residual() {
        // residual 70: 16,16,16,16,6 across data shards
        let size = 160 + 70;
        let sizes: Vec<u64> = (0..RAIDPARTS).map(|p| raid_part_size(p, size)).collect();
        assert_eq!(sizes, vec![48, 48, 48, 48, 48, 38]);

        // residual 20: 16,4,0,0,0
        let sizes: Vec<u64> = (0..RAIDPARTS).map(|p| raid_part_size(p, 100)).collect();
        assert_eq!(sizes, vec![32, 32, 20, 16, 16, 16]);
    }

    #[test]
    fn test_part_sizes_tiny_file() {
        let sizes: Vec<u64> = (0..RAIDPARTS).map(|p| raid_part_size(p, 5)).collect();
        assert_eq!(sizes, vec![5, 5, 0, 0, 0, 0]);
        assert_eq!(raid_part_size(3, 0), 0);
    }

    #[test]
    fn test_encode_matches_part_sizes() {
        let data: Vec<u8> = (0..1234u32).map(|i| (i % 251) as u8).collect();
        let shards = encode_shards(&data);
        for (part, shard) in shards.iter().enumerate() {
            assert_eq!(shard.len() as u64, raid_part_size(part, data.len() as u64));
        }
    }

    #[test]
    fn test_parity_sector_is_xor_of_data_sectors() {
        let data: Vec<u8> = (0..80u8).collect();
        let shards = encode_shards(&data);
        for i in 0..RAIDSECTOR {
            let expected = (1..RAIDPARTS).fold(0u8, |acc, p| acc ^ shards[p][i]);
            assert_eq!(shards[0][i], expected);
        }
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_data_shards_sum_to_file_size(size in 0u64..10_000_000) {
                let total: u64 = (1..RAIDPARTS).map(|p| raid_part_size(p, size)).sum();
                prop_assert_eq!(total, size);
            }

            #[test]
            fn test_parity_matches_largest_data_shard(size in 0u64..10_000_000) {
                let largest = (1..RAIDPARTS).map(|p| raid_part_size(p, size)).max().unwrap_or(0);
                prop_assert_eq!(raid_part_size(0, size), largest);
                prop_assert_eq!(raid_part_size(0, size), raid_part_size(1, size));
            }
        }
    }
}
