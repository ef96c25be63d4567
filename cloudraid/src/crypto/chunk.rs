//! Chunk boundaries, per-chunk MAC state and whole-file MAC condensation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::cipher::{CtrIv, MacBlock, TransferCipher, BLOCK_SIZE, KEY_LENGTH};

/// Base segment size for chunk boundaries (128 KiB).
pub const CHUNK_SEGMENT_SIZE: u64 = 131_072;

/// Number of growing chunks before the layout switches to fixed 1 MiB chunks.
const GROWING_CHUNKS: u64 = 8;

/// Start of the chunk containing `p`.
pub fn chunk_floor(p: u64) -> u64 {
    let mut cp = 0;
    for i in 1..=GROWING_CHUNKS {
        let np = cp + i * CHUNK_SEGMENT_SIZE;
        if p < np {
            return cp;
        }
        cp = np;
    }
    let big = GROWING_CHUNKS * CHUNK_SEGMENT_SIZE;
    ((p - cp) & !(big - 1)) + cp
}

/// End of the chunk containing `p`, clamped to `limit`.
pub fn chunk_ceil(p: u64, limit: u64) -> u64 {
    let mut cp = 0;
    for i in 1..=GROWING_CHUNKS {
        let np = cp + i * CHUNK_SEGMENT_SIZE;
        if p < np {
            return np.min(limit);
        }
        cp = np;
    }
    let big = GROWING_CHUNKS * CHUNK_SEGMENT_SIZE;
    let np = ((p - cp) & !(big - 1)) + cp + big;
    np.min(limit)
}

/// Running MAC state of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkMac {
    /// CBC-MAC state over the plaintext processed so far.
    pub mac: MacBlock,
    /// Bytes of the chunk processed so far (0 once finished).
    pub offset: u32,
    /// All bytes of the chunk have been processed.
    pub finished: bool,
}

impl ChunkMac {
    /// A finished chunk with the given MAC.
    pub fn finished(mac: MacBlock) -> Self {
        Self {
            mac,
            offset: 0,
            finished: true,
        }
    }
}

/// Chunk MAC states keyed by chunk start offset.
///
/// This is the authoritative resumable state of a transfer. Iteration is
/// always in file order, which the whole-file MAC depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMacMap {
    chunks: BTreeMap<u64, ChunkMac>,
}

impl ChunkMacMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, chunk_start: u64) -> Option<&ChunkMac> {
        self.chunks.get(&chunk_start)
    }

    /// Current state for a chunk, default (unstarted) if unknown.
    pub fn state(&self, chunk_start: u64) -> ChunkMac {
        self.chunks.get(&chunk_start).copied().unwrap_or_default()
    }

    pub fn entry_mut(&mut self, chunk_start: u64) -> &mut ChunkMac {
        self.chunks.entry(chunk_start).or_default()
    }

    pub fn insert(&mut self, chunk_start: u64, mac: ChunkMac) {
        self.chunks.insert(chunk_start, mac);
    }

    pub fn is_finished(&self, chunk_start: u64) -> bool {
        self.chunks.get(&chunk_start).is_some_and(|c| c.finished)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &ChunkMac)> {
        self.chunks.iter()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn remove(&mut self, chunk_start: u64) -> Option<ChunkMac> {
        self.chunks.remove(&chunk_start)
    }

    /// Move every entry of `other` into this map. A state never replaces one
    /// that has progressed further through the same chunk.
    pub fn merge(&mut self, other: &mut ChunkMacMap) {
        for (start, mac) in std::mem::take(&mut other.chunks) {
            let keep_existing = self
                .chunks
                .get(&start)
                .is_some_and(|old| !mac.finished && (old.finished || old.offset > mac.offset));
            if !keep_existing {
                self.chunks.insert(start, mac);
            }
        }
    }

    /// Drop every chunk starting at or after `pos`.
    pub fn truncate_from(&mut self, pos: u64) {
        self.chunks.split_off(&pos);
    }

    /// Forget partially processed chunks so they are fetched again whole.
    pub fn discard_unfinished(&mut self) {
        self.chunks.retain(|_, c| c.finished);
    }

    /// Bytes already processed: whole finished chunks plus partial offsets.
    pub fn processed_bytes(&self, file_size: u64) -> u64 {
        self.chunks
            .iter()
            .map(|(&start, c)| {
                if c.finished {
                    chunk_ceil(start, file_size).saturating_sub(start)
                } else {
                    u64::from(c.offset)
                }
            })
            .sum()
    }

    /// End of the finished prefix: every chunk before the returned offset
    /// is finished.
    pub fn contiguous_progress(&self, file_size: u64) -> u64 {
        let mut pos = 0;
        while pos < file_size && self.is_finished(pos) {
            pos = chunk_ceil(pos, file_size);
        }
        pos
    }

    /// Fold all chunk MACs, in file order, into the whole-file MAC.
    pub fn macsmac(&self, cipher: &TransferCipher) -> MetaMac {
        self.macsmac_gaps(cipher, 0, 0, 0, 0)
    }

    /// Whole-file MAC computed as if the chunks with index in `[g1, g2)` or
    /// `[g3, g4)` were absent.
    pub fn macsmac_gaps(
        &self,
        cipher: &TransferCipher,
        g1: usize,
        g2: usize,
        g3: usize,
        g4: usize,
    ) -> MetaMac {
        let mut state = [0u8; BLOCK_SIZE];
        for (n, chunk) in self.chunks.values().enumerate() {
            if (g1..g2).contains(&n) || (g3..g4).contains(&n) {
                continue;
            }
            fold_mac(cipher, &mut state, &chunk.mac);
        }
        MetaMac::condense(&state)
    }

    pub(crate) fn macs(&self) -> Vec<MacBlock> {
        self.chunks.values().map(|c| c.mac).collect()
    }
}

/// One step of the whole-file MAC fold.
pub(crate) fn fold_mac(cipher: &TransferCipher, state: &mut MacBlock, chunk_mac: &MacBlock) {
    for (s, m) in state.iter_mut().zip(chunk_mac.iter()) {
        *s ^= m;
    }
    cipher.encrypt_block(state);
}

/// Condensed 8-byte whole-file MAC.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MetaMac(pub [u8; 8]);

impl MetaMac {
    /// Condense a 16-byte fold state: `w0 ^ w1 ‖ w2 ^ w3` over 32-bit words.
    pub fn condense(state: &MacBlock) -> Self {
        let mut out = [0u8; 8];
        for i in 0..4 {
            out[i] = state[i] ^ state[i + 4];
            out[i + 4] = state[i + 8] ^ state[i + 12];
        }
        Self(out)
    }
}

impl fmt::Debug for MetaMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetaMac(")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// File key attached to an uploaded node: transfer key ‖ nonce ‖ meta-MAC,
/// with the first half XORed by the second.
pub fn file_key(transfer_key: &[u8; KEY_LENGTH], iv: CtrIv, meta_mac: MetaMac) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(transfer_key);
    key[16..24].copy_from_slice(&iv.0);
    key[24..].copy_from_slice(&meta_mac.0);
    for i in 0..16 {
        key[i] ^= key[i + 16];
    }
    key
}
