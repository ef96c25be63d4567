//! Chunked file encryption and integrity.
//!
//! File data is encrypted with AES-128 in counter mode. Integrity is tracked
//! per *chunk* (variable-size regions delimited by [`chunk_floor`] /
//! [`chunk_ceil`]): each chunk carries a CBC-MAC over its plaintext, and the
//! ordered chunk MACs are folded into an 8-byte whole-file [`MetaMac`].
//!
//! # Chunk layout
//!
//! ```text
//! |128K|  256K  |   384K   | ... |      1M (chunk 8)      | 1M | 1M | ...
//! 0    128K     384K       768K                          4.5M
//! ```

mod chunk;
mod cipher;
mod repair;

pub use chunk::{
    chunk_ceil, chunk_floor, file_key, ChunkMac, ChunkMacMap, MetaMac, CHUNK_SEGMENT_SIZE,
};
pub use cipher::{CryptDirection, CtrIv, MacBlock, TransferCipher, BLOCK_SIZE, KEY_LENGTH};
pub use repair::{find_late_gap_match, GapMatch};
