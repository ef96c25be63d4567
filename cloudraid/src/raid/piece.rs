//! Owned, position-tagged byte buffers.

use crate::crypto::ChunkMacMap;

/// Move-only byte buffer with explicit start/end cursors.
///
/// A *null* buffer has a length but no storage: it stands for a shard
/// range that was deliberately not fetched and must be recovered from
/// parity. Null buffers are never written anywhere.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PieceBuf {
    storage: Option<Vec<u8>>,
    start: usize,
    end: usize,
}

impl PieceBuf {
    /// Take ownership of received bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let end = data.len();
        Self {
            storage: Some(data),
            start: 0,
            end,
        }
    }

    /// Placeholder for `len` unfetched bytes.
    pub fn null(len: usize) -> Self {
        Self {
            storage: None,
            start: 0,
            end: len,
        }
    }

    pub fn is_null(&self) -> bool {
        self.storage.is_none()
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// The live bytes, or `None` for a null buffer.
    pub fn data(&self) -> Option<&[u8]> {
        self.storage.as_deref().map(|d| &d[self.start..self.end])
    }

    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let (start, end) = (self.start, self.end);
        self.storage.as_deref_mut().map(|d| &mut d[start..end])
    }

    /// Drop `n` bytes from the front (clamped to the live length).
    pub fn advance(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
    }

    /// Keep only the first `len` live bytes.
    pub fn truncate(&mut self, len: usize) {
        self.end = self.start + len.min(self.len());
    }
}

/// A buffer tagged with its absolute position and private chunk-MAC state.
///
/// Network pieces carry shard positions; reconstructed and non-raid pieces
/// carry file positions. The MAC state is private to the piece until the
/// main loop merges it into the transfer after the piece is written.
#[derive(Debug, Default)]
pub struct FilePiece {
    pub pos: u64,
    pub buf: PieceBuf,
    pub chunkmacs: ChunkMacMap,
    /// Decryption and MAC processing is complete.
    pub finalized: bool,
}

impl FilePiece {
    pub fn new(pos: u64, buf: PieceBuf) -> Self {
        Self {
            pos,
            buf,
            chunkmacs: ChunkMacMap::new(),
            finalized: false,
        }
    }

    pub fn from_vec(pos: u64, data: Vec<u8>) -> Self {
        Self::new(pos, PieceBuf::from_vec(data))
    }

    pub fn null(pos: u64, len: usize) -> Self {
        Self::new(pos, PieceBuf::null(len))
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Position one past the last live byte.
    pub fn end_pos(&self) -> u64 {
        self.pos + self.buf.len() as u64
    }

    /// Discard `n` bytes from the front, keeping `pos` in step.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
        self.pos += n as u64;
    }
}
