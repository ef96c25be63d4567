//! Decrypt/encrypt worker pool.
//!
//! Whole chunks are processed off the slot's thread. A job owns its
//! [`FilePiece`] outright: the worker applies the keystream, records each
//! chunk's MAC in the piece's private map and sends the piece back. The
//! transfer's authoritative MAC map is only touched by the slot after the
//! result has been received.
//!
//! ```text
//! slot ── submit(piece) ──► rayon pool ── crypt_whole_chunks ──┐
//!   ▲                                                          │
//!   └──────────── try_recv() ◄── mpsc::unbounded ◄─────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::crypto::{chunk_ceil, chunk_floor, ChunkMac, CryptDirection, CtrIv, TransferCipher};
use crate::error::{TransferError, TransferResult};
use crate::raid::FilePiece;

/// Process-wide worker pool shared by all slots.
#[derive(Debug, Clone)]
pub struct CryptoWorkers {
    pool: Arc<rayon::ThreadPool>,
}

impl CryptoWorkers {
    pub fn new(threads: usize) -> TransferResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("cloudraid-crypto-{}", i))
            .build()
            .map_err(|e| TransferError::Setup(format!("failed to start worker pool: {}", e)))?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// A result queue for one transfer.
    pub fn queue(&self, cipher: TransferCipher, iv: CtrIv, file_size: u64) -> CryptoQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        CryptoQueue {
            pool: Arc::clone(&self.pool),
            cipher: Arc::new(cipher),
            iv,
            file_size,
            tx,
            rx,
            outstanding: 0,
        }
    }
}

/// A processed piece coming back from the pool.
#[derive(Debug)]
pub struct CryptoDone {
    pub connection: usize,
    pub direction: CryptDirection,
    pub piece: FilePiece,
}

/// Per-transfer job submission and result collection.
#[derive(Debug)]
pub struct CryptoQueue {
    pool: Arc<rayon::ThreadPool>,
    cipher: Arc<TransferCipher>,
    iv: CtrIv,
    file_size: u64,
    tx: mpsc::UnboundedSender<CryptoDone>,
    rx: mpsc::UnboundedReceiver<CryptoDone>,
    outstanding: usize,
}

impl CryptoQueue {
    /// Hand a piece to the pool.
    pub fn submit(&mut self, connection: usize, direction: CryptDirection, mut piece: FilePiece) {
        self.outstanding += 1;
        let tx = self.tx.clone();
        let cipher = Arc::clone(&self.cipher);
        let (iv, file_size) = (self.iv, self.file_size);

        self.pool.spawn(move || {
            crypt_whole_chunks(&mut piece, &cipher, iv, file_size, direction);
            let _ = tx.send(CryptoDone {
                connection,
                direction,
                piece,
            });
        });
    }

    /// A finished job, if any.
    pub fn try_recv(&mut self) -> Option<CryptoDone> {
        let done = self.rx.try_recv().ok()?;
        self.outstanding -= 1;
        Some(done)
    }

    /// Wait for every outstanding job. Must not be called from inside an async runtime.
    pub fn drain_blocking(&mut self) -> Vec<CryptoDone> {
        let mut done = Vec::with_capacity(self.outstanding);
        while self.outstanding > 0 {
            match self.rx.blocking_recv() {
                Some(result) => {
                    self.outstanding -= 1;
                    done.push(result);
                }
                None => break,
            }
        }
        done
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Whether `[start, end)` contains the whole chunk beginning at `p`.
pub(crate) fn is_whole_chunk(p: u64, end: u64, file_size: u64) -> bool {
    p == chunk_floor(p) && chunk_ceil(p, file_size) <= end
}

/// Encrypt or decrypt every chunk the piece fully contains, recording each
/// chunk's finished MAC in the piece's own map. Partial chunks are left
/// untouched.
pub fn crypt_whole_chunks(
    piece: &mut FilePiece,
    cipher: &TransferCipher,
    iv: CtrIv,
    file_size: u64,
    direction: CryptDirection,
) {
    let start = piece.pos;
    let end = piece.end_pos();
    let Some(data) = piece.buf.data_mut() else {
        return;
    };

    let mut p = start;
    while p < end {
        let chunk_end = chunk_ceil(p, file_size).min(end);
        if is_whole_chunk(p, end, file_size) {
            let range = (p - start) as usize..(chunk_end - start) as usize;
            let mut mac = [0u8; 16];
            cipher.ctr_crypt(&mut data[range], p, iv, Some(&mut mac), direction, true);
            piece.chunkmacs.insert(p, ChunkMac::finished(mac));
        }
        p = if chunk_end > p { chunk_end } else { end };
    }
}
