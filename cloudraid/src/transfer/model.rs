//! The resumable transfer record and its observer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{ChunkMacMap, CtrIv, MetaMac, TransferCipher, KEY_LENGTH};
use crate::error::{TransferError, TransferResult};

/// Length of the opaque token that signals a completed upload.
pub const UPLOAD_TOKEN_LEN: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Download,
    Upload,
}

/// Everything needed to run or resume one transfer.
///
/// `chunkmacs` and `progress_completed` are the authoritative resumable
/// state; the slot merges into them only on its own thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub direction: Direction,
    pub size: u64,
    /// Downloads stop delivering at this position (whole file if `None`).
    pub read_to_pos: Option<u64>,
    pub progress_completed: u64,
    pub chunkmacs: ChunkMacMap,
    pub key: [u8; KEY_LENGTH],
    pub ctr_iv: CtrIv,
    /// Whole-file MAC recorded by the server (downloads).
    pub meta_mac: Option<MetaMac>,
    /// One URL, or six for a raid download.
    pub temp_urls: Vec<String>,
    /// Set once an upload completes.
    pub upload_token: Option<Vec<u8>>,
}

impl Transfer {
    pub fn download(
        size: u64,
        key: [u8; KEY_LENGTH],
        ctr_iv: CtrIv,
        meta_mac: Option<MetaMac>,
        temp_urls: Vec<String>,
    ) -> Self {
        Self {
            direction: Direction::Download,
            size,
            read_to_pos: None,
            progress_completed: 0,
            chunkmacs: ChunkMacMap::new(),
            key,
            ctr_iv,
            meta_mac,
            temp_urls,
            upload_token: None,
        }
    }

    pub fn upload(size: u64, key: [u8; KEY_LENGTH], ctr_iv: CtrIv, upload_url: String) -> Self {
        Self {
            direction: Direction::Upload,
            size,
            read_to_pos: None,
            progress_completed: 0,
            chunkmacs: ChunkMacMap::new(),
            key,
            ctr_iv,
            meta_mac: None,
            temp_urls: vec![upload_url],
            upload_token: None,
        }
    }

    /// Deliver only the first `limit` bytes.
    pub fn with_read_limit(mut self, limit: u64) -> Self {
        self.read_to_pos = Some(limit.min(self.size));
        self
    }

    /// Position up to which bytes are delivered.
    pub fn deliver_limit(&self) -> u64 {
        self.read_to_pos.map_or(self.size, |p| p.min(self.size))
    }

    pub fn cipher(&self) -> TransferCipher {
        TransferCipher::new(&self.key)
    }

    pub fn to_json(&self) -> TransferResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| TransferError::Internal(e.to_string()))
    }

    pub fn from_json(text: &str) -> TransferResult<Self> {
        serde_json::from_str(text).map_err(|e| TransferError::Setup(format!("bad transfer state: {}", e)))
    }
}

/// Snapshot passed to [`TransferObserver::on_progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub completed: u64,
    /// End of the finished prefix; a resumed raid download restarts here.
    pub contiguous: u64,
    pub size: u64,
    /// Bytes/s over the recent window.
    pub speed: u64,
    /// Bytes/s since the slot started.
    pub mean_speed: u64,
}

/// Callbacks from a running slot. Every method has a no-op default.
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, _transfer: &Transfer, _progress: &TransferProgress) {}

    /// A request failed and is being retried once.
    fn on_chunk_failed(&self, _transfer: &Transfer, _status: Option<u16>) {}

    /// A recoverable problem the slot is handling itself.
    fn on_temporary_error(&self, _transfer: &Transfer, _error: &TransferError, _backoff: Option<Duration>) {}

    /// Resumable state changed and should be saved.
    fn on_persist(&self, _transfer: &Transfer) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}
