//! Error types for the transfer engine.
//!
//! [`TransferError`] is the single failure type surfaced to whoever drives a
//! transfer. Everything recoverable (slow shards, individual request
//! failures, rate limiting) is absorbed inside the slot; only exhausted
//! retry budgets, quota exhaustion and integrity failures reach the caller.

use thiserror::Error;

/// Result type for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// Numeric error code the storage servers return for an integrity failure.
pub const SERVER_ERROR_KEY: i32 = -14;

/// Failure of a transfer as seen by its owner.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Temporary condition; the transfer should be retried later.
    #[error("temporary failure, retry later")]
    Again,

    /// The account's bandwidth quota is exhausted.
    #[error("bandwidth quota exceeded")]
    OverQuota,

    /// The downloaded data does not match the file's recorded MAC.
    #[error("integrity check failed: file MAC mismatch")]
    MacMismatch,

    /// An internal invariant was violated. Never retried.
    #[error("internal error: {0}")]
    Internal(String),

    /// Reading the local source file failed.
    #[error("failed to read local file")]
    Read,

    /// Writing the local destination file failed.
    #[error("failed to write local file")]
    Write,

    /// A request cycle failed after its soft-retry was used up.
    #[error("request failed")]
    Failed,

    /// The server rejected the request with a numeric error code.
    #[error("server error {0}")]
    Server(i32),

    /// The transfer could not be set up (bad URLs, worker pool, etc.).
    #[error("transfer setup failed: {0}")]
    Setup(String),
}

impl TransferError {
    /// Whether a scheduler should retry the transfer after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Again
                | TransferError::OverQuota
                | TransferError::Failed
                | TransferError::Read
                | TransferError::Write
        )
    }

    /// Map a server-returned error code to a transfer error.
    pub fn from_server_code(code: i32) -> Self {
        match code {
            -3 => TransferError::Again,
            -17 => TransferError::OverQuota,
            SERVER_ERROR_KEY => TransferError::MacMismatch,
            other => TransferError::Server(other),
        }
    }
}
