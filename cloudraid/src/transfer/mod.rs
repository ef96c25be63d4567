//! Transfer state machine and its collaborators.
//!
//! # Components
//!
//! - [`TransferSlot`]: drives one transfer's connections tick by tick
//! - [`TransferBufferManager`]: range planning and the serial decrypt pass
//! - [`CryptoWorkers`]: whole-chunk decrypt/encrypt off the slot's thread
//! - [`FileAccess`]: positional local I/O with optional async contexts
//! - [`Transfer`]: the resumable record a slot works on
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cloudraid::config::TransferConfig;
//! use cloudraid::transfer::{LocalFile, TransferContext, TransferSlot};
//! use cloudraid::transport::ReqwestTransport;
//!
//! let ctx = TransferContext::new(TransferConfig::default(), Arc::new(ReqwestTransport::new()?))?;
//! let mut slot = TransferSlot::new(&mut transfer, &ctx, Box::new(LocalFile::create(path)?))?;
//! loop {
//!     match slot.doio() {
//!         SlotStatus::InProgress { .. } => std::thread::sleep(Duration::from_millis(10)),
//!         done => break done,
//!     }
//! }
//! ```

mod buffer;
mod fileio;
mod model;
mod policy;
mod request;
mod slot;
mod speed;
mod worker;

pub use buffer::{download_request_limit, NextRange, TransferBufferManager};
pub use fileio::{AsyncIoCompleter, AsyncIoContext, FileAccess, FileIoError, LocalFile, MemoryAsyncMode, MemoryFile};
pub use model::{Direction, NoopObserver, Transfer, TransferObserver, TransferProgress, UPLOAD_TOKEN_LEN};
pub use policy::{classify, FailureAction, RequestFailure, SlowShardDetector};
pub use request::ReqStatus;
pub use slot::{Completion, SlotFailure, SlotStatus, TransferContext, TransferSlot};
pub use speed::{SpeedController, SPEED_WINDOW};
pub use worker::{crypt_whole_chunks, CryptoDone, CryptoQueue, CryptoWorkers};
