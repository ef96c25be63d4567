//! CloudRAID - parallel sharded transfer engine
//!
//! This library implements the transfer engine of a cloud-storage client:
//! files stored as six independently fetched shards (five interleaved data
//! shards plus one XOR parity shard) are reassembled into a single
//! contiguous, decrypted and MAC-verified byte stream, while shards arrive
//! out of order, at different speeds, and sometimes fail outright.
//!
//! # Architecture
//!
//! ```text
//! TransferSlot::doio()  (one non-blocking tick)
//!     │
//!     ├─► TransferBufferManager::next_download_range()
//!     │        └─► RaidBufferManager (per-shard queues, pause/resume)
//!     ├─► HttpTransport::post() ──► HttpExchange::poll()
//!     ├─► submit_buffer() ──► combine_raid_parts() ──► finalize()
//!     │                                                    │
//!     │                                   CryptoWorkers ◄──┘ (whole chunks)
//!     ├─► FileAccess write (sync or async context)
//!     └─► buffer_write_completed() ──► progress / meta-MAC verification
//! ```
//!
//! # Modules
//!
//! - [`raid`]: shard geometry, owned piece buffers and the reconstruction engine
//! - [`crypto`]: AES-CTR with chunk CBC-MACs and whole-file MAC condensation
//! - [`transfer`]: the per-transfer state machine and its collaborators
//! - [`transport`]: the narrow HTTP interface consumed by the state machine

pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod raid;
pub mod transfer;
pub mod transport;

pub use error::{TransferError, TransferResult};
pub use transfer::{Completion, SlotStatus, Transfer, TransferContext, TransferSlot};
