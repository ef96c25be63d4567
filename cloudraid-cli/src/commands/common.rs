//! Helpers shared by the transfer commands.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use cloudraid::crypto::{CtrIv, MetaMac, KEY_LENGTH};
use cloudraid::transfer::{SlotStatus, Transfer, TransferObserver, TransferProgress, TransferSlot};
use cloudraid::{Completion, TransferError};

use crate::error::CliError;

/// Longest sleep between ticks while nothing is scheduled.
const IDLE_TICK: Duration = Duration::from_millis(10);

/// Parse a 16-byte transfer key from hex.
pub fn parse_key(hex_key: &str) -> Result<[u8; KEY_LENGTH], CliError> {
    parse_fixed(hex_key, "key")
}

/// Parse the 8-byte CTR nonce from hex.
pub fn parse_iv(hex_iv: &str) -> Result<CtrIv, CliError> {
    parse_fixed(hex_iv, "iv").map(CtrIv)
}

pub fn parse_meta_mac(hex_mac: &str) -> Result<MetaMac, CliError> {
    parse_fixed(hex_mac, "meta-mac").map(MetaMac)
}

fn parse_fixed<const N: usize>(text: &str, what: &str) -> Result<[u8; N], CliError> {
    let bytes = hex::decode(text.trim()).map_err(|e| CliError::Argument(format!("{}: {}", what, e)))?;
    bytes
        .try_into()
        .map_err(|_| CliError::Argument(format!("{} must be {} bytes of hex", what, N)))
}

/// Where a transfer's resumable state is kept.
pub fn state_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".cloudraid.json");
    PathBuf::from(name)
}

/// Load saved transfer state, if any.
pub fn load_state(path: &Path) -> Result<Option<Transfer>, CliError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    Ok(Some(Transfer::from_json(&text)?))
}

/// Drives a progress bar and persists transfer state.
pub struct CliObserver {
    bar: ProgressBar,
    state_file: Option<PathBuf>,
}

impl CliObserver {
    pub fn new(size: u64, state_file: Option<PathBuf>) -> Self {
        let bar = ProgressBar::new(size);
        if let Ok(style) =
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar, state_file }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl TransferObserver for CliObserver {
    fn on_progress(&self, _transfer: &Transfer, progress: &TransferProgress) {
        self.bar.set_position(progress.completed);
    }

    fn on_chunk_failed(&self, _transfer: &Transfer, status: Option<u16>) {
        match status {
            Some(status) => self.bar.println(format!("Request failed with HTTP {}, retrying", status)),
            None => self.bar.println("Request failed, retrying"),
        }
    }

    fn on_temporary_error(&self, _transfer: &Transfer, error: &TransferError, backoff: Option<Duration>) {
        tracing::debug!(%error, ?backoff, "Temporary transfer error");
    }

    fn on_persist(&self, transfer: &Transfer) {
        self.bar.set_position(transfer.progress_completed);
        let Some(path) = &self.state_file else {
            return;
        };
        let saved = transfer
            .to_json()
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
        if let Err(e) = saved {
            tracing::warn!(path = %path.display(), error = %e, "Could not save transfer state");
        }
    }
}

/// Install a Ctrl+C handler that raises the returned flag.
pub fn interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    if let Err(e) = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!(error = %e, "Could not install Ctrl+C handler");
    }
    flag
}

/// Tick a slot until it finishes or the user interrupts.
///
/// Dropping the slot afterwards flushes reconstructed data and persists state.
pub fn run_slot(slot: &mut TransferSlot<'_>, interrupted: &AtomicBool) -> Result<Completion, CliError> {
    loop {
        if interrupted.load(Ordering::SeqCst) {
            tracing::info!(completed = slot.transfer().progress_completed, "Transfer interrupted");
            return Err(CliError::Interrupted);
        }
        match slot.doio() {
            SlotStatus::InProgress { retry_in } => {
                std::thread::sleep(retry_in.map_or(IDLE_TICK, |d| d.min(IDLE_TICK)).max(Duration::from_millis(1)));
            }
            SlotStatus::Complete(completion) => return Ok(completion),
            SlotStatus::Failed(failure) => {
                if let Some(backoff) = failure.backoff {
                    tracing::warn!(?backoff, "Server asked to wait before retrying");
                }
                return Err(CliError::Transfer(failure.error));
            }
        }
    }
}
