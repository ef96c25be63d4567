//! Reconstruct command - rebuild a file from shard files through the full
//! transfer engine.
//!
//! The shard directory is served by an in-process transport that answers
//! range requests from the shard files, so the same slot, raid recovery and
//! decrypt/MAC path as a network download is exercised. A missing shard file
//! answers 404 and is rebuilt from parity.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cloudraid::config::ConfigFile;
use cloudraid::raid::RAIDPARTS;
use cloudraid::transfer::{LocalFile, Transfer, TransferContext, TransferObserver, TransferSlot};
use cloudraid::transport::{ExchangeState, HttpExchange, HttpRequest, HttpResponse, HttpTransport, STATUS_NOT_FOUND};
use cloudraid::Completion;

use super::common::{interrupt_flag, parse_iv, parse_key, parse_meta_mac, run_slot, CliObserver};
use super::shard::shard_file_name;
use crate::error::CliError;

const URL_SCHEME: &str = "shard://";

/// Arguments for the reconstruct command.
pub struct ReconstructArgs {
    pub shard_dir: PathBuf,
    pub output: PathBuf,
    pub key: String,
    pub iv: String,
    pub meta_mac: Option<String>,
    pub size: Option<u64>,
    pub all_shards: bool,
}

/// Serves byte ranges of local shard files.
struct ShardDirTransport {
    shards: Vec<Option<Vec<u8>>>,
}

impl ShardDirTransport {
    fn load(dir: &Path) -> Result<Self, CliError> {
        let mut shards = Vec::with_capacity(RAIDPARTS);
        for part in 0..RAIDPARTS {
            let path = dir.join(shard_file_name(part));
            if path.exists() {
                shards.push(Some(std::fs::read(&path)?));
            } else {
                tracing::warn!(path = %path.display(), "Shard file missing; it will be rebuilt from parity");
                shards.push(None);
            }
        }
        if shards.iter().filter(|s| s.is_none()).count() > 1 {
            return Err(CliError::Argument(
                "at most one shard file may be missing".to_string(),
            ));
        }
        Ok(Self { shards })
    }

    fn urls(&self) -> Vec<String> {
        (0..RAIDPARTS).map(|part| format!("{}{}", URL_SCHEME, part)).collect()
    }

    /// Sum of the data shard lengths, if every data shard is present.
    fn file_size(&self) -> Option<u64> {
        self.shards[1..]
            .iter()
            .map(|s| s.as_ref().map(|d| d.len() as u64))
            .sum()
    }

    fn respond(&self, url: &str) -> HttpResponse {
        let Some((part, start, end)) = parse_shard_url(url) else {
            return HttpResponse::status(STATUS_NOT_FOUND);
        };
        match self.shards.get(part).and_then(Option::as_ref) {
            Some(data) if start <= end && end < data.len() => HttpResponse::ok(data[start..=end].to_vec()),
            _ => HttpResponse::status(STATUS_NOT_FOUND),
        }
    }
}

/// Split `shard://<part>/<start>-<end>`.
fn parse_shard_url(url: &str) -> Option<(usize, usize, usize)> {
    let rest = url.strip_prefix(URL_SCHEME)?;
    let (part, range) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some((part.parse().ok()?, start.parse().ok()?, end.parse().ok()?))
}

impl HttpTransport for ShardDirTransport {
    fn post(&self, request: HttpRequest) -> Box<dyn HttpExchange> {
        let response = self.respond(&request.url);
        tracing::trace!(url = %request.url, status = response.status, "Shard request");
        Box::new(LocalExchange {
            transferred: response.body.len() as u64,
            state: Some(ExchangeState::Complete(response)),
        })
    }
}

struct LocalExchange {
    state: Option<ExchangeState>,
    transferred: u64,
}

impl HttpExchange for LocalExchange {
    fn poll(&mut self) -> ExchangeState {
        self.state.take().unwrap_or(ExchangeState::Pending)
    }

    fn transferred(&self) -> u64 {
        if self.state.is_none() {
            self.transferred
        } else {
            0
        }
    }

    fn headers_received(&self) -> bool {
        true
    }

    fn cancel(&mut self) {
        self.state = None;
    }
}

/// Run the reconstruct command.
pub fn run(args: ReconstructArgs) -> Result<(), CliError> {
    let key = parse_key(&args.key)?;
    let iv = parse_iv(&args.iv)?;
    let meta_mac = args.meta_mac.as_deref().map(parse_meta_mac).transpose()?;

    let transport = Arc::new(ShardDirTransport::load(&args.shard_dir)?);
    let size = match args.size.or_else(|| transport.file_size()) {
        Some(size) => size,
        None => {
            return Err(CliError::Argument(
                "a data shard is missing; pass --size".to_string(),
            ))
        }
    };

    let config = ConfigFile::load().unwrap_or_default();
    let transfer_config = config.transfer.with_all_shards(args.all_shards);
    let observer = Arc::new(CliObserver::new(size, None));
    let urls = transport.urls();
    let ctx = TransferContext::new(transfer_config, transport)?
        .with_observer(Arc::clone(&observer) as Arc<dyn TransferObserver>);

    let runtime = tokio::runtime::Runtime::new()?;
    let file = LocalFile::from_file(std::fs::File::create(&args.output)?).with_runtime(runtime.handle().clone());

    let mut transfer = Transfer::download(size, key, iv, meta_mac, urls);
    let interrupted = interrupt_flag();
    let result = {
        let mut slot = TransferSlot::new(&mut transfer, &ctx, Box::new(file))?;
        let result = run_slot(&mut slot, &interrupted);
        if result.is_ok() {
            tracing::debug!(unused = ?slot.unused_raid_connection(), "Reconstruction finished");
        }
        result
    };
    observer.finish();

    match result? {
        Completion::Download { meta_mac, repaired } => {
            println!("Reconstructed {} bytes to {}", size, args.output.display());
            println!("Meta MAC: {}{}", hex::encode(meta_mac.0), if repaired { " (repaired)" } else { "" });
            Ok(())
        }
        Completion::Upload { .. } => Err(CliError::Transfer(cloudraid::TransferError::Internal(
            "download finished as an upload".to_string(),
        ))),
    }
}
