//! Download command - fetch a file from temporary storage URLs.
//!
//! One URL selects a plain download, six select CloudRAID. Progress is saved
//! next to the output file, so an interrupted download resumes where it
//! stopped when the command is run again.

use std::path::PathBuf;
use std::sync::Arc;

use cloudraid::config::ConfigFile;
use cloudraid::transfer::{LocalFile, Transfer, TransferContext, TransferObserver, TransferSlot};
use cloudraid::transport::ReqwestTransport;
use cloudraid::{Completion, TransferError};

use super::common::{
    interrupt_flag, load_state, parse_iv, parse_key, parse_meta_mac, run_slot, state_path, CliObserver,
};
use crate::error::CliError;

/// Arguments for the download command.
pub struct DownloadArgs {
    pub urls: Vec<String>,
    pub output: PathBuf,
    pub size: u64,
    pub key: String,
    pub iv: String,
    pub meta_mac: Option<String>,
    pub read_limit: Option<u64>,
    pub connections: Option<usize>,
    pub all_shards: bool,
}

/// Run the download command.
pub fn run(args: DownloadArgs) -> Result<(), CliError> {
    if args.urls.len() != 1 && args.urls.len() != cloudraid::raid::RAIDPARTS {
        return Err(CliError::Argument(format!(
            "expected 1 or {} URLs, got {}",
            cloudraid::raid::RAIDPARTS,
            args.urls.len()
        )));
    }
    let key = parse_key(&args.key)?;
    let iv = parse_iv(&args.iv)?;
    let meta_mac = args.meta_mac.as_deref().map(parse_meta_mac).transpose()?;

    let state_file = state_path(&args.output);
    let mut transfer = match load_state(&state_file)? {
        Some(saved) if saved.key == key && saved.size == args.size => {
            println!("Resuming download at {} of {} bytes", saved.progress_completed, saved.size);
            // temporary URLs expire; always use the fresh ones
            Transfer {
                temp_urls: args.urls.clone(),
                ..saved
            }
        }
        _ => {
            let transfer = Transfer::download(args.size, key, iv, meta_mac, args.urls.clone());
            match args.read_limit {
                Some(limit) => transfer.with_read_limit(limit),
                None => transfer,
            }
        }
    };

    let config = ConfigFile::load()?;
    let mut transfer_config = config.transfer.with_all_shards(args.all_shards);
    if let Some(connections) = args.connections {
        transfer_config = transfer_config.with_download_connections(connections);
    }

    let observer = Arc::new(CliObserver::new(transfer.deliver_limit(), Some(state_file.clone())));
    let ctx = TransferContext::new(transfer_config, Arc::new(ReqwestTransport::new()?))?
        .with_observer(Arc::clone(&observer) as Arc<dyn TransferObserver>);

    let runtime = tokio::runtime::Runtime::new()?;
    let file = LocalFile::create(&args.output)?.with_runtime(runtime.handle().clone());

    let interrupted = interrupt_flag();
    let result = {
        let mut slot = TransferSlot::new(&mut transfer, &ctx, Box::new(file))?;
        run_slot(&mut slot, &interrupted)
    };
    observer.finish();

    match result {
        Ok(Completion::Download { meta_mac, repaired }) => {
            if let Err(e) = std::fs::remove_file(&state_file) {
                tracing::debug!(error = %e, "No transfer state to remove");
            }
            if repaired {
                println!("Warning: file MAC only matched after the legacy gap repair");
            }
            println!("Downloaded {} bytes to {}", transfer.deliver_limit(), args.output.display());
            println!("Meta MAC: {}", hex::encode(meta_mac.0));
            Ok(())
        }
        Ok(Completion::Upload { .. }) => Err(CliError::Transfer(TransferError::Internal(
            "download finished as an upload".to_string(),
        ))),
        Err(CliError::Interrupted) => {
            println!(
                "Stopped at {} bytes; run the same command again to resume",
                transfer.progress_completed
            );
            Err(CliError::Interrupted)
        }
        Err(e) => Err(e),
    }
}
