//! Upload command - encrypt and upload a local file to a temporary upload URL.

use std::path::PathBuf;
use std::sync::Arc;

use cloudraid::config::ConfigFile;
use cloudraid::transfer::{LocalFile, Transfer, TransferContext, TransferObserver, TransferSlot};
use cloudraid::transport::ReqwestTransport;
use cloudraid::{Completion, TransferError};

use super::common::{interrupt_flag, parse_iv, parse_key, run_slot, CliObserver};
use crate::error::CliError;

/// Arguments for the upload command.
pub struct UploadArgs {
    pub input: PathBuf,
    pub url: String,
    pub key: String,
    pub iv: String,
    pub connections: Option<usize>,
}

/// Run the upload command.
pub fn run(args: UploadArgs) -> Result<(), CliError> {
    let key = parse_key(&args.key)?;
    let iv = parse_iv(&args.iv)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let file = LocalFile::open(&args.input)?.with_runtime(runtime.handle().clone());
    let size = file.len()?;

    let config = ConfigFile::load()?;
    let mut transfer_config = config.transfer;
    if let Some(connections) = args.connections {
        transfer_config = transfer_config.with_upload_connections(connections);
    }

    let observer = Arc::new(CliObserver::new(size, None));
    let ctx = TransferContext::new(transfer_config, Arc::new(ReqwestTransport::new()?))?
        .with_observer(Arc::clone(&observer) as Arc<dyn TransferObserver>);

    let mut transfer = Transfer::upload(size, key, iv, args.url);
    let interrupted = interrupt_flag();
    let result = {
        let mut slot = TransferSlot::new(&mut transfer, &ctx, Box::new(file))?;
        run_slot(&mut slot, &interrupted)
    };
    observer.finish();

    match result? {
        Completion::Upload { token, file_key } => {
            println!("Uploaded {} bytes", size);
            println!("Upload token: {}", hex::encode(token));
            println!("File key:     {}", hex::encode(file_key));
            Ok(())
        }
        Completion::Download { .. } => Err(CliError::Transfer(TransferError::Internal(
            "upload finished as a download".to_string(),
        ))),
    }
}
