//! CloudRAID CLI - command-line driver for the transfer engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cloudraid::config::ConfigFile;
use cloudraid::logging::{init_logging, LoggingGuard};

mod commands;
mod error;

use commands::config::ConfigCommands;
use commands::download::DownloadArgs;
use commands::reconstruct::ReconstructArgs;
use commands::shard::ShardArgs;
use commands::upload::UploadArgs;
use error::CliError;

#[derive(Parser)]
#[command(name = "cloudraid")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a file and split it into six raid shards
    Shard {
        /// File to shard
        input: PathBuf,
        /// Directory receiving part0 (parity) .. part5
        output_dir: PathBuf,
        /// Transfer key, 16 bytes of hex
        #[arg(long)]
        key: String,
        /// CTR nonce, 8 bytes of hex
        #[arg(long)]
        iv: String,
    },

    /// Rebuild a file from shard files through the transfer engine
    Reconstruct {
        /// Directory holding part0 .. part5 (one may be missing)
        shard_dir: PathBuf,
        /// Output file
        output: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        iv: String,
        /// Expected file MAC, 8 bytes of hex
        #[arg(long)]
        meta_mac: Option<String>,
        /// File size, required when a data shard is missing
        #[arg(long)]
        size: Option<u64>,
        /// Fetch all six shards instead of five
        #[arg(long)]
        all_shards: bool,
    },

    /// Download a file from one temporary URL or six raid URLs
    Download {
        /// Output file
        output: PathBuf,
        /// Temporary URL, or six raid URLs in shard order
        #[arg(required = true, num_args = 1..)]
        urls: Vec<String>,
        /// File size in bytes
        #[arg(long)]
        size: u64,
        #[arg(long)]
        key: String,
        #[arg(long)]
        iv: String,
        /// Expected file MAC, 8 bytes of hex
        #[arg(long)]
        meta_mac: Option<String>,
        /// Download only the first N bytes
        #[arg(long)]
        read_limit: Option<u64>,
        /// Parallel connections for a plain download
        #[arg(long)]
        connections: Option<usize>,
        /// Fetch all six shards instead of five
        #[arg(long)]
        all_shards: bool,
    },

    /// Encrypt and upload a file to a temporary upload URL
    Upload {
        /// File to upload
        input: PathBuf,
        /// Upload URL
        url: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        iv: String,
        /// Parallel connections
        #[arg(long)]
        connections: Option<usize>,
    },

    /// Manage configuration settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn setup_logging(verbose: u8) -> Result<LoggingGuard, CliError> {
    let config = ConfigFile::load().unwrap_or_default();
    let logging = match verbose {
        0 => config.logging,
        1 => config.logging.with_level("cloudraid=debug,info"),
        _ => config.logging.with_level("trace"),
    };
    Ok(init_logging(&logging)?)
}

fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Shard {
            input,
            output_dir,
            key,
            iv,
        } => commands::shard::run(ShardArgs {
            input,
            output_dir,
            key,
            iv,
        }),
        Commands::Reconstruct {
            shard_dir,
            output,
            key,
            iv,
            meta_mac,
            size,
            all_shards,
        } => commands::reconstruct::run(ReconstructArgs {
            shard_dir,
            output,
            key,
            iv,
            meta_mac,
            size,
            all_shards,
        }),
        Commands::Download {
            output,
            urls,
            size,
            key,
            iv,
            meta_mac,
            read_limit,
            connections,
            all_shards,
        } => commands::download::run(DownloadArgs {
            urls,
            output,
            size,
            key,
            iv,
            meta_mac,
            read_limit,
            connections,
            all_shards,
        }),
        Commands::Upload {
            input,
            url,
            key,
            iv,
            connections,
        } => commands::upload::run(UploadArgs {
            input,
            url,
            key,
            iv,
            connections,
        }),
        Commands::Config { command } => commands::config::run(command),
    }
}

fn main() {
    let cli = Cli::parse();

    let guard = match setup_logging(cli.verbose) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: {}", e);
            None
        }
    };

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        drop(guard);
        std::process::exit(1);
    }
}
