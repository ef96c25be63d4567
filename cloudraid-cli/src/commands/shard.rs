//! Shard command - encrypt a local file and split it into six raid shards.

use std::path::{Path, PathBuf};

use cloudraid::crypto::{CryptDirection, TransferCipher};
use cloudraid::raid::{encode_shards, raid_part_size, FilePiece, RAIDPARTS};
use cloudraid::transfer::crypt_whole_chunks;

use super::common::{parse_iv, parse_key};
use crate::error::CliError;

/// Arguments for the shard command.
pub struct ShardArgs {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub key: String,
    pub iv: String,
}

/// File name of shard `part` inside a shard directory.
pub fn shard_file_name(part: usize) -> String {
    format!("part{}", part)
}

/// Run the shard command.
pub fn run(args: ShardArgs) -> Result<(), CliError> {
    let key = parse_key(&args.key)?;
    let iv = parse_iv(&args.iv)?;

    let data = std::fs::read(&args.input)?;
    let size = data.len() as u64;
    tracing::info!(input = %args.input.display(), size, "Sharding file");

    let cipher = TransferCipher::new(&key);
    let mut piece = FilePiece::from_vec(0, data);
    crypt_whole_chunks(&mut piece, &cipher, iv, size, CryptDirection::Encrypt);
    let meta_mac = piece.chunkmacs.macsmac(&cipher);
    let encrypted = piece.buf.data().unwrap_or_default();

    write_shards(encrypted, &args.output_dir)?;

    println!("Wrote {} shards to {}", RAIDPARTS, args.output_dir.display());
    for part in 0..RAIDPARTS {
        println!("  {}: {} bytes", shard_file_name(part), raid_part_size(part, size));
    }
    println!("File size: {}", size);
    println!("Meta MAC:  {}", hex::encode(meta_mac.0));
    Ok(())
}

fn write_shards(encrypted: &[u8], dir: &Path) -> Result<(), CliError> {
    std::fs::create_dir_all(dir)?;
    for (part, shard) in encode_shards(encrypted).iter().enumerate() {
        std::fs::write(dir.join(shard_file_name(part)), shard)?;
    }
    Ok(())
}
