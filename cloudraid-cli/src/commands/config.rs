//! Configuration management CLI commands.

use clap::Subcommand;
use cloudraid::config::{config_file_path, ConfigFile};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the configuration file path
    Path,
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => run_show(),
        ConfigCommands::Init { force } => run_init(force),
        ConfigCommands::Path => run_path(),
    }
}

fn run_show() -> Result<(), CliError> {
    let config = ConfigFile::load()?;
    let mut out = std::io::stdout();
    config.to_ini().write_to(&mut out)?;
    Ok(())
}

fn run_init(force: bool) -> Result<(), CliError> {
    let path = config_file_path()
        .ok_or_else(|| CliError::Config("no configuration directory on this system".to_string()))?;
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        )));
    }
    ConfigFile::default().save_to(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn run_path() -> Result<(), CliError> {
    match config_file_path() {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => Err(CliError::Config("no configuration directory on this system".to_string())),
    }
}
