//! CLI error type.

use std::fmt;

use cloudraid::config::ConfigError;
use cloudraid::transfer::FileIoError;
use cloudraid::TransferError;

/// Errors surfaced to the user by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Bad command-line argument.
    Argument(String),
    /// Configuration could not be loaded or saved.
    Config(String),
    /// Local file access failed.
    Io(String),
    /// The transfer engine gave up.
    Transfer(TransferError),
    /// Interrupted by Ctrl+C; progress has been saved.
    Interrupted,
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Argument(msg) => write!(f, "Invalid argument: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Io(msg) => write!(f, "I/O error: {}", msg),
            CliError::Transfer(e) => write!(f, "Transfer failed: {}", e),
            CliError::Interrupted => write!(f, "Interrupted"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<TransferError> for CliError {
    fn from(e: TransferError) -> Self {
        CliError::Transfer(e)
    }
}

impl From<FileIoError> for CliError {
    fn from(e: FileIoError) -> Self {
        CliError::Io(e.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e.to_string())
    }
}
