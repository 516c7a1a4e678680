//! Error type shared by every part of the crate.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A durable ledger line could not be trusted. Fatal at load.
    #[error("Malformed status line {line:?}: {reason}")]
    Ledger { line: String, reason: String },

    #[error("Failed to watch path: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The blocking read pass could not be joined.
    #[error("Read worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn ledger(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Ledger {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
