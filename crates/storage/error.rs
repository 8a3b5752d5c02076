use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("ledger record at {path}:{line} is corrupt: {reason}")]
    CorruptLedger {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("journal file {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("journal entry {0} is not pending")]
    UnknownEntry(u64),
}

impl From<std::io::Error> for JournalError {
    fn from(err: std::io::Error) -> Self {
        JournalError::Store(StoreError::Io(err))
    }
}
