//! Library error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while journaling, committing or recovering.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying storage error. The OS errno is preserved verbatim.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A non-blocking lock acquisition found the resource held elsewhere.
    #[error("lock held by another process")]
    WouldBlock,

    #[error("data file not found: {path}")]
    NoFile { path: PathBuf },

    #[error("no journal associated with {path}")]
    NoJournal { path: PathBuf },

    #[error("record corrupt: checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    Corrupt { expected: u32, actual: u32 },

    #[error("record malformed: {reason}")]
    Malformed { reason: String },

    #[error("transaction has no operations")]
    EmptyTransaction,

    #[error("zero-length operation")]
    EmptyOperation,

    #[error("operation would exceed the maximum transaction size")]
    TooLarge,

    #[error("transaction already committed")]
    AlreadyCommitted,

    #[error("transaction already rolled back")]
    AlreadyRolledBack,

    #[error("transaction was not committed")]
    NotCommitted,

    #[error("file handle is read-only")]
    ReadOnly,

    #[error("rollback is disabled for this file handle")]
    RollbackDisabled,

    #[error("journal has transactions in flight")]
    Busy,

    #[error("destination already exists: {path}")]
    DestinationExists { path: PathBuf },
}

impl Error {
    /// Returns whether this error means "somebody else holds the lock",
    /// so the caller can skip the resource and move on.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::Busy)
    }

    /// Returns the raw OS errno if this error carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::WouldBlock => std::io::Error::new(std::io::ErrorKind::WouldBlock, err),
            Error::NoFile { .. } => std::io::Error::new(std::io::ErrorKind::NotFound, err),
            other => std::io::Error::other(other),
        }
    }
}
