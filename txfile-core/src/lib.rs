//! # txfile-core
//!
//! Transactional, crash-consistent writes for ordinary files.
//!
//! A data file opened through this crate gets a hidden sibling journal
//! directory (`dir/.name.jio`). Every committed transaction is first
//! serialized to a record file in that directory and fsynced; only then are
//! its operations applied to the data file. After a crash at any point,
//! [`check::check`] replays the records that made it to stable storage and
//! discards the ones that did not, so the data file always reflects either
//! all or none of each transaction.
//!
//! This crate provides:
//! - Grouped write transactions with byte-range locking and rollback
//! - A CRC-checked on-disk record format
//! - Crash recovery (`check`) and journal cleanup
//! - Journaled positional and streaming I/O wrappers on the file handle
//!
//! ```no_run
//! use txfile_core::TxFile;
//!
//! # fn main() -> txfile_core::Result<()> {
//! let file = TxFile::options().write(true).create(true).open("/tmp/data")?;
//! let txn = file.transaction();
//! txn.add(b"hello", 0)?;
//! txn.add(b"world", 100)?;
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod check;
pub mod error;
pub mod file;
mod fsio;
pub mod journal;
pub mod lock;
pub mod record;
pub mod trans;

pub use check::{check, cleanup, CheckResult};
pub use error::{Error, Result};
pub use file::{OpenOptions, TxFile};
pub use journal::journal_dir_for;
pub use record::{Record, RecordOp};
pub use trans::Transaction;

/// Fixed record header size in bytes: id + flags + numops.
pub const DISK_HEADER_SIZE: usize = 12;

/// Per-operation header size in bytes: len + plen + offset.
pub const DISK_OP_HEADER_SIZE: usize = 16;

/// Trailing checksum size in bytes.
pub const TRAILER_SIZE: usize = 4;

/// Name of the transaction-counter lock file inside the journal directory.
pub const LOCK_FILE_NAME: &str = "lock";
