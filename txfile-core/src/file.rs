//! The journal-attached file handle.
//!
//! [`TxFile`] wraps an open data file together with its journal directory,
//! lock file and counter mmap. Transactions are started with
//! [`TxFile::transaction`]; the handle also offers journaled equivalents of
//! the usual positional and streaming file operations, where every write
//! goes through a single-operation transaction.

use crate::error::{Error, Result};
use crate::fsio;
use crate::journal::Journal;
use crate::lock;
use crate::trans::{Transaction, F_LINGER, F_NOLOCK, F_NOROLLBACK, F_RDONLY};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, IoSlice, IoSliceMut, Read, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Options for opening a [`TxFile`], mirroring `std::fs::OpenOptions` plus
/// the journaling flags.
///
/// A handle opened without `write` is read-only: no journal directory is
/// created and every transaction operation fails. Writable handles are
/// always opened read+write, because committing reads pre-images back and
/// exclusive `fcntl` locks require write access.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    write: bool,
    create: bool,
    create_new: bool,
    truncate: bool,
    mode: u32,
    no_lock: bool,
    no_rollback: bool,
    linger: bool,
    journal_dir: Option<PathBuf>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        OpenOptions {
            write: false,
            create: false,
            create_new: false,
            truncate: false,
            mode: 0o666,
            no_lock: false,
            no_rollback: false,
            linger: false,
            journal_dir: None,
        }
    }

    /// Opens for writing (and reading; see the type-level note).
    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Creates the data file if it does not exist.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Fails if the data file already exists.
    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    /// Truncates the data file on open.
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Permission bits for newly created files.
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Skips data-file range locking. Only safe when the caller guarantees
    /// a single writer.
    pub fn no_lock(mut self, no_lock: bool) -> Self {
        self.no_lock = no_lock;
        self
    }

    /// Skips pre-image capture; transactions on this handle cannot be
    /// rolled back.
    pub fn no_rollback(mut self, no_rollback: bool) -> Self {
        self.no_rollback = no_rollback;
        self
    }

    /// Defers record-file unlink after commit until [`TxFile::sync`],
    /// trading a larger recovery window for fewer directory fsyncs.
    pub fn linger(mut self, linger: bool) -> Self {
        self.linger = linger;
        self
    }

    /// Uses the given directory for the journal instead of the derived
    /// `dir/.name.jio` sibling.
    pub fn journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    /// Opens the data file and attaches (creating if needed) its journal.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<TxFile> {
        let path = path.as_ref();

        let file = fs::OpenOptions::new()
            .read(true)
            .write(self.write)
            .create(self.write && self.create)
            .create_new(self.write && self.create_new)
            .truncate(self.write && self.truncate)
            .mode(self.mode)
            .open(path)?;

        let mut flags = 0;
        if self.no_lock {
            flags |= F_NOLOCK;
        }
        if self.no_rollback {
            flags |= F_NOROLLBACK;
        }
        if self.linger {
            flags |= F_LINGER;
        }

        let journal = if self.write {
            Some(Journal::open(path, self.journal_dir.as_deref(), true)?)
        } else {
            flags |= F_RDONLY;
            None
        };

        Ok(TxFile {
            file,
            path: path.to_path_buf(),
            flags,
            journal,
            pos_lock: Mutex::new(()),
            lingering: Mutex::new(Vec::new()),
        })
    }
}

struct Linger {
    id: u32,
    path: PathBuf,
}

/// An open, journal-attached data file.
///
/// The handle owns the data-file descriptor, the journal directory handle,
/// the lock file and the mmap of its transaction counter; all are released
/// together on drop. Lingering transactions still on disk are flushed on
/// drop as well, on a best-effort basis — call [`close`](TxFile::close) to
/// observe errors.
pub struct TxFile {
    file: File,
    path: PathBuf,
    flags: u32,
    journal: Option<Journal>,
    /// Serializes operations that depend on the shared file position.
    pos_lock: Mutex<()>,
    /// Committed-but-not-unlinked records, in linger mode.
    lingering: Mutex<Vec<Linger>>,
}

impl TxFile {
    /// Opens an existing file read-write with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<TxFile> {
        Self::options().write(true).open(path)
    }

    /// Returns an options builder.
    pub fn options() -> OpenOptions {
        OpenOptions::new()
    }

    /// Starts an empty transaction against this file.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the handle rejects all transaction operations.
    pub fn is_read_only(&self) -> bool {
        self.flags & F_RDONLY != 0
    }

    /// Current journal directory, if the handle is writable.
    pub fn journal_dir(&self) -> Option<&Path> {
        self.journal.as_ref().map(|j| j.dir())
    }

    /// Fsyncs the data file once, then unlinks every lingering record.
    ///
    /// This is the sync point linger mode defers to: the data of every
    /// lingering transaction was already fsynced by its commit, so dropping
    /// the records afterwards preserves "committed data on disk before
    /// record unlink". A no-op on read-only handles.
    pub fn sync(&self) -> Result<()> {
        let Some(journal) = self.journal.as_ref() else {
            return Ok(());
        };
        self.file.sync_all()?;

        let drained: Vec<Linger> = {
            let mut lingering = self.lingering.lock();
            lingering.drain(..).collect()
        };
        for entry in &drained {
            if let Err(e) = fs::remove_file(&entry.path) {
                tracing::warn!(id = entry.id, error = %e, "failed to unlink lingering record");
            }
        }
        if !drained.is_empty() {
            journal.sync_dir()?;
        }
        Ok(())
    }

    /// Relocates the journal directory via rename.
    ///
    /// Taking `&mut self` guarantees no transaction of this handle is in
    /// flight; lingering records are flushed first, and records locked by
    /// other processes make the move fail with [`Error::Busy`]. Fails with
    /// [`Error::DestinationExists`] if `new_path` exists.
    pub fn move_journal(&mut self, new_path: impl AsRef<Path>) -> Result<()> {
        self.sync()?;
        let journal = self.journal.as_mut().ok_or(Error::ReadOnly)?;
        journal.move_to(new_path.as_ref())
    }

    /// Closes the handle, flushing lingering records and reporting any
    /// error doing so.
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    // --- journaled I/O wrappers ---

    /// Reads from the current position, advancing it. The region is
    /// range-locked for the duration unless the handle skips locking.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let _pos = self.pos_lock.lock();
        let pos = (&self.file).stream_position()?;
        let n = self.locked_read_at(buf, pos)?;
        (&self.file).seek(SeekFrom::Start(pos + n as u64))?;
        Ok(n)
    }

    /// Reads at an absolute offset without touching the file position.
    /// Returns the number of bytes read; short counts mean EOF.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.locked_read_at(buf, offset)
    }

    /// Reads into multiple buffers from the current position.
    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let _pos = self.pos_lock.lock();
        let pos = (&self.file).stream_position()?;
        let total: u64 = bufs.iter().map(|b| b.len() as u64).sum();

        let locked = self.lock_region(pos, total)?;
        let result = (&self.file).read_vectored(bufs);
        self.unlock_region(locked, pos, total);
        let n = result?;

        (&self.file).seek(SeekFrom::Start(pos + n as u64))?;
        Ok(n)
    }

    /// Writes at the current position as a single-operation transaction,
    /// advancing the position on success.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let _pos = self.pos_lock.lock();
        let pos = (&self.file).stream_position()?;

        let txn = self.transaction();
        txn.add(buf, pos)?;
        txn.commit()?;

        (&self.file).seek(SeekFrom::Start(pos + buf.len() as u64))?;
        Ok(buf.len())
    }

    /// Writes at an absolute offset as a single-operation transaction.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let txn = self.transaction();
        txn.add(buf, offset)?;
        txn.commit()?;
        Ok(buf.len())
    }

    /// Writes multiple buffers at the current position as one transaction,
    /// so the whole group applies atomically.
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let _pos = self.pos_lock.lock();
        let pos = (&self.file).stream_position()?;

        let txn = self.transaction();
        let mut offset = pos;
        for buf in bufs {
            txn.add(buf, offset)?;
            offset += buf.len() as u64;
        }
        txn.commit()?;

        (&self.file).seek(SeekFrom::Start(offset))?;
        Ok((offset - pos) as usize)
    }

    /// Truncates the data file, holding a range lock from `len` to EOF.
    /// Not journaled: there is no record to replay, so use with care.
    pub fn truncate(&self, len: u64) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let locked = self.lock_region(len, 0)?;
        let result = self.file.set_len(len);
        self.unlock_region(locked, len, 0);
        result?;
        Ok(())
    }

    /// Repositions the shared file cursor.
    pub fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let _pos = self.pos_lock.lock();
        Ok((&self.file).seek(pos)?)
    }

    // --- crate-internal plumbing ---

    pub(crate) fn from_parts(
        file: File,
        path: PathBuf,
        flags: u32,
        journal: Option<Journal>,
    ) -> TxFile {
        TxFile {
            file,
            path,
            flags,
            journal,
            pos_lock: Mutex::new(()),
            lingering: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn data(&self) -> &File {
        &self.file
    }

    pub(crate) fn flags(&self) -> u32 {
        self.flags
    }

    pub(crate) fn journal(&self) -> Result<&Journal> {
        self.journal.as_ref().ok_or(Error::ReadOnly)
    }

    pub(crate) fn push_linger(&self, id: u32, path: PathBuf) {
        self.lingering.lock().push(Linger { id, path });
    }

    fn lock_region(&self, offset: u64, len: u64) -> Result<bool> {
        if self.flags & F_NOLOCK != 0 {
            return Ok(false);
        }
        lock::lock_exclusive(&self.file, offset, len)?;
        Ok(true)
    }

    fn unlock_region(&self, locked: bool, offset: u64, len: u64) {
        if locked {
            let _ = lock::unlock(&self.file, offset, len);
        }
    }

    fn locked_read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let locked = self.lock_region(offset, buf.len() as u64)?;
        let result = fsio::read_full_at(&self.file, buf, offset);
        self.unlock_region(locked, offset, buf.len() as u64);
        Ok(result?)
    }
}

impl Drop for TxFile {
    fn drop(&mut self) {
        if self.journal.is_some() {
            let _ = self.sync();
        }
    }
}

impl Read for &TxFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TxFile::read(self, buf).map_err(Into::into)
    }
}

impl io::Write for &TxFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TxFile::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        TxFile::sync(self).map_err(Into::into)
    }
}

impl Seek for &TxFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        TxFile::seek(self, pos).map_err(Into::into)
    }
}
