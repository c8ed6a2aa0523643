//! Transactions and the commit engine.
//!
//! A [`Transaction`] is an ordered group of (buffer, offset) write
//! operations against its parent [`TxFile`]. Committing runs the journaled
//! protocol:
//!
//! 1. Reserve a transaction ID and create the record file under a
//!    whole-file lock.
//! 2. Range-lock the union of the operations' regions on the data file.
//! 3. Capture each operation's pre-image (the bytes it will replace).
//! 4. Serialize the record, fsync it, fsync the journal directory.
//! 5. Apply the operations to the data file and fsync it.
//! 6. Unlink the record (or keep it until [`TxFile::sync`] in linger mode).
//!
//! Step 4 is the point of no return: a crash before it leaves the data file
//! untouched, a crash after it leaves a durable record that recovery will
//! re-apply.

use crate::error::{Error, Result};
use crate::file::TxFile;
use crate::lock::{self, RegionGuard};
use crate::record;
use crate::{fsio, journal::Journal};
use parking_lot::Mutex;
use std::fs;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

// Flag bits, shared between handles, transactions and the on-disk record
// header.
pub(crate) const F_NOLOCK: u32 = 1;
pub(crate) const F_NOROLLBACK: u32 = 2;
pub(crate) const F_LINGER: u32 = 4;
pub(crate) const F_COMMITTED: u32 = 8;
pub(crate) const F_ROLLBACKED: u32 = 16;
pub(crate) const F_ROLLBACKING: u32 = 32;
pub(crate) const F_RDONLY: u32 = 64;

/// Upper bound on a transaction's cumulative payload, chosen so the record
/// file size can never overflow a signed 64-bit length even with the
/// per-operation headers and pre-images included.
pub(crate) const MAX_TRANS_SIZE: u64 = i64::MAX as u64 / 32;

/// A single write operation of a transaction.
#[derive(Debug, Clone)]
pub(crate) struct Operation {
    /// New payload.
    pub(crate) buf: Vec<u8>,
    /// Absolute offset in the data file.
    pub(crate) offset: u64,
    /// Pre-image of the region, captured at commit time. `None` until then
    /// (or forever, under the no-rollback flag). Never longer than `buf`.
    pub(crate) pre: Option<Vec<u8>>,
    /// Truncate the data file to this length before applying the payload.
    /// Set only on the inverse operations a rollback builds, to undo a
    /// file extension.
    pub(crate) truncate_to: Option<u64>,
}

pub(crate) struct TransState {
    pub(crate) id: u32,
    pub(crate) flags: u32,
    pub(crate) ops: Vec<Operation>,
    pub(crate) len: u64,
}

/// A prepared or committed unit of atomic work.
///
/// Created by [`TxFile::transaction`]; operations are appended with
/// [`add`](Transaction::add) and the whole group is made durable with
/// [`commit`](Transaction::commit). Buffers passed to `add` are copied, so
/// the caller may reuse them immediately. Dropping a transaction frees its
/// buffers; an uncommitted transaction leaves no trace.
pub struct Transaction<'a> {
    file: &'a TxFile,
    state: Mutex<TransState>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(file: &'a TxFile) -> Self {
        Transaction {
            file,
            state: Mutex::new(TransState {
                id: 0,
                flags: file.flags(),
                ops: Vec::new(),
                len: 0,
            }),
        }
    }

    /// The ID assigned at commit time, 0 before that.
    pub fn id(&self) -> u32 {
        self.state.lock().id
    }

    /// Appends a write of `buf` at `offset` to the transaction.
    pub fn add(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut st = self.state.lock();
        if st.flags & F_RDONLY != 0 {
            return Err(Error::ReadOnly);
        }
        if st.flags & F_COMMITTED != 0 {
            return Err(Error::AlreadyCommitted);
        }
        if st.flags & F_ROLLBACKED != 0 {
            return Err(Error::AlreadyRolledBack);
        }
        if buf.is_empty() {
            return Err(Error::EmptyOperation);
        }
        if buf.len() as u64 > u32::MAX as u64 {
            return Err(Error::TooLarge);
        }
        offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::TooLarge)?;
        let len = st.len + buf.len() as u64;
        if len > MAX_TRANS_SIZE {
            return Err(Error::TooLarge);
        }

        st.ops.push(Operation {
            buf: buf.to_vec(),
            offset,
            pre: None,
            truncate_to: None,
        });
        st.len = len;
        Ok(())
    }

    /// Commits the transaction atomically. Returns the number of payload
    /// bytes written to the data file.
    pub fn commit(&self) -> Result<u64> {
        let mut st = self.state.lock();
        if st.ops.is_empty() {
            return Err(Error::EmptyTransaction);
        }
        if st.flags & F_COMMITTED != 0 {
            return Err(Error::AlreadyCommitted);
        }
        if st.flags & F_ROLLBACKED != 0 {
            return Err(Error::AlreadyRolledBack);
        }
        if st.flags & F_RDONLY != 0 {
            return Err(Error::ReadOnly);
        }
        commit_prepared(self.file, &mut st)
    }

    /// Reverts a committed transaction by committing its inverse: every
    /// operation's pre-image is written back, in reverse order, and file
    /// extensions are truncated away.
    ///
    /// This restores the pre-commit content only if nothing else has touched
    /// the regions in between; in particular, if another writer extended the
    /// file past a region this transaction extended, the truncation cuts
    /// those bytes off.
    pub fn rollback(&self) -> Result<u64> {
        let mut st = self.state.lock();
        if st.flags & F_NOROLLBACK != 0 {
            return Err(Error::RollbackDisabled);
        }
        if st.flags & F_ROLLBACKED != 0 {
            return Err(Error::AlreadyRolledBack);
        }
        if st.flags & F_COMMITTED == 0 {
            return Err(Error::NotCommitted);
        }

        let mut ops = Vec::with_capacity(st.ops.len());
        for op in st.ops.iter().rev() {
            let pre = op.pre.clone().ok_or(Error::RollbackDisabled)?;
            let truncate_to = if (pre.len() as u64) < op.buf.len() as u64 {
                Some(op.offset + pre.len() as u64)
            } else {
                None
            };
            ops.push(Operation {
                buf: pre.clone(),
                offset: op.offset,
                pre: Some(pre),
                truncate_to,
            });
        }

        let len = ops.iter().map(|op| op.buf.len() as u64).sum();
        let mut inverse = TransState {
            id: 0,
            flags: (st.flags & (F_NOLOCK | F_LINGER)) | F_ROLLBACKING,
            ops,
            len,
        };

        let written = commit_prepared(self.file, &mut inverse)?;
        st.flags |= F_ROLLBACKED;
        Ok(written)
    }

    /// Whether the transaction has been committed.
    pub fn is_committed(&self) -> bool {
        self.state.lock().flags & F_COMMITTED != 0
    }

    /// Whether the transaction has been rolled back.
    pub fn is_rolled_back(&self) -> bool {
        self.state.lock().flags & F_ROLLBACKED != 0
    }
}

/// Runs the commit protocol on an already-validated transaction state.
///
/// Shared by [`Transaction::commit`], rollback (which commits an inverse
/// transaction) and recovery (which re-commits records decoded from disk).
/// On failure every acquired resource is released and the partial record
/// file is unlinked.
pub(crate) fn commit_prepared(file: &TxFile, state: &mut TransState) -> Result<u64> {
    let journal = file.journal()?;

    // Internal callers reuse states that went through a terminal path.
    state.flags &= !(F_COMMITTED | F_ROLLBACKED);

    let id = journal.next_id()?;
    state.id = id;
    let record_path = journal.record_path(id);
    let record_file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&record_path)?;

    match apply_protocol(file, state, journal, &record_file, &record_path) {
        Ok(written) => {
            state.flags |= F_COMMITTED;
            tracing::debug!(id, written, "transaction committed");
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(&record_path);
            let _ = journal.sync_dir();
            Err(e)
        }
    }
}

fn apply_protocol(
    file: &TxFile,
    state: &mut TransState,
    journal: &Journal,
    record_file: &fs::File,
    record_path: &Path,
) -> Result<u64> {
    // The record file is ours for as long as it exists; recovery in another
    // process skips it while this lock is held.
    lock::lock_exclusive(record_file, 0, 0)?;

    let data = file.data();
    let mut regions = RegionGuard::new(data);
    if state.flags & F_NOLOCK == 0 {
        for (offset, len) in lock_ranges(&state.ops) {
            regions.lock(offset, len)?;
        }
    }

    // Snapshot the bytes each operation replaces. A short read means the
    // operation extends the file; the file is grown right away so later
    // operations (and the apply loop) see a well-defined region.
    if state.flags & F_NOROLLBACK == 0 {
        for op in &mut state.ops {
            if op.pre.is_some() {
                continue;
            }
            let mut pre = vec![0u8; op.buf.len()];
            let n = fsio::read_full_at(data, &mut pre, op.offset)?;
            pre.truncate(n);
            if n < op.buf.len() {
                data.set_len(op.offset + op.buf.len() as u64)?;
            }
            op.pre = Some(pre);
        }
    }

    let encoded = record::encode(state.id, state.flags, &state.ops);
    record_file.write_all_at(&encoded, 0)?;
    record_file.sync_all()?;
    journal.sync_dir()?;

    // Point of no return: the record is durable. From here on a crash is
    // recovered by re-applying it.
    let mut written = 0u64;
    let mut applied = 0usize;
    let mut failure: Option<Error> = None;
    for op in &state.ops {
        if let Some(len) = op.truncate_to {
            if let Err(e) = data.set_len(len) {
                failure = Some(e.into());
                break;
            }
        }
        if let Err(e) = data.write_all_at(&op.buf, op.offset) {
            failure = Some(e.into());
            break;
        }
        written += op.buf.len() as u64;
        applied += 1;
    }

    if let Some(err) = failure {
        if revert_applied(data, &state.ops[..(applied + 1).min(state.ops.len())]) {
            state.flags |= F_ROLLBACKED;
            let _ = data.sync_all();
        }
        return Err(err);
    }

    data.sync_all()?;

    if state.flags & F_LINGER != 0 {
        file.push_linger(state.id, record_path.to_path_buf());
    } else {
        journal.sync_dir()?;
        fs::remove_file(record_path)?;
        journal.sync_dir()?;
    }

    Ok(written)
}

/// Writes the captured pre-images back over a partially applied prefix, in
/// reverse order. Returns true only if every region was restored.
fn revert_applied(data: &fs::File, ops: &[Operation]) -> bool {
    for op in ops.iter().rev() {
        let Some(pre) = op.pre.as_deref() else {
            return false;
        };
        if (pre.len() as u64) < op.buf.len() as u64
            && data.set_len(op.offset + pre.len() as u64).is_err()
        {
            return false;
        }
        if data.write_all_at(pre, op.offset).is_err() {
            return false;
        }
    }
    true
}

/// Computes the ranges to lock for a set of operations: overlapping or
/// adjacent regions collapse into their union, disjoint ones stay separate
/// to minimize interference. Zero-length operations (the inverse of a pure
/// file extension) lock from their offset to EOF, covering the truncation.
fn lock_ranges(ops: &[Operation]) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut merged: Vec<(u64, u64)> = Vec::new();

    let mut spans: Vec<(u64, u64)> = Vec::new();
    for op in ops {
        if op.buf.is_empty() {
            ranges.push((op.offset, 0));
        } else {
            spans.push((op.offset, op.buf.len() as u64));
        }
    }
    spans.sort_unstable();

    for (offset, len) in spans {
        if let Some(last) = merged.last_mut() {
            let last_end = last.0 + last.1;
            if offset <= last_end {
                let end = (offset + len).max(last_end);
                last.1 = end - last.0;
                continue;
            }
        }
        merged.push((offset, len));
    }

    ranges.extend(merged);
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::TxFile;
    use crate::journal;
    use std::fs;
    use tempfile::TempDir;

    fn open(dir: &TempDir, name: &str, contents: &[u8]) -> TxFile {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        TxFile::options().write(true).open(&path).unwrap()
    }

    fn record_files(dir: &TempDir, name: &str) -> Vec<String> {
        let jdir = journal::journal_dir_for(dir.path().join(name));
        fs::read_dir(jdir)
            .unwrap()
            .filter_map(|e| {
                let name = e.unwrap().file_name().to_string_lossy().into_owned();
                journal::parse_record_filename(&name).map(|_| name)
            })
            .collect()
    }

    #[test]
    fn single_write_is_applied_and_record_removed() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", b"");

        let txn = file.transaction();
        txn.add(b"ABCDE", 0).unwrap();
        assert_eq!(txn.commit().unwrap(), 5);
        assert!(txn.is_committed());
        assert_eq!(txn.id(), 1);

        assert_eq!(fs::read(dir.path().join("d")).unwrap(), b"ABCDE");
        assert!(record_files(&dir, "d").is_empty());
    }

    #[test]
    fn operations_apply_in_order() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", b"..........");

        let txn = file.transaction();
        txn.add(b"AAAA", 2).unwrap();
        txn.add(b"BB", 4).unwrap();
        txn.commit().unwrap();

        assert_eq!(fs::read(dir.path().join("d")).unwrap(), b"..AABB....");
    }

    #[test]
    fn touches_exactly_the_operation_ranges() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", &[0xEE; 32]);

        let txn = file.transaction();
        txn.add(&[1, 1], 4).unwrap();
        txn.add(&[2, 2, 2], 20).unwrap();
        txn.commit().unwrap();

        let mut expect = vec![0xEE; 32];
        expect[4..6].copy_from_slice(&[1, 1]);
        expect[20..23].copy_from_slice(&[2, 2, 2]);
        assert_eq!(fs::read(dir.path().join("d")).unwrap(), expect);
    }

    #[test]
    fn empty_transaction_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", b"x");
        let txn = file.transaction();
        assert!(matches!(txn.commit(), Err(Error::EmptyTransaction)));
    }

    #[test]
    fn zero_length_operation_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", b"x");
        let txn = file.transaction();
        assert!(matches!(txn.add(b"", 0), Err(Error::EmptyOperation)));
    }

    #[test]
    fn offset_overflow_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", b"x");
        let txn = file.transaction();
        assert!(matches!(txn.add(b"ab", u64::MAX), Err(Error::TooLarge)));
    }

    #[test]
    fn terminal_paths_are_not_repeatable() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", b"0123456789");

        let txn = file.transaction();
        txn.add(b"XXX", 2).unwrap();
        txn.commit().unwrap();
        assert!(matches!(txn.commit(), Err(Error::AlreadyCommitted)));
        assert!(matches!(txn.add(b"y", 0), Err(Error::AlreadyCommitted)));

        txn.rollback().unwrap();
        assert!(matches!(txn.rollback(), Err(Error::AlreadyRolledBack)));
    }

    #[test]
    fn rollback_restores_contents() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", b"0123456789");

        let txn = file.transaction();
        txn.add(b"XXX", 2).unwrap();
        txn.commit().unwrap();
        assert_eq!(fs::read(dir.path().join("d")).unwrap(), b"01XXX56789");

        txn.rollback().unwrap();
        assert!(txn.is_rolled_back());
        assert_eq!(fs::read(dir.path().join("d")).unwrap(), b"0123456789");
    }

    #[test]
    fn rollback_of_uncommitted_fails() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", b"x");
        let txn = file.transaction();
        txn.add(b"y", 0).unwrap();
        assert!(matches!(txn.rollback(), Err(Error::NotCommitted)));
    }

    #[test]
    fn extending_write_keeps_short_pre_image() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", b"hello");

        let txn = file.transaction();
        txn.add(b"WORLD!!", 3).unwrap();
        txn.commit().unwrap();
        assert_eq!(fs::read(dir.path().join("d")).unwrap(), b"helWORLD!!");

        // Rollback restores both the bytes and the original length.
        txn.rollback().unwrap();
        assert_eq!(fs::read(dir.path().join("d")).unwrap(), b"hello");
    }

    #[test]
    fn write_entirely_beyond_eof() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", b"ab");

        let txn = file.transaction();
        txn.add(b"ZZ", 8).unwrap();
        txn.commit().unwrap();

        let contents = fs::read(dir.path().join("d")).unwrap();
        assert_eq!(contents.len(), 10);
        assert_eq!(&contents[..2], b"ab");
        assert_eq!(&contents[2..8], &[0u8; 6]);
        assert_eq!(&contents[8..], b"ZZ");

        // Rollback truncates the written region away. The hole padding up
        // to the operation's offset stays: the record only knows the region
        // it touched, not how long the file was before it.
        txn.rollback().unwrap();
        let contents = fs::read(dir.path().join("d")).unwrap();
        assert_eq!(contents.len(), 8);
        assert_eq!(&contents[..2], b"ab");
        assert_eq!(&contents[2..], &[0u8; 6]);
    }

    #[test]
    fn no_rollback_handle_refuses_rollback() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("d");
        fs::write(&path, b"abcdef").unwrap();
        let file = TxFile::options()
            .write(true)
            .no_rollback(true)
            .open(&path)
            .unwrap();

        let txn = file.transaction();
        txn.add(b"123", 0).unwrap();
        txn.commit().unwrap();
        assert!(matches!(txn.rollback(), Err(Error::RollbackDisabled)));
        assert_eq!(fs::read(&path).unwrap(), b"123def");
    }

    #[test]
    fn linger_defers_unlink_until_sync() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("d");
        fs::write(&path, b"").unwrap();
        let file = TxFile::options()
            .write(true)
            .linger(true)
            .open(&path)
            .unwrap();

        let txn = file.transaction();
        txn.add(b"data", 0).unwrap();
        txn.commit().unwrap();

        assert_eq!(record_files(&dir, "d"), vec!["1".to_string()]);
        assert_eq!(fs::read(&path).unwrap(), b"data");

        file.sync().unwrap();
        assert!(record_files(&dir, "d").is_empty());
    }

    #[test]
    fn concurrent_commits_on_disjoint_ranges() {
        let dir = TempDir::new().unwrap();
        let file = open(&dir, "d", &[0u8; 16]);

        std::thread::scope(|s| {
            s.spawn(|| {
                let txn = file.transaction();
                txn.add(b"AA", 0).unwrap();
                txn.commit().unwrap();
            });
            s.spawn(|| {
                let txn = file.transaction();
                txn.add(b"BB", 10).unwrap();
                txn.commit().unwrap();
            });
        });

        let mut expect = vec![0u8; 16];
        expect[0..2].copy_from_slice(b"AA");
        expect[10..12].copy_from_slice(b"BB");
        assert_eq!(fs::read(dir.path().join("d")).unwrap(), expect);

        let jdir = journal::journal_dir_for(dir.path().join("d"));
        let counter = fs::read(jdir.join(crate::LOCK_FILE_NAME)).unwrap();
        assert!(u32::from_le_bytes(counter[..4].try_into().unwrap()) >= 2);
    }

    #[test]
    fn lock_ranges_coalesce_overlaps() {
        let op = |offset: u64, len: usize| Operation {
            buf: vec![0; len],
            offset,
            pre: None,
            truncate_to: None,
        };

        // Overlapping and adjacent ranges merge, disjoint ones stay apart.
        let ranges = lock_ranges(&[op(0, 4), op(2, 4), op(6, 2), op(100, 8)]);
        assert_eq!(ranges, vec![(0, 8), (100, 8)]);

        // A zero-length operation locks to EOF.
        let ranges = lock_ranges(&[op(32, 0)]);
        assert_eq!(ranges, vec![(32, 0)]);
    }
}
