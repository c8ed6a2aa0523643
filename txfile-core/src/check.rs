//! Journal recovery and cleanup.
//!
//! [`check`] scans a file's journal directory for record files that survived
//! a crash, classifies each one, and re-commits the records that are fully
//! durable and checksum-valid, in ascending ID order. Recovering in any
//! other order would corrupt the file: a later transaction may overwrite
//! regions an earlier one touched, and the replay has to reproduce that
//! ordering.
//!
//! [`cleanup`] removes the journal directory once the caller has decided
//! the data file is consistent (normally right after a successful check).

use crate::error::{Error, Result};
use crate::file::TxFile;
use crate::journal::{parse_record_filename, Journal};
use crate::lock;
use crate::record;
use crate::trans::{commit_prepared, Operation, TransState};
use crate::{journal_dir_for, DISK_HEADER_SIZE, LOCK_FILE_NAME};
use memmap2::Mmap;
use serde::Serialize;
use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Outcome of a journal check, one counter per record classification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    /// Record IDs examined (every ID from 1 to the highest found).
    pub total: u32,
    /// IDs with no record file behind them.
    pub invalid: u32,
    /// Records locked by a live process, skipped.
    pub in_progress: u32,
    /// Records too short or structurally invalid (torn before completion).
    pub broken: u32,
    /// Records whose checksum does not verify.
    pub corrupt: u32,
    /// Valid records whose re-commit failed.
    pub apply_error: u32,
    /// Records successfully re-applied to the data file.
    pub reapplied: u32,
}

/// Checks the journal of `path` and re-applies every recoverable record.
///
/// The journal directory is derived from the data-file path unless
/// `journal_dir` overrides it. Returns [`Error::NoFile`] when the data file
/// is missing and [`Error::NoJournal`] when the journal directory or its
/// lock file is absent.
pub fn check(path: impl AsRef<Path>, journal_dir: Option<&Path>) -> Result<CheckResult> {
    let path = path.as_ref();

    // Synchronous writes: the replay must be durable the moment it happens.
    let data = match fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(path)
    {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::NoFile {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    let journal = Journal::open(path, journal_dir, false)?;

    // Highest ID present, so the counter can be rewritten to keep future
    // commits clear of the surviving records.
    let mut maxtid = 0u32;
    for entry in fs::read_dir(journal.dir())? {
        let entry = entry?;
        if let Some(id) = parse_record_filename(&entry.file_name().to_string_lossy()) {
            maxtid = maxtid.max(id);
        }
    }
    journal.set_counter(maxtid)?;

    let file = TxFile::from_parts(data, path.to_path_buf(), 0, Some(journal));
    let journal = file.journal()?;

    let mut res = CheckResult::default();
    for id in 1..=maxtid {
        res.total += 1;
        let record_path = journal.record_path(id);

        let record_file = match fs::OpenOptions::new().read(true).write(true).open(&record_path)
        {
            Ok(f) => f,
            Err(_) => {
                res.invalid += 1;
                continue;
            }
        };

        // A held lock means the owning process is still committing it.
        match lock::try_lock_exclusive(&record_file, 0, 0) {
            Ok(()) => {}
            Err(Error::WouldBlock) => {
                res.in_progress += 1;
                continue;
            }
            Err(e) => return Err(e),
        }

        let map = match unsafe { Mmap::map(&record_file) } {
            Ok(m) => m,
            Err(_) => {
                res.broken += 1;
                continue;
            }
        };
        if map.len() < DISK_HEADER_SIZE {
            res.broken += 1;
            continue;
        }

        let parsed = match record::decode(&map) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(id, error = %e, "skipping broken record");
                res.broken += 1;
                continue;
            }
        };

        if let Err(e) = record::verify_checksum(&map) {
            tracing::warn!(id, error = %e, "skipping corrupt record");
            res.corrupt += 1;
            continue;
        }
        drop(map);

        // Flags are cleared so the re-commit is unconditional, and the
        // pre-images are recaptured from the current file contents.
        let len = parsed.ops.iter().map(|op| op.payload.len() as u64).sum();
        let mut state = TransState {
            id: parsed.id,
            flags: 0,
            ops: parsed
                .ops
                .into_iter()
                .map(|op| Operation {
                    buf: op.payload,
                    offset: op.offset,
                    pre: None,
                    truncate_to: None,
                })
                .collect(),
            len,
        };

        match commit_prepared(&file, &mut state) {
            Ok(_) => {
                fs::remove_file(&record_path)?;
                journal.sync_dir()?;
                res.reapplied += 1;
            }
            Err(e) => {
                tracing::warn!(id, error = %e, "failed to re-apply record");
                res.apply_error += 1;
            }
        }
    }

    tracing::info!(
        total = res.total,
        reapplied = res.reapplied,
        broken = res.broken,
        corrupt = res.corrupt,
        "journal check finished"
    );
    Ok(res)
}

/// Removes every record file and the lock file from the journal directory,
/// then the directory itself. Unknown entries are left alone (and make the
/// directory removal fail). A missing directory counts as already clean.
pub fn cleanup(path: impl AsRef<Path>, journal_dir: Option<&Path>) -> Result<()> {
    let dir = match journal_dir {
        Some(d) => d.to_path_buf(),
        None => journal_dir_for(path.as_ref()),
    };

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == LOCK_FILE_NAME || parse_record_filename(&name).is_some() {
            fs::remove_file(entry.path())?;
        }
    }

    fs::remove_dir(&dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Leaves the journal in the state a process killed after making the
    /// record durable (but before applying it) would leave behind.
    fn plant_record(data: &Path, id: u32, ops: &[(&[u8], Option<&[u8]>, u64)]) {
        let journal = Journal::open(data, None, true).unwrap();
        let ops: Vec<Operation> = ops
            .iter()
            .map(|(buf, pre, offset)| Operation {
                buf: buf.to_vec(),
                offset: *offset,
                pre: pre.map(|p| p.to_vec()),
                truncate_to: None,
            })
            .collect();
        let encoded = record::encode(id, 0, &ops);
        fs::write(journal.record_path(id), &encoded).unwrap();
        journal.set_counter(journal.counter().max(id)).unwrap();
    }

    #[test]
    fn durable_record_is_reapplied() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("d");
        fs::write(&data, b"hello").unwrap();
        plant_record(&data, 1, &[(b"WORLD", Some(b"hello"), 0)]);

        let res = check(&data, None).unwrap();
        assert_eq!(res.total, 1);
        assert_eq!(res.reapplied, 1);
        assert_eq!(res.broken + res.corrupt + res.invalid + res.apply_error, 0);
        assert_eq!(fs::read(&data).unwrap(), b"WORLD");

        // The record is gone, so a second run has nothing to do.
        let res = check(&data, None).unwrap();
        assert_eq!(res.total, 0);
        assert_eq!(res.reapplied, 0);
        assert_eq!(fs::read(&data).unwrap(), b"WORLD");
    }

    #[test]
    fn torn_record_is_broken_and_skipped() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("d");
        fs::write(&data, b"hello").unwrap();
        plant_record(&data, 1, &[(b"WORLD", Some(b"hello"), 0)]);

        // Tear the record the way a crash mid-write would.
        let record_path = journal_dir_for(&data).join("1");
        let full = fs::read(&record_path).unwrap();
        fs::write(&record_path, &full[..full.len() / 2]).unwrap();

        let res = check(&data, None).unwrap();
        assert_eq!(res.total, 1);
        assert_eq!(res.broken, 1);
        assert_eq!(res.reapplied, 0);
        assert_eq!(fs::read(&data).unwrap(), b"hello");
    }

    #[test]
    fn bit_flipped_record_is_corrupt_and_skipped() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("d");
        fs::write(&data, b"hello").unwrap();
        plant_record(&data, 1, &[(b"WORLD", Some(b"hello"), 0)]);

        let record_path = journal_dir_for(&data).join("1");
        let mut bytes = fs::read(&record_path).unwrap();
        let n = bytes.len();
        bytes[n - 6] ^= 0x01; // inside the pre-image, lengths stay intact
        fs::write(&record_path, &bytes).unwrap();

        let res = check(&data, None).unwrap();
        assert_eq!(res.total, 1);
        assert_eq!(res.corrupt, 1);
        assert_eq!(res.reapplied, 0);
        assert_eq!(fs::read(&data).unwrap(), b"hello");
    }

    #[test]
    fn gaps_in_the_id_space_count_as_invalid() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("d");
        fs::write(&data, b"....").unwrap();
        plant_record(&data, 3, &[(b"ZZ", Some(b".."), 0)]);

        let res = check(&data, None).unwrap();
        assert_eq!(res.total, 3);
        assert_eq!(res.invalid, 2);
        assert_eq!(res.reapplied, 1);
        assert_eq!(fs::read(&data).unwrap(), b"ZZ..");
    }

    #[test]
    fn records_replay_in_ascending_id_order() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("d");
        fs::write(&data, b"hello").unwrap();
        plant_record(&data, 1, &[(b"AAAA", Some(b"hell"), 0)]);
        plant_record(&data, 2, &[(b"BB", Some(b"el"), 1)]);

        let res = check(&data, None).unwrap();
        assert_eq!(res.reapplied, 2);
        // 1 then 2: "hello" -> "AAAAo" -> "ABBAo".
        assert_eq!(fs::read(&data).unwrap(), b"ABBAo");
    }

    #[test]
    fn multi_op_record_applies_atomically() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("d");
        fs::write(&data, &[0u8; 12]).unwrap();
        plant_record(
            &data,
            1,
            &[(b"11", Some(&[0, 0]), 0), (b"22", Some(&[0, 0]), 8)],
        );

        let res = check(&data, None).unwrap();
        assert_eq!(res.reapplied, 1);
        assert_eq!(fs::read(&data).unwrap(), b"11\0\0\0\0\0\022\0\0");
    }

    #[test]
    fn missing_data_file() {
        let dir = TempDir::new().unwrap();
        let err = check(dir.path().join("nope"), None).unwrap_err();
        assert!(matches!(err, Error::NoFile { .. }));
    }

    #[test]
    fn missing_journal() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("d");
        fs::write(&data, b"content").unwrap();

        let err = check(&data, None).unwrap_err();
        assert!(matches!(err, Error::NoJournal { .. }));
    }

    #[test]
    fn counter_is_rewritten_from_the_scan() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("d");
        fs::write(&data, b"abcd").unwrap();
        plant_record(&data, 9, &[(b"wxyz", Some(b"abcd"), 0)]);

        check(&data, None).unwrap();

        let journal = Journal::open(&data, None, false).unwrap();
        assert!(journal.counter() >= 9);
    }

    #[test]
    fn cleanup_removes_the_directory_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("d");
        fs::write(&data, b"hello").unwrap();
        plant_record(&data, 1, &[(b"x", Some(b"h"), 0)]);

        cleanup(&data, None).unwrap();
        assert!(!journal_dir_for(&data).exists());

        cleanup(&data, None).unwrap();
    }

    #[test]
    fn cleanup_leaves_unknown_entries_alone() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("d");
        fs::write(&data, b"hello").unwrap();
        let jdir = journal_dir_for(&data);
        fs::create_dir(&jdir).unwrap();
        fs::write(jdir.join("lock"), 0u32.to_le_bytes()).unwrap();
        fs::write(jdir.join("stray.txt"), b"keep me").unwrap();

        assert!(cleanup(&data, None).is_err());
        assert!(jdir.join("stray.txt").exists());
        assert!(!jdir.join("lock").exists());
    }
}
