//! Journal directory management and transaction-ID allocation.
//!
//! Every journaled data file owns a hidden sibling directory,
//! `dir/.name.jio`, holding one record file per outstanding transaction plus
//! a 4-byte `lock` file. The lock file stores the highest transaction ID
//! issued so far (u32, little-endian) and is always accessed through an mmap
//! under a whole-file lock, so IDs stay unique across every process sharing
//! the directory.

use crate::error::{Error, Result};
use crate::lock;
use crate::LOCK_FILE_NAME;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Derives the journal directory path for a data file:
/// `dir(path)/.basename(path).jio`.
pub fn journal_dir_for(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!(".{base}.jio"))
}

/// Parses a journal directory entry name as a transaction ID.
///
/// Record files are named by their decimal ID without padding, so anything
/// that is not `[1-9][0-9]*` (including the literal `lock` file) is ignored.
pub fn parse_record_filename(name: &str) -> Option<u32> {
    if name.is_empty() || name.starts_with('0') || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// An open journal directory: the directory handle (kept for durable fsync
/// of renames and unlinks), the lock file, and the mmap of its counter.
#[derive(Debug)]
pub(crate) struct Journal {
    dir: PathBuf,
    dir_handle: File,
    lock_file: File,
    // The counter mmap. fcntl locks exclude other processes but not other
    // threads of this one, hence the mutex.
    map: Mutex<MmapMut>,
}

impl Journal {
    /// Opens the journal directory for `data_path`, or `dir_override` when
    /// given.
    ///
    /// With `create`, the directory and lock file are created as needed and
    /// a fresh counter is initialized to 0 under an exclusive lock (so two
    /// processes opening the same file for the first time cannot both
    /// initialize it). Without `create` (the recovery path) a missing or
    /// undersized piece yields [`Error::NoJournal`].
    pub(crate) fn open(
        data_path: &Path,
        dir_override: Option<&Path>,
        create: bool,
    ) -> Result<Journal> {
        let dir = match dir_override {
            Some(d) => d.to_path_buf(),
            None => journal_dir_for(data_path),
        };

        if create {
            match fs::create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }

        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(Error::NoJournal {
                    path: data_path.to_path_buf(),
                })
            }
        }

        let dir_handle = File::open(&dir)?;

        let lock_path = dir.join(LOCK_FILE_NAME);
        let lock_file = if create {
            fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(0o600)
                .open(&lock_path)?
        } else {
            match fs::OpenOptions::new().read(true).write(true).open(&lock_path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::NoJournal {
                        path: data_path.to_path_buf(),
                    })
                }
                Err(e) => return Err(e.into()),
            }
        };

        if create {
            lock::lock_exclusive(&lock_file, 0, 0)?;
            let init = (|| -> Result<()> {
                if lock_file.metadata()?.len() != 4 {
                    lock_file.write_all_at(&0u32.to_le_bytes(), 0)?;
                }
                Ok(())
            })();
            let _ = lock::unlock(&lock_file, 0, 0);
            init?;
        } else if lock_file.metadata()?.len() < 4 {
            return Err(Error::NoJournal {
                path: data_path.to_path_buf(),
            });
        }

        let map = unsafe { MmapOptions::new().len(4).map_mut(&lock_file)? };

        Ok(Journal {
            dir,
            dir_handle,
            lock_file,
            map: Mutex::new(map),
        })
    }

    /// Reserves the next transaction ID: counter + 1 with 0 skipped on
    /// 32-bit wrap, written back through the mmap under a whole-file lock.
    pub(crate) fn next_id(&self) -> Result<u32> {
        let mut map = self.map.lock();
        lock::lock_exclusive(&self.lock_file, 0, 0)?;
        let result = (|| -> Result<u32> {
            let cur = u32::from_le_bytes(map[..4].try_into().unwrap());
            let id = match cur.wrapping_add(1) {
                0 => 1,
                v => v,
            };
            map[..4].copy_from_slice(&id.to_le_bytes());
            map.flush()?;
            Ok(id)
        })();
        let _ = lock::unlock(&self.lock_file, 0, 0);
        result
    }

    /// Reads the current counter value.
    pub(crate) fn counter(&self) -> u32 {
        let map = self.map.lock();
        u32::from_le_bytes(map[..4].try_into().unwrap())
    }

    /// Overwrites the counter, used by recovery after scanning the directory
    /// so future commits do not collide with surviving IDs.
    pub(crate) fn set_counter(&self, value: u32) -> Result<()> {
        let mut map = self.map.lock();
        lock::lock_exclusive(&self.lock_file, 0, 0)?;
        let result = (|| -> Result<()> {
            map[..4].copy_from_slice(&value.to_le_bytes());
            map.flush()?;
            Ok(())
        })();
        let _ = lock::unlock(&self.lock_file, 0, 0);
        result
    }

    /// Path of the record file for transaction `id`.
    pub(crate) fn record_path(&self, id: u32) -> PathBuf {
        self.dir.join(id.to_string())
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fsyncs the directory itself, making record creations, renames and
    /// unlinks durable.
    pub(crate) fn sync_dir(&self) -> Result<()> {
        self.dir_handle.sync_all()?;
        Ok(())
    }

    /// Relocates the journal directory to `new_path` via rename.
    ///
    /// Fails if the destination exists or if any record file in the
    /// directory is locked by another process. The open handles stay valid
    /// across the rename (same inodes); only the stored path changes.
    pub(crate) fn move_to(&mut self, new_path: &Path) -> Result<()> {
        if fs::symlink_metadata(new_path).is_ok() {
            return Err(Error::DestinationExists {
                path: new_path.to_path_buf(),
            });
        }

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if parse_record_filename(&name.to_string_lossy()).is_none() {
                continue;
            }
            // Write access, because exclusive fcntl locks require it.
            let record = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(entry.path())?;
            match lock::try_lock_exclusive(&record, 0, 0) {
                Ok(()) => {
                    let _ = lock::unlock(&record, 0, 0);
                }
                Err(Error::WouldBlock) => return Err(Error::Busy),
                Err(e) => return Err(e),
            }
        }

        fs::rename(&self.dir, new_path)?;
        self.dir = new_path.to_path_buf();
        Ok(())
    }
}
