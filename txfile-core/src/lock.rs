//! Advisory byte-range file locks.
//!
//! Thin wrappers over `fcntl(F_SETLK/F_SETLKW)`. All ranges are anchored at
//! the start of the file (absolute offsets) and a length of 0 means "to the
//! end of the file", per the usual POSIX convention. Only exclusive (write)
//! locks are used; readers of this crate are excluded the same way writers
//! are.

use crate::error::{Error, Result};
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

fn flock(l_type: libc::c_int, offset: u64, len: u64) -> Result<libc::flock> {
    let start = i64::try_from(offset).map_err(|_| Error::TooLarge)?;
    let flen = i64::try_from(len).map_err(|_| Error::TooLarge)?;

    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start;
    fl.l_len = flen;
    Ok(fl)
}

fn fcntl(file: &File, cmd: libc::c_int, fl: &libc::flock) -> io::Result<()> {
    loop {
        let rv = unsafe { libc::fcntl(file.as_raw_fd(), cmd, fl) };
        if rv == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        // A blocking acquire interrupted by a signal is restarted.
        if cmd == libc::F_SETLKW && err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

/// Acquires an exclusive lock on `[offset, offset + len)`, blocking until it
/// is granted.
pub fn lock_exclusive(file: &File, offset: u64, len: u64) -> Result<()> {
    let fl = flock(libc::F_WRLCK, offset, len)?;
    fcntl(file, libc::F_SETLKW, &fl).map_err(Error::Io)
}

/// Tries to acquire an exclusive lock on `[offset, offset + len)` without
/// blocking. Returns [`Error::WouldBlock`] if the range is held elsewhere.
pub fn try_lock_exclusive(file: &File, offset: u64, len: u64) -> Result<()> {
    let fl = flock(libc::F_WRLCK, offset, len)?;
    match fcntl(file, libc::F_SETLK, &fl) {
        Ok(()) => Ok(()),
        Err(e) => match e.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EAGAIN) => Err(Error::WouldBlock),
            _ => Err(Error::Io(e)),
        },
    }
}

/// Releases a previously acquired lock on `[offset, offset + len)`.
pub fn unlock(file: &File, offset: u64, len: u64) -> Result<()> {
    let fl = flock(libc::F_UNLCK, offset, len)?;
    fcntl(file, libc::F_SETLKW, &fl).map_err(Error::Io)
}

/// A set of locked ranges on one file, released together on drop.
pub(crate) struct RegionGuard<'a> {
    file: &'a File,
    regions: Vec<(u64, u64)>,
}

impl<'a> RegionGuard<'a> {
    pub(crate) fn new(file: &'a File) -> Self {
        Self {
            file,
            regions: Vec::new(),
        }
    }

    /// Acquires one more exclusive range, blocking, and remembers it.
    pub(crate) fn lock(&mut self, offset: u64, len: u64) -> Result<()> {
        lock_exclusive(self.file, offset, len)?;
        self.regions.push((offset, len));
        Ok(())
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        for &(offset, len) in &self.regions {
            let _ = unlock(self.file, offset, len);
        }
    }
}
