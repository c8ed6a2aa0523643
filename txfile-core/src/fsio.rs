//! Positional I/O helpers.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Reads at `offset` until `buf` is full or EOF is reached. Returns the
/// number of bytes read; anything short of `buf.len()` means EOF.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}
