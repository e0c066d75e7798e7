//! Seekable byte storage backing a disseminated object.
//!
//! Anything that is `Read + Write + Seek` works: files on a node,
//! `Cursor<Vec<u8>>` in tests.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub trait Storage: Read + Write + Seek {}

impl<T: Read + Write + Seek> Storage for T {}

/// Current length of the store.
pub fn storage_len<S: Seek + ?Sized>(store: &mut S) -> io::Result<u64> {
    store.seek(SeekFrom::End(0))
}

/// Read `buf.len()` bytes at `offset`. Bytes past the end read as zero.
/// Returns how many bytes came from the store.
pub fn read_at<S: Read + Seek + ?Sized>(
    store: &mut S,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<usize> {
    store.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match store.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf[filled..].fill(0);
    Ok(filled)
}

/// Write all of `data` at `offset`, growing the store if needed.
pub fn write_at<S: Write + Seek + ?Sized>(
    store: &mut S,
    offset: u64,
    data: &[u8],
) -> io::Result<()> {
    store.seek(SeekFrom::Start(offset))?;
    store.write_all(data)?;
    store.flush()
}

/// Open an object file for a seeding node. The file must exist.
pub fn open_existing(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Open (or create, truncated) the file a joining node receives into.
pub fn create_empty(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
