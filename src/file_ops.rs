//! Filesystem capability used by the entry engine.
//!
//! Every path-level operation the engine performs goes through [`FileOps`],
//! and every byte of file I/O goes through [`File`]. This keeps the engine
//! testable and lets an embedder interpose on cache file access. All I/O is
//! blocking and positional; the engine never relies on a file cursor.

use std::fmt;
use std::fs;
use std::io;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

/// Metadata snapshot for an open [`File`].
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    /// Current length of the file in bytes.
    pub size: u64,
    /// Last access time.
    pub last_accessed: SystemTime,
    /// Last modification time.
    pub last_modified: SystemTime,
}

/// An open cache file with positional, blocking I/O.
pub struct File {
    inner: fs::File,
}

impl File {
    fn new(inner: fs::File) -> File {
        File { inner }
    }

    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read, which is less than `buf.len()` only at end of file.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.inner.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Writes all of `buf` at `offset`.
    pub fn write(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut total = 0;
        while total < buf.len() {
            match self.inner.write_at(&buf[total..], offset + total as u64) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Truncates or extends the file to `len` bytes.
    pub fn set_length(&self, len: u64) -> io::Result<()> {
        self.inner.set_len(len)
    }

    /// Returns the file's size and timestamps.
    pub fn info(&self) -> io::Result<FileInfo> {
        let metadata = self.inner.metadata()?;
        Ok(FileInfo {
            size: metadata.len(),
            last_accessed: metadata.accessed()?,
            last_modified: metadata.modified()?,
        })
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File").finish_non_exhaustive()
    }
}

/// Path-level filesystem operations the engine needs from the host.
///
/// Implementations must be usable from multiple threads; the file tracker
/// reopens files on whichever thread happens to hit the FD limit.
pub trait FileOps: Send + Sync {
    /// Opens an existing file for reading and writing.
    fn open(&self, path: &Path) -> io::Result<File>;

    /// Creates a new file; fails with [`ErrorKind::AlreadyExists`] if the
    /// path is taken.
    fn create(&self, path: &Path) -> io::Result<File>;

    /// Removes a file. Removing a file that does not exist succeeds.
    fn delete(&self, path: &Path) -> io::Result<()>;

    /// Atomically renames `from` to `to`, replacing any existing file.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Creates a directory, including missing parents.
    fn mkdir(&self, path: &Path) -> io::Result<()>;

    /// Lists the entries of a directory.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// [`FileOps`] backed directly by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileOps;

impl FileOps for OsFileOps {
    fn open(&self, path: &Path) -> io::Result<File> {
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(File::new)
    }

    fn create(&self, path: &Path) -> io::Result<File> {
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map(File::new)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        match fs::create_dir_all(path) {
            Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e),
            _ => Ok(()),
        }
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        Ok(entries)
    }
}
