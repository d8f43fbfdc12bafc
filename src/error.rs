//! Error codes surfaced by cache entry operations.

use std::error;
use std::fmt;

/// Failure reported by a cache entry operation.
///
/// The distinctions mirror what the backend acts on: create-time conflicts,
/// transient I/O trouble, and integrity failures found while checking stream
/// footers. Transient and integrity failures are accompanied by dooming the
/// entry; semantic precondition failures are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheError {
    /// Generic failure: bad header, mismatched key, out-of-range sizes.
    Failed,
    /// Create found the entry files already on disk.
    FileExists,
    /// A read came up short or the underlying read failed.
    ReadFailure,
    /// A write or truncate failed.
    WriteFailure,
    /// An EOF record could not be read, or its magic number was wrong.
    ChecksumReadFailure,
    /// The stored CRC32 does not match the data that was read.
    ChecksumMismatch,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Failed => write!(f, "cache entry operation failed"),
            CacheError::FileExists => write!(f, "cache entry already exists"),
            CacheError::ReadFailure => write!(f, "cache read failure"),
            CacheError::WriteFailure => write!(f, "cache write failure"),
            CacheError::ChecksumReadFailure => write!(f, "cache checksum read failure"),
            CacheError::ChecksumMismatch => write!(f, "cache checksum mismatch"),
        }
    }
}

impl error::Error for CacheError {}
