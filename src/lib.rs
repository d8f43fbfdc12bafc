//! Synchronous on-disk entry engine for an HTTP-style disk cache.
//!
//! This crate implements the storage core of a disk cache: keyed entries of
//! up to three byte streams plus an optional sparse stream, stored across at
//! most three files per entry with CRC-protected footers and a SHA-256 key
//! check. The three pieces fit together like this:
//!
//! - [`SynchronousEntry`] is the per-entry state machine: open/create,
//!   stream reads and writes, sparse I/O, dooming and closing. Each
//!   operation blocks and runs to completion; an asynchronous facade (not
//!   part of this crate) is expected to serialize operations per entry.
//! - [`FileTracker`] owns every open file across all entries and enforces a
//!   process-wide file descriptor budget, lending files back out through
//!   [`FileHandle`] borrows and transparently reopening files it had to
//!   close.
//! - [`FileOps`] abstracts the host filesystem so the engine can be pointed
//!   at a real directory ([`OsFileOps`]) or instrumented in tests.
//!
//! The on-disk layout lives in [`format`]; see its documentation for the
//! exact byte-level contract.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::entry::CloseResults;
pub use crate::entry::CrcRecord;
pub use crate::entry::CreationOutcome;
pub use crate::entry::EntryStat;
pub use crate::entry::IndexHint;
pub use crate::entry::PrefetchConfig;
pub use crate::entry::ReadCrcRequest;
pub use crate::entry::ReadRequest;
pub use crate::entry::ReadResult;
pub use crate::entry::StreamPrefetchData;
pub use crate::entry::SynchronousEntry;
pub use crate::entry::WriteRequest;
pub use crate::entry::WriteResult;
pub use crate::error::CacheError;
pub use crate::file_ops::File;
pub use crate::file_ops::FileInfo;
pub use crate::file_ops::FileOps;
pub use crate::file_ops::OsFileOps;
pub use crate::sparse::RangeResult;
pub use crate::tracker::EntryFileKey;
pub use crate::tracker::FileHandle;
pub use crate::tracker::FileTracker;
pub use crate::tracker::SubFile;

mod entry;
mod error;
mod file_ops;
pub mod format;
mod prefetch;
mod sparse;
mod tracker;
mod util;
