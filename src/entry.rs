//! The synchronous cache entry.
//!
//! A [`SynchronousEntry`] is the state machine behind one cache entry: it
//! lays streams out within the entry's files, maintains headers, footers and
//! checksums, creates files lazily, and implements the open/create, read,
//! write, sparse, doom, and close protocols. Every operation runs to
//! completion on the calling thread; the caller (normally an asynchronous
//! facade) guarantees that a single entry is only touched by one thread at a
//! time.
//!
//! All file descriptors live in the shared [`FileTracker`]; the entry only
//! borrows them per operation.

use std::io;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use log::debug;
use log::error;
use log::warn;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::error::CacheError;
use crate::file_ops::File;
use crate::file_ops::FileOps;
use crate::format::{
    EOF_SIZE, ENTRY_VERSION_ON_DISK, EntryEof, EntryHeader, EofFlags, FINAL_MAGIC_NUMBER,
    HEADER_SIZE, INITIAL_MAGIC_NUMBER, KEY_SHA256_SIZE, NORMAL_FILE_COUNT, SPARSE_VERSION,
    STREAM_COUNT,
};
use crate::prefetch::PrefetchBuffer;
use crate::sparse::RangeResult;
use crate::sparse::SparseIndex;
use crate::tracker::{EntryFileKey, FileHandle, FileTracker, OwnerId, SubFile};
use crate::util;

/// How much to read when opening an entry whose key is unknown: the header
/// must be read without knowing the key length, and this much makes it
/// likely the whole key comes along in one I/O.
const INITIAL_HEADER_READ: usize = 64 * 1024;

/// Externally tuned prefetch thresholds consulted while opening an entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefetchConfig {
    /// Files up to this size are prefetched whole on open.
    pub full_prefetch_bytes: u32,
    /// Trailer bytes to speculatively prefetch when the caller has no
    /// trailer hint for the entry.
    pub trailer_prefetch_speculative_bytes: u32,
}

impl PrefetchConfig {
    fn trailer_prefetch_size(&self, hint: i32) -> u64 {
        if hint > 0 {
            hint as u64
        } else {
            self.trailer_prefetch_speculative_bytes as u64
        }
    }
}

/// Per-entry sizes and timestamps, owned by the caller and threaded through
/// each operation. Also computes stream offsets from the sizes.
///
/// Within file 0, stream 1 comes first; stream 0 sits behind it, so stream
/// 0's offset moves whenever stream 1 changes size.
#[derive(Debug, Clone)]
pub struct EntryStat {
    last_used: SystemTime,
    last_modified: SystemTime,
    data_size: [u32; STREAM_COUNT],
    sparse_data_size: u32,
}

impl Default for EntryStat {
    fn default() -> EntryStat {
        EntryStat::new(SystemTime::UNIX_EPOCH, SystemTime::UNIX_EPOCH, [0; STREAM_COUNT], 0)
    }
}

impl EntryStat {
    /// Builds a stat from its parts.
    pub fn new(
        last_used: SystemTime,
        last_modified: SystemTime,
        data_size: [u32; STREAM_COUNT],
        sparse_data_size: u32,
    ) -> EntryStat {
        EntryStat {
            last_used,
            last_modified,
            data_size,
            sparse_data_size,
        }
    }

    /// Time of the last read or write.
    pub fn last_used(&self) -> SystemTime {
        self.last_used
    }

    /// Time of the last write.
    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    pub(crate) fn set_last_used(&mut self, t: SystemTime) {
        self.last_used = t;
    }

    pub(crate) fn set_last_modified(&mut self, t: SystemTime) {
        self.last_modified = t;
    }

    /// Size of one stream in bytes.
    pub fn data_size(&self, stream_index: usize) -> u32 {
        self.data_size[stream_index]
    }

    pub(crate) fn set_data_size(&mut self, stream_index: usize, size: u32) {
        self.data_size[stream_index] = size;
    }

    /// Total bytes stored in the sparse stream.
    pub fn sparse_data_size(&self) -> u32 {
        self.sparse_data_size
    }

    pub(crate) fn set_sparse_data_size(&mut self, size: u32) {
        self.sparse_data_size = size;
    }

    /// Absolute file offset of byte `offset` of the given stream.
    pub fn offset_in_file(&self, key_length: usize, offset: u32, stream_index: usize) -> u64 {
        let headers_size = (HEADER_SIZE + key_length) as u64;
        let additional_offset = if stream_index == 0 {
            self.data_size[1] as u64 + EOF_SIZE as u64
        } else {
            0
        };
        headers_size + offset as u64 + additional_offset
    }

    /// Absolute file offset of the stream's EOF record. For stream 0 this
    /// accounts for the key SHA-256 stored before the record.
    pub fn eof_offset_in_file(&self, key_length: usize, stream_index: usize) -> u64 {
        let additional_offset = if stream_index == 0 {
            KEY_SHA256_SIZE as u64
        } else {
            0
        };
        additional_offset + self.offset_in_file(key_length, self.data_size[stream_index], stream_index)
    }

    /// Offset of the last EOF record in the stream's file; where the file
    /// ends after a truncating write (footers are only appended at close).
    pub(crate) fn last_eof_offset_in_file(&self, key_length: usize, stream_index: usize) -> u64 {
        if stream_index == 1 {
            self.eof_offset_in_file(key_length, 0)
        } else {
            self.eof_offset_in_file(key_length, stream_index)
        }
    }

    /// Expected size of the given normal file for the current stream sizes.
    pub fn file_size(&self, key_length: usize, file_index: usize) -> u64 {
        let total_data_size = if file_index == 0 {
            self.data_size[0] as u64
                + self.data_size[1] as u64
                + (KEY_SHA256_SIZE + EOF_SIZE) as u64
        } else {
            self.data_size[2] as u64
        };
        util::file_size_from_data_size(key_length, total_data_size)
    }
}

/// Stream payload read ahead of time during open, handed to the caller so
/// the first reads need no I/O. Index 0 is always filled on a successful
/// open; index 1 only when it was cheap.
#[derive(Debug, Clone, Default)]
pub struct StreamPrefetchData {
    /// The stream payload (for stream 0, followed by the key SHA-256).
    pub data: Vec<u8>,
    /// CRC-32 of the payload.
    pub stream_crc32: u32,
}

/// A caller-supplied checksum to commit to a stream's EOF record at close.
#[derive(Debug, Clone, Copy)]
pub struct CrcRecord {
    /// Stream the record belongs to.
    pub index: usize,
    /// Whether `data_crc32` is known; when false the footer's CRC flag is
    /// cleared and readers skip verification.
    pub has_crc32: bool,
    /// CRC-32 over the whole stream payload.
    pub data_crc32: u32,
}

/// CRC options of a [`ReadRequest`].
#[derive(Debug, Clone, Copy)]
pub struct ReadCrcRequest {
    /// Running CRC-32 of the bytes immediately preceding this read.
    pub previous_crc32: u32,
    /// Verify the stream checksum against its EOF record if this read
    /// reaches the end of the stream.
    pub verify_at_end: bool,
}

/// One read from a normal stream.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    /// Stream to read (1 or 2; stream 0 is served by the caller from the
    /// open-time prefetch).
    pub index: usize,
    /// Byte offset within the stream.
    pub offset: u32,
    /// Fold the read bytes into a running CRC, optionally verifying at
    /// end of stream.
    pub crc: Option<ReadCrcRequest>,
}

/// Outcome of a successful [`SynchronousEntry::read_data`].
#[derive(Debug, Clone, Copy)]
pub struct ReadResult {
    /// Bytes actually read; may be short at end of stream.
    pub bytes_read: usize,
    /// Updated running CRC, when requested and any bytes were read.
    pub updated_crc32: Option<u32>,
}

/// One write to a normal stream.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest {
    /// Stream to write (1 or 2).
    pub index: usize,
    /// Byte offset within the stream.
    pub offset: u32,
    /// Shrink the stream to end at `offset` plus the written length.
    pub truncate: bool,
    /// Whether the entry has been doomed by the caller; writes must not
    /// resurrect an omitted file of a doomed entry.
    pub doomed: bool,
    /// Running CRC-32 of the bytes preceding this write; `Some` asks for an
    /// updated CRC in the result.
    pub previous_crc32: Option<u32>,
}

/// Outcome of a successful [`SynchronousEntry::write_data`].
#[derive(Debug, Clone, Copy)]
pub struct WriteResult {
    /// Bytes written (always the full buffer).
    pub bytes_written: usize,
    /// Updated running CRC, when requested and any bytes were written.
    pub updated_crc32: Option<u32>,
}

/// What the external index predicts about an entry, steering
/// [`SynchronousEntry::open_or_create_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexHint {
    /// The index has no opinion.
    NoExist,
    /// The index believes the entry does not exist; creation is tried
    /// first.
    Miss,
    /// The index believes the entry exists.
    Hit,
}

/// A successfully opened or created entry plus everything learned on the
/// way in.
#[derive(Debug)]
pub struct CreationOutcome {
    /// The live entry.
    pub entry: SynchronousEntry,
    /// Sizes and timestamps for the caller to thread through operations.
    pub entry_stat: EntryStat,
    /// Stream 0 (and opportunistically stream 1) payloads read during open.
    pub stream_prefetch: [StreamPrefetchData; 2],
    /// Exact trailer bytes consumed during open; -1 when unknown (created
    /// entries). Feed back as the next open's trailer hint.
    pub computed_trailer_prefetch_size: i32,
    /// True when the entry was created rather than opened.
    pub created: bool,
}

/// Sizes reported back from [`SynchronousEntry::close`].
#[derive(Debug, Clone, Copy)]
pub struct CloseResults {
    /// Trailer bytes a future open will need for stream 0, its key SHA-256
    /// and EOF record; -1 when no stream 0 record was written.
    pub estimated_trailer_prefetch_size: i32,
}

#[derive(PartialEq, Eq)]
enum FileRequired {
    NotRequired,
    Required,
}

/// The synchronous state machine for one disk cache entry. See the module
/// documentation.
pub struct SynchronousEntry {
    path: PathBuf,
    key: Option<String>,
    entry_file_key: EntryFileKey,
    owner: OwnerId,
    tracker: Arc<FileTracker>,
    file_ops: Arc<dyn FileOps>,
    prefetch_config: PrefetchConfig,

    have_open_files: bool,
    initialized: bool,
    // Set when a file's header was not verified during open; the next
    // operation touching the file pays the check exactly once.
    header_and_key_check_needed: [bool; NORMAL_FILE_COUNT],
    // True while the corresponding stream is empty and no on-disk file
    // backs it.
    empty_file_omitted: [bool; NORMAL_FILE_COUNT],

    // Trailer size hint from the index; -1 when unknown.
    trailer_prefetch_size: i32,
    // Trailer size actually needed during open; reported back to the index.
    computed_trailer_prefetch_size: i32,

    sparse_index: SparseIndex,
    sparse_file_open: bool,
}

impl std::fmt::Debug for SynchronousEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronousEntry")
            .field("path", &self.path)
            .field("key", &self.key)
            .field("entry_file_key", &self.entry_file_key)
            .field("initialized", &self.initialized)
            .field("have_open_files", &self.have_open_files)
            .finish_non_exhaustive()
    }
}

impl SynchronousEntry {
    fn new(
        path: &Path,
        key: Option<String>,
        entry_hash: u64,
        tracker: Arc<FileTracker>,
        file_ops: Arc<dyn FileOps>,
        prefetch_config: PrefetchConfig,
        trailer_prefetch_size: i32,
    ) -> SynchronousEntry {
        SynchronousEntry {
            path: path.to_owned(),
            key,
            entry_file_key: EntryFileKey::new(entry_hash),
            owner: OwnerId::next(),
            tracker,
            file_ops,
            prefetch_config,
            have_open_files: false,
            initialized: false,
            header_and_key_check_needed: [false; NORMAL_FILE_COUNT],
            empty_file_omitted: [false; NORMAL_FILE_COUNT],
            trailer_prefetch_size,
            computed_trailer_prefetch_size: -1,
            sparse_index: SparseIndex::new(),
            sparse_file_open: false,
        }
    }

    /// Opens an entry from disk. `key` may be omitted (iterator-style
    /// opens), in which case it is recovered from the file header.
    /// `trailer_prefetch_size` is the index's hint, or -1.
    pub fn open_entry(
        path: &Path,
        key: Option<&str>,
        entry_hash: u64,
        tracker: &Arc<FileTracker>,
        file_ops: Arc<dyn FileOps>,
        prefetch_config: PrefetchConfig,
        trailer_prefetch_size: i32,
    ) -> Result<CreationOutcome, CacheError> {
        let mut entry = SynchronousEntry::new(
            path,
            key.map(str::to_owned),
            entry_hash,
            Arc::clone(tracker),
            file_ops,
            prefetch_config,
            trailer_prefetch_size,
        );
        let mut entry_stat = EntryStat::default();
        let mut stream_prefetch = [StreamPrefetchData::default(), StreamPrefetchData::default()];
        match entry.initialize_for_open(&mut entry_stat, &mut stream_prefetch) {
            Ok(()) => {
                let computed_trailer_prefetch_size = entry.computed_trailer_prefetch_size;
                Ok(CreationOutcome {
                    entry,
                    entry_stat,
                    stream_prefetch,
                    computed_trailer_prefetch_size,
                    created: false,
                })
            }
            Err(e) => {
                let _ = entry.doom_internal();
                entry.close_files();
                Err(e)
            }
        }
    }

    /// Creates a brand-new entry. Fails with [`CacheError::FileExists`] when
    /// the entry files are already present.
    pub fn create_entry(
        path: &Path,
        key: &str,
        entry_hash: u64,
        tracker: &Arc<FileTracker>,
        file_ops: Arc<dyn FileOps>,
    ) -> Result<CreationOutcome, CacheError> {
        let mut entry = SynchronousEntry::new(
            path,
            Some(key.to_owned()),
            entry_hash,
            Arc::clone(tracker),
            file_ops,
            PrefetchConfig::default(),
            -1,
        );
        let mut entry_stat = EntryStat::default();
        match entry.initialize_for_create(&mut entry_stat) {
            Ok(()) => Ok(CreationOutcome {
                entry,
                entry_stat,
                stream_prefetch: [StreamPrefetchData::default(), StreamPrefetchData::default()],
                computed_trailer_prefetch_size: -1,
                created: true,
            }),
            Err(e) => {
                // Don't doom on a create conflict: that would delete the
                // existing entry's files out from under its rightful owner.
                if e != CacheError::FileExists {
                    let _ = entry.doom_internal();
                }
                entry.close_files();
                Err(e)
            }
        }
    }

    /// Opens the entry, or creates it when absent, steered by the index's
    /// prediction. With `index_hint == Miss` creation is tried first. An
    /// `optimistic_create` means the caller has already told its client a
    /// fresh entry exists, so a conflicting on-disk entry is doomed rather
    /// than adopted.
    pub fn open_or_create_entry(
        path: &Path,
        key: &str,
        entry_hash: u64,
        index_hint: IndexHint,
        optimistic_create: bool,
        tracker: &Arc<FileTracker>,
        file_ops: Arc<dyn FileOps>,
        prefetch_config: PrefetchConfig,
        trailer_prefetch_size: i32,
    ) -> Result<CreationOutcome, CacheError> {
        if index_hint == IndexHint::Miss {
            match Self::create_entry(path, key, entry_hash, tracker, Arc::clone(&file_ops)) {
                Err(CacheError::FileExists) => {
                    if optimistic_create {
                        let _ = Self::delete_entry_files(path, entry_hash, &*file_ops);
                        return Self::create_entry(path, key, entry_hash, tracker, file_ops);
                    }
                    // The index was wrong; fall through to a plain open.
                }
                result => return result,
            }
        }
        match Self::open_entry(
            path,
            Some(key),
            entry_hash,
            tracker,
            Arc::clone(&file_ops),
            prefetch_config,
            trailer_prefetch_size,
        ) {
            Ok(outcome) => Ok(outcome),
            Err(_) => Self::create_entry(path, key, entry_hash, tracker, file_ops),
        }
    }

    /// The entry's key; `None` only between an iterator-style open request
    /// and the header read that recovers it.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// The entry's on-disk identity, including its doom generation.
    pub fn entry_file_key(&self) -> &EntryFileKey {
        &self.entry_file_key
    }

    /// Cache directory this entry lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exact trailer bytes consumed during open; -1 when not opened from
    /// disk.
    pub fn computed_trailer_prefetch_size(&self) -> i32 {
        self.computed_trailer_prefetch_size
    }

    /// Reads from stream 1 or 2. Returns the bytes read (short only at end
    /// of stream) and, when requested, the updated running CRC; a CRC
    /// verification failure dooms the entry.
    pub fn read_data(
        &mut self,
        request: &ReadRequest,
        entry_stat: &mut EntryStat,
        buf: &mut [u8],
    ) -> Result<ReadResult, CacheError> {
        debug_assert!(self.initialized);
        debug_assert!(request.index == 1 || request.index == 2);
        // Zero-length reads and reads of omitted streams are the caller's
        // job to elide.
        debug_assert!(!buf.is_empty());
        let file_index = util::file_index_for_stream(request.index);
        debug_assert!(!self.empty_file_omitted[file_index]);

        let handle = self.acquire(SubFile::for_file_index(file_index));
        let Some(file) = handle.get() else {
            let _ = self.doom_internal();
            return Err(CacheError::Failed);
        };
        if self.header_and_key_check_needed[file_index] && !self.check_header_and_key(file, file_index)
        {
            let _ = self.doom_internal();
            return Err(CacheError::Failed);
        }

        let file_offset = entry_stat.offset_in_file(self.key_length(), request.offset, request.index);
        let bytes_read = match file.read(file_offset, buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("cache entry read failed: {e}");
                let _ = self.doom_internal();
                return Err(CacheError::ReadFailure);
            }
        };

        let mut result = ReadResult {
            bytes_read,
            updated_crc32: None,
        };
        if bytes_read > 0 {
            entry_stat.set_last_used(SystemTime::now());
            if let Some(crc_request) = &request.crc {
                let updated = util::incremental_crc32(crc_request.previous_crc32, &buf[..bytes_read]);
                result.updated_crc32 = Some(updated);
                // Verify the checksum after the last read, if asked to.
                let end = request.offset as u64 + bytes_read as u64;
                if crc_request.verify_at_end && end == entry_stat.data_size(request.index) as u64 {
                    self.check_eof_record_with_file(file, request.index, entry_stat, updated)?;
                }
            }
        }
        Ok(result)
    }

    /// Writes to stream 1 or 2, lazily creating file 1 on the first write
    /// to stream 2. Any I/O failure dooms the entry.
    pub fn write_data(
        &mut self,
        request: &WriteRequest,
        buf: &[u8],
        entry_stat: &mut EntryStat,
    ) -> Result<WriteResult, CacheError> {
        debug_assert!(self.initialized);
        debug_assert!(request.index == 1 || request.index == 2);
        let index = request.index;
        let file_index = util::file_index_for_stream(index);

        if self.header_and_key_check_needed[file_index] && !self.empty_file_omitted[file_index] {
            let handle = self.acquire(SubFile::for_file_index(file_index));
            let checked = match handle.get() {
                Some(file) => self.check_header_and_key(file, file_index),
                None => false,
            };
            if !checked {
                let _ = self.doom_internal();
                return Err(CacheError::Failed);
            }
        }

        let key_length = self.key_length();
        let buf_len = buf.len();
        let Some(end) = (request.offset as u64)
            .checked_add(buf_len as u64)
            .filter(|end| *end <= i32::MAX as u64)
        else {
            return Err(CacheError::WriteFailure);
        };
        let file_offset = entry_stat.offset_in_file(key_length, request.offset, index);
        let extending_by_write = end > entry_stat.data_size(index) as u64;

        if self.empty_file_omitted[file_index] {
            // Don't create a new file if the entry has been doomed; it could
            // be confused with a newly-created entry of the same key.
            if request.doomed {
                warn!(
                    "rejecting write to lazily omitted stream {} of doomed entry",
                    index
                );
                return Err(CacheError::WriteFailure);
            }
            if !self.maybe_create_file(file_index, FileRequired::Required)
                || !self.initialize_created_file(file_index)
            {
                let _ = self.doom_internal();
                return Err(CacheError::WriteFailure);
            }
        }
        debug_assert!(!self.empty_file_omitted[file_index]);

        // Grabbed only now: the block above is what creates file 1.
        let handle = self.acquire(SubFile::for_file_index(file_index));
        let Some(file) = handle.get() else {
            let _ = self.doom_internal();
            return Err(CacheError::Failed);
        };

        if extending_by_write {
            // The EOF record and the eventual stream afterward need to be
            // zeroed out.
            let file_eof_offset = entry_stat.eof_offset_in_file(key_length, index);
            if file.set_length(file_eof_offset).is_err() {
                let _ = self.doom_internal();
                return Err(CacheError::WriteFailure);
            }
        }
        if buf_len > 0 && file.write(file_offset, buf).is_err() {
            let _ = self.doom_internal();
            return Err(CacheError::WriteFailure);
        }
        if !request.truncate && (buf_len > 0 || !extending_by_write) {
            entry_stat.set_data_size(index, entry_stat.data_size(index).max(end as u32));
        } else {
            entry_stat.set_data_size(index, end as u32);
            let file_eof_offset = entry_stat.last_eof_offset_in_file(key_length, index);
            if file.set_length(file_eof_offset).is_err() {
                let _ = self.doom_internal();
                return Err(CacheError::WriteFailure);
            }
        }

        let mut result = WriteResult {
            bytes_written: buf_len,
            updated_crc32: None,
        };
        if let Some(previous_crc32) = request.previous_crc32 {
            if buf_len > 0 {
                result.updated_crc32 = Some(util::incremental_crc32(previous_crc32, buf));
            }
        }
        let now = SystemTime::now();
        entry_stat.set_last_used(now);
        entry_stat.set_last_modified(now);
        Ok(result)
    }

    /// Reads sparse data starting at `sparse_offset`, stopping at the first
    /// gap in coverage. Short reads (including 0) are an ordinary success.
    pub fn read_sparse_data(
        &mut self,
        sparse_offset: u64,
        buf: &mut [u8],
        entry_stat: &mut EntryStat,
    ) -> Result<usize, CacheError> {
        debug_assert!(self.initialized);
        if !self.sparse_file_open {
            return Ok(0);
        }
        let handle = self.acquire(SubFile::Sparse);
        let Some(file) = handle.get() else {
            let _ = self.doom_internal();
            return Err(CacheError::ReadFailure);
        };
        match self.sparse_index.read(file, sparse_offset, buf) {
            Ok(bytes_read) => {
                entry_stat.set_last_used(SystemTime::now());
                Ok(bytes_read)
            }
            Err(e) => {
                let _ = self.doom_internal();
                Err(e)
            }
        }
    }

    /// Writes sparse data at `sparse_offset`, creating the sparse file on
    /// first use. If the entry's sparse data would exceed
    /// `max_sparse_data_size` (a pessimistic estimate that assumes the whole
    /// buffer is appended), every existing range is dropped first.
    pub fn write_sparse_data(
        &mut self,
        sparse_offset: u64,
        buf: &[u8],
        max_sparse_data_size: u64,
        entry_stat: &mut EntryStat,
    ) -> Result<usize, CacheError> {
        debug_assert!(self.initialized);
        if !self.sparse_file_open && !self.create_sparse_file() {
            let _ = self.doom_internal();
            return Err(CacheError::WriteFailure);
        }
        let handle = self.acquire(SubFile::Sparse);
        let Some(file) = handle.get() else {
            let _ = self.doom_internal();
            return Err(CacheError::WriteFailure);
        };

        let key_length = self.key_length();
        let sparse_data_size = entry_stat.sparse_data_size() as u64;
        let future_size = sparse_data_size + buf.len() as u64;
        if future_size > max_sparse_data_size {
            debug!(
                "truncating sparse data file ({} + {} > {})",
                sparse_data_size,
                buf.len(),
                max_sparse_data_size
            );
            let _ = self.sparse_index.truncate(file, key_length);
            entry_stat.set_sparse_data_size(0);
        }

        let appended = match self.sparse_index.write(file, sparse_offset, buf) {
            Ok(appended) => appended,
            Err(e) => {
                let _ = self.doom_internal();
                return Err(e);
            }
        };

        let now = SystemTime::now();
        entry_stat.set_last_used(now);
        entry_stat.set_last_modified(now);
        let new_size = (entry_stat.sparse_data_size() as u64 + appended).min(u32::MAX as u64);
        entry_stat.set_sparse_data_size(new_size as u32);
        Ok(buf.len())
    }

    /// Longest run of contiguous sparse coverage beginning at or after
    /// `sparse_offset` and ending by `sparse_offset + len`.
    pub fn get_available_range(&self, sparse_offset: u64, len: u64) -> RangeResult {
        debug_assert!(self.initialized);
        self.sparse_index.available_range(sparse_offset, len)
    }

    /// Reads and validates a stream's EOF record against `expected_crc32`.
    /// Used when resuming a partially-read stream. Failures doom the entry.
    pub fn check_eof_record(
        &mut self,
        stream_index: usize,
        entry_stat: &EntryStat,
        expected_crc32: u32,
    ) -> Result<(), CacheError> {
        debug_assert!(self.initialized);
        let file_index = util::file_index_for_stream(stream_index);
        let handle = self.acquire(SubFile::for_file_index(file_index));
        let Some(file) = handle.get() else {
            let _ = self.doom_internal();
            return Err(CacheError::Failed);
        };
        self.check_eof_record_with_file(file, stream_index, entry_stat, expected_crc32)
    }

    fn check_eof_record_with_file(
        &mut self,
        file: &File,
        stream_index: usize,
        entry_stat: &EntryStat,
        expected_crc32: u32,
    ) -> Result<(), CacheError> {
        let file_index = util::file_index_for_stream(stream_index);
        let eof_offset = entry_stat.eof_offset_in_file(self.key_length(), stream_index);
        let eof_record = match self.read_eof_record(file, None, file_index, eof_offset) {
            Ok(record) => record,
            Err(e) => {
                let _ = self.doom_internal();
                return Err(e);
            }
        };
        if eof_record.flags().contains(EofFlags::HAS_CRC32)
            && eof_record.data_crc32 != expected_crc32
        {
            warn!("EOF record had bad crc");
            let _ = self.doom_internal();
            return Err(CacheError::ChecksumMismatch);
        }
        Ok(())
    }

    /// Renames the entry's files so the entry can no longer be opened,
    /// while this instance keeps operating on them; the renamed files are
    /// deleted at close. Idempotent. An entry that never opened files just
    /// has its files deleted.
    pub fn doom(&mut self) -> Result<(), CacheError> {
        self.doom_internal()
    }

    fn doom_internal(&mut self) -> Result<(), CacheError> {
        if self.entry_file_key.doom_generation != 0 {
            // Already doomed.
            return Ok(());
        }
        if !self.have_open_files {
            // No one has ever called create or open on us, so there is no
            // instance to keep alive; plain deletion suffices.
            return Self::delete_entry_files(
                &self.path,
                self.entry_file_key.entry_hash,
                &*self.file_ops,
            );
        }

        let original_key = self.entry_file_key;
        self.tracker.doom(self.owner, &mut self.entry_file_key);

        let mut renamed_ok = true;
        for file_index in 0..NORMAL_FILE_COUNT {
            if self.empty_file_omitted[file_index] {
                continue;
            }
            let old_name = self.path.join(util::entry_filename(&original_key, file_index));
            let new_name = self
                .path
                .join(util::entry_filename(&self.entry_file_key, file_index));
            renamed_ok = self.file_ops.rename(&old_name, &new_name).is_ok() && renamed_ok;
        }
        if self.sparse_file_open {
            let old_name = self.path.join(util::sparse_filename(&original_key));
            let new_name = self.path.join(util::sparse_filename(&self.entry_file_key));
            renamed_ok = self.file_ops.rename(&old_name, &new_name).is_ok() && renamed_ok;
        }
        if renamed_ok { Ok(()) } else { Err(CacheError::Failed) }
    }

    /// Commits the supplied CRC records as EOF footers (writing stream 0's
    /// payload and key SHA-256 along the way), runs any still-pending header
    /// checks, and closes all files. A doomed entry's renamed files are
    /// deleted here.
    ///
    /// `stream_0_data` must hold exactly `entry_stat.data_size(0)` bytes.
    pub fn close(
        mut self,
        entry_stat: &EntryStat,
        crc32s_to_write: &[CrcRecord],
        stream_0_data: &[u8],
    ) -> CloseResults {
        let mut results = CloseResults {
            estimated_trailer_prefetch_size: -1,
        };
        let key_length = self.key_length();

        for crc_record in crc32s_to_write {
            let stream_index = crc_record.index;
            let file_index = util::file_index_for_stream(stream_index);
            if self.empty_file_omitted[file_index] {
                continue;
            }

            let handle = self.acquire(SubFile::for_file_index(file_index));
            let Some(file) = handle.get() else {
                let _ = self.doom_internal();
                break;
            };

            let mut data_crc32 = crc_record.has_crc32.then_some(crc_record.data_crc32);
            if stream_index == 0 {
                // Stream 0 sits behind stream 1, so its position may have
                // moved; rewrite the payload and the key SHA-256.
                debug_assert_eq!(stream_0_data.len(), entry_stat.data_size(0) as usize);
                let stream_0_offset = entry_stat.offset_in_file(key_length, 0, 0);
                if file.write(stream_0_offset, stream_0_data).is_err() {
                    warn!("could not write stream 0 data");
                    let _ = self.doom_internal();
                }
                let Some(key) = self.key.as_deref() else {
                    error!("closing entry with unknown key");
                    break;
                };
                let key_sha256 = util::sha256_of_key(key);
                if file
                    .write(stream_0_offset + stream_0_data.len() as u64, &key_sha256)
                    .is_err()
                {
                    warn!("could not write key SHA-256");
                    let _ = self.doom_internal();
                }
                // Stream 0's CRC is recomputed even without a caller-supplied
                // record, since its bytes were just rewritten.
                if data_crc32.is_none() {
                    data_crc32 = Some(util::crc32(stream_0_data));
                }
                results.estimated_trailer_prefetch_size =
                    (entry_stat.data_size(0) as usize + KEY_SHA256_SIZE + EOF_SIZE) as i32;
            }

            let eof_record = EntryEof::new(
                entry_stat.data_size(stream_index),
                data_crc32,
                stream_index == 0,
            );
            let eof_offset = entry_stat.eof_offset_in_file(key_length, stream_index);
            // If stream 0 changed size the file must shrink, or the next
            // open computes the wrong sizes. Streams 1 and 2 are resized in
            // write_data.
            if stream_index == 0 && file.set_length(eof_offset).is_err() {
                warn!("could not truncate stream 0 file");
                let _ = self.doom_internal();
                break;
            }
            if file.write(eof_offset, eof_record.as_bytes()).is_err() {
                warn!("could not write EOF record");
                let _ = self.doom_internal();
                break;
            }
        }

        for file_index in 0..NORMAL_FILE_COUNT {
            if self.empty_file_omitted[file_index] {
                continue;
            }
            if self.header_and_key_check_needed[file_index] {
                let handle = self.acquire(SubFile::for_file_index(file_index));
                let checked = match handle.get() {
                    Some(file) => self.check_header_and_key(file, file_index),
                    None => false,
                };
                if !checked {
                    let _ = self.doom_internal();
                }
            }
            self.close_file(file_index);
        }
        if self.sparse_file_open {
            self.close_sparse_file();
        }
        self.have_open_files = false;
        results
    }

    /// Deletes an entry's files by hash. Only for callers that know no live
    /// instance exists: a doomed instance's files have different names.
    pub fn delete_entry_files(
        path: &Path,
        entry_hash: u64,
        file_ops: &dyn FileOps,
    ) -> Result<(), CacheError> {
        if Self::delete_files_for_entry_hash(path, entry_hash, file_ops) {
            Ok(())
        } else {
            Err(CacheError::Failed)
        }
    }

    /// Deletes the files of every entry in `key_hashes`; succeeds only when
    /// all of them were deleted.
    pub fn delete_entry_set_files(
        key_hashes: &[u64],
        path: &Path,
        file_ops: &dyn FileOps,
    ) -> Result<(), CacheError> {
        let mut all_deleted = true;
        for &entry_hash in key_hashes {
            all_deleted = Self::delete_files_for_entry_hash(path, entry_hash, file_ops) && all_deleted;
        }
        if all_deleted { Ok(()) } else { Err(CacheError::Failed) }
    }

    /// Truncates an entry's files to zero length instead of deleting them.
    /// Used when dooming entries after the backend shut down and the index
    /// on disk is known stale.
    pub fn truncate_entry_files(
        path: &Path,
        entry_hash: u64,
        file_ops: &dyn FileOps,
    ) -> Result<(), CacheError> {
        let key = EntryFileKey::new(entry_hash);
        let mut truncated_ok = true;
        for file_index in 0..NORMAL_FILE_COUNT {
            let filename = path.join(util::entry_filename(&key, file_index));
            truncated_ok = truncate_path(&filename, file_ops) && truncated_ok;
        }
        let sparse = path.join(util::sparse_filename(&key));
        let _ = truncate_path(&sparse, file_ops);
        if truncated_ok { Ok(()) } else { Err(CacheError::Failed) }
    }

    /// Sweeps a cache directory for `todelete_*` leftovers from dooms that
    /// never finished (the process died before the holder closed). Run
    /// before opening any entries. Returns how many files were removed.
    pub fn delete_doomed_files(path: &Path, file_ops: &dyn FileOps) -> io::Result<usize> {
        let mut deleted = 0;
        for entry_path in file_ops.list_dir(path)? {
            let is_doomed = entry_path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(util::DOOMED_FILENAME_PREFIX));
            if is_doomed && file_ops.delete(&entry_path).is_ok() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn key_length(&self) -> usize {
        self.key.as_ref().map_or(0, |key| key.len())
    }

    fn acquire(&self, subfile: SubFile) -> FileHandle {
        FileTracker::acquire(&self.tracker, &*self.file_ops, self.owner, subfile)
    }

    fn filename_from_file_index(&self, file_index: usize) -> PathBuf {
        self.path
            .join(util::entry_filename(&self.entry_file_key, file_index))
    }

    /// Opens one of the entry files, registering it with the tracker.
    /// A missing omittable file is not an error.
    fn maybe_open_file(&mut self, file_index: usize) -> bool {
        let filename = self.filename_from_file_index(file_index);
        match self.file_ops.open(&filename) {
            Ok(file) => {
                self.tracker.register(
                    self.owner,
                    self.entry_file_key,
                    &self.path,
                    SubFile::for_file_index(file_index),
                    file,
                );
                true
            }
            Err(e)
                if util::can_omit_empty_file(file_index) && e.kind() == ErrorKind::NotFound =>
            {
                self.empty_file_omitted[file_index] = true;
                true
            }
            Err(e) => {
                warn!("could not open {:?}: {e}", filename);
                false
            }
        }
    }

    /// Creates one of the entry files unless it may be omitted and isn't
    /// required yet.
    fn maybe_create_file(&mut self, file_index: usize, file_required: FileRequired) -> bool {
        if util::can_omit_empty_file(file_index) && file_required == FileRequired::NotRequired {
            self.empty_file_omitted[file_index] = true;
            return true;
        }
        let filename = self.filename_from_file_index(file_index);
        let created = match self.file_ops.create(&filename) {
            Ok(file) => Some(file),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // The cache directory can vanish underneath us (e.g. the
                // user cleared the cache); recreate it and retry once.
                let _ = self.file_ops.mkdir(&self.path);
                self.file_ops.create(&filename).ok()
            }
            Err(_) => None,
        };
        match created {
            Some(file) => {
                self.tracker.register(
                    self.owner,
                    self.entry_file_key,
                    &self.path,
                    SubFile::for_file_index(file_index),
                    file,
                );
                self.empty_file_omitted[file_index] = false;
                true
            }
            None => false,
        }
    }

    fn open_files(&mut self, entry_stat: &mut EntryStat) -> bool {
        for file_index in 0..NORMAL_FILE_COUNT {
            if !self.maybe_open_file(file_index) {
                for already_open in (0..file_index).rev() {
                    self.close_file(already_open);
                }
                return false;
            }
        }

        self.have_open_files = true;

        for file_index in 0..NORMAL_FILE_COUNT {
            if self.empty_file_omitted[file_index] {
                entry_stat.set_data_size(file_index + 1, 0);
                continue;
            }
            let handle = self.acquire(SubFile::for_file_index(file_index));
            let Some(info) = handle.get().and_then(|file| file.info().ok()) else {
                warn!("could not get cache entry file info");
                continue;
            };
            entry_stat.set_last_used(info.last_accessed);
            entry_stat.set_last_modified(info.last_modified);

            // The sizes of streams 0 and 1 are only known once stream 0's
            // EOF record is read, and the key length may itself be unknown
            // here. File sizes are parked in data_size[1] and data_size[2]
            // until then.
            if info.size > i32::MAX as u64 {
                return false;
            }
            entry_stat.set_data_size(file_index + 1, info.size as u32);
        }
        true
    }

    fn create_files(&mut self, entry_stat: &mut EntryStat) -> bool {
        for file_index in 0..NORMAL_FILE_COUNT {
            if !self.maybe_create_file(file_index, FileRequired::NotRequired) {
                for already_open in (0..file_index).rev() {
                    self.close_file(already_open);
                }
                return false;
            }
        }

        self.have_open_files = true;

        let creation_time = SystemTime::now();
        entry_stat.set_last_modified(creation_time);
        entry_stat.set_last_used(creation_time);
        for stream_index in 0..STREAM_COUNT {
            entry_stat.set_data_size(stream_index, 0);
        }
        entry_stat.set_sparse_data_size(0);
        true
    }

    fn close_file(&mut self, file_index: usize) {
        if self.empty_file_omitted[file_index] {
            self.empty_file_omitted[file_index] = false;
        } else {
            // Files renamed for doom are deleted here, before the tracker
            // close makes the slot available again.
            if self.entry_file_key.doom_generation != 0 {
                let _ = self.file_ops.delete(&self.filename_from_file_index(file_index));
            }
            self.tracker.close(self.owner, SubFile::for_file_index(file_index));
        }
    }

    fn close_files(&mut self) {
        if !self.have_open_files {
            return;
        }
        for file_index in 0..NORMAL_FILE_COUNT {
            self.close_file(file_index);
        }
        if self.sparse_file_open {
            self.close_sparse_file();
        }
        self.have_open_files = false;
    }

    /// Reads the header and key at the start of the file and validates
    /// them. With a known key, verifies the stored one matches; otherwise
    /// adopts the stored key.
    fn check_header_and_key(&mut self, file: &File, file_index: usize) -> bool {
        let read_size = match &self.key {
            Some(key) => HEADER_SIZE + key.len(),
            None => INITIAL_HEADER_READ,
        };
        let mut header_data = vec![0u8; read_size];
        let bytes_read = file.read(0, &mut header_data).unwrap_or(0);
        if bytes_read < HEADER_SIZE {
            warn!("cannot read cache entry header");
            return false;
        }
        header_data.truncate(bytes_read);

        let Ok(header) = EntryHeader::read_from_bytes(&header_data[..HEADER_SIZE]) else {
            return false;
        };
        if { header.initial_magic_number } != INITIAL_MAGIC_NUMBER {
            warn!("cache entry header has bad magic number");
            return false;
        }
        if header.version != ENTRY_VERSION_ON_DISK {
            warn!("cache entry header has bad version {}", { header.version });
            return false;
        }

        let expected_header_size = HEADER_SIZE + header.key_length as usize;
        if header_data.len() < expected_header_size {
            let old_size = header_data.len();
            header_data.resize(expected_header_size, 0);
            let read = file.read(old_size as u64, &mut header_data[old_size..]);
            if !read.is_ok_and(|n| n == expected_header_size - old_size) {
                warn!("cannot read cache entry key");
                return false;
            }
        }

        let key_bytes = &header_data[HEADER_SIZE..expected_header_size];
        if util::key_hash32(key_bytes) != header.key_hash {
            warn!("cache entry key hash mismatch");
            return false;
        }
        let Ok(key_from_header) = String::from_utf8(key_bytes.to_vec()) else {
            warn!("cache entry key is not valid UTF-8");
            return false;
        };
        match &self.key {
            None => self.key = Some(key_from_header),
            Some(key) => {
                if *key != key_from_header {
                    warn!("cache entry key mismatch");
                    return false;
                }
            }
        }

        self.header_and_key_check_needed[file_index] = false;
        true
    }

    fn initialize_for_open(
        &mut self,
        entry_stat: &mut EntryStat,
        stream_prefetch: &mut [StreamPrefetchData; 2],
    ) -> Result<(), CacheError> {
        debug_assert!(!self.initialized);
        if !self.open_files(entry_stat) {
            warn!("could not open platform files for cache entry");
            return Err(CacheError::Failed);
        }
        for file_index in 0..NORMAL_FILE_COUNT {
            if self.empty_file_omitted[file_index] {
                continue;
            }

            if self.key.is_none() {
                // Opened via the iterator interface, without knowing the
                // key; read the header now to discover it.
                let handle = self.acquire(SubFile::for_file_index(file_index));
                let checked = match handle.get() {
                    Some(file) => self.check_header_and_key(file, file_index),
                    None => false,
                };
                if !checked {
                    return Err(CacheError::Failed);
                }
            } else {
                // The file still needs to be checked against the key (a hash
                // collision, or some filesystem accident), but that can wait
                // for an opportune moment.
                self.header_and_key_check_needed[file_index] = true;
            }

            if file_index == 0 {
                // File 0's size was parked in data_size[1] by open_files.
                let file_size = entry_stat.data_size(1) as u64;
                self.read_and_validate_stream_0_and_maybe_1(file_size, entry_stat, stream_prefetch)?;
            } else {
                let key_length = self.key_length();
                let data_size_2 =
                    util::data_size_from_file_size(key_length, entry_stat.data_size(2) as u64);
                let mut stream_2_valid = data_size_2 >= 0;
                if stream_2_valid {
                    entry_stat.set_data_size(2, data_size_2 as u32);
                    if data_size_2 > 0 {
                        let handle = self.acquire(SubFile::File1);
                        stream_2_valid = match handle.get() {
                            Some(file) => {
                                let eof_offset = entry_stat.eof_offset_in_file(key_length, 2);
                                self.read_eof_record(file, None, file_index, eof_offset).is_ok()
                            }
                            None => false,
                        };
                    }
                }
                if !stream_2_valid {
                    // Stream 2 is broken. Record it as empty so the file is
                    // deleted below, keeping the recoverable streams of the
                    // entry alive.
                    warn!("stream 2 is invalid, dropping it");
                    entry_stat.set_data_size(2, 0);
                }
            }
        }

        let sparse_data_size = self.open_sparse_file_if_exists()?;
        entry_stat.set_sparse_data_size(sparse_data_size);

        let stream_2_file_index = util::file_index_for_stream(2);
        if !self.empty_file_omitted[stream_2_file_index] && entry_stat.data_size(2) == 0 {
            // Normalize the layout: an existing file for an empty stream 2
            // is deleted and marked omitted.
            self.close_file(stream_2_file_index);
            Self::delete_file_for_entry_hash(
                &self.path,
                self.entry_file_key.entry_hash,
                stream_2_file_index,
                &*self.file_ops,
            );
            self.empty_file_omitted[stream_2_file_index] = true;
        }

        self.initialized = true;
        Ok(())
    }

    fn initialize_for_create(&mut self, entry_stat: &mut EntryStat) -> Result<(), CacheError> {
        debug_assert!(!self.initialized);
        if !self.create_files(entry_stat) {
            warn!("could not create platform files for cache entry");
            return Err(CacheError::FileExists);
        }
        for file_index in 0..NORMAL_FILE_COUNT {
            if self.empty_file_omitted[file_index] {
                continue;
            }
            if !self.initialize_created_file(file_index) {
                return Err(CacheError::Failed);
            }
        }
        self.initialized = true;
        Ok(())
    }

    /// Writes the header and key to a newly-created file.
    fn initialize_created_file(&mut self, file_index: usize) -> bool {
        let handle = self.acquire(SubFile::for_file_index(file_index));
        let Some(file) = handle.get() else {
            return false;
        };
        let Some(key) = self.key.as_deref() else {
            return false;
        };
        let header = EntryHeader {
            initial_magic_number: INITIAL_MAGIC_NUMBER,
            version: ENTRY_VERSION_ON_DISK,
            key_length: key.len() as u32,
            key_hash: util::key_hash32(key.as_bytes()),
        };
        if file.write(0, header.as_bytes()).is_err() {
            return false;
        }
        file.write(HEADER_SIZE as u64, key.as_bytes()).is_ok()
    }

    /// Parses file 0: reads stream 0's EOF record, derives both stream
    /// sizes, loads and checksums stream 0's payload (and stream 1's, when
    /// it is already in the prefetched bytes), and verifies the key SHA-256.
    fn read_and_validate_stream_0_and_maybe_1(
        &mut self,
        file_size: u64,
        entry_stat: &mut EntryStat,
        stream_prefetch: &mut [StreamPrefetchData; 2],
    ) -> Result<(), CacheError> {
        let handle = self.acquire(SubFile::File0);
        let Some(file) = handle.get() else {
            return Err(CacheError::Failed);
        };

        let mut prefetch = PrefetchBuffer::new(file_size);
        let full_prefetch_size = self.prefetch_config.full_prefetch_bytes as u64;
        let trailer_prefetch_size = self
            .prefetch_config
            .trailer_prefetch_size(self.trailer_prefetch_size);

        if file_size <= full_prefetch_size || file_size <= trailer_prefetch_size {
            if !prefetch.prefetch_from_file(file, 0, file_size) {
                return Err(CacheError::Failed);
            }
        } else if trailer_prefetch_size > 0 {
            let length = trailer_prefetch_size.min(file_size);
            if !prefetch.prefetch_from_file(file, file_size - length, length) {
                return Err(CacheError::Failed);
            }
        }

        // Stream 0's footer comes first; it has the size and feature info
        // needed to work out the rest of file 0's layout.
        if file_size < EOF_SIZE as u64 {
            return Err(CacheError::ChecksumReadFailure);
        }
        let stream_0_eof =
            self.read_eof_record(file, Some(&mut prefetch), 0, file_size - EOF_SIZE as u64)?;

        let stream_0_size = stream_0_eof.stream_size;
        if stream_0_size as u64 > file_size {
            return Err(CacheError::Failed);
        }
        entry_stat.set_data_size(0, stream_0_size);

        let has_key_sha256 = stream_0_eof.flags().contains(EofFlags::HAS_KEY_SHA256);
        let extra_post_stream_0_read = if has_key_sha256 { KEY_SHA256_SIZE } else { 0 };

        let key_length = self.key_length();
        let stream_1_size = file_size as i64
            - 2 * EOF_SIZE as i64
            - stream_0_size as i64
            - HEADER_SIZE as i64
            - key_length as i64
            - extra_post_stream_0_read as i64;
        if stream_1_size < 0 || stream_1_size > file_size as i64 {
            return Err(CacheError::Failed);
        }
        entry_stat.set_data_size(1, stream_1_size as u32);

        stream_prefetch[0] = self.pre_read_stream_payload(
            file,
            &mut prefetch,
            0,
            extra_post_stream_0_read,
            entry_stat,
            &stream_0_eof,
        )?;

        // The exact trailer range needed for stream 0 and its footer, noted
        // before the optional stream 1 parse widens the requests.
        self.computed_trailer_prefetch_size =
            prefetch.desired_trailer_prefetch_size().min(i32::MAX as u64) as i32;

        // With the SHA-256 present there is no need to look at the header,
        // so stream 1 can be handed over as well if it is already in memory.
        let stream_1_offset = entry_stat.offset_in_file(key_length, 0, 1);
        let stream_1_read_size = EOF_SIZE as u64 + entry_stat.data_size(1) as u64;
        if has_key_sha256 && prefetch.has_data(stream_1_offset, stream_1_read_size) {
            let stream_1_eof_offset = entry_stat.eof_offset_in_file(key_length, 1);
            let stream_1_eof =
                self.read_eof_record(file, Some(&mut prefetch), 0, stream_1_eof_offset)?;
            stream_prefetch[1] = self.pre_read_stream_payload(
                file,
                &mut prefetch,
                1,
                0,
                entry_stat,
                &stream_1_eof,
            )?;
        }

        if has_key_sha256 {
            let Some(key) = self.key.as_deref() else {
                return Err(CacheError::Failed);
            };
            let expected = util::sha256_of_key(key);
            let data = &stream_prefetch[0].data;
            let stream_0_size = stream_0_size as usize;
            if data.len() < stream_0_size + KEY_SHA256_SIZE
                || data[stream_0_size..stream_0_size + KEY_SHA256_SIZE] != expected
            {
                return Err(CacheError::Failed);
            }
            // The footer SHA-256 validated the key; skip the header check.
            self.header_and_key_check_needed[0] = false;
        } else if self.header_and_key_check_needed[0]
            && !self.check_header_and_key(file, 0)
        {
            return Err(CacheError::Failed);
        }
        Ok(())
    }

    /// Loads one stream's payload (plus `extra_size` trailing bytes) and
    /// verifies its CRC against the stream's EOF record.
    fn pre_read_stream_payload(
        &self,
        file: &File,
        prefetch: &mut PrefetchBuffer,
        stream_index: usize,
        extra_size: usize,
        entry_stat: &EntryStat,
        eof_record: &EntryEof,
    ) -> Result<StreamPrefetchData, CacheError> {
        debug_assert!(stream_index == 0 || stream_index == 1);
        let stream_size = entry_stat.data_size(stream_index) as usize;
        let read_size = stream_size + extra_size;
        let mut data = vec![0u8; read_size];
        let file_offset = entry_stat.offset_in_file(self.key_length(), 0, stream_index);
        if !read_from_file_or_prefetched(file, Some(prefetch), 0, file_offset, &mut data) {
            return Err(CacheError::Failed);
        }
        let stream_crc32 = util::crc32(&data[..stream_size]);
        if eof_record.flags().contains(EofFlags::HAS_CRC32)
            && eof_record.data_crc32 != stream_crc32
        {
            warn!("EOF record had bad crc");
            return Err(CacheError::ChecksumMismatch);
        }
        Ok(StreamPrefetchData { data, stream_crc32 })
    }

    /// Reads a stream's EOF record at `file_offset` and sanity-checks it.
    fn read_eof_record(
        &self,
        file: &File,
        prefetch: Option<&mut PrefetchBuffer>,
        file_index: usize,
        file_offset: u64,
    ) -> Result<EntryEof, CacheError> {
        let mut bytes = [0u8; EOF_SIZE];
        if !read_from_file_or_prefetched(file, prefetch, file_index, file_offset, &mut bytes) {
            return Err(CacheError::ChecksumReadFailure);
        }
        let Ok(eof_record) = EntryEof::read_from_bytes(&bytes) else {
            return Err(CacheError::ChecksumReadFailure);
        };
        if { eof_record.final_magic_number } != FINAL_MAGIC_NUMBER {
            warn!("EOF record had bad magic number");
            return Err(CacheError::ChecksumReadFailure);
        }
        if eof_record.stream_size > i32::MAX as u32 {
            return Err(CacheError::Failed);
        }
        Ok(eof_record)
    }

    /// Opens and scans the sparse file if one exists; a missing sparse file
    /// is simply an empty sparse stream. Returns the sparse data size.
    fn open_sparse_file_if_exists(&mut self) -> Result<u32, CacheError> {
        debug_assert!(!self.sparse_file_open);
        let filename = self.path.join(util::sparse_filename(&self.entry_file_key));
        let file = match self.file_ops.open(&filename) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                warn!("could not open sparse file: {e}");
                return Err(CacheError::Failed);
            }
        };
        let key_length = self.key_length();
        let total_size = self.sparse_index.scan(&file, key_length)?;
        self.tracker.register(
            self.owner,
            self.entry_file_key,
            &self.path,
            SubFile::Sparse,
            file,
        );
        self.sparse_file_open = true;
        Ok(total_size.min(u32::MAX as u64) as u32)
    }

    /// Creates and initializes the sparse file on the first sparse write.
    fn create_sparse_file(&mut self) -> bool {
        debug_assert!(!self.sparse_file_open);
        let filename = self.path.join(util::sparse_filename(&self.entry_file_key));
        let Ok(file) = self.file_ops.create(&filename) else {
            return false;
        };
        if !self.initialize_sparse_file(&file) {
            return false;
        }
        self.tracker.register(
            self.owner,
            self.entry_file_key,
            &self.path,
            SubFile::Sparse,
            file,
        );
        self.sparse_file_open = true;
        true
    }

    fn initialize_sparse_file(&mut self, file: &File) -> bool {
        let Some(key) = self.key.as_deref() else {
            return false;
        };
        let header = EntryHeader {
            initial_magic_number: INITIAL_MAGIC_NUMBER,
            version: SPARSE_VERSION,
            key_length: key.len() as u32,
            key_hash: util::key_hash32(key.as_bytes()),
        };
        if file.write(0, header.as_bytes()).is_err() {
            warn!("could not write sparse file header");
            return false;
        }
        if file.write(HEADER_SIZE as u64, key.as_bytes()).is_err() {
            warn!("could not write sparse file key");
            return false;
        }
        let key_length = key.len();
        self.sparse_index.reset((HEADER_SIZE + key_length) as u64);
        true
    }

    fn close_sparse_file(&mut self) {
        debug_assert!(self.sparse_file_open);
        if self.entry_file_key.doom_generation != 0 {
            let _ = self
                .file_ops
                .delete(&self.path.join(util::sparse_filename(&self.entry_file_key)));
        }
        self.tracker.close(self.owner, SubFile::Sparse);
        self.sparse_file_open = false;
    }

    fn delete_file_for_entry_hash(
        path: &Path,
        entry_hash: u64,
        file_index: usize,
        file_ops: &dyn FileOps,
    ) -> bool {
        let filename = path.join(util::entry_filename(&EntryFileKey::new(entry_hash), file_index));
        file_ops.delete(&filename).is_ok()
    }

    fn delete_files_for_entry_hash(path: &Path, entry_hash: u64, file_ops: &dyn FileOps) -> bool {
        let mut deleted_well = true;
        for file_index in 0..NORMAL_FILE_COUNT {
            if !Self::delete_file_for_entry_hash(path, entry_hash, file_index, file_ops)
                && !util::can_omit_empty_file(file_index)
            {
                deleted_well = false;
            }
        }
        let sparse = path.join(util::sparse_filename(&EntryFileKey::new(entry_hash)));
        let _ = file_ops.delete(&sparse);
        deleted_well
    }
}

impl Drop for SynchronousEntry {
    fn drop(&mut self) {
        if self.have_open_files {
            warn!("cache entry dropped without close");
            self.close_files();
        }
    }
}

fn truncate_path(path: &Path, file_ops: &dyn FileOps) -> bool {
    match file_ops.open(path) {
        Ok(file) => file.set_length(0).is_ok(),
        Err(_) => false,
    }
}

/// Serves a read from the prefetch buffer when the range is wholly in it
/// (file 0 only), falling back to the file.
fn read_from_file_or_prefetched(
    file: &File,
    prefetch: Option<&mut PrefetchBuffer>,
    file_index: usize,
    offset: u64,
    dest: &mut [u8],
) -> bool {
    if dest.is_empty() {
        return true;
    }
    if file_index == 0 {
        if let Some(prefetch) = prefetch {
            if prefetch.read(offset, dest) {
                return true;
            }
        }
    }
    file.read(offset, dest).is_ok_and(|n| n == dest.len())
}
