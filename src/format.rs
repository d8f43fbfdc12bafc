//! On-disk entry file format.
//!
//! Each cache entry is stored in up to two "normal" files plus an optional
//! sparse file. Every file begins with an [`EntryHeader`] followed by the
//! raw key bytes. Normal files carry one [`EntryEof`] record per stream
//! stored in them; the sparse file carries a [`SparseRangeHeader`] before
//! each data range:
//!
//! - file 0: header | key | stream 1 | EOF 1 | stream 0 | SHA-256(key) | EOF 0
//! - file 1: header | key | stream 2 | EOF 2 (omitted entirely while stream 2
//!   is empty)
//! - sparse file: header | key | (range header | range bytes)*
//!
//! All records are little-endian and packed with no padding. The magic
//! numbers are version-neutral and must never change; `version` is what gets
//! bumped on format revisions.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use bitflags::bitflags;

/// First 8 bytes of every entry file.
pub const INITIAL_MAGIC_NUMBER: u64 = 0xfcfb6d1ba7725c30;

/// Sentinel closing each stream's EOF record.
pub const FINAL_MAGIC_NUMBER: u64 = 0xf4fa6f45970d41d8;

/// Sentinel opening each sparse range header.
pub const SPARSE_RANGE_MAGIC_NUMBER: u64 = 0xeb97bf016553676b;

/// Format version written to normal entry files. Readers require an exact
/// match.
pub const ENTRY_VERSION_ON_DISK: u32 = 5;

/// Format version written to sparse files.
pub const SPARSE_VERSION: u32 = 9;

/// Oldest sparse file version still readable. Sparse readers accept any
/// version in `LAST_COMPAT_SPARSE_VERSION..=SPARSE_VERSION`.
pub const LAST_COMPAT_SPARSE_VERSION: u32 = 5;

/// Streams per entry.
pub const STREAM_COUNT: usize = 3;

/// Normal (non-sparse) files per entry.
pub const NORMAL_FILE_COUNT: usize = 2;

/// Normal files plus the sparse file.
pub const TOTAL_FILE_COUNT: usize = 3;

/// Bytes of SHA-256(key) stored before stream 0's EOF record.
pub const KEY_SHA256_SIZE: usize = 32;

/// Size of [`EntryHeader`] on disk.
pub const HEADER_SIZE: usize = size_of::<EntryHeader>();

/// Size of [`EntryEof`] on disk.
pub const EOF_SIZE: usize = size_of::<EntryEof>();

/// Size of [`SparseRangeHeader`] on disk.
pub const SPARSE_RANGE_HEADER_SIZE: usize = size_of::<SparseRangeHeader>();

/// Header written once when an entry file is created.
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct EntryHeader {
    /// Always [`INITIAL_MAGIC_NUMBER`].
    pub initial_magic_number: u64,
    /// On-disk format version.
    pub version: u32,
    /// Length of the key bytes that follow the header.
    pub key_length: u32,
    /// Fast non-cryptographic hash of the key bytes; integrity check only.
    pub key_hash: u32,
}

bitflags! {
    /// Feature bits stored in an [`EntryEof`] record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EofFlags: u32 {
        /// `data_crc32` holds the CRC-32 of the stream payload.
        const HAS_CRC32 = 1 << 0;
        /// SHA-256 of the key immediately precedes this record. Only ever
        /// set on stream 0's record.
        const HAS_KEY_SHA256 = 1 << 1;
    }
}

/// Per-stream EOF record.
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct EntryEof {
    /// Size of the stream payload in bytes.
    pub stream_size: u32,
    /// Raw [`EofFlags`] bits.
    pub flags: u32,
    /// CRC-32 (IEEE) of the stream payload; meaningful only with
    /// [`EofFlags::HAS_CRC32`].
    pub data_crc32: u32,
    /// Always [`FINAL_MAGIC_NUMBER`].
    pub final_magic_number: u64,
}

impl EntryEof {
    /// Builds a record; `data_crc32 = None` clears `HAS_CRC32`.
    pub fn new(stream_size: u32, data_crc32: Option<u32>, key_sha256: bool) -> EntryEof {
        let mut flags = EofFlags::empty();
        if data_crc32.is_some() {
            flags |= EofFlags::HAS_CRC32;
        }
        if key_sha256 {
            flags |= EofFlags::HAS_KEY_SHA256;
        }
        EntryEof {
            stream_size,
            flags: flags.bits(),
            data_crc32: data_crc32.unwrap_or(0),
            final_magic_number: FINAL_MAGIC_NUMBER,
        }
    }

    /// Decoded flag bits (unknown bits dropped).
    pub fn flags(&self) -> EofFlags {
        EofFlags::from_bits_truncate(self.flags)
    }
}

/// Header preceding each range of bytes in the sparse file.
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SparseRangeHeader {
    /// Always [`SPARSE_RANGE_MAGIC_NUMBER`].
    pub sparse_range_magic_number: u64,
    /// Logical offset of the range within the sparse stream.
    pub offset: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// CRC-32 of the range bytes; 0 means invalidated, do not verify.
    pub data_crc32: u32,
}
