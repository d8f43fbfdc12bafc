//! Byte-addressable sparse stream: in-memory range index plus the on-disk
//! range operations.
//!
//! The sparse file is a header and key followed by appended ranges, each
//! preceded by a [`SparseRangeHeader`]. The index maps logical offsets to
//! where each range's bytes live in the file. Ranges never overlap, but may
//! be disjoint; new data falling into a gap is always appended at the tail.

use std::collections::BTreeMap;

use log::warn;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::error::CacheError;
use crate::file_ops::File;
use crate::format::{
    EntryHeader, HEADER_SIZE, INITIAL_MAGIC_NUMBER, LAST_COMPAT_SPARSE_VERSION,
    SPARSE_RANGE_HEADER_SIZE, SPARSE_RANGE_MAGIC_NUMBER, SPARSE_VERSION, SparseRangeHeader,
};
use crate::util;

/// One contiguous run of sparse data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SparseRange {
    /// Logical offset within the sparse stream.
    pub(crate) offset: u64,
    /// Length in bytes.
    pub(crate) length: u64,
    /// CRC-32 of the range bytes; 0 disables verification.
    pub(crate) data_crc32: u32,
    /// Offset of the range bytes (not the header) within the sparse file.
    pub(crate) file_offset: u64,
}

/// Contiguous coverage beginning at or after a requested offset; what a
/// caller uses to decide whether a remote fetch is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeResult {
    /// First covered offset at or after the requested one.
    pub start: u64,
    /// Bytes of contiguous coverage from `start`, clipped to the request.
    pub available: u64,
}

/// Ordered index over the ranges of one entry's sparse file.
#[derive(Debug, Default)]
pub(crate) struct SparseIndex {
    ranges: BTreeMap<u64, SparseRange>,
    /// Where the next appended range header will be written.
    tail_offset: u64,
}

impl SparseIndex {
    pub(crate) fn new() -> SparseIndex {
        SparseIndex::default()
    }

    /// Resets to an empty index over a file truncated to `tail_offset`.
    pub(crate) fn reset(&mut self, tail_offset: u64) {
        self.ranges.clear();
        self.tail_offset = tail_offset;
    }

    /// Rebuilds the index from an existing sparse file, validating the file
    /// header and every range header. Returns the total size of all range
    /// payloads.
    pub(crate) fn scan(&mut self, file: &File, key_length: usize) -> Result<u64, CacheError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        if !file.read(0, &mut header_bytes).is_ok_and(|n| n == HEADER_SIZE) {
            warn!("could not read sparse file header");
            return Err(CacheError::Failed);
        }
        let header = EntryHeader::read_from_bytes(&header_bytes).map_err(|_| CacheError::Failed)?;
        if { header.initial_magic_number } != INITIAL_MAGIC_NUMBER {
            warn!("sparse file magic number mismatch");
            return Err(CacheError::Failed);
        }
        if header.version < LAST_COMPAT_SPARSE_VERSION || header.version > SPARSE_VERSION {
            warn!("sparse file has unreadable version {}", { header.version });
            return Err(CacheError::Failed);
        }

        self.ranges.clear();
        let mut total_size: u64 = 0;
        let mut range_header_offset = (HEADER_SIZE + key_length) as u64;
        loop {
            let mut range_header_bytes = [0u8; SPARSE_RANGE_HEADER_SIZE];
            let read = file
                .read(range_header_offset, &mut range_header_bytes)
                .map_err(|_| CacheError::Failed)?;
            if read == 0 {
                break;
            }
            if read != SPARSE_RANGE_HEADER_SIZE {
                warn!("could not read sparse range header");
                return Err(CacheError::Failed);
            }
            let range_header = SparseRangeHeader::read_from_bytes(&range_header_bytes)
                .map_err(|_| CacheError::Failed)?;
            if { range_header.sparse_range_magic_number } != SPARSE_RANGE_MAGIC_NUMBER {
                warn!("invalid sparse range header magic number");
                return Err(CacheError::Failed);
            }

            let range = SparseRange {
                offset: range_header.offset,
                length: range_header.length,
                data_crc32: range_header.data_crc32,
                file_offset: range_header_offset + SPARSE_RANGE_HEADER_SIZE as u64,
            };
            range_header_offset = range.file_offset + range.length;
            total_size = total_size.saturating_add(range.length);
            self.ranges.insert(range.offset, range);
        }
        self.tail_offset = range_header_offset;
        Ok(total_size)
    }

    /// Total size the sparse stream would cover contiguously starting at or
    /// after `offset` and ending by `offset + len`.
    pub(crate) fn available_range(&self, offset: u64, len: u64) -> RangeResult {
        let mut start = offset;
        let mut avail: u64 = 0;

        let next = self
            .ranges
            .range(offset..)
            .next()
            .map(|(&range_offset, _)| range_offset);
        if let Some(range_offset) = next {
            if range_offset < offset.saturating_add(len) {
                start = range_offset;
            }
        }

        // With no range starting exactly at `offset`, the one before it may
        // still reach into the request.
        if next.is_none_or(|range_offset| range_offset > offset) {
            if let Some((&prev_offset, prev)) = self.ranges.range(..offset).next_back() {
                if prev_offset + prev.length > offset {
                    start = offset;
                    avail = prev_offset + prev.length - offset;
                }
            }
        }

        for (&range_offset, range) in self.ranges.range(offset..) {
            if start + avail >= offset.saturating_add(len) || range_offset != start + avail {
                break;
            }
            avail += range.length;
        }

        let len_from_start = len - (start - offset);
        RangeResult {
            start,
            available: avail.min(len_from_start),
        }
    }

    /// Reads sparse data starting at `offset` into `buf`, stopping at the
    /// first gap in coverage. Returns the number of bytes read; short reads
    /// are an ordinary success.
    pub(crate) fn read(
        &self,
        file: &File,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, CacheError> {
        let mut read_so_far = 0usize;

        if let Some((&range_offset, range)) = self.ranges.range(..offset).next_back() {
            if range_offset + range.length > offset {
                let inner = offset - range_offset;
                let len = buf.len().min((range.length - inner) as usize);
                self.read_range(file, range, inner, &mut buf[..len])?;
                read_so_far = len;
            }
        }

        while read_so_far < buf.len() {
            let Some(range) = self.ranges.get(&(offset + read_so_far as u64)) else {
                break;
            };
            let len = (buf.len() - read_so_far).min(range.length as usize);
            let range = *range;
            self.read_range(file, &range, 0, &mut buf[read_so_far..read_so_far + len])?;
            read_so_far += len;
        }
        Ok(read_so_far)
    }

    /// Writes `buf` at `offset`, overwriting overlapped ranges in place and
    /// appending the rest as new ranges at the tail. Returns how many bytes
    /// were appended (as opposed to overwritten), which is what grows the
    /// entry's sparse data size.
    pub(crate) fn write(
        &mut self,
        file: &File,
        offset: u64,
        buf: &[u8],
    ) -> Result<u64, CacheError> {
        let mut written = 0usize;
        let mut appended: u64 = 0;

        if let Some((&range_offset, range)) = self.ranges.range(..offset).next_back() {
            if range_offset + range.length > offset {
                let inner = offset - range_offset;
                let len = buf.len().min((range.length - inner) as usize);
                self.write_range(file, range_offset, inner, &buf[..len])?;
                written = len;
            }
        }

        let span_end = offset + buf.len() as u64;
        let existing: Vec<u64> = self
            .ranges
            .range(offset..span_end)
            .map(|(&range_offset, _)| range_offset)
            .collect();
        for range_offset in existing {
            if written >= buf.len() {
                break;
            }
            let position = offset + written as u64;
            if position < range_offset {
                let gap = (range_offset - position) as usize;
                self.append_range(file, position, &buf[written..written + gap])?;
                written += gap;
                appended += gap as u64;
            }
            let range_length = self.ranges[&range_offset].length;
            let len = (buf.len() - written).min(range_length as usize);
            self.write_range(file, range_offset, 0, &buf[written..written + len])?;
            written += len;
        }

        if written < buf.len() {
            let position = offset + written as u64;
            appended += (buf.len() - written) as u64;
            self.append_range(file, position, &buf[written..])?;
        }
        Ok(appended)
    }

    /// Drops every range: truncates the file back to its header and key and
    /// clears the index.
    pub(crate) fn truncate(&mut self, file: &File, key_length: usize) -> Result<(), CacheError> {
        let header_and_key = (HEADER_SIZE + key_length) as u64;
        if file.set_length(header_and_key).is_err() {
            warn!("could not truncate sparse file");
            return Err(CacheError::WriteFailure);
        }
        self.reset(header_and_key);
        Ok(())
    }

    /// Reads from one range. A read covering the entire range also verifies
    /// its CRC, unless the CRC was invalidated by a partial overwrite.
    fn read_range(
        &self,
        file: &File,
        range: &SparseRange,
        inner_offset: u64,
        buf: &mut [u8],
    ) -> Result<(), CacheError> {
        debug_assert!(inner_offset + buf.len() as u64 <= range.length);
        let read = file.read(range.file_offset + inner_offset, buf);
        if !read.is_ok_and(|n| n == buf.len()) {
            warn!("could not read sparse range");
            return Err(CacheError::ReadFailure);
        }
        let whole_range = inner_offset == 0 && buf.len() as u64 == range.length;
        if whole_range && range.data_crc32 != 0 && util::crc32(buf) != range.data_crc32 {
            warn!("sparse range crc32 mismatch");
            return Err(CacheError::ReadFailure);
        }
        Ok(())
    }

    /// Overwrites part of an existing range. Covering the whole range
    /// refreshes its CRC; a partial overwrite invalidates it so later reads
    /// skip verification.
    fn write_range(
        &mut self,
        file: &File,
        range_offset: u64,
        inner_offset: u64,
        buf: &[u8],
    ) -> Result<(), CacheError> {
        let range = self
            .ranges
            .get_mut(&range_offset)
            .expect("sparse range disappeared");
        debug_assert!(inner_offset + buf.len() as u64 <= range.length);

        let whole_range = inner_offset == 0 && buf.len() as u64 == range.length;
        let new_crc32 = if whole_range { util::crc32(buf) } else { 0 };
        if new_crc32 != range.data_crc32 {
            range.data_crc32 = new_crc32;
            let header = SparseRangeHeader {
                sparse_range_magic_number: SPARSE_RANGE_MAGIC_NUMBER,
                offset: range.offset,
                length: range.length,
                data_crc32: new_crc32,
            };
            if file
                .write(
                    range.file_offset - SPARSE_RANGE_HEADER_SIZE as u64,
                    header.as_bytes(),
                )
                .is_err()
            {
                warn!("could not rewrite sparse range header");
                return Err(CacheError::WriteFailure);
            }
        }
        if file.write(range.file_offset + inner_offset, buf).is_err() {
            warn!("could not write sparse range");
            return Err(CacheError::WriteFailure);
        }
        Ok(())
    }

    /// Appends a brand-new range at the file tail and indexes it.
    fn append_range(&mut self, file: &File, offset: u64, buf: &[u8]) -> Result<(), CacheError> {
        debug_assert!(!buf.is_empty());
        let data_crc32 = util::crc32(buf);
        let header = SparseRangeHeader {
            sparse_range_magic_number: SPARSE_RANGE_MAGIC_NUMBER,
            offset,
            length: buf.len() as u64,
            data_crc32,
        };
        if file.write(self.tail_offset, header.as_bytes()).is_err() {
            warn!("could not append sparse range header");
            return Err(CacheError::WriteFailure);
        }
        self.tail_offset += SPARSE_RANGE_HEADER_SIZE as u64;
        if file.write(self.tail_offset, buf).is_err() {
            warn!("could not append sparse range data");
            return Err(CacheError::WriteFailure);
        }
        let file_offset = self.tail_offset;
        self.tail_offset += buf.len() as u64;
        self.ranges.insert(
            offset,
            SparseRange {
                offset,
                length: buf.len() as u64,
                data_crc32,
                file_offset,
            },
        );
        Ok(())
    }

    #[cfg(test)]
    fn range_bounds(&self) -> Vec<(u64, u64)> {
        self.ranges.values().map(|r| (r.offset, r.length)).collect()
    }
}
