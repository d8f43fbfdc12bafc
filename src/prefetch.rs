//! Read-once prefetch buffer used while opening an entry.

use smallvec::SmallVec;

use crate::file_ops::File;

/// A range of file 0 read ahead of time during open.
///
/// Opening an entry may read the whole file, or a block of trailer bytes
/// from its end, in a single I/O; subsequent parsing is then served from
/// memory. The buffer also tracks the earliest offset anything asked for,
/// which is how the engine learns the exact trailer size to request next
/// time.
#[derive(Debug)]
pub(crate) struct PrefetchBuffer {
    file_size: u64,
    // Stack storage for small entries keeps pressure off the allocator.
    buffer: SmallVec<[u8; 1024]>,
    offset_in_file: u64,
    earliest_requested_offset: u64,
}

impl PrefetchBuffer {
    pub(crate) fn new(file_size: u64) -> PrefetchBuffer {
        PrefetchBuffer {
            file_size,
            buffer: SmallVec::new(),
            offset_in_file: 0,
            earliest_requested_offset: file_size,
        }
    }

    /// Whether `[offset, offset + length)` lies entirely within the
    /// prefetched range. Records the request for trailer-size tuning either
    /// way.
    pub(crate) fn has_data(&mut self, offset: u64, length: u64) -> bool {
        let Some(end) = offset.checked_add(length) else {
            return false;
        };
        self.update_earliest_offset(offset);
        offset >= self.offset_in_file && end <= self.offset_in_file + self.buffer.len() as u64
    }

    /// Copies `[offset, offset + dest.len())` into `dest` if the whole range
    /// was prefetched; copies nothing otherwise.
    pub(crate) fn read(&mut self, offset: u64, dest: &mut [u8]) -> bool {
        if dest.is_empty() {
            return true;
        }
        if !self.has_data(offset, dest.len() as u64) {
            return false;
        }
        let start = (offset - self.offset_in_file) as usize;
        dest.copy_from_slice(&self.buffer[start..start + dest.len()]);
        true
    }

    /// Fills the buffer from `file`. Usable once per buffer.
    pub(crate) fn prefetch_from_file(&mut self, file: &File, offset: u64, length: u64) -> bool {
        if !self.buffer.is_empty() {
            return false;
        }
        self.buffer.resize(length as usize, 0);
        match file.read(offset, &mut self.buffer) {
            Ok(n) if n == length as usize => {
                self.offset_in_file = offset;
                true
            }
            _ => {
                self.buffer.clear();
                false
            }
        }
    }

    /// How much trailing data was requested through this buffer. Feeding the
    /// value back as the next open's trailer hint makes prefetching
    /// self-tuning.
    pub(crate) fn desired_trailer_prefetch_size(&self) -> u64 {
        self.file_size - self.earliest_requested_offset
    }

    fn update_earliest_offset(&mut self, offset: u64) {
        debug_assert!(self.earliest_requested_offset <= self.file_size);
        self.earliest_requested_offset = self.earliest_requested_offset.min(offset);
    }
}
