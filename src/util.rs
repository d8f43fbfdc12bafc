//! Filename derivation, layout arithmetic, and checksums.

use sha2::Digest;
use sha2::Sha256;

use crate::format::{EOF_SIZE, HEADER_SIZE, KEY_SHA256_SIZE};
use crate::tracker::EntryFileKey;
use crate::tracker::SubFile;

/// Index of the normal file storing `stream_index`. Streams 0 and 1 share
/// file 0; stream 2 lives alone in file 1.
pub(crate) fn file_index_for_stream(stream_index: usize) -> usize {
    debug_assert!(stream_index < crate::format::STREAM_COUNT);
    if stream_index == 2 { 1 } else { 0 }
}

/// Whether `file_index` may be left uncreated while its stream is empty.
pub(crate) fn can_omit_empty_file(file_index: usize) -> bool {
    file_index == file_index_for_stream(2)
}

/// Name of a normal entry file: `<hex16(hash)>_<i>`, with a
/// `todelete_<generation>_` prefix once the entry has been doomed.
pub(crate) fn entry_filename(key: &EntryFileKey, file_index: usize) -> String {
    if key.doom_generation == 0 {
        format!("{:016x}_{}", key.entry_hash, file_index)
    } else {
        format!(
            "todelete_{}_{:016x}_{}",
            key.doom_generation, key.entry_hash, file_index
        )
    }
}

/// Name of the sparse file: `<hex16(hash)>_s`, doomed form as above.
pub(crate) fn sparse_filename(key: &EntryFileKey) -> String {
    if key.doom_generation == 0 {
        format!("{:016x}_s", key.entry_hash)
    } else {
        format!("todelete_{}_{:016x}_s", key.doom_generation, key.entry_hash)
    }
}

pub(crate) fn filename_for_subfile(key: &EntryFileKey, subfile: SubFile) -> String {
    match subfile {
        SubFile::File0 => entry_filename(key, 0),
        SubFile::File1 => entry_filename(key, 1),
        SubFile::Sparse => sparse_filename(key),
    }
}

/// Prefix carried by every renamed-for-deletion file.
pub(crate) const DOOMED_FILENAME_PREFIX: &str = "todelete_";

/// Size a normal file has when it stores `data_size` payload bytes after a
/// header and key and before a single EOF record.
pub(crate) fn file_size_from_data_size(key_length: usize, data_size: u64) -> u64 {
    data_size + key_length as u64 + HEADER_SIZE as u64 + EOF_SIZE as u64
}

/// Inverse of [`file_size_from_data_size`]; negative when the file is too
/// short to be valid.
pub(crate) fn data_size_from_file_size(key_length: usize, file_size: u64) -> i64 {
    file_size as i64 - key_length as i64 - HEADER_SIZE as i64 - EOF_SIZE as i64
}

/// CRC-32 (IEEE) over `data`, starting from the zero state.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Continues a CRC-32 computation from `previous` over `data`.
pub(crate) fn incremental_crc32(previous: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(previous);
    hasher.update(data);
    hasher.finalize()
}

/// Fast 32-bit key hash stored in entry headers. Purely an integrity
/// cross-check; collisions are harmless.
pub(crate) fn key_hash32(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// SHA-256 of the key, stored before stream 0's EOF record as strong key
/// validation.
pub(crate) fn sha256_of_key(key: &str) -> [u8; KEY_SHA256_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames() {
        let mut key = EntryFileKey::new(0x0123_4567_89ab_cdef);
        assert_eq!(entry_filename(&key, 0), "0123456789abcdef_0");
        assert_eq!(entry_filename(&key, 1), "0123456789abcdef_1");
        assert_eq!(sparse_filename(&key), "0123456789abcdef_s");

        key.doom_generation = 3;
        assert_eq!(entry_filename(&key, 0), "todelete_3_0123456789abcdef_0");
        assert_eq!(sparse_filename(&key), "todelete_3_0123456789abcdef_s");
        assert!(entry_filename(&key, 0).starts_with(DOOMED_FILENAME_PREFIX));
    }

    #[test]
    fn size_arithmetic_round_trips() {
        let file_size = file_size_from_data_size(7, 100);
        assert_eq!(data_size_from_file_size(7, file_size), 100);
        // A file shorter than its fixed overhead computes negative.
        assert!(data_size_from_file_size(7, 10) < 0);
    }

    #[test]
    fn incremental_crc_matches_whole() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let whole = crc32(data);
        let split = incremental_crc32(incremental_crc32(0, &data[..10]), &data[10..]);
        assert_eq!(whole, split);
    }

    #[test]
    fn stream_to_file_mapping() {
        assert_eq!(file_index_for_stream(0), 0);
        assert_eq!(file_index_for_stream(1), 0);
        assert_eq!(file_index_for_stream(2), 1);
        assert!(!can_omit_empty_file(0));
        assert!(can_omit_empty_file(1));
    }
}
