//! End-to-end tests driving the entry engine against a real directory.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use diskcache::format::{EOF_SIZE, HEADER_SIZE, KEY_SHA256_SIZE};
use diskcache::{
    CacheError, CrcRecord, CreationOutcome, EntryStat, FileOps, FileTracker, IndexHint, OsFileOps,
    PrefetchConfig, RangeResult, ReadCrcRequest, ReadRequest, SynchronousEntry, WriteRequest,
};
use tempfile::TempDir;

fn ops() -> Arc<dyn FileOps> {
    Arc::new(OsFileOps)
}

fn new_tracker(file_limit: usize) -> Arc<FileTracker> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(FileTracker::new(file_limit))
}

fn create(
    dir: &Path,
    key: &str,
    entry_hash: u64,
    tracker: &Arc<FileTracker>,
) -> CreationOutcome {
    SynchronousEntry::create_entry(dir, key, entry_hash, tracker, ops()).unwrap()
}

fn open(
    dir: &Path,
    key: &str,
    entry_hash: u64,
    tracker: &Arc<FileTracker>,
    trailer_prefetch_size: i32,
) -> Result<CreationOutcome, CacheError> {
    SynchronousEntry::open_entry(
        dir,
        Some(key),
        entry_hash,
        tracker,
        ops(),
        PrefetchConfig::default(),
        trailer_prefetch_size,
    )
}

fn write_stream(
    entry: &mut SynchronousEntry,
    entry_stat: &mut EntryStat,
    index: usize,
    offset: u32,
    data: &[u8],
) {
    let result = entry
        .write_data(
            &WriteRequest {
                index,
                offset,
                truncate: false,
                doomed: false,
                previous_crc32: None,
            },
            data,
            entry_stat,
        )
        .unwrap();
    assert_eq!(result.bytes_written, data.len());
}

fn crc_record(index: usize, data: &[u8]) -> CrcRecord {
    CrcRecord {
        index,
        has_crc32: true,
        data_crc32: crc32fast::hash(data),
    }
}

fn entry_file(dir: &Path, entry_hash: u64, file_index: usize) -> PathBuf {
    dir.join(format!("{entry_hash:016x}_{file_index}"))
}

fn cache_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn create_write_stream_1_and_read_back() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0xdead;

    let outcome = create(dir.path(), "K", entry_hash, &tracker);
    assert!(outcome.created);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;

    write_stream(&mut entry, &mut entry_stat, 1, 0, b"hello");
    assert_eq!(entry_stat.data_size(1), 5);

    let records = [crc_record(0, b""), crc_record(1, b"hello")];
    let close_results = entry.close(&entry_stat, &records, b"");
    assert_eq!(
        close_results.estimated_trailer_prefetch_size,
        (KEY_SHA256_SIZE + EOF_SIZE) as i32
    );

    // Stream 2 was never written, so file 1 must not exist.
    assert!(entry_file(dir.path(), entry_hash, 0).exists());
    assert!(!entry_file(dir.path(), entry_hash, 1).exists());
    assert!(tracker.is_empty());

    let outcome = open(dir.path(), "K", entry_hash, &tracker, -1).unwrap();
    assert!(!outcome.created);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    assert_eq!(entry_stat.data_size(0), 0);
    assert_eq!(entry_stat.data_size(1), 5);
    assert_eq!(entry_stat.data_size(2), 0);
    // Stream 0's prefetch buffer carries its payload plus the key SHA-256.
    assert_eq!(outcome.stream_prefetch[0].data.len(), KEY_SHA256_SIZE);

    let mut buf = [0u8; 5];
    let result = entry
        .read_data(
            &ReadRequest {
                index: 1,
                offset: 0,
                crc: Some(ReadCrcRequest {
                    previous_crc32: 0,
                    verify_at_end: true,
                }),
            },
            &mut entry_stat,
            &mut buf,
        )
        .unwrap();
    assert_eq!(result.bytes_read, 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(result.updated_crc32, Some(crc32fast::hash(b"hello")));

    entry.close(&entry_stat, &records, b"");
    assert!(tracker.is_empty());
}

#[test]
fn all_three_streams_round_trip() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0x0123_4567;

    let outcome = create(dir.path(), "round-trip", entry_hash, &tracker);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;

    write_stream(&mut entry, &mut entry_stat, 1, 0, b"body bytes");
    write_stream(&mut entry, &mut entry_stat, 2, 0, b"code cache");
    // The first write to stream 2 materializes file 1.
    assert!(entry_file(dir.path(), entry_hash, 1).exists());

    let stat_for_close = EntryStat::new(
        entry_stat.last_used(),
        entry_stat.last_modified(),
        [4, 10, 10],
        0,
    );
    let records = [
        crc_record(0, b"meta"),
        crc_record(1, b"body bytes"),
        crc_record(2, b"code cache"),
    ];
    entry.close(&stat_for_close, &records, b"meta");

    let outcome = open(dir.path(), "round-trip", entry_hash, &tracker, -1).unwrap();
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    assert_eq!(entry_stat.data_size(0), 4);
    assert_eq!(entry_stat.data_size(1), 10);
    assert_eq!(entry_stat.data_size(2), 10);
    assert_eq!(&outcome.stream_prefetch[0].data[..4], b"meta");

    for (index, expected) in [(1usize, &b"body bytes"[..]), (2, &b"code cache"[..])] {
        let mut buf = vec![0u8; expected.len()];
        let result = entry
            .read_data(
                &ReadRequest {
                    index,
                    offset: 0,
                    crc: Some(ReadCrcRequest {
                        previous_crc32: 0,
                        verify_at_end: true,
                    }),
                },
                &mut entry_stat,
                &mut buf,
            )
            .unwrap();
        assert_eq!(result.bytes_read, expected.len());
        assert_eq!(buf, expected);
    }

    entry.close(&entry_stat, &records, b"meta");
    assert!(tracker.is_empty());
}

#[test]
fn empty_entry_round_trips() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 7;

    let outcome = create(dir.path(), "empty", entry_hash, &tracker);
    let records = [crc_record(0, b""), crc_record(1, b"")];
    outcome.entry.close(&outcome.entry_stat, &records, b"");

    // File 0 holds nothing but fixed overhead.
    let expected = (HEADER_SIZE + "empty".len() + 2 * EOF_SIZE + KEY_SHA256_SIZE) as u64;
    assert_eq!(
        fs::metadata(entry_file(dir.path(), entry_hash, 0)).unwrap().len(),
        expected
    );

    let outcome = open(dir.path(), "empty", entry_hash, &tracker, -1).unwrap();
    assert_eq!(outcome.entry_stat.data_size(0), 0);
    assert_eq!(outcome.entry_stat.data_size(1), 0);
    assert_eq!(outcome.entry_stat.data_size(2), 0);
    outcome.entry.close(&outcome.entry_stat, &records, b"");
}

#[test]
fn corrupted_stream_0_fails_open_with_checksum_mismatch() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0xbad;

    let outcome = create(dir.path(), "K", entry_hash, &tracker);
    let entry_stat = EntryStat::new(SystemTime::now(), SystemTime::now(), [1, 0, 0], 0);
    let records = [crc_record(0, b"x"), crc_record(1, b"")];
    outcome.entry.close(&entry_stat, &records, b"x");

    // Flip the single stream-0 byte in place.
    let file0 = entry_file(dir.path(), entry_hash, 0);
    let stream_0_offset = entry_stat.offset_in_file(1, 0, 0);
    let mut contents = fs::read(&file0).unwrap();
    contents[stream_0_offset as usize] ^= 0xff;
    fs::write(&file0, contents).unwrap();

    let err = open(dir.path(), "K", entry_hash, &tracker, -1).unwrap_err();
    assert_eq!(err, CacheError::ChecksumMismatch);
    // The failed open doomed the entry; nothing of it survives, not even
    // under a todelete_ name.
    assert_eq!(cache_files(dir.path()), Vec::<String>::new());
    assert!(tracker.is_empty());
}

#[test]
fn doomed_entry_keeps_working_and_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0xd00d;

    let outcome = create(dir.path(), "K", entry_hash, &tracker);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;

    entry.doom().unwrap();
    assert_eq!(entry.entry_file_key().doom_generation, 1);
    // The live filename is gone, so a second opener sees nothing.
    assert!(!entry_file(dir.path(), entry_hash, 0).exists());
    assert!(open(dir.path(), "K", entry_hash, &tracker, -1).is_err());

    // The original holder continues through the renamed files.
    write_stream(&mut entry, &mut entry_stat, 1, 0, b"0123456789");
    let records = [crc_record(0, b""), crc_record(1, b"0123456789")];
    entry.close(&entry_stat, &records, b"");

    assert_eq!(cache_files(dir.path()), Vec::<String>::new());
    assert!(tracker.is_empty());
}

#[test]
fn file_descriptor_cap_closes_idle_files_and_reopens_transparently() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(4);

    let mut entries = Vec::new();
    for i in 0..10u64 {
        let key = format!("K{i}");
        let outcome = create(dir.path(), &key, i, &tracker);
        let mut entry = outcome.entry;
        let mut entry_stat = outcome.entry_stat;
        write_stream(&mut entry, &mut entry_stat, 1, 0, b"abc");
        entries.push((entry, entry_stat));
    }
    // 10 registered file-0 descriptors, 6 of them closed by the cap.
    assert_eq!(tracker.open_file_count(), 4);

    // The first entry's descriptor was a victim; reading reopens it without
    // the entry noticing.
    let (entry, entry_stat) = &mut entries[0];
    let mut buf = [0u8; 3];
    let result = entry
        .read_data(
            &ReadRequest { index: 1, offset: 0, crc: None },
            entry_stat,
            &mut buf,
        )
        .unwrap();
    assert_eq!(result.bytes_read, 3);
    assert_eq!(&buf, b"abc");
    assert_eq!(tracker.open_file_count(), 4);

    let records = [crc_record(0, b""), crc_record(1, b"abc")];
    for (entry, entry_stat) in entries {
        entry.close(&entry_stat, &records, b"");
    }
    assert!(tracker.is_empty());
    assert_eq!(tracker.open_file_count(), 0);
}

#[test]
fn sparse_ranges_coalesce_and_read_across_boundaries() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0x5;

    let outcome = create(dir.path(), "K", entry_hash, &tracker);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;

    assert_eq!(
        entry.write_sparse_data(100, b"aaaa", 1 << 20, &mut entry_stat).unwrap(),
        4
    );
    let fifty_bs = [b'b'; 50];
    assert_eq!(
        entry.write_sparse_data(50, &fifty_bs, 1 << 20, &mut entry_stat).unwrap(),
        50
    );
    assert_eq!(entry_stat.sparse_data_size(), 54);

    // 50..104 is contiguous coverage.
    assert_eq!(
        entry.get_available_range(0, 200),
        RangeResult { start: 50, available: 54 }
    );

    let mut buf = [0u8; 54];
    assert_eq!(entry.read_sparse_data(50, &mut buf, &mut entry_stat).unwrap(), 54);
    assert_eq!(&buf[..50], &fifty_bs[..]);
    assert_eq!(&buf[50..], b"aaaa");

    let records = [crc_record(0, b""), crc_record(1, b"")];
    entry.close(&entry_stat, &records, b"");
    assert!(dir.path().join(format!("{entry_hash:016x}_s")).exists());

    // The sparse index is rebuilt from disk on the next open.
    let outcome = open(dir.path(), "K", entry_hash, &tracker, -1).unwrap();
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    assert_eq!(entry_stat.sparse_data_size(), 54);
    let mut buf = [0u8; 4];
    assert_eq!(entry.read_sparse_data(100, &mut buf, &mut entry_stat).unwrap(), 4);
    assert_eq!(&buf, b"aaaa");
    entry.close(&entry_stat, &records, b"");
}

#[test]
fn sparse_cap_overflow_drops_existing_ranges() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);

    let outcome = create(dir.path(), "K", 11, &tracker);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;

    entry.write_sparse_data(0, &[1u8; 64], 100, &mut entry_stat).unwrap();
    assert_eq!(entry_stat.sparse_data_size(), 64);
    // 64 + 64 > 100: everything is dropped before the new write lands.
    entry.write_sparse_data(200, &[2u8; 64], 100, &mut entry_stat).unwrap();
    assert_eq!(entry_stat.sparse_data_size(), 64);

    let mut buf = [0u8; 64];
    assert_eq!(entry.read_sparse_data(0, &mut buf, &mut entry_stat).unwrap(), 0);
    assert_eq!(entry.read_sparse_data(200, &mut buf, &mut entry_stat).unwrap(), 64);

    let records = [crc_record(0, b""), crc_record(1, b"")];
    entry.close(&entry_stat, &records, b"");
}

#[test]
fn trailer_prefetch_size_feeds_back_exactly() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0x717;

    let outcome = create(dir.path(), "K", entry_hash, &tracker);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    write_stream(&mut entry, &mut entry_stat, 1, 0, b"hello");
    let entry_stat = EntryStat::new(
        entry_stat.last_used(),
        entry_stat.last_modified(),
        [4, 5, 0],
        0,
    );
    let records = [crc_record(0, b"meta"), crc_record(1, b"hello")];
    let close_results = entry.close(&entry_stat, &records, b"meta");
    let expected_trailer = (4 + KEY_SHA256_SIZE + EOF_SIZE) as i32;
    assert_eq!(close_results.estimated_trailer_prefetch_size, expected_trailer);

    // A cold open without any hint must still report the exact trailer it
    // needed, matching the close-time estimate.
    let outcome = open(dir.path(), "K", entry_hash, &tracker, -1).unwrap();
    assert_eq!(outcome.computed_trailer_prefetch_size, expected_trailer);
    assert_eq!(&outcome.stream_prefetch[0].data[..4], b"meta");
    assert_eq!(
        outcome.stream_prefetch[0].stream_crc32,
        crc32fast::hash(b"meta")
    );
    // Stream 1 is not in the trailer, so it is not handed over.
    assert!(outcome.stream_prefetch[1].data.is_empty());
    outcome.entry.close(&entry_stat, &records, b"meta");

    // Feeding the hint back covers the trailer in one read and computes the
    // same value again.
    let outcome = open(dir.path(), "K", entry_hash, &tracker, expected_trailer).unwrap();
    assert_eq!(outcome.computed_trailer_prefetch_size, expected_trailer);
    outcome.entry.close(&entry_stat, &records, b"meta");

    // A full-file prefetch additionally hands over stream 1.
    let outcome = SynchronousEntry::open_entry(
        dir.path(),
        Some("K"),
        entry_hash,
        &tracker,
        ops(),
        PrefetchConfig {
            full_prefetch_bytes: 4096,
            trailer_prefetch_speculative_bytes: 0,
        },
        -1,
    )
    .unwrap();
    assert_eq!(outcome.stream_prefetch[1].data, b"hello");
    assert_eq!(
        outcome.stream_prefetch[1].stream_crc32,
        crc32fast::hash(b"hello")
    );
    outcome.entry.close(&entry_stat, &records, b"meta");
}

#[test]
fn zero_length_write_at_end_is_a_noop_and_truncate_shrinks() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0x22;

    let outcome = create(dir.path(), "K", entry_hash, &tracker);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    write_stream(&mut entry, &mut entry_stat, 1, 0, b"hello");

    // Zero bytes at exactly the end: size unchanged, timestamps refreshed.
    let before = entry_stat.last_modified();
    entry
        .write_data(
            &WriteRequest {
                index: 1,
                offset: 5,
                truncate: false,
                doomed: false,
                previous_crc32: None,
            },
            b"",
            &mut entry_stat,
        )
        .unwrap();
    assert_eq!(entry_stat.data_size(1), 5);
    assert!(entry_stat.last_modified() >= before);

    // Truncate at offset 3: stream shrinks, CRC becomes unknown.
    entry
        .write_data(
            &WriteRequest {
                index: 1,
                offset: 3,
                truncate: true,
                doomed: false,
                previous_crc32: None,
            },
            b"",
            &mut entry_stat,
        )
        .unwrap();
    assert_eq!(entry_stat.data_size(1), 3);

    let records = [
        crc_record(0, b""),
        CrcRecord { index: 1, has_crc32: false, data_crc32: 0 },
    ];
    entry.close(&entry_stat, &records, b"");

    // The CRC-less footer reads back without verification.
    let outcome = open(dir.path(), "K", entry_hash, &tracker, -1).unwrap();
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    assert_eq!(entry_stat.data_size(1), 3);
    let mut buf = [0u8; 3];
    let result = entry
        .read_data(
            &ReadRequest {
                index: 1,
                offset: 0,
                crc: Some(ReadCrcRequest { previous_crc32: 0, verify_at_end: true }),
            },
            &mut entry_stat,
            &mut buf,
        )
        .unwrap();
    assert_eq!(result.bytes_read, 3);
    assert_eq!(&buf, b"hel");
    entry.close(&entry_stat, &records, b"");
}

#[test]
fn open_with_wrong_key_fails() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0x77;

    let outcome = create(dir.path(), "K", entry_hash, &tracker);
    let records = [crc_record(0, b""), crc_record(1, b"")];
    outcome.entry.close(&outcome.entry_stat, &records, b"");

    // Same hash, different key: the SHA-256 in the trailer gives it away.
    let err = open(dir.path(), "L", entry_hash, &tracker, -1).unwrap_err();
    assert_eq!(err, CacheError::Failed);
    assert!(tracker.is_empty());
}

#[test]
fn open_without_key_recovers_it_from_the_header() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0x88;

    let outcome = create(dir.path(), "the-key", entry_hash, &tracker);
    let records = [crc_record(0, b""), crc_record(1, b"")];
    outcome.entry.close(&outcome.entry_stat, &records, b"");

    let outcome = SynchronousEntry::open_entry(
        dir.path(),
        None,
        entry_hash,
        &tracker,
        ops(),
        PrefetchConfig::default(),
        -1,
    )
    .unwrap();
    assert_eq!(outcome.entry.key(), Some("the-key"));
    outcome.entry.close(&outcome.entry_stat, &records, b"");
}

#[test]
fn deferred_header_check_catches_corruption_on_first_use() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0x99;

    let outcome = create(dir.path(), "K", entry_hash, &tracker);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    write_stream(&mut entry, &mut entry_stat, 2, 0, b"stream two");
    let records = [
        crc_record(0, b""),
        crc_record(1, b""),
        crc_record(2, b"stream two"),
    ];
    entry.close(&entry_stat, &records, b"");

    // Break file 1's header magic. The open does not look at it (stream 2's
    // footer is enough), but the first read of stream 2 must.
    let file1 = entry_file(dir.path(), entry_hash, 1);
    let mut contents = fs::read(&file1).unwrap();
    contents[0] ^= 0xff;
    fs::write(&file1, contents).unwrap();

    let outcome = open(dir.path(), "K", entry_hash, &tracker, -1).unwrap();
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    assert_eq!(entry_stat.data_size(2), 10);

    let mut buf = [0u8; 10];
    let err = entry
        .read_data(
            &ReadRequest { index: 2, offset: 0, crc: None },
            &mut entry_stat,
            &mut buf,
        )
        .unwrap_err();
    assert_eq!(err, CacheError::Failed);
    // The failed check doomed the entry.
    assert_ne!(entry.entry_file_key().doom_generation, 0);
    entry.close(&entry_stat, &[], b"");
    assert_eq!(cache_files(dir.path()), Vec::<String>::new());
}

#[test]
fn broken_stream_2_footer_recovers_as_empty() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0xaa;

    let outcome = create(dir.path(), "K", entry_hash, &tracker);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    write_stream(&mut entry, &mut entry_stat, 1, 0, b"keep me");
    write_stream(&mut entry, &mut entry_stat, 2, 0, b"lose me");
    let records = [
        crc_record(0, b""),
        crc_record(1, b"keep me"),
        crc_record(2, b"lose me"),
    ];
    entry.close(&entry_stat, &records, b"");

    // Stomp on stream 2's EOF record.
    let file1 = entry_file(dir.path(), entry_hash, 1);
    let len = fs::metadata(&file1).unwrap().len() as usize;
    let mut contents = fs::read(&file1).unwrap();
    for byte in &mut contents[len - EOF_SIZE..] {
        *byte = 0;
    }
    fs::write(&file1, contents).unwrap();

    // The open succeeds; stream 2 is dropped and its file deleted, while
    // stream 1 survives.
    let outcome = open(dir.path(), "K", entry_hash, &tracker, -1).unwrap();
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    assert_eq!(entry_stat.data_size(1), 7);
    assert_eq!(entry_stat.data_size(2), 0);
    assert!(!entry_file(dir.path(), entry_hash, 1).exists());

    let mut buf = [0u8; 7];
    let result = entry
        .read_data(
            &ReadRequest { index: 1, offset: 0, crc: None },
            &mut entry_stat,
            &mut buf,
        )
        .unwrap();
    assert_eq!(result.bytes_read, 7);
    assert_eq!(&buf, b"keep me");
    entry.close(&entry_stat, &[crc_record(0, b""), crc_record(1, b"keep me")], b"");
}

#[test]
fn open_or_create_honors_index_hints() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let entry_hash = 0xbb;

    // Miss on an empty directory: created.
    let outcome = SynchronousEntry::open_or_create_entry(
        dir.path(),
        "K",
        entry_hash,
        IndexHint::Miss,
        false,
        &tracker,
        ops(),
        PrefetchConfig::default(),
        -1,
    )
    .unwrap();
    assert!(outcome.created);
    let mut entry = outcome.entry;
    let mut entry_stat = outcome.entry_stat;
    write_stream(&mut entry, &mut entry_stat, 1, 0, b"original");
    let records = [crc_record(0, b""), crc_record(1, b"original")];
    entry.close(&entry_stat, &records, b"");

    // A wrong Miss hint demotes to an open and keeps the data.
    let outcome = SynchronousEntry::open_or_create_entry(
        dir.path(),
        "K",
        entry_hash,
        IndexHint::Miss,
        false,
        &tracker,
        ops(),
        PrefetchConfig::default(),
        -1,
    )
    .unwrap();
    assert!(!outcome.created);
    assert_eq!(outcome.entry_stat.data_size(1), 8);
    outcome.entry.close(&outcome.entry_stat, &records, b"");

    // A Hit opens directly.
    let outcome = SynchronousEntry::open_or_create_entry(
        dir.path(),
        "K",
        entry_hash,
        IndexHint::Hit,
        false,
        &tracker,
        ops(),
        PrefetchConfig::default(),
        -1,
    )
    .unwrap();
    assert!(!outcome.created);
    outcome.entry.close(&outcome.entry_stat, &records, b"");

    // An optimistic create must not adopt the existing entry: the caller
    // already promised its client a fresh one.
    let outcome = SynchronousEntry::open_or_create_entry(
        dir.path(),
        "K",
        entry_hash,
        IndexHint::Miss,
        true,
        &tracker,
        ops(),
        PrefetchConfig::default(),
        -1,
    )
    .unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.entry_stat.data_size(1), 0);
    outcome
        .entry
        .close(&outcome.entry_stat, &[crc_record(0, b""), crc_record(1, b"")], b"");
    assert!(tracker.is_empty());
}

#[test]
fn doomed_leftovers_are_swept_and_statics_clean_up() {
    let dir = TempDir::new().unwrap();
    let tracker = new_tracker(16);
    let file_ops = OsFileOps;

    let outcome = create(dir.path(), "K", 0xcc, &tracker);
    let records = [crc_record(0, b""), crc_record(1, b"")];
    outcome.entry.close(&outcome.entry_stat, &records, b"");

    // Simulate a doom whose holder died before closing.
    fs::write(dir.path().join("todelete_3_00000000000000ff_0"), b"stale").unwrap();
    fs::write(dir.path().join("todelete_3_00000000000000ff_s"), b"stale").unwrap();

    let swept = SynchronousEntry::delete_doomed_files(dir.path(), &file_ops).unwrap();
    assert_eq!(swept, 2);
    assert_eq!(cache_files(dir.path()), vec![format!("{:016x}_0", 0xccu64)]);

    SynchronousEntry::truncate_entry_files(dir.path(), 0xcc, &file_ops).unwrap();
    assert_eq!(
        fs::metadata(entry_file(dir.path(), 0xcc, 0)).unwrap().len(),
        0
    );

    SynchronousEntry::delete_entry_set_files(&[0xcc], dir.path(), &file_ops).unwrap();
    assert_eq!(cache_files(dir.path()), Vec::<String>::new());
}
