//! Process-wide tracking of the files the cache holds open.
//!
//! A single [`FileTracker`] owns every open cache [`File`], across all
//! entries. Entries never hold a file directly; they borrow one for the
//! duration of an operation through [`FileTracker::acquire`], which hands
//! out a [`FileHandle`]. Decoupling logical registration from the kernel
//! descriptor lets the tracker close idle files when a configured descriptor
//! budget is exceeded and transparently reopen them on the next acquire.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use log::error;
use log::warn;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use parking_lot::Mutex;

use crate::file_ops::File;
use crate::file_ops::FileOps;
use crate::format::TOTAL_FILE_COUNT;
use crate::util;

/// One of the on-disk files backing an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SubFile {
    /// `<hash>_0`: streams 0 and 1.
    File0 = 0,
    /// `<hash>_1`: stream 2; omitted while that stream is empty.
    File1 = 1,
    /// `<hash>_s`: the sparse stream.
    Sparse = 2,
}

impl SubFile {
    pub(crate) fn for_file_index(file_index: usize) -> SubFile {
        debug_assert!(file_index < crate::format::NORMAL_FILE_COUNT);
        if file_index == 0 { SubFile::File0 } else { SubFile::File1 }
    }

    pub(crate) fn index(self) -> usize {
        u8::from(self) as usize
    }
}

/// On-disk identity of an entry: its key hash plus the doom generation that
/// discriminates a live entry from renamed-for-deletion instances of the
/// same hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryFileKey {
    /// 64-bit hash of the entry key, fixed by the caller.
    pub entry_hash: u64,
    /// 0 while the entry is live; set once when the entry is doomed.
    pub doom_generation: u64,
}

impl EntryFileKey {
    /// Key for a live (not yet doomed) entry.
    pub fn new(entry_hash: u64) -> EntryFileKey {
        EntryFileKey {
            entry_hash,
            doom_generation: 0,
        }
    }
}

/// Opaque identity of a tracked entry. Distinct entries sharing an
/// `entry_hash` (hash collisions, doomed generations) get distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct OwnerId(u64);

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

impl OwnerId {
    pub(crate) fn next() -> OwnerId {
        OwnerId(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    NoRegistration,
    Registered,
    Acquired,
    AcquiredPendingClose,
}

/// Bookkeeping for one entry's files. The same record can run through the
/// register/close cycle multiple times for `FILE_1`, which is routinely
/// closed and deleted when stream 2 turns out empty, then re-created on a
/// later write.
#[derive(Debug)]
struct TrackedFiles {
    owner: OwnerId,
    key: EntryFileKey,
    dir: PathBuf,
    files: [Option<Arc<File>>; TOTAL_FILE_COUNT],
    state: [SlotState; TOTAL_FILE_COUNT],
    in_lru: bool,
}

impl TrackedFiles {
    fn new(owner: OwnerId, key: EntryFileKey, dir: PathBuf) -> TrackedFiles {
        TrackedFiles {
            owner,
            key,
            dir,
            files: [None, None, None],
            state: [SlotState::NoRegistration; TOTAL_FILE_COUNT],
            in_lru: false,
        }
    }

    fn empty(&self) -> bool {
        self.state.iter().all(|s| *s == SlotState::NoRegistration)
    }

    fn has_open_files(&self) -> bool {
        self.files.iter().any(|f| f.is_some())
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    tracked: HashMap<u64, Vec<TrackedFiles>>,
    // Owner -> entry_hash, so operations can find a record from the id alone.
    owners: HashMap<OwnerId, u64>,
    // Records currently holding at least one open file; front is most
    // recently used.
    lru: VecDeque<(u64, OwnerId)>,
    open_files: usize,
}

impl TrackerState {
    fn record_mut(&mut self, owner: OwnerId) -> Option<&mut TrackedFiles> {
        let hash = *self.owners.get(&owner)?;
        self.tracked
            .get_mut(&hash)?
            .iter_mut()
            .find(|r| r.owner == owner)
    }
}

/// Shared coordinator that owns every open cache file and enforces the
/// process-wide descriptor budget.
#[derive(Debug)]
pub struct FileTracker {
    file_limit: usize,
    state: Mutex<TrackerState>,
}

impl FileTracker {
    /// Creates a tracker that keeps at most `file_limit` files open while no
    /// handle is lent out.
    pub fn new(file_limit: usize) -> FileTracker {
        FileTracker {
            file_limit,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Hands ownership of `file`, backing `subfile` of the entry identified
    /// by `owner`/`key`, to the tracker. Must eventually be balanced by a
    /// [`FileTracker::close`] for the same slot.
    pub(crate) fn register(
        &self,
        owner: OwnerId,
        key: EntryFileKey,
        dir: &Path,
        subfile: SubFile,
        file: File,
    ) {
        let mut to_close = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let candidates = state.tracked.entry(key.entry_hash).or_default();
            if !candidates.iter().any(|r| r.owner == owner) {
                candidates.push(TrackedFiles::new(owner, key, dir.to_owned()));
            }
            state.owners.insert(owner, key.entry_hash);
            let record = state
                .record_mut(owner)
                .expect("tracked record just inserted");
            let index = subfile.index();
            debug_assert_eq!(record.state[index], SlotState::NoRegistration);
            record.files[index] = Some(Arc::new(file));
            record.state[index] = SlotState::Registered;
            ensure_in_front_of_lru(&mut state.lru, &mut state.tracked, key.entry_hash, owner);
            state.open_files += 1;
            close_files_if_too_many(state, self.file_limit, &mut to_close);
        }
        // Dropped outside the lock.
        drop(to_close);
    }

    /// Lends out the file backing `subfile` for the duration of one
    /// operation, reopening it if it was closed under descriptor pressure.
    /// Check [`FileHandle::is_ok`] before use: the reopen may have failed.
    pub(crate) fn acquire(
        tracker: &Arc<FileTracker>,
        file_ops: &dyn FileOps,
        owner: OwnerId,
        subfile: SubFile,
    ) -> FileHandle {
        let mut to_close = Vec::new();
        let file = {
            let mut guard = tracker.state.lock();
            let state = &mut *guard;
            let Some(record) = state.record_mut(owner) else {
                error!("acquire of untracked cache entry");
                return FileHandle {
                    tracker: Arc::clone(tracker),
                    owner: None,
                    subfile,
                    file: None,
                };
            };
            let index = subfile.index();
            debug_assert_eq!(record.state[index], SlotState::Registered);
            record.state[index] = SlotState::Acquired;
            let hash = record.key.entry_hash;
            let needs_reopen = record.files[index].is_none();
            if needs_reopen {
                let path = record.dir.join(util::filename_for_subfile(&record.key, subfile));
                match file_ops.open(&path) {
                    Ok(file) => {
                        record.files[index] = Some(Arc::new(file));
                        state.open_files += 1;
                    }
                    Err(e) => warn!("failed to reopen {:?}: {}", path, e),
                }
            }
            ensure_in_front_of_lru(&mut state.lru, &mut state.tracked, hash, owner);
            if needs_reopen {
                // The reopen may have pushed us over the limit. Nothing in
                // this record is eligible: the slot is already Acquired.
                close_files_if_too_many(state, tracker.file_limit, &mut to_close);
            }
            state
                .record_mut(owner)
                .and_then(|r| r.files[subfile.index()].clone())
        };
        drop(to_close);
        FileHandle {
            tracker: Arc::clone(tracker),
            owner: Some(owner),
            subfile,
            file,
        }
    }

    /// Marks the slot eligible for closing again; runs any close deferred
    /// while the handle was out. Called from [`FileHandle`]'s destructor.
    fn release(&self, owner: OwnerId, subfile: SubFile) {
        let mut to_close = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(record) = state.record_mut(owner) else {
                error!("release of untracked cache entry");
                return;
            };
            let index = subfile.index();
            debug_assert!(matches!(
                record.state[index],
                SlotState::Acquired | SlotState::AcquiredPendingClose
            ));
            if record.state[index] == SlotState::AcquiredPendingClose {
                prepare_close(state, owner, index, &mut to_close);
            } else {
                record.state[index] = SlotState::Registered;
            }
            // We may have been over the limit with everything lent out;
            // now is the time to close extra files.
            close_files_if_too_many(state, self.file_limit, &mut to_close);
        }
        drop(to_close);
    }

    /// Declares the entry done with `subfile`. If a handle is still out the
    /// close happens when it is released; afterwards the slot may be
    /// re-registered.
    pub(crate) fn close(&self, owner: OwnerId, subfile: SubFile) {
        let mut to_close = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(record) = state.record_mut(owner) else {
                error!("close of untracked cache entry");
                return;
            };
            let index = subfile.index();
            debug_assert!(matches!(
                record.state[index],
                SlotState::Acquired | SlotState::Registered
            ));
            if record.state[index] == SlotState::Acquired {
                record.state[index] = SlotState::AcquiredPendingClose;
            } else {
                prepare_close(state, owner, index, &mut to_close);
            }
        }
        drop(to_close);
    }

    /// Dooms the entry: picks a doom generation larger than any other
    /// tracked instance of the same hash and records it both in the
    /// tracker's bookkeeping and in the caller's `key`. The caller is
    /// responsible for the actual renames.
    pub(crate) fn doom(&self, owner: OwnerId, key: &mut EntryFileKey) {
        let mut state = self.state.lock();
        let Some(records) = state.tracked.get_mut(&key.entry_hash) else {
            error!("doom of untracked cache entry");
            return;
        };
        let max_generation = records
            .iter()
            .map(|r| r.key.doom_generation)
            .max()
            .unwrap_or(0);
        // Wrapping the counter would let distinct keys alias each other's
        // files; refuse instead.
        assert_ne!(max_generation, u64::MAX, "doom generation exhausted");
        let new_generation = max_generation + 1;
        key.doom_generation = new_generation;
        for record in records.iter_mut() {
            if record.owner == owner {
                record.key.doom_generation = new_generation;
            }
        }
    }

    /// Number of files currently held open by the tracker.
    pub fn open_file_count(&self) -> usize {
        self.state.lock().open_files
    }

    /// True when no bookkeeping remains. Only meaningful when the caller
    /// knows no other thread is using the tracker.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.tracked.is_empty() && state.lru.is_empty()
    }
}

/// Moves the record to the front of the LRU, inserting it if absent.
fn ensure_in_front_of_lru(
    lru: &mut VecDeque<(u64, OwnerId)>,
    tracked: &mut HashMap<u64, Vec<TrackedFiles>>,
    hash: u64,
    owner: OwnerId,
) {
    let record = tracked
        .get_mut(&hash)
        .and_then(|v| v.iter_mut().find(|r| r.owner == owner))
        .expect("LRU update for untracked record");
    if record.in_lru {
        if let Some(pos) = lru.iter().position(|&(_, o)| o == owner) {
            if pos != 0 {
                lru.remove(pos);
                lru.push_front((hash, owner));
            }
        }
    } else {
        record.in_lru = true;
        lru.push_front((hash, owner));
    }
}

/// Executes a non-deferred close of one slot: moves the file out (into
/// `to_close`) and drops the whole record once every slot is unregistered.
fn prepare_close(
    state: &mut TrackerState,
    owner: OwnerId,
    index: usize,
    to_close: &mut Vec<Arc<File>>,
) {
    let Some(record) = state.record_mut(owner) else {
        return;
    };
    if let Some(file) = record.files[index].take() {
        to_close.push(file);
        state.open_files -= 1;
    }
    let record = state.record_mut(owner).expect("record vanished mid-close");
    record.state[index] = SlotState::NoRegistration;
    if record.empty() {
        let hash = record.key.entry_hash;
        let in_lru = record.in_lru;
        if in_lru {
            if let Some(pos) = state.lru.iter().position(|&(_, o)| o == owner) {
                state.lru.remove(pos);
            }
        }
        if let Some(records) = state.tracked.get_mut(&hash) {
            records.retain(|r| r.owner != owner);
            if records.is_empty() {
                state.tracked.remove(&hash);
            }
        }
        state.owners.remove(&owner);
    }
}

/// Walks the LRU from the tail, closing `Registered` files until the open
/// count is back under the limit. Records left with nothing open drop out of
/// the LRU so they are not rescanned; they rejoin on the next reopen or
/// register.
fn close_files_if_too_many(
    state: &mut TrackerState,
    file_limit: usize,
    to_close: &mut Vec<Arc<File>>,
) {
    let mut i = state.lru.len();
    while state.open_files > file_limit && i > 0 {
        i -= 1;
        let (hash, owner) = state.lru[i];
        let Some(record) = state
            .tracked
            .get_mut(&hash)
            .and_then(|v| v.iter_mut().find(|r| r.owner == owner))
        else {
            continue;
        };
        for index in 0..TOTAL_FILE_COUNT {
            if record.state[index] == SlotState::Registered {
                if let Some(file) = record.files[index].take() {
                    to_close.push(file);
                    state.open_files -= 1;
                }
            }
        }
        if !record.has_open_files() {
            record.in_lru = false;
            state.lru.remove(i);
        }
    }
}

/// Scoped lease of a [`File`] from the tracker.
///
/// While alive, the underlying file will not be closed by the descriptor
/// limiter. Dropping the handle returns the slot to the tracker, executing
/// any close that was deferred in the meantime. A handle must not outlive
/// the operation it was acquired for.
#[derive(Debug)]
pub struct FileHandle {
    tracker: Arc<FileTracker>,
    owner: Option<OwnerId>,
    subfile: SubFile,
    file: Option<Arc<File>>,
}

impl FileHandle {
    /// Whether the handle points at a live file. Normally the first thing
    /// checked after [`FileTracker::acquire`]; reopening under descriptor
    /// pressure can fail.
    pub fn is_ok(&self) -> bool {
        self.file.is_some()
    }

    /// The borrowed file, if the acquire succeeded.
    pub fn get(&self) -> Option<&File> {
        self.file.as_deref()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let Some(owner) = self.owner {
            self.tracker.release(owner, self.subfile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_ops::OsFileOps;

    fn make_file(ops: &OsFileOps, dir: &Path, key: &EntryFileKey, subfile: SubFile) -> File {
        ops.create(&dir.join(util::filename_for_subfile(key, subfile)))
            .unwrap()
    }

    #[test]
    fn register_acquire_release_close() {
        let dir = tempfile::tempdir().unwrap();
        let ops = OsFileOps;
        let tracker = Arc::new(FileTracker::new(10));
        let owner = OwnerId::next();
        let key = EntryFileKey::new(7);

        let file = make_file(&ops, dir.path(), &key, SubFile::File0);
        tracker.register(owner, key, dir.path(), SubFile::File0, file);
        assert_eq!(tracker.open_file_count(), 1);

        {
            let handle = FileTracker::acquire(&tracker, &ops, owner, SubFile::File0);
            assert!(handle.is_ok());
            handle.get().unwrap().write(0, b"x").unwrap();
        }

        tracker.close(owner, SubFile::File0);
        assert_eq!(tracker.open_file_count(), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn close_deferred_while_acquired() {
        let dir = tempfile::tempdir().unwrap();
        let ops = OsFileOps;
        let tracker = Arc::new(FileTracker::new(10));
        let owner = OwnerId::next();
        let key = EntryFileKey::new(8);

        let file = make_file(&ops, dir.path(), &key, SubFile::File0);
        tracker.register(owner, key, dir.path(), SubFile::File0, file);

        let handle = FileTracker::acquire(&tracker, &ops, owner, SubFile::File0);
        tracker.close(owner, SubFile::File0);
        // The close is pending until the handle goes away.
        assert!(!tracker.is_empty());
        assert!(handle.is_ok());
        drop(handle);
        assert!(tracker.is_empty());
    }

    #[test]
    fn descriptor_limit_closes_idle_files_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let ops = OsFileOps;
        let tracker = Arc::new(FileTracker::new(2));

        let mut owners = Vec::new();
        for hash in 0..5u64 {
            let owner = OwnerId::next();
            let key = EntryFileKey::new(hash);
            let file = make_file(&ops, dir.path(), &key, SubFile::File0);
            tracker.register(owner, key, dir.path(), SubFile::File0, file);
            owners.push(owner);
        }
        assert_eq!(tracker.open_file_count(), 2);

        // The oldest registrations lost their descriptors; acquiring one
        // reopens it transparently.
        let handle = FileTracker::acquire(&tracker, &ops, owners[0], SubFile::File0);
        assert!(handle.is_ok());
        drop(handle);
        assert_eq!(tracker.open_file_count(), 2);

        // Each record still exists and still closes out cleanly.
        for owner in &owners {
            tracker.close(*owner, SubFile::File0);
        }
        assert!(tracker.is_empty());
        assert_eq!(tracker.open_file_count(), 0);
    }

    #[test]
    fn doom_generation_is_monotone_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let ops = OsFileOps;
        let tracker = Arc::new(FileTracker::new(10));

        let owner_a = OwnerId::next();
        let mut key_a = EntryFileKey::new(99);
        let file = make_file(&ops, dir.path(), &key_a, SubFile::File0);
        tracker.register(owner_a, key_a, dir.path(), SubFile::File0, file);
        tracker.doom(owner_a, &mut key_a);
        assert_eq!(key_a.doom_generation, 1);

        // A colliding entry doomed later gets a strictly larger generation.
        let owner_b = OwnerId::next();
        let mut key_b = EntryFileKey::new(99);
        let file = ops.create(&dir.path().join("collision")).unwrap();
        tracker.register(owner_b, key_b, dir.path(), SubFile::File0, file);
        tracker.doom(owner_b, &mut key_b);
        assert_eq!(key_b.doom_generation, 2);

        tracker.close(owner_a, SubFile::File0);
        tracker.close(owner_b, SubFile::File0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn reopen_uses_current_doom_generation() {
        let dir = tempfile::tempdir().unwrap();
        let ops = OsFileOps;
        let tracker = Arc::new(FileTracker::new(1));

        let owner = OwnerId::next();
        let mut key = EntryFileKey::new(0xabcd);
        let file = make_file(&ops, dir.path(), &key, SubFile::File0);
        tracker.register(owner, key, dir.path(), SubFile::File0, file);

        tracker.doom(owner, &mut key);
        let old = dir.path().join(util::entry_filename(&EntryFileKey::new(0xabcd), 0));
        let renamed = dir.path().join(util::entry_filename(&key, 0));
        ops.rename(&old, &renamed).unwrap();

        // Push the doomed entry's file out of the budget, then reacquire:
        // the reopen must target the renamed file.
        let other = OwnerId::next();
        let other_key = EntryFileKey::new(1);
        let file = make_file(&ops, dir.path(), &other_key, SubFile::File0);
        tracker.register(other, other_key, dir.path(), SubFile::File0, file);
        assert_eq!(tracker.open_file_count(), 1);

        let handle = FileTracker::acquire(&tracker, &ops, owner, SubFile::File0);
        assert!(handle.is_ok());
        drop(handle);

        tracker.close(owner, SubFile::File0);
        tracker.close(other, SubFile::File0);
        assert!(tracker.is_empty());
    }
}
