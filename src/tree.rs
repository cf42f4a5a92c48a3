//! Index Tree: ordered (values, entity) key set persisted to a single file.
//!
//! # Layout
//! ```text
//! [0..64)   TreeHeader { magic, version, state, section lengths, entry_count, body_crc }
//! [64..)    descriptor (bincode) | entries (bincode, ascending) | failure text (utf-8)
//! ```
//! `body_crc` covers every byte after the header.
//!
//! # Durability
//! Mutations live in memory until `checkpoint()`, which writes a sibling
//! temp file, fsyncs it and renames it over the tree. A crash therefore
//! leaves the previous checkpoint intact. A tree whose persisted state is
//! still POPULATING never finished building and must be recreated.
//!
//! # Thread Safety
//! Entries sit behind a `parking_lot::RwLock`; readers and the single
//! writer (populator or online maintenance) share one `Arc<IndexTree>`.
//! Whole-tree walks (sampling, constraint checks, checkpoints) go through
//! `for_each_chunk`, which holds the read lock for one chunk at a time so
//! writers interleave with them. A checkpoint taken while writers are active
//! may miss their latest changes; the tree then stays dirty and the next
//! checkpoint picks them up.

use crate::error::{IndexError, Result};
use crate::types::{EntityId, IndexDescriptor, InternalIndexState, ValueTuple};
use bytemuck::{Pod, Zeroable};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const TREE_MAGIC: u64 = 0x534B_4E49_4458_5452; // "SKNIDXTR"
const TREE_VERSION: u32 = 1;
const HEADER_SIZE: usize = 64;

/// Keys copied out per read-lock window by `for_each_chunk`.
pub const SCAN_CHUNK_SIZE: usize = 4096;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct TreeHeader {
    magic: u64,
    version: u32,
    state: u32,
    descriptor_len: u64,
    entries_len: u64,
    failure_len: u64,
    entry_count: u64,
    body_crc: u32,
    _pad: u32,
    _reserved: u64,
}

/// One tree key. Ordered by values first so equal values are adjacent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey {
    pub values: ValueTuple,
    pub entity_id: EntityId,
}

impl IndexKey {
    pub fn new(values: ValueTuple, entity_id: EntityId) -> Self {
        Self { values, entity_id }
    }
}

/// Persisted state of a tree, readable without loading its entries.
#[derive(Clone, Debug)]
pub struct TreeStatus {
    pub descriptor: IndexDescriptor,
    pub state: InternalIndexState,
    pub entry_count: u64,
    pub failure: Option<String>,
}

#[derive(Debug)]
struct TreeMeta {
    state: InternalIndexState,
    failure: Option<String>,
}

pub struct IndexTree {
    path: PathBuf,
    descriptor: IndexDescriptor,
    entries: RwLock<BTreeSet<IndexKey>>,
    meta: Mutex<TreeMeta>,
    /// Bumped by every mutation.
    generation: AtomicU64,
    /// Generation covered by the last checkpoint.
    persisted: AtomicU64,
    checkpoint_lock: Mutex<()>,
}

impl IndexTree {
    /// Create a brand-new, empty tree at `path`, replacing whatever was there.
    pub fn create(path: &Path, descriptor: IndexDescriptor) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            fs::remove_file(path)?;
        }
        let tree = Self {
            path: path.to_path_buf(),
            descriptor,
            entries: RwLock::new(BTreeSet::new()),
            meta: Mutex::new(TreeMeta { state: InternalIndexState::Populating, failure: None }),
            generation: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            checkpoint_lock: Mutex::new(()),
        };
        tree.checkpoint()?;
        Ok(tree)
    }

    /// Open an existing tree and load its entries.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = map_checked(path, &file)?;
        let (header, body) = parse(path, &mmap)?;

        let (descriptor_bytes, rest) = body.split_at(header.descriptor_len as usize);
        let (entries_bytes, failure_bytes) = rest.split_at(header.entries_len as usize);

        let descriptor: IndexDescriptor = bincode::deserialize(descriptor_bytes)?;
        let entries: BTreeSet<IndexKey> = bincode::deserialize(entries_bytes)?;
        if entries.len() as u64 != header.entry_count {
            return Err(corrupted(path, format!(
                "header announces {} entries, body holds {}", header.entry_count, entries.len()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            descriptor,
            entries: RwLock::new(entries),
            meta: Mutex::new(TreeMeta {
                state: decode_state(path, header.state)?,
                failure: decode_failure(path, failure_bytes)?,
            }),
            generation: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            checkpoint_lock: Mutex::new(()),
        })
    }

    /// Read the persisted state, descriptor and failure text of a tree.
    pub fn read_status(path: &Path) -> Result<TreeStatus> {
        let file = File::open(path)?;
        let mmap = map_checked(path, &file)?;
        let (header, body) = parse(path, &mmap)?;

        let descriptor_end = header.descriptor_len as usize;
        let failure_start = descriptor_end + header.entries_len as usize;
        Ok(TreeStatus {
            descriptor: bincode::deserialize(&body[..descriptor_end])?,
            state: decode_state(path, header.state)?,
            entry_count: header.entry_count,
            failure: decode_failure(path, &body[failure_start..])?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> InternalIndexState {
        self.meta.lock().state
    }

    pub fn set_state(&self, state: InternalIndexState) {
        self.meta.lock().state = state;
        self.touch();
    }

    pub fn failure(&self) -> Option<String> {
        self.meta.lock().failure.clone()
    }

    /// Record failure text and move the tree to FAILED.
    pub fn set_failure(&self, failure: String) {
        let mut meta = self.meta.lock();
        meta.state = InternalIndexState::Failed;
        meta.failure = Some(failure);
        self.touch();
    }

    /// Returns false if the key was already present.
    pub fn insert(&self, key: IndexKey) -> bool {
        let inserted = self.entries.write().insert(key);
        if inserted {
            self.touch();
        }
        inserted
    }

    /// Returns false if the key was absent.
    pub fn remove(&self, key: &IndexKey) -> bool {
        let removed = self.entries.write().remove(key);
        if removed {
            self.touch();
        }
        removed
    }

    pub fn contains(&self, key: &IndexKey) -> bool {
        self.entries.read().contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// True if anything changed since the last checkpoint started.
    pub fn is_dirty(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.persisted.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Entities whose values equal `values`, in ascending entity order.
    pub fn lookup(&self, values: &ValueTuple) -> Vec<EntityId> {
        let lo = IndexKey::new(values.clone(), EntityId::MIN);
        let hi = IndexKey::new(values.clone(), EntityId::MAX);
        self.entries.read()
            .range((Bound::Included(lo), Bound::Included(hi)))
            .map(|k| k.entity_id)
            .collect()
    }

    /// Up to `limit` keys strictly after `after` (from the start if `None`).
    pub fn scan_chunk(&self, after: Option<&IndexKey>, limit: usize) -> Vec<IndexKey> {
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.entries.read()
            .range::<IndexKey, _>((lower, Bound::Unbounded))
            .take(limit.max(1))
            .cloned()
            .collect()
    }

    /// Walk all keys in ascending order, `chunk_size` at a time. The read
    /// lock is released between chunks.
    pub fn for_each_chunk<E>(
        &self,
        chunk_size: usize,
        mut f: impl FnMut(&[IndexKey]) -> std::result::Result<(), E>,
    ) -> std::result::Result<(), E> {
        let chunk_size = chunk_size.max(1);
        let mut last: Option<IndexKey> = None;
        loop {
            let chunk = self.scan_chunk(last.as_ref(), chunk_size);
            if chunk.is_empty() {
                return Ok(());
            }
            f(&chunk)?;
            if chunk.len() < chunk_size {
                return Ok(());
            }
            last = chunk.into_iter().next_back();
        }
    }

    /// Write the current entries and metadata durably.
    pub fn checkpoint(&self) -> Result<()> {
        let _serial = self.checkpoint_lock.lock();
        let generation = self.generation.load(Ordering::Acquire);
        let (state, failure) = {
            let meta = self.meta.lock();
            (meta.state, meta.failure.clone())
        };

        let descriptor_bytes = bincode::serialize(&self.descriptor)?;
        // Same bytes bincode writes for a set: u64 length, then each key.
        let mut entries_bytes = vec![0u8; 8];
        let mut entry_count = 0u64;
        self.for_each_chunk(SCAN_CHUNK_SIZE, |chunk| -> Result<()> {
            for key in chunk {
                bincode::serialize_into(&mut entries_bytes, key)?;
            }
            entry_count += chunk.len() as u64;
            Ok(())
        })?;
        entries_bytes[..8].copy_from_slice(&entry_count.to_le_bytes());
        let failure_bytes = failure.unwrap_or_default().into_bytes();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&descriptor_bytes);
        hasher.update(&entries_bytes);
        hasher.update(&failure_bytes);

        let header = TreeHeader {
            magic: TREE_MAGIC,
            version: TREE_VERSION,
            state: state.as_u32(),
            descriptor_len: descriptor_bytes.len() as u64,
            entries_len: entries_bytes.len() as u64,
            failure_len: failure_bytes.len() as u64,
            entry_count,
            body_crc: hasher.finalize(),
            _pad: 0,
            _reserved: 0,
        };

        let tmp = self.path.with_extension("sktree.tmp");
        {
            let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
            file.write_all(bytemuck::bytes_of(&header))?;
            file.write_all(&descriptor_bytes)?;
            file.write_all(&entries_bytes)?;
            file.write_all(&failure_bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.persisted.store(generation, Ordering::Release);
        Ok(())
    }
}

fn corrupted(path: &Path, reason: String) -> IndexError {
    IndexError::Corrupted { path: path.to_path_buf(), reason }
}

fn map_checked(path: &Path, file: &File) -> Result<Mmap> {
    if file.metadata()?.len() < HEADER_SIZE as u64 {
        return Err(corrupted(path, "file shorter than header".to_string()));
    }
    // Read-only mapping; the file is only ever replaced by rename, never written in place.
    Ok(unsafe { Mmap::map(file)? })
}

fn parse<'a>(path: &Path, bytes: &'a [u8]) -> Result<(TreeHeader, &'a [u8])> {
    let header: TreeHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
    if header.magic != TREE_MAGIC {
        return Err(corrupted(path, format!("bad magic {:#x}", header.magic)));
    }
    if header.version != TREE_VERSION {
        return Err(corrupted(path, format!("unsupported version {}", header.version)));
    }
    let body = &bytes[HEADER_SIZE..];
    let expected = header.descriptor_len
        .checked_add(header.entries_len)
        .and_then(|n| n.checked_add(header.failure_len));
    if expected != Some(body.len() as u64) {
        return Err(corrupted(path, format!(
            "section lengths do not match body of {} bytes", body.len()
        )));
    }
    if crc32fast::hash(body) != header.body_crc {
        return Err(corrupted(path, "body checksum mismatch".to_string()));
    }
    Ok((header, body))
}

fn decode_state(path: &Path, raw: u32) -> Result<InternalIndexState> {
    InternalIndexState::from_u32(raw).ok_or_else(|| corrupted(path, format!("unknown state {}", raw)))
}

fn decode_failure(path: &Path, bytes: &[u8]) -> Result<Option<String>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|e| corrupted(path, format!("failure text is not utf-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IndexId, SchemaDescriptor, Value};
    use tempfile::tempdir;

    fn descriptor() -> IndexDescriptor {
        IndexDescriptor::new(IndexId(7), "person_age", SchemaDescriptor::for_label(1, &[2]))
    }

    fn key(v: i64, id: EntityId) -> IndexKey {
        IndexKey::new(Value::Int(v).into(), id)
    }

    #[test]
    fn test_header_is_64_bytes() {
        assert_eq!(std::mem::size_of::<TreeHeader>(), HEADER_SIZE);
    }

    #[test]
    fn test_create_is_populating_and_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sktree");
        let tree = IndexTree::create(&path, descriptor()).unwrap();
        assert_eq!(tree.state(), InternalIndexState::Populating);
        assert!(tree.is_empty());

        let status = IndexTree::read_status(&path).unwrap();
        assert_eq!(status.state, InternalIndexState::Populating);
        assert_eq!(status.entry_count, 0);
        assert!(status.failure.is_none());
    }

    #[test]
    fn test_checkpoint_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sktree");
        {
            let tree = IndexTree::create(&path, descriptor()).unwrap();
            assert!(tree.insert(key(10, 1)));
            assert!(tree.insert(key(10, 2)));
            assert!(tree.insert(key(20, 3)));
            assert!(!tree.insert(key(20, 3)));
            tree.set_state(InternalIndexState::Online);
            tree.checkpoint().unwrap();
        }

        let tree = IndexTree::open(&path).unwrap();
        assert_eq!(tree.state(), InternalIndexState::Online);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.lookup(&Value::Int(10).into()), vec![1, 2]);
        assert_eq!(tree.descriptor(), &descriptor());
    }

    #[test]
    fn test_uncheckpointed_changes_are_not_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sktree");
        {
            let tree = IndexTree::create(&path, descriptor()).unwrap();
            tree.insert(key(1, 1));
            assert!(tree.is_dirty());
        }
        let tree = IndexTree::open(&path).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.state(), InternalIndexState::Populating);
    }

    #[test]
    fn test_checkpoint_clears_dirty_until_next_change() {
        let dir = tempdir().unwrap();
        let tree = IndexTree::create(&dir.path().join("t.sktree"), descriptor()).unwrap();
        assert!(!tree.is_dirty());
        tree.insert(key(1, 1));
        tree.checkpoint().unwrap();
        assert!(!tree.is_dirty());
        assert!(!tree.remove(&key(2, 2)));
        assert!(!tree.is_dirty());
        tree.remove(&key(1, 1));
        assert!(tree.is_dirty());
    }

    #[test]
    fn test_chunked_scan_visits_every_key_in_order() {
        let dir = tempdir().unwrap();
        let tree = IndexTree::create(&dir.path().join("t.sktree"), descriptor()).unwrap();
        for id in 0..1000u64 {
            tree.insert(key((id % 13) as i64, id));
        }

        let mut seen = Vec::new();
        tree.for_each_chunk(64, |chunk| -> Result<()> {
            assert!(chunk.len() <= 64);
            seen.extend_from_slice(chunk);
            Ok(())
        }).unwrap();

        assert_eq!(seen.len(), 1000);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(tree.scan_chunk(seen.last(), 10), Vec::<IndexKey>::new());
    }

    #[test]
    fn test_writes_proceed_between_scan_chunks() {
        let dir = tempdir().unwrap();
        let tree = IndexTree::create(&dir.path().join("t.sktree"), descriptor()).unwrap();
        for id in 0..100u64 {
            tree.insert(key(id as i64, id));
        }

        // a writer on the same thread would deadlock if the scan kept the lock
        let mut next = 1_000u64;
        tree.for_each_chunk(10, |_| -> Result<()> {
            assert!(tree.insert(key(-1, next)));
            next += 1;
            Ok(())
        }).unwrap();
        assert_eq!(tree.len(), 110);
    }

    #[test]
    fn test_checkpoint_spanning_many_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sktree");
        let total = SCAN_CHUNK_SIZE as u64 * 2 + 17;
        {
            let tree = IndexTree::create(&path, descriptor()).unwrap();
            for id in 0..total {
                tree.insert(key((id % 5) as i64, id));
            }
            tree.set_state(InternalIndexState::Online);
            tree.checkpoint().unwrap();
        }
        let tree = IndexTree::open(&path).unwrap();
        assert_eq!(tree.len() as u64, total);
        assert_eq!(IndexTree::read_status(&path).unwrap().entry_count, total);
        assert_eq!(tree.lookup(&Value::Int(3).into()).len() as u64, total / 5 + u64::from(total % 5 > 3));
    }

    #[test]
    fn test_checkpoint_under_concurrent_writes_stays_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sktree");
        let tree = std::sync::Arc::new(IndexTree::create(&path, descriptor()).unwrap());
        for id in 0..20_000u64 {
            tree.insert(key(0, id));
        }

        let writer = {
            let tree = std::sync::Arc::clone(&tree);
            std::thread::spawn(move || {
                for id in 20_000..30_000u64 {
                    tree.insert(key(1, id));
                }
            })
        };
        tree.checkpoint().unwrap();
        writer.join().unwrap();

        let reopened = IndexTree::open(&path).unwrap();
        assert!(reopened.len() >= 20_000);
        tree.checkpoint().unwrap();
        assert!(!tree.is_dirty());
        assert_eq!(IndexTree::open(&path).unwrap().len(), 30_000);
    }

    #[test]
    fn test_failure_text_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sktree");
        {
            let tree = IndexTree::create(&path, descriptor()).unwrap();
            tree.set_failure("scan aborted: disk full".to_string());
            tree.checkpoint().unwrap();
        }
        let status = IndexTree::read_status(&path).unwrap();
        assert_eq!(status.state, InternalIndexState::Failed);
        assert_eq!(status.failure.as_deref(), Some("scan aborted: disk full"));
    }

    #[test]
    fn test_corruption_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sktree");
        {
            let tree = IndexTree::create(&path, descriptor()).unwrap();
            tree.insert(key(1, 1));
            tree.checkpoint().unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(IndexTree::open(&path), Err(IndexError::Corrupted { .. })));
    }

    #[test]
    fn test_create_replaces_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sktree");
        {
            let tree = IndexTree::create(&path, descriptor()).unwrap();
            tree.insert(key(1, 1));
            tree.set_failure("old".to_string());
            tree.checkpoint().unwrap();
        }
        let tree = IndexTree::create(&path, descriptor()).unwrap();
        assert!(tree.is_empty());
        assert!(tree.failure().is_none());
        assert_eq!(IndexTree::read_status(&path).unwrap().state, InternalIndexState::Populating);
    }
}
