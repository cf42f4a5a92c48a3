//! Native Index Populator
//!
//! Builds the tree for one index from an initial scan while absorbing live
//! updates that arrive during that scan, then decides the outcome.
//!
//! Lifecycle:
//! - `create()` allocates a fresh tree (state POPULATING on disk)
//! - `add()` / `include_update()` may be interleaved freely
//! - `verify_deferred_constraints()` for unique indexes, then
//!   `verify_constraints_for()` over updates absorbed after that check
//! - `close(true)` persists ONLINE and records statistics
//! - `mark_as_failed()` + `close(false)` persist FAILED with its cause

use crate::error::{IndexError, Result};
use crate::failure::IndexPopulationFailure;
use crate::reader::FullScanSampler;
use crate::sample::{IndexSample, IndexSampler};
use crate::stats::IndexStatisticsStore;
use crate::tree::{IndexKey, IndexTree, SCAN_CHUNK_SIZE};
use crate::types::{EntityId, IndexDescriptor, InternalIndexState, ValueTuple};
use crate::update::{IndexEntryUpdate, UpdateMode};
use ahash::AHashSet;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct NativeIndexPopulator {
    path: PathBuf,
    descriptor: IndexDescriptor,
    stats: Arc<dyn IndexStatisticsStore>,
    tree: RwLock<Option<Arc<IndexTree>>>,
    closed: AtomicBool,
    /// Sample taken by a successful `close`.
    completed_sample: Mutex<Option<IndexSample>>,
}

impl NativeIndexPopulator {
    pub fn new(path: &Path, descriptor: IndexDescriptor, stats: Arc<dyn IndexStatisticsStore>) -> Self {
        Self {
            path: path.to_path_buf(),
            descriptor,
            stats,
            tree: RwLock::new(None),
            closed: AtomicBool::new(false),
            completed_sample: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate a brand-new tree, discarding any earlier partial state.
    pub fn create(&self) -> Result<()> {
        let tree = IndexTree::create(&self.path, self.descriptor.clone())?;
        *self.tree.write() = Some(Arc::new(tree));
        self.closed.store(false, Ordering::Release);
        *self.completed_sample.lock() = None;
        info!(index = %self.descriptor.id, path = %self.path.display(), "created index tree for population");
        Ok(())
    }

    /// Insert a batch of scanned entries. Every entry must be an ADDED update
    /// for this index's schema; the batch is validated before anything is
    /// inserted.
    pub fn add(&self, batch: &[IndexEntryUpdate]) -> Result<()> {
        let tree = self.open_tree()?;
        for update in batch {
            validate_update(&self.descriptor, update)?;
            if update.mode() != UpdateMode::Added {
                return Err(IndexError::MalformedUpdate(format!(
                    "scan batches may only carry ADDED updates, got {}", update
                )));
            }
        }
        for update in batch {
            tree.insert(IndexKey::new(update.values().clone(), update.entity_id()));
        }
        debug!(index = %self.descriptor.id, entries = batch.len(), "added scan batch");
        Ok(())
    }

    /// Apply one live update immediately.
    pub fn include_update(&self, update: &IndexEntryUpdate) -> Result<()> {
        let tree = self.open_tree()?;
        validate_update(&self.descriptor, update)?;
        apply_update(&tree, update)
    }

    /// Apply live updates in the order given. Returns how many were applied.
    pub fn include_updates<I>(&self, updates: I) -> Result<usize>
    where
        I: IntoIterator<Item = IndexEntryUpdate>,
    {
        let mut applied = 0;
        for update in updates {
            self.include_update(&update)?;
            applied += 1;
        }
        if applied > 0 {
            debug!(index = %self.descriptor.id, updates = applied, "absorbed live updates");
        }
        Ok(applied)
    }

    /// Reject the build if two entities share a value in a unique index.
    pub fn verify_deferred_constraints(&self) -> Result<()> {
        if !self.descriptor.unique {
            return Ok(());
        }
        let tree = self.open_tree()?;
        let mut previous: Option<IndexKey> = None;
        tree.for_each_chunk(SCAN_CHUNK_SIZE, |chunk| {
            for key in chunk {
                if let Some(prev) = &previous {
                    if prev.values == key.values {
                        return Err(self.violation(&key.values, prev.entity_id, key.entity_id));
                    }
                }
                previous = Some(key.clone());
            }
            Ok(())
        })
    }

    /// Uniqueness check limited to the values written by `updates`. Used for
    /// the updates absorbed after `verify_deferred_constraints` already
    /// passed over the rest of the tree.
    pub fn verify_constraints_for(&self, updates: &[IndexEntryUpdate]) -> Result<()> {
        if !self.descriptor.unique {
            return Ok(());
        }
        let tree = self.open_tree()?;
        let mut checked: AHashSet<&ValueTuple> = AHashSet::with_capacity(updates.len());
        for update in updates {
            if update.mode() == UpdateMode::Removed || !checked.insert(update.values()) {
                continue;
            }
            let entities = tree.lookup(update.values());
            if entities.len() > 1 {
                return Err(self.violation(update.values(), entities[0], entities[1]));
            }
        }
        Ok(())
    }

    fn violation(&self, values: &ValueTuple, existing: EntityId, added: EntityId) -> IndexError {
        IndexError::ConstraintViolation {
            index: self.descriptor.user_description(),
            values: values.to_string(),
            existing,
            added,
        }
    }

    /// Finish the population. On success the tree is published ONLINE and
    /// its sample replaces the statistics row. On failure the tree is kept
    /// on disk as FAILED for inspection.
    pub fn close(&self, population_completed_successfully: bool) -> Result<()> {
        let tree = self.open_tree()?;
        self.closed.store(true, Ordering::Release);

        if population_completed_successfully {
            if tree.state() == InternalIndexState::Failed {
                return Err(IndexError::UnsupportedOperation(format!(
                    "index {} was marked as failed and cannot be closed as successful",
                    self.descriptor.id
                )));
            }
            tree.set_state(InternalIndexState::Online);
            tree.checkpoint()?;
            let sample = FullScanSampler::new(Arc::clone(&tree)).sample_index()?;
            self.stats.replace_index_counts(self.descriptor.id, sample)?;
            *self.completed_sample.lock() = Some(sample);
            info!(
                index = %self.descriptor.id,
                index_size = sample.index_size,
                unique_values = sample.unique_values,
                "index population completed"
            );
        } else {
            if tree.state() != InternalIndexState::Failed {
                tree.set_state(InternalIndexState::Failed);
            }
            tree.checkpoint()?;
            warn!(index = %self.descriptor.id, path = %self.path.display(), "index population closed as failed, tree retained");
        }
        Ok(())
    }

    /// Persist the failure text into the tree so it survives a restart.
    pub fn mark_as_failed(&self, failure: &IndexPopulationFailure) -> Result<()> {
        let tree = self.tree.read().clone().ok_or_else(|| self.not_created())?;
        tree.set_failure(failure.as_string());
        tree.checkpoint()
    }

    /// Sample recorded by a successful `close`, or an exact sample of the
    /// tree as built so far.
    pub fn sample_result(&self) -> Result<IndexSample> {
        if let Some(sample) = *self.completed_sample.lock() {
            return Ok(sample);
        }
        let tree = self.tree.read().clone().ok_or_else(|| self.not_created())?;
        FullScanSampler::new(tree).sample_index()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn tree_handle(&self) -> Option<Arc<IndexTree>> {
        self.tree.read().clone()
    }

    fn open_tree(&self) -> Result<Arc<IndexTree>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::Closed(self.descriptor.user_description()));
        }
        self.tree.read().clone().ok_or_else(|| self.not_created())
    }

    fn not_created(&self) -> IndexError {
        IndexError::UnsupportedOperation(format!(
            "index {} has no tree, create() was not called", self.descriptor.id
        ))
    }
}

/// Check that an update targets `descriptor`'s schema with the right arity.
pub(crate) fn validate_update(descriptor: &IndexDescriptor, update: &IndexEntryUpdate) -> Result<()> {
    if update.schema() != &descriptor.schema {
        return Err(IndexError::MalformedUpdate(format!(
            "update for schema {} sent to index {} on {}",
            update.schema(), descriptor.id, descriptor.schema
        )));
    }
    if update.values().len() != descriptor.schema.property_count() {
        return Err(IndexError::MalformedUpdate(format!(
            "update {} does not match the arity of {}", update, descriptor.schema
        )));
    }
    Ok(())
}

/// ADDED inserts, REMOVED deletes, CHANGED deletes the before-key then
/// inserts the after-key.
pub(crate) fn apply_update(tree: &IndexTree, update: &IndexEntryUpdate) -> Result<()> {
    let entity = update.entity_id();
    match update.mode() {
        UpdateMode::Added => {
            tree.insert(IndexKey::new(update.values().clone(), entity));
        }
        UpdateMode::Removed => {
            tree.remove(&IndexKey::new(update.values().clone(), entity));
        }
        UpdateMode::Changed => {
            tree.remove(&IndexKey::new(update.before_values()?.clone(), entity));
            tree.insert(IndexKey::new(update.values().clone(), entity));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::FileStatisticsStore;
    use crate::types::{IndexId, SchemaDescriptor, Value};
    use tempfile::{tempdir, TempDir};

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::for_label(1, &[2])
    }

    fn setup(unique: bool) -> (NativeIndexPopulator, Arc<FileStatisticsStore>, TempDir) {
        let dir = tempdir().unwrap();
        let descriptor = if unique {
            IndexDescriptor::unique(IndexId(1), "uniq", schema())
        } else {
            IndexDescriptor::new(IndexId(1), "idx", schema())
        };
        let stats = Arc::new(FileStatisticsStore::in_memory());
        let populator = NativeIndexPopulator::new(&dir.path().join("t.sktree"), descriptor, stats.clone());
        populator.create().unwrap();
        (populator, stats, dir)
    }

    fn add(id: u64, v: i64) -> IndexEntryUpdate {
        IndexEntryUpdate::add(id, schema(), Value::Int(v)).unwrap()
    }

    #[test]
    fn test_add_then_close_records_sample() {
        let (populator, stats, _dir) = setup(false);
        let batch: Vec<_> = (0..1000).map(|i| add(i, i as i64)).collect();
        populator.add(&batch).unwrap();
        populator.close(true).unwrap();

        assert_eq!(stats.index_sample(IndexId(1)), Some(IndexSample::new(1000, 1000, 1000)));
        assert_eq!(IndexTree::read_status(populator.path()).unwrap().state, InternalIndexState::Online);
    }

    #[test]
    fn test_live_updates_are_applied_in_order() {
        let (populator, _stats, _dir) = setup(false);
        populator.add(&[add(1, 10), add(2, 20)]).unwrap();
        populator.include_update(&IndexEntryUpdate::change(1, schema(), Value::Int(10), Value::Int(11)).unwrap()).unwrap();
        populator.include_update(&IndexEntryUpdate::remove(2, schema(), Value::Int(20)).unwrap()).unwrap();
        populator.include_update(&add(3, 30)).unwrap();

        let tree = populator.tree_handle().unwrap();
        assert_eq!(tree.lookup(&Value::Int(10).into()), Vec::<u64>::new());
        assert_eq!(tree.lookup(&Value::Int(11).into()), vec![1]);
        assert_eq!(tree.lookup(&Value::Int(20).into()), Vec::<u64>::new());
        assert_eq!(tree.lookup(&Value::Int(30).into()), vec![3]);
    }

    #[test]
    fn test_duplicate_add_across_streams_is_not_duplicated() {
        let (populator, _stats, _dir) = setup(false);
        populator.add(&[add(1, 10)]).unwrap();
        populator.include_update(&add(1, 10)).unwrap();
        assert_eq!(populator.sample_result().unwrap().index_size, 1);
    }

    #[test]
    fn test_wrong_schema_fails_fast() {
        let (populator, _stats, _dir) = setup(false);
        let other = IndexEntryUpdate::add(1, SchemaDescriptor::for_label(9, &[2]), Value::Int(1)).unwrap();
        let err = populator.add(&[add(5, 5), other]).unwrap_err();
        assert!(matches!(err, IndexError::MalformedUpdate(_)));
        // nothing from the rejected batch was inserted
        assert_eq!(populator.sample_result().unwrap().index_size, 0);
    }

    #[test]
    fn test_scan_rejects_non_added_updates() {
        let (populator, _stats, _dir) = setup(false);
        let remove = IndexEntryUpdate::remove(1, schema(), Value::Int(1)).unwrap();
        assert!(matches!(populator.add(&[remove]), Err(IndexError::MalformedUpdate(_))));
    }

    #[test]
    fn test_unique_violation_names_both_entities() {
        let (populator, _stats, _dir) = setup(true);
        populator.add(&[add(11, 7), add(12, 8), add(13, 7)]).unwrap();
        match populator.verify_deferred_constraints().unwrap_err() {
            IndexError::ConstraintViolation { existing, added, values, .. } => {
                assert_eq!((existing, added), (11, 13));
                assert_eq!(values, "(7)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unique_without_duplicates_passes() {
        let (populator, _stats, _dir) = setup(true);
        populator.add(&[add(1, 1), add(2, 2)]).unwrap();
        populator.verify_deferred_constraints().unwrap();
    }

    #[test]
    fn test_unique_violation_across_scan_chunks() {
        let (populator, _stats, _dir) = setup(true);
        let batch: Vec<_> = (0..SCAN_CHUNK_SIZE as u64).map(|i| add(i, i as i64)).collect();
        populator.add(&batch).unwrap();
        // lands as the first key of the second chunk, right after its twin
        let last = SCAN_CHUNK_SIZE as u64 - 1;
        populator.add(&[add(last + 1, last as i64)]).unwrap();
        match populator.verify_deferred_constraints().unwrap_err() {
            IndexError::ConstraintViolation { existing, added, .. } => assert_eq!((existing, added), (last, last + 1)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unique_check_for_late_updates() {
        let (populator, _stats, _dir) = setup(true);
        populator.add(&[add(1, 1), add(2, 2)]).unwrap();
        populator.verify_deferred_constraints().unwrap();

        let late = vec![
            IndexEntryUpdate::remove(2, schema(), Value::Int(2)).unwrap(),
            add(3, 2),
            IndexEntryUpdate::change(4, schema(), Value::Int(9), Value::Int(5)).unwrap(),
        ];
        populator.include_updates(late.clone()).unwrap();
        populator.verify_constraints_for(&late).unwrap();

        let clash = vec![add(5, 1)];
        populator.include_updates(clash.clone()).unwrap();
        match populator.verify_constraints_for(&clash).unwrap_err() {
            IndexError::ConstraintViolation { existing, added, values, .. } => {
                assert_eq!((existing, added), (1, 5));
                assert_eq!(values, "(1)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_sample_result_reuses_close_sample() {
        let (populator, stats, _dir) = setup(false);
        populator.add(&[add(1, 1), add(2, 1)]).unwrap();
        populator.close(true).unwrap();
        // later online writes do not change the population result
        populator.tree_handle().unwrap().insert(IndexKey::new(Value::Int(3).into(), 3));
        assert_eq!(populator.sample_result().unwrap(), IndexSample::new(2, 1, 2));
        assert_eq!(stats.index_sample(IndexId(1)), Some(IndexSample::new(2, 1, 2)));
    }

    #[test]
    fn test_failed_close_retains_tree_and_cause() {
        let (populator, stats, _dir) = setup(false);
        populator.add(&[add(1, 1)]).unwrap();
        populator.mark_as_failed(&IndexPopulationFailure::from_description("scan crashed")).unwrap();
        populator.close(false).unwrap();

        assert!(populator.path().exists());
        let status = IndexTree::read_status(populator.path()).unwrap();
        assert_eq!(status.state, InternalIndexState::Failed);
        assert_eq!(status.failure.as_deref(), Some("scan crashed"));
        assert_eq!(stats.index_sample(IndexId(1)), None);
    }

    #[test]
    fn test_closed_populator_rejects_work() {
        let (populator, _stats, _dir) = setup(false);
        populator.close(true).unwrap();
        assert!(matches!(populator.add(&[add(1, 1)]), Err(IndexError::Closed(_))));
        assert!(matches!(populator.close(true), Err(IndexError::Closed(_))));
    }

    #[test]
    fn test_operations_before_create_fail() {
        let dir = tempdir().unwrap();
        let descriptor = IndexDescriptor::new(IndexId(3), "idx", schema());
        let populator = NativeIndexPopulator::new(
            &dir.path().join("t.sktree"), descriptor, Arc::new(FileStatisticsStore::in_memory()),
        );
        assert!(matches!(populator.add(&[add(1, 1)]), Err(IndexError::UnsupportedOperation(_))));
    }
}
