//! Index Sampling
//!
//! `OnlineIndexSamplingJob` refreshes the statistics row of one ONLINE
//! index. `IndexSamplingController` walks the registry and schedules a job
//! per ONLINE index.
//!
//! The state is checked once, before sampling. If the index leaves ONLINE
//! while the sample is being taken the row is still replaced; the planner
//! tolerates a briefly stale row. A sample that cannot be taken leaves the
//! existing row and the index untouched.

use crate::error::Result;
use crate::proxy::IndexProxy;
use crate::registry::IndexRegistry;
use crate::sample::IndexSample;
use crate::scheduler::JobScheduler;
use crate::stats::IndexStatisticsStore;
use crate::types::{IndexId, InternalIndexState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What one sampling run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingOutcome {
    /// Statistics row replaced with this sample
    Sampled(IndexSample),
    /// Index was not ONLINE; nothing written
    Skipped(InternalIndexState),
}

pub struct OnlineIndexSamplingJob {
    index_id: IndexId,
    proxy: Arc<dyn IndexProxy>,
    store: Arc<dyn IndexStatisticsStore>,
    index_user_description: String,
}

impl OnlineIndexSamplingJob {
    pub fn new(
        index_id: IndexId,
        proxy: Arc<dyn IndexProxy>,
        store: Arc<dyn IndexStatisticsStore>,
        index_user_description: impl Into<String>,
    ) -> Self {
        Self { index_id, proxy, store, index_user_description: index_user_description.into() }
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn run(&self) -> Result<SamplingOutcome> {
        let state = self.proxy.state();
        if state != InternalIndexState::Online {
            debug!(index = %self.index_user_description, %state, "skipping sampling of index that is not online");
            return Ok(SamplingOutcome::Skipped(state));
        }

        let start = Instant::now();
        let reader = self.proxy.new_reader()?;
        let sample = reader.create_sampler().sample_index()?;
        self.store.replace_index_counts(self.index_id, sample)?;

        debug!(
            index = %self.index_user_description,
            index_size = sample.index_size,
            unique_values = sample.unique_values,
            sample_size = sample.sample_size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sampled index"
        );
        Ok(SamplingOutcome::Sampled(sample))
    }
}

pub struct IndexSamplingController {
    registry: Arc<IndexRegistry>,
    store: Arc<dyn IndexStatisticsStore>,
    scheduler: Arc<dyn JobScheduler>,
}

impl IndexSamplingController {
    pub fn new(
        registry: Arc<IndexRegistry>,
        store: Arc<dyn IndexStatisticsStore>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        Self { registry, store, scheduler }
    }

    /// Schedule a sampling job for every ONLINE index. `cancel` is checked
    /// between indexes. Returns the number of jobs scheduled.
    pub fn sample_indexes(&self, cancel: &AtomicBool) -> usize {
        let proxies = self.registry.online_proxies().into_iter().map(|p| p as Arc<dyn IndexProxy>);
        self.sample_proxies(proxies, cancel)
    }

    /// Schedule a sampling job per proxy. A job that fails is logged and does
    /// not affect the others.
    pub fn sample_proxies<I>(&self, proxies: I, cancel: &AtomicBool) -> usize
    where
        I: IntoIterator<Item = Arc<dyn IndexProxy>>,
    {
        let mut scheduled = 0;
        for proxy in proxies {
            if cancel.load(Ordering::Acquire) {
                info!(scheduled, "index sampling cycle cancelled");
                break;
            }
            let job = self.job_for(proxy);
            self.scheduler.schedule(Box::new(move || {
                if let Err(e) = job.run() {
                    warn!(index = %job.index_user_description, error = %e, "index sampling failed, statistics unchanged");
                }
            }));
            scheduled += 1;
        }
        scheduled
    }

    /// Sample one index on the calling thread.
    pub fn sample_index(&self, index_id: IndexId) -> Result<SamplingOutcome> {
        let proxy = self.registry.get(index_id)?;
        self.job_for(proxy).run()
    }

    fn job_for(&self, proxy: Arc<dyn IndexProxy>) -> OnlineIndexSamplingJob {
        let description = proxy.descriptor().user_description();
        let id = proxy.descriptor().id;
        OnlineIndexSamplingJob::new(id, proxy, Arc::clone(&self.store), description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexError;
    use crate::reader::IndexReader;
    use crate::sample::IndexSampler;
    use crate::scheduler::ImmediateScheduler;
    use crate::stats::FileStatisticsStore;
    use crate::types::{EntityId, IndexDescriptor, SchemaDescriptor, ValueTuple};
    use parking_lot::Mutex;
    use std::io;

    #[derive(Clone, Copy)]
    enum ReaderBehaviour {
        FailOpen,
        FailSample,
        Sample(IndexSample),
    }

    struct FixedProxy {
        descriptor: IndexDescriptor,
        state: InternalIndexState,
        reader: ReaderBehaviour,
    }

    impl FixedProxy {
        fn new(id: u64, state: InternalIndexState, reader: ReaderBehaviour) -> Arc<dyn IndexProxy> {
            let descriptor = IndexDescriptor::new(IndexId(id), &format!("idx{id}"), SchemaDescriptor::for_label(1, &[1]));
            Arc::new(Self { descriptor, state, reader })
        }
    }

    impl IndexProxy for FixedProxy {
        fn descriptor(&self) -> &IndexDescriptor {
            &self.descriptor
        }
        fn state(&self) -> InternalIndexState {
            self.state
        }
        fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
            match self.reader {
                ReaderBehaviour::FailOpen => Err(IndexError::Io(io::Error::new(io::ErrorKind::Other, "tree unreadable"))),
                ReaderBehaviour::FailSample => Ok(Box::new(FixedReader { sample: None })),
                ReaderBehaviour::Sample(sample) => Ok(Box::new(FixedReader { sample: Some(sample) })),
            }
        }
        fn failure(&self) -> Option<String> {
            None
        }
    }

    struct FixedReader {
        sample: Option<IndexSample>,
    }

    impl IndexReader for FixedReader {
        fn lookup(&self, _: &ValueTuple) -> Vec<EntityId> {
            Vec::new()
        }
        fn entry_count(&self) -> u64 {
            self.sample.map_or(0, |s| s.index_size)
        }
        fn create_sampler(&self) -> Box<dyn IndexSampler> {
            Box::new(FixedSampler { sample: self.sample })
        }
    }

    struct FixedSampler {
        sample: Option<IndexSample>,
    }

    impl IndexSampler for FixedSampler {
        fn sample_index(&mut self) -> Result<IndexSample> {
            self.sample.ok_or_else(|| IndexError::Io(io::Error::new(io::ErrorKind::Other, "sampler lost its cursor")))
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(IndexId, IndexSample)>>,
    }

    impl IndexStatisticsStore for RecordingStore {
        fn replace_index_counts(&self, index_id: IndexId, sample: IndexSample) -> Result<()> {
            self.writes.lock().push((index_id, sample));
            Ok(())
        }
        fn index_sample(&self, _: IndexId) -> Option<IndexSample> {
            None
        }
        fn remove_index(&self, _: IndexId) {}
    }

    fn controller(store: Arc<dyn IndexStatisticsStore>) -> IndexSamplingController {
        let registry = Arc::new(IndexRegistry::new(Arc::clone(&store)));
        IndexSamplingController::new(registry, store, Arc::new(ImmediateScheduler))
    }

    #[test]
    fn test_non_online_index_is_skipped_without_writes() {
        let store = Arc::new(RecordingStore::default());
        for state in [InternalIndexState::Populating, InternalIndexState::Failed] {
            let proxy = FixedProxy::new(1, state, ReaderBehaviour::FailOpen);
            let job = OnlineIndexSamplingJob::new(IndexId(1), proxy, store.clone(), "idx");
            assert_eq!(job.run().unwrap(), SamplingOutcome::Skipped(state));
        }
        assert!(store.writes.lock().is_empty());
    }

    #[test]
    fn test_failed_sample_leaves_row_and_state_unchanged() {
        let store = Arc::new(FileStatisticsStore::in_memory());
        let previous = IndexSample::new(40, 4, 40);
        store.replace_index_counts(IndexId(1), previous).unwrap();

        for behaviour in [ReaderBehaviour::FailOpen, ReaderBehaviour::FailSample] {
            let proxy = FixedProxy::new(1, InternalIndexState::Online, behaviour);
            let job = OnlineIndexSamplingJob::new(IndexId(1), proxy.clone(), store.clone(), "idx1");
            assert!(matches!(job.run(), Err(IndexError::Io(_))));
            assert_eq!(store.index_sample(IndexId(1)), Some(previous));
            assert_eq!(proxy.state(), InternalIndexState::Online);
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_controller_keeps_going_after_a_failed_job() {
        let store = Arc::new(FileStatisticsStore::in_memory());
        let previous = IndexSample::new(40, 4, 40);
        store.replace_index_counts(IndexId(1), previous).unwrap();
        let controller = controller(store.clone());

        let fresh = IndexSample::new(10, 5, 10);
        let proxies: Vec<Arc<dyn IndexProxy>> = vec![
            FixedProxy::new(1, InternalIndexState::Online, ReaderBehaviour::FailSample),
            FixedProxy::new(2, InternalIndexState::Online, ReaderBehaviour::FailOpen),
            FixedProxy::new(3, InternalIndexState::Online, ReaderBehaviour::Sample(fresh)),
        ];
        assert_eq!(controller.sample_proxies(proxies, &AtomicBool::new(false)), 3);

        assert_eq!(store.index_sample(IndexId(1)), Some(previous));
        assert_eq!(store.index_sample(IndexId(2)), None);
        assert_eq!(store.index_sample(IndexId(3)), Some(fresh));
    }

    #[test]
    fn test_cancelled_cycle_schedules_nothing() {
        let store = Arc::new(RecordingStore::default());
        let controller = controller(store.clone());
        let proxies: Vec<Arc<dyn IndexProxy>> =
            vec![FixedProxy::new(1, InternalIndexState::Online, ReaderBehaviour::Sample(IndexSample::new(1, 1, 1)))];
        assert_eq!(controller.sample_proxies(proxies, &AtomicBool::new(true)), 0);
        assert!(store.writes.lock().is_empty());
    }
}
