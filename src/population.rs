//! Index Population Job
//!
//! Drives one populator from start to a terminal state:
//! 1. create the tree
//! 2. for each scan batch: `add()`, then absorb queued live updates
//! 3. verify constraints over the built tree while writers still queue
//! 4. seal the queue, absorb and check the rest, publish ONLINE
//! 5. persist ONLINE and record the sample, with writers already going
//!    straight to the tree
//!
//! Any error along the way marks the index FAILED with its cause. A job never
//! ends with the index left POPULATING.
//!
//! # Example
//! ```ignore
//! let job = IndexPopulationJob::new(descriptor, dir, stats, &config);
//! registry.register(job.proxy());
//! let handle = job.spawn(scan_batches)?;
//! // transactions keep calling proxy.apply_update(..) meanwhile
//! let outcome = handle.join();
//! ```

use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::failure::IndexPopulationFailure;
use crate::populator::NativeIndexPopulator;
use crate::proxy::NativeIndexProxy;
use crate::queue::IndexUpdateQueue;
use crate::sample::IndexSample;
use crate::stats::IndexStatisticsStore;
use crate::types::IndexDescriptor;
use crate::update::IndexEntryUpdate;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{error, info};

/// Terminal result of a population job.
#[derive(Debug, Clone)]
pub enum PopulationOutcome {
    Online(IndexSample),
    Failed(IndexPopulationFailure),
    Cancelled,
}

impl PopulationOutcome {
    pub fn is_online(&self) -> bool {
        matches!(self, PopulationOutcome::Online(_))
    }
}

/// Groups a stream of scanned entries into batches of `batch_size`. The
/// first scan error is yielded on its own and ends the stream.
pub struct ScanBatches<I> {
    entries: I,
    batch_size: usize,
    done: bool,
}

impl<I> ScanBatches<I>
where
    I: Iterator<Item = Result<IndexEntryUpdate>>,
{
    pub fn new(entries: I, batch_size: usize) -> Self {
        Self { entries, batch_size: batch_size.max(1), done: false }
    }
}

impl<I> Iterator for ScanBatches<I>
where
    I: Iterator<Item = Result<IndexEntryUpdate>>,
{
    type Item = Result<Vec<IndexEntryUpdate>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.entries.next() {
                Some(Ok(update)) => batch.push(update),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

pub struct IndexPopulationJob {
    populator: NativeIndexPopulator,
    proxy: Arc<NativeIndexProxy>,
    queue: Arc<IndexUpdateQueue>,
    cancelled: Arc<AtomicBool>,
    batch_size: usize,
}

impl IndexPopulationJob {
    /// Job building `descriptor` into `index_dir`. The returned job's proxy
    /// starts in POPULATING and accepts live updates right away.
    pub fn new(
        descriptor: IndexDescriptor,
        index_dir: &Path,
        stats: Arc<dyn IndexStatisticsStore>,
        config: &IndexConfig,
    ) -> Self {
        let queue = Arc::new(IndexUpdateQueue::new(config.queue_capacity));
        let proxy = Arc::new(NativeIndexProxy::populating(descriptor.clone(), Arc::clone(&queue), config));
        let path = index_dir.join(descriptor.id.tree_file_name());
        let populator = NativeIndexPopulator::new(&path, descriptor, stats);
        Self {
            populator,
            proxy,
            queue,
            cancelled: Arc::new(AtomicBool::new(false)),
            batch_size: config.batch_size,
        }
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        self.populator.descriptor()
    }

    pub fn proxy(&self) -> Arc<NativeIndexProxy> {
        Arc::clone(&self.proxy)
    }

    /// Flag that stops the job at the next batch boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Run to completion on the current thread.
    pub fn run<I>(self, scan: I) -> PopulationOutcome
    where
        I: IntoIterator<Item = Result<Vec<IndexEntryUpdate>>>,
    {
        let start = Instant::now();
        let id = self.descriptor().id;
        info!(index = %id, "index population started");

        match self.populate(scan) {
            Ok(sample) => {
                info!(
                    index = %id,
                    entries = sample.index_size,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "index population finished"
                );
                PopulationOutcome::Online(sample)
            }
            Err(failure) => {
                self.record_failure(&failure);
                if is_cancellation(&failure) {
                    PopulationOutcome::Cancelled
                } else {
                    PopulationOutcome::Failed(failure)
                }
            }
        }
    }

    /// Run over an unbatched entity scan, grouped by the configured batch size.
    pub fn run_entries<I>(self, entries: I) -> PopulationOutcome
    where
        I: IntoIterator<Item = Result<IndexEntryUpdate>>,
    {
        let batches = ScanBatches::new(entries.into_iter(), self.batch_size);
        self.run(batches)
    }

    /// Run on a named background thread.
    pub fn spawn<I>(self, scan: I) -> io::Result<JoinHandle<PopulationOutcome>>
    where
        I: IntoIterator<Item = Result<Vec<IndexEntryUpdate>>> + Send + 'static,
    {
        thread::Builder::new()
            .name(format!("index-populator-{}", self.descriptor().id))
            .spawn(move || self.run(scan))
    }

    fn populate<I>(&self, scan: I) -> std::result::Result<IndexSample, IndexPopulationFailure>
    where
        I: IntoIterator<Item = Result<Vec<IndexEntryUpdate>>>,
    {
        self.populator.create()?;

        for batch in scan {
            let batch = batch?;
            self.check_cancelled()?;
            self.populator.add(&batch)?;
            self.populator.include_updates(self.queue.drain())?;
        }
        self.check_cancelled()?;
        self.populator.include_updates(self.queue.drain())?;
        self.populator.verify_deferred_constraints()?;

        let populator = &self.populator;
        self.proxy.complete_population(|remaining| {
            for update in &remaining {
                populator.include_update(update)?;
            }
            populator.verify_constraints_for(&remaining)?;
            populator.tree_handle().ok_or_else(|| {
                IndexError::UnsupportedOperation("populator lost its tree".to_string())
            })
        })?;

        self.populator.close(true)?;
        Ok(self.populator.sample_result()?)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(IndexError::Cancelled(self.descriptor().user_description()));
        }
        Ok(())
    }

    fn record_failure(&self, failure: &IndexPopulationFailure) {
        let description = self.descriptor().user_description();
        error!(index = %self.descriptor().id, failure = %failure.as_string(), "index population failed");

        self.proxy.fail(failure);
        if let Err(e) = self.populator.mark_as_failed(failure) {
            error!(index = %description, error = %e, "could not record population failure in tree");
        }
        if !self.populator.is_closed() {
            if let Err(e) = self.populator.close(false) {
                error!(index = %description, error = %e, "could not close failed populator");
            }
        }
    }
}

fn is_cancellation(failure: &IndexPopulationFailure) -> bool {
    match failure {
        IndexPopulationFailure::Cause(cause) => {
            matches!(cause.downcast_ref::<IndexError>(), Some(IndexError::Cancelled(_)))
        }
        IndexPopulationFailure::Description(_) => false,
    }
}
