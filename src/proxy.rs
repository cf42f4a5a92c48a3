//! Index Proxy
//!
//! The handle the rest of the system holds for one index. It routes writes
//! by lifecycle state:
//! - POPULATING: queued for the populator
//! - ONLINE: applied to the tree directly
//! - FAILED: dropped
//!
//! The populator seals its queue, applies what was left in it and publishes
//! ONLINE while holding the state write lock, so an update is applied
//! exactly once: either through the queue or directly to the online tree.
//! Everything slower (full constraint checks, checkpoints, sampling) runs
//! before or after that window.

use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::failure::IndexPopulationFailure;
use crate::populator::{apply_update, validate_update};
use crate::queue::IndexUpdateQueue;
use crate::reader::{IndexReader, NativeIndexReader};
use crate::tree::IndexTree;
use crate::types::{IndexDescriptor, InternalIndexState};
use crate::update::IndexEntryUpdate;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, trace, warn};

/// State-aware access to one index.
pub trait IndexProxy: Send + Sync {
    fn descriptor(&self) -> &IndexDescriptor;

    fn state(&self) -> InternalIndexState;

    /// Reader over the index. Only ONLINE indexes can be read.
    fn new_reader(&self) -> Result<Box<dyn IndexReader>>;

    /// Failure text of a FAILED index.
    fn failure(&self) -> Option<String>;
}

enum ProxyState {
    Populating { queue: Arc<IndexUpdateQueue> },
    Online { tree: Arc<IndexTree> },
    Failed { failure: String },
}

pub struct NativeIndexProxy {
    descriptor: IndexDescriptor,
    state: RwLock<ProxyState>,
    scan_chunk_size: usize,
}

impl NativeIndexProxy {
    /// Proxy for an index whose population feeds from `queue`.
    pub fn populating(descriptor: IndexDescriptor, queue: Arc<IndexUpdateQueue>, config: &IndexConfig) -> Self {
        Self::with_state(descriptor, ProxyState::Populating { queue }, config)
    }

    /// Proxy for an already built tree.
    pub fn online(tree: Arc<IndexTree>, config: &IndexConfig) -> Self {
        let descriptor = tree.descriptor().clone();
        Self::with_state(descriptor, ProxyState::Online { tree }, config)
    }

    pub fn failed(descriptor: IndexDescriptor, failure: impl Into<String>, config: &IndexConfig) -> Self {
        Self::with_state(descriptor, ProxyState::Failed { failure: failure.into() }, config)
    }

    fn with_state(descriptor: IndexDescriptor, state: ProxyState, config: &IndexConfig) -> Self {
        Self {
            descriptor,
            state: RwLock::new(state),
            scan_chunk_size: config.scan_chunk_size,
        }
    }

    /// Route one committed update according to the current state.
    ///
    /// While POPULATING this may block when the hand-off queue is full.
    pub fn apply_update(&self, update: IndexEntryUpdate) -> Result<()> {
        validate_update(&self.descriptor, &update)?;

        let queue = match &*self.state.read() {
            ProxyState::Populating { queue } => Some(Arc::clone(queue)),
            _ => None,
        };
        let update = match queue {
            Some(queue) => match queue.push(update) {
                Ok(()) => return Ok(()),
                // sealed: population is finishing, wait for the flip
                Err(update) => update,
            },
            None => update,
        };

        match &*self.state.read() {
            ProxyState::Online { tree } => apply_update(tree, &update),
            ProxyState::Failed { .. } => {
                trace!(index = %self.descriptor.id, "dropping update for failed index");
                Ok(())
            }
            ProxyState::Populating { .. } => Err(IndexError::Closed(self.descriptor.user_description())),
        }
    }

    /// Apply a batch of updates in order.
    pub fn apply_updates<I>(&self, updates: I) -> Result<()>
    where
        I: IntoIterator<Item = IndexEntryUpdate>,
    {
        for update in updates {
            self.apply_update(update)?;
        }
        Ok(())
    }

    /// Seal the hand-off queue and publish ONLINE atomically with respect to
    /// writers. `finish` receives the updates still queued and must return
    /// the finished tree. Every reader and writer of this proxy waits while
    /// `finish` runs, so it should only apply and check those updates. If it
    /// fails, the proxy becomes FAILED and the failure is handed back.
    pub(crate) fn complete_population<F>(&self, finish: F) -> std::result::Result<(), IndexPopulationFailure>
    where
        F: FnOnce(Vec<IndexEntryUpdate>) -> Result<Arc<IndexTree>>,
    {
        let mut state = self.state.write();
        let queue = match &*state {
            ProxyState::Populating { queue } => Arc::clone(queue),
            _ => {
                return Err(IndexPopulationFailure::from_error(IndexError::UnsupportedOperation(format!(
                    "index {} is not populating", self.descriptor.id
                ))))
            }
        };
        let remaining = queue.close_and_drain();
        match finish(remaining) {
            Ok(tree) => {
                *state = ProxyState::Online { tree };
                info!(index = %self.descriptor.id, "index is now online");
                Ok(())
            }
            Err(e) => {
                let failure = IndexPopulationFailure::from(e);
                *state = ProxyState::Failed { failure: failure.as_string() };
                Err(failure)
            }
        }
    }

    /// Move to FAILED. Writers blocked on the hand-off queue are released and
    /// their updates dropped.
    pub fn fail(&self, failure: &IndexPopulationFailure) {
        let mut state = self.state.write();
        if let ProxyState::Populating { queue } = &*state {
            let dropped = queue.close_and_drain().len();
            if dropped > 0 {
                warn!(index = %self.descriptor.id, dropped, "discarded queued updates of failed index");
            }
        }
        *state = ProxyState::Failed { failure: failure.as_string() };
    }

    /// Persist the online tree if it has unsaved changes.
    pub fn checkpoint(&self) -> Result<()> {
        let tree = match &*self.state.read() {
            ProxyState::Online { tree } => Arc::clone(tree),
            _ => return Ok(()),
        };
        if tree.is_dirty() {
            tree.checkpoint()?;
        }
        Ok(())
    }
}

impl IndexProxy for NativeIndexProxy {
    fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    fn state(&self) -> InternalIndexState {
        match &*self.state.read() {
            ProxyState::Populating { .. } => InternalIndexState::Populating,
            ProxyState::Online { .. } => InternalIndexState::Online,
            ProxyState::Failed { .. } => InternalIndexState::Failed,
        }
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        match &*self.state.read() {
            ProxyState::Online { tree } => Ok(Box::new(NativeIndexReader::new(Arc::clone(tree), self.scan_chunk_size))),
            ProxyState::Populating { .. } => Err(self.not_online(InternalIndexState::Populating)),
            ProxyState::Failed { .. } => Err(self.not_online(InternalIndexState::Failed)),
        }
    }

    fn failure(&self) -> Option<String> {
        match &*self.state.read() {
            ProxyState::Failed { failure } => Some(failure.clone()),
            _ => None,
        }
    }
}

impl NativeIndexProxy {
    fn not_online(&self, state: InternalIndexState) -> IndexError {
        IndexError::NotOnline { index: self.descriptor.user_description(), state }
    }
}
