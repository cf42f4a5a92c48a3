//! Index Registry
//!
//! Every index proxy the engine knows about, plus the listing surface that
//! reports state, failure text and statistics per index.
//!
//! # Recovery
//! On startup `recover()` reads every `*.sktree` file in the index directory:
//! - ONLINE trees are opened and served
//! - FAILED trees keep their persisted failure text
//! - POPULATING trees were interrupted and are reported FAILED

use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::failure::append_cause_of_failure;
use crate::proxy::{IndexProxy, NativeIndexProxy};
use crate::sample::IndexSample;
use crate::stats::IndexStatisticsStore;
use crate::tree::IndexTree;
use crate::types::{IndexId, InternalIndexState};
use dashmap::DashMap;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const TREE_EXTENSION: &str = "sktree";
const INTERRUPTED_POPULATION: &str =
    "population was interrupted before completion, the index must be dropped and recreated";

/// One row of an index listing.
#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub id: IndexId,
    pub name: String,
    pub description: String,
    pub state: InternalIndexState,
    pub failure: Option<String>,
    pub sample: Option<IndexSample>,
}

impl IndexStatus {
    /// State line, with the failure block appended for FAILED indexes.
    pub fn describe(&self) -> String {
        let message = format!("{} is {}", self.description, self.state);
        match &self.failure {
            Some(failure) => append_cause_of_failure(&message, failure),
            None => message,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id.as_u64(),
            "name": self.name,
            "state": self.state.to_string(),
            "failure": self.failure,
            "statistics": self.sample.map(|s| s.to_json()),
        })
    }
}

pub struct IndexRegistry {
    proxies: DashMap<IndexId, Arc<NativeIndexProxy>>,
    stats: Arc<dyn IndexStatisticsStore>,
}

impl IndexRegistry {
    pub fn new(stats: Arc<dyn IndexStatisticsStore>) -> Self {
        Self { proxies: DashMap::new(), stats }
    }

    /// Add (or replace) the proxy for its index id.
    pub fn register(&self, proxy: Arc<NativeIndexProxy>) {
        let id = proxy.descriptor().id;
        if self.proxies.insert(id, proxy).is_some() {
            warn!(index = %id, "replaced existing index proxy");
        }
    }

    pub fn get(&self, id: IndexId) -> Result<Arc<NativeIndexProxy>> {
        self.proxies
            .get(&id)
            .map(|p| Arc::clone(p.value()))
            .ok_or(IndexError::IndexNotFound(id))
    }

    /// Forget an index and its statistics row.
    pub fn remove(&self, id: IndexId) -> Option<Arc<NativeIndexProxy>> {
        self.stats.remove_index(id);
        self.proxies.remove(&id).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// All proxies ordered by index id.
    pub fn proxies(&self) -> Vec<Arc<NativeIndexProxy>> {
        let mut all: Vec<_> = self.proxies.iter().map(|p| Arc::clone(p.value())).collect();
        all.sort_by_key(|p| p.descriptor().id);
        all
    }

    pub fn online_proxies(&self) -> Vec<Arc<NativeIndexProxy>> {
        self.proxies()
            .into_iter()
            .filter(|p| p.state() == InternalIndexState::Online)
            .collect()
    }

    pub fn status(&self, id: IndexId) -> Result<IndexStatus> {
        let proxy = self.get(id)?;
        Ok(self.status_of(&proxy))
    }

    /// Listing of every index ordered by id.
    pub fn list(&self) -> Vec<IndexStatus> {
        self.proxies().iter().map(|p| self.status_of(p)).collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.list().iter().map(IndexStatus::to_json).collect())
    }

    /// Flush dirty ONLINE trees to disk.
    pub fn checkpoint(&self) -> Result<()> {
        for proxy in self.proxies() {
            proxy.checkpoint()?;
        }
        Ok(())
    }

    /// Register a proxy for every tree file in `dir`. Unreadable files are
    /// skipped with a warning. Returns how many indexes were recovered.
    pub fn recover(&self, dir: &Path, config: &IndexConfig) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }
        let mut recovered = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TREE_EXTENSION) {
                continue;
            }
            match Self::recover_tree(&path, config) {
                Ok(proxy) => {
                    self.register(Arc::new(proxy));
                    recovered += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable index tree"),
            }
        }
        info!(dir = %dir.display(), recovered, "recovered indexes");
        Ok(recovered)
    }

    fn recover_tree(path: &Path, config: &IndexConfig) -> Result<NativeIndexProxy> {
        let status = IndexTree::read_status(path)?;
        let proxy = match status.state {
            InternalIndexState::Online => NativeIndexProxy::online(Arc::new(IndexTree::open(path)?), config),
            InternalIndexState::Failed => {
                let failure = status.failure.unwrap_or_else(|| "population failed without a recorded cause".to_string());
                NativeIndexProxy::failed(status.descriptor, failure, config)
            }
            InternalIndexState::Populating => {
                warn!(index = %status.descriptor.id, "index population was interrupted");
                NativeIndexProxy::failed(status.descriptor, INTERRUPTED_POPULATION, config)
            }
        };
        Ok(proxy)
    }

    fn status_of(&self, proxy: &NativeIndexProxy) -> IndexStatus {
        let descriptor = proxy.descriptor();
        IndexStatus {
            id: descriptor.id,
            name: descriptor.name.clone(),
            description: descriptor.user_description(),
            state: proxy.state(),
            failure: proxy.failure(),
            sample: self.stats.index_sample(descriptor.id),
        }
    }
}
