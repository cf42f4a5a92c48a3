//! Index Statistics Store
//!
//! Latest `IndexSample` per index, read by the query planner. Rows are only
//! ever replaced wholesale, by population completion or by a sampling job.
//!
//! # Disk layout
//! ```text
//! {path}   ← magic:u64 | crc32:u32 | len:u32 | bincode Vec<(IndexId, IndexSample)>
//! ```

use crate::error::{IndexError, Result};
use crate::sample::IndexSample;
use crate::types::IndexId;
use dashmap::DashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const STATS_MAGIC: u64 = 0x534B_5354_4154_5331; // "SKSTATS1"
const STATS_HEADER: usize = 16;

/// Persisted mapping from index identity to its latest counts.
pub trait IndexStatisticsStore: Send + Sync {
    /// Replace the whole row for `index_id`.
    fn replace_index_counts(&self, index_id: IndexId, sample: IndexSample) -> Result<()>;

    /// Latest counts for `index_id`, if any were recorded.
    fn index_sample(&self, index_id: IndexId) -> Option<IndexSample>;

    /// Drop the row of a deleted index.
    fn remove_index(&self, index_id: IndexId);
}

/// Statistics kept in a concurrent map and checkpointed to one file.
///
/// Each replace takes the row's shard lock, so concurrent writers for the
/// same index serialise while different indexes proceed in parallel.
pub struct FileStatisticsStore {
    rows: DashMap<IndexId, IndexSample>,
    path: Option<PathBuf>,
}

impl FileStatisticsStore {
    /// Store that is never persisted.
    pub fn in_memory() -> Self {
        Self { rows: DashMap::new(), path: None }
    }

    /// Open (or create) a store backed by `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let rows = DashMap::new();
        if path.exists() {
            let bytes = fs::read(path)?;
            for (id, sample) in decode(path, &bytes)? {
                rows.insert(id, sample);
            }
        }
        debug!(path = %path.display(), rows = rows.len(), "opened index statistics store");
        Ok(Self { rows, path: Some(path.to_path_buf()) })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write all rows durably. No-op for in-memory stores.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };

        let mut rows: Vec<(IndexId, IndexSample)> = self.rows.iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        let body = bincode::serialize(&rows)?;

        let mut buf = Vec::with_capacity(STATS_HEADER + body.len());
        buf.extend_from_slice(&STATS_MAGIC.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);

        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl IndexStatisticsStore for FileStatisticsStore {
    fn replace_index_counts(&self, index_id: IndexId, sample: IndexSample) -> Result<()> {
        self.rows.insert(index_id, sample);
        Ok(())
    }

    fn index_sample(&self, index_id: IndexId) -> Option<IndexSample> {
        self.rows.get(&index_id).map(|r| *r.value())
    }

    fn remove_index(&self, index_id: IndexId) {
        self.rows.remove(&index_id);
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Vec<(IndexId, IndexSample)>> {
    let corrupted = |reason: &str| IndexError::Corrupted {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if bytes.len() < STATS_HEADER {
        return Err(corrupted("file shorter than header"));
    }
    let magic = u64::from_le_bytes(bytes[0..8].try_into().map_err(|_| corrupted("bad header"))?);
    let crc = u32::from_le_bytes(bytes[8..12].try_into().map_err(|_| corrupted("bad header"))?);
    let len = u32::from_le_bytes(bytes[12..16].try_into().map_err(|_| corrupted("bad header"))?) as usize;
    if magic != STATS_MAGIC {
        return Err(corrupted("bad magic"));
    }
    let body = &bytes[STATS_HEADER..];
    if body.len() != len {
        return Err(corrupted("truncated body"));
    }
    if crc32fast::hash(body) != crc {
        return Err(corrupted("body checksum mismatch"));
    }
    Ok(bincode::deserialize(body)?)
}
