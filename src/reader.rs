//! Index readers and samplers over a native tree.

use crate::error::Result;
use crate::sample::{IndexSample, IndexSampler};
use crate::tree::{IndexTree, SCAN_CHUNK_SIZE};
use crate::types::{EntityId, ValueTuple};
use std::sync::Arc;

/// Read-only view of one index.
pub trait IndexReader: Send + Sync {
    /// Entities indexed under exactly `values`.
    fn lookup(&self, values: &ValueTuple) -> Vec<EntityId>;

    /// Number of entries in the index.
    fn entry_count(&self) -> u64;

    /// Sampler bound to this reader's index.
    fn create_sampler(&self) -> Box<dyn IndexSampler>;
}

pub struct NativeIndexReader {
    tree: Arc<IndexTree>,
    scan_chunk_size: usize,
}

impl NativeIndexReader {
    pub fn new(tree: Arc<IndexTree>, scan_chunk_size: usize) -> Self {
        Self { tree, scan_chunk_size }
    }
}

impl IndexReader for NativeIndexReader {
    fn lookup(&self, values: &ValueTuple) -> Vec<EntityId> {
        self.tree.lookup(values)
    }

    fn entry_count(&self) -> u64 {
        self.tree.len() as u64
    }

    fn create_sampler(&self) -> Box<dyn IndexSampler> {
        Box::new(FullScanSampler::with_chunk_size(Arc::clone(&self.tree), self.scan_chunk_size))
    }
}

/// Exact sample: walks every entry and counts distinct value tuples.
///
/// The walk reads the tree in chunks, so live updates landing mid-sample are
/// reflected or not depending on where the cursor is.
pub struct FullScanSampler {
    tree: Arc<IndexTree>,
    chunk_size: usize,
}

impl FullScanSampler {
    pub fn new(tree: Arc<IndexTree>) -> Self {
        Self::with_chunk_size(tree, SCAN_CHUNK_SIZE)
    }

    pub fn with_chunk_size(tree: Arc<IndexTree>, chunk_size: usize) -> Self {
        Self { tree, chunk_size: chunk_size.max(1) }
    }
}

impl IndexSampler for FullScanSampler {
    fn sample_index(&mut self) -> Result<IndexSample> {
        let mut size = 0u64;
        let mut unique = 0u64;
        let mut previous: Option<ValueTuple> = None;
        // Entries are ordered by values, so equal tuples are adjacent.
        self.tree.for_each_chunk(self.chunk_size, |chunk| -> Result<()> {
            for key in chunk {
                if previous.as_ref() != Some(&key.values) {
                    unique += 1;
                    previous = Some(key.values.clone());
                }
            }
            size += chunk.len() as u64;
            Ok(())
        })?;
        Ok(IndexSample::new(size, unique, size))
    }
}
