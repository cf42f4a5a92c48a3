//! Index Engine Configuration
//!
//! Runtime-selectable knobs for population and sampling.
//!
//! # Example
//! ```ignore
//! use sekejap_index::config::IndexConfig;
//!
//! let config = IndexConfig::default()
//!     .batch_size(5_000)
//!     .scan_chunk_size(1_024);
//! ```

use crate::tree::SCAN_CHUNK_SIZE;

/// Index engine configuration
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Entries per scan batch handed to `add()`
    pub batch_size: usize,
    /// Max queued live updates before writers are slowed down
    pub queue_capacity: usize,
    /// Entries a sampler reads per tree lock window
    pub scan_chunk_size: usize,
    /// Background sampling worker threads (0 = rayon default)
    pub sampling_threads: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            queue_capacity: 100_000,
            scan_chunk_size: SCAN_CHUNK_SIZE,
            sampling_threads: 0,
        }
    }
}

impl IndexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn scan_chunk_size(mut self, chunk_size: usize) -> Self {
        self.scan_chunk_size = chunk_size.max(1);
        self
    }

    pub fn sampling_threads(mut self, threads: usize) -> Self {
        self.sampling_threads = threads;
        self
    }
}
