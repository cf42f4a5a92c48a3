use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Cardinality of an index at one point in time.
///
/// Expected relationship: `unique_values <= sample_size <= index_size`. For a
/// full scan `sample_size == index_size`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSample {
    pub index_size: u64,
    pub unique_values: u64,
    pub sample_size: u64,
}

impl IndexSample {
    pub fn new(index_size: u64, unique_values: u64, sample_size: u64) -> Self {
        Self { index_size, unique_values, sample_size }
    }

    /// Estimated fraction of distinct values, 1.0 for an empty index.
    pub fn selectivity(&self) -> f64 {
        if self.sample_size == 0 {
            1.0
        } else {
            self.unique_values as f64 / self.sample_size as f64
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "index_size": self.index_size,
            "unique_values": self.unique_values,
            "sample_size": self.sample_size,
        })
    }
}

/// Produces a sample of one index.
pub trait IndexSampler: Send {
    fn sample_index(&mut self) -> Result<IndexSample>;
}
