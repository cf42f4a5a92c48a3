// Sekejap Index v0.4.0 - Native Secondary-Index Lifecycle Engine
// Population, live-update absorption, failure capture and sampling

pub mod types;
pub mod error;
pub mod config;
pub mod update;
pub mod failure;
pub mod sample;
pub mod tree;
pub mod reader;
pub mod stats;
pub mod queue;
pub mod populator;
pub mod proxy;
pub mod population;
pub mod scheduler;
pub mod sampling;
pub mod registry;

// Re-export main types
pub use types::{EntityId, EntityType, IndexDescriptor, IndexId, InternalIndexState, SchemaDescriptor, Value, ValueTuple};
pub use error::{IndexError, Result};
pub use config::IndexConfig;
pub use update::{IndexEntryUpdate, UpdateMode};
pub use failure::IndexPopulationFailure;
pub use sample::{IndexSample, IndexSampler};
pub use stats::{FileStatisticsStore, IndexStatisticsStore};
pub use populator::NativeIndexPopulator;
pub use proxy::{IndexProxy, NativeIndexProxy};
pub use population::{IndexPopulationJob, PopulationOutcome, ScanBatches};
pub use scheduler::{ImmediateScheduler, JobScheduler, RayonScheduler};
pub use sampling::{IndexSamplingController, OnlineIndexSamplingJob, SamplingOutcome};
pub use registry::{IndexRegistry, IndexStatus};
