//! Index error types.

use crate::types::{EntityId, IndexId, InternalIndexState, SchemaDescriptor};
use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Shared, cloneable error object used as a failure cause.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors raised by the index lifecycle engine.
#[derive(Debug, Error)]
pub enum IndexError {
    /// An I/O error occurred.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// A serialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A persisted file failed validation.
    #[error("corrupted index file {path:?}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    /// An update did not match the schema it was applied to.
    #[error("malformed index update: {0}")]
    MalformedUpdate(String),

    /// The operation is not supported for this value.
    #[error("operation not supported: {0}")]
    UnsupportedOperation(String),

    /// Two entities share a value in an index backing a uniqueness constraint.
    #[error(
        "both entity {existing} and entity {added} share the property value {values} in unique index {index}"
    )]
    ConstraintViolation {
        index: String,
        values: String,
        existing: EntityId,
        added: EntityId,
    },

    /// Population of an index failed.
    #[error("failed to populate index {index} on {schema}: {reason}")]
    PopulationFailed {
        index: String,
        schema: SchemaDescriptor,
        reason: String,
        #[source]
        source: Option<SharedError>,
    },

    /// The index is not in a state that allows reading.
    #[error("index {index} is not online (state: {state})")]
    NotOnline {
        index: String,
        state: InternalIndexState,
    },

    /// The populator was already closed.
    #[error("populator for index {0} is closed")]
    Closed(String),

    /// Population was aborted from outside.
    #[error("population of index {0} was cancelled")]
    Cancelled(String),

    /// No index with the given id is known.
    #[error("index not found: {0}")]
    IndexNotFound(IndexId),
}

impl From<bincode::Error> for IndexError {
    fn from(e: bincode::Error) -> Self {
        IndexError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Serialization(e.to_string())
    }
}
