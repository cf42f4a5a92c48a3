//! Index Population Failure
//!
//! Captures why a population attempt failed, independent of how it is later
//! surfaced: as text in an index listing, or as a typed error bound to the
//! index that failed.

use crate::error::{IndexError, SharedError};
use crate::types::SchemaDescriptor;
use std::error::Error as StdError;
use std::fmt::Write;
use std::sync::Arc;

/// Why a population attempt failed.
#[derive(Clone, Debug)]
pub enum IndexPopulationFailure {
    /// A causal error and its chain of sources
    Cause(SharedError),
    /// A plain textual description
    Description(String),
}

impl IndexPopulationFailure {
    pub fn from_error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        IndexPopulationFailure::Cause(Arc::new(error))
    }

    pub fn from_description(description: impl Into<String>) -> Self {
        IndexPopulationFailure::Description(description.into())
    }

    /// Render the failure as a single descriptive string.
    pub fn as_string(&self) -> String {
        match self {
            IndexPopulationFailure::Cause(error) => stringify(error.as_ref()),
            IndexPopulationFailure::Description(text) => text.clone(),
        }
    }

    /// Bind the failure to the index it belongs to.
    pub fn as_index_population_failure(&self, schema: &SchemaDescriptor, index_label: &str) -> IndexError {
        match self {
            IndexPopulationFailure::Cause(error) => IndexError::PopulationFailed {
                index: index_label.to_string(),
                schema: schema.clone(),
                reason: error.to_string(),
                source: Some(Arc::clone(error)),
            },
            IndexPopulationFailure::Description(text) => IndexError::PopulationFailed {
                index: index_label.to_string(),
                schema: schema.clone(),
                reason: text.clone(),
                source: None,
            },
        }
    }
}

impl From<IndexError> for IndexPopulationFailure {
    fn from(error: IndexError) -> Self {
        IndexPopulationFailure::from_error(error)
    }
}

/// Render an error followed by every error in its source chain.
pub fn stringify(error: &(dyn StdError + 'static)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    if source.is_some() {
        out.push_str("\nCaused by:");
    }
    let mut depth = 0;
    while let Some(cause) = source {
        let _ = write!(out, "\n    {}: {}", depth, cause);
        depth += 1;
        source = cause.source();
    }
    out
}

/// Append a delimited cause block to a status message.
pub fn append_cause_of_failure(message: &str, cause_of_failure: &str) -> String {
    format!(
        "{}: Cause of failure:\n==================\n{}\n==================",
        message, cause_of_failure
    )
}
