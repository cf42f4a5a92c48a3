//! Index Entry Updates
//!
//! One entity's change against one schema target. Produced by the
//! transaction layer, consumed once by a populator or by online maintenance.

use crate::error::{IndexError, Result};
use crate::types::{EntityId, SchemaDescriptor, ValueTuple};
use std::fmt;

/// Kind of change an update describes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UpdateMode {
    Added,
    Removed,
    Changed,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateMode::Added => "ADDED",
            UpdateMode::Removed => "REMOVED",
            UpdateMode::Changed => "CHANGED",
        };
        f.write_str(name)
    }
}

/// Values carried per mode. Removed keeps the removed values so the tree key
/// can be reconstructed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum UpdateValues {
    Added { after: ValueTuple },
    Removed { after: ValueTuple },
    Changed { before: ValueTuple, after: ValueTuple },
}

/// Immutable delta of one entity against one schema.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexEntryUpdate {
    entity_id: EntityId,
    schema: SchemaDescriptor,
    values: UpdateValues,
}

impl IndexEntryUpdate {
    /// Entity gained indexed values.
    pub fn add(entity_id: EntityId, schema: SchemaDescriptor, values: impl Into<ValueTuple>) -> Result<Self> {
        let after = values.into();
        check_cardinality(entity_id, &schema, &after)?;
        Ok(Self { entity_id, schema, values: UpdateValues::Added { after } })
    }

    /// Entity lost indexed values.
    pub fn remove(entity_id: EntityId, schema: SchemaDescriptor, values: impl Into<ValueTuple>) -> Result<Self> {
        let after = values.into();
        check_cardinality(entity_id, &schema, &after)?;
        Ok(Self { entity_id, schema, values: UpdateValues::Removed { after } })
    }

    /// Entity's indexed values changed from `before` to `after`.
    pub fn change(
        entity_id: EntityId,
        schema: SchemaDescriptor,
        before: impl Into<ValueTuple>,
        after: impl Into<ValueTuple>,
    ) -> Result<Self> {
        let before = before.into();
        let after = after.into();
        check_cardinality(entity_id, &schema, &before)?;
        check_cardinality(entity_id, &schema, &after)?;
        Ok(Self { entity_id, schema, values: UpdateValues::Changed { before, after } })
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn mode(&self) -> UpdateMode {
        match self.values {
            UpdateValues::Added { .. } => UpdateMode::Added,
            UpdateValues::Removed { .. } => UpdateMode::Removed,
            UpdateValues::Changed { .. } => UpdateMode::Changed,
        }
    }

    /// Values after the change (for Removed: the values that were removed).
    pub fn values(&self) -> &ValueTuple {
        match &self.values {
            UpdateValues::Added { after }
            | UpdateValues::Removed { after }
            | UpdateValues::Changed { after, .. } => after,
        }
    }

    /// Values before the change. Only Changed updates have a before-state;
    /// callers must check `mode()` first.
    pub fn before_values(&self) -> Result<&ValueTuple> {
        match &self.values {
            UpdateValues::Changed { before, .. } => Ok(before),
            _ => Err(IndexError::UnsupportedOperation(format!(
                "before values are only available for CHANGED updates, this update is {}",
                self.mode()
            ))),
        }
    }
}

impl fmt::Display for IndexEntryUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.values {
            UpdateValues::Changed { before, after } => write!(
                f,
                "IndexEntryUpdate[id={}, mode={}, schema={}, beforeValues={}, values={}]",
                self.entity_id, self.mode(), self.schema, before, after
            ),
            _ => write!(
                f,
                "IndexEntryUpdate[id={}, mode={}, schema={}, values={}]",
                self.entity_id, self.mode(), self.schema, self.values()
            ),
        }
    }
}

fn check_cardinality(entity_id: EntityId, schema: &SchemaDescriptor, values: &ValueTuple) -> Result<()> {
    if values.len() != schema.property_count() {
        return Err(IndexError::MalformedUpdate(format!(
            "entity {} carries {} values but schema {} has {} properties",
            entity_id,
            values.len(),
            schema,
            schema.property_count()
        )));
    }
    Ok(())
}
