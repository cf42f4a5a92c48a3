use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

/// Identity of a node or relationship owning an indexed property.
pub type EntityId = u64;

/// Stable small integer assigned to an index at creation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId(pub u64);

impl IndexId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// File name of the tree backing this index inside an index directory.
    pub fn tree_file_name(self) -> String {
        format!("index-{:016x}.sktree", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============ VALUES ============

/// An indexable property value.
///
/// Values of different types never compare equal; across types the order is
/// Bool < Int < Float < String. Floats are ordered with `total_cmp` and hashed
/// by bit pattern so that `Eq`, `Ord` and `Hash` agree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::String(_) => 3,
        }
    }

    /// Convert a JSON payload field. Null, arrays and objects are not indexable.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Int(i)),
                None => n.as_f64().map(Value::Float),
            },
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "'{}'", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Ordered property values of one entity for one schema.
///
/// A single value and a one-element sequence of that value are the same tuple.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueTuple(SmallVec<[Value; 4]>);

impl ValueTuple {
    pub fn new() -> Self {
        Self(SmallVec::new())
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.0.iter().map(Value::to_json).collect())
    }
}

impl Deref for ValueTuple {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl From<Value> for ValueTuple {
    fn from(value: Value) -> Self {
        let mut values = SmallVec::new();
        values.push(value);
        Self(values)
    }
}

impl From<Vec<Value>> for ValueTuple {
    fn from(values: Vec<Value>) -> Self {
        Self(SmallVec::from_vec(values))
    }
}

impl From<&[Value]> for ValueTuple {
    fn from(values: &[Value]) -> Self {
        Self(SmallVec::from(values))
    }
}

impl<const N: usize> From<[Value; N]> for ValueTuple {
    fn from(values: [Value; N]) -> Self {
        Self(values.into_iter().collect())
    }
}

impl FromIterator<Value> for ValueTuple {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ValueTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

// ============ SCHEMA ============

/// Kind of entity a schema targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Node,
    Relationship,
}

/// Label (or relationship type) plus the property keys an index covers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub entity_type: EntityType,
    pub entity_token: u32,
    pub property_keys: SmallVec<[u32; 4]>,
}

impl SchemaDescriptor {
    pub fn for_label(label: u32, property_keys: &[u32]) -> Self {
        Self {
            entity_type: EntityType::Node,
            entity_token: label,
            property_keys: SmallVec::from(property_keys),
        }
    }

    pub fn for_relationship_type(rel_type: u32, property_keys: &[u32]) -> Self {
        Self {
            entity_type: EntityType::Relationship,
            entity_token: rel_type,
            property_keys: SmallVec::from(property_keys),
        }
    }

    /// Number of properties every update for this schema must carry.
    pub fn property_count(&self) -> usize {
        self.property_keys.len()
    }
}

impl fmt::Display for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.property_keys.iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        match self.entity_type {
            EntityType::Node => write!(f, ":label[{}]({})", self.entity_token, keys),
            EntityType::Relationship => write!(f, "-[:type[{}]({})]-", self.entity_token, keys),
        }
    }
}

/// Persistent identity of one index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub id: IndexId,
    pub name: String,
    pub schema: SchemaDescriptor,
    /// Backs a uniqueness constraint
    pub unique: bool,
}

impl IndexDescriptor {
    pub fn new(id: IndexId, name: &str, schema: SchemaDescriptor) -> Self {
        Self { id, name: name.to_string(), schema, unique: false }
    }

    pub fn unique(id: IndexId, name: &str, schema: SchemaDescriptor) -> Self {
        Self { id, name: name.to_string(), schema, unique: true }
    }

    /// Human-readable label used in logs and errors.
    pub fn user_description(&self) -> String {
        let kind = if self.unique { "UNIQUE BTREE" } else { "GENERAL BTREE" };
        format!(
            "Index( id={}, name='{}', type='{}', schema={} )",
            self.id, self.name, kind, self.schema
        )
    }
}

/// Lifecycle state of an index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InternalIndexState {
    Populating,
    Online,
    Failed,
}

impl InternalIndexState {
    pub(crate) fn as_u32(self) -> u32 {
        match self {
            InternalIndexState::Populating => 0,
            InternalIndexState::Online => 1,
            InternalIndexState::Failed => 2,
        }
    }

    pub(crate) fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(InternalIndexState::Populating),
            1 => Some(InternalIndexState::Online),
            2 => Some(InternalIndexState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for InternalIndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InternalIndexState::Populating => "POPULATING",
            InternalIndexState::Online => "ONLINE",
            InternalIndexState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
