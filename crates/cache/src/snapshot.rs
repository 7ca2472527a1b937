//! Deep snapshots of call arguments and return values
//!
//! A [`Snapshot`] is the owned, acyclic, serializable image of a [`Value`]
//! graph. The [`Snapshotter`] walks shared nodes with an identity-keyed
//! visited set and a depth bound, so it terminates on cyclic graphs:
//!
//! - a shared node revisited on the current path becomes [`Snapshot::Cycle`]
//! - containers (sequences, mappings and objects) nested deeper than
//!   `max_depth` become empty placeholders of the same kind
//! - live weak references are followed, dead ones become [`Snapshot::None`]
//! - native resources cannot be snapshotted and fail with [`Error::Encoding`]

use crate::value::{Object, Value};
use crate::{Error, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Default nesting bound for containers
pub const DEFAULT_MAX_DEPTH: usize = 99;

/// Largest accepted nesting bound; stored streams stay within
/// [`crate::store::MAX_STREAM_NESTING`] below it
pub const MAX_DEPTH_LIMIT: usize = 128;

/// Serializable image of a [`Value`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Snapshot {
    /// Absent value
    None,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(#[serde(with = "float_repr")] f64),
    /// Text
    Text(String),
    /// Point in time
    DateTime(DateTime<Utc>),
    /// Elapsed time
    Duration {
        /// Whole seconds
        seconds: i64,
        /// Sub-second part in nanoseconds, carrying the sign of `seconds`
        nanos: i32,
    },
    /// Ordered sequence
    List(Vec<Snapshot>),
    /// Unordered collection
    Set(Vec<Snapshot>),
    /// Keyed mapping
    Map(BTreeMap<String, Snapshot>),
    /// Object instance
    Object {
        /// Name of the instance's type
        type_name: String,
        /// Attribute snapshots
        fields: BTreeMap<String, Snapshot>,
    },
    /// A callable, by name
    Callable(String),
    /// Back-reference to a node already being snapshotted
    Cycle,
}

impl From<Snapshot> for Value {
    fn from(snapshot: Snapshot) -> Self {
        match snapshot {
            Snapshot::None | Snapshot::Cycle => Self::None,
            Snapshot::Bool(b) => Self::Bool(b),
            Snapshot::Int(i) => Self::Int(i),
            Snapshot::Float(f) => Self::Float(f),
            Snapshot::Text(s) => Self::Text(s),
            Snapshot::DateTime(dt) => Self::DateTime(dt),
            Snapshot::Duration { seconds, nanos } => Self::Duration(
                TimeDelta::try_seconds(seconds).unwrap_or(TimeDelta::MAX)
                    + TimeDelta::nanoseconds(i64::from(nanos)),
            ),
            Snapshot::List(items) => Self::List(items.into_iter().map(Into::into).collect()),
            Snapshot::Set(items) => Self::Set(items.into_iter().map(Into::into).collect()),
            Snapshot::Map(entries) => {
                Self::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            Snapshot::Object { type_name, fields } => Self::Object(Object {
                type_name,
                fields: fields.into_iter().map(|(k, v)| (k, v.into())).collect(),
            }),
            Snapshot::Callable(name) => Self::Callable(name),
        }
    }
}

/// Depth-bounded, cycle-safe deep snapshot serializer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshotter {
    max_depth: usize,
}

impl Default for Snapshotter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl Snapshotter {
    /// Create a snapshotter with the given nesting bound, capped at [`MAX_DEPTH_LIMIT`]
    #[must_use]
    pub const fn new(max_depth: usize) -> Self {
        Self {
            max_depth: if max_depth > MAX_DEPTH_LIMIT {
                MAX_DEPTH_LIMIT
            } else {
                max_depth
            },
        }
    }

    /// The configured nesting bound
    #[must_use]
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Snapshot a single value
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if the graph reaches a native resource
    pub fn snapshot(&self, value: &Value) -> Result<Snapshot> {
        Walk {
            max_depth: self.max_depth,
            visiting: HashSet::new(),
        }
        .walk(value, 0)
    }

    /// Snapshot positional arguments
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if any argument reaches a native resource
    pub fn snapshot_all(&self, values: &[Value]) -> Result<Vec<Snapshot>> {
        values.iter().map(|v| self.snapshot(v)).collect()
    }

    /// Snapshot keyword arguments
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if any argument reaches a native resource
    pub fn snapshot_entries(
        &self,
        entries: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Snapshot>> {
        entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.snapshot(v)?)))
            .collect()
    }
}

struct Walk {
    max_depth: usize,
    visiting: HashSet<usize>,
}

impl Walk {
    fn walk(&mut self, value: &Value, depth: usize) -> Result<Snapshot> {
        Ok(match value {
            Value::None => Snapshot::None,
            Value::Bool(b) => Snapshot::Bool(*b),
            Value::Int(i) => Snapshot::Int(*i),
            Value::Float(f) => Snapshot::Float(*f),
            Value::Text(s) => Snapshot::Text(s.clone()),
            Value::DateTime(dt) => Snapshot::DateTime(*dt),
            Value::Duration(d) => Snapshot::Duration {
                seconds: d.num_seconds(),
                nanos: d.subsec_nanos(),
            },
            Value::List(items) => Snapshot::List(self.walk_items(items, depth)?),
            Value::Set(items) => Snapshot::Set(self.walk_items(items, depth)?),
            Value::Map(entries) => Snapshot::Map(self.walk_entries(entries, depth)?),
            Value::Object(obj) => Snapshot::Object {
                type_name: obj.type_name.clone(),
                fields: self.walk_entries(&obj.fields, depth)?,
            },
            Value::Callable(name) => Snapshot::Callable(name.clone()),
            Value::Shared(node) => {
                let id = node.id();
                if !self.visiting.insert(id) {
                    return Ok(Snapshot::Cycle);
                }
                let result = self.walk(&node.borrow(), depth);
                self.visiting.remove(&id);
                result?
            }
            Value::Weak(weak) => match weak.upgrade() {
                Some(node) => self.walk(&Value::Shared(node), depth)?,
                None => Snapshot::None,
            },
            Value::Resource(description) => {
                return Err(Error::encoding(format!(
                    "native resource '{description}' cannot be snapshotted"
                )));
            }
        })
    }

    /// Children of a container at `depth`; none once past the bound
    fn walk_items(&mut self, items: &[Value], depth: usize) -> Result<Vec<Snapshot>> {
        if depth > self.max_depth {
            return Ok(Vec::new());
        }
        items.iter().map(|v| self.walk(v, depth + 1)).collect()
    }

    fn walk_entries(
        &mut self,
        entries: &BTreeMap<String, Value>,
        depth: usize,
    ) -> Result<BTreeMap<String, Snapshot>> {
        if depth > self.max_depth {
            return Ok(BTreeMap::new());
        }
        entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.walk(v, depth + 1)?)))
            .collect()
    }
}

/// Serde helper keeping non-finite floats representable in JSON
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    #[allow(clippy::trivially_copy_pass_by_ref)] // serde `with` signature
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("nan")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => match s.as_str() {
                "nan" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "invalid float literal '{other}'"
                ))),
            },
        }
    }
}
