//! Dynamic values describing the arguments and results of a recorded call
//!
//! Calls routed through the cache are described with [`Value`] rather than
//! concrete Rust types so that any call shape can be fingerprinted and
//! snapshotted. Identity-bearing nodes ([`SharedValue`]) may alias each other
//! and form cycles; [`WeakValue`] models non-owning references to them.

use chrono::{DateTime, TimeDelta, Utc};
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// A value passed to or returned from a recorded call
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value
    None,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Text
    Text(String),
    /// Point in time
    DateTime(DateTime<Utc>),
    /// Elapsed time
    Duration(TimeDelta),
    /// Ordered sequence
    List(Vec<Value>),
    /// Unordered collection
    Set(Vec<Value>),
    /// Keyed mapping
    Map(BTreeMap<String, Value>),
    /// Instance of a user-defined composite type
    Object(Object),
    /// A callable, identified by its declared name
    Callable(String),
    /// Identity-bearing node that may be aliased or self-referential
    Shared(SharedValue),
    /// Non-owning reference to a shared node
    Weak(WeakValue),
    /// Native resource handle (socket, file descriptor, ...) that cannot be recorded
    Resource(String),
}

impl Value {
    /// Build a mapping from key/value pairs
    #[must_use]
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Self)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build an object instance with the given type name and fields
    #[must_use]
    pub fn object<K, I>(type_name: impl Into<String>, fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Self)>,
    {
        Self::Object(Object {
            type_name: type_name.into(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        })
    }

    /// Wrap this value in a new shared node
    #[must_use]
    pub fn shared(self) -> SharedValue {
        SharedValue::new(self)
    }

    /// Short name of the value's kind, used in log output
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::DateTime(_) => "datetime",
            Self::Duration(_) => "duration",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Object(_) => "object",
            Self::Callable(_) => "callable",
            Self::Shared(_) => "shared",
            Self::Weak(_) => "weak",
            Self::Resource(_) => "resource",
        }
    }
}

/// Instance of a user-defined composite type
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    /// Name of the instance's type
    pub type_name: String,
    /// Attribute values
    pub fields: BTreeMap<String, Value>,
}

/// Identity-bearing, mutable value node
///
/// Equality is identity: two handles are equal only if they point at the
/// same node.
#[derive(Clone)]
pub struct SharedValue(Rc<RefCell<Value>>);

impl SharedValue {
    /// Create a new node holding `value`
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    /// Borrow the node's current content
    #[must_use]
    pub fn borrow(&self) -> Ref<'_, Value> {
        self.0.borrow()
    }

    /// Replace the node's content, returning the previous value
    pub fn replace(&self, value: Value) -> Value {
        self.0.replace(value)
    }

    /// Create a non-owning reference to this node
    #[must_use]
    pub fn downgrade(&self) -> WeakValue {
        WeakValue(Rc::downgrade(&self.0))
    }

    /// Stable identity of the node for the lifetime of the allocation
    #[must_use]
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for SharedValue {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SharedValue {
    // Content is not printed: shared nodes may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedValue({:#x})", self.id())
    }
}

/// Non-owning reference to a [`SharedValue`]
#[derive(Clone)]
pub struct WeakValue(Weak<RefCell<Value>>);

impl WeakValue {
    /// Resolve the reference if the target is still alive
    #[must_use]
    pub fn upgrade(&self) -> Option<SharedValue> {
        self.0.upgrade().map(SharedValue)
    }
}

impl PartialEq for WeakValue {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for WeakValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(target) => write!(f, "WeakValue({:#x})", target.id()),
            None => f.write_str("WeakValue(dead)"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl From<TimeDelta> for Value {
    fn from(v: TimeDelta) -> Self {
        Self::Duration(v)
    }
}

impl From<SharedValue> for Value {
    fn from(v: SharedValue) -> Self {
        Self::Shared(v)
    }
}

impl From<WeakValue> for Value {
    fn from(v: WeakValue) -> Self {
        Self::Weak(v)
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::None, Into::into)
    }
}
