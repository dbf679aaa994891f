//! Flow state and step key access sets
//!
//! [`FlowState`] is the record threaded through every step of a flow. It is a
//! JSON object behind an [`Arc`], so cloning a state is a pointer copy and
//! concurrent steps of one parallel group all read the same snapshot. Writes go
//! through [`Arc::make_mut`], copying the map only when it is shared.
//!
//! Steps report their results as a [`StateUpdate`]: either a patch of keys to
//! merge (last write wins) or a complete replacement state.
//!
//! [`Access`] describes which keys a step reads or writes. The planner uses
//! these sets to decide which consecutive steps may share a parallel group.
//!
//! # Example
//!
//! ```rust
//! use flowcraft_core::FlowState;
//! use serde_json::json;
//!
//! let base = FlowState::from_value(json!({"question": "why?"})).unwrap();
//! let next = base.with("answer", json!("because"));
//!
//! assert!(base.get("answer").is_none());
//! assert_eq!(next.get("answer"), Some(&json!("because")));
//! assert_eq!(next.diff(&base).len(), 1);
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{FlowError, Result};

/// Structurally shared key/value record passed between steps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowState(Arc<Map<String, Value>>);

impl FlowState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a JSON value, which must be an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(Arc::new(map))),
            Value::Null => Ok(Self::new()),
            other => Err(FlowError::state(format!(
                "flow state must be a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Serialize any value into a state
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Look up a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Deserialize a single key into `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .get(key)
            .ok_or_else(|| FlowError::state(format!("missing state key '{}'", key)))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Whether the key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate over the keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Insert a key, copying the map first if it is shared
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        Arc::make_mut(&mut self.0).insert(key.into(), value.into());
    }

    /// Return a new state with one key set, leaving `self` untouched
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.insert(key, value);
        next
    }

    /// Shallow merge: every key of `patch` overwrites or adds to this state
    pub fn merge(&mut self, patch: Map<String, Value>) {
        if patch.is_empty() {
            return;
        }
        let map = Arc::make_mut(&mut self.0);
        for (key, value) in patch {
            map.insert(key, value);
        }
    }

    /// Keys that are new or changed relative to `base`
    pub fn diff(&self, base: &FlowState) -> Map<String, Value> {
        if Arc::ptr_eq(&self.0, &base.0) {
            return Map::new();
        }
        self.0
            .iter()
            .filter(|(key, value)| base.get(key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Whether two states share the same storage
    pub fn shares_storage(&self, other: &FlowState) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Deserialize the whole state into `T`
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_value())?)
    }

    /// Clone the state into a JSON object value
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.as_ref().clone())
    }

    /// Convert into a JSON object value without copying when unshared
    pub fn into_value(self) -> Value {
        Value::Object(Arc::try_unwrap(self.0).unwrap_or_else(|shared| shared.as_ref().clone()))
    }
}

impl From<Map<String, Value>> for FlowState {
    fn from(map: Map<String, Value>) -> Self {
        Self(Arc::new(map))
    }
}

impl From<FlowState> for Value {
    fn from(state: FlowState) -> Self {
        state.into_value()
    }
}

impl Serialize for FlowState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FlowState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Map::<String, Value>::deserialize(deserializer).map(Self::from)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Result of a single step
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// Keys to merge into the current state
    Patch(Map<String, Value>),
    /// A complete new state
    Replace(FlowState),
}

impl StateUpdate {
    /// A patch setting one key
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut patch = Map::new();
        patch.insert(key.into(), value.into());
        Self::Patch(patch)
    }

    /// A patch that changes nothing
    pub fn unchanged() -> Self {
        Self::Patch(Map::new())
    }

    /// Apply the update as the only result of its group
    pub fn apply(self, state: &mut FlowState) {
        match self {
            Self::Patch(patch) => state.merge(patch),
            Self::Replace(next) => *state = next,
        }
    }

    /// Reduce to a patch relative to the snapshot the step started from
    pub fn into_patch(self, base: &FlowState) -> Map<String, Value> {
        match self {
            Self::Patch(patch) => patch,
            Self::Replace(next) => next.diff(base),
        }
    }
}

impl From<FlowState> for StateUpdate {
    fn from(state: FlowState) -> Self {
        Self::Replace(state)
    }
}

impl From<Map<String, Value>> for StateUpdate {
    fn from(patch: Map<String, Value>) -> Self {
        Self::Patch(patch)
    }
}

/// Set of state keys a step reads or writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// Every key, known or not
    All,
    /// Exactly these keys
    Keys(BTreeSet<String>),
}

impl Access {
    /// The empty set
    pub fn none() -> Self {
        Self::Keys(BTreeSet::new())
    }

    /// A finite set of keys
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Keys(keys.into_iter().map(Into::into).collect())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Keys(keys) if keys.is_empty())
    }

    pub fn contains(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Keys(keys) => keys.contains(key),
        }
    }

    /// Whether the two sets share at least one key
    ///
    /// `All` overlaps every non-empty set, including another `All`.
    pub fn intersects(&self, other: &Access) -> bool {
        match (self, other) {
            (Self::All, Self::All) => true,
            (Self::All, Self::Keys(keys)) | (Self::Keys(keys), Self::All) => !keys.is_empty(),
            (Self::Keys(a), Self::Keys(b)) => {
                let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
                small.iter().any(|key| large.contains(key))
            }
        }
    }

    /// Grow this set by `other`
    pub fn extend(&mut self, other: &Access) {
        match other {
            Self::All => *self = Self::All,
            Self::Keys(more) => {
                if let Self::Keys(keys) = self {
                    keys.extend(more.iter().cloned());
                }
            }
        }
    }

    /// Union of two sets
    pub fn union(&self, other: &Access) -> Access {
        let mut merged = self.clone();
        merged.extend(other);
        merged
    }

    /// The explicit keys, or `None` for `All`
    pub fn key_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::All => None,
            Self::Keys(keys) => Some(keys),
        }
    }
}

impl Default for Access {
    fn default() -> Self {
        Self::none()
    }
}
