//! Channel & State model (§4.A): typed channels, reducers, and the barrier
//! merge rules that compose per-node partial updates into the next state.
//!
//! A **channel** is a `(field, reducer)` pair. The [`Schema`] declares one
//! reducer per field; [`compose`] is the single public contract nodes and
//! the scheduler rely on to merge a super-step's updates.

pub mod errors;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{FieldName, NodeKind, ReducerKind};

/// Declares, per field, which reducer governs concurrent writes.
///
/// Fields not present in the schema are never valid targets for a
/// [`PartialUpdate`]; writing to one raises [`ChannelError::UnknownField`].
#[derive(Clone, Debug, Default)]
pub struct Schema {
    reducers: FxHashMap<FieldName, ReducerKind>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `field` with the given reducer. Re-declaring a field
    /// overwrites its reducer.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<FieldName>, reducer: ReducerKind) -> Self {
        self.reducers.insert(field.into(), reducer);
        self
    }

    /// Convenience for `with_field(name, ReducerKind::LastValue)`.
    #[must_use]
    pub fn last_value(self, field: impl Into<FieldName>) -> Self {
        self.with_field(field, ReducerKind::LastValue)
    }

    /// Convenience for `with_field(name, ReducerKind::Append)`.
    #[must_use]
    pub fn append(self, field: impl Into<FieldName>) -> Self {
        self.with_field(field, ReducerKind::Append)
    }

    pub fn reducer_for(&self, field: &str) -> Option<ReducerKind> {
        self.reducers.get(field).copied()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.reducers.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldName> {
        self.reducers.keys()
    }
}

/// A partial update returned by a node: a mapping containing only the
/// fields that node owns for this super-step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartialUpdate {
    fields: FxHashMap<FieldName, Value>,
}

impl PartialUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<FieldName>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<FieldName>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldName, &Value)> {
        self.fields.iter()
    }
}

impl From<FxHashMap<FieldName, Value>> for PartialUpdate {
    fn from(fields: FxHashMap<FieldName, Value>) -> Self {
        Self { fields }
    }
}

impl IntoIterator for PartialUpdate {
    type Item = (FieldName, Value);
    type IntoIter = std::collections::hash_map::IntoIter<FieldName, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// The fully-reduced state: a mapping from field name to value, typed by a
/// [`Schema`]. This is what the scheduler persists as `channel_values` in a
/// checkpoint (§4.D).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    values: FxHashMap<FieldName, Value>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: FxHashMap<FieldName, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn set(&mut self, field: impl Into<FieldName>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn contains(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldName, &Value)> {
        self.values.iter()
    }

    pub fn as_map(&self) -> &FxHashMap<FieldName, Value> {
        &self.values
    }

    pub fn into_map(self) -> FxHashMap<FieldName, Value> {
        self.values
    }

    /// A read-only snapshot handed to nodes and routers. Cloning a [`State`]
    /// is cheap relative to the barrier it guards and keeps node bodies from
    /// observing in-flight sibling writes (§4.C ordering guarantee).
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            values: Arc::new(self.values.clone()),
        }
    }
}

/// An immutable, cheaply-cloneable view of [`State`] passed to node bodies
/// and conditional-edge routers.
#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    values: Arc<FxHashMap<FieldName, Value>>,
}

impl StateSnapshot {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldName, &Value)> {
        self.values.iter()
    }

    pub fn as_map(&self) -> &FxHashMap<FieldName, Value> {
        &self.values
    }
}

/// Errors raised while composing a super-step's updates into the next state.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChannelError {
    /// More than one node wrote a `LastValue` field in the same super-step.
    #[error("duplicate write to LastValue field {field:?} by nodes {node_ids:?}")]
    DuplicateWrite {
        field: FieldName,
        node_ids: Vec<String>,
    },
    /// A node returned a field absent from the schema.
    #[error("node {node_id:?} wrote unknown field {field:?}")]
    UnknownField { field: FieldName, node_id: String },
}

/// Compose `current` and a super-step's per-node `updates` into the next
/// state, per §4.A:
///
/// 1. Group updates by field.
/// 2. For each field, look up its reducer. `LastValue` with more than one
///    writer is a fatal [`ChannelError::DuplicateWrite`] naming every
///    contributing node id. `Append` concatenates every writer's
///    contribution, ordered by ascending node id.
/// 3. Fields absent from every update are left unchanged.
///
/// A node contributing an empty [`PartialUpdate`] is a no-op and never
/// participates in duplicate-write detection. A field not declared in the
/// schema is a fatal [`ChannelError::UnknownField`].
pub fn compose(
    schema: &Schema,
    current: &State,
    updates: &[(NodeKind, PartialUpdate)],
) -> Result<State, ChannelError> {
    let mut next = current.clone();

    // field -> sorted (by node id) list of (node_id, value) contributions
    let mut by_field: FxHashMap<FieldName, Vec<(String, Value)>> = FxHashMap::default();

    for (node_id, update) in updates {
        if update.is_empty() {
            continue;
        }
        for (field, value) in update.iter() {
            if !schema.contains(field) {
                return Err(ChannelError::UnknownField {
                    field: field.clone(),
                    node_id: node_id.encode(),
                });
            }
            by_field
                .entry(field.clone())
                .or_default()
                .push((node_id.encode(), value.clone()));
        }
    }

    for (field, mut contributions) in by_field {
        contributions.sort_by(|a, b| a.0.cmp(&b.0));
        match schema.reducer_for(&field).unwrap_or_default() {
            ReducerKind::LastValue => {
                if contributions.len() > 1 {
                    return Err(ChannelError::DuplicateWrite {
                        field,
                        node_ids: contributions.into_iter().map(|(id, _)| id).collect(),
                    });
                }
                let (_, value) = contributions.into_iter().next().expect("non-empty group");
                next.set(field, value);
            }
            ReducerKind::Append => {
                let mut merged: Vec<Value> = match current.get(&field) {
                    Some(Value::Array(existing)) => existing.clone(),
                    _ => Vec::new(),
                };
                for (_, value) in contributions {
                    match value {
                        Value::Array(items) => merged.extend(items),
                        other => merged.push(other),
                    }
                }
                next.set(field, Value::Array(merged));
            }
        }
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new().last_value("output").append("events")
    }

    #[test]
    fn last_value_single_writer_applies() {
        let current = State::new();
        let updates = vec![(
            NodeKind::Custom("process".into()),
            PartialUpdate::new().with("output", "hi"),
        )];
        let next = compose(&schema(), &current, &updates).unwrap();
        assert_eq!(next.get("output"), Some(&Value::String("hi".into())));
    }

    #[test]
    fn last_value_duplicate_write_errors() {
        let current = State::new();
        let updates = vec![
            (
                NodeKind::Custom("b".into()),
                PartialUpdate::new().with("output", "from-b"),
            ),
            (
                NodeKind::Custom("a".into()),
                PartialUpdate::new().with("output", "from-a"),
            ),
        ];
        let err = compose(&schema(), &current, &updates).unwrap_err();
        match err {
            ChannelError::DuplicateWrite { field, node_ids } => {
                assert_eq!(field, "output");
                assert_eq!(node_ids, vec!["Custom:a".to_string(), "Custom:b".to_string()]);
            }
            _ => panic!("expected DuplicateWrite"),
        }
    }

    #[test]
    fn append_concatenates_in_node_id_order() {
        let current = State::new();
        let updates = vec![
            (
                NodeKind::Custom("b".into()),
                PartialUpdate::new().with("events", Value::Array(vec![Value::String("b".into())])),
            ),
            (
                NodeKind::Custom("a".into()),
                PartialUpdate::new().with("events", Value::Array(vec![Value::String("a".into())])),
            ),
        ];
        let next = compose(&schema(), &current, &updates).unwrap();
        assert_eq!(
            next.get("events"),
            Some(&Value::Array(vec![
                Value::String("a".into()),
                Value::String("b".into())
            ]))
        );
    }

    #[test]
    fn empty_update_is_noop_and_never_conflicts() {
        let current = State::new();
        let updates = vec![
            (NodeKind::Custom("a".into()), PartialUpdate::new()),
            (NodeKind::Custom("b".into()), PartialUpdate::new()),
        ];
        let next = compose(&schema(), &current, &updates).unwrap();
        assert_eq!(next, current);
    }

    #[test]
    fn unknown_field_errors() {
        let current = State::new();
        let updates = vec![(
            NodeKind::Custom("a".into()),
            PartialUpdate::new().with("not_in_schema", "x"),
        )];
        let err = compose(&schema(), &current, &updates).unwrap_err();
        assert!(matches!(err, ChannelError::UnknownField { .. }));
    }
}
