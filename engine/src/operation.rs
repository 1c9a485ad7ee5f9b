//! Operation types and the reduction engine.
//!
//! Every mutation of a record is expressed as an [`Operation`]. Operations on
//! the same key are merged into a single [`ReducedOperation`] so that a save
//! sends at most one change per field. Merging follows an explicit
//! `(pending, incoming)` lookup in [`merge_rule`]; pairs with no sound merge
//! are rejected.

use crate::{
    error::Result,
    value::{concat_elements, wire_number},
    Error, Value,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// Key that tags operation documents on the wire.
pub const OP_KEY: &str = "__op";

/// The kind of change an operation makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Set,
    Delete,
    Increment,
    Add,
    AddUnique,
    Remove,
    AddRelation,
    RemoveRelation,
}

impl OperationKind {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Set => "Set",
            OperationKind::Delete => "Delete",
            OperationKind::Increment => "Increment",
            OperationKind::Add => "Add",
            OperationKind::AddUnique => "AddUnique",
            OperationKind::Remove => "Remove",
            OperationKind::AddRelation => "AddRelation",
            OperationKind::RemoveRelation => "RemoveRelation",
        }
    }

    pub fn is_relation(&self) -> bool {
        matches!(
            self,
            OperationKind::AddRelation | OperationKind::RemoveRelation
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mutation of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// What the operation does
    pub kind: OperationKind,
    /// Field key it targets
    pub key: String,
    /// Payload: the new value for Set, the amount for Increment, an array of
    /// elements for the array and relation kinds, nothing for Delete
    pub value: Option<Value>,
}

impl Operation {
    pub fn new(kind: OperationKind, key: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            kind,
            key: key.into(),
            value,
        }
    }

    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(OperationKind::Set, key, Some(value.into()))
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, key, None)
    }

    pub fn increment(key: impl Into<String>, amount: f64) -> Self {
        Self::new(OperationKind::Increment, key, Some(Value::Number(amount)))
    }

    pub fn add(key: impl Into<String>, elements: Vec<Value>) -> Self {
        Self::new(OperationKind::Add, key, Some(Value::Array(elements)))
    }

    pub fn add_unique(key: impl Into<String>, elements: Vec<Value>) -> Self {
        Self::new(OperationKind::AddUnique, key, Some(Value::Array(elements)))
    }

    pub fn remove(key: impl Into<String>, elements: Vec<Value>) -> Self {
        Self::new(OperationKind::Remove, key, Some(Value::Array(elements)))
    }

    pub fn add_relation(key: impl Into<String>, records: Vec<Value>) -> Self {
        Self::new(OperationKind::AddRelation, key, Some(Value::Array(records)))
    }

    pub fn remove_relation(key: impl Into<String>, records: Vec<Value>) -> Self {
        Self::new(
            OperationKind::RemoveRelation,
            key,
            Some(Value::Array(records)),
        )
    }

    fn amount(&self) -> Result<f64> {
        match &self.value {
            Some(Value::Number(n)) => Ok(*n),
            other => Err(Error::InvalidType(format!(
                "{} on '{}' needs a number, got {}",
                self.kind,
                self.key,
                other.as_ref().map_or("nothing", Value::type_name)
            ))),
        }
    }

    fn elements(&self) -> Result<&[Value]> {
        match &self.value {
            Some(Value::Array(items)) => Ok(items),
            other => Err(Error::InvalidType(format!(
                "{} on '{}' needs an array, got {}",
                self.kind,
                self.key,
                other.as_ref().map_or("nothing", Value::type_name)
            ))),
        }
    }

    /// Class name shared by every record a relation operation references.
    fn relation_target(&self) -> Result<String> {
        let mut target: Option<&str> = None;
        for element in self.elements()? {
            let Value::Record(record) = element else {
                return Err(Error::InvalidType(format!(
                    "relation '{}' can only hold records, got {}",
                    self.key,
                    element.type_name()
                )));
            };
            match target {
                Some(class_name) if class_name != record.class_name() => {
                    return Err(Error::InvalidType(format!(
                        "relation '{}' mixes {} and {}",
                        self.key,
                        class_name,
                        record.class_name()
                    )))
                }
                _ => target = Some(record.class_name()),
            }
        }
        target
            .map(str::to_owned)
            .ok_or_else(|| Error::InvalidType(format!("relation '{}' needs a record", self.key)))
    }

    /// Field value after applying this operation to `current`.
    ///
    /// `None` means the field is absent.
    pub fn apply_to(&self, current: Option<&Value>) -> Result<Option<Value>> {
        match self.kind {
            OperationKind::Set => Ok(self.value.clone()),
            OperationKind::Delete => Ok(None),
            OperationKind::Increment => {
                let amount = Value::Number(self.amount()?);
                match current {
                    None => Ok(Some(amount)),
                    Some(value) => value.add(&amount).map(Some),
                }
            }
            OperationKind::Add | OperationKind::AddUnique => {
                let extra = Value::Array(self.elements()?.to_vec());
                let unique = self.kind == OperationKind::AddUnique;
                current
                    .cloned()
                    .unwrap_or(Value::Array(Vec::new()))
                    .concatenate(&extra, unique)
                    .map(Some)
            }
            OperationKind::Remove => {
                let removed = Value::Array(self.elements()?.to_vec());
                match current {
                    None => Ok(None),
                    Some(value) => value.differ(&removed).map(Some),
                }
            }
            OperationKind::AddRelation | OperationKind::RemoveRelation => {
                let target = self.relation_target()?;
                match current {
                    None if self.kind == OperationKind::RemoveRelation => Ok(None),
                    None => Ok(Some(Value::Relation(crate::Relation {
                        key: self.key.clone(),
                        owner_id: None,
                        target_class: Some(target),
                    }))),
                    Some(Value::Relation(relation)) => {
                        let mut relation = relation.clone();
                        match &relation.target_class {
                            Some(existing) if *existing != target => {
                                return Err(Error::InvalidType(format!(
                                    "relation '{}' points at {}, not {}",
                                    self.key, existing, target
                                )))
                            }
                            _ => relation.target_class = Some(target),
                        }
                        Ok(Some(Value::Relation(relation)))
                    }
                    Some(other) => Err(Error::InvalidType(format!(
                        "'{}' holds {}, not a relation",
                        self.key,
                        other.type_name()
                    ))),
                }
            }
        }
    }

    /// Wire document for this operation.
    pub fn wire_value(&self) -> Result<serde_json::Value> {
        match self.kind {
            OperationKind::Set => self
                .value
                .as_ref()
                .map_or(Ok(serde_json::Value::Null), Value::wire_value),
            OperationKind::Delete => Ok(json!({ OP_KEY: "Delete" })),
            OperationKind::Increment => {
                let amount = wire_number(self.amount()?)?;
                Ok(json!({ OP_KEY: "Increment", "amount": amount }))
            }
            kind => {
                let objects = self
                    .elements()?
                    .iter()
                    .map(Value::wire_value)
                    .collect::<Result<Vec<_>>>()?;
                Ok(json!({ OP_KEY: kind.as_str(), "objects": objects }))
            }
        }
    }
}

/// The merged form of every operation recorded on one key.
#[derive(Debug, Clone, PartialEq)]
pub enum ReducedOperation {
    Single(Operation),
    /// Pending relation additions and removals, kept apart so each can
    /// cancel the other
    Relation {
        key: String,
        additions: Vec<Value>,
        removals: Vec<Value>,
    },
}

impl ReducedOperation {
    fn fresh(op: &Operation) -> Result<Self> {
        if !op.kind.is_relation() {
            return Ok(ReducedOperation::Single(op.clone()));
        }
        let elements = concat_elements(&[], op.elements()?, true);
        let (additions, removals) = match op.kind {
            OperationKind::AddRelation => (elements, Vec::new()),
            _ => (Vec::new(), elements),
        };
        Ok(ReducedOperation::Relation {
            key: op.key.clone(),
            additions,
            removals,
        })
    }

    pub fn key(&self) -> &str {
        match self {
            ReducedOperation::Single(op) => &op.key,
            ReducedOperation::Relation { key, .. } => key,
        }
    }

    /// Kind used when merging. Relation entries report the side that is
    /// pending; both relation kinds merge the same way.
    pub fn kind(&self) -> OperationKind {
        match self {
            ReducedOperation::Single(op) => op.kind,
            ReducedOperation::Relation { additions, .. } if !additions.is_empty() => {
                OperationKind::AddRelation
            }
            ReducedOperation::Relation { .. } => OperationKind::RemoveRelation,
        }
    }

    /// Plain operations equivalent to this entry, in application order.
    pub fn operations(&self) -> Vec<Operation> {
        match self {
            ReducedOperation::Single(op) => vec![op.clone()],
            ReducedOperation::Relation {
                key,
                additions,
                removals,
            } => {
                let mut ops = Vec::new();
                if !additions.is_empty() {
                    ops.push(Operation::add_relation(key.clone(), additions.clone()));
                }
                if !removals.is_empty() {
                    ops.push(Operation::remove_relation(key.clone(), removals.clone()));
                }
                ops
            }
        }
    }

    /// Wire document. A relation entry with both sides pending is sent as a
    /// `Batch`.
    pub fn wire_value(&self) -> Result<serde_json::Value> {
        let mut docs = self
            .operations()
            .iter()
            .map(Operation::wire_value)
            .collect::<Result<Vec<_>>>()?;
        match docs.len() {
            1 => Ok(docs.remove(0)),
            _ => Ok(json!({ OP_KEY: "Batch", "ops": docs })),
        }
    }

    /// Records referenced by the pending payload.
    pub fn values(&self) -> Vec<&Value> {
        match self {
            ReducedOperation::Single(op) => op.value.iter().collect(),
            ReducedOperation::Relation {
                additions,
                removals,
                ..
            } => additions.iter().chain(removals).collect(),
        }
    }
}

/// How an incoming operation combines with the pending one on its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Merge {
    /// The incoming operation replaces the pending one
    Replace,
    /// Collapse into a Set of the in-memory result
    SetApplied,
    /// Keep the pending operation unchanged
    Keep,
    /// Add the increment amounts
    Sum,
    /// Concatenate the element lists
    Concat { unique: bool },
    /// Cancel opposite pending relation entries, then append
    Relation,
    Reject,
}

fn merge_rule(pending: OperationKind, incoming: OperationKind) -> Merge {
    use OperationKind::*;

    match (pending, incoming) {
        (_, Set | Delete) => Merge::Replace,
        (Set | Delete, Increment | Add | AddUnique) => Merge::SetApplied,
        (Set, Remove) => Merge::SetApplied,
        (Delete, Remove) => Merge::Keep,
        (Increment, Increment) => Merge::Sum,
        (Add, Add) => Merge::Concat { unique: false },
        (AddUnique, AddUnique) | (Remove, Remove) => Merge::Concat { unique: true },
        (AddRelation | RemoveRelation, AddRelation | RemoveRelation) => Merge::Relation,
        _ => Merge::Reject,
    }
}

/// Pending operations of one record, one reduced entry per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationTable {
    operations: BTreeMap<String, ReducedOperation>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn get(&self, key: &str) -> Option<&ReducedOperation> {
        self.operations.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ReducedOperation)> {
        self.operations.iter()
    }

    /// Drop every pending entry, after a successful save.
    pub fn reset(&mut self) {
        self.operations.clear();
    }

    /// Compute the entry `op` would leave on its key, without changing the
    /// table. `applied` is the field value after `op` was applied in memory.
    pub fn reduce(&self, op: &Operation, applied: Option<&Value>) -> Result<ReducedOperation> {
        let Some(pending) = self.operations.get(&op.key) else {
            return ReducedOperation::fresh(op);
        };

        let rule = merge_rule(pending.kind(), op.kind);
        tracing::trace!(
            key = %op.key,
            pending = %pending.kind(),
            incoming = %op.kind,
            rule = ?rule,
            "reducing operation"
        );

        match rule {
            Merge::Replace => ReducedOperation::fresh(op),
            Merge::SetApplied => Ok(ReducedOperation::Single(match applied {
                Some(value) => Operation::set(op.key.clone(), value.clone()),
                None => Operation::delete(op.key.clone()),
            })),
            Merge::Keep => Ok(pending.clone()),
            Merge::Sum => {
                let ReducedOperation::Single(existing) = pending else {
                    return Err(self.rejection(pending, op));
                };
                Ok(ReducedOperation::Single(Operation::increment(
                    op.key.clone(),
                    existing.amount()? + op.amount()?,
                )))
            }
            Merge::Concat { unique } => {
                let ReducedOperation::Single(existing) = pending else {
                    return Err(self.rejection(pending, op));
                };
                let elements = concat_elements(existing.elements()?, op.elements()?, unique);
                Ok(ReducedOperation::Single(Operation::new(
                    op.kind,
                    op.key.clone(),
                    Some(Value::Array(elements)),
                )))
            }
            Merge::Relation => {
                let ReducedOperation::Relation {
                    key,
                    additions,
                    removals,
                } = pending
                else {
                    return Err(self.rejection(pending, op));
                };
                let incoming = op.elements()?;
                let (mut same, mut opposite) = match op.kind {
                    OperationKind::AddRelation => (additions.clone(), removals.clone()),
                    _ => (removals.clone(), additions.clone()),
                };
                opposite.retain(|entry| !incoming.iter().any(|e| e.equals(entry)));
                same = concat_elements(&same, incoming, true);

                let (additions, removals) = match op.kind {
                    OperationKind::AddRelation => (same, opposite),
                    _ => (opposite, same),
                };
                Ok(ReducedOperation::Relation {
                    key: key.clone(),
                    additions,
                    removals,
                })
            }
            Merge::Reject => Err(self.rejection(pending, op)),
        }
    }

    fn rejection(&self, pending: &ReducedOperation, op: &Operation) -> Error {
        tracing::warn!(
            key = %op.key,
            pending = %pending.kind(),
            incoming = %op.kind,
            "rejected operation"
        );
        Error::InvalidType(format!(
            "cannot apply {} to '{}' while {} is pending",
            op.kind,
            op.key,
            pending.kind()
        ))
    }

    /// Merge `op` into the table. The table is unchanged on failure.
    pub fn record(&mut self, op: &Operation, applied: Option<&Value>) -> Result<()> {
        let reduced = self.reduce(op, applied)?;
        self.operations.insert(op.key.clone(), reduced);
        Ok(())
    }

    /// Wire map of every pending entry, keyed by field.
    pub fn wire_value(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        self.operations
            .iter()
            .map(|(key, op)| Ok((key.clone(), op.wire_value()?)))
            .collect()
    }
}
