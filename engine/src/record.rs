//! Records and their shared handles.
//!
//! A [`Record`] is a dynamically typed object of one class. Its fields are
//! only changed through mutation methods, each of which applies an
//! [`Operation`] in memory and merges it into the pending
//! [`OperationTable`]. Records reference each other through [`RecordRef`]
//! handles, which may form arbitrary graphs.

use crate::{
    error::Result,
    operation::{Operation, OperationTable},
    value::TYPE_KEY,
    ClassName, Error, ObjectId, Query, Relation, Value,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

pub const OBJECT_ID: &str = "objectId";
pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";
pub const CLASS_NAME: &str = "className";
pub const ACL: &str = "ACL";

const RESERVED_KEYS: [&str; 4] = [OBJECT_ID, CREATED_AT, UPDATED_AT, CLASS_NAME];

static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][A-Za-z0-9_]*$").expect("key pattern is a valid regex")
});

/// Check that `key` may be mutated by application code.
pub fn validate_key(key: &str) -> Result<()> {
    if RESERVED_KEYS.contains(&key) {
        return Err(Error::MalformedData(format!("key '{key}' is reserved")));
    }
    if !KEY_PATTERN.is_match(key) {
        return Err(Error::MalformedData(format!(
            "key '{key}' is not well-formatted"
        )));
    }
    Ok(())
}

/// Process-local identity of a record, never sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternalId(Uuid);

impl InternalId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Object ID readable without locking the record it belongs to.
type ObjectIdSlot = Arc<RwLock<Option<ObjectId>>>;

/// A dynamically typed object.
#[derive(Debug)]
pub struct Record {
    class_name: ClassName,
    internal_id: InternalId,
    fields: BTreeMap<String, Value>,
    operations: OperationTable,
    /// Mirrors the `objectId` field for every handle sharing this record
    object_id_slot: ObjectIdSlot,
}

impl Record {
    /// Create a new, unsaved record.
    pub fn new(class_name: impl Into<ClassName>) -> Self {
        Self {
            class_name: class_name.into(),
            internal_id: InternalId::new(),
            fields: BTreeMap::new(),
            operations: OperationTable::new(),
            object_id_slot: Arc::default(),
        }
    }

    /// Create a reference to a record that already exists on the backend.
    pub fn with_object_id(class_name: impl Into<ClassName>, object_id: impl Into<ObjectId>) -> Self {
        let mut record = Self::new(class_name);
        record.store_field(OBJECT_ID, Value::String(object_id.into()));
        record
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn internal_id(&self) -> InternalId {
        self.internal_id
    }

    pub fn object_id(&self) -> Option<&str> {
        self.fields.get(OBJECT_ID).and_then(Value::as_str)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.date_field(CREATED_AT)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.date_field(UPDATED_AT)
    }

    fn date_field(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.fields.get(key) {
            Some(Value::Date(date)) => Some(*date),
            _ => None,
        }
    }

    pub fn acl(&self) -> Option<&Value> {
        self.fields.get(ACL)
    }

    /// A record is new until the backend assigns it an object ID.
    pub fn is_new(&self) -> bool {
        self.object_id().is_none()
    }

    pub fn has_pending_changes(&self) -> bool {
        self.is_new() || !self.operations.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Field values, the record's direct children in the object graph.
    pub fn children(&self) -> impl Iterator<Item = &Value> {
        self.fields.values()
    }

    pub fn operations(&self) -> &OperationTable {
        &self.operations
    }

    /// Forget pending operations, once the backend has accepted them.
    pub fn reset_operations(&mut self) {
        self.operations.reset();
    }

    /// Store a value as received from the backend, without recording an
    /// operation.
    pub(crate) fn store_field(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key == OBJECT_ID {
            *self
                .object_id_slot
                .write()
                .unwrap_or_else(PoisonError::into_inner) = value.as_str().map(str::to_owned);
        }
        self.fields.insert(key, value);
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        validate_key(key)?;
        self.record_operation(Operation::set(key, value))
    }

    pub fn unset(&mut self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.record_operation(Operation::delete(key))
    }

    pub fn increase(&mut self, key: &str, amount: f64) -> Result<()> {
        validate_key(key)?;
        self.record_operation(Operation::increment(key, amount))
    }

    /// Append elements to an array field, skipping those already present
    /// when `unique` is set.
    pub fn append(&mut self, key: &str, elements: Vec<Value>, unique: bool) -> Result<()> {
        validate_key(key)?;
        let op = if unique {
            Operation::add_unique(key, elements)
        } else {
            Operation::add(key, elements)
        };
        self.record_operation(op)
    }

    pub fn remove(&mut self, key: &str, elements: Vec<Value>) -> Result<()> {
        validate_key(key)?;
        self.record_operation(Operation::remove(key, elements))
    }

    pub fn insert_relation(&mut self, key: &str, record: &RecordRef) -> Result<()> {
        validate_key(key)?;
        self.record_operation(Operation::add_relation(
            key,
            vec![Value::Record(record.clone())],
        ))
    }

    pub fn remove_relation(&mut self, key: &str, record: &RecordRef) -> Result<()> {
        validate_key(key)?;
        self.record_operation(Operation::remove_relation(
            key,
            vec![Value::Record(record.clone())],
        ))
    }

    /// Replace the access control list. `ACL` is the one upper-case key
    /// application code may write.
    pub fn set_acl(&mut self, acl: BTreeMap<String, Value>) -> Result<()> {
        self.record_operation(Operation::set(ACL, Value::Map(acl)))
    }

    /// Apply `op` in memory and merge it into the pending table. Nothing
    /// changes when either step fails.
    fn record_operation(&mut self, op: Operation) -> Result<()> {
        let applied = op.apply_to(self.fields.get(&op.key))?;
        self.operations.record(&op, applied.as_ref())?;

        tracing::debug!(
            class = %self.class_name,
            key = %op.key,
            kind = %op.kind,
            "recorded operation"
        );

        match applied {
            Some(value) => self.fields.insert(op.key, value),
            None => self.fields.remove(&op.key),
        };
        Ok(())
    }

    /// The relation stored under `key`, or an empty one if nothing is there
    /// yet.
    pub fn relation(&self, key: &str) -> Result<Relation> {
        validate_key(key)?;
        let mut relation = match self.fields.get(key) {
            Some(Value::Relation(relation)) => relation.clone(),
            None => Relation::new(key),
            Some(other) => {
                return Err(Error::InvalidType(format!(
                    "'{key}' holds {}, not a relation",
                    other.type_name()
                )))
            }
        };
        relation.owner_id = self.object_id().map(str::to_owned);
        Ok(relation)
    }

    /// Query over the records related to this one through `key`.
    pub fn relation_query(&self, key: &str) -> Result<Query> {
        Query::for_relation(self, key)
    }

    /// Pointer document, available once the record is persisted.
    pub fn pointer(&self) -> Result<serde_json::Value> {
        let object_id = self.object_id().ok_or_else(|| {
            Error::InvalidType(format!(
                "{} record has no object ID and cannot be referenced",
                self.class_name
            ))
        })?;
        Ok(pointer_json(&self.class_name, object_id))
    }

    /// Full JSON document, nested records included.
    pub fn json_value(&self) -> serde_json::Value {
        self.json_document(&mut vec![self.internal_id])
    }

    fn json_document(&self, path: &mut Vec<InternalId>) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        doc.insert(TYPE_KEY.into(), "Object".into());
        doc.insert(CLASS_NAME.into(), self.class_name.clone().into());
        for (key, value) in &self.fields {
            doc.insert(key.clone(), value.json_value_on_path(path));
        }
        serde_json::Value::Object(doc)
    }

    /// Every record referenced by a field or a pending operation, looking
    /// through arrays and maps but not into other records.
    pub fn referenced_records(&self) -> Vec<RecordRef> {
        let mut found = Vec::new();
        let pending = self
            .operations
            .iter()
            .flat_map(|(_, op)| op.values());
        for value in self.fields.values().chain(pending) {
            collect_records(value, &mut found);
        }
        found
    }
}

fn collect_records(value: &Value, found: &mut Vec<RecordRef>) {
    match value {
        Value::Record(record) => found.push(record.clone()),
        other => other.children().for_each(|child| collect_records(child, found)),
    }
}

pub(crate) fn pointer_json(class_name: &str, object_id: &str) -> serde_json::Value {
    json!({
        TYPE_KEY: "Pointer",
        CLASS_NAME: class_name,
        OBJECT_ID: object_id,
    })
}

/// Persisted records are equal when class and object ID match; new records
/// compare field by field.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        if self.class_name != other.class_name {
            return false;
        }
        match (self.object_id(), other.object_id()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => {
                self.fields.len() == other.fields.len()
                    && self
                        .fields
                        .iter()
                        .all(|(key, a)| other.fields.get(key).is_some_and(|b| a.equals(b)))
            }
            _ => false,
        }
    }
}

/// Shared handle to a record.
///
/// Cloning the handle shares the record. The identity token and class name
/// never change, and the object ID lives in its own slot, so all three are
/// readable while another thread holds the record lock.
#[derive(Clone)]
pub struct RecordRef {
    internal_id: InternalId,
    class_name: ClassName,
    object_id_slot: ObjectIdSlot,
    inner: Arc<RwLock<Record>>,
}

impl RecordRef {
    pub fn new(record: Record) -> Self {
        Self {
            internal_id: record.internal_id,
            class_name: record.class_name.clone(),
            object_id_slot: Arc::clone(&record.object_id_slot),
            inner: Arc::new(RwLock::new(record)),
        }
    }

    pub fn internal_id(&self) -> InternalId {
        self.internal_id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Record> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Record> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles share the same record.
    pub fn ptr_eq(&self, other: &RecordRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.peek_object_id()
    }

    pub fn pointer(&self) -> Result<serde_json::Value> {
        self.read().pointer()
    }

    /// Object ID without touching the record lock.
    fn peek_object_id(&self) -> Option<ObjectId> {
        self.object_id_slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Identity, or matching class and object ID when both are persisted.
    pub(crate) fn same_record(&self, other: &RecordRef) -> bool {
        if self.ptr_eq(other) || self.internal_id == other.internal_id {
            return true;
        }
        if self.class_name != other.class_name {
            return false;
        }
        match (self.peek_object_id(), other.peek_object_id()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    pub(crate) fn json_value_on_path(&self, path: &mut Vec<InternalId>) -> serde_json::Value {
        if path.contains(&self.internal_id) {
            let mut stub = serde_json::Map::new();
            stub.insert(TYPE_KEY.into(), "Pointer".into());
            stub.insert(CLASS_NAME.into(), self.class_name.clone().into());
            if let Some(object_id) = self.peek_object_id() {
                stub.insert(OBJECT_ID.into(), object_id.into());
            }
            return serde_json::Value::Object(stub);
        }

        path.push(self.internal_id);
        let doc = self.read().json_document(path);
        path.pop();
        doc
    }
}

impl From<Record> for RecordRef {
    fn from(record: Record) -> Self {
        Self::new(record)
    }
}

impl fmt::Debug for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordRef")
            .field("class_name", &self.class_name)
            .field("internal_id", &self.internal_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::ReducedOperation;

    #[test]
    fn new_record_is_new_and_pending() {
        let record = Record::new("Todo");
        assert!(record.is_new());
        assert!(record.has_pending_changes());
        assert!(record.operations().is_empty());

        let saved = Record::with_object_id("Todo", "abc");
        assert!(!saved.is_new());
        assert!(!saved.has_pending_changes());
        assert_eq!(saved.object_id(), Some("abc"));
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("title").is_ok());
        assert!(validate_key("dueDate").is_ok());
        assert!(validate_key("2fa_enabled").is_ok());

        for key in ["", "Title", "_private", "has space", "objectId", "className"] {
            assert!(
                matches!(validate_key(key), Err(Error::MalformedData(_))),
                "{key} should be rejected"
            );
        }
    }

    #[test]
    fn malformed_key_queues_nothing() {
        let mut record = Record::with_object_id("Todo", "abc");
        assert!(matches!(
            record.set("Bad Key", 1),
            Err(Error::MalformedData(_))
        ));
        assert!(matches!(
            record.set("createdAt", 1),
            Err(Error::MalformedData(_))
        ));
        assert!(record.operations().is_empty());
        assert!(!record.has_pending_changes());
    }

    #[test]
    fn mutations_apply_in_memory() {
        let mut record = Record::with_object_id("Todo", "abc");
        record.set("priority", 1).unwrap();
        record.increase("priority", 2.0).unwrap();
        record
            .set("tags", Value::Array(vec!["a".into(), "b".into()]))
            .unwrap();
        record.remove("tags", vec!["a".into()]).unwrap();

        assert_eq!(record.get("priority"), Some(&Value::from(3)));
        assert_eq!(record.get("tags"), Some(&Value::Array(vec!["b".into()])));
        assert_eq!(
            record.operations().get("priority"),
            Some(&ReducedOperation::Single(Operation::set("priority", 3)))
        );
        assert!(record.has_pending_changes());
    }

    #[test]
    fn failed_mutation_leaves_record_untouched() {
        let mut record = Record::with_object_id("Todo", "abc");
        record.set("title", "x").unwrap();

        let err = record.increase("title", 1.0).unwrap_err();
        assert!(matches!(err, Error::InvalidType(_)));
        assert_eq!(record.get("title"), Some(&Value::from("x")));
        assert_eq!(
            record.operations().get("title"),
            Some(&ReducedOperation::Single(Operation::set("title", "x")))
        );
    }

    #[test]
    fn unset_removes_field() {
        let mut record = Record::new("Todo");
        record.set("title", "x").unwrap();
        record.unset("title").unwrap();
        assert!(record.get("title").is_none());
    }

    #[test]
    fn acl_bypasses_key_pattern() {
        let mut record = Record::new("Todo");
        let mut acl = BTreeMap::new();
        let read = BTreeMap::from([("read".to_string(), Value::Bool(true))]);
        acl.insert("*".to_string(), Value::Map(read));
        record.set_acl(acl).unwrap();
        assert!(record.acl().is_some());
    }

    #[test]
    fn relation_tracks_target_and_owner() {
        let mut owner = Record::with_object_id("Post", "p1");
        let tag = RecordRef::new(Record::with_object_id("Tag", "t1"));
        owner.insert_relation("tags", &tag).unwrap();

        let relation = owner.relation("tags").unwrap();
        assert_eq!(relation.target_class.as_deref(), Some("Tag"));
        assert_eq!(relation.owner_id.as_deref(), Some("p1"));

        owner.set("title", "hello").unwrap();
        assert!(matches!(
            owner.relation("title"),
            Err(Error::InvalidType(_))
        ));
    }

    #[test]
    fn equality_by_object_id_or_fields() {
        let mut a = Record::with_object_id("Todo", "1");
        a.set("title", "x").unwrap();
        let b = Record::with_object_id("Todo", "1");
        assert_eq!(a, b);

        let mut c = Record::new("Todo");
        c.set("title", "x").unwrap();
        let mut d = Record::new("Todo");
        d.set("title", "x").unwrap();
        assert_eq!(c, d);

        d.set("done", true).unwrap();
        assert_ne!(c, d);
    }

    #[test]
    fn handle_identity() {
        let a = RecordRef::new(Record::new("Todo"));
        let b = a.clone();
        let c = RecordRef::new(Record::new("Todo"));

        assert!(a.ptr_eq(&b));
        assert!(Value::Record(a.clone()).equals(&Value::Record(b)));
        assert!(!Value::Record(a).equals(&Value::Record(c)));

        let x = RecordRef::new(Record::with_object_id("Todo", "1"));
        let y = RecordRef::new(Record::with_object_id("Todo", "1"));
        assert!(Value::Record(x).equals(&Value::Record(y)));
    }

    #[test]
    fn equality_ignores_foreign_write_lock() {
        let x = RecordRef::new(Record::with_object_id("Todo", "1"));
        let y = RecordRef::new(Record::with_object_id("Todo", "1"));

        let _held = x.write();
        assert!(Value::Record(x.clone()).equals(&Value::Record(y.clone())));
        assert_eq!(x.object_id().as_deref(), Some("1"));

        let mut owner = Record::with_object_id("List", "l1");
        owner.append("refs", vec![y.into()], true).unwrap();
        owner.append("refs", vec![x.clone().into()], true).unwrap();
        assert_eq!(
            owner.get("refs").and_then(Value::as_array).map(<[Value]>::len),
            Some(1)
        );
    }

    #[test]
    fn handle_sees_assigned_object_id() {
        let handle = RecordRef::new(Record::new("Todo"));
        assert_eq!(handle.object_id(), None);

        let mut guard = handle.write();
        guard.store_field(OBJECT_ID, Value::from("t1"));
        assert_eq!(handle.object_id().as_deref(), Some("t1"));
    }

    #[test]
    fn self_reference_renders_as_stub() {
        let record = RecordRef::new(Record::with_object_id("Node", "n1"));
        record
            .write()
            .set("next", Value::Record(record.clone()))
            .unwrap();

        let doc = Value::Record(record.clone()).json_value();
        assert_eq!(doc["__type"], "Object");
        assert_eq!(doc["next"]["__type"], "Pointer");
        assert_eq!(doc["next"]["objectId"], "n1");
    }

    #[test]
    fn pointer_requires_object_id() {
        assert!(matches!(
            Record::new("Todo").pointer(),
            Err(Error::InvalidType(_))
        ));
        assert_eq!(
            Record::with_object_id("Todo", "1").pointer().unwrap()["objectId"],
            "1"
        );
    }

    #[test]
    fn referenced_records_include_pending_relations() {
        let mut owner = Record::with_object_id("Post", "p1");
        let author = RecordRef::new(Record::new("User"));
        let tag = RecordRef::new(Record::with_object_id("Tag", "t1"));
        owner
            .set("meta", Value::Array(vec![Value::Record(author.clone())]))
            .unwrap();
        owner.insert_relation("tags", &tag).unwrap();

        let found = owner.referenced_records();
        assert!(found.iter().any(|r| r.ptr_eq(&author)));
        assert!(found.iter().any(|r| r.ptr_eq(&tag)));
    }

    #[test]
    fn numbers_in_documents() {
        let mut record = Record::new("Todo");
        record.set("count", 2).unwrap();
        assert_eq!(record.json_value()["count"], json!(2));
    }
}
