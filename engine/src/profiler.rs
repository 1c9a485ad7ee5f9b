//! Object profiler.
//!
//! Converts records to and from wire documents, validates record graphs
//! before they are sent, and works out which records a save has to persist.

use crate::{
    error::Result,
    record::{InternalId, CLASS_NAME, CREATED_AT, OBJECT_ID, UPDATED_AT},
    value::{decode_base64, parse_date, TYPE_KEY},
    ClassRegistry, Error, GeoPoint, ObjectId, Record, RecordRef, Relation, Value,
};
use std::collections::{BTreeMap, HashSet};

/// Wire document of a record body.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Where a value is decoded, so nested relations know their owner.
struct FieldContext<'a> {
    key: &'a str,
    owner_id: Option<&'a str>,
}

/// Encodes, decodes and validates records.
#[derive(Debug, Clone, Default)]
pub struct ObjectProfiler {
    registry: ClassRegistry,
}

impl ObjectProfiler {
    pub fn new(registry: ClassRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    /// Body to send when saving `record`.
    ///
    /// A new record sends its literal fields, except that pending relation
    /// changes go out as operations. A persisted record sends its reduced
    /// operations, which is an empty document when nothing changed.
    pub fn serialize(&self, record: &Record) -> Result<Document> {
        let mut path = Vec::new();
        walk_record(record, &mut path)?;

        let operations = record.operations();
        if !record.is_new() {
            return operations.wire_value();
        }

        let mut doc = Document::new();
        for (key, value) in record.fields() {
            let encoded = match operations.get(key) {
                Some(op) if op.kind().is_relation() => op.wire_value()?,
                _ => value.wire_value()?,
            };
            doc.insert(key.clone(), encoded);
        }
        Ok(doc)
    }

    /// Build a record from a wire document.
    ///
    /// The class comes from `className`, then `known_class`, then the
    /// registry default.
    pub fn deserialize(
        &self,
        doc: &serde_json::Value,
        known_class: Option<&str>,
    ) -> Result<RecordRef> {
        let object = doc.as_object().ok_or_else(|| {
            Error::MalformedData(format!("expected an object document, got {doc}"))
        })?;
        let class_name = object
            .get(CLASS_NAME)
            .and_then(serde_json::Value::as_str)
            .or(known_class)
            .unwrap_or_else(|| self.registry.default_class());

        let mut record = self.registry.instantiate(class_name);
        self.update_record(&mut record, object)?;
        Ok(RecordRef::new(record))
    }

    /// Merge a backend document into `record` without recording operations.
    ///
    /// Every field is decoded before any is stored, so a malformed document
    /// leaves the record unchanged.
    pub fn update_record(&self, record: &mut Record, doc: &Document) -> Result<()> {
        let owner_id: Option<ObjectId> = doc
            .get(OBJECT_ID)
            .and_then(serde_json::Value::as_str)
            .or(record.object_id())
            .map(str::to_owned);

        let mut decoded = Vec::with_capacity(doc.len());
        for (key, raw) in doc {
            let value = match key.as_str() {
                TYPE_KEY | CLASS_NAME => continue,
                OBJECT_ID => match raw.as_str() {
                    Some(id) => Value::String(id.to_owned()),
                    None => {
                        return Err(Error::MalformedData(format!(
                            "objectId must be a string, got {raw}"
                        )))
                    }
                },
                CREATED_AT | UPDATED_AT => self.decode_timestamp(key, raw)?,
                _ => {
                    let context = FieldContext {
                        key,
                        owner_id: owner_id.as_deref(),
                    };
                    self.decode(raw, &context)?
                }
            };
            decoded.push((key.clone(), value));
        }

        for (key, value) in decoded {
            record.store_field(key, value);
        }
        Ok(())
    }

    /// Decode a wire value outside of any record.
    pub fn decode_value(&self, raw: &serde_json::Value) -> Result<Value> {
        self.decode(
            raw,
            &FieldContext {
                key: "",
                owner_id: None,
            },
        )
    }

    /// Timestamps arrive either as bare ISO strings or as Date documents.
    fn decode_timestamp(&self, key: &str, raw: &serde_json::Value) -> Result<Value> {
        match raw {
            serde_json::Value::String(iso) => parse_date(iso).map(Value::Date),
            _ => match self.decode_value(raw)? {
                date @ Value::Date(_) => Ok(date),
                other => Err(Error::MalformedData(format!(
                    "{key} must be a date, got {}",
                    other.type_name()
                ))),
            },
        }
    }

    fn decode(&self, raw: &serde_json::Value, context: &FieldContext<'_>) -> Result<Value> {
        use serde_json::Value as Json;

        match raw {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| Error::MalformedData(format!("number {n} is out of range"))),
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Array(items) => items
                .iter()
                .map(|item| self.decode(item, context))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Json::Object(map) => match map.get(TYPE_KEY).and_then(Json::as_str) {
                None => map
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), self.decode(item, context)?)))
                    .collect::<Result<BTreeMap<_, _>>>()
                    .map(Value::Map),
                Some("Bytes") => {
                    let encoded = required_str(map, "base64", "Bytes")?;
                    decode_base64(encoded).map(Value::Bytes)
                }
                Some("Date") => parse_date(required_str(map, "iso", "Date")?).map(Value::Date),
                Some("GeoPoint") => {
                    let latitude = required_f64(map, "latitude", "GeoPoint")?;
                    let longitude = required_f64(map, "longitude", "GeoPoint")?;
                    Ok(Value::GeoPoint(GeoPoint::new(latitude, longitude)))
                }
                Some("Pointer") => {
                    let class_name = required_str(map, CLASS_NAME, "Pointer")?;
                    let object_id = required_str(map, OBJECT_ID, "Pointer")?;
                    // Unfetched stub: constructor defaults are not server data
                    let record = Record::with_object_id(class_name, object_id);
                    Ok(Value::Record(RecordRef::new(record)))
                }
                Some("Object") => {
                    let class_name = required_str(map, CLASS_NAME, "Object")?;
                    self.deserialize(raw, Some(class_name)).map(Value::Record)
                }
                Some("Relation") => Ok(Value::Relation(Relation {
                    key: context.key.to_owned(),
                    owner_id: context.owner_id.map(str::to_owned),
                    target_class: map
                        .get(CLASS_NAME)
                        .and_then(Json::as_str)
                        .map(str::to_owned),
                })),
                Some(other) => Err(Error::MalformedData(format!(
                    "unknown wire type '{other}'"
                ))),
            },
        }
    }

    /// Fail if `record` can reach itself through its fields.
    ///
    /// Reaching one record through several independent paths is fine; only
    /// a record that appears twice on the same path is a cycle.
    pub fn validate_circular_reference(&self, record: &RecordRef) -> Result<()> {
        let mut path = Vec::new();
        walk_value(&Value::Record(record.clone()), &mut path)
    }

    /// Records reachable from `root`, root included, that have pending
    /// changes. Children come before the records that reference them.
    pub fn collect_pending(&self, root: &RecordRef) -> Result<Vec<RecordRef>> {
        self.validate_circular_reference(root)?;

        let mut visited = HashSet::new();
        let mut pending = Vec::new();
        visit_pending(root, &mut visited, &mut pending);
        Ok(pending)
    }
}

fn required_str<'a>(map: &'a Document, key: &str, kind: &str) -> Result<&'a str> {
    map.get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::MalformedData(format!("{kind} document is missing '{key}'")))
}

fn required_f64(map: &Document, key: &str, kind: &str) -> Result<f64> {
    map.get(key)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| Error::MalformedData(format!("{kind} document is missing '{key}'")))
}

fn walk_record(record: &Record, path: &mut Vec<InternalId>) -> Result<()> {
    path.push(record.internal_id());
    for child in record.children() {
        walk_value(child, path)?;
    }
    path.pop();
    Ok(())
}

fn walk_value(value: &Value, path: &mut Vec<InternalId>) -> Result<()> {
    match value {
        Value::Record(record) => {
            if path.contains(&record.internal_id()) {
                return Err(Error::CircularReference(format!(
                    "{} record {} refers back to itself",
                    record.class_name(),
                    record.internal_id()
                )));
            }
            let guard = record.read();
            walk_record(&guard, path)
        }
        other => other.children().try_for_each(|child| walk_value(child, path)),
    }
}

fn visit_pending(record: &RecordRef, visited: &mut HashSet<InternalId>, out: &mut Vec<RecordRef>) {
    if !visited.insert(record.internal_id()) {
        return;
    }
    let children = record.read().referenced_records();
    for child in &children {
        visit_pending(child, visited, out);
    }
    if record.read().has_pending_changes() {
        out.push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profiler() -> ObjectProfiler {
        ObjectProfiler::default()
    }

    #[test]
    fn new_record_serializes_literals() {
        let mut record = Record::new("Todo");
        record.set("title", "write tests").unwrap();
        record.increase("priority", 2.0).unwrap();
        record
            .append("tags", vec!["a".into(), "a".into()], true)
            .unwrap();

        let doc = profiler().serialize(&record).unwrap();
        assert_eq!(
            serde_json::Value::Object(doc),
            json!({"title": "write tests", "priority": 2, "tags": ["a"]})
        );
    }

    #[test]
    fn persisted_record_serializes_operations() {
        let mut record = Record::with_object_id("Todo", "abc");
        assert!(profiler().serialize(&record).unwrap().is_empty());

        record.increase("views", 1.0).unwrap();
        record.unset("draft").unwrap();
        let doc = profiler().serialize(&record).unwrap();
        assert_eq!(
            serde_json::Value::Object(doc),
            json!({
                "views": {"__op": "Increment", "amount": 1},
                "draft": {"__op": "Delete"},
            })
        );
    }

    #[test]
    fn new_record_sends_pending_relations_as_operations() {
        let mut record = Record::new("Post");
        let tag = RecordRef::new(Record::with_object_id("Tag", "t1"));
        record.insert_relation("tags", &tag).unwrap();

        let doc = profiler().serialize(&record).unwrap();
        assert_eq!(doc["tags"]["__op"], "AddRelation");
        assert_eq!(doc["tags"]["objects"][0]["objectId"], "t1");
    }

    #[test]
    fn deserialize_typed_values() {
        let doc = json!({
            "className": "Todo",
            "objectId": "abc",
            "createdAt": "2016-04-01T08:30:00.000Z",
            "updatedAt": {"__type": "Date", "iso": "2016-04-02T08:30:00.000Z"},
            "data": {"__type": "Bytes", "base64": "aGVsbG8="},
            "location": {"__type": "GeoPoint", "latitude": 1.5, "longitude": 2.5},
            "owner": {"__type": "Pointer", "className": "_User", "objectId": "u1"},
            "tags": {"__type": "Relation", "className": "Tag"},
            "meta": {"nested": [1, true, null]},
        });

        let record = profiler().deserialize(&doc, None).unwrap();
        let record = record.read();

        assert_eq!(record.class_name(), "Todo");
        assert_eq!(record.object_id(), Some("abc"));
        assert!(record.created_at().is_some());
        assert!(record.updated_at() > record.created_at());
        assert_eq!(record.get("data"), Some(&Value::Bytes(b"hello".to_vec())));
        assert_eq!(
            record.get("location"),
            Some(&Value::GeoPoint(GeoPoint::new(1.5, 2.5)))
        );

        let owner = record.get("owner").and_then(Value::as_record).unwrap();
        assert_eq!(owner.class_name(), "_User");
        assert_eq!(owner.object_id().as_deref(), Some("u1"));

        let Some(Value::Relation(tags)) = record.get("tags") else {
            panic!("expected a relation");
        };
        assert_eq!(tags.key, "tags");
        assert_eq!(tags.owner_id.as_deref(), Some("abc"));
        assert_eq!(tags.target_class.as_deref(), Some("Tag"));

        assert!(record.operations().is_empty());
    }

    #[test]
    fn pointer_stub_skips_constructor_defaults() {
        let registry = ClassRegistry::default().with_class("Todo", || {
            let mut todo = Record::new("Todo");
            todo.set("done", false).unwrap();
            todo
        });
        let p = ObjectProfiler::new(registry);
        let doc = json!({
            "owner": {"__type": "Pointer", "className": "Todo", "objectId": "t1"},
        });

        let record = p.deserialize(&doc, Some("Note")).unwrap();
        let stub = record
            .read()
            .get("owner")
            .and_then(Value::as_record)
            .cloned()
            .unwrap();
        let stub = stub.read();

        assert_eq!(stub.class_name(), "Todo");
        let keys: Vec<&String> = stub.fields().map(|(key, _)| key).collect();
        assert_eq!(keys, ["objectId"]);
        assert!(stub.operations().is_empty());

        let full = p.deserialize(&json!({"objectId": "t2"}), Some("Todo")).unwrap();
        assert_eq!(full.read().get("done"), Some(&Value::Bool(false)));
    }

    #[test]
    fn class_name_fallbacks() {
        let record = profiler().deserialize(&json!({}), Some("Note")).unwrap();
        assert_eq!(record.class_name(), "Note");

        let record = profiler().deserialize(&json!({}), None).unwrap();
        assert_eq!(record.class_name(), "_Object");
    }

    #[test]
    fn embedded_object_decodes_fully() {
        let doc = json!({
            "author": {"__type": "Object", "className": "_User", "objectId": "u1", "name": "ann"},
        });
        let record = profiler().deserialize(&doc, Some("Post")).unwrap();
        let author = record
            .read()
            .get("author")
            .and_then(Value::as_record)
            .cloned()
            .unwrap();
        assert_eq!(author.read().get("name"), Some(&Value::from("ann")));
    }

    #[test]
    fn malformed_payloads() {
        let p = profiler();
        for doc in [
            json!({"data": {"__type": "Bytes", "base64": "%%%"}}),
            json!({"when": {"__type": "Date", "iso": "not a date"}}),
            json!({"createdAt": "yesterday"}),
            json!({"owner": {"__type": "Pointer", "className": "_User"}}),
            json!({"thing": {"__type": "Unknown"}}),
        ] {
            assert!(
                matches!(p.deserialize(&doc, None), Err(Error::MalformedData(_))),
                "{doc} should be malformed"
            );
        }
        assert!(matches!(
            p.deserialize(&json!([1, 2]), None),
            Err(Error::MalformedData(_))
        ));
    }

    #[test]
    fn update_record_is_all_or_nothing() {
        let mut record = Record::new("Todo");
        let doc = json!({"objectId": "abc", "when": {"__type": "Date", "iso": "bad"}});
        let doc = doc.as_object().unwrap();

        assert!(profiler().update_record(&mut record, doc).is_err());
        assert!(record.is_new());
    }

    #[test]
    fn literal_round_trip() {
        let mut record = Record::new("Todo");
        record.set("title", "x").unwrap();
        record.set("done", true).unwrap();
        record
            .set("location", GeoPoint::new(30.0, 120.0))
            .unwrap();

        let p = profiler();
        let doc = serde_json::Value::Object(p.serialize(&record).unwrap());
        let decoded = p.deserialize(&doc, Some("Todo")).unwrap();

        assert_eq!(*decoded.read(), record);
    }

    #[test]
    fn detects_direct_and_nested_cycles() {
        let p = profiler();

        let direct = RecordRef::new(Record::new("Node"));
        direct
            .write()
            .set("me", Value::Record(direct.clone()))
            .unwrap();
        assert!(matches!(
            p.validate_circular_reference(&direct),
            Err(Error::CircularReference(_))
        ));

        let a = RecordRef::new(Record::new("Node"));
        let b = RecordRef::new(Record::new("Node"));
        b.write()
            .set("items", Value::Array(vec![Value::Record(a.clone())]))
            .unwrap();
        let mut map = BTreeMap::new();
        map.insert("child".to_string(), Value::Record(b.clone()));
        a.write().set("meta", Value::Map(map)).unwrap();

        assert!(matches!(
            p.validate_circular_reference(&a),
            Err(Error::CircularReference(_))
        ));
        assert!(matches!(
            p.serialize(&b.read()),
            Err(Error::CircularReference(_))
        ));
    }

    #[test]
    fn shared_child_is_not_a_cycle() {
        let child = RecordRef::new(Record::new("Leaf"));
        let root = RecordRef::new(Record::new("Root"));
        root.write()
            .set("left", Value::Record(child.clone()))
            .unwrap();
        root.write()
            .set("right", Value::Record(child.clone()))
            .unwrap();

        assert!(profiler().validate_circular_reference(&root).is_ok());
    }

    #[test]
    fn pending_children_come_first() {
        let leaf = RecordRef::new(Record::new("Leaf"));
        let saved = RecordRef::new(Record::with_object_id("Leaf", "done"));
        let root = RecordRef::new(Record::new("Root"));
        root.write()
            .set(
                "children",
                Value::Array(vec![
                    Value::Record(leaf.clone()),
                    Value::Record(saved.clone()),
                    Value::Record(leaf.clone()),
                ]),
            )
            .unwrap();

        let pending = profiler().collect_pending(&root).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].ptr_eq(&leaf));
        assert!(pending[1].ptr_eq(&root));
    }
}
