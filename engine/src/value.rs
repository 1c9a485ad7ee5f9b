//! Value model.
//!
//! Every record field holds a [`Value`]. The set of variants is closed and all
//! of them share the same capabilities: deep equality, a plain JSON form, a
//! wire form for the backend, child traversal and three merge primitives
//! (`add`, `concatenate`, `differ`) used both by application code and by the
//! operation reduction engine.

use crate::{error::Result, record::InternalId, Error, RecordRef};
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// Key that tags typed wire documents.
pub const TYPE_KEY: &str = "__type";

/// Largest integer an `f64` represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A geographic point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    fn wire(&self) -> serde_json::Value {
        json!({
            TYPE_KEY: "GeoPoint",
            "latitude": number_json(self.latitude),
            "longitude": number_json(self.longitude),
        })
    }
}

/// Unit of a [`GeoDistance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceUnit {
    Radians,
    Miles,
    Kilometers,
}

impl DistanceUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceUnit::Radians => "Radians",
            DistanceUnit::Miles => "Miles",
            DistanceUnit::Kilometers => "Kilometers",
        }
    }
}

/// A distance used by geo queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoDistance {
    pub value: f64,
    pub unit: DistanceUnit,
}

impl GeoDistance {
    pub fn new(value: f64, unit: DistanceUnit) -> Self {
        Self { value, unit }
    }
}

/// A one-to-many relation stored under a field of its owner record.
///
/// The related records themselves live on the backend; locally a relation
/// only knows which record owns it and which class it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Field key the relation is stored under
    pub key: String,
    /// Object ID of the owner record, once it has one
    pub owner_id: Option<String>,
    /// Class name of the related records, once known
    pub target_class: Option<String>,
}

impl Relation {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner_id: None,
            target_class: None,
        }
    }

    fn wire(&self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        doc.insert(TYPE_KEY.into(), "Relation".into());
        if let Some(class_name) = &self.target_class {
            doc.insert("className".into(), class_name.clone().into());
        }
        serde_json::Value::Object(doc)
    }
}

/// A dynamically typed field value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    GeoPoint(GeoPoint),
    Date(DateTime<Utc>),
    Relation(Relation),
    Record(RecordRef),
}

impl Value {
    /// Name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::Array(_) => "Array",
            Value::Map(_) => "Map",
            Value::GeoPoint(_) => "GeoPoint",
            Value::Date(_) => "Date",
            Value::Relation(_) => "Relation",
            Value::Record(_) => "Record",
        }
    }

    /// Deep equality.
    ///
    /// Arrays compare element-wise in order, maps by key set and values.
    /// Records compare by identity, or by class and object ID when both are
    /// persisted.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, x)| b.get(key).is_some_and(|y| x.equals(y)))
            }
            (Value::GeoPoint(a), Value::GeoPoint(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Relation(a), Value::Relation(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a.same_record(b),
            _ => false,
        }
    }

    /// Plain JSON form.
    pub fn json_value(&self) -> serde_json::Value {
        self.json_value_on_path(&mut Vec::new())
    }

    pub(crate) fn json_value_on_path(&self, path: &mut Vec<InternalId>) -> serde_json::Value {
        match self {
            Value::Array(items) => items
                .iter()
                .map(|item| item.json_value_on_path(path))
                .collect(),
            Value::Map(map) => map
                .iter()
                .map(|(key, item)| (key.clone(), item.json_value_on_path(path)))
                .collect::<serde_json::Map<_, _>>()
                .into(),
            Value::Record(record) => record.json_value_on_path(path),
            scalar => scalar.scalar_wire(),
        }
    }

    /// Wire form, as embedded in save bodies and query constraints.
    ///
    /// Fails with [`Error::InvalidType`] when a record without an object ID
    /// is reachable, or a number is NaN or infinite.
    pub fn wire_value(&self) -> Result<serde_json::Value> {
        match self {
            Value::Array(items) => items.iter().map(Value::wire_value).collect(),
            Value::Map(map) => map
                .iter()
                .map(|(key, item)| Ok((key.clone(), item.wire_value()?)))
                .collect::<Result<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
            Value::Record(record) => record.pointer(),
            Value::Number(n) => wire_number(*n),
            Value::GeoPoint(point) => {
                wire_number(point.latitude)?;
                wire_number(point.longitude)?;
                Ok(point.wire())
            }
            scalar => Ok(scalar.scalar_wire()),
        }
    }

    /// Encoding shared by the JSON and wire forms for non-container variants.
    fn scalar_wire(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => (*b).into(),
            Value::Number(n) => number_json(*n),
            Value::String(s) => s.clone().into(),
            Value::Bytes(bytes) => json!({
                TYPE_KEY: "Bytes",
                "base64": base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
            Value::GeoPoint(point) => point.wire(),
            Value::Date(date) => json!({
                TYPE_KEY: "Date",
                "iso": format_date(date),
            }),
            Value::Relation(relation) => relation.wire(),
            Value::Array(_) | Value::Map(_) | Value::Record(_) => self.json_value(),
        }
    }

    /// Directly contained values. Empty for scalars; a record's children are
    /// reached through [`Record::children`](crate::Record::children).
    pub fn children(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Value::Array(items) => Box::new(items.iter()),
            Value::Map(map) => Box::new(map.values()),
            _ => Box::new(std::iter::empty()),
        }
    }

    /// Arithmetic sum. Only defined for two numbers.
    pub fn add(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            _ => Err(Error::mismatch("add", self.type_name(), other.type_name())),
        }
    }

    /// Append the elements of `other`, skipping elements already present
    /// when `unique` is set. Only defined for two arrays.
    pub fn concatenate(&self, other: &Value, unique: bool) -> Result<Value> {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(concat_elements(a, b, unique))),
            _ => Err(Error::mismatch(
                "concatenate",
                self.type_name(),
                other.type_name(),
            )),
        }
    }

    /// Remove every element equal to some element of `other`. Only defined
    /// for two arrays.
    pub fn differ(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(differ_elements(a, b))),
            _ => Err(Error::InvalidType(format!(
                "cannot remove {} from {}",
                other.type_name(),
                self.type_name()
            ))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RecordRef> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

/// `base ++ extra`, or `base` followed by the elements of `extra` not yet in
/// the result when `unique` is set.
pub(crate) fn concat_elements(base: &[Value], extra: &[Value], unique: bool) -> Vec<Value> {
    let mut result = base.to_vec();
    for element in extra {
        if !unique || !result.iter().any(|existing| existing.equals(element)) {
            result.push(element.clone());
        }
    }
    result
}

/// Elements of `base` that equal no element of `removed`, in order.
pub(crate) fn differ_elements(base: &[Value], removed: &[Value]) -> Vec<Value> {
    base.iter()
        .filter(|element| !removed.iter().any(|r| r.equals(element)))
        .cloned()
        .collect()
}

/// Integral numbers encode as JSON integers so `18.0` goes out as `18`.
pub(crate) fn number_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Value::from(n)
    }
}

/// [`number_json`] for the wire. NaN and infinities have no JSON form.
pub(crate) fn wire_number(n: f64) -> Result<serde_json::Value> {
    if !n.is_finite() {
        return Err(Error::InvalidType(format!(
            "{n} has no wire representation"
        )));
    }
    Ok(number_json(n))
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub(crate) fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_date(iso: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(iso)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|e| Error::MalformedData(format!("invalid date '{iso}': {e}")))
}

pub(crate) fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::MalformedData(format!("invalid base64 payload: {e}")))
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<GeoPoint> for Value {
    fn from(point: GeoPoint) -> Self {
        Value::GeoPoint(point)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Value::Date(date)
    }
}

impl From<Relation> for Value {
    fn from(relation: Relation) -> Self {
        Value::Relation(relation)
    }
}

impl From<RecordRef> for Value {
    fn from(record: RecordRef) -> Self {
        Value::Record(record)
    }
}
