//! Constraint compiler.
//!
//! A [`Query`] collects [`Constraint`]s on the keys of one class and compiles
//! them into the backend's constraint tree. Constraints are compiled as they
//! are added, so an invalid value fails at [`Query::where_key`] rather than
//! when the query runs.

use crate::{
    error::Result,
    record::CLASS_NAME,
    value::wire_number,
    ClassName, Error, GeoDistance, GeoPoint, Record, RecordRef, Value,
};
use serde_json::{json, Map};
use std::collections::{BTreeMap, BTreeSet};

type Json = serde_json::Value;

const AND: &str = "$and";
const OR: &str = "$or";
const RELATED_TO: &str = "$relatedTo";

/// A condition on one key.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Return the pointed-to record in full
    Included,
    /// Return only the selected keys
    Selected,
    Existed,
    NotExisted,

    EqualTo(Value),
    NotEqualTo(Value),
    LessThan(Value),
    LessThanOrEqualTo(Value),
    GreaterThan(Value),
    GreaterThanOrEqualTo(Value),

    ContainedIn(Vec<Value>),
    NotContainedIn(Vec<Value>),
    ContainedAllIn(Vec<Value>),
    EqualToSize(u64),

    NearbyPoint(GeoPoint),
    NearbyPointWithRange {
        origin: GeoPoint,
        from: Option<GeoDistance>,
        to: Option<GeoDistance>,
    },
    NearbyPointWithRectangle {
        southwest: GeoPoint,
        northeast: GeoPoint,
    },

    MatchedQuery(Query),
    NotMatchedQuery(Query),
    /// The key's value appears under `key` in the results of `query`
    MatchedQueryAndKey { query: Query, key: String },
    NotMatchedQueryAndKey { query: Query, key: String },

    MatchedPattern {
        pattern: String,
        options: Option<String>,
    },
    MatchedSubstring(String),
    PrefixedBy(String),
    SuffixedBy(String),

    /// Records related to `record` through the constrained key
    RelatedTo(RecordRef),

    Ascending,
    Descending,
}

/// A query over the records of one class.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    class_name: ClassName,
    /// Operator documents per key, plus top-level entries such as
    /// `$relatedTo`, `$and` and `$or`
    constraints: BTreeMap<String, Json>,
    /// Equality constraints in insertion order
    equalities: Vec<(String, Json)>,
    included: BTreeSet<String>,
    selected: BTreeSet<String>,
    order: Vec<String>,
    limit: Option<u64>,
    skip: Option<u64>,
}

impl Query {
    pub fn new(class_name: impl Into<ClassName>) -> Self {
        Self {
            class_name: class_name.into(),
            constraints: BTreeMap::new(),
            equalities: Vec::new(),
            included: BTreeSet::new(),
            selected: BTreeSet::new(),
            order: Vec::new(),
            limit: None,
            skip: None,
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Option<u64>) {
        self.limit = limit;
    }

    pub fn skip(&self) -> Option<u64> {
        self.skip
    }

    pub fn set_skip(&mut self, skip: Option<u64>) {
        self.skip = skip;
    }

    /// Records related to `owner` through its relation `key`.
    pub fn for_relation(owner: &Record, key: &str) -> Result<Query> {
        let relation = owner.relation(key)?;
        let target = relation.target_class.ok_or_else(|| {
            Error::InvalidType(format!(
                "relation '{key}' on {} has no known target class",
                owner.class_name()
            ))
        })?;

        let mut query = Query::new(target);
        query.constraints.insert(
            RELATED_TO.into(),
            json!({ "object": owner.pointer()?, "key": key }),
        );
        Ok(query)
    }

    /// Add a constraint on `key`.
    pub fn where_key(&mut self, key: impl Into<String>, constraint: Constraint) -> Result<()> {
        let key = key.into();
        match constraint {
            Constraint::Included => {
                self.included.insert(key);
            }
            Constraint::Selected => {
                self.selected.insert(key);
            }
            Constraint::Ascending => self.order.push(key),
            Constraint::Descending => self.order.push(format!("-{key}")),

            Constraint::Existed => self.add_operator(key, "$exists", Json::Bool(true)),
            Constraint::NotExisted => self.add_operator(key, "$exists", Json::Bool(false)),

            Constraint::EqualTo(value) => self.add_equality(key, value.wire_value()?),
            Constraint::NotEqualTo(value) => self.add_operator(key, "$ne", value.wire_value()?),
            Constraint::LessThan(value) => self.add_operator(key, "$lt", value.wire_value()?),
            Constraint::LessThanOrEqualTo(value) => {
                self.add_operator(key, "$lte", value.wire_value()?)
            }
            Constraint::GreaterThan(value) => self.add_operator(key, "$gt", value.wire_value()?),
            Constraint::GreaterThanOrEqualTo(value) => {
                self.add_operator(key, "$gte", value.wire_value()?)
            }

            Constraint::ContainedIn(values) => self.add_operator(key, "$in", wire_array(&values)?),
            Constraint::NotContainedIn(values) => {
                self.add_operator(key, "$nin", wire_array(&values)?)
            }
            Constraint::ContainedAllIn(values) => {
                self.add_operator(key, "$all", wire_array(&values)?)
            }
            Constraint::EqualToSize(size) => self.add_operator(key, "$size", json!(size)),

            Constraint::NearbyPoint(origin) => {
                self.add_operator(key, "$nearSphere", Value::GeoPoint(origin).wire_value()?)
            }
            Constraint::NearbyPointWithRange { origin, from, to } => {
                let mut doc = Map::new();
                doc.insert(
                    "$nearSphere".into(),
                    Value::GeoPoint(origin).wire_value()?,
                );
                if let Some(from) = from {
                    doc.insert(
                        format!("$minDistanceIn{}", from.unit.as_str()),
                        wire_number(from.value)?,
                    );
                }
                if let Some(to) = to {
                    doc.insert(
                        format!("$maxDistanceIn{}", to.unit.as_str()),
                        wire_number(to.value)?,
                    );
                }
                self.merge_operators(key, doc)
            }
            Constraint::NearbyPointWithRectangle {
                southwest,
                northeast,
            } => {
                let corners = json!([
                    Value::GeoPoint(southwest).wire_value()?,
                    Value::GeoPoint(northeast).wire_value()?,
                ]);
                self.add_operator(key, "$within", json!({ "$box": corners }))
            }

            Constraint::MatchedQuery(query) => {
                self.add_operator(key, "$inQuery", query.lcon_value())
            }
            Constraint::NotMatchedQuery(query) => {
                self.add_operator(key, "$notInQuery", query.lcon_value())
            }
            Constraint::MatchedQueryAndKey { query, key: field } => self.add_operator(
                key,
                "$select",
                json!({ "query": query.lcon_value(), "key": field }),
            ),
            Constraint::NotMatchedQueryAndKey { query, key: field } => self.add_operator(
                key,
                "$dontSelect",
                json!({ "query": query.lcon_value(), "key": field }),
            ),

            Constraint::MatchedPattern { pattern, options } => {
                let mut doc = Map::new();
                doc.insert("$regex".into(), pattern.into());
                if let Some(options) = options {
                    doc.insert("$options".into(), options.into());
                }
                self.merge_operators(key, doc)
            }
            Constraint::MatchedSubstring(text) => {
                self.add_operator(key, "$regex", Json::String(regex::escape(&text)))
            }
            Constraint::PrefixedBy(text) => {
                self.add_operator(key, "$regex", Json::String(format!("^{}", regex::escape(&text))))
            }
            Constraint::SuffixedBy(text) => {
                self.add_operator(key, "$regex", Json::String(format!("{}$", regex::escape(&text))))
            }

            Constraint::RelatedTo(record) => {
                let pointer = record.pointer()?;
                self.constraints
                    .insert(RELATED_TO.into(), json!({ "object": pointer, "key": key }));
            }
        }
        Ok(())
    }

    fn add_operator(&mut self, key: String, operator: &str, value: Json) {
        let mut doc = Map::new();
        doc.insert(operator.into(), value);
        self.merge_operators(key, doc);
    }

    /// Operators on one key share a single document.
    fn merge_operators(&mut self, key: String, doc: Map<String, Json>) {
        match self.constraints.get_mut(&key) {
            Some(Json::Object(existing)) => existing.extend(doc),
            _ => {
                self.constraints.insert(key, Json::Object(doc));
            }
        }
    }

    fn add_equality(&mut self, key: String, value: Json) {
        match self.equalities.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.equalities.push((key, value)),
        }
    }

    /// Both queries must match.
    pub fn and(&self, other: &Query) -> Result<Query> {
        self.combine(AND, other)
    }

    /// Either query may match.
    pub fn or(&self, other: &Query) -> Result<Query> {
        self.combine(OR, other)
    }

    fn combine(&self, operator: &str, other: &Query) -> Result<Query> {
        if self.class_name != other.class_name {
            tracing::warn!(
                lhs = %self.class_name,
                rhs = %other.class_name,
                "cannot combine queries of different classes"
            );
            return Err(Error::Inconsistency(format!(
                "cannot combine a query on {} with one on {}",
                self.class_name, other.class_name
            )));
        }

        let mut combined = Query::new(self.class_name.clone());
        combined.constraints.insert(
            operator.into(),
            json!([self.where_value(), other.where_value()]),
        );
        Ok(combined)
    }

    /// The constraint tree.
    ///
    /// Equalities are gathered under `$and`, after any clauses already
    /// there, in the order they were added.
    pub fn where_value(&self) -> Json {
        let mut tree: Map<String, Json> = self
            .constraints
            .iter()
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect();

        if !self.equalities.is_empty() {
            let mut clauses = match tree.remove(AND) {
                Some(Json::Array(items)) => items,
                Some(other) => vec![other],
                None => Vec::new(),
            };
            clauses.extend(self.equalities.iter().map(|(key, value)| {
                let mut clause = Map::new();
                clause.insert(key.clone(), value.clone());
                Json::Object(clause)
            }));
            tree.insert(AND.into(), Json::Array(clauses));
        }

        Json::Object(tree)
    }

    /// The query as an embedded document, used by sub-query constraints.
    pub fn lcon_value(&self) -> Json {
        let mut doc = self.compiled(false);
        doc.insert(CLASS_NAME.into(), self.class_name.clone().into());
        Json::Object(doc)
    }

    /// Request parameters: `where` as a JSON string, the rest as plain
    /// values.
    pub fn parameters(&self) -> Map<String, Json> {
        self.compiled(true)
    }

    fn compiled(&self, where_as_string: bool) -> Map<String, Json> {
        let mut doc = Map::new();

        let tree = self.where_value();
        if tree.as_object().is_some_and(|t| !t.is_empty()) {
            let value = if where_as_string {
                Json::String(tree.to_string())
            } else {
                tree
            };
            doc.insert("where".into(), value);
        }
        if !self.included.is_empty() {
            doc.insert("include".into(), join(&self.included).into());
        }
        if !self.selected.is_empty() {
            doc.insert("keys".into(), join(&self.selected).into());
        }
        if !self.order.is_empty() {
            doc.insert("order".into(), self.order.join(",").into());
        }
        if let Some(limit) = self.limit {
            doc.insert("limit".into(), limit.into());
        }
        if let Some(skip) = self.skip {
            doc.insert("skip".into(), skip.into());
        }
        doc
    }
}

fn wire_array(values: &[Value]) -> Result<Json> {
    values
        .iter()
        .map(Value::wire_value)
        .collect::<Result<Vec<_>>>()
        .map(Json::Array)
}

fn join(keys: &BTreeSet<String>) -> String {
    keys.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}
