//! Client - request orchestration.
//!
//! The client ties records, the profiler and queries to a [`Transport`]. It
//! builds every request, decodes every response, and keeps the local record
//! state in step with what the backend accepted.

use crate::{
    error::Result,
    transport::{Endpoint, Method, Request},
    ClassRegistry, Config, Constraint, Error, ObjectProfiler, Query, RecordRef, Transport, Value,
};
use std::collections::BTreeMap;

type Json = serde_json::Value;

/// Result of a cloud query.
#[derive(Debug, Clone)]
pub struct CqlOutcome {
    /// Matching records, empty for pure count queries
    pub objects: Vec<RecordRef>,
    /// Number of matches, when the statement asked for it
    pub count: Option<u64>,
}

/// Entry point for talking to the backend.
#[derive(Debug)]
pub struct Client<T: Transport> {
    transport: T,
    profiler: ObjectProfiler,
    config: Config,
}

impl<T: Transport> Client<T> {
    /// Create a client that decodes every class into generic records.
    pub fn new(transport: T, config: Config) -> Self {
        let registry = ClassRegistry::new(config.default_class_name.clone());
        Self::with_registry(transport, registry, config)
    }

    /// Create a client with registered class constructors.
    pub fn with_registry(transport: T, registry: ClassRegistry, config: Config) -> Self {
        Self {
            transport,
            profiler: ObjectProfiler::new(registry),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn profiler(&self) -> &ObjectProfiler {
        &self.profiler
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn send(&self, request: Request) -> Result<Json> {
        tracing::debug!(
            method = ?request.method,
            endpoint = ?request.endpoint,
            "sending request"
        );
        let result = self.transport.send(request).into_result();
        if let Err(err) = &result {
            tracing::warn!(error = %err, "request failed");
        }
        result
    }

    /// Persist `record` and, when configured, its pending descendants first.
    ///
    /// The whole graph is validated before anything is sent. A failed
    /// request keeps the pending operations of the record it was for, and of
    /// every record after it, so the save can be retried.
    pub fn save(&self, record: &RecordRef) -> Result<()> {
        self.profiler.validate_circular_reference(record)?;

        let targets = if self.config.save_descendants {
            self.profiler.collect_pending(record)?
        } else if record.read().has_pending_changes() {
            vec![record.clone()]
        } else {
            Vec::new()
        };

        if targets.is_empty() {
            tracing::debug!(class = %record.class_name(), "nothing to save");
        }
        for target in &targets {
            self.save_one(target)?;
        }
        Ok(())
    }

    fn save_one(&self, record: &RecordRef) -> Result<()> {
        let request = {
            let guard = record.read();
            let body = self.profiler.serialize(&guard)?;
            let class_name = guard.class_name().to_owned();
            let (method, endpoint) = match guard.object_id() {
                None => (Method::Post, Endpoint::Class { class_name }),
                Some(object_id) => (
                    Method::Put,
                    Endpoint::Object {
                        class_name,
                        object_id: object_id.to_owned(),
                    },
                ),
            };
            let request = Request::new(method, endpoint).with_body(Json::Object(body));
            if self.config.fetch_when_save {
                request.with_param("fetchWhenSave", true)
            } else {
                request
            }
        };

        let response = self.send(request)?;

        // The backend has applied the body, so resending it would apply it twice
        let mut guard = record.write();
        guard.reset_operations();
        let doc = expect_object(&response, "save")?;
        self.profiler.update_record(&mut guard, doc)?;
        tracing::debug!(
            class = %guard.class_name(),
            object_id = guard.object_id().unwrap_or_default(),
            "saved record"
        );
        Ok(())
    }

    /// Reload `record` from the backend, optionally including pointed-to
    /// records in full. Pending operations are discarded.
    pub fn fetch(&self, record: &RecordRef, include: &[&str]) -> Result<()> {
        let endpoint = self.object_endpoint(record)?;
        let mut request = Request::new(Method::Get, endpoint);
        if !include.is_empty() {
            let mut keys = include.to_vec();
            keys.sort_unstable();
            keys.dedup();
            request = request.with_param("include", keys.join(","));
        }

        let response = self.send(request)?;
        let doc = expect_object(&response, "fetch")?;
        if doc.is_empty() {
            return Err(Error::NotFound(format!(
                "{} record no longer exists",
                record.class_name()
            )));
        }

        let mut guard = record.write();
        self.profiler.update_record(&mut guard, doc)?;
        guard.reset_operations();
        Ok(())
    }

    /// Delete `record` on the backend. The local record is left as is.
    pub fn delete(&self, record: &RecordRef) -> Result<()> {
        let endpoint = self.object_endpoint(record)?;
        self.send(Request::new(Method::Delete, endpoint))?;
        Ok(())
    }

    fn object_endpoint(&self, record: &RecordRef) -> Result<Endpoint> {
        let object_id = record.object_id().ok_or_else(|| {
            Error::NotFound(format!(
                "{} record has not been saved",
                record.class_name()
            ))
        })?;
        Ok(Endpoint::Object {
            class_name: record.class_name().to_owned(),
            object_id,
        })
    }

    /// Records matching `query`.
    pub fn find(&self, query: &Query) -> Result<Vec<RecordRef>> {
        let request = Request::new(
            Method::Get,
            Endpoint::Class {
                class_name: query.class_name().to_owned(),
            },
        )
        .with_params(query.parameters());

        let response = self.send(request)?;
        self.decode_results(&response, query.class_name())
    }

    /// First record matching `query`.
    pub fn get_first(&self, query: &Query) -> Result<RecordRef> {
        let mut first = query.clone();
        first.set_limit(Some(1));
        self.find(&first)?.into_iter().next().ok_or_else(|| {
            Error::NotFound(format!("no {} record matches the query", query.class_name()))
        })
    }

    /// The record with `object_id`, if it also matches `query`.
    pub fn get(&self, query: &Query, object_id: &str) -> Result<RecordRef> {
        let mut by_id = query.clone();
        by_id.where_key(
            crate::record::OBJECT_ID,
            Constraint::EqualTo(Value::from(object_id)),
        )?;
        self.get_first(&by_id)
    }

    /// Number of records matching `query`.
    pub fn count(&self, query: &Query) -> Result<u64> {
        let request = Request::new(
            Method::Get,
            Endpoint::Class {
                class_name: query.class_name().to_owned(),
            },
        )
        .with_params(query.parameters())
        .with_param("count", 1)
        .with_param("limit", 0);

        let response = self.send(request)?;
        response
            .get("count")
            .and_then(Json::as_u64)
            .ok_or_else(|| Error::MalformedData(format!("count response without a count: {response}")))
    }

    /// Run a cloud query statement with positional values.
    pub fn execute_cql(&self, cql: &str, pvalues: &[Value]) -> Result<CqlOutcome> {
        let mut request = Request::new(Method::Get, Endpoint::CloudQuery).with_param("cql", cql);
        if !pvalues.is_empty() {
            let encoded = pvalues
                .iter()
                .map(Value::wire_value)
                .collect::<Result<Vec<_>>>()?;
            request = request.with_param("pvalues", Json::Array(encoded).to_string());
        }

        let response = self.send(request)?;
        let count = response.get("count").and_then(Json::as_u64);
        let objects = match response.get("className").and_then(Json::as_str) {
            Some(class_name) => self.decode_results(&response, class_name)?,
            None => Vec::new(),
        };
        Ok(CqlOutcome { objects, count })
    }

    /// Call a cloud function and decode its `result`.
    pub fn call_function(&self, name: &str, params: &BTreeMap<String, Value>) -> Result<Value> {
        let body = params
            .iter()
            .map(|(key, value)| Ok((key.clone(), value.wire_value()?)))
            .collect::<Result<serde_json::Map<_, _>>>()?;
        let request = Request::new(
            Method::Post,
            Endpoint::Function {
                name: name.to_owned(),
            },
        )
        .with_body(Json::Object(body));

        let response = self.send(request)?;
        match response.get("result") {
            Some(result) => self.profiler.decode_value(result),
            None => Ok(Value::Null),
        }
    }

    fn decode_results(&self, response: &Json, class_name: &str) -> Result<Vec<RecordRef>> {
        let results = response
            .get("results")
            .and_then(Json::as_array)
            .ok_or_else(|| Error::MalformedData(format!("expected a results array: {response}")))?;
        results
            .iter()
            .map(|doc| self.profiler.deserialize(doc, Some(class_name)))
            .collect()
    }
}

fn expect_object<'a>(response: &'a Json, action: &str) -> Result<&'a serde_json::Map<String, Json>> {
    response
        .as_object()
        .ok_or_else(|| Error::MalformedData(format!("{action} response is not an object: {response}")))
}
