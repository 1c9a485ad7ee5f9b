//! Contract between the engine and the network.
//!
//! The engine never performs IO. It describes each exchange as a [`Request`]
//! against an abstract [`Endpoint`] and hands it to a [`Transport`], which is
//! responsible for URLs, authentication, retries and connections.

use crate::{error::Result, ClassName, Error, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Code reported for a call the transport cancelled.
pub const CANCELLED: i64 = -999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// Abstract request target. The transport maps it to a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Endpoint {
    /// The collection of one class
    #[serde(rename_all = "camelCase")]
    Class { class_name: ClassName },
    /// A single persisted record
    #[serde(rename_all = "camelCase")]
    Object {
        class_name: ClassName,
        object_id: ObjectId,
    },
    /// Cloud query language endpoint
    CloudQuery,
    /// A named cloud function
    Function { name: String },
}

/// One request handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: Method,
    pub endpoint: Endpoint,
    pub headers: BTreeMap<String, String>,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub body: Option<serde_json::Value>,
}

impl Request {
    pub fn new(method: Method, endpoint: Endpoint) -> Self {
        Self {
            method,
            endpoint,
            headers: BTreeMap::new(),
            params: serde_json::Map::new(),
            body: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Map<String, serde_json::Value>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Failure reported by the transport or the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: i64,
    #[serde(rename = "error")]
    pub message: String,
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        Error::Remote {
            code: err.code,
            message: err.message,
        }
    }
}

/// What the transport hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status_ok: bool,
    pub value: serde_json::Value,
    pub error: Option<RemoteError>,
}

impl Response {
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            status_ok: true,
            value,
            error: None,
        }
    }

    pub fn failed(code: i64, message: impl Into<String>) -> Self {
        Self {
            status_ok: false,
            value: serde_json::Value::Null,
            error: Some(RemoteError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(CANCELLED, "request cancelled")
    }

    /// The response body, or the failure it carries.
    ///
    /// Transport errors take precedence, then business errors embedded in
    /// the body, then a bare non-success status.
    pub fn into_result(self) -> Result<serde_json::Value> {
        if let Some(err) = self.error {
            return Err(err.into());
        }
        if let Some(err) = business_error(&self.value) {
            return Err(err);
        }
        if !self.status_ok {
            return Err(Error::Remote {
                code: -1,
                message: "request failed".into(),
            });
        }
        Ok(self.value)
    }
}

/// Recognise a `{"code": N, "error": S}` body.
pub fn business_error(value: &serde_json::Value) -> Option<Error> {
    let code = value.get("code")?.as_i64()?;
    let message = value.get("error")?.as_str()?;
    Some(Error::Remote {
        code,
        message: message.to_owned(),
    })
}

/// Sends requests on behalf of the engine.
///
/// Implementations may block; the engine never calls `send` while holding a
/// record lock.
pub trait Transport {
    fn send(&self, request: Request) -> Response;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(&self, request: Request) -> Response {
        (**self).send(request)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, request: Request) -> Response {
        (**self).send(request)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&self, request: Request) -> Response {
        (**self).send(request)
    }
}
