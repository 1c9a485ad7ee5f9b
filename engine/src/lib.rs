//! # Nimbus Engine
//!
//! The client-side data layer for the Nimbus object storage service.
//!
//! This crate models dynamically typed records, tracks local mutations,
//! merges them into a minimal set of update operations, and converts records
//! to and from the backend's JSON wire format. A query builder compiles
//! declarative constraints into the same format.
//!
//! ## Design Principles
//!
//! - **No IO**: every network exchange goes through the [`Transport`] trait
//! - **Local errors first**: type, key and cycle errors are raised before
//!   anything is sent
//! - **Minimal updates**: a save sends at most one operation per field
//!
//! ## Core Concepts
//!
//! ### Values
//!
//! A [`Value`] is one of a closed set of types: null, booleans, numbers,
//! strings, bytes, arrays, maps, geo points, dates, relations and records.
//!
//! ### Records
//!
//! A [`Record`] belongs to a class and is new until the backend assigns it an
//! object ID. Records are shared through [`RecordRef`] handles and may point
//! at each other freely; cycles are rejected when a record is saved.
//!
//! ### Operations
//!
//! Every mutation records an [`Operation`]. Operations on the same key are
//! reduced into one pending entry, so incrementing twice sends one
//! `Increment` with the summed amount.
//!
//! ### Queries
//!
//! A [`Query`] collects [`Constraint`]s and compiles them into request
//! parameters.
//!
//! ## Quick Start
//!
//! ```rust
//! use nimbus_engine::{
//!     Client, Config, Constraint, Query, Record, RecordRef, Request, Response, Transport,
//! };
//! use serde_json::json;
//!
//! // 1. Provide a transport
//! struct Backend;
//!
//! impl Transport for Backend {
//!     fn send(&self, _request: Request) -> Response {
//!         Response::ok(json!({"objectId": "5f1a", "createdAt": "2024-02-01T00:00:00.000Z"}))
//!     }
//! }
//!
//! let client = Client::new(Backend, Config::default());
//!
//! // 2. Mutate a record
//! let todo = RecordRef::new(Record::new("Todo"));
//! todo.write().set("title", "ship it").unwrap();
//! todo.write().increase("priority", 1.0).unwrap();
//!
//! // 3. Save it
//! client.save(&todo).unwrap();
//! assert_eq!(todo.object_id().as_deref(), Some("5f1a"));
//!
//! // 4. Build a query
//! let mut query = Query::new("Todo");
//! query.where_key("priority", Constraint::GreaterThan(0.into())).unwrap();
//! assert_eq!(query.where_value(), json!({"priority": {"$gt": 0}}));
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod operation;
pub mod profiler;
pub mod query;
pub mod record;
pub mod registry;
pub mod transport;
pub mod value;

// Re-export main types at crate root
pub use client::{Client, CqlOutcome};
pub use config::{Config, ConfigError};
pub use error::Error;
pub use operation::{Operation, OperationKind, OperationTable, ReducedOperation};
pub use profiler::ObjectProfiler;
pub use query::{Constraint, Query};
pub use record::{InternalId, Record, RecordRef};
pub use registry::ClassRegistry;
pub use transport::{Endpoint, Method, Request, Response, Transport};
pub use value::{DistanceUnit, GeoDistance, GeoPoint, Relation, Value};

/// Type aliases for clarity
pub type ClassName = String;
pub type ObjectId = String;
