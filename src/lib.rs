//! A bi-directional data migration engine between two Salesforce
//! organizations (or between an organization and CSV files on disk).
//!
//! Given a declarative, already-parsed script describing a set of related
//! objects, their queries, external-identifier fields, and desired
//! operation, this crate extracts records from a source, resolves
//! cross-object relationships by external id, and applies the
//! corresponding changes to a target, choosing between a streaming REST
//! API and two variants of a batched bulk ingest API based on volume.
//!
//! The script-file parser, CLI wrapper, credential acquisition, and HTTP
//! transport are external collaborators. This crate specifies and
//! consumes their interfaces (see [`script`] and [`transport`]) but does
//! not implement them beyond a default, ambient [`transport::ReqwestTransport`].

pub mod config;
pub mod csv_repair;
pub mod engine;
pub mod error;
pub mod graph;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod resolver;
pub mod retrieval;
pub mod schema;
pub mod script;
pub mod transport;
pub mod value;

pub use error::MigrateError;
pub use model::{ComplexField, FieldDescriptor, ObjectDescriptor, Operation, Task};
pub use pipeline::{run_object_sets, RunSummary};
pub use progress::init_logging;
