//! Persistence layer: libSQL-backed job table and event log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, EventStore, JobStore, JobWrite, NewEvent};
