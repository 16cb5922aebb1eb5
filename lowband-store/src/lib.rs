//! On-device storage for the lowband sync subsystem
//!
//! This crate provides:
//! - A declared table schema shared with the remote backend
//! - An embedded transactional row cache keyed by table and primary key
//! - The durable mutation queue and its dead-letter log
//! - Change notifications for presentation layers

pub mod errors;
pub mod migrations;
pub mod queue;
pub mod row;
pub mod schema;
pub mod store;

pub use errors::{Result, StoreError};
pub use migrations::{current_version, run_migrations};
pub use queue::{
    DeadLetter, FailureOutcome, OperationKind, Priority, QueueCursor, QueueStats,
    QueuedOperation, DEFAULT_MAX_ATTEMPTS,
};
pub use row::{Row, Value, PRIMARY_KEY};
pub use schema::{Column, ColumnType, Schema, TableSchema, SCHEMA_VERSION};
pub use store::{ChangeOrigin, LocalStore, Mutation, SnapshotApplied, TableChange};
