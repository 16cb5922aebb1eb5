//! lowband workspace root
//!
//! Re-exports the store and sync crates and hosts end-to-end tests that run
//! several devices against one remote backend.

pub use lowband_store as store;
pub use lowband_sync as sync;

pub use lowband_store::{LocalStore, Mutation, OperationKind, Priority, Row, Schema, Value};
pub use lowband_sync::{
    DownloadPipeline, RetryPolicy, SyncConfig, SyncEngine, SyncError, SyncEvent, UploadPipeline,
};
