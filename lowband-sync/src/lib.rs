//! Network side of the lowband offline-first sync subsystem
//!
//! This crate provides:
//! - A shared retry, backoff and timeout policy for every remote call
//! - The upload pipeline that drains the mutation queue
//! - The download pipeline that mirrors remote tables page by page
//! - Credential and remote backend contracts, with an HTTP backend
//! - A background engine wiring both pipelines to connectivity and triggers

pub mod config;
pub mod credentials;
pub mod download;
pub mod engine;
pub mod errors;
pub mod events;
pub mod remote;
pub mod resilience;
pub mod upload;

pub use config::SyncConfig;
pub use credentials::{
    CachingCredentialProvider, CredentialProvider, StaticCredentialProvider, SyncCredential,
};
pub use download::{DownloadConfig, DownloadPipeline, DownloadReport, TableSyncFailure, TableSyncReport};
pub use engine::{EngineConfig, SyncEngine, SyncEngineHandle};
pub use errors::{RemoteError, Result, SyncError};
pub use events::{ChannelEventSink, EventSink, SyncEvent, TracingEventSink};
pub use remote::{HttpBackend, PageRequest, RemoteBackend};
pub use resilience::{execute_with_retry, RetryPolicy};
pub use upload::{DrainResult, UploadConfig, UploadPipeline};
