//! Error types for sync operations

use thiserror::Error;

/// Failure reported by the remote backend or the transport underneath it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Timeouts, connection failures, 408, 429 and 5xx are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Timeout | RemoteError::Connection(_) => true,
            RemoteError::Http { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            RemoteError::Unauthorized(_) | RemoteError::Decode(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] lowband_store::StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Credential error: {0}")]
    Auth(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl SyncError {
    /// Default retry predicate of the resilience policy
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Timeout(_) => true,
            SyncError::Remote(remote) => remote.is_retryable(),
            _ => false,
        }
    }

    /// No valid session, or the backend rejected the bearer token
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_) | SyncError::Remote(RemoteError::Unauthorized(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
