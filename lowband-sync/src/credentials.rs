//! Session credentials for the remote backend
//!
//! Pipelines never hold a token across cycles: every remote attempt asks the
//! provider for a credential, so refreshes and sign-outs take effect on the
//! next request.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::errors::{Result, SyncError};

/// Endpoint plus bearer token for one session
#[derive(Clone, PartialEq, Eq)]
pub struct SyncCredential {
    pub endpoint: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl SyncCredential {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::zero())
    }

    pub fn expires_within(&self, window: Duration) -> bool {
        self.expires_at <= Utc::now() + window
    }
}

impl fmt::Debug for SyncCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCredential")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of the current session credential
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current credential, refreshed by the provider if it can.
    /// Returns [`SyncError::Auth`] when there is no valid session.
    async fn fetch_credential(&self) -> Result<SyncCredential>;

    /// Drop any cached credential after the backend rejected it
    fn invalidate(&self) {}
}

/// Fixed endpoint and token, e.g. a service key taken from the environment
pub struct StaticCredentialProvider {
    endpoint: String,
    token: Option<String>,
    lifetime: Duration,
}

impl StaticCredentialProvider {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: Some(token.into()),
            lifetime: Duration::hours(1),
        }
    }

    /// Provider for a signed-out client; every fetch fails
    pub fn signed_out(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            lifetime: Duration::zero(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn fetch_credential(&self) -> Result<SyncCredential> {
        match &self.token {
            Some(token) => Ok(SyncCredential::new(
                self.endpoint.clone(),
                token.clone(),
                Utc::now() + self.lifetime,
            )),
            None => Err(SyncError::Auth("no active session".to_string())),
        }
    }
}

/// Caches the credential of an inner provider until it nears expiry
pub struct CachingCredentialProvider<P> {
    inner: P,
    cached: Mutex<Option<SyncCredential>>,
    refresh_skew: Duration,
}

impl<P: CredentialProvider> CachingCredentialProvider<P> {
    pub fn new(inner: P) -> Self {
        Self::with_refresh_skew(inner, Duration::seconds(60))
    }

    /// Refresh once the cached credential expires within `refresh_skew`
    pub fn with_refresh_skew(inner: P, refresh_skew: Duration) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
            refresh_skew,
        }
    }

    fn cached(&self) -> Option<SyncCredential> {
        let guard = self.cached.lock().ok()?;
        guard
            .as_ref()
            .filter(|credential| !credential.expires_within(self.refresh_skew))
            .cloned()
    }
}

#[async_trait]
impl<P: CredentialProvider> CredentialProvider for CachingCredentialProvider<P> {
    async fn fetch_credential(&self) -> Result<SyncCredential> {
        if let Some(credential) = self.cached() {
            return Ok(credential);
        }

        debug!("Refreshing sync credential");
        let credential = self.inner.fetch_credential().await?;
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some(credential.clone());
        }
        Ok(credential)
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.cached.lock() {
            if guard.take().is_some() {
                info!("Discarded cached sync credential");
            }
        }
        self.inner.invalidate();
    }
}

/// Fetch a credential that has not expired yet, asking the provider to
/// refresh once if the first one is stale.
pub(crate) async fn fresh_credential(provider: &dyn CredentialProvider) -> Result<SyncCredential> {
    let credential = provider.fetch_credential().await?;
    if !credential.is_expired() {
        return Ok(credential);
    }

    provider.invalidate();
    let credential = provider.fetch_credential().await?;
    if credential.is_expired() {
        return Err(SyncError::Auth("session expired".to_string()));
    }
    Ok(credential)
}
