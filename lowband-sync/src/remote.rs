//! Remote relational backend
//!
//! [`RemoteBackend`] is the seam the pipelines talk through. [`HttpBackend`]
//! implements it against a PostgREST-style REST API.

use std::time::Duration;

use async_trait::async_trait;
use lowband_store::{Row, TableSchema, PRIMARY_KEY};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, trace};

use crate::credentials::SyncCredential;
use crate::errors::{RemoteError, SyncError};

const PREFER_MERGE: &str = "resolution=merge-duplicates,return=minimal";
const PREFER_MINIMAL: &str = "return=minimal";

/// One page of a latest-first table listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub table: String,
    pub sort_key: String,
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(table: &TableSchema, limit: usize) -> Self {
        Self {
            table: table.name.clone(),
            sort_key: table.sort_key.clone(),
            offset: 0,
            limit,
        }
    }

    pub fn next(&self, fetched: usize) -> Self {
        Self {
            offset: self.offset + fetched,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Insert or fully replace the row identified by its `id` column
    async fn upsert_row(
        &self,
        credential: &SyncCredential,
        table: &str,
        row: &Row,
    ) -> Result<(), RemoteError>;

    /// Overwrite the given columns of one row
    async fn update_row(
        &self,
        credential: &SyncCredential,
        table: &str,
        row_id: &str,
        changes: &Row,
    ) -> Result<(), RemoteError>;

    /// Delete one row; deleting a missing row succeeds
    async fn delete_row(
        &self,
        credential: &SyncCredential,
        table: &str,
        row_id: &str,
    ) -> Result<(), RemoteError>;

    /// Rows ordered by `sort_key` descending, `limit` rows from `offset`
    async fn fetch_page(
        &self,
        credential: &SyncCredential,
        request: &PageRequest,
    ) -> Result<Vec<Row>, RemoteError>;
}

/// REST client for a PostgREST-compatible endpoint
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(api_key: Option<String>, request_timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10).min(request_timeout))
            .timeout(request_timeout)
            .user_agent(concat!("lowband/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self { client, api_key })
    }

    fn table_url(credential: &SyncCredential, table: &str) -> String {
        format!(
            "{}/rest/v1/{}",
            credential.endpoint.trim_end_matches('/'),
            table
        )
    }

    fn authorized(&self, builder: RequestBuilder, credential: &SyncCredential) -> RequestBuilder {
        let builder = builder.bearer_auth(&credential.token);
        match &self.api_key {
            Some(key) => builder.header("apikey", key),
            None => builder,
        }
    }

    fn row_filter(row_id: &str) -> [(&'static str, String); 1] {
        [(PRIMARY_KEY, format!("eq.{}", row_id))]
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        check_status(response).await
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn upsert_row(
        &self,
        credential: &SyncCredential,
        table: &str,
        row: &Row,
    ) -> Result<(), RemoteError> {
        let url = Self::table_url(credential, table);
        trace!(%url, row_id = ?row.id(), "POST");
        let request = self
            .client
            .post(&url)
            .header("Prefer", PREFER_MERGE)
            .json(row);
        self.send(self.authorized(request, credential)).await?;
        Ok(())
    }

    async fn update_row(
        &self,
        credential: &SyncCredential,
        table: &str,
        row_id: &str,
        changes: &Row,
    ) -> Result<(), RemoteError> {
        let url = Self::table_url(credential, table);
        trace!(%url, row_id, "PATCH");
        let request = self
            .client
            .patch(&url)
            .query(&Self::row_filter(row_id))
            .header("Prefer", PREFER_MINIMAL)
            .json(changes);
        self.send(self.authorized(request, credential)).await?;
        Ok(())
    }

    async fn delete_row(
        &self,
        credential: &SyncCredential,
        table: &str,
        row_id: &str,
    ) -> Result<(), RemoteError> {
        let url = Self::table_url(credential, table);
        trace!(%url, row_id, "DELETE");
        let request = self
            .client
            .delete(&url)
            .query(&Self::row_filter(row_id))
            .header("Prefer", PREFER_MINIMAL);
        self.send(self.authorized(request, credential)).await?;
        Ok(())
    }

    async fn fetch_page(
        &self,
        credential: &SyncCredential,
        request: &PageRequest,
    ) -> Result<Vec<Row>, RemoteError> {
        let url = Self::table_url(credential, &request.table);
        debug!(
            table = %request.table,
            offset = request.offset,
            limit = request.limit,
            "Fetching page"
        );
        let builder = self.client.get(&url).query(&[
            ("select", "*".to_string()),
            ("order", format!("{}.desc,{}.asc", request.sort_key, PRIMARY_KEY)),
            ("offset", request.offset.to_string()),
            ("limit", request.limit.to_string()),
        ]);
        let response = self.send(self.authorized(builder, credential)).await?;
        response
            .json::<Vec<Row>>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return Err(RemoteError::Unauthorized(body));
    }
    Err(RemoteError::Http {
        status: status.as_u16(),
        body,
    })
}

fn map_transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else if error.is_decode() {
        RemoteError::Decode(error.to_string())
    } else if let Some(status) = error.status() {
        RemoteError::Http {
            status: status.as_u16(),
            body: error.to_string(),
        }
    } else {
        RemoteError::Connection(error.to_string())
    }
}
