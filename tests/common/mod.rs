//! A remote backend shared by several simulated devices

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lowband::store::{LocalStore, Row, Schema, Value};
use lowband::sync::{
    ChannelEventSink, DownloadConfig, DownloadPipeline, PageRequest, RemoteBackend, RemoteError,
    RetryPolicy, StaticCredentialProvider, SyncCredential, SyncEvent, UploadConfig, UploadPipeline,
};
use tokio::sync::mpsc;

/// Remote tables plus an outage switch and a list of rows it refuses
#[derive(Default)]
pub struct SharedBackend {
    tables: Mutex<HashMap<String, BTreeMap<String, Row>>>,
    down: AtomicBool,
    forbidden: Mutex<Vec<String>>,
}

impl SharedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Writes to `row_id` are rejected with 403 until allowed again
    pub fn forbid(&self, row_id: &str) {
        self.forbidden.lock().unwrap().push(row_id.to_string());
    }

    pub fn allow(&self, row_id: &str) {
        self.forbidden.lock().unwrap().retain(|id| id != row_id);
    }

    pub fn row(&self, table: &str, row_id: &str) -> Option<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|rows| rows.get(row_id).cloned())
    }

    fn check(&self, row_id: Option<&str>) -> Result<(), RemoteError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RemoteError::Connection("network unreachable".into()));
        }
        if let Some(row_id) = row_id {
            if self.forbidden.lock().unwrap().iter().any(|id| id == row_id) {
                return Err(RemoteError::Http {
                    status: 403,
                    body: "row-level security violation".into(),
                });
            }
        }
        Ok(())
    }

    fn merge(&self, table: &str, row_id: &str, columns: &Row, create: bool) {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        if !create && !rows.contains_key(row_id) {
            return;
        }
        let row = rows
            .entry(row_id.to_string())
            .or_insert_with(|| Row::new().with("id", row_id));
        for (column, value) in columns.iter() {
            row.set(column, value.clone());
        }
    }
}

#[async_trait]
impl RemoteBackend for SharedBackend {
    async fn upsert_row(&self, _: &SyncCredential, table: &str, row: &Row) -> Result<(), RemoteError> {
        let row_id = row.id().unwrap_or_default().to_string();
        self.check(Some(&row_id))?;
        self.merge(table, &row_id, row, true);
        Ok(())
    }

    async fn update_row(
        &self,
        _: &SyncCredential,
        table: &str,
        row_id: &str,
        changes: &Row,
    ) -> Result<(), RemoteError> {
        self.check(Some(row_id))?;
        self.merge(table, row_id, changes, false);
        Ok(())
    }

    async fn delete_row(&self, _: &SyncCredential, table: &str, row_id: &str) -> Result<(), RemoteError> {
        self.check(Some(row_id))?;
        if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
            rows.remove(row_id);
        }
        Ok(())
    }

    async fn fetch_page(&self, _: &SyncCredential, request: &PageRequest) -> Result<Vec<Row>, RemoteError> {
        self.check(None)?;
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<Row> = tables
            .get(&request.table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        let key = |row: &Row| match row.get(&request.sort_key) {
            Some(Value::Text(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        rows.sort_by(|a, b| key(b).cmp(&key(a)).then_with(|| a.id().cmp(&b.id())));
        Ok(rows.into_iter().skip(request.offset).take(request.limit).collect())
    }
}

/// One simulated device: its own store and pipelines against the shared backend
pub struct Device {
    pub store: LocalStore,
    pub upload: Arc<UploadPipeline>,
    pub download: Arc<DownloadPipeline>,
    pub events: mpsc::UnboundedReceiver<SyncEvent>,
}

impl Device {
    pub fn in_memory(backend: &Arc<SharedBackend>) -> Self {
        Self::with_store(LocalStore::open_in_memory(Schema::social()).unwrap(), backend)
    }

    pub fn on_disk(path: &Path, backend: &Arc<SharedBackend>) -> Self {
        Self::with_store(LocalStore::open(path, Schema::social()).unwrap(), backend)
    }

    fn with_store(store: LocalStore, backend: &Arc<SharedBackend>) -> Self {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            jitter: false,
            ..RetryPolicy::default()
        };
        let credentials = Arc::new(StaticCredentialProvider::new("memory://shared", "token"));
        let (sink, events) = ChannelEventSink::new();
        let sink = Arc::new(sink);

        let upload = Arc::new(UploadPipeline::new(
            store.clone(),
            backend.clone(),
            credentials.clone(),
            sink.clone(),
            UploadConfig { retry: policy.clone() },
        ));
        let download = Arc::new(DownloadPipeline::new(
            store.clone(),
            backend.clone(),
            credentials,
            sink,
            DownloadConfig {
                retry: policy,
                ..DownloadConfig::default()
            },
        ));

        Self {
            store,
            upload,
            download,
            events,
        }
    }

    pub async fn pull(&self, table: &str) {
        self.download.sync_table(table, 50).await.unwrap();
    }

    pub fn title(&self, post_id: &str) -> Option<String> {
        self.store
            .get_row("posts", post_id)
            .unwrap()
            .and_then(|row| row.get("title").and_then(|v| v.as_str().map(str::to_string)))
    }
}

pub fn post(title: &str, created_at: &str) -> Row {
    Row::new()
        .with("author_id", "u1")
        .with("title", title)
        .with("created_at", created_at)
}
