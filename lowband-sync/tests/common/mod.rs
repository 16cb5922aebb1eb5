//! Shared fixtures for sync integration tests

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lowband_store::{LocalStore, Row, Schema, Value};
use lowband_sync::{
    ChannelEventSink, CredentialProvider, DownloadConfig, DownloadPipeline, PageRequest,
    RemoteBackend, RemoteError, RetryPolicy, SyncCredential, SyncError, SyncEvent, UploadConfig,
    UploadPipeline,
};
use tokio::sync::mpsc;

/// A request observed by [`MemoryBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Upsert { table: String, row_id: String },
    Update { table: String, row_id: String },
    Delete { table: String, row_id: String },
    Fetch { table: String, offset: usize, limit: usize },
}

impl Call {
    pub fn row_id(&self) -> Option<&str> {
        match self {
            Call::Upsert { row_id, .. } | Call::Update { row_id, .. } | Call::Delete { row_id, .. } => {
                Some(row_id)
            }
            Call::Fetch { .. } => None,
        }
    }
}

#[derive(Default)]
struct BackendState {
    tables: HashMap<String, BTreeMap<String, Row>>,
    calls: Vec<Call>,
    /// Consumed one per request, before anything else is checked
    scripted: VecDeque<RemoteError>,
    /// Every write to these rows fails until cleared
    failing_rows: HashMap<String, RemoteError>,
    /// Every fetch of these tables fails until cleared
    failing_tables: HashMap<String, RemoteError>,
    /// Apply the next write, then report a timeout as if the reply was lost
    lose_next_ack: bool,
}

/// In-memory remote backend with failure injection and a call log
pub struct MemoryBackend {
    schema: Schema,
    state: Mutex<BackendState>,
    latency: Mutex<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            schema: Schema::social(),
            state: Mutex::new(BackendState::default()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().unwrap().scripted.push_back(error);
    }

    pub fn fail_row(&self, row_id: &str, error: RemoteError) {
        self.state
            .lock()
            .unwrap()
            .failing_rows
            .insert(row_id.to_string(), error);
    }

    pub fn heal_row(&self, row_id: &str) {
        self.state.lock().unwrap().failing_rows.remove(row_id);
    }

    pub fn fail_table(&self, table: &str, error: RemoteError) {
        self.state
            .lock()
            .unwrap()
            .failing_tables
            .insert(table.to_string(), error);
    }

    pub fn lose_next_ack(&self) {
        self.state.lock().unwrap().lose_next_ack = true;
    }

    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.state.lock().unwrap();
        let table = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            let id = row.id().expect("seeded rows need an id").to_string();
            table.insert(id, row);
        }
    }

    pub fn row(&self, table: &str, row_id: &str) -> Option<Row> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .and_then(|rows| rows.get(row_id).cloned())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map_or(0, |rows| rows.len())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, row_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.row_id() == Some(row_id))
            .count()
    }

    pub fn fetches(&self, table: &str) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Fetch { table: t, offset, .. } if t == table => Some(offset),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_credential(credential: &SyncCredential) -> Result<(), RemoteError> {
        if credential.token == "revoked" {
            return Err(RemoteError::Unauthorized("JWT expired".into()));
        }
        Ok(())
    }

    /// Record `call`, then either fail it or apply `write`
    fn write(
        &self,
        credential: &SyncCredential,
        call: Call,
        write: impl FnOnce(&mut BTreeMap<String, Row>),
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.clone());
        Self::check_credential(credential)?;
        if let Some(error) = state.scripted.pop_front() {
            return Err(error);
        }
        let (table, row_id) = match &call {
            Call::Upsert { table, row_id }
            | Call::Update { table, row_id }
            | Call::Delete { table, row_id } => (table.clone(), row_id.clone()),
            Call::Fetch { .. } => unreachable!("fetches are not writes"),
        };
        if let Some(error) = state.failing_rows.get(&row_id) {
            return Err(error.clone());
        }

        write(state.tables.entry(table).or_default());

        if std::mem::take(&mut state.lose_next_ack) {
            return Err(RemoteError::Timeout);
        }
        Ok(())
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Integer(a)), Some(Value::Integer(b))) => a.cmp(b),
        (Some(Value::Text(a)), Some(Value::Text(b))) => a.cmp(b),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        // Nulls sort last in descending order
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn upsert_row(
        &self,
        credential: &SyncCredential,
        table: &str,
        row: &Row,
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let row_id = row
            .id()
            .ok_or_else(|| RemoteError::Http { status: 400, body: "missing id".into() })?
            .to_string();
        let call = Call::Upsert { table: table.to_string(), row_id: row_id.clone() };
        self.write(credential, call, |rows| {
            let merged = rows.entry(row_id).or_default();
            for (column, value) in row.iter() {
                merged.set(column, value.clone());
            }
        })
    }

    async fn update_row(
        &self,
        credential: &SyncCredential,
        table: &str,
        row_id: &str,
        changes: &Row,
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let call = Call::Update { table: table.to_string(), row_id: row_id.to_string() };
        self.write(credential, call, |rows| {
            if let Some(existing) = rows.get_mut(row_id) {
                for (column, value) in changes.iter() {
                    existing.set(column, value.clone());
                }
            }
        })
    }

    async fn delete_row(
        &self,
        credential: &SyncCredential,
        table: &str,
        row_id: &str,
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let call = Call::Delete { table: table.to_string(), row_id: row_id.to_string() };
        self.write(credential, call, |rows| {
            rows.remove(row_id);
        })
    }

    async fn fetch_page(
        &self,
        credential: &SyncCredential,
        request: &PageRequest,
    ) -> Result<Vec<Row>, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Fetch {
            table: request.table.clone(),
            offset: request.offset,
            limit: request.limit,
        });
        Self::check_credential(credential)?;
        if let Some(error) = state.scripted.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.failing_tables.get(&request.table) {
            return Err(error.clone());
        }
        if self.schema.table(&request.table).is_err() {
            return Err(RemoteError::Http { status: 404, body: "no such table".into() });
        }

        let mut rows: Vec<Row> = state
            .tables
            .get(&request.table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            compare_values(b.get(&request.sort_key), a.get(&request.sort_key))
                .then_with(|| a.id().cmp(&b.id()))
        });
        Ok(rows
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .collect())
    }
}

/// Credential provider that can be signed out and back in
pub struct TestCredentials {
    signed_in: AtomicBool,
    token: Mutex<String>,
    pub fetches: AtomicU32,
    pub invalidations: AtomicU32,
}

impl TestCredentials {
    pub fn new() -> Self {
        Self {
            signed_in: AtomicBool::new(true),
            token: Mutex::new("valid".into()),
            fetches: AtomicU32::new(0),
            invalidations: AtomicU32::new(0),
        }
    }

    pub fn sign_out(&self) {
        self.signed_in.store(false, AtomicOrdering::SeqCst);
    }

    pub fn sign_in(&self, token: &str) {
        *self.token.lock().unwrap() = token.to_string();
        self.signed_in.store(true, AtomicOrdering::SeqCst);
    }

    pub fn invalidations(&self) -> u32 {
        self.invalidations.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for TestCredentials {
    async fn fetch_credential(&self) -> lowband_sync::Result<SyncCredential> {
        self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
        if !self.signed_in.load(AtomicOrdering::SeqCst) {
            return Err(SyncError::Auth("signed out".into()));
        }
        let token = self.token.lock().unwrap().clone();
        Ok(SyncCredential::new(
            "memory://sync",
            token,
            Utc::now() + chrono::Duration::hours(1),
        ))
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, AtomicOrdering::SeqCst);
    }
}

/// Deterministic policy: no jitter, two retries, 1s base delay
pub fn test_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        jitter: false,
        max_delay: Duration::from_secs(10),
        attempt_timeout: Duration::from_secs(30),
    }
}

pub fn unavailable() -> RemoteError {
    RemoteError::Http { status: 503, body: "service unavailable".into() }
}

pub fn server_error() -> RemoteError {
    RemoteError::Http { status: 500, body: "internal error".into() }
}

pub fn post(author: &str, title: &str, created_at: &str) -> Row {
    Row::new()
        .with("author_id", author)
        .with("title", title)
        .with("created_at", created_at)
}

/// Remote post row with an id, `created_at` spaced one second apart by `n`
pub fn remote_post(n: usize) -> Row {
    post("u1", &format!("remote {}", n), &format!("2024-01-01T00:{:02}:{:02}Z", n / 60, n % 60))
        .with("id", format!("r{:04}", n))
}

pub struct Harness {
    pub store: LocalStore,
    pub backend: Arc<MemoryBackend>,
    pub credentials: Arc<TestCredentials>,
    pub events: mpsc::UnboundedReceiver<SyncEvent>,
    pub upload: Arc<UploadPipeline>,
    pub download: Arc<DownloadPipeline>,
}

impl Harness {
    pub fn new() -> Self {
        let store = LocalStore::open_in_memory(Schema::social()).unwrap();
        Self::with_store(store, DownloadConfig {
            retry: test_policy(),
            ..DownloadConfig::default()
        })
    }

    pub fn with_store(store: LocalStore, download: DownloadConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let credentials = Arc::new(TestCredentials::new());
        let (sink, events) = ChannelEventSink::new();
        let sink = Arc::new(sink);

        let upload = Arc::new(UploadPipeline::new(
            store.clone(),
            backend.clone(),
            credentials.clone(),
            sink.clone(),
            UploadConfig { retry: test_policy() },
        ));
        let download = Arc::new(DownloadPipeline::new(
            store.clone(),
            backend.clone(),
            credentials.clone(),
            sink,
            download,
        ));

        Self {
            store,
            backend,
            credentials,
            events,
            upload,
            download,
        }
    }

    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
