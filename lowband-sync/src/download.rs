//! Download pipeline: pulls remote snapshots into the local store

use std::sync::Arc;
use std::time::Duration;

use lowband_store::{LocalStore, TableSchema};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::credentials::{fresh_credential, CredentialProvider};
use crate::errors::{Result, SyncError};
use crate::events::{EventSink, SyncEvent};
use crate::remote::{PageRequest, RemoteBackend};
use crate::resilience::{execute_with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadConfig {
    /// Bound on the whole pagination of one table
    pub table_timeout: Duration,
    /// Policy for each page request
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            table_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSyncReport {
    pub table: String,
    pub pages: usize,
    pub rows_applied: usize,
    /// Rows kept as-is because local operations for them are still queued
    pub rows_skipped: usize,
    /// Another download was already running; this call fetched nothing
    pub coalesced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSyncFailure {
    pub table: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub synced: Vec<TableSyncReport>,
    pub failures: Vec<TableSyncFailure>,
    /// Another download was already running; this call did no work
    pub coalesced: bool,
}

impl DownloadReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct DownloadPipeline {
    store: LocalStore,
    backend: Arc<dyn RemoteBackend>,
    credentials: Arc<dyn CredentialProvider>,
    sink: Arc<dyn EventSink>,
    config: DownloadConfig,
    running: Mutex<()>,
}

impl DownloadPipeline {
    pub fn new(
        store: LocalStore,
        backend: Arc<dyn RemoteBackend>,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn EventSink>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            store,
            backend,
            credentials,
            sink,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Pull every page of `table`, latest first, until a short page
    pub async fn sync_table(&self, table: &str, page_size: usize) -> Result<TableSyncReport> {
        self.sync_table_with_cancel(table, page_size, &CancellationToken::new())
            .await
    }

    /// Like [`sync_table`](Self::sync_table) but stops at the next await
    /// point once `cancel` fires. Pages already applied stay applied.
    ///
    /// Shares the pipeline's single-flight lock with
    /// [`sync_tables`](Self::sync_tables): while another download runs, the
    /// call returns at once with `coalesced` set.
    pub async fn sync_table_with_cancel(
        &self,
        table: &str,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<TableSyncReport> {
        let _running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(table, "Download already in progress, coalescing");
                return Ok(TableSyncReport {
                    table: table.to_string(),
                    coalesced: true,
                    ..TableSyncReport::default()
                });
            }
        };
        self.sync_table_locked(table, page_size, cancel).await
    }

    /// Caller holds `running`
    async fn sync_table_locked(
        &self,
        table: &str,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<TableSyncReport> {
        if page_size == 0 {
            return Err(SyncError::InvalidConfig("page size must be positive".into()));
        }
        let table_schema = self.store.schema().table(table)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(table, "Table sync cancelled");
                Err(SyncError::Cancelled(format!("sync of table {}", table)))
            }
            outcome = timeout(self.config.table_timeout, self.pull_pages(table_schema, page_size)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout(format!(
                        "sync of table {} after {:?}",
                        table, self.config.table_timeout
                    ))),
                }
            }
        }
    }

    async fn pull_pages(&self, table: &TableSchema, page_size: usize) -> Result<TableSyncReport> {
        let backend = self.backend.as_ref();
        let credentials = self.credentials.as_ref();
        let mut report = TableSyncReport {
            table: table.name.clone(),
            ..TableSyncReport::default()
        };
        let mut request = PageRequest::first(table, page_size);

        loop {
            let page = &request;
            let rows = execute_with_retry(&self.config.retry, SyncError::is_retryable, |_| async move {
                let credential = fresh_credential(credentials).await?;
                Ok(backend.fetch_page(&credential, page).await?)
            })
            .await?;

            let fetched = rows.len();
            let applied = self.store.replace_snapshot_batch(&table.name, &rows)?;
            report.pages += 1;
            report.rows_applied += applied.applied.len();
            report.rows_skipped += applied.skipped.len();
            debug!(
                table = %table.name,
                offset = request.offset,
                fetched,
                skipped = applied.skipped.len(),
                "Applied page"
            );

            if fetched < page_size {
                break;
            }
            request = request.next(fetched);
        }

        Ok(report)
    }

    /// Sync several tables in order. Failures are collected per table and
    /// emitted to the event sink; they never abort the remaining tables.
    pub async fn sync_tables(&self, tables: &[String], page_size: usize) -> DownloadReport {
        self.sync_tables_with_cancel(tables, page_size, &CancellationToken::new())
            .await
    }

    pub async fn sync_tables_with_cancel(
        &self,
        tables: &[String],
        page_size: usize,
        cancel: &CancellationToken,
    ) -> DownloadReport {
        let _running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Download already in progress, coalescing");
                return DownloadReport {
                    coalesced: true,
                    ..DownloadReport::default()
                };
            }
        };

        let mut report = DownloadReport::default();
        for table in tables {
            if cancel.is_cancelled() {
                break;
            }
            match self.sync_table_locked(table, page_size, cancel).await {
                Ok(synced) => {
                    info!(
                        table = %synced.table,
                        pages = synced.pages,
                        rows = synced.rows_applied,
                        skipped = synced.rows_skipped,
                        "Table synced"
                    );
                    report.synced.push(synced);
                }
                Err(SyncError::Cancelled(_)) => break,
                Err(e) => {
                    if e.is_credential_failure() {
                        self.credentials.invalidate();
                    }
                    error!(table = %table, "Table sync failed: {}", e);
                    self.sink.emit(SyncEvent::table_failed(table.as_str(), &e));
                    report.failures.push(TableSyncFailure {
                        table: table.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.failures.is_empty() {
            warn!(
                synced = report.synced.len(),
                failed = report.failures.len(),
                "Download finished with failures"
            );
        }
        report
    }
}
