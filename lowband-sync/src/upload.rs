//! Upload pipeline: drains the mutation queue to the remote backend

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lowband_store::{
    DeadLetter, FailureOutcome, LocalStore, OperationKind, QueueCursor, QueuedOperation, PRIMARY_KEY,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::credentials::{fresh_credential, CredentialProvider};
use crate::errors::{RemoteError, Result, SyncError};
use crate::events::{EventSink, SyncEvent};
use crate::remote::RemoteBackend;
use crate::resilience::{execute_with_retry, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadConfig {
    /// Policy for the network call of each operation
    pub retry: RetryPolicy,
}

/// Outcome of one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainResult {
    /// Operations acknowledged by the backend and removed from the queue
    pub uploaded: usize,
    /// Operations moved to the dead-letter log
    pub dead_lettered: usize,
    /// Operations that failed and stay queued with one more attempt recorded
    pub requeued: usize,
    /// Operations left queued behind an older operation for the same row
    pub deferred: usize,
    /// Another drain was already running; this call did no work
    pub coalesced: bool,
    /// The drain stopped early because no valid credential was available
    pub credential_failure: bool,
}

impl DrainResult {
    fn absorb(&mut self, pass: DrainResult) {
        self.uploaded += pass.uploaded;
        self.dead_lettered += pass.dead_lettered;
        self.requeued += pass.requeued;
        // Deferred operations are revisited by later passes
        self.deferred = pass.deferred;
        self.credential_failure |= pass.credential_failure;
    }
}

pub struct UploadPipeline {
    store: LocalStore,
    backend: Arc<dyn RemoteBackend>,
    credentials: Arc<dyn CredentialProvider>,
    sink: Arc<dyn EventSink>,
    config: UploadConfig,
    /// Held for the whole drain. Carries the operation whose 401 stopped the
    /// previous drain, so a second rejection after the refresh counts
    /// against that operation instead of stopping the queue again.
    running: Mutex<Option<i64>>,
    rerun_requested: AtomicBool,
}

impl UploadPipeline {
    pub fn new(
        store: LocalStore,
        backend: Arc<dyn RemoteBackend>,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn EventSink>,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            backend,
            credentials,
            sink,
            config,
            running: Mutex::new(None),
            rerun_requested: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Upload pending operations in queue order, `batch_size` at a time.
    ///
    /// Only one drain runs at a time. A call made while a drain is in
    /// progress returns immediately with `coalesced` set and makes the
    /// running drain walk the queue once more before it returns.
    ///
    /// A credential failure stops the drain without spending attempts. If
    /// the backend answers 401 for the same operation on the next drain,
    /// after the credential was refreshed, that rejection counts as a failed
    /// attempt and the drain moves on to the other rows.
    pub async fn drain(&self, batch_size: usize) -> Result<DrainResult> {
        if batch_size == 0 {
            return Err(SyncError::InvalidConfig("batch size must be positive".into()));
        }

        let mut running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.rerun_requested.store(true, Ordering::SeqCst);
                debug!("Drain already in progress, coalescing");
                return Ok(DrainResult {
                    coalesced: true,
                    ..DrainResult::default()
                });
            }
        };

        // Rows that failed during this drain stay blocked for all of its passes
        let mut failed_rows: HashSet<(String, String)> = HashSet::new();
        let mut total = DrainResult::default();
        loop {
            self.rerun_requested.store(false, Ordering::SeqCst);
            let pass = self
                .drain_pass(batch_size, &mut failed_rows, &mut running)
                .await?;
            let progressed = pass.uploaded + pass.dead_lettered > 0;
            let unblocked = progressed && pass.deferred > 0;
            let stop = pass.credential_failure;
            total.absorb(pass);

            if stop {
                break;
            }
            if self.rerun_requested.swap(false, Ordering::SeqCst) {
                debug!("Rerunning drain for operations queued meanwhile");
            } else if unblocked {
                debug!("Rerunning drain for operations unblocked by this pass");
            } else {
                break;
            }
        }

        if total.uploaded + total.dead_lettered + total.requeued > 0 {
            info!(
                uploaded = total.uploaded,
                requeued = total.requeued,
                dead_lettered = total.dead_lettered,
                deferred = total.deferred,
                "Drain complete"
            );
        }
        Ok(total)
    }

    async fn drain_pass(
        &self,
        batch_size: usize,
        failed_rows: &mut HashSet<(String, String)>,
        rejected: &mut Option<i64>,
    ) -> Result<DrainResult> {
        let mut result = DrainResult::default();
        let mut cursor: Option<QueueCursor> = None;

        loop {
            let batch = match &cursor {
                None => self.store.get_pending_operations(batch_size)?,
                Some(after) => self.store.get_pending_operations_after(after, batch_size)?,
            };
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.position());
            let batch_len = batch.len();

            for op in batch {
                if failed_rows.contains(&op.row_key()) || self.store.has_earlier_operation(&op)? {
                    debug!(operation_id = op.id, table = %op.table, row_id = %op.row_id, "Deferred behind an older operation");
                    result.deferred += 1;
                    continue;
                }

                if op.is_exhausted() {
                    let letter = self
                        .store
                        .dead_letter_operation(op.id, "attempts exhausted")?;
                    self.report_dead_letter(&letter);
                    result.dead_lettered += 1;
                    continue;
                }

                match self.upload_operation(&op).await {
                    Ok(()) => {
                        self.store.complete_operation(op.id)?;
                        debug!(operation_id = op.id, table = %op.table, row_id = %op.row_id, "Uploaded");
                        result.uploaded += 1;
                    }
                    Err(e)
                        if e.is_credential_failure()
                            && !(is_rejected_token(&e) && *rejected == Some(op.id)) =>
                    {
                        warn!(operation_id = op.id, "Stopping drain, no valid credential: {}", e);
                        if is_rejected_token(&e) {
                            *rejected = Some(op.id);
                        }
                        self.credentials.invalidate();
                        result.credential_failure = true;
                        return Ok(result);
                    }
                    Err(e) if e.is_retryable() || is_rejected_token(&e) => {
                        if is_rejected_token(&e) {
                            warn!(operation_id = op.id, "Rejected again after credential refresh: {}", e);
                        }
                        match self.store.record_failed_attempt(op.id, &e.to_string())? {
                            FailureOutcome::Requeued { attempts } => {
                                warn!(
                                    operation_id = op.id,
                                    table = %op.table,
                                    row_id = %op.row_id,
                                    attempt = attempts,
                                    "Upload failed, will retry next drain: {}",
                                    e
                                );
                                failed_rows.insert(op.row_key());
                                result.requeued += 1;
                            }
                            FailureOutcome::DeadLettered(letter) => {
                                self.report_dead_letter(&letter);
                                result.dead_lettered += 1;
                            }
                        }
                    }
                    Err(e) => {
                        let letter = self.store.dead_letter_operation(op.id, &e.to_string())?;
                        self.report_dead_letter(&letter);
                        result.dead_lettered += 1;
                    }
                }
            }

            if batch_len < batch_size {
                break;
            }
        }

        Ok(result)
    }

    async fn upload_operation(&self, op: &QueuedOperation) -> Result<()> {
        let backend = self.backend.as_ref();
        let credentials = self.credentials.as_ref();
        let row = op.payload.clone().with(PRIMARY_KEY, op.row_id.as_str());
        let row = &row;

        execute_with_retry(&self.config.retry, SyncError::is_retryable, |attempt| async move {
            let credential = fresh_credential(credentials).await?;
            debug!(operation_id = op.id, attempt, kind = %op.kind, "Sending operation");
            match op.kind {
                OperationKind::Insert => backend.upsert_row(&credential, &op.table, row).await?,
                OperationKind::Update => {
                    backend
                        .update_row(&credential, &op.table, &op.row_id, &op.payload)
                        .await?
                }
                OperationKind::Delete => backend.delete_row(&credential, &op.table, &op.row_id).await?,
            }
            Ok(())
        })
        .await
    }

    fn report_dead_letter(&self, letter: &DeadLetter) {
        error!(
            operation_id = letter.operation.id,
            table = %letter.operation.table,
            row_id = %letter.operation.row_id,
            attempts = letter.operation.attempts,
            "Operation dead-lettered: {}",
            letter.error
        );
        self.sink.emit(SyncEvent::dead_lettered(letter));
    }
}

/// The backend refused the bearer token (HTTP 401)
fn is_rejected_token(error: &SyncError) -> bool {
    matches!(error, SyncError::Remote(RemoteError::Unauthorized(_)))
}
