//! Failure events surfaced to observers
//!
//! Background pipelines never throw at the presentation layer. Failures that
//! need user action are emitted here instead.

use chrono::{DateTime, Utc};
use lowband_store::{DeadLetter, QueuedOperation};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A queued write was permanently rejected or ran out of attempts
    OperationDeadLettered {
        operation: QueuedOperation,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// Downloading a table failed; other tables were unaffected
    TableSyncFailed {
        table: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl SyncEvent {
    pub fn dead_lettered(letter: &DeadLetter) -> Self {
        SyncEvent::OperationDeadLettered {
            operation: letter.operation.clone(),
            error: letter.error.clone(),
            timestamp: letter.failed_at,
        }
    }

    pub fn table_failed(table: impl Into<String>, error: impl ToString) -> Self {
        SyncEvent::TableSyncFailed {
            table: table.into(),
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: SyncEvent) {
        match event {
            SyncEvent::OperationDeadLettered {
                operation, error, ..
            } => error!(
                operation_id = operation.id,
                table = %operation.table,
                row_id = %operation.row_id,
                kind = %operation.kind,
                attempts = operation.attempts,
                "Operation could not be saved: {}",
                error
            ),
            SyncEvent::TableSyncFailed { table, error, .. } => {
                warn!(table = %table, "Table sync failed: {}", error)
            }
        }
    }
}

/// Forwards events to a receiver, e.g. a UI that offers "retry?"
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: SyncEvent) {
        // A closed receiver means nobody is listening any more
        let _ = self.tx.send(event);
    }
}
