//! Durable mutation queue
//!
//! Every local write appends a [`QueuedOperation`]. An operation is never
//! modified except to bump `attempts`; it leaves the queue either because the
//! remote backend acknowledged it or because it was dead-lettered. There is no
//! persisted in-flight state: after a crash the upload pipeline simply sees the
//! operation as pending again.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};
use crate::row::Row;

/// Attempts allowed before an operation is dead-lettered
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Kind of row change carried by a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(StoreError::InvalidMutation(format!(
                "unknown operation kind: {}",
                other
            ))),
        }
    }
}

/// Drain priority. High-priority operations are uploaded first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Normal = 0,
    High = 1,
}

impl Priority {
    fn from_i64(value: i64) -> Self {
        if value > 0 {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// One pending write intended for the remote backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: i64,
    pub table: String,
    pub row_id: String,
    pub kind: OperationKind,
    pub payload: Row,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: Priority,
}

impl QueuedOperation {
    /// Position of this operation in drain order
    pub fn position(&self) -> QueueCursor {
        QueueCursor {
            priority: self.priority,
            created_at: self.created_at,
            id: self.id,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// `(table, row_id)` key that per-row ordering is enforced on
    pub fn row_key(&self) -> (String, String) {
        (self.table.clone(), self.row_id.clone())
    }
}

/// Keyset position in `(priority desc, created_at asc, id asc)` order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCursor {
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub id: i64,
}

/// Result of recording a failed upload attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Back to pending with the new attempt count
    Requeued { attempts: u32 },
    /// Attempts exhausted; removed from the queue
    DeadLettered(DeadLetter),
}

/// An operation removed from the queue after a permanent failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub operation: QueuedOperation,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending_high: u64,
    pub pending_normal: u64,
    pub dead_letters: u64,
}

impl QueueStats {
    pub fn pending(&self) -> u64 {
        self.pending_high + self.pending_normal
    }
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

const OPERATION_COLUMNS: &str =
    "id, table_name, row_id, kind, payload, created_at, attempts, max_attempts, priority";

fn operation_from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<QueuedOperation> {
    let kind: String = row.get(offset + 3)?;
    let payload: String = row.get(offset + 4)?;
    let created_at: String = row.get(offset + 5)?;

    Ok(QueuedOperation {
        id: row.get(offset)?,
        table: row.get(offset + 1)?,
        row_id: row.get(offset + 2)?,
        kind: kind
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(offset + 3, Type::Text, Box::new(e)))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(offset + 4, Type::Text, Box::new(e)))?,
        created_at: parse_timestamp(offset + 5, &created_at)?,
        attempts: row.get(offset + 6)?,
        max_attempts: row.get(offset + 7)?,
        priority: Priority::from_i64(row.get(offset + 8)?),
    })
}

pub(crate) fn enqueue(
    conn: &Connection,
    table: &str,
    row_id: &str,
    kind: OperationKind,
    payload: &Row,
    priority: Priority,
    max_attempts: u32,
) -> Result<QueuedOperation> {
    // Stored with microsecond precision; keep the returned value identical to a reload
    let created_at = Utc::now().trunc_subsecs(6);
    let payload_json = serde_json::to_string(payload)?;

    conn.execute(
        r#"
        INSERT INTO mutation_queue
            (table_name, row_id, kind, payload, created_at, attempts, max_attempts, priority)
        VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)
        "#,
        params![
            table,
            row_id,
            kind.as_str(),
            payload_json,
            format_timestamp(&created_at),
            max_attempts,
            priority as i64,
        ],
    )?;

    Ok(QueuedOperation {
        id: conn.last_insert_rowid(),
        table: table.to_string(),
        row_id: row_id.to_string(),
        kind,
        payload: payload.clone(),
        created_at,
        attempts: 0,
        max_attempts,
        priority,
    })
}

pub(crate) fn pending(
    conn: &Connection,
    after: Option<&QueueCursor>,
    limit: usize,
) -> Result<Vec<QueuedOperation>> {
    let limit = limit as i64;
    let operations = match after {
        None => {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM mutation_queue
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT ?1",
                OPERATION_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit], |row| operation_from_row(row, 0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
        Some(cursor) => {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM mutation_queue
                 WHERE priority < ?1
                    OR (priority = ?1 AND (created_at > ?2 OR (created_at = ?2 AND id > ?3)))
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT ?4",
                OPERATION_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![
                    cursor.priority as i64,
                    format_timestamp(&cursor.created_at),
                    cursor.id,
                    limit
                ],
                |row| operation_from_row(row, 0),
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok(operations)
}

pub(crate) fn load(conn: &Connection, id: i64) -> Result<Option<QueuedOperation>> {
    let op = conn
        .query_row(
            &format!("SELECT {} FROM mutation_queue WHERE id = ?1", OPERATION_COLUMNS),
            params![id],
            |row| operation_from_row(row, 0),
        )
        .optional()?;
    Ok(op)
}

pub(crate) fn has_earlier(conn: &Connection, op: &QueuedOperation) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM mutation_queue
            WHERE table_name = ?1 AND row_id = ?2 AND id < ?3
        )",
        params![op.table, op.row_id, op.id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub(crate) fn has_pending_for_row(conn: &Connection, table: &str, row_id: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM mutation_queue WHERE table_name = ?1 AND row_id = ?2)",
        params![table, row_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub(crate) fn complete(conn: &Connection, id: i64) -> Result<bool> {
    let removed = conn.execute("DELETE FROM mutation_queue WHERE id = ?1", params![id])?;
    Ok(removed > 0)
}

pub(crate) fn record_failure(conn: &Connection, id: i64, error: &str) -> Result<FailureOutcome> {
    let mut op = load(conn, id)?.ok_or(StoreError::OperationNotFound(id))?;
    op.attempts += 1;

    if op.is_exhausted() {
        return dead_letter(conn, op, error).map(FailureOutcome::DeadLettered);
    }

    conn.execute(
        "UPDATE mutation_queue SET attempts = ?1 WHERE id = ?2",
        params![op.attempts, id],
    )?;
    Ok(FailureOutcome::Requeued {
        attempts: op.attempts,
    })
}

pub(crate) fn dead_letter(conn: &Connection, op: QueuedOperation, error: &str) -> Result<DeadLetter> {
    let failed_at = Utc::now().trunc_subsecs(6);

    conn.execute("DELETE FROM mutation_queue WHERE id = ?1", params![op.id])?;
    conn.execute(
        r#"
        INSERT INTO dead_letters
            (operation_id, table_name, row_id, kind, payload, created_at,
             attempts, max_attempts, priority, error, failed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            op.id,
            op.table,
            op.row_id,
            op.kind.as_str(),
            serde_json::to_string(&op.payload)?,
            format_timestamp(&op.created_at),
            op.attempts,
            op.max_attempts,
            op.priority as i64,
            error,
            format_timestamp(&failed_at),
        ],
    )?;

    Ok(DeadLetter {
        id: conn.last_insert_rowid(),
        operation: op,
        error: error.to_string(),
        failed_at,
    })
}

const DEAD_LETTER_COLUMNS: &str = "id, operation_id, table_name, row_id, kind, payload, created_at, \
     attempts, max_attempts, priority, error, failed_at";

fn dead_letter_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeadLetter> {
    let failed_at: String = row.get(11)?;
    Ok(DeadLetter {
        id: row.get(0)?,
        operation: operation_from_row(row, 1)?,
        error: row.get(10)?,
        failed_at: parse_timestamp(11, &failed_at)?,
    })
}

pub(crate) fn dead_letters(conn: &Connection, limit: usize) -> Result<Vec<DeadLetter>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM dead_letters ORDER BY failed_at DESC, id DESC LIMIT ?1",
        DEAD_LETTER_COLUMNS
    ))?;
    let rows = stmt.query_map(params![limit as i64], dead_letter_from_row)?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

pub(crate) fn take_dead_letter(conn: &Connection, id: i64) -> Result<DeadLetter> {
    let letter = conn
        .query_row(
            &format!("SELECT {} FROM dead_letters WHERE id = ?1", DEAD_LETTER_COLUMNS),
            params![id],
            dead_letter_from_row,
        )
        .optional()?
        .ok_or(StoreError::DeadLetterNotFound(id))?;
    conn.execute("DELETE FROM dead_letters WHERE id = ?1", params![id])?;
    Ok(letter)
}

pub(crate) fn stats(conn: &Connection) -> Result<QueueStats> {
    let (pending_high, pending_normal): (i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN priority > 0 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN priority > 0 THEN 0 ELSE 1 END), 0)
         FROM mutation_queue",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let dead_letters: i64 =
        conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;

    Ok(QueueStats {
        pending_high: pending_high as u64,
        pending_normal: pending_normal as u64,
        dead_letters: dead_letters as u64,
    })
}
