//! Embedded transactional row store
//!
//! [`LocalStore`] owns the mirrored rows and the mutation queue. All access is
//! serialized through one SQLite connection; every public write is a single
//! transaction so visible local state and pending-upload intent never diverge.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::errors::{Result, StoreError};
use crate::migrations::run_migrations;
use crate::queue::{
    self, DeadLetter, FailureOutcome, OperationKind, Priority, QueueCursor, QueueStats,
    QueuedOperation, DEFAULT_MAX_ATTEMPTS,
};
use crate::row::{Row, Value, PRIMARY_KEY};
use crate::schema::{Schema, TableSchema, PRAGMAS};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Where a committed change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Change notification published after every committed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub table: String,
    pub row_ids: Vec<String>,
    pub origin: ChangeOrigin,
}

/// A local write request
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub table: String,
    pub row_id: String,
    pub kind: OperationKind,
    pub payload: Row,
    pub priority: Priority,
    pub max_attempts: u32,
}

impl Mutation {
    pub fn new(table: impl Into<String>, row_id: impl Into<String>, kind: OperationKind, payload: Row) -> Self {
        Self {
            table: table.into(),
            row_id: row_id.into(),
            kind,
            payload,
            priority: Priority::Normal,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn insert(table: impl Into<String>, row_id: impl Into<String>, payload: Row) -> Self {
        Self::new(table, row_id, OperationKind::Insert, payload)
    }

    pub fn update(table: impl Into<String>, row_id: impl Into<String>, payload: Row) -> Self {
        Self::new(table, row_id, OperationKind::Update, payload)
    }

    pub fn delete(table: impl Into<String>, row_id: impl Into<String>) -> Self {
        Self::new(table, row_id, OperationKind::Delete, Row::new())
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Outcome of applying one snapshot page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotApplied {
    pub applied: Vec<String>,
    /// Rows left untouched because local operations for them are still queued
    pub skipped: Vec<String>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    schema: Schema,
    changes: broadcast::Sender<TableChange>,
}

/// Shared handle to the on-device store
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    /// Open or create a store at `path`
    pub fn open(path: impl AsRef<Path>, schema: Schema) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        // journal_mode reports the resulting mode as a row
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        conn.execute_batch(PRAGMAS)?;
        debug!("Journal mode: {}", mode);
        info!("Opened local store at {}", path.display());
        Self::initialize(conn, schema)
    }

    /// Create an in-memory store (for testing)
    pub fn open_in_memory(schema: Schema) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, schema)
    }

    fn initialize(mut conn: Connection, schema: Schema) -> Result<Self> {
        let version = run_migrations(&mut conn)?;
        for table in schema.tables() {
            conn.execute_batch(&table.create_sql())?;
        }
        debug!(
            "Local store ready at schema version {} with {} tables",
            version,
            schema.tables().len()
        );

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                schema,
                changes,
            }),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Subscribe to committed changes (table and affected row ids)
    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.inner.changes.subscribe()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn notify(&self, table: &str, row_ids: Vec<String>, origin: ChangeOrigin) {
        if row_ids.is_empty() {
            return;
        }
        // No subscribers is fine
        let _ = self.inner.changes.send(TableChange {
            table: table.to_string(),
            row_ids,
            origin,
        });
    }

    /// Apply a local write and queue it for upload with default priority and attempts
    pub fn apply_local_mutation(
        &self,
        table: &str,
        row_id: &str,
        kind: OperationKind,
        payload: Row,
    ) -> Result<QueuedOperation> {
        self.apply_mutation(Mutation::new(table, row_id, kind, payload))
    }

    /// Apply a local write and queue it for upload, atomically
    pub fn apply_mutation(&self, mutation: Mutation) -> Result<QueuedOperation> {
        let table = self.inner.schema.table(&mutation.table)?;
        let payload = normalize_payload(table, &mutation)?;

        let op = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            write_local_row(&tx, table, &mutation.row_id, mutation.kind, &payload)?;
            let op = queue::enqueue(
                &tx,
                &table.name,
                &mutation.row_id,
                mutation.kind,
                &payload,
                mutation.priority,
                mutation.max_attempts,
            )?;
            tx.commit()?;
            op
        };

        debug!(
            table = %op.table,
            row_id = %op.row_id,
            operation_id = op.id,
            "Queued local {}",
            op.kind
        );
        self.notify(&op.table, vec![op.row_id.clone()], ChangeOrigin::Local);
        Ok(op)
    }

    /// Upsert a page of authoritative remote rows in one transaction.
    ///
    /// Each row is replaced as a whole. Rows outside the batch are never touched,
    /// and rows with queued local operations are skipped until those upload.
    pub fn replace_snapshot_batch(&self, table: &str, rows: &[Row]) -> Result<SnapshotApplied> {
        let table = self.inner.schema.table(table)?;
        for row in rows {
            table.validate_row(row)?;
            if row.id().is_none() {
                return Err(StoreError::InvalidMutation(format!(
                    "snapshot row for {} without {}",
                    table.name, PRIMARY_KEY
                )));
            }
        }

        let mut outcome = SnapshotApplied::default();
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for row in rows {
                let id = row.id().unwrap_or_default();
                if queue::has_pending_for_row(&tx, &table.name, id)? {
                    outcome.skipped.push(id.to_string());
                    continue;
                }
                upsert_full_row(&tx, table, id, row)?;
                outcome.applied.push(id.to_string());
            }
            tx.commit()?;
        }

        debug!(
            table = %table.name,
            applied = outcome.applied.len(),
            skipped = outcome.skipped.len(),
            "Applied snapshot batch"
        );
        self.notify(&table.name, outcome.applied.clone(), ChangeOrigin::Remote);
        Ok(outcome)
    }

    /// Apply explicitly communicated remote deletions
    pub fn delete_rows(&self, table: &str, row_ids: &[String]) -> Result<Vec<String>> {
        let table = self.inner.schema.table(table)?;
        let mut deleted = Vec::new();
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for id in row_ids {
                if queue::has_pending_for_row(&tx, &table.name, id)? {
                    continue;
                }
                let removed = tx.execute(
                    &format!("DELETE FROM \"{}\" WHERE \"{}\" = ?1", table.name, PRIMARY_KEY),
                    params![id],
                )?;
                if removed > 0 {
                    deleted.push(id.clone());
                }
            }
            tx.commit()?;
        }
        self.notify(&table.name, deleted.clone(), ChangeOrigin::Remote);
        Ok(deleted)
    }

    pub fn get_row(&self, table: &str, row_id: &str) -> Result<Option<Row>> {
        let table = self.inner.schema.table(table)?;
        let names = table.column_names();
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM \"{}\" WHERE \"{}\" = ?1",
                    quoted_list(&names),
                    table.name,
                    PRIMARY_KEY
                ),
                params![row_id],
                |r| read_row(r, &names),
            )
            .optional()?;
        Ok(row)
    }

    /// Rows of `table`, latest first by the table's sort key
    pub fn list_rows(&self, table: &str, limit: usize, offset: usize) -> Result<Vec<Row>> {
        let table = self.inner.schema.table(table)?;
        let names = table.column_names();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM \"{}\" ORDER BY \"{}\" DESC, \"{}\" ASC LIMIT ?1 OFFSET ?2",
            quoted_list(&names),
            table.name,
            table.sort_key,
            PRIMARY_KEY
        ))?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |r| read_row(r, &names))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn row_count(&self, table: &str) -> Result<u64> {
        let table = self.inner.schema.table(table)?;
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", table.name),
            [],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Pending operations in drain order: `(priority desc, created_at asc)`
    pub fn get_pending_operations(&self, limit: usize) -> Result<Vec<QueuedOperation>> {
        let conn = self.conn()?;
        queue::pending(&conn, None, limit)
    }

    /// Continue the drain order strictly after `cursor`
    pub fn get_pending_operations_after(
        &self,
        cursor: &QueueCursor,
        limit: usize,
    ) -> Result<Vec<QueuedOperation>> {
        let conn = self.conn()?;
        queue::pending(&conn, Some(cursor), limit)
    }

    /// Whether an older operation for the same row is still queued
    pub fn has_earlier_operation(&self, op: &QueuedOperation) -> Result<bool> {
        let conn = self.conn()?;
        queue::has_earlier(&conn, op)
    }

    /// Remove an operation the remote backend acknowledged
    pub fn complete_operation(&self, id: i64) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = queue::complete(&tx, id)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Count a retryable failure; dead-letters once attempts reach the maximum
    pub fn record_failed_attempt(&self, id: i64, error: &str) -> Result<FailureOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let outcome = queue::record_failure(&tx, id, error)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Dead-letter an operation immediately, regardless of attempts
    pub fn dead_letter_operation(&self, id: i64, error: &str) -> Result<DeadLetter> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let op = queue::load(&tx, id)?.ok_or(StoreError::OperationNotFound(id))?;
        let letter = queue::dead_letter(&tx, op, error)?;
        tx.commit()?;
        Ok(letter)
    }

    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let conn = self.conn()?;
        queue::dead_letters(&conn, limit)
    }

    /// Re-apply a dead-lettered operation locally and queue it again with fresh attempts
    pub fn requeue_dead_letter(&self, id: i64) -> Result<QueuedOperation> {
        let op = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let letter = queue::take_dead_letter(&tx, id)?;
            let original = letter.operation;
            let table = self.inner.schema.table(&original.table)?;
            write_local_row(&tx, table, &original.row_id, original.kind, &original.payload)?;
            let op = queue::enqueue(
                &tx,
                &original.table,
                &original.row_id,
                original.kind,
                &original.payload,
                original.priority,
                original.max_attempts,
            )?;
            tx.commit()?;
            op
        };

        info!(
            dead_letter_id = id,
            operation_id = op.id,
            "Requeued dead-lettered {} on {}/{}",
            op.kind,
            op.table,
            op.row_id
        );
        self.notify(&op.table, vec![op.row_id.clone()], ChangeOrigin::Local);
        Ok(op)
    }

    pub fn discard_dead_letter(&self, id: i64) -> Result<DeadLetter> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let letter = queue::take_dead_letter(&tx, id)?;
        tx.commit()?;
        Ok(letter)
    }

    pub fn pending_count(&self) -> Result<u64> {
        Ok(self.queue_stats()?.pending())
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        queue::stats(&conn)
    }
}

fn normalize_payload(table: &TableSchema, mutation: &Mutation) -> Result<Row> {
    if mutation.row_id.is_empty() {
        return Err(StoreError::InvalidMutation("empty row id".to_string()));
    }

    let mut payload = mutation.payload.clone();
    if let Some(id) = payload.remove(PRIMARY_KEY) {
        if id.as_str() != Some(mutation.row_id.as_str()) {
            return Err(StoreError::InvalidMutation(format!(
                "payload id {} does not match row id {}",
                id, mutation.row_id
            )));
        }
    }

    match mutation.kind {
        OperationKind::Delete if !payload.is_empty() => Err(StoreError::InvalidMutation(
            "delete carries no payload".to_string(),
        )),
        OperationKind::Update if payload.is_empty() => Err(StoreError::InvalidMutation(
            "update without columns".to_string(),
        )),
        _ => {
            table.validate_row(&payload)?;
            Ok(payload)
        }
    }
}

fn write_local_row(
    conn: &Connection,
    table: &TableSchema,
    row_id: &str,
    kind: OperationKind,
    payload: &Row,
) -> Result<()> {
    match kind {
        OperationKind::Insert => upsert_full_row(conn, table, row_id, payload),
        OperationKind::Update => upsert_partial_row(conn, table, row_id, payload),
        OperationKind::Delete => {
            conn.execute(
                &format!("DELETE FROM \"{}\" WHERE \"{}\" = ?1", table.name, PRIMARY_KEY),
                params![row_id],
            )?;
            Ok(())
        }
    }
}

/// Replace every column of the row; columns missing from `row` become NULL
fn upsert_full_row(conn: &Connection, table: &TableSchema, row_id: &str, row: &Row) -> Result<()> {
    let mut values = vec![Value::Text(row_id.to_string())];
    values.extend(
        table
            .columns
            .iter()
            .map(|c| row.get(&c.name).cloned().unwrap_or(Value::Null)),
    );
    let columns: Vec<&str> = table.column_names();
    execute_upsert(conn, &table.name, &columns, values)
}

/// Set only the given columns, creating the row if it does not exist yet
fn upsert_partial_row(conn: &Connection, table: &TableSchema, row_id: &str, row: &Row) -> Result<()> {
    let mut columns = vec![PRIMARY_KEY];
    let mut values = vec![Value::Text(row_id.to_string())];
    for (name, value) in row.iter() {
        columns.push(name);
        values.push(value.clone());
    }
    execute_upsert(conn, &table.name, &columns, values)
}

fn execute_upsert(conn: &Connection, table: &str, columns: &[&str], values: Vec<Value>) -> Result<()> {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| **c != PRIMARY_KEY)
        .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
        .collect();

    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    conn.execute(
        &format!(
            "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT(\"{}\") {}",
            table,
            quoted_list(columns),
            placeholders.join(", "),
            PRIMARY_KEY,
            conflict
        ),
        params_from_iter(values.iter()),
    )?;
    Ok(())
}

fn quoted_list(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| format!("\"{}\"", n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_row(r: &rusqlite::Row<'_>, names: &[&str]) -> rusqlite::Result<Row> {
    let mut row = Row::new();
    for (idx, name) in names.iter().enumerate() {
        row.set(*name, r.get::<_, Value>(idx)?);
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LocalStore {
        LocalStore::open_in_memory(Schema::social()).unwrap()
    }

    fn post(title: &str) -> Row {
        Row::new()
            .with("author_id", "u1")
            .with("title", title)
            .with("created_at", "2024-05-01T10:00:00Z")
    }

    #[test]
    fn test_mutation_writes_row_and_queue_together() {
        let store = store();
        let op = store
            .apply_local_mutation("posts", "p1", OperationKind::Insert, post("A"))
            .unwrap();

        assert_eq!(op.attempts, 0);
        assert_eq!(op.max_attempts, DEFAULT_MAX_ATTEMPTS);
        let row = store.get_row("posts", "p1").unwrap().unwrap();
        assert_eq!(row.get("title"), Some(&Value::from("A")));
        assert_eq!(store.get_pending_operations(10).unwrap(), vec![op]);
    }

    #[test]
    fn test_failed_mutation_leaves_no_trace() {
        let store = store();
        // author_id is NOT NULL, so the row write fails inside the transaction
        let err = store
            .apply_local_mutation(
                "posts",
                "p1",
                OperationKind::Update,
                Row::new().with("title", "orphan"),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert!(store.get_row("posts", "p1").unwrap().is_none());
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_invalid_mutations_rejected() {
        let store = store();
        assert!(matches!(
            store.apply_local_mutation("nope", "x", OperationKind::Delete, Row::new()),
            Err(StoreError::UnknownTable(_))
        ));
        assert!(matches!(
            store.apply_local_mutation("posts", "p1", OperationKind::Delete, post("A")),
            Err(StoreError::InvalidMutation(_))
        ));
        assert!(matches!(
            store.apply_local_mutation("posts", "p1", OperationKind::Insert, post("A").with("id", "p2")),
            Err(StoreError::InvalidMutation(_))
        ));
        assert!(matches!(
            store.apply_local_mutation("posts", "", OperationKind::Insert, post("A")),
            Err(StoreError::InvalidMutation(_))
        ));
    }

    #[test]
    fn test_update_merges_and_delete_removes() {
        let store = store();
        store.apply_local_mutation("posts", "p1", OperationKind::Insert, post("A")).unwrap();
        store
            .apply_local_mutation("posts", "p1", OperationKind::Update, Row::new().with("like_count", 4))
            .unwrap();

        let row = store.get_row("posts", "p1").unwrap().unwrap();
        assert_eq!(row.get("title"), Some(&Value::from("A")));
        assert_eq!(row.get("like_count"), Some(&Value::Integer(4)));

        store.apply_mutation(Mutation::delete("posts", "p1")).unwrap();
        assert!(store.get_row("posts", "p1").unwrap().is_none());
        assert_eq!(store.pending_count().unwrap(), 3);
    }

    #[test]
    fn test_high_priority_drains_first() {
        let store = store();
        store.apply_mutation(Mutation::insert("point_events", "e1", Row::new()
            .with("user_id", "u1").with("reason", "view").with("points", 1).with("created_at", "t"))).unwrap();
        let mine = store
            .apply_mutation(Mutation::insert("posts", "p1", post("mine")).priority(Priority::High))
            .unwrap();

        let pending = store.get_pending_operations(10).unwrap();
        assert_eq!(pending[0].id, mine.id);
        assert_eq!(pending[1].table, "point_events");
    }

    #[test]
    fn test_snapshot_skips_rows_with_pending_operations() {
        let store = store();
        store.apply_local_mutation("posts", "p1", OperationKind::Insert, post("local")).unwrap();

        let remote = vec![post("remote").with("id", "p1"), post("other").with("id", "p2")];
        let outcome = store.replace_snapshot_batch("posts", &remote).unwrap();

        assert_eq!(outcome.applied, vec!["p2".to_string()]);
        assert_eq!(outcome.skipped, vec!["p1".to_string()]);
        let p1 = store.get_row("posts", "p1").unwrap().unwrap();
        assert_eq!(p1.get("title"), Some(&Value::from("local")));
    }

    #[test]
    fn test_change_notifications() {
        let store = store();
        let mut rx = store.subscribe();

        store.apply_local_mutation("posts", "p1", OperationKind::Insert, post("A")).unwrap();
        store
            .replace_snapshot_batch("posts", &[post("B").with("id", "p2")])
            .unwrap();

        let local = rx.try_recv().unwrap();
        assert_eq!(local.origin, ChangeOrigin::Local);
        assert_eq!(local.row_ids, vec!["p1".to_string()]);

        let remote = rx.try_recv().unwrap();
        assert_eq!(remote.origin, ChangeOrigin::Remote);
        assert_eq!(remote.table, "posts");
    }

    #[test]
    fn test_dead_letter_requeue_and_discard() {
        let store = store();
        let op = store.apply_local_mutation("posts", "p1", OperationKind::Insert, post("A")).unwrap();
        let letter = store.dead_letter_operation(op.id, "422 invalid").unwrap();
        assert_eq!(store.pending_count().unwrap(), 0);
        assert_eq!(store.list_dead_letters(10).unwrap(), vec![letter.clone()]);

        let requeued = store.requeue_dead_letter(letter.id).unwrap();
        assert!(requeued.id > op.id);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.payload, op.payload);
        assert!(store.list_dead_letters(10).unwrap().is_empty());

        let again = store.dead_letter_operation(requeued.id, "still invalid").unwrap();
        store.discard_dead_letter(again.id).unwrap();
        assert_eq!(store.queue_stats().unwrap(), QueueStats::default());
        assert!(matches!(
            store.discard_dead_letter(again.id),
            Err(StoreError::DeadLetterNotFound(_))
        ));
    }

    #[test]
    fn test_list_rows_latest_first() {
        let store = store();
        let rows: Vec<Row> = (1..=3)
            .map(|i| post(&format!("t{}", i)).with("id", format!("p{}", i)).with("created_at", format!("2024-05-0{}T00:00:00Z", i)))
            .collect();
        store.replace_snapshot_batch("posts", &rows).unwrap();

        let listed = store.list_rows("posts", 2, 0).unwrap();
        let ids: Vec<_> = listed.iter().filter_map(|r| r.id()).collect();
        assert_eq!(ids, vec!["p3", "p2"]);
        assert_eq!(store.row_count("posts").unwrap(), 3);
    }
}
