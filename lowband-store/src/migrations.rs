//! Versioned migrations for the store's own bookkeeping tables
//!
//! Mirrored application tables are created from the declared [`Schema`](crate::Schema)
//! on every open. The queue and dead-letter tables evolve here, one version at a
//! time, each inside its own transaction.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::errors::{Result, StoreError};
use crate::schema::SCHEMA_VERSION;

/// A single forward migration
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

impl Migration {
    fn apply(&self, conn: &mut Connection) -> Result<()> {
        info!("Applying migration {}: {}", self.version, self.description);

        let tx = conn.transaction()?;
        tx.execute_batch(self.up)?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![self.version],
        )?;
        tx.commit()?;

        Ok(())
    }
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Create mutation queue",
        up: r#"
            CREATE TABLE IF NOT EXISTS mutation_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                priority INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_mutation_queue_order
                ON mutation_queue(priority DESC, created_at ASC, id ASC);
            CREATE INDEX IF NOT EXISTS idx_mutation_queue_row
                ON mutation_queue(table_name, row_id, id);
        "#,
    },
    Migration {
        version: 2,
        description: "Create dead letter log",
        up: r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_id INTEGER NOT NULL,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                error TEXT NOT NULL,
                failed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dead_letters_failed_at
                ON dead_letters(failed_at DESC);
        "#,
    },
];

/// Currently applied schema version, 0 for a fresh database
pub fn current_version(conn: &Connection) -> Result<u32> {
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<u32>>(0)
        })
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// Bring the bookkeeping tables up to [`SCHEMA_VERSION`]
pub fn run_migrations(conn: &mut Connection) -> Result<u32> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )?;

    let current = current_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::SchemaVersionMismatch {
            expected: SCHEMA_VERSION,
            actual: current,
        });
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        migration.apply(conn)?;
    }

    current_version(conn)
}
