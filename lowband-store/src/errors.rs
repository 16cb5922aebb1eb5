use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Type mismatch for {table}.{column}: expected {expected}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: &'static str,
    },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(i64),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(i64),

    #[error("Schema version mismatch: expected at most {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;
