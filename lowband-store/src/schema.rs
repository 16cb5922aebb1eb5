//! Declared table schema shared by the local store and the remote backend

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};
use crate::row::{Row, Value, PRIMARY_KEY};

/// Highest schema version this build knows how to open
pub const SCHEMA_VERSION: u32 = 2;

/// Connection pragmas applied to file-backed stores, after switching to WAL
pub const PRAGMAS: &str = r#"
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;
"#;

/// Storage type of a mirrored column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
        }
    }

    fn name(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null) | (ColumnType::Text, Value::Text(_)) | (ColumnType::Integer, Value::Integer(_))
        )
    }
}

/// A non-key column of a mirrored table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// A mirrored table. The text primary key `id` is implicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    /// Stable key used for "latest first" pagination
    pub sort_key: String,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            sort_key: "created_at".to_string(),
        }
    }

    pub fn text(self, name: &str) -> Self {
        self.column(name, ColumnType::Text, true)
    }

    pub fn integer(self, name: &str) -> Self {
        self.column(name, ColumnType::Integer, true)
    }

    pub fn required_text(self, name: &str) -> Self {
        self.column(name, ColumnType::Text, false)
    }

    pub fn required_integer(self, name: &str) -> Self {
        self.column(name, ColumnType::Integer, false)
    }

    pub fn column(mut self, name: &str, ty: ColumnType, nullable: bool) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            ty,
            nullable,
        });
        self
    }

    pub fn sort_by(mut self, column: &str) -> Self {
        self.sort_key = column.to_string();
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names including the primary key, in declaration order
    pub fn column_names(&self) -> Vec<&str> {
        std::iter::once(PRIMARY_KEY)
            .chain(self.columns.iter().map(|c| c.name.as_str()))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        for column in &self.columns {
            validate_identifier(&column.name)?;
            if column.name == PRIMARY_KEY {
                return Err(StoreError::InvalidIdentifier(format!(
                    "{}.{} redeclares the primary key",
                    self.name, column.name
                )));
            }
        }
        if self.sort_key != PRIMARY_KEY && self.find_column(&self.sort_key).is_none() {
            return Err(StoreError::UnknownColumn {
                table: self.name.clone(),
                column: self.sort_key.clone(),
            });
        }
        Ok(())
    }

    /// Check every column of `row` exists and carries a value of the declared type
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        for (name, value) in row.iter() {
            if name == PRIMARY_KEY {
                if value.as_str().is_none() {
                    return Err(StoreError::TypeMismatch {
                        table: self.name.clone(),
                        column: name.to_string(),
                        expected: "text",
                    });
                }
                continue;
            }
            let column = self.find_column(name).ok_or_else(|| StoreError::UnknownColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })?;
            if !column.ty.accepts(value) {
                return Err(StoreError::TypeMismatch {
                    table: self.name.clone(),
                    column: name.to_string(),
                    expected: column.ty.name(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn create_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\n    \"{}\" TEXT PRIMARY KEY NOT NULL",
            self.name, PRIMARY_KEY
        );
        for column in &self.columns {
            sql.push_str(&format!(",\n    \"{}\" {}", column.name, column.ty.sql()));
            if !column.nullable {
                sql.push_str(" NOT NULL");
            }
        }
        sql.push_str("\n);\n");
        if self.sort_key != PRIMARY_KEY {
            sql.push_str(&format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{table}_{key}\" ON \"{table}\"(\"{key}\" DESC);\n",
                table = self.name,
                key = self.sort_key
            ));
        }
        sql
    }
}

/// The full set of mirrored tables, declared once
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    tables: Vec<TableSchema>,
}

impl Schema {
    pub fn new(tables: Vec<TableSchema>) -> Result<Self> {
        for table in &tables {
            table.validate()?;
        }
        Ok(Self { tables })
    }

    /// Tables mirrored by the community application
    pub fn social() -> Self {
        Self {
            tables: vec![
                TableSchema::new("profiles")
                    .required_text("username")
                    .text("display_name")
                    .text("avatar_url")
                    .integer("points")
                    .required_text("created_at"),
                TableSchema::new("posts")
                    .required_text("author_id")
                    .text("title")
                    .text("body")
                    .text("media_url")
                    .integer("like_count")
                    .required_text("created_at"),
                TableSchema::new("comments")
                    .required_text("post_id")
                    .required_text("author_id")
                    .required_text("body")
                    .required_text("created_at"),
                TableSchema::new("reactions")
                    .required_text("post_id")
                    .required_text("user_id")
                    .required_text("kind")
                    .required_text("created_at"),
                TableSchema::new("chat_messages")
                    .required_text("room_id")
                    .required_text("sender_id")
                    .required_text("body")
                    .required_text("created_at"),
                TableSchema::new("point_events")
                    .required_text("user_id")
                    .required_text("reason")
                    .required_integer("points")
                    .required_text("created_at"),
            ],
        }
    }

    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

/// Table and column names are interpolated into SQL, so they must be plain identifiers
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}
