//! In-memory stand-in for a PostgreSQL schema.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use insighted_schema::backend::SchemaBackend;
use insighted_schema::errors::MigrationError;
use insighted_schema::schema::{Change, TableName};

/// Base types the fake server knows. Anything else fails like an unknown type would.
const KNOWN_TYPES: &[&str] = &[
    "INT", "INTEGER", "BIGINT", "SMALLINT", "NUMERIC", "FLOAT", "REAL", "TEXT", "VARCHAR",
    "BOOLEAN", "DATE", "TIMESTAMP", "TIMESTAMPTZ", "JSONB", "UUID",
];

#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, Vec<String>>>,
    statements: Mutex<Vec<String>>,
    column_reads: AtomicUsize,
    read_limit: Option<usize>,
}

impl MemoryBackend {
    pub fn with_table(table: &str, columns: &[&str]) -> Self {
        let backend = Self::default();
        backend.tables.lock().unwrap().insert(
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        backend
    }

    /// Column reads beyond the first `limit` fail like a dropped connection.
    pub fn fail_reads_after(mut self, limit: usize) -> Self {
        self.read_limit = Some(limit);
        self
    }

    pub fn columns(&self, table: &str) -> Vec<String> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// SQL of every statement that reached the fake server.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn clear_statements(&self) {
        self.statements.lock().unwrap().clear();
    }

    fn apply_to(
        columns: &mut Vec<String>,
        change: &Change,
    ) -> Result<(), MigrationError> {
        match change {
            Change::Add(spec) => {
                let base = spec
                    .column_type
                    .split(|c: char| c.is_whitespace() || c == '(')
                    .next()
                    .unwrap_or_default()
                    .to_ascii_uppercase();
                if !KNOWN_TYPES.contains(&base.as_str()) {
                    return Err(MigrationError::ColumnOperation {
                        column: spec.name.to_string(),
                        intent: "add".to_string(),
                        message: format!(
                            "type \"{}\" does not exist (SQLSTATE 42704)",
                            base.to_ascii_lowercase()
                        ),
                    });
                }
                if !columns.iter().any(|c| c == spec.name.as_str()) {
                    columns.push(spec.name.to_string());
                }
            }
            Change::Drop(name) => columns.retain(|c| c != name.as_str()),
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaBackend for MemoryBackend {
    async fn table_exists(&self, table: &TableName) -> Result<bool, MigrationError> {
        Ok(self.tables.lock().unwrap().contains_key(&table.to_string()))
    }

    async fn column_names(&self, table: &TableName) -> Result<Vec<String>, MigrationError> {
        let reads = self.column_reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.read_limit.is_some_and(|limit| reads > limit) {
            return Err(MigrationError::SchemaInspection {
                table: table.to_string(),
                message: "connection reset".to_string(),
            });
        }
        Ok(self.columns(&table.to_string()))
    }

    async fn apply(&self, table: &TableName, change: &Change) -> Result<(), MigrationError> {
        self.statements.lock().unwrap().push(change.sql(table));
        let mut tables = self.tables.lock().unwrap();
        let columns = tables.entry(table.to_string()).or_default();
        Self::apply_to(columns, change)
    }

    async fn apply_atomic(
        &self,
        table: &TableName,
        changes: &[Change],
    ) -> Result<(), MigrationError> {
        let mut tables = self.tables.lock().unwrap();
        let mut working = tables.get(&table.to_string()).cloned().unwrap_or_default();
        for change in changes {
            self.statements.lock().unwrap().push(change.sql(table));
            Self::apply_to(&mut working, change)?;
        }
        tables.insert(table.to_string(), working);
        Ok(())
    }
}
