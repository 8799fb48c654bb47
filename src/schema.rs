//! Identifiers, column specs and `information_schema` inspection.
//!
//! Identifiers cannot be bound as query parameters, so every table and
//! column name is checked against a strict allow-list before it is
//! interpolated into an `ALTER TABLE` statement.

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::errors::{database_message, MigrationError};

/// Postgres truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// Validates a bare identifier and folds it to lower case, the way Postgres
/// treats unquoted names.
fn validate_identifier(kind: &str, raw: &str) -> Result<String, MigrationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MigrationError::InvalidIdentifier(format!(
            "{} name is empty",
            kind
        )));
    }
    if trimmed.len() > MAX_IDENTIFIER_LEN {
        return Err(MigrationError::InvalidIdentifier(format!(
            "{} name '{}' is longer than {} bytes",
            kind, trimmed, MAX_IDENTIFIER_LEN
        )));
    }
    if !identifier_regex().is_match(trimmed) {
        return Err(MigrationError::InvalidIdentifier(format!(
            "{} name '{}' may only contain letters, digits and underscores and must not start with a digit",
            kind, trimmed
        )));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// A validated column name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ColumnName(String);

impl ColumnName {
    pub fn new(raw: &str) -> Result<Self, MigrationError> {
        validate_identifier("column", raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for SQL.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl TryFrom<String> for ColumnName {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ColumnName> for String {
    fn from(value: ColumnName) -> Self {
        value.0
    }
}

impl fmt::Display for ColumnName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated table name, optionally schema-qualified (`core.entities`).
///
/// Unqualified names resolve against `current_schema()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, MigrationError> {
        match raw.trim().split_once('.') {
            Some((schema, name)) => Ok(Self {
                schema: Some(validate_identifier("schema", schema)?),
                name: validate_identifier("table", name)?,
            }),
            None => Ok(Self {
                schema: None,
                name: validate_identifier("table", raw)?,
            }),
        }
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Double-quoted, possibly qualified form for SQL.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{}\".\"{}\"", schema, self.name),
            None => format!("\"{}\"", self.name),
        }
    }
}

impl TryFrom<String> for TableName {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Desired column: name plus the SQL type clause used to add it,
/// e.g. `INTEGER DEFAULT 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawColumnSpec")]
pub struct ColumnSpec {
    pub name: ColumnName,
    #[serde(rename = "type")]
    pub column_type: String,
}

#[derive(Deserialize)]
struct RawColumnSpec {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

impl TryFrom<RawColumnSpec> for ColumnSpec {
    type Error = MigrationError;

    fn try_from(raw: RawColumnSpec) -> Result<Self, Self::Error> {
        Self::new(&raw.name, &raw.column_type)
    }
}

impl ColumnSpec {
    pub fn new(name: &str, column_type: &str) -> Result<Self, MigrationError> {
        let name = ColumnName::new(name)?;
        let column_type = column_type.trim();
        if column_type.is_empty() {
            return Err(MigrationError::InvalidIdentifier(format!(
                "column '{}' has an empty type clause",
                name
            )));
        }
        if [";", "--", "/*", "*/"]
            .iter()
            .any(|token| column_type.contains(token))
        {
            return Err(MigrationError::InvalidIdentifier(format!(
                "type clause for column '{}' contains a statement separator or comment: {}",
                name, column_type
            )));
        }
        Ok(Self {
            name,
            column_type: column_type.to_string(),
        })
    }

    /// Parses the command-line form `name:TYPE`.
    pub fn parse(arg: &str) -> Result<Self, MigrationError> {
        let (name, column_type) = arg.split_once(':').ok_or_else(|| {
            MigrationError::InvalidIdentifier(format!("expected name:TYPE, got '{}'", arg))
        })?;
        Self::new(name, column_type)
    }
}

/// A single column change. Plan files spell these `{"add": {...}}` and `{"drop": "name"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Add(ColumnSpec),
    Drop(ColumnName),
}

impl Change {
    pub fn column(&self) -> &ColumnName {
        match self {
            Change::Add(spec) => &spec.name,
            Change::Drop(name) => name,
        }
    }

    pub fn intent(&self) -> &'static str {
        match self {
            Change::Add(_) => "add",
            Change::Drop(_) => "drop",
        }
    }

    pub fn sql(&self, table: &TableName) -> String {
        match self {
            Change::Add(spec) => add_column_sql(table, spec),
            Change::Drop(name) => drop_column_sql(table, name),
        }
    }

    /// True when the change has nothing to do given the columns present.
    pub fn is_satisfied_by(&self, present: &HashSet<String>) -> bool {
        match self {
            Change::Add(spec) => present.contains(spec.name.as_str()),
            Change::Drop(name) => !present.contains(name.as_str()),
        }
    }
}

/// `ALTER TABLE .. ADD COLUMN IF NOT EXISTS ..`
pub fn add_column_sql(table: &TableName, spec: &ColumnSpec) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        table.quoted(),
        spec.name.quoted(),
        spec.column_type
    )
}

/// `ALTER TABLE .. DROP COLUMN IF EXISTS ..`
pub fn drop_column_sql(table: &TableName, column: &ColumnName) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
        table.quoted(),
        column.quoted()
    )
}

/// One row of `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct ColumnInfo {
    pub column_name: String,
    pub data_type: String,
    pub ordinal_position: i32,
    pub is_nullable: String,
    pub column_default: Option<String>,
}

/// Names from `wanted` that are not in `existing`, in `wanted` order.
pub fn missing_columns<'a>(
    existing: &[String],
    wanted: impl IntoIterator<Item = &'a ColumnName>,
) -> Vec<ColumnName> {
    let existing: HashSet<&str> = existing.iter().map(String::as_str).collect();
    wanted
        .into_iter()
        .filter(|c| !existing.contains(c.as_str()))
        .cloned()
        .collect()
}

/// Read-only queries against `information_schema`.
#[derive(Clone)]
pub struct SchemaInspector {
    pool: PgPool,
}

impl SchemaInspector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn inspection_error(table: &TableName, err: sqlx::Error) -> MigrationError {
        MigrationError::SchemaInspection {
            table: table.to_string(),
            message: database_message(&err),
        }
    }

    pub async fn table_exists(&self, table: &TableName) -> Result<bool, MigrationError> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM information_schema.tables
                WHERE table_name = $1
                  AND table_schema = COALESCE($2, current_schema())
            )
            "#,
        )
        .bind(table.name())
        .bind(table.schema())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::inspection_error(table, e))
    }

    /// Columns of `table` ordered by `ordinal_position`.
    pub async fn columns(&self, table: &TableName) -> Result<Vec<ColumnInfo>, MigrationError> {
        sqlx::query_as::<_, ColumnInfo>(
            r#"
            SELECT column_name::text AS column_name,
                   data_type::text AS data_type,
                   ordinal_position::int4 AS ordinal_position,
                   is_nullable::text AS is_nullable,
                   column_default::text AS column_default
            FROM information_schema.columns
            WHERE table_name = $1
              AND table_schema = COALESCE($2, current_schema())
            ORDER BY ordinal_position
            "#,
        )
        .bind(table.name())
        .bind(table.schema())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::inspection_error(table, e))
    }

    pub async fn column_names(&self, table: &TableName) -> Result<Vec<String>, MigrationError> {
        Ok(self
            .columns(table)
            .await?
            .into_iter()
            .map(|c| c.column_name)
            .collect())
    }

    /// Base tables in `schema`, sorted by name.
    pub async fn list_tables(&self, schema: &str) -> Result<Vec<String>, MigrationError> {
        sqlx::query_scalar(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = $1 AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MigrationError::SchemaInspection {
            table: format!("{}.*", schema),
            message: database_message(&e),
        })
    }

    pub async fn row_count(&self, table: &TableName) -> Result<i64, MigrationError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.quoted());
        sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Self::inspection_error(table, e))
    }
}
