//! InsightEd schema tools
//!
//! Shared pieces behind the `insighted-migrate`, `inspect_schema` and
//! `db_probe` binaries.
//!
//! # Modules
//!
//! - `config`: connection-string resolution from the environment or a
//!   UTF-8 / UTF-16LE `.env` file, plus the derived TLS policy.
//! - `db`: pool construction and scoped acquisition with guaranteed release.
//! - `schema`: validated identifiers, column specs, `information_schema` queries.
//! - `backend`: the `SchemaBackend` trait and its PostgreSQL implementation.
//! - `migrator`: idempotent add/drop column runs with per-column results.
//! - `errors`: the error taxonomy shared by all of the above.
//! - `format`: small output helpers.
//! - `logging`: tracing subscriber setup for the binaries.

pub mod backend;
pub mod config;
pub mod db;
pub mod errors;
pub mod format;
pub mod logging;
pub mod migrator;
pub mod schema;

pub use config::{resolve_connection, ConnectionConfig, TlsPolicy};
pub use errors::MigrationError;
pub use migrator::{
    run_plan, ColumnAction, MigrationPlan, MigrationReport, MigrationResult, Migrator, RunStatus,
};
pub use schema::{Change, ColumnName, ColumnSpec, TableName};
