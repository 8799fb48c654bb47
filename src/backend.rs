//! The migrator's view of the database.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::errors::{database_message, MigrationError};
use crate::schema::{Change, SchemaInspector, TableName};

/// Operations the migrator needs from a database.
///
/// `apply` and `apply_atomic` report statement failures as
/// [`MigrationError::ColumnOperation`] naming the column that failed.
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    async fn table_exists(&self, table: &TableName) -> Result<bool, MigrationError>;

    async fn column_names(&self, table: &TableName) -> Result<Vec<String>, MigrationError>;

    /// Runs one change as its own statement.
    async fn apply(&self, table: &TableName, change: &Change) -> Result<(), MigrationError>;

    /// Runs all changes in one transaction; any failure rolls all of them back.
    async fn apply_atomic(&self, table: &TableName, changes: &[Change])
        -> Result<(), MigrationError>;
}

fn column_error(change: &Change, message: String) -> MigrationError {
    MigrationError::ColumnOperation {
        column: change.column().to_string(),
        intent: change.intent().to_string(),
        message,
    }
}

/// PostgreSQL backend over a sqlx pool.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    inspector: SchemaInspector,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        let inspector = SchemaInspector::new(pool.clone());
        Self { pool, inspector }
    }
}

#[async_trait]
impl SchemaBackend for PgBackend {
    async fn table_exists(&self, table: &TableName) -> Result<bool, MigrationError> {
        self.inspector.table_exists(table).await
    }

    async fn column_names(&self, table: &TableName) -> Result<Vec<String>, MigrationError> {
        self.inspector.column_names(table).await
    }

    async fn apply(&self, table: &TableName, change: &Change) -> Result<(), MigrationError> {
        let sql = change.sql(table);
        tracing::debug!("Executing: {}", sql);

        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| column_error(change, database_message(&e)))?;

        Ok(())
    }

    async fn apply_atomic(
        &self,
        table: &TableName,
        changes: &[Change],
    ) -> Result<(), MigrationError> {
        let Some(first) = changes.first() else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await.map_err(|e| {
            column_error(
                first,
                format!("could not start transaction: {}", database_message(&e)),
            )
        })?;

        for change in changes {
            let sql = change.sql(table);
            tracing::debug!("Executing in transaction: {}", sql);

            if let Err(e) = sqlx::query(&sql).execute(&mut *tx).await {
                let err = column_error(change, database_message(&e));
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("Rollback failed: {}", rollback_err);
                }
                return Err(err);
            }
        }

        tx.commit().await.map_err(|e| {
            column_error(
                first,
                format!("commit failed: {}", database_message(&e)),
            )
        })?;

        Ok(())
    }
}
