use std::future::Future;
use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::ConnectionConfig;
use crate::errors::{MigrationError, ResultExt};

/// Matches the 10 s connection timeout the diagnostic probes used.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Database {
    pub pool: PgPool,
}

/// What the server reports about the current session.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerInfo {
    pub version: String,
    pub database: String,
    pub user_name: String,
    /// `None` when `pg_stat_ssl` is not readable for this role.
    pub ssl: Option<bool>,
}

impl Database {
    /// Opens a small pool with the config's TLS policy and checks it with `SELECT 1`.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, MigrationError> {
        tracing::info!(
            "Connecting to {} (tls: {})",
            config.redacted(),
            config.tls_policy()
        );

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(config.connect_options()?)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn close(self) {
        self.pool.close().await;
        tracing::debug!("Database pool closed");
    }

    /// Runs `body` against a fresh pool and closes the pool afterwards,
    /// whether the body succeeds, fails or is interrupted with Ctrl-C.
    pub async fn scoped<T, F, Fut>(config: &ConnectionConfig, body: F) -> Result<T, MigrationError>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: Future<Output = Result<T, MigrationError>>,
    {
        let db = Database::connect(config).await?;
        let work = body(db.pool.clone());
        run_then_release(work, tokio::signal::ctrl_c(), db.close()).await
    }

    pub async fn server_info(&self) -> Result<ServerInfo, MigrationError> {
        let info = sqlx::query_as::<_, ServerInfo>(
            r#"
            SELECT version() AS version,
                   current_database()::text AS database,
                   current_user::text AS user_name,
                   (SELECT ssl FROM pg_stat_ssl WHERE pid = pg_backend_pid()) AS ssl
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("reading session info")?;

        Ok(info)
    }
}

/// Drives `work` until it finishes or `interrupt` fires, then awaits `release`.
///
/// `release` runs on every path, after `work` has been dropped.
async fn run_then_release<T, W, I, R>(work: W, interrupt: I, release: R) -> Result<T, MigrationError>
where
    W: Future<Output = Result<T, MigrationError>>,
    I: Future<Output = std::io::Result<()>>,
    R: Future<Output = ()>,
{
    let outcome = tokio::select! {
        res = work => res,
        Ok(()) = interrupt => {
            tracing::warn!("Interrupted, releasing database connection");
            Err(MigrationError::Interrupted)
        }
    };

    release.await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str)) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |e| sink.lock().unwrap().push(e))
    }

    fn never() -> impl Future<Output = std::io::Result<()>> {
        std::future::pending()
    }

    #[tokio::test]
    async fn test_release_after_successful_body() {
        let (events, record) = recorder();

        let res = run_then_release(
            async {
                record("body");
                Ok(42)
            },
            never(),
            async { record("release") },
        )
        .await;

        assert_eq!(res.unwrap(), 42);
        assert_eq!(*events.lock().unwrap(), vec!["body", "release"]);
    }

    #[tokio::test]
    async fn test_release_after_failed_body() {
        let (events, record) = recorder();

        let res: Result<(), _> = run_then_release(
            async {
                record("body");
                Err(MigrationError::SchemaInspection {
                    table: "schools".to_string(),
                    message: "table does not exist".to_string(),
                })
            },
            never(),
            async { record("release") },
        )
        .await;

        assert!(matches!(res, Err(MigrationError::SchemaInspection { .. })));
        assert_eq!(*events.lock().unwrap(), vec!["body", "release"]);
    }

    #[tokio::test]
    async fn test_release_after_interrupt() {
        let (events, record) = recorder();

        let res: Result<(), _> = run_then_release(
            std::future::pending(),
            async { Ok(()) },
            async { record("release") },
        )
        .await;

        assert!(matches!(res, Err(MigrationError::Interrupted)));
        assert_eq!(res.unwrap_err().exit_code(), 130);
        assert_eq!(*events.lock().unwrap(), vec!["release"]);
    }

    #[tokio::test]
    async fn test_failed_interrupt_listener_does_not_cancel_work() {
        let res = run_then_release(
            async { Ok("done") },
            async { Err(std::io::Error::other("no signal handler")) },
            async {},
        )
        .await;

        assert_eq!(res.unwrap(), "done");
    }
}
