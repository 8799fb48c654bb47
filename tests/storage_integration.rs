use std::env;

use insighted_schema::backend::PgBackend;
use insighted_schema::config::ConnectionConfig;
use insighted_schema::db::Database;
use insighted_schema::migrator::{run_plan, ColumnAction, MigrationPlan, Migrator, RunStatus};
use insighted_schema::schema::{ColumnName, ColumnSpec, SchemaInspector, TableName};

/// Integration smoke tests against a real PostgreSQL.
/// Marked ignored to avoid running against production by accident; set TEST_DATABASE_URL to run.
fn test_config() -> anyhow::Result<ConnectionConfig> {
    let url = env::var("TEST_DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL to run this test"))?;
    Ok(ConnectionConfig::from_connection_string(url))
}

/// Creates a throwaway table with a unique name and returns it.
async fn scratch_table(db: &Database, prefix: &str) -> anyhow::Result<TableName> {
    let suffix = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() % 1_000_000_000;
    let table = TableName::parse(&format!("{prefix}_{suffix}"))?;
    sqlx::query(&format!("CREATE TABLE {} (id SERIAL PRIMARY KEY)", table.quoted()))
        .execute(&db.pool)
        .await?;
    Ok(table)
}

async fn drop_table(db: &Database, table: &TableName) -> anyhow::Result<()> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.quoted()))
        .execute(&db.pool)
        .await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn add_drop_add_round_trip_smoke_test() -> anyhow::Result<()> {
    let config = test_config()?;
    let db = Database::connect(&config).await?;
    let table = scratch_table(&db, "schema_tools_roundtrip").await?;
    let migrator = Migrator::new(PgBackend::new(db.pool.clone()));
    let inspector = SchemaInspector::new(db.pool.clone());

    let specs = [
        ColumnSpec::new("number_of_classrooms", "INTEGER DEFAULT 0")?,
        ColumnSpec::new("funds_utilized", "NUMERIC DEFAULT 0")?,
    ];

    let first = migrator.add_columns(&table, &specs).await?;
    assert!(first.results.iter().all(|r| r.action == ColumnAction::Added));
    assert!(first.verification.verified);
    let after_first_add = inspector.columns(&table).await?;

    let second = migrator.add_columns(&table, &specs).await?;
    assert!(second
        .results
        .iter()
        .all(|r| r.action == ColumnAction::SkippedExisting));

    let names: Vec<ColumnName> = specs.iter().map(|s| s.name.clone()).collect();
    let dropped = migrator.drop_columns(&table, &names).await?;
    assert!(dropped.results.iter().all(|r| r.action == ColumnAction::Dropped));
    let absent = migrator.drop_columns(&table, &names).await?;
    assert!(absent
        .results
        .iter()
        .all(|r| r.action == ColumnAction::SkippedAbsent));

    migrator.add_columns(&table, &specs).await?;
    let after_re_add = inspector.columns(&table).await?;
    let shape = |cols: &[insighted_schema::schema::ColumnInfo]| {
        cols.iter()
            .map(|c| (c.column_name.clone(), c.data_type.clone(), c.column_default.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(shape(&after_first_add[..]), shape(&after_re_add[..]));

    drop_table(&db, &table).await?;
    db.close().await;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn invalid_type_fails_only_its_column_smoke_test() -> anyhow::Result<()> {
    let config = test_config()?;
    let db = Database::connect(&config).await?;
    let table = scratch_table(&db, "schema_tools_partial").await?;

    let plan = MigrationPlan::new(table.clone())
        .add(ColumnSpec::new("bar", "NOT_A_TYPE")?)
        .add(ColumnSpec::new("baz", "TEXT")?);
    let report = run_plan(&config, &plan).await?;

    assert_eq!(report.results[0].action, ColumnAction::Failed);
    assert!(report.results[0].detail.is_some());
    assert_eq!(report.results[1].action, ColumnAction::Added);
    assert_eq!(report.status, RunStatus::PartialFailure);

    drop_table(&db, &table).await?;
    db.close().await;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn atomic_group_rolls_back_smoke_test() -> anyhow::Result<()> {
    use insighted_schema::schema::Change;

    let config = test_config()?;
    let db = Database::connect(&config).await?;
    let table = scratch_table(&db, "schema_tools_atomic").await?;

    let plan = MigrationPlan::new(table.clone()).atomic(vec![
        Change::Add(ColumnSpec::new("latitude", "TEXT")?),
        Change::Add(ColumnSpec::new("longitude", "NOT_A_TYPE")?),
    ]);
    let report = run_plan(&config, &plan).await?;

    assert!(report.results.iter().all(|r| r.action == ColumnAction::Failed));
    let columns = SchemaInspector::new(db.pool.clone()).column_names(&table).await?;
    assert_eq!(columns, vec!["id".to_string()]);

    drop_table(&db, &table).await?;
    db.close().await;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn scoped_closes_pool_when_body_fails_smoke_test() -> anyhow::Result<()> {
    use insighted_schema::errors::MigrationError;

    let config = test_config()?;
    let mut handle = None;

    let result: Result<(), MigrationError> = Database::scoped(&config, |pool| {
        handle = Some(pool.clone());
        async move {
            sqlx::query("SELECT 1").execute(&pool).await?;
            Err(MigrationError::InvalidPlan("stop here".to_string()))
        }
    })
    .await;

    assert!(matches!(result, Err(MigrationError::InvalidPlan(_))));
    let pool = handle.ok_or_else(|| anyhow::anyhow!("body never ran"))?;
    assert!(pool.is_closed());
    Ok(())
}
