use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde_json::json;

use insighted_schema::config::{resolve_connection, ConnectionConfig, DEFAULT_ENV_FILE, DEFAULT_ENV_KEY};
use insighted_schema::db::Database;
use insighted_schema::errors::MigrationError;
use insighted_schema::logging;
use insighted_schema::migrator::{run_plan, MigrationPlan, MigrationReport, Step};
use insighted_schema::schema::{missing_columns, Change, ColumnName, ColumnSpec, SchemaInspector, TableName};

/// Idempotent column migrations for the InsightEd database
#[derive(Parser, Debug)]
#[command(name = "insighted-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct GlobalArgs {
    /// Environment variable holding the connection string
    #[arg(long, global = true, default_value = DEFAULT_ENV_KEY)]
    env_key: String,

    /// File to read the connection string from when the variable is unset
    #[arg(long, global = true, default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Print the report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add columns that do not exist yet
    Add(AddArgs),

    /// Drop columns that still exist
    Drop(DropArgs),

    /// Run a JSON plan file
    Apply(ApplyArgs),

    /// Check that columns are present without changing anything
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
struct AddArgs {
    /// Target table, optionally schema-qualified
    #[arg(short, long, value_parser = parse_table)]
    table: TableName,

    /// Column to add, as NAME:TYPE (repeatable)
    #[arg(short, long = "column", value_name = "NAME:TYPE", required = true, value_parser = parse_column_spec)]
    columns: Vec<ColumnSpec>,

    /// Apply all columns in one transaction
    #[arg(long)]
    atomic: bool,
}

#[derive(Args, Debug)]
struct DropArgs {
    /// Target table, optionally schema-qualified
    #[arg(short, long, value_parser = parse_table)]
    table: TableName,

    /// Column to drop (repeatable)
    #[arg(short, long = "column", value_name = "NAME", required = true, value_parser = parse_column_name)]
    columns: Vec<ColumnName>,

    /// Drop all columns in one transaction
    #[arg(long)]
    atomic: bool,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    /// Path to the plan file
    #[arg(short, long)]
    plan: PathBuf,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Target table, optionally schema-qualified
    #[arg(short, long, value_parser = parse_table)]
    table: TableName,

    /// Column that must exist (repeatable)
    #[arg(short, long = "column", value_name = "NAME", required = true, value_parser = parse_column_name)]
    columns: Vec<ColumnName>,
}

fn parse_table(s: &str) -> Result<TableName, String> {
    TableName::parse(s).map_err(|e| e.to_string())
}

fn parse_column_spec(s: &str) -> Result<ColumnSpec, String> {
    ColumnSpec::parse(s).map_err(|e| e.to_string())
}

fn parse_column_name(s: &str) -> Result<ColumnName, String> {
    ColumnName::new(s).map_err(|e| e.to_string())
}

/// Builds a plan of independent steps, or one atomic group.
fn build_plan(table: TableName, changes: Vec<Change>, atomic: bool) -> MigrationPlan {
    let steps = if atomic {
        vec![Step::Atomic(changes)]
    } else {
        changes
            .into_iter()
            .map(|change| match change {
                Change::Add(spec) => Step::Add(spec),
                Change::Drop(name) => Step::Drop(name),
            })
            .collect()
    };
    MigrationPlan { table, steps }
}

fn resolve(global: &GlobalArgs) -> Result<ConnectionConfig, MigrationError> {
    let config = resolve_connection(&global.env_key, &global.env_file)?;
    tracing::info!(
        "Connection string from {} (tls: {})",
        config.source(),
        config.tls_policy()
    );
    Ok(config)
}

fn print_report(report: &MigrationReport, as_json: bool) {
    if as_json {
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
    } else {
        println!("{}", report);
    }
}

async fn migrate(global: &GlobalArgs, plan: MigrationPlan) -> Result<u8, MigrationError> {
    plan.validate()?;
    let config = resolve(global)?;

    tracing::info!(
        "Migrating {} ({} changes)",
        plan.table,
        plan.change_count()
    );
    let report = run_plan(&config, &plan).await?;
    print_report(&report, global.json);

    if report.is_success() {
        tracing::info!("Migration finished");
    } else {
        tracing::warn!("Migration finished with failures");
    }
    Ok(report.exit_code())
}

async fn verify(global: &GlobalArgs, args: VerifyArgs) -> Result<u8, MigrationError> {
    let config = resolve(global)?;
    let table = args.table;

    let existing = Database::scoped(&config, |pool| {
        let table = table.clone();
        async move {
            let inspector = SchemaInspector::new(pool);
            if !inspector.table_exists(&table).await? {
                return Err(MigrationError::SchemaInspection {
                    table: table.to_string(),
                    message: "table does not exist".to_string(),
                });
            }
            inspector.column_names(&table).await
        }
    })
    .await?;

    let missing = missing_columns(&existing, &args.columns);
    let missing: Vec<String> = missing.iter().map(ToString::to_string).collect();

    if global.json {
        let body = json!({
            "table": table.to_string(),
            "verified": missing.is_empty(),
            "missing": missing,
        });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else if missing.is_empty() {
        println!("VERIFICATION_SUCCESS: All columns are present.");
    } else {
        println!("VERIFICATION_FAILED: Missing: {}", missing.join(", "));
    }

    Ok(if missing.is_empty() { 0 } else { 2 })
}

async fn run(cli: Cli) -> Result<u8, MigrationError> {
    let global = cli.global;
    match cli.command {
        Commands::Add(args) => {
            let changes = args.columns.into_iter().map(Change::Add).collect();
            migrate(&global, build_plan(args.table, changes, args.atomic)).await
        }
        Commands::Drop(args) => {
            let changes = args.columns.into_iter().map(Change::Drop).collect();
            migrate(&global, build_plan(args.table, changes, args.atomic)).await
        }
        Commands::Apply(args) => {
            let plan = MigrationPlan::from_file(&args.plan)?;
            migrate(&global, plan).await
        }
        Commands::Verify(args) => verify(&global, args).await,
    }
}

/// Entry point for `insighted-migrate`.
///
/// Exit codes: 0 success, 1 fatal error (configuration, connection,
/// inspection, invalid input), 2 when some column failed or the schema
/// could not be verified, 130 when interrupted.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init("insighted_migrate", cli.global.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_command() {
        let cli = Cli::try_parse_from([
            "insighted-migrate",
            "add",
            "--table",
            "engineer_form",
            "-c",
            "number_of_classrooms:INTEGER DEFAULT 0",
            "-c",
            "funds_utilized:NUMERIC DEFAULT 0",
            "--json",
        ])
        .unwrap();
        assert!(cli.global.json);
        assert_eq!(cli.global.env_key, "DATABASE_URL");
        match cli.command {
            Commands::Add(args) => {
                assert_eq!(args.table.to_string(), "engineer_form");
                assert_eq!(args.columns.len(), 2);
                assert_eq!(args.columns[1].column_type, "NUMERIC DEFAULT 0");
                assert!(!args.atomic);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_unsafe_column() {
        let res = Cli::try_parse_from([
            "insighted-migrate",
            "drop",
            "--table",
            "school_profiles",
            "-c",
            "res_faucets; DROP TABLE schools",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn test_build_plan_atomic_and_independent() {
        let table = TableName::parse("engineer_form").unwrap();
        let changes = vec![
            Change::Add(ColumnSpec::new("latitude", "TEXT").unwrap()),
            Change::Add(ColumnSpec::new("longitude", "TEXT").unwrap()),
        ];

        let plan = build_plan(table.clone(), changes.clone(), true);
        assert_eq!(plan.steps, vec![Step::Atomic(changes.clone())]);

        let plan = build_plan(table, changes, false);
        assert_eq!(plan.steps.len(), 2);
        assert!(matches!(plan.steps[0], Step::Add(_)));
    }
}
