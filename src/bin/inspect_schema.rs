//! Utility to inspect the database schema and print table structures.

use std::path::PathBuf;

use clap::Parser;

use insighted_schema::config::{resolve_connection, DEFAULT_ENV_FILE, DEFAULT_ENV_KEY};
use insighted_schema::db::Database;
use insighted_schema::errors::MigrationError;
use insighted_schema::format::format_thousands;
use insighted_schema::logging;
use insighted_schema::schema::{SchemaInspector, TableName};

/// List tables, or print columns and row counts of the given tables
#[derive(Parser, Debug)]
#[command(name = "inspect_schema", version, about)]
struct Args {
    /// Tables to describe; lists every table in --schema when omitted
    tables: Vec<String>,

    /// Schema to list tables from
    #[arg(long, default_value = "public")]
    schema: String,

    /// Skip the COUNT(*) per table
    #[arg(long)]
    no_count: bool,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    #[arg(long, default_value = DEFAULT_ENV_KEY)]
    env_key: String,

    #[arg(long, default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,
}

/// Main entry point for the schema inspection utility.
///
/// Connects to the database and lists columns for the requested tables.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init("inspect_schema", false);

    let tables = args
        .tables
        .iter()
        .map(|t| TableName::parse(t))
        .collect::<Result<Vec<_>, _>>()?;

    let config = resolve_connection(&args.env_key, &args.env_file)?;

    Database::scoped(&config, |pool| async move {
        let inspector = SchemaInspector::new(pool);

        if tables.is_empty() {
            let names = inspector.list_tables(&args.schema).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&names).unwrap_or_default());
            } else {
                println!("Tables in {}:", args.schema);
                for name in names {
                    println!("- {}", name);
                }
            }
            return Ok(());
        }

        let mut described = Vec::new();
        for table in &tables {
            if !inspector.table_exists(table).await? {
                tracing::warn!("{} does not exist", table);
                continue;
            }
            let columns = inspector.columns(table).await?;
            let rows = if args.no_count {
                None
            } else {
                Some(inspector.row_count(table).await?)
            };

            if args.json {
                described.push(serde_json::json!({
                    "table": table.to_string(),
                    "rows": rows,
                    "columns": columns,
                }));
                continue;
            }

            match rows {
                Some(n) => println!("- {} ({} rows)", table, format_thousands(n)),
                None => println!("- {}", table),
            }
            for col in &columns {
                let nullable = if col.is_nullable == "YES" { "" } else { " not null" };
                match &col.column_default {
                    Some(default) => println!(
                        "  - {}: {}{} default {}",
                        col.column_name, col.data_type, nullable, default
                    ),
                    None => println!("  - {}: {}{}", col.column_name, col.data_type, nullable),
                }
            }
            println!();
        }

        if args.json {
            println!("{}", serde_json::to_string_pretty(&described).unwrap_or_default());
        }
        Ok::<(), MigrationError>(())
    })
    .await?;

    Ok(())
}
