//! Connection probe: resolves the connection string, connects with the
//! derived TLS policy and reports what the server says about the session.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use insighted_schema::config::{resolve_connection, DEFAULT_ENV_FILE, DEFAULT_ENV_KEY};
use insighted_schema::db::Database;
use insighted_schema::errors::{sqlstate, MigrationError};
use insighted_schema::logging;

#[derive(Parser, Debug)]
#[command(name = "db_probe", version, about = "Check that the database is reachable")]
struct Args {
    #[arg(long, default_value = DEFAULT_ENV_KEY)]
    env_key: String,

    #[arg(long, default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    #[arg(short, long)]
    verbose: bool,
}

/// Operator hint for well-known connection failures.
fn hint(err: &MigrationError) -> Option<&'static str> {
    let MigrationError::Connection(inner) = err.root() else {
        return None;
    };
    match sqlstate(inner).as_deref() {
        Some("28P01") => Some("authentication failed, check the password in the connection string"),
        Some("3D000") => Some("the database named in the connection string does not exist"),
        _ => match inner {
            sqlx::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionReset => {
                Some("connection reset, usually a firewall or network allow-list issue")
            }
            sqlx::Error::Tls(_) => Some("TLS handshake failed, check the TLS policy for this host"),
            sqlx::Error::PoolTimedOut => Some("timed out connecting, is the host reachable?"),
            _ => None,
        },
    }
}

async fn probe(args: &Args) -> Result<(), MigrationError> {
    let config = resolve_connection(&args.env_key, &args.env_file)?;
    println!("Source:   {}", config.source());
    println!("Target:   {}", config.redacted());
    if let Some(host) = config.host() {
        println!("Host:     {}", host);
    }
    println!("TLS:      {}", config.tls_policy());

    let db = Database::connect(&config).await?;
    let info = db.server_info().await;
    db.close().await;
    let info = info?;

    println!("Server:   {}", info.version);
    println!("Database: {} as {}", info.database, info.user_name);
    match info.ssl {
        Some(true) => println!("Session:  encrypted"),
        Some(false) => println!("Session:  not encrypted"),
        None => println!("Session:  encryption status unavailable"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init("db_probe", args.verbose);

    match probe(&args).await {
        Ok(()) => {
            println!("Connected successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Connection failed: {}", e);
            if let Some(hint) = hint(&e) {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insighted_schema::errors::ResultExt;

    #[test]
    fn test_hint_for_bare_connection_error() {
        let err = MigrationError::Connection(sqlx::Error::PoolTimedOut);
        assert_eq!(hint(&err), Some("timed out connecting, is the host reachable?"));
    }

    #[test]
    fn test_hint_looks_through_context() {
        let res: Result<(), sqlx::Error> = Err(sqlx::Error::PoolTimedOut);
        let err = res.context("reading session info").unwrap_err();
        assert_eq!(hint(&err), Some("timed out connecting, is the host reachable?"));
    }

    #[test]
    fn test_no_hint_for_input_errors() {
        let err = MigrationError::InvalidPlan("no steps".to_string());
        assert_eq!(hint(&err), None);
    }
}
