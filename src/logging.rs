use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes tracing for a binary. `RUST_LOG` overrides the default filter.
///
/// Logs go to stderr so stdout stays clean for reports and `--json` output.
pub fn init(crate_name: &str, verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let default_filter = format!("warn,insighted_schema={level},{crate_name}={level}");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
