//! Connection-string resolution.
//!
//! The connection string comes from a process environment variable when it is
//! set, and otherwise from a local `KEY=value` file. That file has been seen
//! saved as UTF-16LE with a byte-order mark as well as plain UTF-8, so the
//! bytes are decoded according to the BOM before `dotenvy` parses them.

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use url::Url;

use crate::errors::MigrationError;
use crate::format::redact_password;

pub const DEFAULT_ENV_KEY: &str = "DATABASE_URL";
pub const DEFAULT_ENV_FILE: &str = ".env";

const UTF16LE_BOM: [u8; 2] = [0xFF, 0xFE];
const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Transport encryption policy derived from the connection string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsPolicy {
    /// Encryption required, server certificate not verified.
    InsecureRequire,
    /// No transport encryption (local databases).
    Disabled,
    /// Whatever the connection string's own `sslmode` asks for.
    Default,
}

impl TlsPolicy {
    /// Picks the policy for a connection string.
    ///
    /// An explicit `sslmode` parameter wins. Otherwise local hosts get
    /// `Disabled` and everything else `InsecureRequire`, which is what the
    /// managed database provider needs.
    pub fn for_connection_string(connection_string: &str) -> Self {
        match Url::parse(connection_string) {
            Ok(url) => {
                let explicit = url
                    .query_pairs()
                    .any(|(k, _)| k == "sslmode" || k == "ssl-mode");
                if explicit {
                    return TlsPolicy::Default;
                }
                match url.host_str() {
                    Some(host) if is_local_host(host) => TlsPolicy::Disabled,
                    Some(_) => TlsPolicy::InsecureRequire,
                    // Socket paths and host-less URLs
                    None if is_local_host(connection_string) => TlsPolicy::Disabled,
                    None => TlsPolicy::InsecureRequire,
                }
            }
            Err(_) if is_local_host(connection_string) => TlsPolicy::Disabled,
            Err(_) => TlsPolicy::InsecureRequire,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsPolicy::InsecureRequire => "insecure-require",
            TlsPolicy::Disabled => "disabled",
            TlsPolicy::Default => "default",
        }
    }
}

impl fmt::Display for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_local_host(host: &str) -> bool {
    host.contains("localhost") || host.contains("127.0.0.1")
}

/// Where a resolved connection string came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Environment(String),
    File(PathBuf),
    Explicit,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Environment(key) => write!(f, "environment variable {}", key),
            ConfigSource::File(path) => write!(f, "file {}", path.display()),
            ConfigSource::Explicit => f.write_str("explicit value"),
        }
    }
}

/// Resolved connection string plus its TLS policy. Built once per process.
#[derive(Clone)]
pub struct ConnectionConfig {
    connection_string: String,
    tls: TlsPolicy,
    source: ConfigSource,
}

impl ConnectionConfig {
    /// Wraps a connection string that was obtained some other way.
    pub fn from_connection_string(connection_string: impl Into<String>) -> Self {
        Self::with_source(connection_string.into(), ConfigSource::Explicit)
    }

    fn with_source(connection_string: String, source: ConfigSource) -> Self {
        let tls = TlsPolicy::for_connection_string(&connection_string);
        Self {
            connection_string,
            tls,
            source,
        }
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        self.tls
    }

    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    /// Connection string with the password masked.
    pub fn redacted(&self) -> String {
        redact_password(&self.connection_string)
    }

    /// Host component, if the connection string is a URL with one.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.connection_string)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    /// sqlx connect options with the TLS policy applied.
    pub fn connect_options(&self) -> Result<PgConnectOptions, MigrationError> {
        let options = PgConnectOptions::from_str(&self.connection_string)?;
        Ok(match self.tls {
            TlsPolicy::Disabled => options.ssl_mode(PgSslMode::Disable),
            TlsPolicy::InsecureRequire => options.ssl_mode(PgSslMode::Require),
            TlsPolicy::Default => options,
        })
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("connection_string", &self.redacted())
            .field("tls", &self.tls)
            .field("source", &self.source)
            .finish()
    }
}

/// Resolves `key` from the process environment, falling back to `fallback_path`.
pub fn resolve_connection(
    key: &str,
    fallback_path: impl AsRef<Path>,
) -> Result<ConnectionConfig, MigrationError> {
    resolve_connection_with(|k| std::env::var(k).ok(), key, fallback_path)
}

/// Same as [`resolve_connection`] with an injectable environment lookup.
pub fn resolve_connection_with<F>(
    lookup: F,
    key: &str,
    fallback_path: impl AsRef<Path>,
) -> Result<ConnectionConfig, MigrationError>
where
    F: Fn(&str) -> Option<String>,
{
    let fallback_path = fallback_path.as_ref();

    if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
        tracing::debug!("Using {} from the process environment", key);
        return Ok(ConnectionConfig::with_source(
            value,
            ConfigSource::Environment(key.to_string()),
        ));
    }

    let config_error = |reason: String| MigrationError::Configuration {
        key: key.to_string(),
        path: fallback_path.to_path_buf(),
        reason,
    };

    let bytes = std::fs::read(fallback_path).map_err(|e| config_error(e.to_string()))?;
    let text = decode_env_bytes(&bytes);

    match find_env_value(&text, key) {
        Some(value) => {
            tracing::debug!("Using {} from {}", key, fallback_path.display());
            Ok(ConnectionConfig::with_source(
                value,
                ConfigSource::File(fallback_path.to_path_buf()),
            ))
        }
        None => Err(config_error(format!("no non-empty {}= line found", key))),
    }
}

/// Decodes an env file: UTF-16LE when it starts with `FF FE`, UTF-8 otherwise.
///
/// Malformed sequences are replaced rather than rejected.
pub fn decode_env_bytes(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&UTF16LE_BOM) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    let rest = bytes.strip_prefix(&UTF8_BOM).unwrap_or(bytes);
    String::from_utf8_lossy(rest).into_owned()
}

/// Finds the first non-empty value for `key` in decoded env text.
///
/// Lines are parsed with `dotenvy` without touching the process
/// environment. Lines that fail to parse are skipped.
pub fn find_env_value(text: &str, key: &str) -> Option<String> {
    dotenvy::from_read_iter(Cursor::new(text.as_bytes()))
        .filter_map(|item| match item {
            Ok(pair) => Some(pair),
            Err(e) => {
                tracing::debug!("Skipping unparsable env line: {}", e);
                None
            }
        })
        .find(|(k, v)| k == key && !v.trim().is_empty())
        .map(|(_, v)| v.trim().to_string())
}
