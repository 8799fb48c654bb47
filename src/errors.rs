use std::fmt;
use std::path::PathBuf;

/// Errors raised while resolving configuration, talking to the database,
/// or applying column changes.
#[derive(Debug)]
pub enum MigrationError {
    /// Connection string could not be resolved from the environment or the fallback file.
    Configuration {
        /// Environment key that was looked up.
        key: String,
        /// Fallback file that was attempted.
        path: PathBuf,
        /// What went wrong with the file.
        reason: String,
    },
    /// Network or authentication failure reaching the database.
    Connection(sqlx::Error),
    /// Introspection query failed or the target table does not exist.
    SchemaInspection { table: String, message: String },
    /// A single add/drop statement failed.
    ColumnOperation {
        column: String,
        intent: String,
        message: String,
    },
    /// Table name, column name or type clause rejected before reaching SQL.
    InvalidIdentifier(String),
    /// Plan file could not be read or parsed.
    InvalidPlan(String),
    /// The run was stopped by Ctrl-C before it finished.
    Interrupted,
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<MigrationError>,
        /// Additional context message.
        context: String,
    },
}

impl MigrationError {
    /// Innermost error beneath any added context.
    pub fn root(&self) -> &MigrationError {
        match self {
            MigrationError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrationError::ColumnOperation { .. } => 2,
            MigrationError::Interrupted => 130,
            MigrationError::WithContext { source, .. } => source.exit_code(),
            _ => 1,
        }
    }

    /// Underlying database message, without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            MigrationError::Connection(e) => database_message(e),
            MigrationError::SchemaInspection { message, .. } => message.clone(),
            MigrationError::ColumnOperation { message, .. } => message.clone(),
            MigrationError::WithContext { source, .. } => source.detail(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Configuration { key, path, reason } => write!(
                f,
                "Configuration error: {} is not set and could not be read from {} ({})",
                key,
                path.display(),
                reason
            ),
            MigrationError::Connection(e) => {
                write!(f, "Connection error: {}", database_message(e))
            }
            MigrationError::SchemaInspection { table, message } => {
                write!(f, "Schema inspection failed for {}: {}", table, message)
            }
            MigrationError::ColumnOperation {
                column,
                intent,
                message,
            } => write!(f, "Failed to {} column {}: {}", intent, column, message),
            MigrationError::InvalidIdentifier(msg) => write!(f, "Invalid identifier: {}", msg),
            MigrationError::InvalidPlan(msg) => write!(f, "Invalid plan: {}", msg),
            MigrationError::Interrupted => write!(f, "Interrupted"),
            MigrationError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Connection(e) => Some(e),
            MigrationError::WithContext { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for MigrationError {
    /// Converts a `sqlx::Error` raised while establishing the session.
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Connection(err)
    }
}

/// Database message for a sqlx error, including the SQLSTATE when the server sent one.
pub fn database_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => format!("{} (SQLSTATE {})", db.message(), code),
            None => db.message().to_string(),
        },
        other => other.to_string(),
    }
}

/// SQLSTATE code of a sqlx error, if the server reported one.
pub fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// Wraps a failed query as a [`MigrationError::Connection`] under a short description.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, MigrationError>;
}

impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, MigrationError> {
        self.map_err(|e| MigrationError::WithContext {
            source: Box::new(MigrationError::Connection(e)),
            context: context.into(),
        })
    }
}
