//! Error types for the CHIME database layer.
//!
//! Every failure surfaces as a [`ChimeDbError`], so callers can catch everything
//! in one place while still matching on the specific kind (a routing failure is
//! not a validation failure).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ChimeDbResult<T> = Result<T, ChimeDbError>;

/// Main error type for chimedb.
#[derive(Debug, Error)]
pub enum ChimeDbError {
    /// An error occurred while trying to connect to the database.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No route to the database server could be found.
    ///
    /// This is a more specific kind of connection error; see
    /// [`ChimeDbError::is_connection_error`].
    #[error("No route to database: {message}")]
    NoRouteToDatabase {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A record with the same key already exists.
    #[error("Already exists: {message}")]
    AlreadyExists {
        /// Human-readable error message.
        message: String,
    },

    /// The database is internally inconsistent.
    #[error("Inconsistency: {message}")]
    Inconsistency {
        /// Human-readable error message.
        message: String,
    },

    /// A query returned no results.
    #[error("Not found: {message}")]
    NotFound {
        /// Human-readable error message.
        message: String,
    },

    /// A name or field value failed validation.
    #[error("Validation error: {message}")]
    Validation {
        /// Human-readable error message.
        message: String,
    },

    /// A user name and password did not match.
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
    },

    /// A statement failed on the server.
    #[error("Database error: {message}")]
    Database {
        /// Human-readable error message.
        message: String,
        /// Backend error code (SQLSTATE for PostgreSQL, extended result code for SQLite).
        code: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A configuration source was found but could not be used.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ChimeDbError {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new no-route error.
    pub fn no_route(message: impl Into<String>) -> Self {
        Self::NoRouteToDatabase { message: message.into(), source: None }
    }

    /// Create a new no-route error wrapping the error that caused it.
    pub fn no_route_with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::NoRouteToDatabase { message: message.into(), source: Some(source.into()) }
    }

    /// Create a new already-exists error.
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists { message: message.into() }
    }

    /// Create a new inconsistency error.
    pub fn inconsistency(message: impl Into<String>) -> Self {
        Self::Inconsistency { message: message.into() }
    }

    /// Create a new not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Create a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Create a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication { message: message.into() }
    }

    /// Create a new database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into(), code: None, source: None }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a new config error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(Box::new(source)) }
    }

    // ========== Methods ==========

    /// True for any failure to reach the database, including [`Self::NoRouteToDatabase`].
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::NoRouteToDatabase { .. })
    }

    /// True only when no route to the server could be found.
    pub fn is_no_route(&self) -> bool {
        matches!(self, Self::NoRouteToDatabase { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::NoRouteToDatabase { .. } => "Connection",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::Inconsistency { .. } => "Inconsistency",
            Self::NotFound { .. } => "NotFound",
            Self::Validation { .. } => "Validation",
            Self::Authentication { .. } => "Authentication",
            Self::Database { .. } => "Database",
            Self::Config { .. } => "Config",
        }
    }

    /// Get an actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { .. } => Some("Check that the database server is running"),
            Self::NoRouteToDatabase { .. } => {
                Some("Provide a chimedb rc file or check the tunnel host settings")
            }
            Self::Inconsistency { .. } => Some("Please report this issue"),
            Self::Config { .. } => Some("Check the chimedb configuration file"),
            Self::Authentication { .. } => Some("Check the user name and password"),
            Self::AlreadyExists { .. }
            | Self::NotFound { .. }
            | Self::Validation { .. }
            | Self::Database { .. } => None,
        }
    }

    /// Backend error code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Convert to user-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            error_type: format!("{} Error", self.category()),
            message: self.to_string(),
            hint: self.hint().map(String::from),
            technical_detail: self.code().map(|code| format!("Code: {code}")),
        }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Connection Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to ChimeDbError.
impl From<tokio_postgres::Error> for ChimeDbError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code().to_string();

            return match code_str.as_str() {
                // unique_violation
                "23505" => ChimeDbError::AlreadyExists { message },
                // Connection exceptions (08xxx) and invalid authorization (28xxx)
                c if c.starts_with("08") || c.starts_with("28") => {
                    ChimeDbError::Connection { message, source: Some(Box::new(err)) }
                }
                _ => ChimeDbError::Database {
                    message,
                    code: Some(code_str),
                    source: Some(Box::new(err)),
                },
            };
        }

        if err.is_closed() {
            return ChimeDbError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        ChimeDbError::Database { message: err.to_string(), code: None, source: Some(Box::new(err)) }
    }
}

/// Convert from rusqlite::Error to ChimeDbError.
impl From<rusqlite::Error> for ChimeDbError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => {
                ChimeDbError::NotFound { message: "Query returned no rows".to_string() }
            }
            rusqlite::Error::SqliteFailure(failure, msg) => {
                match failure.extended_code {
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => ChimeDbError::AlreadyExists {
                        message: msg.clone().unwrap_or_else(|| err.to_string()),
                    },
                    code => ChimeDbError::Database {
                        message: err.to_string(),
                        code: Some(code.to_string()),
                        source: Some(Box::new(err)),
                    },
                }
            }
            _ => ChimeDbError::Database {
                message: err.to_string(),
                code: None,
                source: Some(Box::new(err)),
            },
        }
    }
}

/// Convert from std::io::Error to ChimeDbError.
impl From<std::io::Error> for ChimeDbError {
    fn from(err: std::io::Error) -> Self {
        ChimeDbError::Config { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from serde_yaml::Error to ChimeDbError.
impl From<serde_yaml::Error> for ChimeDbError {
    fn from(err: serde_yaml::Error) -> Self {
        ChimeDbError::Config { message: format!("YAML error: {err}"), source: Some(Box::new(err)) }
    }
}

/// Convert from serde_json::Error to ChimeDbError.
impl From<serde_json::Error> for ChimeDbError {
    fn from(err: serde_json::Error) -> Self {
        ChimeDbError::Validation { message: format!("JSON error: {err}") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_route_is_a_connection_error() {
        let err = ChimeDbError::no_route("nowhere to go");
        assert!(err.is_connection_error());
        assert!(err.is_no_route());

        let err = ChimeDbError::connection("refused");
        assert!(err.is_connection_error());
        assert!(!err.is_no_route());

        assert!(!ChimeDbError::validation("bad").is_connection_error());
    }

    #[test]
    fn test_error_info() {
        let info = ChimeDbError::no_route("Could not tunnel through gw").to_error_info();
        assert_eq!(info.error_type, "Connection Error");
        assert!(info.message.contains("Could not tunnel through gw"));
        assert!(info.hint.is_some());
        assert!(info.technical_detail.is_none());
    }

    #[test]
    fn test_sqlite_unique_violation_maps_to_already_exists() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (name TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err: ChimeDbError = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err().into();
        assert!(matches!(err, ChimeDbError::AlreadyExists { .. }), "got {err:?}");
    }

    #[test]
    fn test_sqlite_no_rows_maps_to_not_found() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: ChimeDbError = conn
            .query_row("SELECT 1 WHERE 0", [], |row| row.get::<_, i64>(0))
            .unwrap_err()
            .into();
        assert!(matches!(err, ChimeDbError::NotFound { .. }));
    }
}
