//! Error types for unistore.
//!
//! Driver errors are classified into [`DataError`] at the adapter boundary so
//! callers never see engine-specific error types.

use std::path::PathBuf;

/// Configuration errors, raised once at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("missing required configuration: {0}")]
    MissingRequired(String),

    #[error("unsupported database engine '{0}'")]
    UnsupportedEngine(String),

    #[error("failed to read settings file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Secret codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The stored value is not of the form `ivHex:cipherHex`.
    #[error("malformed secret: {0}")]
    MalformedSecret(String),

    /// The cipher rejected the data (wrong key or corrupted ciphertext).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Errors produced by the schema registry, engine adapters and the
/// universal data service.
///
/// Absence of a record is never an error: single-record lookups return
/// `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// Malformed query, record or schema descriptor.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The backend could not be reached or the connection was lost.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("unsupported engine: {0}")]
    UnsupportedEngine(String),

    /// Declared schema disagrees with the table that already exists.
    #[error("schema conflict on '{table}': {message}")]
    SchemaConflict { table: String, message: String },

    /// Any other error reported by the engine.
    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<ConfigError> for DataError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::UnsupportedEngine(engine) => Self::UnsupportedEngine(engine),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DataError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DataError {
    fn from(e: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        if let Some(db) = e.as_db_error() {
            if *db.code() == SqlState::UNIQUE_VIOLATION {
                return Self::DuplicateKey(db.message().to_string());
            }
            return Self::Query(db.message().to_string());
        }
        let io_source = std::error::Error::source(&e)
            .and_then(|source| source.downcast_ref::<std::io::Error>())
            .is_some();
        if e.is_closed() || io_source {
            Self::EngineUnavailable(e.to_string())
        } else {
            Self::Query(e.to_string())
        }
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for DataError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Self::EngineUnavailable(e.to_string())
    }
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DataError {
    fn from(e: libsql::Error) -> Self {
        let message = e.to_string();
        if message.contains("UNIQUE constraint failed") {
            return Self::DuplicateKey(message);
        }
        match e {
            libsql::Error::ConnectionFailed(_) => Self::EngineUnavailable(message),
            _ => Self::Query(message),
        }
    }
}

#[cfg(feature = "mysql")]
impl From<sqlx::Error> for DataError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Self::DuplicateKey(db.message().to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::EngineUnavailable(e.to_string()),
            _ => Self::Query(e.to_string()),
        }
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for DataError {
    fn from(e: mongodb::error::Error) -> Self {
        use mongodb::error::{ErrorKind, WriteFailure};

        match e.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == 11000 => {
                Self::DuplicateKey(write.message.clone())
            }
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. } => Self::EngineUnavailable(e.to_string()),
            _ => Self::Query(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CodecError, ConfigError, DataError};

    #[test]
    fn unsupported_engine_config_error_keeps_its_kind() {
        let err: DataError = ConfigError::UnsupportedEngine("cassandra".to_string()).into();
        assert!(matches!(err, DataError::UnsupportedEngine(ref e) if e == "cassandra"));
    }

    #[test]
    fn codec_errors_are_distinct_kinds() {
        let malformed: DataError = CodecError::MalformedSecret("x".to_string()).into();
        let failed: DataError = CodecError::DecryptionFailed("y".to_string()).into();
        assert!(matches!(
            malformed,
            DataError::Codec(CodecError::MalformedSecret(_))
        ));
        assert!(matches!(
            failed,
            DataError::Codec(CodecError::DecryptionFailed(_))
        ));
    }
}
