//! Process configuration, resolved once at startup.
//!
//! Precedence: environment (including `.env` via dotenvy) over the optional
//! TOML settings file over built-in defaults.

mod helpers;

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::crypto::DEFAULT_PASSPHRASE;
use crate::error::ConfigError;
use crate::settings::Settings;

pub(crate) use helpers::optional_env;
use helpers::{parse_usize_value, raw_env, trimmed};

/// Storage engine selected for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackend {
    /// Embedded single-file store (libSQL).
    Embedded,
    /// Document store (MongoDB).
    Document,
    Postgres,
    MySql,
}

impl DatabaseBackend {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "embedded" | "libsql" | "sqlite" => Ok(Self::Embedded),
            "document" | "mongodb" | "mongo" => Ok(Self::Document),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(ConfigError::UnsupportedEngine(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Document => "mongodb",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        }
    }

    /// Whether the adapter for this engine was compiled in.
    pub fn is_available(self) -> bool {
        match self {
            Self::Embedded => cfg!(feature = "libsql"),
            Self::Document => cfg!(feature = "mongodb"),
            Self::Postgres => cfg!(feature = "postgres"),
            Self::MySql => cfg!(feature = "mysql"),
        }
    }

    fn needs_url(self) -> bool {
        !matches!(self, Self::Embedded)
    }
}

impl std::fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `ensure_schema` does when an existing table lacks declared columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaConflictPolicy {
    /// Log and continue.
    #[default]
    Warn,
    /// Fail with `DataError::SchemaConflict`.
    Strict,
}

impl SchemaConflictPolicy {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(Self::Warn),
            "strict" => Ok(Self::Strict),
            other => Err(ConfigError::InvalidValue {
                key: "SCHEMA_CONFLICT_POLICY".to_string(),
                message: format!("expected 'warn' or 'strict', got '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// Connection URL for the server engines. Carries credentials.
    pub url: Option<SecretString>,
    pub pool_size: usize,
    pub embedded_path: PathBuf,
    pub mongodb_database: String,
    pub schema_conflict_policy: SchemaConflictPolicy,
}

impl DatabaseConfig {
    /// Embedded store at `path`; used by tests and tools.
    pub fn embedded(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: DatabaseBackend::Embedded,
            url: None,
            pool_size: DEFAULT_POOL_SIZE,
            embedded_path: path.into(),
            mongodb_database: DEFAULT_MONGODB_DATABASE.to_string(),
            schema_conflict_policy: SchemaConflictPolicy::Warn,
        }
    }

    /// URL with the secret exposed, or `MissingRequired`.
    pub fn require_url(&self) -> Result<&str, ConfigError> {
        self.url
            .as_ref()
            .map(|u| u.expose_secret())
            .ok_or_else(|| ConfigError::MissingRequired("DATABASE_URL".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub key: SecretString,
    /// True when `ENCRYPTION_KEY` was absent and the built-in default is in
    /// use.
    pub using_default_key: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub encryption: EncryptionConfig,
}

pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_MONGODB_DATABASE: &str = "unistore";

/// `~/.unistore/unistore.db`, or `./unistore.db` when there is no home.
pub fn default_embedded_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".unistore"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("unistore.db")
}

type EnvLookup<'a> = &'a dyn Fn(&str) -> Result<Option<String>, ConfigError>;

impl Config {
    /// Load `.env`, the optional `UNISTORE_CONFIG` file and the
    /// environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let settings = match optional_env("UNISTORE_CONFIG")? {
            Some(path) => Settings::load(std::path::Path::new(&path))?,
            None => Settings::default(),
        };
        Self::resolve(&settings)
    }

    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Self::resolve_with(settings, &raw_env)
    }

    pub(crate) fn resolve_with(settings: &Settings, env: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let db = &settings.database;
        // Every value but the key is trimmed; the key must reach the codec
        // byte for byte.
        let var = |key: &str| env(key).map(trimmed);

        let backend_raw = var("DATABASE_BACKEND")?
            .or_else(|| db.backend.clone())
            .unwrap_or_else(|| "embedded".to_string());
        let backend = DatabaseBackend::parse(&backend_raw)?;
        if !backend.is_available() {
            return Err(ConfigError::UnsupportedEngine(format!(
                "{backend} (compiled without the '{}' feature)",
                match backend {
                    DatabaseBackend::Embedded => "libsql",
                    DatabaseBackend::Document => "mongodb",
                    DatabaseBackend::Postgres => "postgres",
                    DatabaseBackend::MySql => "mysql",
                }
            )));
        }

        let url = var("DATABASE_URL")?.or_else(|| db.url.clone());
        if backend.needs_url() && url.is_none() {
            return Err(ConfigError::MissingRequired(format!(
                "DATABASE_URL (required for {backend})"
            )));
        }

        let pool_size = match var("DATABASE_POOL_SIZE")? {
            Some(raw) => parse_usize_value("DATABASE_POOL_SIZE", &raw)?,
            None => db.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
        };
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_POOL_SIZE".to_string(),
                message: "pool size must be at least 1".to_string(),
            });
        }

        let schema_conflict_policy = match var("SCHEMA_CONFLICT_POLICY")?
            .or_else(|| db.schema_conflict_policy.clone())
        {
            Some(raw) => SchemaConflictPolicy::parse(&raw)?,
            None => SchemaConflictPolicy::default(),
        };

        let embedded_path = var("EMBEDDED_DB_PATH")?
            .map(PathBuf::from)
            .or_else(|| db.embedded_path.clone())
            .unwrap_or_else(default_embedded_path);

        let mongodb_database = var("MONGODB_DATABASE")?
            .or_else(|| db.mongodb_database.clone())
            .unwrap_or_else(|| DEFAULT_MONGODB_DATABASE.to_string());

        let (key, using_default_key) = match env("ENCRYPTION_KEY")?.filter(|key| !key.is_empty()) {
            Some(key) => (key, false),
            None => {
                tracing::warn!(
                    "ENCRYPTION_KEY is not set; secrets use the built-in default key and are not protected"
                );
                (DEFAULT_PASSPHRASE.to_string(), true)
            }
        };

        Ok(Self {
            database: DatabaseConfig {
                backend,
                url: url.map(SecretString::from),
                pool_size,
                embedded_path,
                mongodb_database,
                schema_conflict_policy,
            },
            encryption: EncryptionConfig {
                key: SecretString::from(key),
                using_default_key,
            },
        })
    }
}
