//! Optional TOML settings file. Environment variables override every value
//! here; see [`crate::config::Config::resolve`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub backend: Option<String>,
    pub url: Option<String>,
    pub pool_size: Option<usize>,
    pub embedded_path: Option<PathBuf>,
    pub mongodb_database: Option<String>,
    pub schema_conflict_policy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn parses_database_section() {
        let settings = Settings::from_toml(
            r#"
            [database]
            backend = "postgres"
            url = "postgres://localhost/app"
            pool_size = 4
            "#,
        )
        .expect("valid toml");
        assert_eq!(settings.database.backend.as_deref(), Some("postgres"));
        assert_eq!(settings.database.pool_size, Some(4));
        assert_eq!(settings.database.embedded_path, None);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let settings = Settings::from_toml("").expect("empty toml");
        assert!(settings.database.backend.is_none());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Settings::load(&dir.path().join("absent.toml")).expect_err("missing file");
        assert!(err.to_string().contains("absent.toml"), "unexpected: {err}");
    }
}
