//! Environment lookup helpers shared by the config resolvers.

use crate::error::ConfigError;

/// Read an env var exactly as set. Unset and empty are `None`.
pub(crate) fn raw_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

/// Trim a looked-up value; whitespace-only counts as unset.
pub(crate) fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read an env var, treating unset and empty/whitespace as `None`.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    raw_env(key).map(trimmed)
}

pub(crate) fn parse_usize_value(key: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a positive integer, got '{raw}': {e}"),
        })
}

#[cfg(test)]
mod tests {
    use crate::error::ConfigError;

    #[test]
    fn trimmed_drops_blank_values() {
        assert_eq!(super::trimmed(Some("  pg ".to_string())).as_deref(), Some("pg"));
        assert_eq!(super::trimmed(Some("   ".to_string())), None);
        assert_eq!(super::trimmed(None), None);
    }

    #[test]
    fn parse_usize_value_trims() {
        assert_eq!(super::parse_usize_value("K", " 12 ").expect("number"), 12);
    }

    #[test]
    fn parse_usize_value_rejects_garbage() {
        let err = super::parse_usize_value("POOL", "-3").expect_err("must reject");
        let ConfigError::InvalidValue { key, message } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "POOL");
        assert!(message.contains("-3"), "unexpected message: {message}");
    }
}
