//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::RegistryConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Environment variable holding a `;`-separated store endpoint list.
pub const ENV_STORE_ENDPOINTS: &str = "ETCD_HOST";

/// Environment variable overriding the registry root.
pub const ENV_ROOT: &str = "REGISTRY_ROOT";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<RegistryConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: RegistryConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply environment overrides on top of a loaded configuration and
/// re-validate the result.
pub fn apply_env_overrides(config: RegistryConfig) -> Result<RegistryConfig, ConfigError> {
    apply_overrides(
        config,
        std::env::var(ENV_STORE_ENDPOINTS).ok(),
        std::env::var(ENV_ROOT).ok(),
    )
}

fn apply_overrides(
    mut config: RegistryConfig,
    endpoints: Option<String>,
    root: Option<String>,
) -> Result<RegistryConfig, ConfigError> {
    if let Some(list) = endpoints.filter(|v| !v.trim().is_empty()) {
        config.store.endpoints = list
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        tracing::debug!(endpoints = ?config.store.endpoints, "Store endpoints taken from environment");
    }
    if let Some(root) = root.filter(|v| !v.trim().is_empty()) {
        config.store.root = root.trim().to_string();
    }

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_from_file() {
        let path = std::env::temp_dir().join("service_registry_loader_test.toml");
        fs::write(
            &path,
            "[store]\nroot = \"/svc\"\n[retry]\nmax_attempts = 2\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.store.root, "/svc");
        assert_eq!(config.retry.max_attempts, 2);

        fs::remove_file(&path).unwrap_or_default();
    }

    #[test]
    fn test_invalid_file_reports_validation() {
        let path = std::env::temp_dir().join("service_registry_loader_invalid.toml");
        fs::write(&path, "[dial]\ntimeout_secs = 0\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref v) if v.len() == 1));
        assert!(err.to_string().contains("dial.timeout_secs"));

        fs::remove_file(&path).unwrap_or_default();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/registry.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_endpoint_override_splits_on_semicolon() {
        let config = apply_overrides(
            RegistryConfig::default(),
            Some("http://10.0.0.1:2379; http://10.0.0.2:2379;".into()),
            Some("/fleet".into()),
        )
        .unwrap();

        assert_eq!(
            config.store.endpoints,
            vec!["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
        );
        assert_eq!(config.store.root, "/fleet");
        assert_eq!(config.store.names_key_path().as_deref(), Some("/fleet/names"));
    }

    #[test]
    fn test_override_is_validated() {
        let err = apply_overrides(RegistryConfig::default(), None, Some("fleet".into())).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
