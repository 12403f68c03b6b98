//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate store endpoints and the root layout
//! - Validate value ranges (timeouts, intervals, budgets > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RegistryConfig → Result<(), Vec<ValidationError>>

use thiserror::Error;
use url::Url;

use crate::config::schema::RegistryConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("store.endpoints must not be empty")]
    NoEndpoints,

    #[error("invalid store endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("store.root '{0}' must start with '/' and must not end with '/'")]
    InvalidRoot(String),

    #[error("store.names_key '{0}' must not be empty or end with '/'")]
    InvalidNamesKey(String),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("invalid name '{name}' in {field}: names are single path segments")]
    InvalidName { field: &'static str, name: String },

    #[error("watch.max_delay_ms ({max}) is below watch.base_delay_ms ({base})")]
    BackoffRange { base: u64, max: u64 },
}

fn is_segment(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains('/')
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &RegistryConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.store.endpoints.is_empty() {
        errors.push(ValidationError::NoEndpoints);
    }
    for endpoint in &config.store.endpoints {
        match Url::parse(endpoint) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => errors.push(ValidationError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            }),
            Err(e) => errors.push(ValidationError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            }),
        }
    }

    let root = &config.store.root;
    if !root.starts_with('/') || (root.len() > 1 && root.ends_with('/')) || root == "/" {
        errors.push(ValidationError::InvalidRoot(root.clone()));
    }
    if let Some(key) = &config.store.names_key {
        if key.trim().is_empty() || key.ends_with('/') {
            errors.push(ValidationError::InvalidNamesKey(key.clone()));
        }
    }

    let ranges = [
        ("store.request_timeout_secs", config.store.request_timeout_secs),
        ("dial.timeout_secs", config.dial.timeout_secs),
        ("retry.interval_secs", config.retry.interval_secs),
        ("retry.max_attempts", u64::from(config.retry.max_attempts)),
        ("watch.base_delay_ms", config.watch.base_delay_ms),
    ];
    for (field, value) in ranges {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }
    if config.watch.max_delay_ms < config.watch.base_delay_ms {
        errors.push(ValidationError::BackoffRange {
            base: config.watch.base_delay_ms,
            max: config.watch.max_delay_ms,
        });
    }

    for name in &config.services.known {
        if !is_segment(name) {
            errors.push(ValidationError::InvalidName {
                field: "services.known",
                name: name.clone(),
            });
        }
    }

    if let Some(announce) = &config.announce {
        for (field, name) in [
            ("announce.service", &announce.service),
            ("announce.instance_id", &announce.instance_id),
        ] {
            if !is_segment(name) {
                errors.push(ValidationError::InvalidName {
                    field,
                    name: name.clone(),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::AnnounceConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&RegistryConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = RegistryConfig::default();
        config.store.endpoints = vec!["not a url".into(), "ftp://host:21".into()];
        config.store.root = "/backends/".into();
        config.dial.timeout_secs = 0;
        config.retry.max_attempts = 0;
        config.store.names_key = Some("names/".into());
        config.services.known = vec!["auth".into(), "a/b".into()];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 7);
        assert!(errors.contains(&ValidationError::InvalidNamesKey("names/".into())));
        assert!(errors.contains(&ValidationError::InvalidRoot("/backends/".into())));
        assert!(errors.contains(&ValidationError::Zero { field: "dial.timeout_secs" }));
        assert!(errors.contains(&ValidationError::Zero { field: "retry.max_attempts" }));
    }

    #[test]
    fn test_announce_names_checked() {
        let mut config = RegistryConfig::default();
        config.announce = Some(AnnounceConfig {
            service: "auth".into(),
            instance_id: "".into(),
            address: "10.0.0.1:9000".into(),
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::InvalidName {
                field: "announce.instance_id",
                name: "".into()
            }]
        );
    }
}
