//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the registry.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the service registry.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RegistryConfig {
    /// Coordination store connection and layout.
    pub store: StoreConfig,

    /// Service name allow-list.
    pub services: ServicesConfig,

    /// Endpoint dial settings.
    pub dial: DialConfig,

    /// Retry ledger settings.
    pub retry: RetryConfig,

    /// Watch re-establishment settings.
    pub watch: WatchConfig,

    /// Optional self-registration of this process.
    pub announce: Option<AnnounceConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Coordination store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store endpoints, tried in order (e.g., "http://127.0.0.1:2379").
    pub endpoints: Vec<String>,

    /// Root directory holding `<service>/<instance>` entries.
    pub root: String,

    /// Key holding a newline-separated list of known service names. Relative
    /// to `root` unless it starts with `/`.
    pub names_key: Option<String>,

    /// Timeout for non-watch store requests in seconds.
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            root: "/backends".to_string(),
            names_key: Some("names".to_string()),
            request_timeout_secs: 5,
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Absolute key of the names list, if one is configured.
    pub fn names_key_path(&self) -> Option<String> {
        self.names_key.as_deref().map(|key| {
            if key.starts_with('/') {
                key.to_string()
            } else {
                format!("{}/{}", self.root.trim_end_matches('/'), key)
            }
        })
    }
}

/// Explicit service name allow-list.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServicesConfig {
    /// Known service names. Empty means "not configured": the names key is
    /// consulted instead.
    pub known: Vec<String>,
}

/// Dial configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DialConfig {
    /// Connection establishment timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl DialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry ledger configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Number of sweep re-attempts before an unreachable instance is given up.
    pub max_attempts: u32,

    /// Interval between retry sweeps in seconds.
    pub interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval_secs: 10,
        }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Watch re-establishment backoff.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

impl WatchConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Self-registration of the running process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnnounceConfig {
    /// Service name (first path segment under the root).
    pub service: String,

    /// Instance identifier (second path segment).
    pub instance_id: String,

    /// Dial address peers should use ("host:port").
    pub address: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: RegistryConfig = toml::from_str("").unwrap();
        assert_eq!(config.store.root, "/backends");
        assert_eq!(config.store.endpoints, vec!["http://127.0.0.1:2379"]);
        assert_eq!(config.dial.timeout(), Duration::from_secs(10));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.announce.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config: RegistryConfig = toml::from_str(
            r#"
            [store]
            root = "/services"

            [services]
            known = ["auth", "chat"]

            [announce]
            service = "game"
            instance_id = "g1"
            address = "10.0.0.5:7000"
            "#,
        )
        .unwrap();

        assert_eq!(config.store.root, "/services");
        // untouched fields in a present section still default
        assert_eq!(config.store.request_timeout_secs, 5);
        assert_eq!(config.store.names_key_path().as_deref(), Some("/services/names"));
        assert_eq!(config.services.known, vec!["auth", "chat"]);
        assert_eq!(config.announce.unwrap().instance_id, "g1");
    }

    #[test]
    fn test_absolute_names_key_kept() {
        let mut store = StoreConfig::default();
        store.names_key = Some("/shared/names".into());
        assert_eq!(store.names_key_path().as_deref(), Some("/shared/names"));
        store.names_key = None;
        assert_eq!(store.names_key_path(), None);
    }
}
