//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → environment overrides (ETCD_HOST, REGISTRY_ROOT)
//!     → validation.rs (semantic checks)
//!     → RegistryConfig (validated, immutable)
//!     → handed to ServicePool::start
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the allow-list and root are fixed for
//!   the process lifetime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::ConfigError;
pub use schema::AnnounceConfig;
pub use schema::DialConfig;
pub use schema::ObservabilityConfig;
pub use schema::RegistryConfig;
pub use schema::RetryConfig;
pub use schema::ServicesConfig;
pub use schema::StoreConfig;
pub use schema::WatchConfig;
