//! Crate-level error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::registry::PathError;
use crate::store::StoreError;

/// Errors surfaced by [`ServicePool`](crate::ServicePool).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid instance key: {0}")]
    Path(#[from] PathError),

    #[error("pool is shut down")]
    ShutDown,
}

impl RegistryError {
    /// True if the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Store(e) if e.is_retryable())
    }
}
