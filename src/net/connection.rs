//! Connection handle abstraction.
//!
//! # Responsibilities
//! - Define the opaque handle the registry hands to callers
//! - Generate unique connection IDs for tracing
//! - Classify dial failures
//!
//! # Design Decisions
//! - Handles are shared (`Arc`) with callers but closed by the registry:
//!   exactly once, by whichever table operation removes or replaces them
//! - A timed-out dial is reported separately but handled exactly like a refusal

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live connection to one service instance.
pub trait Connection: Send + Sync + 'static {
    /// The dial address this connection was made to.
    fn address(&self) -> &str;

    /// Release the underlying transport. Must tolerate repeated calls.
    fn close(&self);
}

/// Why a dial failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("connection to {address} refused: {source}")]
    Refused {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
}

impl ConnectError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectError::Timeout { .. })
    }
}
