//! Coordination store client interface.
//!
//! # Data Flow
//! ```text
//! <root>/<service>/<instance> -> "host:port"
//!
//! get(root, recursive)          → StoreResponse { index, node tree }   (bulk load)
//! watch(root, recursive, index) → WatchEvent stream                    (reconciler)
//! set(key, value, condition)    → new index | Conflict                 (announce)
//! ```
//!
//! # Design Decisions
//! - The store is the source of truth; the registry only mirrors it
//! - Every response carries the store index so watches can resume without gaps
//! - A watch that can no longer resume reports `Compacted` instead of
//!   silently skipping history
//! - etcd (v2 keys API) for production, an in-process store for tests

pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Errors returned by coordination store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No store endpoint could be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The requested key does not exist. `index` is the store index the miss
    /// was observed at.
    #[error("key not found: {key}")]
    NotFound { key: String, index: u64 },

    /// A conditional write lost against a concurrent writer.
    #[error("conflicting write on {key}")]
    Conflict { key: String },

    /// The requested watch index has been cleared from the store history.
    #[error("watch history compacted at index {index}")]
    Compacted { index: u64 },

    /// The store answered with something that could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Returns true if the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A node of the store tree. Directories carry children, leaves carry a value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
    pub modified_index: u64,
    pub nodes: Vec<Node>,
}

/// Answer to a `get`: the node plus the store index it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse {
    pub index: u64,
    pub node: Node,
}

/// Kind of change carried by a watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    /// A key reached its TTL.
    Expire,
    /// Any other store action (get, ...).
    Other(String),
}

impl Action {
    pub fn parse(action: &str) -> Self {
        match action {
            "set" => Action::Set,
            "create" => Action::Create,
            "update" => Action::Update,
            "compareAndSwap" => Action::CompareAndSwap,
            "delete" => Action::Delete,
            "compareAndDelete" => Action::CompareAndDelete,
            "expire" => Action::Expire,
            other => Action::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Action::Set => "set",
            Action::Create => "create",
            Action::Update => "update",
            Action::CompareAndSwap => "compareAndSwap",
            Action::Delete => "delete",
            Action::CompareAndDelete => "compareAndDelete",
            Action::Expire => "expire",
            Action::Other(name) => name,
        }
    }

    /// True for the actions that announce a (new) value for a key.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Action::Set | Action::Create | Action::Update | Action::CompareAndSwap
        )
    }

    /// True for the actions that take a key (or directory) away.
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            Action::Delete | Action::CompareAndDelete | Action::Expire
        )
    }
}

/// One change delivered by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: Action,
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
    /// Store index of this change; resume watching from `index + 1`.
    pub index: u64,
}

/// Ordered stream of watch events. Ends (or yields an error) when the watch
/// breaks; the caller re-establishes it.
pub type WatchStream = BoxStream<'static, StoreResult<WatchEvent>>;

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    /// Write unconditionally.
    Any,
    /// Only create; fail if the key exists.
    Absent,
    /// Only replace the value last modified at this index.
    Version(u64),
}

/// Client for the coordination store holding the service tree.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Read a key or directory.
    async fn get(&self, path: &str, recursive: bool) -> StoreResult<StoreResponse>;

    /// Watch a key or directory for changes, starting at `from_index` when
    /// given, otherwise at the next change.
    fn watch(&self, path: &str, recursive: bool, from_index: Option<u64>) -> WatchStream;

    /// Write a value, returning the index of the write.
    async fn set(&self, key: &str, value: &str, condition: SetCondition) -> StoreResult<u64>;

    /// Delete a key (or a directory, recursively).
    async fn delete(&self, key: &str) -> StoreResult<u64>;
}
