//! Client-side service registry and connection pool.
//!
//! Mirrors `<root>/<service>/<instance> -> host:port` from a coordination
//! store into an in-memory table of live connections, and hands those
//! connections out round-robin, by instance id, or all at once.
//!
//! ```text
//!   store ──get──▶ reconcile::Reconciler ──dial──▶ registry::ServiceTable ◀── ServicePool (callers)
//!         ──watch─▶        │                          ▲
//!                          └──failure──▶ resilience::RetryLedger ──▶ reconcile::RetrySweeper
//! ```

// Core subsystems
pub mod config;
pub mod net;
pub mod registry;
pub mod store;

// Background work
pub mod reconcile;
pub mod resilience;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub mod error;
pub mod pool;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use lifecycle::Shutdown;
pub use pool::{Announcement, ServicePool, TcpServicePool};
