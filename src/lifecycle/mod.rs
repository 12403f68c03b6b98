//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → agent withdraws its announcement → pool shutdown
//!
//! Shutdown (shutdown.rs):
//!     trigger → watch task and sweep task leave their loops → handles closed
//! ```
//!
//! # Design Decisions
//! - One coordinator per pool, no process-wide state
//! - Shutdown is idempotent

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
