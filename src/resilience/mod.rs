//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Dial failure (reconciler):
//!     → retries.rs (schedule key with a full budget)
//!     → sweep re-reads the key and redials on a fixed interval
//!     → success resolves the record, failure charges the budget
//!
//! Watch failure (reconciler):
//!     → backoff.rs (exponential delay before re-watching)
//! ```
//!
//! # Design Decisions
//! - Retries never run inline in the watch loop
//! - Budgets are bounded; exhausted keys wait for a fresh store event
//! - Jittered backoff prevents thundering herd on store recovery

pub mod backoff;
pub mod retries;

pub use backoff::reconnect_delay;
pub use retries::{RetryLedger, RetryOutcome};
