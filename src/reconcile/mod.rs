//! Reconciliation subsystem.
//!
//! # Data Flow
//! ```text
//! store snapshot ─▶ reconciler.rs bulk_load ─▶ dial ─▶ table.upsert
//!                                                 └──▶ ledger.schedule (on failure)
//! store watch    ─▶ reconciler.rs apply     ─▶ dial / remove
//! ticker         ─▶ sweep.rs sweep          ─▶ re-read key ─▶ dial ─▶ table.upsert_if
//! ```
//!
//! # Design Decisions
//! - One watch task and one sweep task per pool
//! - Events for one key are applied in store order by the single watch task
//! - Lock order is table then ledger; ledger code never takes the table lock

pub mod reconciler;
pub mod sweep;

pub use reconciler::{Reconciler, Resume};
pub use sweep::{RetrySweeper, SweepReport};
