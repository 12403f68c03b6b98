//! Service registry subsystem.
//!
//! # Data Flow
//! ```text
//! store key ─▶ path.rs (ServiceFilter::classify) ─▶ InstancePath
//!                                                      │
//!                                                      ▼
//!                         table.rs (ServiceTable) ◀── upsert / remove
//!                            │        │
//!           round_robin.rs ◀─┘        └─▶ subscription.rs (arrival queues)
//!                            │
//!                            ▼
//!                  pick / pick_by_id / list_all (callers)
//! ```
//!
//! # Design Decisions
//! - The table owns every handle; callers only borrow `Arc` clones
//! - The allow-list is applied before any dial, so filtered services never
//!   cost a connection

pub mod path;
pub mod round_robin;
pub mod subscription;
pub mod table;

pub use path::{parse_names, InstancePath, PathError, ServiceFilter};
pub use round_robin::RoundRobin;
pub use subscription::{Delivery, SubscriberSet};
pub use table::{ServiceTable, UpsertOutcome};
