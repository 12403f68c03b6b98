//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Discovered address ("host:port")
//!     → connector.rs (Dialer: bounded by the dial timeout)
//!     → tcp.rs (default transport) or a caller-supplied Connector
//!     → connection.rs (opaque handle, closed exactly once by the registry)
//! ```
//!
//! # Design Decisions
//! - The registry never speaks a protocol over its handles; callers do
//! - Dials happen outside every registry lock
//! - Timeouts and refusals are the same failure to the registry

pub mod connection;
pub mod connector;
pub mod tcp;

pub use connection::{ConnectError, Connection, ConnectionId};
pub use connector::{Connector, Dialer};
pub use tcp::{TcpChannel, TcpConnector};
