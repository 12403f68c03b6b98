//! Plain TCP transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::net::connection::{ConnectError, Connection, ConnectionId};
use crate::net::connector::Connector;

/// Dials instances over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Leave Nagle's algorithm enabled on new streams.
    pub fn with_nagle(mut self) -> Self {
        self.nodelay = false;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Handle = TcpChannel;

    async fn connect(&self, address: &str) -> Result<TcpChannel, ConnectError> {
        if address.trim().is_empty() || !address.contains(':') {
            return Err(ConnectError::InvalidAddress(address.to_string()));
        }
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| ConnectError::Refused {
                address: address.to_string(),
                source,
            })?;
        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(address = %address, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let channel = TcpChannel {
            id: ConnectionId::new(),
            address: address.to_string(),
            stream: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        };
        tracing::debug!(connection_id = %channel.id, address = %address, "TCP channel established");
        Ok(channel)
    }
}

/// An established TCP connection owned by the registry.
#[derive(Debug)]
pub struct TcpChannel {
    id: ConnectionId,
    address: String,
    stream: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl TcpChannel {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take the stream out of the channel for exclusive use. Returns `None`
    /// once closed or already taken.
    pub fn take_stream(&self) -> Option<TcpStream> {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Connection for TcpChannel {
    fn address(&self) -> &str {
        &self.address
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.take_stream());
        tracing::trace!(connection_id = %self.id, address = %self.address, "TCP channel closed");
    }
}
