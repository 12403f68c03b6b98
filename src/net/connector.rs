//! Endpoint dialing with a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::net::connection::{ConnectError, Connection};

/// Establishes connections to service instances.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: Connection;

    /// Attempt a connection to `address` ("host:port").
    async fn connect(&self, address: &str) -> Result<Self::Handle, ConnectError>;
}

/// A connector bound to the fixed dial timeout.
///
/// Every dial in the registry (bulk load, watch event, retry sweep) goes
/// through here, so a slow peer costs at most `timeout`.
pub struct Dialer<H> {
    connector: Arc<dyn Connector<Handle = H>>,
    timeout: Duration,
}

impl<H> Clone for Dialer<H> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            timeout: self.timeout,
        }
    }
}

impl<H: Connection> Dialer<H> {
    pub fn new<C>(connector: C, timeout: Duration) -> Self
    where
        C: Connector<Handle = H>,
    {
        Self {
            connector: Arc::new(connector),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn dial(&self, address: &str) -> Result<Arc<H>, ConnectError> {
        match timeout(self.timeout, self.connector.connect(address)).await {
            Ok(Ok(handle)) => Ok(Arc::new(handle)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectError::Timeout {
                address: address.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}
