//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;

use service_registry::net::{ConnectError, Connection, Connector};
use service_registry::store::MemoryStore;
use service_registry::{RegistryConfig, ServicePool};

/// Connection handed out by [`MockConnector`].
#[derive(Debug)]
pub struct MockConn {
    address: String,
    closes: Arc<AtomicUsize>,
}

impl MockConn {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Connection for MockConn {
    fn address(&self) -> &str {
        &self.address
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockState {
    reachable: HashSet<String>,
    attempts: HashMap<String, usize>,
    delays: HashMap<String, Duration>,
    issued: Vec<(String, Arc<AtomicUsize>)>,
}

/// Connector whose reachable addresses are set by the test.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reachable(&self, address: &str) {
        self.state.lock().unwrap().reachable.insert(address.into());
    }

    /// Make dials to `address` take `delay` before answering.
    pub fn slow(&self, address: &str, delay: Duration) {
        self.state.lock().unwrap().delays.insert(address.into(), delay);
    }

    pub fn attempts(&self, address: &str) -> usize {
        self.state.lock().unwrap().attempts.get(address).copied().unwrap_or(0)
    }

    /// Close counts of every connection ever handed out.
    pub fn close_counts(&self) -> Vec<(String, usize)> {
        self.state
            .lock()
            .unwrap()
            .issued
            .iter()
            .map(|(a, c)| (a.clone(), c.load(Ordering::SeqCst)))
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Handle = MockConn;

    async fn connect(&self, address: &str) -> Result<MockConn, ConnectError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            *state.attempts.entry(address.into()).or_default() += 1;
            state.delays.get(address).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if !state.reachable.contains(address) {
            return Err(ConnectError::Refused {
                address: address.into(),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            });
        }
        let closes = Arc::new(AtomicUsize::new(0));
        state.issued.push((address.into(), closes.clone()));
        Ok(MockConn {
            address: address.into(),
            closes,
        })
    }
}

/// Config tuned for tests: fast watch recovery, sweeps only on demand.
pub fn test_config() -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.dial.timeout_secs = 1;
    config.retry.max_attempts = 3;
    config.retry.interval_secs = 3600;
    config.watch.base_delay_ms = 10;
    config.watch.max_delay_ms = 50;
    config
}

pub async fn start_pool(
    config: &RegistryConfig,
    store: &Arc<MemoryStore>,
    connector: &MockConnector,
) -> ServicePool<MockConn> {
    ServicePool::start(config, store.clone(), connector.clone())
        .await
        .unwrap()
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Start a TCP listener that accepts and holds connections.
pub async fn start_tcp_backend() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    held.push(socket);
                }
                Err(_) => break,
            }
        }
    });
    (addr, accepted)
}
