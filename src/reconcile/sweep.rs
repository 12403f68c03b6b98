//! Periodic retry sweep.
//!
//! # Responsibilities
//! - Re-read every pending key from the store on a fixed interval
//! - Redial the current address; resolve or charge the ledger record
//!
//! # Design Decisions
//! - Runs beside the watch loop, never inside it
//! - The table insert is guarded by the record's generation under the
//!   exclusive table lock, so a key deleted during the dial stays deleted

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::net::{Connection, Dialer};
use crate::observability::metrics;
use crate::registry::{ServiceFilter, ServiceTable};
use crate::resilience::{RetryLedger, RetryOutcome};
use crate::store::CoordinationStore;

/// Tally of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Redialled and inserted into the table.
    pub recovered: usize,
    /// Dial failed, budget left.
    pub failed: usize,
    /// Dial failed, budget exhausted.
    pub given_up: usize,
    /// Key gone from the store, or the record changed during the attempt.
    pub dropped: usize,
    /// Store unreachable; attempt postponed without charging the budget.
    pub deferred: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RetrySweeper<H> {
    store: Arc<dyn CoordinationStore>,
    table: Arc<ServiceTable<H>>,
    ledger: Arc<RetryLedger>,
    dialer: Dialer<H>,
    filter: ServiceFilter,
    interval: Duration,
}

impl<H: Connection> RetrySweeper<H> {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        table: Arc<ServiceTable<H>>,
        ledger: Arc<RetryLedger>,
        dialer: Dialer<H>,
        filter: ServiceFilter,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            table,
            ledger,
            dialer,
            filter,
            interval,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = self.interval.as_secs_f64(), max_attempts = self.ledger.max_attempts(), "Retry sweep starting");

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Retry sweep received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Run one pass over the ledger.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for (key, generation) in self.ledger.pending() {
            let path = match self.filter.classify(&key) {
                Ok(path) => path,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Dropping retry for unusable key");
                    self.ledger.forget(&key);
                    report.dropped += 1;
                    continue;
                }
            };

            let address = match self.store.get(&key, false).await {
                Ok(response) if !response.node.dir => response.node.value,
                Ok(_) => None,
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Store unreachable, retry deferred");
                    report.deferred += 1;
                    continue;
                }
            };
            let Some(address) = address else {
                self.ledger.resolve(&key, generation);
                report.dropped += 1;
                continue;
            };
            let address = address.trim();

            match self.dialer.dial(address).await {
                Ok(handle) => {
                    let ledger = &self.ledger;
                    let inserted = self.table.upsert_if(&path.logical_path, &key, handle, || {
                        ledger.resolve(&key, generation)
                    });
                    match inserted {
                        Ok(_) => {
                            tracing::info!(key = %key, address = %address, "Instance recovered");
                            report.recovered += 1;
                        }
                        Err(handle) => {
                            tracing::debug!(key = %key, "Retry superseded during dial, discarding connection");
                            handle.close();
                            report.dropped += 1;
                        }
                    }
                }
                Err(e) => {
                    metrics::record_connect_failure(&path.logical_path);
                    match self.ledger.record_failure(&key, generation) {
                        RetryOutcome::Pending(remaining) => {
                            tracing::debug!(key = %key, error = %e, remaining, "Retry failed");
                            report.failed += 1;
                        }
                        RetryOutcome::GivenUp => {
                            tracing::warn!(key = %key, address = %address, error = %e, "Giving up on instance");
                            report.given_up += 1;
                        }
                        RetryOutcome::Stale => report.dropped += 1,
                    }
                }
            }
        }

        metrics::record_retry_outcome("recovered", report.recovered);
        metrics::record_retry_outcome("failed", report.failed);
        metrics::record_retry_outcome("given_up", report.given_up);
        metrics::record_retry_outcome("dropped", report.dropped);
        metrics::record_retry_outcome("deferred", report.deferred);
        metrics::set_retry_pending(self.ledger.len());

        if !report.is_empty() {
            tracing::info!(
                recovered = report.recovered,
                failed = report.failed,
                given_up = report.given_up,
                dropped = report.dropped,
                deferred = report.deferred,
                "Retry sweep finished"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{ConnectError, Connector};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Stub {
        address: String,
        closes: Arc<AtomicUsize>,
    }

    impl Connection for Stub {
        fn address(&self) -> &str {
            &self.address
        }
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct Toggle {
        up: Arc<AtomicBool>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for Toggle {
        type Handle = Stub;

        async fn connect(&self, address: &str) -> Result<Stub, ConnectError> {
            if !self.up.load(Ordering::SeqCst) {
                return Err(ConnectError::InvalidAddress(address.into()));
            }
            Ok(Stub {
                address: address.into(),
                closes: self.closes.clone(),
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        toggle: Toggle,
        sweeper: RetrySweeper<Stub>,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let toggle = Toggle::default();
        let sweeper = RetrySweeper::new(
            store.clone(),
            Arc::new(ServiceTable::new()),
            Arc::new(RetryLedger::new(max_attempts)),
            Dialer::new(toggle.clone(), Duration::from_secs(1)),
            ServiceFilter::new("/backends"),
            Duration::from_secs(10),
        );
        Fixture {
            store,
            toggle,
            sweeper,
        }
    }

    #[tokio::test]
    async fn test_sweep_recovers_with_current_address() {
        let f = fixture(3);
        f.store.put("/backends/auth/i1", "10.0.0.2:9000").unwrap();
        f.sweeper.ledger.schedule("/backends/auth/i1");
        f.toggle.up.store(true, Ordering::SeqCst);

        let report = f.sweeper.sweep().await;
        assert_eq!(report.recovered, 1);
        assert!(f.sweeper.ledger.is_empty());
        assert_eq!(
            f.sweeper.table.address_of("/backends/auth", "/backends/auth/i1").as_deref(),
            Some("10.0.0.2:9000")
        );
    }

    #[tokio::test]
    async fn test_sweep_gives_up_after_budget() {
        let f = fixture(2);
        f.store.put("/backends/auth/i1", "10.0.0.1:9000").unwrap();
        f.sweeper.ledger.schedule("/backends/auth/i1");

        assert_eq!(f.sweeper.sweep().await.failed, 1);
        assert_eq!(f.sweeper.sweep().await.given_up, 1);
        assert!(f.sweeper.sweep().await.is_empty());

        f.toggle.up.store(true, Ordering::SeqCst);
        assert!(f.sweeper.sweep().await.is_empty());
        assert!(f.sweeper.table.pick("/backends/auth").is_none());
    }

    #[tokio::test]
    async fn test_sweep_drops_deleted_key() {
        let f = fixture(3);
        f.sweeper.ledger.schedule("/backends/auth/i1");
        f.toggle.up.store(true, Ordering::SeqCst);

        let report = f.sweeper.sweep().await;
        assert_eq!(report.dropped, 1);
        assert!(f.sweeper.ledger.is_empty());
        assert!(f.sweeper.table.pick("/backends/auth").is_none());
    }

    #[tokio::test]
    async fn test_sweep_defers_when_store_down() {
        let f = fixture(1);
        f.store.put("/backends/auth/i1", "10.0.0.1:9000").unwrap();
        f.sweeper.ledger.schedule("/backends/auth/i1");
        f.store.set_available(false);

        assert_eq!(f.sweeper.sweep().await.deferred, 1);
        assert_eq!(f.sweeper.ledger.remaining("/backends/auth/i1"), Some(1));
    }

    #[tokio::test]
    async fn test_superseded_retry_closes_handle() {
        let f = fixture(3);
        f.store.put("/backends/auth/i1", "10.0.0.1:9000").unwrap();
        let generation = f.sweeper.ledger.schedule("/backends/auth/i1");
        // a delete event forgot the record after the sweep took its snapshot
        f.sweeper.ledger.forget("/backends/auth/i1");
        f.toggle.up.store(true, Ordering::SeqCst);

        let handle = f.sweeper.dialer.dial("10.0.0.1:9000").await.unwrap();
        let ledger = &f.sweeper.ledger;
        let refused = f
            .sweeper
            .table
            .upsert_if("/backends/auth", "/backends/auth/i1", handle, || {
                ledger.resolve("/backends/auth/i1", generation)
            })
            .unwrap_err();
        refused.close();

        assert_eq!(f.toggle.closes.load(Ordering::SeqCst), 1);
        assert!(f.sweeper.table.pick("/backends/auth").is_none());
    }
}
