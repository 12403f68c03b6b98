//! Watch-driven reconciliation of the service table.
//!
//! # Responsibilities
//! - Settle a pending allow-list from the names key before anything is dialed
//! - Take a snapshot of the root and mirror it into the table
//! - Apply watch events in store order
//! - Keep the watch alive across store outages and history compaction
//!
//! # Design Decisions
//! - Dials happen outside the table lock; only the final swap is exclusive
//! - A failed dial never blocks the loop; the key goes to the retry ledger
//! - The snapshot path doubles as resync, so a compacted watch converges
//!   instead of silently missing deletes

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::WatchConfig;
use crate::net::{Connection, Dialer};
use crate::observability::metrics;
use crate::registry::{parse_names, InstancePath, PathError, ServiceFilter, ServiceTable};
use crate::resilience::{reconnect_delay, RetryLedger};
use crate::store::{CoordinationStore, Node, StoreError, StoreResult, WatchEvent};

/// Where the watch loop picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Take a (re)snapshot before watching.
    Snapshot,
    /// Watch from this store index.
    Index(u64),
}

impl Resume {
    fn from_index(&self) -> Option<u64> {
        match self {
            Resume::Index(i) => Some(*i),
            Resume::Snapshot => None,
        }
    }
}

/// Mirrors the store tree under the root into a [`ServiceTable`].
pub struct Reconciler<H> {
    store: Arc<dyn CoordinationStore>,
    table: Arc<ServiceTable<H>>,
    ledger: Arc<RetryLedger>,
    dialer: Dialer<H>,
    filter: ServiceFilter,
    watch: WatchConfig,
}

impl<H: Connection> Reconciler<H> {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        table: Arc<ServiceTable<H>>,
        ledger: Arc<RetryLedger>,
        dialer: Dialer<H>,
        filter: ServiceFilter,
        watch: WatchConfig,
    ) -> Self {
        Self {
            store,
            table,
            ledger,
            dialer,
            filter,
            watch,
        }
    }

    /// Read the whole root and make the table match it.
    ///
    /// Keys no longer in the store are removed, retry records for them are
    /// dropped, and leaves whose address did not change are left alone. A
    /// pending allow-list is read first; until that read succeeds nothing is
    /// loaded.
    pub async fn bulk_load(&self) -> StoreResult<Resume> {
        if !self.filter.is_resolved() {
            self.load_allow_list().await?;
        }
        let root = self.filter.root();
        let response = match self.store.get(root, true).await {
            Ok(response) => response,
            Err(StoreError::NotFound { index, .. }) => {
                tracing::info!(root = %root, index, "Registry root does not exist yet");
                self.prune_missing(&HashSet::new());
                return Ok(Resume::Index(index + 1));
            }
            Err(e) => return Err(e),
        };

        let mut seen = HashSet::new();
        if response.node.dir {
            for child in &response.node.nodes {
                self.load_service(child, &mut seen).await;
            }
        } else {
            tracing::warn!(root = %root, "Registry root is not a directory");
        }

        self.prune_missing(&seen);
        metrics::set_retry_pending(self.ledger.len());
        tracing::info!(
            index = response.index,
            instances = seen.len(),
            pending_retries = self.ledger.len(),
            "Snapshot loaded"
        );
        Ok(Resume::Index(response.index + 1))
    }

    async fn load_allow_list(&self) -> StoreResult<()> {
        let Some(names_key) = self.filter.names_key() else {
            self.filter.resolve_allowed(None);
            return Ok(());
        };
        let names = match self.store.get(names_key, false).await {
            Ok(response) if !response.node.dir => {
                Some(parse_names(response.node.value.as_deref().unwrap_or_default()))
            }
            Ok(_) => {
                tracing::warn!(key = %names_key, "Names key is a directory, ignoring");
                None
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        match &names {
            Some(names) => tracing::info!(key = %names_key, allowed = ?names, "Service allow-list loaded"),
            None => tracing::info!(key = %names_key, "No service allow-list, mirroring every service"),
        }
        self.filter.resolve_allowed(names);
        Ok(())
    }

    async fn load_service(&self, service: &Node, seen: &mut HashSet<String>) {
        if self.filter.is_names_key(&service.key) {
            return;
        }
        if !service.dir {
            tracing::warn!(key = %service.key, "Malformed service entry, not a directory");
            return;
        }
        match self.filter.classify_service(&service.key) {
            Ok(_) => {}
            Err(PathError::NotAllowed(name)) => {
                tracing::debug!(service = %name, "Service not in allow-list, skipped");
                return;
            }
            Err(e) => {
                tracing::warn!(key = %service.key, error = %e, "Malformed service entry");
                return;
            }
        }

        for instance in &service.nodes {
            if instance.dir {
                tracing::warn!(key = %instance.key, "Malformed instance entry, nested directory");
                continue;
            }
            let Some(path) = self.classify(&instance.key) else {
                continue;
            };
            let Some(address) = instance.value.as_deref().map(str::trim) else {
                tracing::warn!(key = %instance.key, "Instance entry has no address");
                continue;
            };
            seen.insert(path.key.clone());

            if self.table.address_of(&path.logical_path, &path.key).as_deref() == Some(address) {
                self.ledger.forget(&path.key);
                continue;
            }
            self.handle_set(&path, address).await;
        }
    }

    fn prune_missing(&self, seen: &HashSet<String>) {
        for (path, key, _) in self.table.endpoints() {
            if !seen.contains(&key) {
                self.table.remove(&path, &key);
            }
        }
        let dropped = self.ledger.retain(|key| seen.contains(key));
        if dropped > 0 {
            tracing::info!(dropped, "Dropped retry records for vanished instances");
        }
    }

    fn classify(&self, key: &str) -> Option<InstancePath> {
        if self.filter.is_names_key(key) {
            return None;
        }
        match self.filter.classify(key) {
            Ok(path) => Some(path),
            Err(PathError::NotAllowed(name)) => {
                tracing::trace!(service = %name, key = %key, "Service not in allow-list, ignored");
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Malformed instance entry");
                None
            }
        }
    }

    /// Apply one watch event.
    pub async fn apply(&self, event: WatchEvent) {
        tracing::debug!(action = %event.action.as_str(), key = %event.key, index = event.index, "Watch event");
        match &event.action {
            action if action.is_write() => {
                if event.dir {
                    return;
                }
                let Some(path) = self.classify(&event.key) else {
                    return;
                };
                let Some(address) = event.value.as_deref().map(str::trim) else {
                    tracing::warn!(key = %event.key, "Instance entry has no address");
                    return;
                };
                self.handle_set(&path, address).await;
            }
            // delete, compareAndDelete and TTL expiry all take the key away
            action if action.is_removal() => {
                if event.dir {
                    self.handle_directory_delete(&event.key);
                } else if let Some(path) = self.classify(&event.key) {
                    self.handle_delete(&path);
                }
            }
            action => {
                tracing::debug!(action = %action.as_str(), key = %event.key, "Ignoring watch action");
            }
        }
    }

    async fn handle_set(&self, path: &InstancePath, address: &str) {
        match self.dialer.dial(address).await {
            Ok(handle) => {
                self.ledger.forget(&path.key);
                self.table.upsert(&path.logical_path, &path.key, handle);
            }
            Err(e) => {
                tracing::warn!(key = %path.key, address = %address, error = %e, "Connect failed, scheduling retry");
                metrics::record_connect_failure(&path.logical_path);
                self.ledger.schedule(&path.key);
            }
        }
        metrics::set_retry_pending(self.ledger.len());
    }

    fn handle_delete(&self, path: &InstancePath) {
        self.ledger.forget(&path.key);
        if !self.table.remove(&path.logical_path, &path.key) {
            tracing::debug!(key = %path.key, "Delete for unknown instance");
        }
        metrics::set_retry_pending(self.ledger.len());
    }

    fn handle_directory_delete(&self, key: &str) {
        let root = self.filter.root();
        if key.trim_end_matches('/') == root {
            self.ledger.forget_under(root);
            let removed = self.table.close_all();
            tracing::warn!(root = %root, removed, "Registry root deleted");
        } else {
            match self.filter.classify_service(key) {
                Ok(logical_path) => {
                    self.ledger.forget_under(&logical_path);
                    self.table.clear(&logical_path);
                }
                Err(PathError::NotAllowed(_)) => {}
                Err(e) => tracing::debug!(key = %key, error = %e, "Ignoring directory delete"),
            }
        }
        metrics::set_retry_pending(self.ledger.len());
    }

    /// The watch loop. Returns when `shutdown` fires.
    pub async fn run(self: Arc<Self>, resume: Resume, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(root = %self.filter.root(), "Reconciler starting");
        let mut resume = resume;
        let mut failures: u32 = 0;

        loop {
            if resume == Resume::Snapshot {
                let loaded = tokio::select! {
                    loaded = self.bulk_load() => loaded,
                    _ = shutdown.recv() => break,
                };
                match loaded {
                    Ok(next) => resume = next,
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        tracing::warn!(error = %e, attempt = failures, "Snapshot failed, store unavailable");
                        if !self.pause(failures, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let mut events = self.store.watch(self.filter.root(), true, resume.from_index());
            loop {
                let next = tokio::select! {
                    next = events.next() => next,
                    _ = shutdown.recv() => {
                        tracing::info!("Reconciler received shutdown signal, exiting loop");
                        return;
                    }
                };
                match next {
                    Some(Ok(event)) => {
                        failures = 0;
                        let index = event.index;
                        self.apply(event).await;
                        resume = Resume::Index(index + 1);
                    }
                    Some(Err(StoreError::Compacted { index })) => {
                        tracing::warn!(from = ?resume.from_index(), compacted_through = index, "Watch history compacted, resyncing");
                        resume = Resume::Snapshot;
                        break;
                    }
                    Some(Err(e)) => {
                        failures = failures.saturating_add(1);
                        tracing::warn!(error = %e, attempt = failures, "Watch broken, store unavailable");
                        break;
                    }
                    None => {
                        failures = failures.saturating_add(1);
                        tracing::info!(from = ?resume.from_index(), "Watch stream ended");
                        break;
                    }
                }
            }

            metrics::record_watch_restart();
            if !self.pause(failures, &mut shutdown).await {
                break;
            }
        }
        tracing::info!("Reconciler stopped");
    }

    /// Back off before the next attempt. False if shutdown fired meanwhile.
    async fn pause(&self, failures: u32, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let delay = reconnect_delay(failures, self.watch.base_delay(), self.watch.max_delay());
        tokio::select! {
            _ = time::sleep(delay) => true,
            _ = shutdown.recv() => false,
        }
    }
}
