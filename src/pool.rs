//! Service pool: the caller-facing handle on the registry.
//!
//! # Responsibilities
//! - Resolve the allow-list and take the initial snapshot
//! - Own the watch and retry sweep tasks
//! - Answer selection calls from the table without I/O
//! - Announce and withdraw instances in the store
//!
//! # Design Decisions
//! - An explicit instance per root, no process-wide state
//! - Selection never waits on the store or a dial
//! - Dropping the pool stops its tasks; `shutdown` also closes every handle

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::validation::validate_config;
use crate::config::{ConfigError, RegistryConfig};
use crate::error::RegistryError;
use crate::lifecycle::Shutdown;
use crate::net::{Connection, Connector, Dialer, TcpChannel};
use crate::reconcile::{Reconciler, Resume, RetrySweeper, SweepReport};
use crate::registry::{ServiceFilter, ServiceTable};
use crate::resilience::RetryLedger;
use crate::store::{CoordinationStore, SetCondition, StoreResult};

/// What `announce` did in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    Created,
    Updated,
    Unchanged,
}

/// A live registry over one store root.
pub struct ServicePool<H: Connection> {
    store: Arc<dyn CoordinationStore>,
    table: Arc<ServiceTable<H>>,
    ledger: Arc<RetryLedger>,
    sweeper: Arc<RetrySweeper<H>>,
    filter: ServiceFilter,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The pool over plain TCP connections.
pub type TcpServicePool = ServicePool<TcpChannel>;

impl<H: Connection> ServicePool<H> {
    /// Build the pool, load the current tree and start the background tasks.
    ///
    /// A store that cannot be read at startup is not fatal: the watch task
    /// keeps retrying the snapshot. If the allow-list comes from the names
    /// key and that read fails too, no service is surfaced until the watch
    /// task has read it.
    pub async fn start<C>(
        config: &RegistryConfig,
        store: Arc<dyn CoordinationStore>,
        connector: C,
    ) -> Result<Self, RegistryError>
    where
        C: Connector<Handle = H>,
    {
        validate_config(config).map_err(ConfigError::Validation)?;

        let filter = build_filter(config);
        if let Some(allowed) = filter.allowed() {
            let mut names: Vec<_> = allowed.iter().map(String::as_str).collect();
            names.sort_unstable();
            tracing::info!(root = %filter.root(), allowed = ?names, "Service allow-list configured");
        }

        let table = Arc::new(ServiceTable::new());
        let ledger = Arc::new(RetryLedger::new(config.retry.max_attempts));
        let dialer = Dialer::new(connector, config.dial.timeout());

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&table),
            Arc::clone(&ledger),
            dialer.clone(),
            filter.clone(),
            config.watch.clone(),
        ));
        let sweeper = Arc::new(RetrySweeper::new(
            Arc::clone(&store),
            Arc::clone(&table),
            Arc::clone(&ledger),
            dialer,
            filter.clone(),
            config.retry.interval(),
        ));

        let resume = match reconciler.bulk_load().await {
            Ok(resume) => resume,
            Err(e) => {
                tracing::warn!(error = %e, "Initial snapshot failed, will retry in the background");
                Resume::Snapshot
            }
        };

        let shutdown = Shutdown::new();
        let tasks = vec![
            tokio::spawn(reconciler.run(resume, shutdown.subscribe())),
            tokio::spawn(Arc::clone(&sweeper).run(shutdown.subscribe())),
        ];

        Ok(Self {
            store,
            table,
            ledger,
            sweeper,
            filter,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Round-robin pick among the live instances of `name` (GetService).
    pub fn get_service(&self, name: &str) -> Option<Arc<H>> {
        let path = self.filter.service_path(name);
        self.table.pick(&path).map(|(handle, _)| handle)
    }

    /// The live instance `id` of `name` (GetServiceWithId).
    pub fn get_service_with_id(&self, name: &str, id: &str) -> Option<Arc<H>> {
        let path = self.filter.service_path(name);
        let key = format!("{path}/{id}");
        self.table.pick_by_id(&path, &key)
    }

    /// Every live instance of `name`, by instance key (AllServices).
    pub fn all_services(&self, name: &str) -> HashMap<String, Arc<H>> {
        self.table.list_all(&self.filter.service_path(name))
    }

    /// Receive the instance key of every arrival under `name`, starting
    /// with the instances already live (RegisterCallback).
    pub fn register_callback(&self, name: &str, queue: mpsc::Sender<String>) {
        self.table.subscribe(&self.filter.service_path(name), queue);
    }

    /// Publish `address` for instance `id` of `name`. See [`announce`].
    pub async fn announce(
        &self,
        name: &str,
        id: &str,
        address: &str,
    ) -> Result<Announcement, RegistryError> {
        let key = self.announce_key(name, id)?;
        Ok(announce(self.store.as_ref(), &key, address).await?)
    }

    /// Delete instance `id` of `name` from the store. False if it was absent.
    pub async fn withdraw(&self, name: &str, id: &str) -> Result<bool, RegistryError> {
        let key = self.announce_key(name, id)?;
        Ok(withdraw(self.store.as_ref(), &key).await?)
    }

    // Announcing is not subject to the allow-list.
    fn announce_key(&self, name: &str, id: &str) -> Result<String, RegistryError> {
        if self.shutdown.is_triggered() {
            return Err(RegistryError::ShutDown);
        }
        Ok(ServiceFilter::new(self.filter.root()).instance_key(name, id)?)
    }

    /// Run one retry sweep now, outside the periodic schedule.
    pub async fn sweep_retries(&self) -> SweepReport {
        self.sweeper.sweep().await
    }

    /// Instance keys currently waiting for a retry.
    pub fn pending_retries(&self) -> Vec<String> {
        self.ledger.pending().into_iter().map(|(key, _)| key).collect()
    }

    pub fn table(&self) -> &Arc<ServiceTable<H>> {
        &self.table
    }

    pub fn filter(&self) -> &ServiceFilter {
        &self.filter
    }

    /// Stop the background tasks and close every handle. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.trigger() {
            tracing::info!(root = %self.filter.root(), "Service pool shutting down");
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task failed");
            }
        }
        let closed = self.table.close_all();
        if closed > 0 {
            tracing::info!(closed, "Closed all connections");
        }
    }
}

impl<H: Connection> Drop for ServicePool<H> {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Publish `address` under `key`.
///
/// Reads the current value first and only writes on change, conditioned on
/// the version it saw. Losing that race is `StoreError::Conflict`.
pub async fn announce(
    store: &dyn CoordinationStore,
    key: &str,
    address: &str,
) -> StoreResult<Announcement> {
    let announcement = match store.get(key, false).await {
        Ok(current) if !current.node.dir && current.node.value.as_deref() == Some(address) => {
            Announcement::Unchanged
        }
        Ok(current) => {
            store
                .set(key, address, SetCondition::Version(current.node.modified_index))
                .await?;
            Announcement::Updated
        }
        Err(e) if e.is_not_found() => {
            store.set(key, address, SetCondition::Absent).await?;
            Announcement::Created
        }
        Err(e) => return Err(e),
    };
    tracing::info!(key = %key, address = %address, outcome = ?announcement, "Instance announced");
    Ok(announcement)
}

/// Delete `key` from the store. False if it was absent.
pub async fn withdraw(store: &dyn CoordinationStore, key: &str) -> StoreResult<bool> {
    match store.delete(key).await {
        Ok(_) => {
            tracing::info!(key = %key, "Instance withdrawn");
            Ok(true)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// The configured list wins; otherwise the names key is read by the
/// reconciler before its first snapshot.
fn build_filter(config: &RegistryConfig) -> ServiceFilter {
    let names_key = config.store.names_key_path();
    let has_names_key = names_key.is_some();
    let filter = ServiceFilter::new(config.store.root.clone()).with_names_key(names_key);

    if !config.services.known.is_empty() {
        filter.with_allowed(config.services.known.iter().cloned())
    } else if has_names_key {
        filter.with_pending_allow_list()
    } else {
        filter
    }
}
