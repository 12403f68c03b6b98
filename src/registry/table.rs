//! The in-memory service table.
//!
//! # Responsibilities
//! - Own every live endpoint, grouped by logical path
//! - Round-robin, by-id and snapshot reads for callers
//! - Close handles exactly once, on removal or replacement
//! - Fan out arrival notifications to subscribers
//!
//! # Design Decisions
//! - One `RwLock` for the whole table: readers share it, the reconciler and
//!   the retry sweep take it exclusively and only after their dial finished
//! - Entries are created on first sight and never deleted, only emptied
//! - Readers get `Arc` clones; nothing borrowed escapes the lock

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;

use crate::net::Connection;
use crate::observability::metrics;
use crate::registry::round_robin::RoundRobin;
use crate::registry::subscription::{self, Delivery, SubscriberSet};

/// One live connection bound to an instance key.
#[derive(Debug)]
struct Endpoint<H> {
    key: String,
    handle: Arc<H>,
}

/// Endpoints and selection cursor of one logical path.
#[derive(Debug)]
struct ServiceEntry<H> {
    endpoints: Vec<Endpoint<H>>,
    cursor: RoundRobin,
}

impl<H> ServiceEntry<H> {
    fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            cursor: RoundRobin::new(),
        }
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e.key == key)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

struct TableState<H> {
    services: HashMap<String, ServiceEntry<H>>,
    subscribers: HashMap<String, SubscriberSet>,
}

/// Mapping of logical path to service entry.
pub struct ServiceTable<H> {
    state: RwLock<TableState<H>>,
}

impl<H: Connection> Default for ServiceTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Connection> ServiceTable<H> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TableState {
                services: HashMap::new(),
                subscribers: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TableState<H>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableState<H>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an endpoint, or replace the handle of an existing one in place.
    pub fn upsert(&self, path: &str, key: &str, handle: Arc<H>) -> UpsertOutcome {
        let mut state = self.write();
        Self::insert_locked(&mut state, path, key, handle)
    }

    /// Like [`upsert`](Self::upsert), but only if `guard` holds when evaluated
    /// under the exclusive lock. On refusal the handle is given back.
    pub fn upsert_if<F>(
        &self,
        path: &str,
        key: &str,
        handle: Arc<H>,
        guard: F,
    ) -> Result<UpsertOutcome, Arc<H>>
    where
        F: FnOnce() -> bool,
    {
        let mut state = self.write();
        if !guard() {
            return Err(handle);
        }
        Ok(Self::insert_locked(&mut state, path, key, handle))
    }

    fn insert_locked(
        state: &mut TableState<H>,
        path: &str,
        key: &str,
        handle: Arc<H>,
    ) -> UpsertOutcome {
        let entry = state.services.entry(path.to_string()).or_insert_with(|| {
            tracing::debug!(service = %path, "New service type");
            ServiceEntry::new()
        });

        let outcome = match entry.position(key) {
            Some(i) => {
                let old = std::mem::replace(&mut entry.endpoints[i].handle, handle);
                if !Arc::ptr_eq(&old, &entry.endpoints[i].handle) {
                    old.close();
                }
                UpsertOutcome::Replaced
            }
            None => {
                entry.endpoints.push(Endpoint {
                    key: key.to_string(),
                    handle,
                });
                UpsertOutcome::Inserted
            }
        };
        let count = entry.len();

        tracing::info!(service = %path, key = %key, endpoints = count, outcome = ?outcome, "Endpoint added");
        metrics::set_endpoint_count(path, count);
        metrics::record_endpoint_change(
            path,
            match outcome {
                UpsertOutcome::Inserted => "added",
                UpsertOutcome::Replaced => "replaced",
            },
        );

        if let Some(subscribers) = state.subscribers.get_mut(path) {
            let delivery = subscribers.notify(key);
            if delivery.dropped > 0 {
                tracing::warn!(service = %path, key = %key, dropped = delivery.dropped, "Subscriber queue full, notification dropped");
                metrics::record_notifications_dropped(path, delivery.dropped);
            }
            if delivery.pruned > 0 {
                tracing::debug!(service = %path, pruned = delivery.pruned, remaining = subscribers.len(), "Closed subscriber queues pruned");
            }
            if subscribers.is_empty() {
                state.subscribers.remove(path);
            }
        }
        outcome
    }

    /// Close and delete an endpoint. Returns false if it was not present.
    pub fn remove(&self, path: &str, key: &str) -> bool {
        let mut state = self.write();
        let Some(entry) = state.services.get_mut(path) else {
            tracing::trace!(service = %path, "No such service");
            return false;
        };
        let Some(i) = entry.position(key) else {
            return false;
        };

        let removed = entry.endpoints.remove(i);
        removed.handle.close();
        let count = entry.len();

        tracing::info!(service = %path, key = %key, endpoints = count, "Endpoint removed");
        metrics::set_endpoint_count(path, count);
        metrics::record_endpoint_change(path, "removed");
        true
    }

    /// Close and delete every endpoint of a service. The entry itself stays.
    pub fn clear(&self, path: &str) -> usize {
        let mut state = self.write();
        let Some(entry) = state.services.get_mut(path) else {
            return 0;
        };
        let removed = entry.endpoints.len();
        for endpoint in entry.endpoints.drain(..) {
            endpoint.handle.close();
            metrics::record_endpoint_change(path, "removed");
        }
        if removed > 0 {
            tracing::info!(service = %path, removed, "Service emptied");
            metrics::set_endpoint_count(path, 0);
        }
        removed
    }

    /// Close every endpoint of every service.
    pub fn close_all(&self) -> usize {
        let paths: Vec<String> = self.read().services.keys().cloned().collect();
        paths.iter().map(|p| self.clear(p)).sum()
    }

    /// Round-robin pick. `None` when the service is unknown or empty.
    pub fn pick(&self, path: &str) -> Option<(Arc<H>, String)> {
        let state = self.read();
        let entry = state.services.get(path)?;
        let endpoint = entry.cursor.pick(&entry.endpoints)?;
        Some((Arc::clone(&endpoint.handle), endpoint.key.clone()))
    }

    /// The handle of one named instance.
    pub fn pick_by_id(&self, path: &str, key: &str) -> Option<Arc<H>> {
        let state = self.read();
        state
            .services
            .get(path)?
            .endpoints
            .iter()
            .find(|e| e.key == key)
            .map(|e| Arc::clone(&e.handle))
    }

    /// Snapshot of every live instance of a service.
    pub fn list_all(&self, path: &str) -> HashMap<String, Arc<H>> {
        let state = self.read();
        state
            .services
            .get(path)
            .map(|entry| {
                entry
                    .endpoints
                    .iter()
                    .map(|e| (e.key.clone(), Arc::clone(&e.handle)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Register an arrival queue, replaying current members into it first.
    pub fn subscribe(&self, path: &str, queue: mpsc::Sender<String>) -> Delivery {
        let mut state = self.write();
        let keys: Vec<&str> = state
            .services
            .get(path)
            .map(|entry| entry.endpoints.iter().map(|e| e.key.as_str()).collect())
            .unwrap_or_default();
        let delivery = subscription::replay(&queue, keys);
        if delivery.dropped > 0 {
            tracing::warn!(service = %path, dropped = delivery.dropped, "Subscriber queue too small for replay");
        }

        if delivery.pruned == 0 {
            state
                .subscribers
                .entry(path.to_string())
                .or_default()
                .add(queue);
            tracing::info!(service = %path, replayed = delivery.delivered, "Subscriber registered");
        }
        delivery
    }

    /// True once any instance of the service has been seen.
    pub fn contains_service(&self, path: &str) -> bool {
        self.read().services.contains_key(path)
    }

    /// Number of live endpoints of a service.
    pub fn len(&self, path: &str) -> usize {
        self.read().services.get(path).map_or(0, ServiceEntry::len)
    }

    /// `(logical path, endpoint count)` for every known service, sorted.
    pub fn services(&self) -> Vec<(String, usize)> {
        let mut out: Vec<_> = self
            .read()
            .services
            .iter()
            .map(|(path, entry)| (path.clone(), entry.len()))
            .collect();
        out.sort();
        out
    }

    /// `(logical path, instance key, address)` of every live endpoint.
    pub fn endpoints(&self) -> Vec<(String, String, String)> {
        let state = self.read();
        state
            .services
            .iter()
            .flat_map(|(path, entry)| {
                entry.endpoints.iter().map(move |e| {
                    (path.clone(), e.key.clone(), e.handle.address().to_string())
                })
            })
            .collect()
    }

    /// Address the live endpoint for `key` was dialled at.
    pub fn address_of(&self, path: &str, key: &str) -> Option<String> {
        self.pick_by_id(path, key).map(|h| h.address().to_string())
    }
}
