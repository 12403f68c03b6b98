//! In-process coordination store.
//!
//! Keeps a sorted key space, a bounded event history and a broadcast channel
//! for live watchers, mirroring the semantics the registry relies on from
//! etcd: monotonically increasing indexes, resumable watches, and a
//! `Compacted` error once a resume index has fallen out of history.
//!
//! Also exposes failure injection (`set_available`, `disconnect_watchers`) for
//! exercising the reconciler's recovery paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::store::{
    Action, CoordinationStore, Node, SetCondition, StoreError, StoreResponse, StoreResult,
    WatchEvent, WatchStream,
};

/// Number of events kept for resuming watches (etcd v2 keeps 1000).
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

const WATCH_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    modified_index: u64,
}

struct MemoryState {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<WatchEvent>,
    compacted_through: u64,
    available: bool,
    events: broadcast::Sender<WatchEvent>,
}

/// A complete coordination store living in process memory.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    history_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a store that only remembers the last `limit` events.
    pub fn with_history_limit(limit: usize) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            state: Mutex::new(MemoryState {
                entries: BTreeMap::new(),
                index: 0,
                history: VecDeque::new(),
                compacted_through: 0,
                available: true,
                events,
            }),
            history_limit: limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unconditionally write a value. Returns the new index.
    pub fn put(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut state = self.lock();
        self.write(&mut state, key, value, SetCondition::Any)
    }

    /// Delete a key or directory. Returns the new index.
    pub fn remove(&self, key: &str) -> StoreResult<u64> {
        let mut state = self.lock();
        self.erase(&mut state, key)
    }

    /// Current value of a leaf.
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Current store index.
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    /// Simulate an outage: while unavailable every request fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// End every open watch stream, as a dropped connection would.
    pub fn disconnect_watchers(&self) {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        self.lock().events = events;
    }

    fn check_available(state: &MemoryState) -> StoreResult<()> {
        if state.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }

    fn publish(&self, state: &mut MemoryState, event: WatchEvent) {
        state.history.push_back(event.clone());
        while state.history.len() > self.history_limit {
            if let Some(evicted) = state.history.pop_front() {
                state.compacted_through = evicted.index;
            }
        }
        // no receivers is fine
        let _ = state.events.send(event);
    }

    fn write(
        &self,
        state: &mut MemoryState,
        key: &str,
        value: &str,
        condition: SetCondition,
    ) -> StoreResult<u64> {
        Self::check_available(state)?;

        let dir_prefix = format!("{key}/");
        if state
            .entries
            .range(dir_prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&dir_prefix))
        {
            return Err(StoreError::Protocol(format!("{key} is a directory")));
        }
        if let Some(parent) = ancestors(key).find(|a| state.entries.contains_key(*a)) {
            return Err(StoreError::Protocol(format!("{parent} is not a directory")));
        }

        let existing = state.entries.get(key);
        let action = match (condition, existing) {
            (SetCondition::Any, _) => Action::Set,
            (SetCondition::Absent, None) => Action::Create,
            (SetCondition::Absent, Some(_)) => {
                return Err(StoreError::Conflict { key: key.into() });
            }
            (SetCondition::Version(_), None) => {
                return Err(StoreError::NotFound { key: key.into(), index: state.index });
            }
            (SetCondition::Version(expected), Some(entry)) => {
                if entry.modified_index != expected {
                    return Err(StoreError::Conflict { key: key.into() });
                }
                Action::CompareAndSwap
            }
        };

        state.index += 1;
        let index = state.index;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                modified_index: index,
            },
        );
        self.publish(
            state,
            WatchEvent {
                action,
                key: key.to_string(),
                value: Some(value.to_string()),
                dir: false,
                index,
            },
        );
        Ok(index)
    }

    fn erase(&self, state: &mut MemoryState, key: &str) -> StoreResult<u64> {
        Self::check_available(state)?;

        let dir = if state.entries.remove(key).is_some() {
            false
        } else {
            let prefix = format!("{key}/");
            let doomed: Vec<String> = state
                .entries
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect();
            if doomed.is_empty() {
                return Err(StoreError::NotFound { key: key.into(), index: state.index });
            }
            for k in doomed {
                state.entries.remove(&k);
            }
            true
        };

        state.index += 1;
        let index = state.index;
        self.publish(
            state,
            WatchEvent {
                action: Action::Delete,
                key: key.to_string(),
                value: None,
                dir,
                index,
            },
        );
        Ok(index)
    }
}

/// Parent directories of a key, nearest first.
fn ancestors(key: &str) -> impl Iterator<Item = &str> {
    let mut current = key;
    std::iter::from_fn(move || {
        let (parent, _) = current.rsplit_once('/')?;
        if parent.is_empty() {
            return None;
        }
        current = parent;
        Some(parent)
    })
}

fn build_dir(dir_key: &str, items: &[(&String, &Entry)], recursive: bool) -> Node {
    let prefix = format!("{dir_key}/");
    let mut nodes = Vec::new();
    let mut i = 0;
    while i < items.len() {
        let (key, entry) = items[i];
        let rest = &key[prefix.len()..];
        match rest.split_once('/') {
            None => {
                nodes.push(Node {
                    key: key.clone(),
                    value: Some(entry.value.clone()),
                    dir: false,
                    modified_index: entry.modified_index,
                    nodes: Vec::new(),
                });
                i += 1;
            }
            Some((child, _)) => {
                let child_key = format!("{prefix}{child}");
                let child_prefix = format!("{child_key}/");
                // sorted keys sharing a prefix are contiguous
                let end = items[i..]
                    .iter()
                    .position(|(k, _)| !k.starts_with(&child_prefix))
                    .map_or(items.len(), |p| i + p);
                let node = if recursive {
                    build_dir(&child_key, &items[i..end], true)
                } else {
                    Node {
                        key: child_key,
                        dir: true,
                        ..Node::default()
                    }
                };
                nodes.push(node);
                i = end;
            }
        }
    }
    Node {
        key: dir_key.to_string(),
        dir: true,
        nodes,
        ..Node::default()
    }
}

fn watches(path: &str, recursive: bool, key: &str) -> bool {
    key == path
        || (recursive
            && key.len() > path.len()
            && key.starts_with(path)
            && key.as_bytes()[path.len()] == b'/')
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, path: &str, recursive: bool) -> StoreResult<StoreResponse> {
        let state = self.lock();
        Self::check_available(&state)?;

        if let Some(entry) = state.entries.get(path) {
            return Ok(StoreResponse {
                index: state.index,
                node: Node {
                    key: path.to_string(),
                    value: Some(entry.value.clone()),
                    dir: false,
                    modified_index: entry.modified_index,
                    nodes: Vec::new(),
                },
            });
        }

        let prefix = format!("{path}/");
        let items: Vec<(&String, &Entry)> = state
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .collect();
        if items.is_empty() {
            return Err(StoreError::NotFound {
                key: path.into(),
                index: state.index,
            });
        }

        Ok(StoreResponse {
            index: state.index,
            node: build_dir(path, &items, recursive),
        })
    }

    fn watch(&self, path: &str, recursive: bool, from_index: Option<u64>) -> WatchStream {
        let state = self.lock();
        if let Err(e) = Self::check_available(&state) {
            return stream::once(async move { Err::<WatchEvent, _>(e) }).boxed();
        }
        if let Some(from) = from_index {
            if from <= state.compacted_through {
                let index = state.compacted_through;
                return stream::once(async move { Err::<WatchEvent, _>(StoreError::Compacted { index }) })
                    .boxed();
            }
        }

        let path = path.to_string();
        let backlog: Vec<StoreResult<WatchEvent>> = match from_index {
            Some(from) => state
                .history
                .iter()
                .filter(|e| e.index >= from && watches(&path, recursive, &e.key))
                .cloned()
                .map(Ok)
                .collect(),
            None => Vec::new(),
        };
        // subscribed under the same lock as the backlog snapshot, so nothing
        // falls between the two
        let receiver = state.events.subscribe();
        drop(state);

        let live = stream::unfold(Some(receiver), move |receiver| {
            let path = path.clone();
            async move {
                let mut receiver = receiver?;
                loop {
                    match receiver.recv().await {
                        Ok(event) if watches(&path, recursive, &event.key) => {
                            return Some((Ok(event), Some(receiver)));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Memory store watcher lagged behind");
                            return Some((Err(StoreError::Compacted { index: 0 }), None));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        stream::iter(backlog).chain(live).boxed()
    }

    async fn set(&self, key: &str, value: &str, condition: SetCondition) -> StoreResult<u64> {
        let mut state = self.lock();
        self.write(&mut state, key, value, condition)
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let mut state = self.lock();
        self.erase(&mut state, key)
    }
}
