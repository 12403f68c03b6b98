//! Retry ledger.
//!
//! # Responsibilities
//! - Remember instance keys whose dial failed
//! - Bound the number of re-attempts per key
//! - Let the sweep detect records replaced or dropped during a dial
//!
//! # Design Decisions
//! - Own lock domain (`DashMap`); never touches the service table
//! - Every `schedule` stamps a fresh generation; a sweep result only applies
//!   to the generation it started with
//! - A record whose budget reaches zero is deleted, never kept around

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RetryRecord {
    remaining: u32,
    generation: u64,
}

/// Result of charging a failed attempt to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Attempts left after this failure.
    Pending(u32),
    /// Budget exhausted; the record is gone.
    GivenUp,
    /// The record was replaced or removed meanwhile; nothing changed.
    Stale,
}

/// Bounded retry bookkeeping keyed by instance key.
#[derive(Debug)]
pub struct RetryLedger {
    records: DashMap<String, RetryRecord>,
    max_attempts: u32,
    next_generation: AtomicU64,
}

impl RetryLedger {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            records: DashMap::new(),
            max_attempts: max_attempts.max(1),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Insert or refresh a record with the full budget. Returns its generation.
    pub fn schedule(&self, key: &str) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.records.insert(
            key.to_string(),
            RetryRecord {
                remaining: self.max_attempts,
                generation,
            },
        );
        generation
    }

    pub fn forget(&self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    /// Drop every record under a directory key.
    pub fn forget_under(&self, prefix: &str) -> usize {
        let before = self.records.len();
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        self.records.retain(|key, _| !key.starts_with(&dir));
        before.saturating_sub(self.records.len())
    }

    /// Keep only records whose key satisfies `keep`.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.records.len();
        self.records.retain(|key, _| keep(key));
        before.saturating_sub(self.records.len())
    }

    /// Snapshot of `(key, generation)` for every record, sorted by key.
    pub fn pending(&self) -> Vec<(String, u64)> {
        let mut out: Vec<_> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().generation))
            .collect();
        out.sort();
        out
    }

    /// Remove the record if it still carries `generation`.
    pub fn resolve(&self, key: &str, generation: u64) -> bool {
        self.records
            .remove_if(key, |_, record| record.generation == generation)
            .is_some()
    }

    /// Charge one failed attempt to the record of `generation`.
    pub fn record_failure(&self, key: &str, generation: u64) -> RetryOutcome {
        let remaining = match self.records.get_mut(key) {
            Some(mut record) if record.generation == generation => {
                record.remaining = record.remaining.saturating_sub(1);
                record.remaining
            }
            _ => return RetryOutcome::Stale,
        };

        if remaining > 0 {
            return RetryOutcome::Pending(remaining);
        }
        self.records
            .remove_if(key, |_, record| record.generation == generation);
        RetryOutcome::GivenUp
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn remaining(&self, key: &str) -> Option<u32> {
        self.records.get(key).map(|r| r.remaining)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
