//! Round-robin selection cursor.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin cursor.
/// Stores an internal counter to rotate through a service's endpoints.
///
/// The counter only ever grows (wrapping) and is read modulo the current
/// endpoint count, so it never indexes out of range. When the list is resized
/// between picks the rotation may skip or repeat one entry; coverage is
/// uniform over many picks, not strictly fair per cycle.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the cursor and return the slot to use among `len` entries.
    pub fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(count % len)
    }

    /// Pick the next item of `items`.
    pub fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        self.next_index(items.len()).map(|i| &items[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let backends = vec!["127.0.0.1:8080", "127.0.0.1:8081"];

        assert_eq!(lb.pick(&backends), Some(&"127.0.0.1:8080"));
        assert_eq!(lb.pick(&backends), Some(&"127.0.0.1:8081"));
        assert_eq!(lb.pick(&backends), Some(&"127.0.0.1:8080"));
    }

    #[test]
    fn test_empty() {
        let lb = RoundRobin::new();
        let none: Vec<u8> = Vec::new();
        assert_eq!(lb.pick(&none), None);
        assert_eq!(lb.next_index(0), None);
    }

    #[test]
    fn test_shrinking_list_stays_in_range() {
        let lb = RoundRobin::new();
        for _ in 0..7 {
            lb.next_index(5);
        }
        // cursor is 7, list shrank to 2
        assert_eq!(lb.next_index(2), Some(1));
        assert_eq!(lb.next_index(1), Some(0));
    }

    #[test]
    fn test_counter_wraps() {
        let lb = RoundRobin {
            counter: AtomicUsize::new(usize::MAX),
        };
        assert!(lb.next_index(3).is_some());
        assert_eq!(lb.next_index(3), Some(0));
    }
}
