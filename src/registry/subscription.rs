//! Arrival notifications.
//!
//! Callers hand in bounded `mpsc` queues; the table pushes the instance key
//! of every endpoint added under the subscribed path. Delivery is
//! at-most-once and lossy: a full queue drops the notification, a closed
//! queue is pruned. This is a wake-up signal, not an event log.

use tokio::sync::mpsc::{self, error::TrySendError};

/// Outcome of one fan-out round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
    pub pruned: usize,
}

/// The queues registered for one logical path.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    queues: Vec<mpsc::Sender<String>>,
}

impl SubscriberSet {
    pub fn add(&mut self, queue: mpsc::Sender<String>) {
        self.queues.push(queue);
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Offer `key` to every queue without waiting.
    pub fn notify(&mut self, key: &str) -> Delivery {
        let mut delivery = Delivery::default();
        self.queues.retain(|queue| match offer(queue, key) {
            Offer::Delivered => {
                delivery.delivered += 1;
                true
            }
            Offer::Full => {
                delivery.dropped += 1;
                true
            }
            Offer::Closed => {
                delivery.pruned += 1;
                false
            }
        });
        delivery
    }
}

enum Offer {
    Delivered,
    Full,
    Closed,
}

fn offer(queue: &mpsc::Sender<String>, key: &str) -> Offer {
    match queue.try_send(key.to_string()) {
        Ok(()) => Offer::Delivered,
        Err(TrySendError::Full(_)) => Offer::Full,
        Err(TrySendError::Closed(_)) => Offer::Closed,
    }
}

/// Push `keys` into a single fresh queue, for replaying current membership to
/// a new subscriber.
pub fn replay<'a, I>(queue: &mpsc::Sender<String>, keys: I) -> Delivery
where
    I: IntoIterator<Item = &'a str>,
{
    let mut delivery = Delivery::default();
    for key in keys {
        match offer(queue, key) {
            Offer::Delivered => delivery.delivered += 1,
            Offer::Full => delivery.dropped += 1,
            Offer::Closed => {
                delivery.pruned = 1;
                break;
            }
        }
    }
    delivery
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_fans_out() {
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let mut set = SubscriberSet::default();
        set.add(tx1);
        set.add(tx2);

        let delivery = set.notify("/backends/auth/i1");
        assert_eq!(delivery.delivered, 2);
        assert_eq!(rx1.try_recv().unwrap(), "/backends/auth/i1");
        assert_eq!(rx2.try_recv().unwrap(), "/backends/auth/i1");
    }

    #[test]
    fn test_full_queue_drops_closed_queue_pruned() {
        let (full_tx, _full_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = mpsc::channel(1);
        drop(closed_rx);

        let mut set = SubscriberSet::default();
        set.add(full_tx);
        set.add(closed_tx);

        assert_eq!(
            set.notify("a"),
            Delivery {
                delivered: 1,
                dropped: 0,
                pruned: 1
            }
        );
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.notify("b"),
            Delivery {
                delivered: 0,
                dropped: 1,
                pruned: 0
            }
        );
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_replay_respects_capacity() {
        let (tx, mut rx) = mpsc::channel(2);
        let delivery = replay(&tx, ["a", "b", "c"]);
        assert_eq!(delivery.delivered, 2);
        assert_eq!(delivery.dropped, 1);
        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");
    }
}
