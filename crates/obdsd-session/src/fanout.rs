//! Bounded fan-out from the sampling loop to the per-session consumers.
//!
//! The pipeline publishes every stream item to three named queues
//! (analysis, events, persist). Publishing never blocks and never
//! fails: when a consumer lags behind, its queue drops the oldest item
//! and counts the loss. Order within a queue is always arrival order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Bounded FIFO that sheds the oldest entry instead of blocking the
/// producer.
///
/// `push` is synchronous and lock-only, so it is safe on the sampling
/// hot path. `recv` is the single async consumer side; once the queue
/// is closed it drains the backlog and then yields `None`.
pub struct DropQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl<T> DropQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Enqueue one item, displacing the oldest entry when full.
    /// Items pushed after `close` are discarded.
    pub fn push(&self, item: T) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut items = self.items.lock();
            if items.len() == self.capacity {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Receive the next item. Returns `None` once the queue is closed
    /// and fully drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            // Register interest before the emptiness check so a push
            // racing between the two is never missed.
            let notified = self.notify.notified();
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                // One more pop covers an item that slipped in between
                // the miss above and the close.
                return self.pop();
            }
            notified.await;
        }
    }

    fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Stop accepting items and wake the consumer so it can drain out.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        // Stores a permit for a consumer that created its Notified but
        // has not polled it yet; notify_waiters alone would miss it.
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items shed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Snapshot of loss counters across the three consumer queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDrops {
    pub analysis: u64,
    pub events: u64,
    pub persist: u64,
}

impl QueueDrops {
    pub fn total(&self) -> u64 {
        self.analysis + self.events + self.persist
    }
}

/// The three per-session consumer queues.
///
/// One publisher (the pipeline), one consumer task per queue. Each
/// queue lags and drops independently; a slow store writer never costs
/// the live view an event.
pub struct Fanout<T> {
    analysis: Arc<DropQueue<T>>,
    events: Arc<DropQueue<T>>,
    persist: Arc<DropQueue<T>>,
}

impl<T: Clone> Fanout<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            analysis: Arc::new(DropQueue::new(capacity)),
            events: Arc::new(DropQueue::new(capacity)),
            persist: Arc::new(DropQueue::new(capacity)),
        }
    }

    /// Publish one item to every queue. Never blocks.
    pub fn publish(&self, item: T) {
        self.analysis.push(item.clone());
        self.events.push(item.clone());
        self.persist.push(item);
    }

    pub fn analysis(&self) -> Arc<DropQueue<T>> {
        Arc::clone(&self.analysis)
    }

    pub fn events(&self) -> Arc<DropQueue<T>> {
        Arc::clone(&self.events)
    }

    pub fn persist(&self) -> Arc<DropQueue<T>> {
        Arc::clone(&self.persist)
    }

    /// Close all queues; consumers finish their backlogs and exit.
    pub fn close(&self) {
        self.analysis.close();
        self.events.close();
        self.persist.close();
    }

    pub fn drops(&self) -> QueueDrops {
        QueueDrops {
            analysis: self.analysis.dropped(),
            events: self.events.dropped(),
            persist: self.persist.dropped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drop_queue_sheds_oldest_and_keeps_order() {
        let queue = DropQueue::new(3);
        for n in 0..5u32 {
            queue.push(n);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);

        // 0 and 1 were displaced; the survivors come out in order.
        assert_eq!(queue.recv().await, Some(2));
        assert_eq!(queue.recv().await, Some(3));
        assert_eq!(queue.recv().await, Some(4));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drop_queue_push_never_waits_on_full_queue() {
        let queue = DropQueue::new(1);
        queue.push(1u32);
        // Second push must return immediately even though nothing has
        // been consumed.
        queue.push(2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_drop_queue_recv_wakes_on_push() {
        let queue = Arc::new(DropQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::task::yield_now().await;
        queue.push(7u32);
        let got = consumer.await.unwrap();
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn test_drop_queue_close_drains_then_ends() {
        let queue = DropQueue::new(4);
        queue.push(1u32);
        queue.push(2);
        queue.close();
        // Pushes after close are discarded, not counted as drops.
        queue.push(3);
        assert_eq!(queue.recv().await, Some(1));
        assert_eq!(queue.recv().await, Some(2));
        assert_eq!(queue.recv().await, None);
        assert_eq!(queue.dropped(), 0);
    }

    #[tokio::test]
    async fn test_drop_queue_close_wakes_blocked_consumer() {
        let queue = Arc::new(DropQueue::<u32>::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fanout_publishes_to_all_queues_independently() {
        let fanout = Fanout::new(2);
        let analysis = fanout.analysis();
        let events = fanout.events();

        fanout.publish("a");
        fanout.publish("b");
        // The analysis consumer takes one item; events takes none.
        assert_eq!(analysis.recv().await, Some("a"));
        fanout.publish("c");

        // Events queue was full, so it shed "a"; analysis had room.
        assert_eq!(fanout.drops().events, 1);
        assert_eq!(fanout.drops().analysis, 0);
        assert_eq!(events.recv().await, Some("b"));
        assert_eq!(events.recv().await, Some("c"));
        assert_eq!(analysis.recv().await, Some("b"));
        assert_eq!(analysis.recv().await, Some("c"));
    }

    #[tokio::test]
    async fn test_fanout_close_ends_every_consumer() {
        let fanout = Fanout::<u32>::new(2);
        let persist = fanout.persist();
        fanout.publish(9);
        fanout.close();
        assert_eq!(persist.recv().await, Some(9));
        assert_eq!(persist.recv().await, None);
        assert_eq!(fanout.events().recv().await, Some(9));
        assert_eq!(fanout.events().recv().await, None);
    }
}
