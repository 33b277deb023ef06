//! Thread-safe FIFO with a readiness signal.
//!
//! [`PollableQueue`] couples a `VecDeque` with a [`tokio::sync::Semaphore`]
//! used as a counting signal: every `put` adds exactly one permit and every
//! `get` consumes exactly one before dequeuing.  Both sides update the deque
//! and the permit count under the same mutex, so the queue is ready
//! (`get` resolves immediately) if and only if an item is available.
//!
//! Because `get` is an ordinary future it composes with socket, websocket and
//! device readiness inside one `tokio::select!`, which is how both the panel
//! worker and the exchange loop wait on every source at once.
//!
//! The queue is unbounded and cheap to clone; all clones share the same
//! storage.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use panelbridge_types::BridgeError;
use tokio::sync::Semaphore;

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    ready: Semaphore,
}

/// Unbounded multi-producer, multi-consumer FIFO usable in `tokio::select!`.
pub struct PollableQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PollableQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for PollableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for PollableQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollableQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> PollableQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::new()),
                ready: Semaphore::new(0),
            }),
        }
    }

    /// Enqueue `item` and assert one unit of readiness.
    ///
    /// Never blocks.  Can be called from synchronous code (signal handlers,
    /// device threads) as well as from async tasks.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Channel`] once the queue has been closed; the
    /// item is dropped.
    pub fn put(&self, item: T) -> Result<(), BridgeError> {
        let mut items = self.lock();
        if self.shared.ready.is_closed() {
            return Err(BridgeError::Channel("queue is closed".to_string()));
        }
        items.push_back(item);
        self.shared.ready.add_permits(1);
        Ok(())
    }

    /// Wait for an item and dequeue it.
    ///
    /// Returns `None` once the queue is closed.  Cancel-safe: dropping the
    /// future before it resolves leaves both the item and its readiness unit
    /// in place.
    pub async fn get(&self) -> Option<T> {
        let permit = self.shared.ready.acquire().await.ok()?;
        let mut items = self.lock();
        permit.forget();
        items.pop_front()
    }

    /// Dequeue an item if one is ready, without waiting.
    pub fn try_get(&self) -> Option<T> {
        let permit = self.shared.ready.try_acquire().ok()?;
        let mut items = self.lock();
        permit.forget();
        items.pop_front()
    }

    /// `true` when a `get` would resolve immediately.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.available_permits() > 0
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close the queue, discarding queued items.
    ///
    /// Pending and future `get` calls return `None`; `put` fails.
    pub fn close(&self) {
        let mut items = self.lock();
        self.shared.ready.close();
        items.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.ready.is_closed()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.shared.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order_and_readiness_cleared() {
        let queue = PollableQueue::new();
        assert!(!queue.is_ready());

        for i in 0..10 {
            queue.put(i).unwrap();
        }
        assert!(queue.is_ready());
        assert_eq!(queue.len(), 10);

        for expected in 0..10 {
            assert_eq!(queue.get().await, Some(expected));
        }
        assert!(!queue.is_ready(), "readiness must be cleared once drained");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_waits_for_put_from_another_thread() {
        let queue = PollableQueue::new();
        let producer = queue.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.put("late").unwrap();
        });

        let item = tokio::time::timeout(Duration::from_secs(2), queue.get())
            .await
            .expect("get must resolve once an item is put");
        assert_eq!(item, Some("late"));
    }

    #[test]
    fn try_get_on_empty_queue_is_none() {
        let queue: PollableQueue<u8> = PollableQueue::new();
        assert_eq!(queue.try_get(), None);
        queue.put(7).unwrap();
        assert_eq!(queue.try_get(), Some(7));
        assert_eq!(queue.try_get(), None);
    }

    #[tokio::test]
    async fn cancelled_get_keeps_item() {
        let queue = PollableQueue::new();
        // A get that never completes before the timeout must not steal the
        // readiness unit of an item put afterwards.
        let _ = tokio::time::timeout(Duration::from_millis(10), queue.get()).await;
        queue.put(1).unwrap();
        assert!(queue.is_ready());
        assert_eq!(queue.get().await, Some(1));
    }

    #[tokio::test]
    async fn concurrent_producers_keep_signal_and_length_in_step() {
        let queue = PollableQueue::new();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        queue.put(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(queue.len(), 1000);
        let mut seen = 0;
        while queue.try_get().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 1000);
        assert!(!queue.is_ready());
    }

    #[tokio::test]
    async fn per_producer_order_is_preserved() {
        let queue = PollableQueue::new();
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..100 {
                producer.put(i).unwrap();
            }
        });
        handle.join().unwrap();
        let mut last = -1;
        while let Some(i) = queue.try_get() {
            assert!(i > last);
            last = i;
        }
        assert_eq!(last, 99);
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_rejects_puts() {
        let queue: PollableQueue<u32> = PollableQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert_eq!(waiter.await.unwrap(), None);
        assert!(queue.is_closed());
        assert!(matches!(queue.put(1), Err(BridgeError::Channel(_))));
    }
}
