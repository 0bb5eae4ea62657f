//! In-process buffer of fired events awaiting commit.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// FIFO of fired-but-uncommitted events.
///
/// - Enqueue and drain share one mutex, so a drain never observes a half-written
///   enqueue and never leaves part of the queue behind.
/// - A batch whose durable write failed can be put back at the head, ahead of events
///   fired while the failed commit was running.
#[derive(Debug)]
pub struct EventQueue<E> {
    inner: Mutex<VecDeque<Arc<E>>>,
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event: Arc<E>) {
        self.lock().push_back(event);
    }

    /// Remove and return every queued event, oldest first.
    pub fn drain(&self) -> Vec<Arc<E>> {
        let mut queue = self.lock();
        std::mem::take(&mut *queue).into()
    }

    /// Put a drained batch back at the head of the queue, preserving its order.
    pub fn requeue_front(&self, batch: Vec<Arc<E>>) {
        let mut queue = self.lock();
        for event in batch.into_iter().rev() {
            queue.push_front(event);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<E>>> {
        // Queue operations cannot panic halfway through, so the data is intact.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn values(events: &[Arc<u32>]) -> Vec<u32> {
        events.iter().map(|e| **e).collect()
    }

    #[test]
    fn drain_empties_queue_in_fifo_order() {
        let queue = EventQueue::new();
        for n in 1..=3 {
            queue.enqueue(Arc::new(n));
        }

        assert_eq!(values(&queue.drain()), vec![1, 2, 3]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn requeued_batch_goes_ahead_of_newer_events() {
        let queue = EventQueue::new();
        queue.enqueue(Arc::new(1));
        queue.enqueue(Arc::new(2));
        let batch = queue.drain();

        queue.enqueue(Arc::new(3));
        queue.requeue_front(batch);

        assert_eq!(values(&queue.drain()), vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_enqueue_and_drain_lose_nothing() {
        let queue = Arc::new(EventQueue::new());
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for n in 0..250u32 {
                        queue.enqueue(Arc::new(p * 1_000 + n));
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while producers.iter().any(|h| !h.is_finished()) {
            seen.extend(values(&queue.drain()));
        }
        for h in producers {
            h.join().unwrap();
        }
        seen.extend(values(&queue.drain()));

        assert_eq!(seen.len(), 1_000);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 1_000);
    }

    proptest! {
        /// Property: splitting a stream of events across any number of drains yields the
        /// original sequence when the drained batches are concatenated.
        #[test]
        fn drains_partition_the_stream(
            chunks in prop::collection::vec(prop::collection::vec(any::<u32>(), 0..8), 0..10)
        ) {
            let queue = EventQueue::new();
            let mut expected = Vec::new();
            let mut drained = Vec::new();

            for chunk in chunks {
                for v in chunk {
                    expected.push(v);
                    queue.enqueue(Arc::new(v));
                }
                drained.extend(values(&queue.drain()));
            }

            prop_assert_eq!(drained, expected);
            prop_assert!(queue.is_empty());
        }
    }
}
