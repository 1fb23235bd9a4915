//! Bounded multi-producer/multi-consumer command queue
//!
//! A `VecDeque` behind a mutex with two condition variables. Producers that
//! find the queue full stall instead of dropping their command; consumers
//! block until an item arrives or the queue is closed.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use tracing::warn;

/// Why a non-blocking push did not enqueue its item
#[derive(Debug, PartialEq)]
pub enum PushError<T> {
    Full(T),
    Closed(T),
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity FIFO shared by producers and workers
pub struct CommandQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> CommandQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue without blocking.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, blocking while the queue is full.
    ///
    /// Returns the item back if the queue is or becomes closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(item);
            }
            if state.items.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut state);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Backpressure-aware enqueue: try without blocking first, and only when
    /// the queue is full warn and fall back to a blocking push. The item is
    /// enqueued at most once.
    pub fn submit(&self, item: T) -> Result<(), T> {
        match self.try_push(item) {
            Ok(()) => Ok(()),
            Err(PushError::Closed(item)) => Err(item),
            Err(PushError::Full(item)) => {
                warn!(capacity = self.capacity, "command queue is full, producer blocked");
                self.push(item)
            }
        }
    }

    /// Dequeue the oldest item, blocking until one is available.
    ///
    /// Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Close the queue, waking every blocked producer and consumer.
    ///
    /// Items still queued are handed back undelivered. Closing twice returns
    /// an empty vector the second time.
    pub fn close(&self) -> Vec<T> {
        let abandoned = {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();
        abandoned
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::capture;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = CommandQueue::new(4);
        for i in 0..4 {
            queue.submit(i).unwrap();
        }
        let drained: Vec<_> = (0..4).map(|_| queue.pop().unwrap()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_try_push_reports_full() {
        let queue = CommandQueue::new(1);
        queue.try_push("a").unwrap();
        assert_eq!(queue.try_push("b"), Err(PushError::Full("b")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_submit_blocks_until_space_frees() {
        let queue = Arc::new(CommandQueue::new(1));
        queue.submit(1).unwrap();

        let (tx, rx) = mpsc::channel();
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                queue.submit(2).unwrap();
                tx.send(()).unwrap();
            })
        };

        // Producer stays parked while the queue is full
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        assert_eq!(queue.pop(), Some(1));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        producer.join().unwrap();

        // Submitted exactly once
        assert_eq!(queue.pop(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_warns_before_blocking() {
        let queue = Arc::new(CommandQueue::new(1));
        let ((), output) = capture(|| queue.submit(1).unwrap());
        assert!(!output.contains("producer blocked"));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                queue.pop()
            })
        };
        let ((), output) = capture(|| queue.submit(2).unwrap());
        assert!(output.contains("WARN"));
        assert!(output.contains("command queue is full, producer blocked"));
        assert!(output.contains("capacity=1"));

        assert_eq!(consumer.join().unwrap(), Some(1));
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn test_close_releases_blocked_producer_and_consumer() {
        let queue = Arc::new(CommandQueue::<u32>::new(1));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(queue.close().is_empty());
        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(queue.submit(7), Err(7));
    }

    #[test]
    fn test_close_hands_back_abandoned_items() {
        let queue = CommandQueue::new(8);
        for i in 0..5 {
            queue.submit(i).unwrap();
        }
        assert_eq!(queue.close(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_closed());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_concurrent_producers_and_consumers_no_loss_no_duplication() {
        let queue = Arc::new(CommandQueue::new(16));
        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = Arc::clone(&queue);
            producers.push(thread::spawn(move || {
                for i in 0..250 {
                    queue.submit(p * 1000 + i).unwrap();
                }
            }));
        }

        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            thread::spawn(move || {
                while let Some(item) = queue.pop() {
                    tx.send(item).unwrap();
                }
            });
        }

        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let item = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(seen.insert(item), "duplicate item {item}");
        }
        queue.close();
        assert_eq!(seen.len(), 1000);
    }
}
