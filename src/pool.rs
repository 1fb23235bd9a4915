//! Connection slots for in-process drivers
//!
//! A networked driver holds at most `pool_size` connections and a caller
//! waits for a free one. `ConnectionPool` models that limit: each round trip
//! holds one slot for its duration.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Slots {
    in_use: usize,
    peak: usize,
}

/// Counting limit on concurrent round trips
pub struct ConnectionPool {
    size: usize,
    slots: Mutex<Slots>,
    released: Condvar,
}

impl ConnectionPool {
    /// A pool of `size` connections (minimum 1)
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            slots: Mutex::new(Slots::default()),
            released: Condvar::new(),
        }
    }

    /// Take a connection, waiting while all of them are in use.
    pub fn acquire(&self) -> PooledConnection<'_> {
        let mut slots = self.slots.lock();
        while slots.in_use >= self.size {
            self.released.wait(&mut slots);
        }
        slots.in_use += 1;
        slots.peak = slots.peak.max(slots.in_use);
        PooledConnection { pool: self }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections in use right now
    pub fn in_use(&self) -> usize {
        self.slots.lock().in_use
    }

    /// Most connections ever in use at once
    pub fn peak(&self) -> usize {
        self.slots.lock().peak
    }

    fn release(&self) {
        self.slots.lock().in_use -= 1;
        self.released.notify_one();
    }
}

/// A held connection, returned to its pool on drop
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_zero_size_becomes_one() {
        assert_eq!(ConnectionPool::new(0).size(), 1);
    }

    #[test]
    fn test_release_on_drop() {
        let pool = ConnectionPool::new(2);
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
            assert_eq!(pool.in_use(), 2);
        }
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.peak(), 2);
    }

    #[test]
    fn test_concurrency_never_exceeds_size() {
        let pool = Arc::new(ConnectionPool::new(3));
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let _connection = pool.acquire();
                    thread::sleep(Duration::from_millis(10));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.peak() <= 3);
        assert_eq!(pool.in_use(), 0);
    }
}
