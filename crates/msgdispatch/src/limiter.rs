//! Counting semaphore bounding the number of running handlers.
//!
//! The accept loop acquires a [`Permit`] before it accepts a connection and
//! moves it into the worker that serves the connection. Dropping the permit,
//! on any exit path of the worker, returns the slot.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Fixed-capacity admission gate shared by the accept loop and its workers.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    capacity: usize,
    in_use: Mutex<usize>,
    released: Condvar,
}

impl ConcurrencyLimiter {
    /// Creates a limiter admitting at most `capacity` holders at once.
    ///
    /// A capacity of zero is raised to one so that `acquire` can make
    /// progress.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            in_use: Mutex::new(0),
            released: Condvar::new(),
        })
    }

    /// Blocks until a slot is free and takes it.
    #[must_use = "the slot is released as soon as the permit is dropped"]
    pub fn acquire(self: &Arc<Self>) -> Permit {
        let mut in_use = self.lock();
        while *in_use >= self.capacity {
            in_use = self
                .released
                .wait(in_use)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *in_use += 1;
        Permit {
            limiter: Arc::clone(self),
        }
    }

    /// Takes a slot only when one is free right now.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut in_use = self.lock();
        if *in_use >= self.capacity {
            return None;
        }
        *in_use += 1;
        Some(Permit {
            limiter: Arc::clone(self),
        })
    }

    /// Number of permits currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        *self.lock()
    }

    /// Maximum number of simultaneous holders.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self) {
        let mut in_use = self.lock();
        *in_use = in_use.saturating_sub(1);
        drop(in_use);
        self.released.notify_one();
    }

    // A panicking holder cannot leave the counter inconsistent: every update
    // is a single assignment under the lock.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One admitted slot. Released on drop.
#[derive(Debug)]
pub struct Permit {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
