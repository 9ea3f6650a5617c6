//! Free-list pool with scoped borrows.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Values that can be cleared for reuse.
pub trait Reset {
    /// Return to the freshly-acquired state.
    fn reset(&mut self);
}

impl<T> Reset for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Shared free-list of reusable values.
///
/// Cloning the pool shares the same free-list.
pub struct Pool<T> {
    idle: Arc<Mutex<Vec<T>>>,
    max_idle: usize,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            idle: Arc::clone(&self.idle),
            max_idle: self.max_idle,
        }
    }
}

impl<T: Reset + Default> Pool<T> {
    /// Pool keeping at most `max_idle` returned values.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Arc::new(Mutex::new(Vec::with_capacity(max_idle))),
            max_idle,
        }
    }

    /// Borrow a value; it goes back to the pool when the guard drops.
    pub fn acquire(&self) -> Pooled<T> {
        let value = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_default();
        Pooled {
            value,
            pool: self.clone(),
        }
    }

    /// Values currently waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn release(&self, mut value: T) {
        value.reset();
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(value);
            }
        }
    }
}

/// Value borrowed from a [`Pool`].
pub struct Pooled<T: Reset + Default> {
    value: T,
    pool: Pool<T>,
}

impl<T: Reset + Default> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Reset + Default> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Reset + Default> Drop for Pooled<T> {
    fn drop(&mut self) {
        let value = std::mem::take(&mut self.value);
        self.pool.release(value);
    }
}

impl<T: Reset + Default + std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}
