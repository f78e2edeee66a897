//! Free-list pools for per-request scratch objects
//!
//! The proxy churns through a handful of short-lived structures on every
//! request: merge accumulators, suffix automata, hashers and checkpoint lists.
//! A [`Pool`] keeps a bounded number of them around between requests. Objects
//! are checked out as a [`Pooled`] guard and go back to the pool when the guard
//! drops, after [`Recycle::recycle`] has wiped them.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Default number of idle objects a pool keeps
pub const DEFAULT_MAX_IDLE: usize = 64;

/// Types that can be wiped back to an empty state for reuse
pub trait Recycle {
    /// Reset to the state of a freshly constructed value
    fn recycle(&mut self);
}

/// A bounded free-list of reusable objects
pub struct Pool<T: Recycle> {
    free: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T: Recycle + Default> Pool<T> {
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        })
    }

    /// Take an object from the pool, or build a new one when the pool is empty
    pub fn checkout(self: &Arc<Self>) -> Pooled<T> {
        let item = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_default();

        Pooled {
            item: Some(item),
            pool: Arc::clone(self),
        }
    }
}

impl<T: Recycle> Pool<T> {
    fn give_back(&self, mut item: T) {
        item.recycle();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_idle {
                free.push(item);
            }
        }
    }

    /// Number of idle objects currently held
    #[cfg(test)]
    pub fn idle(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

/// An object checked out of a [`Pool`]
pub struct Pooled<T: Recycle> {
    item: Option<T>,
    pool: Arc<Pool<T>>,
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the item out
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.give_back(item);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recycle impls for std/serde containers
// ─────────────────────────────────────────────────────────────────────────────

impl<T> Recycle for Vec<T> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl<K, V> Recycle for std::collections::HashMap<K, V> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl<K: Ord, V> Recycle for std::collections::BTreeMap<K, V> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl Recycle for serde_json::Map<String, serde_json::Value> {
    fn recycle(&mut self) {
        self.clear();
    }
}
