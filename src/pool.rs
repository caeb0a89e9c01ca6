//! Free-list object pool for per-request scratch state.
//!
//! Objects are handed out by value and must be handed back with
//! [`Pool::release`] by the same dispatch call that acquired them. An acquired
//! object is owned exclusively by that call: never stash it somewhere another
//! coroutine can reach it, and never release it while anything still borrows
//! from it. `release` resets the object before it goes back on the free list,
//! so the next `acquire` always observes a clean value.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// State that can be cleared for reuse without dropping its allocations.
pub trait Recycle {
    /// Clear all request-specific contents, keeping capacity.
    fn recycle(&mut self);
}

/// Bounded free-list pool.
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    max_idle: usize,
    make: Box<dyn Fn() -> T + Send + Sync>,
    created: AtomicUsize,
}

impl<T: Recycle + Send> Pool<T> {
    /// `make` builds fresh objects (this is where capacity hints apply);
    /// at most `max_idle` released objects are retained.
    pub fn new<F>(max_idle: usize, make: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            free: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
            make: Box::new(make),
            created: AtomicUsize::new(0),
        }
    }

    /// Take an object off the free list, or build a new one.
    pub fn acquire(&self) -> T {
        if let Some(item) = self.free.lock().pop() {
            return item;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        (self.make)()
    }

    /// Reset `item` and return it to the free list.
    pub fn release(&self, mut item: T) {
        item.recycle();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(item);
        }
    }

    /// Objects currently idle on the free list.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Objects built since the pool was created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl<T> Recycle for Vec<T> {
    fn recycle(&mut self) {
        self.clear();
    }
}
