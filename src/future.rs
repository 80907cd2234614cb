use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// One-shot settable value with blocking waiters.
///
/// Used for fence durability futures and sync-engine tickets; the first
/// `set` wins and wakes every waiter.
#[derive(Debug)]
pub struct SettableFuture<T: Clone> {
    inner: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T: Clone> Clone for SettableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for SettableFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SettableFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// A future that is already complete.
    pub fn ready(value: T) -> Self {
        Self {
            inner: Arc::new((Mutex::new(Some(value)), Condvar::new())),
        }
    }

    pub fn set(&self, value: T) {
        let (slot, condvar) = &*self.inner;
        let mut guard = slot.lock();
        if guard.is_none() {
            *guard = Some(value);
            condvar.notify_all();
        }
    }

    pub fn peek(&self) -> Option<T> {
        self.inner.0.lock().clone()
    }

    /// Blocks until the value is set.
    pub fn wait(&self) -> T {
        let (slot, condvar) = &*self.inner;
        let mut guard = slot.lock();
        loop {
            if let Some(value) = guard.clone() {
                return value;
            }
            condvar.wait(&mut guard);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let (slot, condvar) = &*self.inner;
        let mut guard = slot.lock();
        if guard.is_none() {
            condvar.wait_for(&mut guard, timeout);
        }
        guard.clone()
    }
}
