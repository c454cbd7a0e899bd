//! Bounded, semaphore-guarded database handle pool.
//!
//! Keeps the shape of the original `SqlConnPool` -- a fixed-size queue of
//! pre-opened handles gated by a counting semaphore -- but abstracts the
//! handle type behind [`DbHandle`] so this crate never compiles in a real
//! driver (no database crate appears anywhere in this codebase's
//! dependency set; see DESIGN.md). The semaphore is built from a
//! `Condvar`, the same primitive the worker pool already uses for
//! non-emptiness, rather than a separate semaphore crate.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::error::PoolError;

/// Marker for anything that can sit in the pool: a live handle to
/// whatever database the embedding application talks to. The reactor
/// core never calls methods on this trait -- only request handlers do --
/// so it carries no required methods, just the bounds a handle needs to
/// be pooled safely across worker threads.
pub trait DbHandle: Send + 'static {}

impl<T: Send + 'static> DbHandle for T {}

struct Inner<T> {
    idle: VecDeque<T>,
    closed: bool,
}

/// A fixed-capacity pool of `T`. `acquire` blocks the calling thread
/// until a handle is free or the pool is closed.
pub struct DbPool<T: DbHandle> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T: DbHandle> DbPool<T> {
    /// Pre-opens `capacity` handles via `factory`, matching the original
    /// pool's eager-init-at-startup behavior.
    pub fn init<F>(capacity: usize, mut factory: F) -> Result<Self, PoolError>
    where
        F: FnMut() -> Result<T, PoolError>,
    {
        let mut idle = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push_back(factory()?);
        }
        Ok(Self {
            inner: Mutex::new(Inner { idle, closed: false }),
            available: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until a handle is available, then returns an RAII guard
    /// that returns it to the pool on drop -- the deterministic-release
    /// equivalent of the original's stack-scoped `SqlConnRAII` guard.
    pub fn acquire(&self) -> Result<PoolGuard<'_, T>, PoolError> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.closed {
                return Err(PoolError::Closed);
            }
            if let Some(handle) = guard.idle.pop_front() {
                return Ok(PoolGuard { pool: self, handle: Some(handle) });
            }
            guard = self.available.wait(guard).unwrap();
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().idle.len()
    }

    /// Closes the pool: further `acquire` calls fail immediately and any
    /// threads already blocked in `acquire` wake up with `PoolError::Closed`.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.available.notify_all();
    }

    fn release(&self, handle: T) {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return;
        }
        guard.idle.push_back(handle);
        drop(guard);
        self.available.notify_one();
    }
}

/// RAII handle on loan from a [`DbPool`]. Dropping it returns the handle
/// to the pool on every exit path, including early returns and panics
/// unwinding through the caller.
pub struct PoolGuard<'a, T: DbHandle> {
    pool: &'a DbPool<T>,
    handle: Option<T>,
}

impl<T: DbHandle> std::ops::Deref for PoolGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.handle.as_ref().expect("handle taken before drop")
    }
}

impl<T: DbHandle> std::ops::DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.handle.as_mut().expect("handle taken before drop")
    }
}

impl<T: DbHandle> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn acquire_then_drop_returns_the_handle() {
        let pool = DbPool::init(2, || Ok(())).unwrap();
        assert_eq!(pool.free_count(), 2);
        let guard = pool.acquire().unwrap();
        assert_eq!(pool.free_count(), 1);
        drop(guard);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn acquire_blocks_until_a_handle_is_released() {
        let pool = Arc::new(DbPool::init(1, || Ok(42u32)).unwrap());
        let first = pool.acquire().unwrap();

        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            let guard = pool2.acquire().unwrap();
            assert_eq!(*guard, 42);
        });

        std::thread::sleep(Duration::from_millis(20));
        drop(first);
        waiter.join().unwrap();
    }

    #[test]
    fn close_wakes_blocked_acquirers_with_an_error() {
        let pool = Arc::new(DbPool::init(1, || Ok(())).unwrap());
        let _held = pool.acquire().unwrap();

        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || pool2.acquire().is_err());

        std::thread::sleep(Duration::from_millis(20));
        pool.close();
        assert!(waiter.join().unwrap());
    }
}
