//! Indexed min-heap of per-descriptor expiries.
//!
//! Mirrors a classic heap-timer: a binary heap keyed by expiry plus a
//! side table mapping descriptor -> heap slot, so `adjust`/`cancel` don't
//! need a linear scan. The side table is kept in lockstep with every
//! heap swap, which is the one invariant the whole module exists to
//! protect.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

type ExpireCallback = Box<dyn FnOnce() + Send>;

struct Slot {
    fd: RawFd,
    expires_at: Instant,
    callback: Option<ExpireCallback>,
}

pub struct HeapTimer {
    heap: Vec<Slot>,
    index_of: HashMap<RawFd, usize>,
}

impl Default for HeapTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapTimer {
    pub fn new() -> Self {
        Self { heap: Vec::new(), index_of: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.index_of.contains_key(&fd)
    }

    /// Inserts a new entry, or replaces the expiry and callback of an
    /// existing one for the same descriptor.
    pub fn add(&mut self, fd: RawFd, timeout: Duration, callback: ExpireCallback) {
        if let Some(&i) = self.index_of.get(&fd) {
            self.heap[i].expires_at = Instant::now() + timeout;
            self.heap[i].callback = Some(callback);
            self.sift(i);
            return;
        }
        let i = self.heap.len();
        self.heap.push(Slot { fd, expires_at: Instant::now() + timeout, callback: Some(callback) });
        self.index_of.insert(fd, i);
        self.sift_up(i);
    }

    /// Resets `fd`'s expiry to `now + timeout`, keeping its callback.
    pub fn adjust(&mut self, fd: RawFd, timeout: Duration) {
        let Some(&i) = self.index_of.get(&fd) else { return };
        self.heap[i].expires_at = Instant::now() + timeout;
        self.sift(i);
    }

    /// Removes `fd` without invoking its callback. A no-op if absent.
    pub fn cancel(&mut self, fd: RawFd) {
        let Some(&i) = self.index_of.get(&fd) else { return };
        self.remove_at(i);
    }

    fn remove_at(&mut self, i: usize) {
        let last = self.heap.len() - 1;
        self.heap.swap(i, last);
        let removed = self.heap.pop().unwrap();
        self.index_of.remove(&removed.fd);
        if i < self.heap.len() {
            self.index_of.insert(self.heap[i].fd, i);
            self.sift(i);
        }
    }

    fn sift(&mut self, i: usize) {
        if !self.sift_up(i) {
            self.sift_down(i);
        }
    }

    /// Returns `true` if the slot moved (and therefore sift_down is moot).
    fn sift_up(&mut self, mut i: usize) -> bool {
        let start = i;
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires_at <= self.heap[i].expires_at {
                break;
            }
            self.swap(parent, i);
            i = parent;
        }
        i != start
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let (left, right) = (2 * i + 1, 2 * i + 2);
            let mut smallest = i;
            if left < self.heap.len() && self.heap[left].expires_at < self.heap[smallest].expires_at
            {
                smallest = left;
            }
            if right < self.heap.len()
                && self.heap[right].expires_at < self.heap[smallest].expires_at
            {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index_of.insert(self.heap[a].fd, a);
        self.index_of.insert(self.heap[b].fd, b);
    }

    /// Pops and invokes every entry whose expiry has passed. Callbacks run
    /// with no internal lock held (the heap is a freestanding struct, not
    /// behind a mutex here -- callers owning a `Mutex<HeapTimer>` must drop
    /// the guard before invoking the callbacks this returns, or call this
    /// from the sole owning thread as the Reactor does).
    pub fn tick(&mut self) {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some(slot) = self.heap.first() {
            if slot.expires_at > now {
                break;
            }
            let last = self.heap.len() - 1;
            self.heap.swap(0, last);
            let mut slot = self.heap.pop().unwrap();
            self.index_of.remove(&slot.fd);
            if !self.heap.is_empty() {
                self.index_of.insert(self.heap[0].fd, 0);
                self.sift_down(0);
            }
            if let Some(cb) = slot.callback.take() {
                fired.push(cb);
            }
        }
        for cb in fired {
            cb();
        }
    }

    /// Ticks expired entries, then returns the wait budget until the next
    /// one fires (or `None` if the heap is now empty).
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.tick();
        self.heap.first().map(|slot| slot.expires_at.saturating_duration_since(Instant::now()))
    }
}
