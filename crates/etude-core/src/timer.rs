// src/timer.rs
//! Indexed binary min-heap of connection deadlines.
//!
//! Unlike a plain `BinaryHeap`, every node's slot is tracked in an
//! `id -> index` map, so an existing deadline can be pushed back or removed
//! in O(log n) without a linear search and without lazy tombstones.
//!
//! # Complexity
//!
//! - `add` / `adjust` / `cancel`: O(log n)
//! - `tick`: O(k log n) for k expired nodes
//! - `next_tick`: O(1) after the sweep

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type TimerId = u64;

/// Fired at most once, on the thread that drives the heap.
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

pub struct TimerNode {
    pub id: TimerId,
    pub expires: Instant,
    callback: TimeoutCallback,
}

impl std::fmt::Debug for TimerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerNode")
            .field("id", &self.id)
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    slots: HashMap<TimerId, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            slots: HashMap::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Earliest deadline currently tracked.
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.first().map(|node| node.expires)
    }

    /// Track `id` to expire `timeout` from now.
    ///
    /// An id that is already present is updated in place (new deadline and
    /// callback) so there is never more than one node per id.
    pub fn add(&mut self, id: TimerId, timeout: Duration, callback: TimeoutCallback) {
        self.add_at(id, Instant::now() + timeout, callback);
    }

    pub fn add_at(&mut self, id: TimerId, expires: Instant, callback: TimeoutCallback) {
        match self.slots.get(&id).copied() {
            Some(i) => {
                let old = self.heap[i].expires;
                self.heap[i].expires = expires;
                self.heap[i].callback = callback;
                self.resift(i, old);
            }
            None => {
                let i = self.heap.len();
                self.slots.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    callback,
                });
                self.sift_up(i);
            }
        }
    }

    /// Move an existing deadline to `timeout` from now.
    /// Returns `false` if `id` is not tracked.
    pub fn adjust(&mut self, id: TimerId, timeout: Duration) -> bool {
        self.adjust_at(id, Instant::now() + timeout)
    }

    pub fn adjust_at(&mut self, id: TimerId, expires: Instant) -> bool {
        let Some(&i) = self.slots.get(&id) else {
            return false;
        };
        let old = self.heap[i].expires;
        self.heap[i].expires = expires;
        self.resift(i, old);
        true
    }

    /// Drop a node without firing it.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.slots.get(&id).copied() {
            Some(i) => {
                self.remove(i);
                true
            }
            None => false,
        }
    }

    /// Remove a node and fire its callback immediately.
    pub fn do_work(&mut self, id: TimerId) -> bool {
        match self.slots.get(&id).copied() {
            Some(i) => {
                let node = self.remove(i);
                (node.callback)();
                true
            }
            None => false,
        }
    }

    /// Fire every node whose deadline has passed.
    pub fn tick(&mut self) -> usize {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.remove(0);
            (node.callback)();
            fired += 1;
        }
        fired
    }

    /// Remove the root without firing it.
    pub fn pop(&mut self) -> Option<TimerNode> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove(0))
    }

    /// Sweep expired nodes, then report how long until the next deadline.
    /// `None` means no timer is pending.
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.next_tick_at(Instant::now())
    }

    pub fn next_tick_at(&mut self, now: Instant) -> Option<Duration> {
        self.tick_at(now);
        self.peek_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
    }

    fn resift(&mut self, i: usize, old: Instant) {
        if self.heap[i].expires > old {
            self.sift_down(i);
        } else {
            self.sift_up(i);
        }
    }

    fn remove(&mut self, i: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        if i < last {
            self.swap(i, last);
        }
        let node = self.heap.pop().expect("heap is non-empty");
        self.slots.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i) {
            self.sift_up(i);
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns whether the node moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        loop {
            let mut child = 2 * i + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.slots.insert(self.heap[i].id, i);
        self.slots.insert(self.heap[j].id, j);
    }
}
