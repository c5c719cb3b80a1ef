// SPDX-License-Identifier: MPL-2.0

//! The per-CPU run queue: an indexed 4-ary min-heap keyed by
//! `virtual_deadline`, with a back-map from thread to heap slot so that
//! `Update`/`Remove` run in `O(log n)` instead of a linear scan, per the
//! design notes' "indexed binary heap with a back-map" guidance.

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::ids::ThreadId;
use crate::thread::{RunState, ThreadState};
use crate::time::Instant;

const FANOUT: usize = 4;

struct Entry {
    deadline: u64,
    /// Monotonically increasing insertion sequence, used to break ties on
    /// deadline in FIFO order: ties are broken by insertion order.
    seq: u64,
    thread: Arc<ThreadState>,
}

/// The EEVDF run queue owned by one [`crate::cpu_entry::CpuEntry`].
pub struct RunQueue {
    heap: Vec<Entry>,
    index: HashMap<ThreadId, usize>,
    next_seq: u64,
    /// Smallest vruntime ever observed among queued threads. Monotone
    /// non-decreasing: retains its last value when the queue empties so a
    /// late arrival is not penalized with an oversized dowry.
    min_vruntime: u64,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
            next_seq: 0,
            min_vruntime: 0,
        }
    }

    pub fn min_vruntime(&self) -> u64 {
        self.min_vruntime
    }

    /// Folds the currently-running thread's *projected* vruntime into the
    /// cached minimum, so it reflects work in flight and not just work
    /// sitting in the heap.
    pub fn observe_running_vruntime(&mut self, vruntime: u64) {
        if self.heap.is_empty() {
            self.min_vruntime = self.min_vruntime.max(vruntime);
        } else {
            self.min_vruntime = self.min_vruntime.min(vruntime);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn count(&self) -> usize {
        self.heap.len()
    }

    pub fn insert(&mut self, thread: Arc<ThreadState>) {
        let (deadline, vruntime) = {
            let inner = thread.lock();
            (inner.virtual_deadline, inner.vruntime)
        };
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = self.heap.len();
        self.index.insert(thread.id, slot);
        self.heap.push(Entry {
            deadline,
            seq,
            thread,
        });
        self.sift_up(slot);

        self.min_vruntime = if self.heap.len() == 1 {
            self.min_vruntime.max(vruntime)
        } else {
            self.min_vruntime.min(vruntime)
        };
    }

    pub fn remove(&mut self, id: ThreadId) -> Option<Arc<ThreadState>> {
        let slot = self.index.remove(&id)?;
        let last = self.heap.len() - 1;
        self.heap.swap(slot, last);
        let removed = self.heap.pop().unwrap();
        if slot < self.heap.len() {
            self.index.insert(self.heap[slot].thread.id, slot);
            self.sift_down(slot);
            self.sift_up(slot);
        }
        Some(removed.thread)
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.index.contains_key(&id)
    }

    /// Re-keys a thread after its `virtual_deadline`/`vruntime` changed in
    /// place.
    pub fn update(&mut self, id: ThreadId) {
        let Some(&slot) = self.index.get(&id) else {
            return;
        };
        let (deadline, vruntime) = {
            let inner = self.heap[slot].thread.lock();
            (inner.virtual_deadline, inner.vruntime)
        };
        self.heap[slot].deadline = deadline;
        self.sift_down(slot);
        self.sift_up(slot);
        self.min_vruntime = self.min_vruntime.min(vruntime);
    }

    pub fn peek_minimum(&self) -> Option<Arc<ThreadState>> {
        self.heap.first().map(|e| e.thread.clone())
    }

    pub fn pop_minimum(&mut self) -> Option<Arc<ThreadState>> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let top = self.heap.pop().unwrap();
        self.index.remove(&top.thread.id);
        if !self.heap.is_empty() {
            self.index.insert(self.heap[0].thread.id, 0);
            self.sift_down(0);
        }
        Some(top.thread)
    }

    /// Best-effort top-k view in deadline order, used by the load balancer.
    /// Does not mutate the heap.
    pub fn peek_k(&self, k: usize) -> Vec<Arc<ThreadState>> {
        let mut indices: Vec<usize> = (0..self.heap.len()).collect();
        indices.sort_by(|&a, &b| {
            (self.heap[a].deadline, self.heap[a].seq).cmp(&(self.heap[b].deadline, self.heap[b].seq))
        });
        indices
            .into_iter()
            .take(k)
            .map(|i| self.heap[i].thread.clone())
            .collect()
    }

    /// EEVDF selection: among threads eligible at
    /// `now`, returns the smallest-deadline one without removing it. Returns
    /// `None` if nothing is eligible yet (caller runs the idle thread and
    /// re-arms for the earliest upcoming `eligible_time`).
    pub fn choose_next(&self, now: Instant) -> Option<Arc<ThreadState>> {
        let mut best: Option<(usize, u64, u64)> = None;
        for (i, entry) in self.heap.iter().enumerate() {
            let inner = entry.thread.lock();
            if inner.state != RunState::Ready {
                continue;
            }
            if inner.eligible_time > now {
                continue;
            }
            let key = (entry.deadline, entry.seq);
            match best {
                None => best = Some((i, key.0, key.1)),
                Some((_, d, s)) if key < (d, s) => best = Some((i, key.0, key.1)),
                _ => {}
            }
        }
        best.map(|(i, _, _)| self.heap[i].thread.clone())
    }

    /// Earliest `eligible_time` among queued threads, used to arm the idle
    /// re-check timer when nothing is eligible yet.
    pub fn earliest_eligible_time(&self) -> Option<Instant> {
        self.heap
            .iter()
            .map(|e| e.thread.lock().eligible_time)
            .min()
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / FANOUT;
            if self.key(parent) <= self.key(i) {
                break;
            }
            self.swap(parent, i);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let first_child = i * FANOUT + 1;
            if first_child >= self.heap.len() {
                break;
            }
            let last_child = (first_child + FANOUT).min(self.heap.len());
            let mut smallest = i;
            for c in first_child..last_child {
                if self.key(c) < self.key(smallest) {
                    smallest = c;
                }
            }
            if smallest == i {
                break;
            }
            self.swap(smallest, i);
            i = smallest;
        }
    }

    fn key(&self, i: usize) -> (u64, u64) {
        (self.heap[i].deadline, self.heap[i].seq)
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].thread.id, a);
        self.index.insert(self.heap[b].thread.id, b);
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ThreadId;

    fn make(id: u64, deadline: u64, vruntime: u64) -> Arc<ThreadState> {
        let t = ThreadState::new(ThreadId(id), 120, Instant(0));
        {
            let mut inner = t.lock();
            inner.virtual_deadline = deadline;
            inner.vruntime = vruntime;
        }
        t
    }

    #[test]
    fn pop_returns_smallest_deadline() {
        let mut rq = RunQueue::new();
        rq.insert(make(1, 30, 10));
        rq.insert(make(2, 10, 10));
        rq.insert(make(3, 20, 10));
        assert_eq!(rq.pop_minimum().unwrap().id, ThreadId(2));
        assert_eq!(rq.pop_minimum().unwrap().id, ThreadId(3));
        assert_eq!(rq.pop_minimum().unwrap().id, ThreadId(1));
        assert!(rq.is_empty());
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut rq = RunQueue::new();
        rq.insert(make(1, 10, 0));
        rq.insert(make(2, 10, 0));
        assert_eq!(rq.pop_minimum().unwrap().id, ThreadId(1));
        assert_eq!(rq.pop_minimum().unwrap().id, ThreadId(2));
    }

    #[test]
    fn update_rekeys_after_external_mutation() {
        let mut rq = RunQueue::new();
        let a = make(1, 50, 0);
        let b = make(2, 10, 0);
        rq.insert(a.clone());
        rq.insert(b);
        a.lock().virtual_deadline = 1;
        rq.update(ThreadId(1));
        assert_eq!(rq.pop_minimum().unwrap().id, ThreadId(1));
    }

    #[test]
    fn remove_keeps_heap_consistent() {
        let mut rq = RunQueue::new();
        for i in 0..20u64 {
            rq.insert(make(i, 100 - i, 0));
        }
        rq.remove(ThreadId(5));
        assert_eq!(rq.count(), 19);
        let mut last = 0u64;
        while let Some(t) = rq.pop_minimum() {
            let d = t.lock().virtual_deadline;
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn choose_next_skips_ineligible() {
        let mut rq = RunQueue::new();
        let a = make(1, 10, 0);
        a.lock().eligible_time = Instant(1000);
        let b = make(2, 20, 0);
        rq.insert(a);
        rq.insert(b);
        let chosen = rq.choose_next(Instant(0)).unwrap();
        assert_eq!(chosen.id, ThreadId(2));
    }
}
