use crate::executor::TaskHandle;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::Duration;

#[derive(Debug)]
struct Entry {
    due: Duration,
    seq: u64,
    handle: TaskHandle,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap: earliest due, then lowest seq, compares greatest
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

const COMPACT_MIN: usize = 64;

/// Per-worker schedule: tasks keyed by due time, measured from the worker's
/// epoch. Entries with the same due time come out in push order.
#[derive(Debug)]
pub(crate) struct DelayQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    compact_at: usize,
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            compact_at: COMPACT_MIN,
        }
    }

    pub fn push(&mut self, due: Duration, handle: TaskHandle) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { due, seq, handle });
    }

    /// Pops the head if it is due at `now`, or if it was cancelled (no point
    /// waiting for the due time of work that will never run).
    pub fn pop_ready(&mut self, now: Duration) -> Option<TaskHandle> {
        let head = self.heap.peek()?;
        if head.due <= now || head.handle.is_cancelled() {
            self.heap.pop().map(|e| e.handle)
        } else {
            None
        }
    }

    /// Drops cancelled entries from anywhere in the heap once it has doubled
    /// since the last sweep. Returns how many were dropped.
    ///
    /// `pop_ready` only sees the head, so without this a live far-future head
    /// keeps every cancelled entry behind it alive.
    pub fn compact(&mut self) -> usize {
        if self.heap.len() < self.compact_at {
            return 0;
        }

        let before = self.heap.len();
        self.heap.retain(|e| !e.handle.is_cancelled());
        self.compact_at = (self.heap.len() * 2).max(COMPACT_MIN);
        before - self.heap.len()
    }

    pub fn next_due(&self) -> Option<Duration> {
        self.heap.peek().map(|e| e.due)
    }

    /// Cancels every queued task. The entries stay in the heap and are
    /// discarded by `pop_ready`.
    pub fn cancel_all(&self) -> usize {
        self.heap.iter().filter(|e| e.handle.cancel()).count()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
