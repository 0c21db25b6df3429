use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    time::{Duration, Instant},
};

use crate::TimerCallback;

/// Handle for a scheduled timer. Never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

struct Entry {
    deadline: Instant,
    /// Registration order; ties on `deadline` fire in `seq` order.
    seq: u64,
    id: u64,
    interval: Option<Duration>,
    cb: TimerCallback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the BinaryHeap pops the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A due timer handed back to the driver for dispatch.
pub(crate) struct Due {
    pub cb: TimerCallback,
}

/// Min-heap timer store shared by both drivers.
///
/// Cancellation tombstones the id instead of digging through the heap, so
/// cancelling from inside the firing callback is safe. Persistent entries
/// are re-armed at `deadline + interval` *before* their callback runs; an
/// overrunning callback therefore delays the next firing but cannot lose it.
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Entry>,
    live: HashSet<u64>,
    next_id: u64,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), live: HashSet::new(), next_id: 1, next_seq: 0 }
    }

    pub fn schedule(
        &mut self,
        after: Duration,
        interval: Option<Duration>,
        cb: TimerCallback,
    ) -> TimerId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(id);
        self.heap.push(Entry { deadline: Instant::now() + after, seq, id, interval, cb });
        TimerId(id)
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.live.remove(&id.0)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    pub fn count(&self) -> usize {
        self.live.len()
    }

    /// Time until the earliest live deadline. Discards tombstoned heads.
    pub fn until_next(&mut self, now: Instant) -> Option<Duration> {
        while let Some(head) = self.heap.peek() {
            if self.live.contains(&head.id) {
                return Some(head.deadline.saturating_duration_since(now));
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every entry due at `now`, re-arming persistent ones.
    pub fn collect_due(&mut self, now: Instant) -> Vec<Due> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry");
            if !self.live.contains(&entry.id) {
                continue;
            }
            match entry.interval {
                Some(interval) => {
                    due.push(Due { cb: entry.cb.clone() });
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.heap.push(Entry {
                        deadline: entry.deadline + interval,
                        seq,
                        id: entry.id,
                        interval: entry.interval,
                        cb: entry.cb,
                    });
                }
                None => {
                    self.live.remove(&entry.id);
                    due.push(Due { cb: entry.cb });
                }
            }
        }
        due
    }
}
