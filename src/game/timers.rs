//! Per-match deadline queue
//!
//! All one-shot match timers (AFK removal, respawn, round reset) live in one
//! min-heap checked at the top of each driver update. Cancellation removes
//! the entry's payload; stale heap nodes are skipped when popped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

pub type TimerId = u64;

/// What to do when a deadline fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// AFK warning expired without input; drop the session
    AfkRemoval { player_match_id: String },
    /// Revive a dead player at the spawn point
    Respawn { player_match_id: String },
    /// Start the next round after `gameOver`
    MatchReset,
}

pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(u64, TimerId)>>,
    entries: HashMap<TimerId, TimerKind>,
    next_id: TimerId,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, deadline_ms: u64, kind: TimerKind) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline_ms, id)));
        self.entries.insert(id, kind);
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&id);
    }

    /// Pop every timer whose deadline has passed, in deadline order.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<(TimerId, TimerKind)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now_ms {
                break;
            }
            self.heap.pop();
            if let Some(kind) = self.entries.remove(&id) {
                due.push((id, kind));
            }
        }
        due
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.entries.clear();
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}
