//! The nine-level danger-priority queue set (spec §3.5).
//!
//! Each level is a FIFO with an auxiliary hash so a chunk already queued at
//! one level can be found and moved ("upgraded") to a more urgent level in
//! O(1) instead of scanning.

use std::collections::{HashMap, VecDeque};

use crate::ids::ChunkId;

pub const NUM_LEVELS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PriorityLevel {
    IoReady = 0,
    OnecopyHighgoal = 1,
    OnecopyAny = 2,
    OneregcopyPlusmfr = 3,
    Markedforremoval = 4,
    UnfinishedEc = 5,
    Undergoal = 6,
    Overgoal = 7,
    Wronglabels = 8,
}

impl PriorityLevel {
    pub fn index(self) -> usize {
        self as usize
    }

    pub const ALL: [PriorityLevel; NUM_LEVELS] = [
        PriorityLevel::IoReady,
        PriorityLevel::OnecopyHighgoal,
        PriorityLevel::OnecopyAny,
        PriorityLevel::OneregcopyPlusmfr,
        PriorityLevel::Markedforremoval,
        PriorityLevel::UnfinishedEc,
        PriorityLevel::Undergoal,
        PriorityLevel::Overgoal,
        PriorityLevel::Wronglabels,
    ];
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LevelCounters {
    pub enqueued: u64,
    pub popped: u64,
    pub removed: u64,
}

/// One FIFO-plus-hash level. The hash lets `upgrade`/`contains` run in O(1);
/// removed-but-not-yet-popped entries are skipped lazily at pop time rather
/// than spliced out of the deque.
#[derive(Debug, Default)]
struct Level {
    queue: VecDeque<ChunkId>,
    present: HashMap<ChunkId, bool>, // true while still logically queued
    counters: LevelCounters,
}

impl Level {
    fn push(&mut self, id: ChunkId) {
        if self.present.get(&id).copied().unwrap_or(false) {
            return;
        }
        self.present.insert(id, true);
        self.queue.push_back(id);
        self.counters.enqueued += 1;
    }

    fn remove(&mut self, id: ChunkId) -> bool {
        if let Some(present) = self.present.get_mut(&id) {
            if *present {
                *present = false;
                self.counters.removed += 1;
                return true;
            }
        }
        false
    }

    fn pop(&mut self) -> Option<ChunkId> {
        while let Some(id) = self.queue.pop_front() {
            if self.present.remove(&id) == Some(true) {
                self.counters.popped += 1;
                return Some(id);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.present.values().filter(|p| **p).count()
    }
}

/// The full nine-level set, capped in aggregate at `max_total` entries
/// (spec §3.5, default `PRIORITY_QUEUES_LENGTH` = 1 000 000). When an
/// insert at a higher-urgency level would exceed the cap, the lowest
/// non-empty, lower-urgency level is asked to drop its oldest item first.
pub struct DangerQueues {
    levels: [Level; NUM_LEVELS],
    max_total: usize,
    demotions: u64,
}

impl DangerQueues {
    pub fn new(max_total: usize) -> Self {
        DangerQueues {
            levels: Default::default(),
            max_total,
            demotions: 0,
        }
    }

    fn total_len(&self) -> usize {
        self.levels.iter().map(Level::len).sum()
    }

    /// Enqueue (or move) a chunk at the given priority level.
    pub fn push(&mut self, level: PriorityLevel, id: ChunkId) {
        // an upgrade: if already queued at a less-urgent level, drop it there first
        for l in PriorityLevel::ALL.iter().rev() {
            if *l == level {
                break;
            }
            self.levels[l.index()].remove(id);
        }
        if self.total_len() >= self.max_total {
            self.demote_one_below(level);
        }
        self.levels[level.index()].push(id);
    }

    /// Drop the oldest entry from the least-urgent non-empty level that is
    /// strictly below `level`, to make room.
    fn demote_one_below(&mut self, level: PriorityLevel) {
        for l in PriorityLevel::ALL.iter().rev() {
            if l.index() <= level.index() {
                break;
            }
            if self.levels[l.index()].pop().is_some() {
                self.demotions += 1;
                return;
            }
        }
    }

    pub fn pop(&mut self, level: PriorityLevel) -> Option<ChunkId> {
        self.levels[level.index()].pop()
    }

    pub fn remove(&mut self, level: PriorityLevel, id: ChunkId) -> bool {
        self.levels[level.index()].remove(id)
    }

    /// Remove a chunk from every level regardless of its current priority,
    /// used when a chunk leaves the registry entirely.
    pub fn remove_everywhere(&mut self, id: ChunkId) {
        for l in self.levels.iter_mut() {
            l.remove(id);
        }
    }

    pub fn len(&self, level: PriorityLevel) -> usize {
        self.levels[level.index()].len()
    }

    pub fn counters(&self, level: PriorityLevel) -> LevelCounters {
        self.levels[level.index()].counters
    }

    pub fn total(&self) -> usize {
        self.total_len()
    }

    pub fn demotions(&self) -> u64 {
        self.demotions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_moves_between_levels() {
        let mut q = DangerQueues::new(1000);
        q.push(PriorityLevel::Undergoal, ChunkId(1));
        q.push(PriorityLevel::OnecopyHighgoal, ChunkId(1));
        assert_eq!(q.len(PriorityLevel::Undergoal), 0);
        assert_eq!(q.len(PriorityLevel::OnecopyHighgoal), 1);
        assert_eq!(q.pop(PriorityLevel::OnecopyHighgoal), Some(ChunkId(1)));
    }

    #[test]
    fn duplicate_push_is_idempotent() {
        let mut q = DangerQueues::new(1000);
        q.push(PriorityLevel::Undergoal, ChunkId(5));
        q.push(PriorityLevel::Undergoal, ChunkId(5));
        assert_eq!(q.len(PriorityLevel::Undergoal), 1);
    }

    #[test]
    fn overflow_demotes_a_lower_priority_item() {
        let mut q = DangerQueues::new(1);
        q.push(PriorityLevel::Wronglabels, ChunkId(1));
        q.push(PriorityLevel::IoReady, ChunkId(2));
        assert_eq!(q.total(), 1);
        assert_eq!(q.demotions(), 1);
        assert_eq!(q.pop(PriorityLevel::IoReady), Some(ChunkId(2)));
    }

    #[test]
    fn remove_everywhere_clears_all_levels() {
        let mut q = DangerQueues::new(1000);
        q.push(PriorityLevel::Overgoal, ChunkId(3));
        q.remove_everywhere(ChunkId(3));
        assert_eq!(q.total(), 0);
    }
}
