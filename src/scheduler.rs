//! The mechanical parts of the scheduling tick (spec §4.3, §4.9): per-class
//! fail counters, the deterministic registry sweep stepping pattern, and
//! the AIMD deletion-throttle controller. The orchestration that ties
//! these to the decision engine and priority queues lives in `core.rs`;
//! this module holds the pieces that are pure state machines and so are
//! worth testing in isolation.

use std::collections::HashMap;

use crate::ids::SclassId;

/// Per-(storage-class, priority-level) consecutive no-progress counter
/// (spec §4.3). After `max_fails` in a row, further pops of that class at
/// that level are skipped until the next reset.
#[derive(Debug, Default)]
pub struct FailCounterTable {
    counts: HashMap<(SclassId, u8), u32>,
    calls_since_reset: u32,
}

impl FailCounterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_fail(&mut self, sclass: SclassId, level: u8) {
        *self.counts.entry((sclass, level)).or_insert(0) += 1;
    }

    pub fn mark_progress(&mut self, sclass: SclassId, level: u8) {
        self.counts.insert((sclass, level), 0);
    }

    pub fn should_skip(&self, sclass: SclassId, level: u8, max_fails: u32) -> bool {
        self.counts.get(&(sclass, level)).copied().unwrap_or(0) >= max_fails
    }

    /// Call once per tick; clears every counter every `reset_every` calls.
    pub fn tick(&mut self, reset_every: u32) {
        self.calls_since_reset += 1;
        if self.calls_since_reset >= reset_every {
            self.counts.clear();
            self.calls_since_reset = 0;
        }
    }
}

/// AIMD controller for `TmpMaxDel` (spec §4.9): additive-increase,
/// multiplicative... actually multiplicative both ways, bounded by the
/// configured soft/hard limits. Adjusted every 16 completed loop-end
/// events.
#[derive(Debug, Clone, Copy)]
pub struct DeletionThrottle {
    pub current: f64,
    soft_limit: f64,
    hard_limit: f64,
    loop_ends_since_adjust: u32,
}

const ADJUST_EVERY_LOOP_ENDS: u32 = 16;

impl DeletionThrottle {
    pub fn new(soft_limit: f64, hard_limit: f64) -> Self {
        DeletionThrottle {
            current: soft_limit,
            soft_limit,
            hard_limit,
            loop_ends_since_adjust: 0,
        }
    }

    /// Call once per completed loop-end event (spec §4.3's "completed
    /// sweep"). `delnotdone`/`deldone` and `todeletecount` deltas are the
    /// caller's tallies for that sweep.
    pub fn on_loop_end(&mut self, delnotdone: u32, deldone: u32, todeletecount_rose: bool, todeletecount_fell: bool) {
        self.loop_ends_since_adjust += 1;
        if self.loop_ends_since_adjust < ADJUST_EVERY_LOOP_ENDS {
            return;
        }
        self.loop_ends_since_adjust = 0;
        if delnotdone > deldone && todeletecount_rose {
            self.current = (self.current * 1.5).min(self.hard_limit);
        } else if todeletecount_fell && self.current > self.soft_limit {
            self.current = (self.current / 1.5).max(self.soft_limit);
        }
    }
}

/// The deterministic full-table walk (spec §4.3): a step size from
/// `{1, 16, 256, ...}` that, combined with an odd table size, eventually
/// visits every bucket without repeats before a full pass completes.
pub struct SweepCursor {
    pos: usize,
    step: usize,
    bucket_count: usize,
    visited_this_pass: usize,
}

impl SweepCursor {
    pub fn new(bucket_count: usize) -> Self {
        SweepCursor {
            pos: 0,
            step: 1,
            bucket_count: bucket_count.max(1),
            visited_this_pass: 0,
        }
    }

    /// Resize to match a registry that has grown or shrunk since the last
    /// sweep; keeps the current position (mod the new size) rather than
    /// restarting.
    pub fn resize(&mut self, bucket_count: usize) {
        let bucket_count = bucket_count.max(1);
        self.pos %= bucket_count;
        self.bucket_count = bucket_count;
    }

    /// How many buckets to visit this tick, given the configured minimum
    /// full-pass duration and the tick rate.
    pub fn buckets_per_tick(&self, loop_min_time_secs: u32, ticks_per_second: u32) -> usize {
        let denom = (loop_min_time_secs as u64 * ticks_per_second as u64).max(1);
        (1 + self.bucket_count as u64 / denom) as usize
    }

    /// Advance by `n` buckets, returning the bucket indices visited (in
    /// order) and whether this call completed a full pass.
    pub fn advance(&mut self, n: usize) -> (Vec<usize>, bool) {
        let mut visited = Vec::with_capacity(n);
        let mut completed = false;
        for _ in 0..n {
            visited.push(self.pos);
            self.pos = (self.pos + self.step) % self.bucket_count;
            self.visited_this_pass += 1;
            if self.visited_this_pass >= self.bucket_count {
                self.visited_this_pass = 0;
                completed = true;
            }
        }
        (visited, completed)
    }
}

/// What-was-done-this-pass vs previous-pass counters (spec §4.3).
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopInfo {
    pub done_this_pass: u64,
    pub done_previous_pass: u64,
}

impl LoopInfo {
    pub fn record(&mut self, n: u64) {
        self.done_this_pass += n;
    }

    pub fn rotate(&mut self) {
        self.done_previous_pass = self.done_this_pass;
        self.done_this_pass = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_counter_skips_after_threshold_and_resets() {
        let mut t = FailCounterTable::new();
        for _ in 0..3 {
            t.mark_fail(SclassId(1), 6);
        }
        assert!(t.should_skip(SclassId(1), 6, 3));
        t.mark_progress(SclassId(1), 6);
        assert!(!t.should_skip(SclassId(1), 6, 3));
    }

    #[test]
    fn throttle_increases_then_decreases() {
        let mut throttle = DeletionThrottle::new(10.0, 25.0);
        for _ in 0..16 {
            throttle.on_loop_end(5, 1, true, false);
        }
        assert_eq!(throttle.current, 15.0);
        for _ in 0..16 {
            throttle.on_loop_end(0, 0, false, true);
        }
        assert_eq!(throttle.current, 10.0);
    }

    #[test]
    fn throttle_never_exceeds_hard_limit() {
        let mut throttle = DeletionThrottle::new(10.0, 11.0);
        for _ in 0..32 {
            throttle.on_loop_end(5, 1, true, false);
        }
        assert_eq!(throttle.current, 11.0);
    }

    #[test]
    fn sweep_cursor_completes_a_full_pass() {
        let mut cursor = SweepCursor::new(10);
        let mut completed_any = false;
        for _ in 0..10 {
            let (_, completed) = cursor.advance(1);
            completed_any |= completed;
        }
        assert!(completed_any);
    }

    #[test]
    fn loop_info_rotates_counts() {
        let mut info = LoopInfo::default();
        info.record(5);
        info.rotate();
        assert_eq!(info.done_previous_pass, 5);
        assert_eq!(info.done_this_pass, 0);
    }
}
