//! Tunables (spec §6.4). Parsing from env/file is a host-process concern
//! (out of scope, spec §1); this is just the typed, defaulted struct the
//! host fills in and hands to [`crate::core::Core`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub soft_del_limit: f64,
    pub hard_del_limit: f64,
    /// Per-class write-replication concurrency limits, classes 0..4.
    pub write_rep_limit: [u32; 5],
    /// Per-class read-replication concurrency limits, classes 0..4.
    pub read_rep_limit: [u32; 5],
    pub loop_min_time_secs: u32,
    pub loop_max_cps: u32,
    pub acceptable_percentage_difference: f64,
    pub replications_delay_init_secs: u32,
    pub replications_respect_topology: TopologyMode,
    pub creations_respect_topology_threshold: Option<u32>,
    pub chunk_protection_secs: i64,
    pub priority_queue_length: usize,
    pub unique_mode: UniqueMode,
    pub jobs_timer_ms: u32,
    pub replock_timeout_secs: i64,
    pub lock_timeout_secs: i64,
    pub hash_cpt_max: usize,
    pub max_fails_per_class: u32,
    pub fail_class_counter_reset_calls: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyMode {
    None,
    MinDistance,
    RackSort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UniqueMode {
    None,
    NoSameIp,
    NoSameRack,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            soft_del_limit: 10.0,
            hard_del_limit: 25.0,
            write_rep_limit: [2, 1, 1, 4, 4],
            read_rep_limit: [10, 5, 2, 5, 10],
            loop_min_time_secs: 300,
            loop_max_cps: 100_000,
            acceptable_percentage_difference: 1.0,
            replications_delay_init_secs: 60,
            replications_respect_topology: TopologyMode::None,
            creations_respect_topology_threshold: None,
            chunk_protection_secs: 15,
            priority_queue_length: 1_000_000,
            unique_mode: UniqueMode::None,
            jobs_timer_ms: 5,
            replock_timeout_secs: 120,
            lock_timeout_secs: 120,
            hash_cpt_max: 2000,
            max_fails_per_class: 10,
            fail_class_counter_reset_calls: 100,
        }
    }
}

impl Tunables {
    /// Clamp to the documented bounds (spec §4.3, §6.4) after deserializing
    /// operator-supplied overrides.
    pub fn clamped(mut self) -> Self {
        self.jobs_timer_ms = self.jobs_timer_ms.clamp(1, 50);
        self.loop_min_time_secs = self.loop_min_time_secs.clamp(60, 7200);
        self.loop_max_cps = self.loop_max_cps.clamp(10_000, 10_000_000);
        self.acceptable_percentage_difference = self.acceptable_percentage_difference.clamp(0.1, 10.0);
        self.hard_del_limit = self.hard_del_limit.max(self.soft_del_limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let t = Tunables::default();
        assert_eq!(t.soft_del_limit, 10.0);
        assert_eq!(t.hard_del_limit, 25.0);
        assert_eq!(t.loop_min_time_secs, 300);
        assert_eq!(t.priority_queue_length, 1_000_000);
    }

    #[test]
    fn clamp_enforces_bounds() {
        let t = Tunables {
            jobs_timer_ms: 999,
            loop_min_time_secs: 1,
            ..Tunables::default()
        }
        .clamped();
        assert_eq!(t.jobs_timer_ms, 50);
        assert_eq!(t.loop_min_time_secs, 60);
    }
}
