//! Danger-priority classification and the per-chunk decision engine
//! (spec §4.4, §4.5).
//!
//! The full decision engine in spec.md's source material carries close to
//! ninety distinct fail-reason values driving per-class/per-level fail
//! counters. This module keeps the ones that are operator-visible and
//! actually branch scheduling behaviour (see `FailReason`) and folds the
//! rest into `Other`; see DESIGN.md for why the long tail isn't worth
//! enumerating by name in a from-scratch rewrite.

use crate::chunk::{ChunkRecord, OperationKind, PartId, ReplicaState, StorageMode};
use crate::guards::{DelayProtector, ReplicationLock};
use crate::priority_queue::PriorityLevel;

/// `reg_goal_equiv`/`all_goal_equiv` plus the storage mode, recomputed from
/// the replica list each time the decision engine looks at a chunk
/// (spec §4.5 Phase A).
#[derive(Debug, Clone, Copy, Default)]
pub struct Inventory {
    pub all_goal_equiv: u32,
    pub reg_goal_equiv: u32,
    pub storage_mode: StorageMode,
    pub one_valid_copy: bool,
    pub mixes_modes: bool,
    pub duplicate_parts: bool,
    pub part_share_server: bool,
}

/// Recompute goal-equivalents and storage mode from the live replica list
/// (spec §4.5 Phase A, §4.4).
pub fn compute_inventory(chunk: &ChunkRecord, ec_data_parts: u8) -> Inventory {
    let mut all = 0u32;
    let mut reg = 0u32;
    let mut copy_count = 0u32;
    let mut ec4_count = 0u32;
    let mut ec8_count = 0u32;
    let mut seen_parts: Vec<(u16, PartId)> = Vec::new();
    let mut duplicate_parts = false;
    let mut server_part_counts: std::collections::HashMap<u16, u32> = std::collections::HashMap::new();

    for r in chunk.replicas.iter() {
        if !r.state.is_valid_now() {
            continue;
        }
        if r.part_id.is_copy() {
            copy_count += 1;
        } else if r.part_id.is_ec4() {
            ec4_count += 1;
        } else if r.part_id.is_ec8() {
            ec8_count += 1;
        }
        let key = (r.server_id.0, r.part_id);
        if seen_parts.contains(&key) {
            duplicate_parts = true;
        } else {
            seen_parts.push(key);
        }
        *server_part_counts.entry(r.server_id.0).or_insert(0) += 1;
        all += 1;
        if !r.state.is_marked_for_removal() {
            reg += 1;
        }
    }

    let part_share_server = server_part_counts.values().any(|&n| n > 1);
    let mixes_modes = [copy_count > 0, ec4_count > 0, ec8_count > 0]
        .iter()
        .filter(|b| **b)
        .count()
        > 1;

    let storage_mode = if ec8_count > 0 {
        StorageMode::Ec8
    } else if ec4_count > 0 {
        StorageMode::Ec4
    } else {
        StorageMode::Copies
    };

    // EC redundancy contributes unique_servers - D beyond the base unit,
    // capped at popcount - D (spec §4.5 Phase A).
    let ec_extra = |unique: u32, d: u32| -> u32 { unique.saturating_sub(d) };
    let (all_eq, reg_eq) = match storage_mode {
        StorageMode::Copies => (copy_count, copy_count),
        StorageMode::Ec4 | StorageMode::Ec8 => {
            let d = ec_data_parts as u32;
            let unique_all = all;
            let unique_reg = reg;
            (1 + ec_extra(unique_all, d), 1 + ec_extra(unique_reg, d))
        }
    };

    Inventory {
        all_goal_equiv: all_eq,
        reg_goal_equiv: reg_eq,
        storage_mode,
        one_valid_copy: copy_count == 1 && ec4_count == 0 && ec8_count == 0,
        mixes_modes,
        duplicate_parts,
        part_share_server,
    }
}

/// Adjust the configured goal down when fewer than `G + D - 1` servers are
/// available, for EC storage classes (spec §4.4).
pub fn adjusted_goal(configured_goal: u8, available_servers: u32, ec_data_parts: Option<u8>) -> u8 {
    match ec_data_parts {
        None => configured_goal,
        Some(d) => {
            let needed = configured_goal as u32 + d as u32 - 1;
            if available_servers < needed {
                (available_servers.saturating_sub(d as u32 - 1)).min(configured_goal as u32) as u8
            } else {
                configured_goal
            }
        }
    }
}

/// The literal classification table from spec §4.4. `labels_ok` and
/// `labels_repairable` are the two expensive checks the spec gates behind a
/// parameter (`check_labels`) so the hot re-eval path can skip them.
pub fn danger_priority(
    inv: &Inventory,
    goal: u8,
    wrong_storage_mode: bool,
    check_labels: bool,
    labels_ok: bool,
    labels_repairable: bool,
) -> Option<PriorityLevel> {
    let goal = goal as u32;
    if inv.one_valid_copy && goal >= 3 {
        return Some(PriorityLevel::OnecopyHighgoal);
    }
    if inv.one_valid_copy && goal == 2 {
        return Some(PriorityLevel::OnecopyAny);
    }
    if inv.reg_goal_equiv <= 1 && inv.all_goal_equiv > inv.reg_goal_equiv {
        return Some(PriorityLevel::OneregcopyPlusmfr);
    }
    if inv.reg_goal_equiv < goal && inv.all_goal_equiv > inv.reg_goal_equiv {
        return Some(PriorityLevel::Markedforremoval);
    }
    if inv.mixes_modes {
        return Some(PriorityLevel::UnfinishedEc);
    }
    if inv.reg_goal_equiv < goal {
        return Some(PriorityLevel::Undergoal);
    }
    if wrong_storage_mode || inv.all_goal_equiv > inv.reg_goal_equiv {
        return Some(PriorityLevel::Undergoal);
    }
    if inv.reg_goal_equiv > goal || inv.duplicate_parts || inv.part_share_server {
        return Some(PriorityLevel::Overgoal);
    }
    if check_labels && !labels_ok && labels_repairable {
        return Some(PriorityLevel::Wronglabels);
    }
    None
}

/// Replication budget class from danger priority (spec §4.5 Phase E).
pub fn budget_class(level: Option<PriorityLevel>) -> usize {
    match level {
        Some(PriorityLevel::IoReady) | Some(PriorityLevel::OnecopyHighgoal) => 0,
        Some(PriorityLevel::OnecopyAny) | Some(PriorityLevel::OneregcopyPlusmfr) => 1,
        Some(PriorityLevel::Markedforremoval)
        | Some(PriorityLevel::UnfinishedEc)
        | Some(PriorityLevel::Undergoal)
        | Some(PriorityLevel::Overgoal) => 2,
        Some(PriorityLevel::Wronglabels) => 3,
        None => 4,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    NoCandidateServer,
    LabelsUnsatisfiable,
    ReadLimitReached,
    WriteLimitReached,
    DeleteThrottled,
    LockHeld,
    Protected,
    NoProgress,
    Other,
}

/// What the decision engine decided to do with a chunk on this pass
/// (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    /// Nothing to do; chunk is quiescent (R2).
    Quiescent,
    /// Mid-operation or locked; re-enqueue for later (Phase C).
    Deferred,
    /// A replication/recover/join/split/localsplit job was issued
    /// elsewhere; caller already called `operation::issue`.
    Issued,
    /// Wanted to act but couldn't (see `FailReason`).
    Failed(FailReason),
}

/// Phase C: the short-circuit check. Returns `true` if the chunk should be
/// deferred without further work this tick.
pub fn should_defer(chunk: &ChunkRecord, now: i64, replication_lock: &ReplicationLock) -> bool {
    !chunk.operation.is_none() || chunk.locked_to >= now || replication_lock.is_locked(chunk.chunk_id, now)
}

/// Phase D (a practical subset): is it safe to delete one INVALID/WVER/
/// TDWVER replica right now? Safe if enough good replicas remain, or the
/// chunk is unreferenced entirely.
pub fn can_delete_stale_replica(inv: &Inventory, goal: u8, chunk_referenced: bool) -> bool {
    !chunk_referenced || inv.reg_goal_equiv >= goal as u32
}

/// Phase D: is this chunk simply unused and collectible (no file refs,
/// nothing locked)?
pub fn is_collectible(chunk: &ChunkRecord, now: i64) -> bool {
    chunk.file_head == 0 && chunk.locked_to < now && chunk.replicas.is_empty()
}

/// Phase B (partial): given WVER/TDWVER replicas and the chunk's recorded
/// version, attempt the version fix-up described in spec §4.5 Phase B:
/// accept `bestversion` as correct if it's exactly `version ± 1` and a
/// majority of WVER replicas agree.
pub fn version_fix(chunk: &ChunkRecord) -> Option<u32> {
    let mut counts: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
    let mut wver_total = 0u32;
    for r in chunk.replicas.iter() {
        if r.state.is_wrong_version() {
            *counts.entry(r.version).or_insert(0) += 1;
            wver_total += 1;
        }
    }
    let has_valid = chunk.replicas.iter().any(|r| r.state.is_valid_now());
    if has_valid || wver_total == 0 {
        return None;
    }
    let (&best_version, &best_count) = counts.iter().max_by_key(|(_, c)| **c)?;
    let diff = (best_version as i64 - chunk.version as i64).abs();
    if diff == 1 && best_count * 2 >= wver_total {
        Some(best_version)
    } else {
        None
    }
}

/// Phase A's retroactive version rollback: for `SET_VERSION`/`TRUNCATE`
/// with no remaining `VALID` copies, replicas stuck at `version - 1` are
/// accepted as `VALID` on the theory the version bump itself never landed
/// anywhere (spec §4.5 Phase A). Spec.md calls this out as intentionally
/// asymmetric: `DUPLICATE`/`DUPTRUNC` never get this treatment, since a
/// duplicate's old chunk is supposed to stay exactly as it was and a
/// missing bump there just means the duplicate failed outright. Returns
/// `true` if a rollback was applied.
pub fn retroactive_accept_stale_version(chunk: &mut ChunkRecord) -> bool {
    if !matches!(chunk.operation, OperationKind::SetVersion | OperationKind::Truncate) {
        return false;
    }
    let has_valid = chunk.replicas.iter().any(|r| r.state.is_valid_now());
    if has_valid {
        return false;
    }
    let target_version = chunk.version.saturating_sub(1);
    let any_at_target = chunk
        .replicas
        .iter()
        .any(|r| r.state.is_wrong_version() && r.version == target_version);
    if !any_at_target {
        return false;
    }
    for r in chunk.replicas.iter_mut() {
        if r.state.is_wrong_version() && r.version == target_version {
            r.state = if r.state.is_marked_for_removal() {
                ReplicaState::TdValid
            } else {
                ReplicaState::Valid
            };
        }
    }
    chunk.version = target_version;
    chunk.operation = OperationKind::None;
    true
}

/// Touch the delay protector after any replication is issued, starting
/// the chunk's `CHUNK_PROTECTION_SECONDS` window.
pub fn note_replicated(chunk_id: crate::ids::ChunkId, now: i64, protector: &mut DelayProtector) {
    protector.touch(chunk_id, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Replica, PART_COPY};
    use crate::ids::{ChunkId, ServerId, SclassId};

    fn chunk_with_copies(n: u32) -> ChunkRecord {
        let mut c = ChunkRecord::new(ChunkId(1), 1, SclassId(0));
        for i in 0..n {
            c.replicas.upsert(Replica {
                server_id: ServerId(i as u16),
                part_id: PART_COPY,
                state: ReplicaState::Valid,
                version: 1,
            });
        }
        c
    }

    #[test]
    fn onecopy_highgoal_when_single_copy_and_goal_ge_3() {
        let c = chunk_with_copies(1);
        let inv = compute_inventory(&c, 0);
        assert_eq!(
            danger_priority(&inv, 3, false, false, true, false),
            Some(PriorityLevel::OnecopyHighgoal)
        );
    }

    #[test]
    fn satisfied_chunk_has_no_priority() {
        let c = chunk_with_copies(2);
        let inv = compute_inventory(&c, 0);
        assert_eq!(danger_priority(&inv, 2, false, false, true, false), None);
    }

    #[test]
    fn overgoal_detected() {
        let c = chunk_with_copies(3);
        let inv = compute_inventory(&c, 0);
        assert_eq!(
            danger_priority(&inv, 2, false, false, true, false),
            Some(PriorityLevel::Overgoal)
        );
    }

    #[test]
    fn budget_class_matches_table() {
        assert_eq!(budget_class(Some(PriorityLevel::OnecopyHighgoal)), 0);
        assert_eq!(budget_class(Some(PriorityLevel::OnecopyAny)), 1);
        assert_eq!(budget_class(Some(PriorityLevel::Undergoal)), 2);
        assert_eq!(budget_class(Some(PriorityLevel::Wronglabels)), 3);
        assert_eq!(budget_class(None), 4);
    }

    #[test]
    fn adjusted_goal_shrinks_with_few_servers() {
        assert_eq!(adjusted_goal(3, 10, Some(4)), 3);
        assert_eq!(adjusted_goal(3, 4, Some(4)), 1);
    }

    #[test]
    fn version_fix_accepts_adjacent_majority() {
        let mut c = ChunkRecord::new(ChunkId(1), 5, SclassId(0));
        for i in 0..3u16 {
            c.replicas.upsert(Replica {
                server_id: ServerId(i),
                part_id: PART_COPY,
                state: ReplicaState::WVer,
                version: 6,
            });
        }
        assert_eq!(version_fix(&c), Some(6));
    }

    #[test]
    fn is_collectible_requires_no_refs_lock_or_replicas() {
        let c = ChunkRecord::new(ChunkId(1), 1, SclassId(0));
        assert!(is_collectible(&c, 100));
    }

    #[test]
    fn retroactive_rollback_applies_to_set_version_only() {
        let mut c = ChunkRecord::new(ChunkId(1), 6, SclassId(0));
        c.operation = OperationKind::SetVersion;
        c.replicas.upsert(Replica {
            server_id: ServerId(1),
            part_id: PART_COPY,
            state: ReplicaState::WVer,
            version: 5,
        });
        assert!(retroactive_accept_stale_version(&mut c));
        assert_eq!(c.version, 5);
        assert_eq!(
            c.replicas.find(ServerId(1), PART_COPY).unwrap().state,
            ReplicaState::Valid
        );
        assert_eq!(c.operation, OperationKind::None);
    }

    #[test]
    fn retroactive_rollback_never_applies_to_duplicate() {
        let mut c = ChunkRecord::new(ChunkId(1), 6, SclassId(0));
        c.operation = OperationKind::Duplicate;
        c.replicas.upsert(Replica {
            server_id: ServerId(1),
            part_id: PART_COPY,
            state: ReplicaState::WVer,
            version: 5,
        });
        assert!(!retroactive_accept_stale_version(&mut c));
        assert_eq!(c.version, 6);
    }
}
