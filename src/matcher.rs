//! Placement matcher: assigns candidate chunk servers to label slots
//! (spec §4.6).
//!
//! Candidates that would violate the storage class's uniqueness mode (no
//! two replicas sharing an IP, or a rack) are first collapsed into groups;
//! the matcher then runs a maximum bipartite matching between label slots
//! and groups. This is Kuhn's augmenting-path algorithm — the same
//! left-vertex-at-a-time DFS search that Hopcroft–Karp's BFS phase batches
//! across all free left vertices at once. With slot counts bounded by a
//! storage class's goal (single digits in practice) the extra BFS
//! bookkeeping buys nothing, so only the augmenting-path core is kept.

use crate::config::UniqueMode;
use crate::ids::ServerId;
use crate::labels::LabelExpr;
use crate::storage_class::LabelsMode;

#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub server_id: ServerId,
    pub ip: u32,
    pub rack_id: u32,
    pub label_mask: u32,
}

/// A group key collapses candidates that are *interchangeable* for
/// placement purposes. With `uniq_mask == 0` and no ip/rack constraint
/// there is nothing to collapse on, so each server stays its own group
/// (keyed by id) rather than all colliding on the same all-zero key.
fn group_key(c: &Candidate, mode: UniqueMode, uniq_mask: u32) -> u64 {
    match mode {
        UniqueMode::NoSameIp => c.ip as u64,
        UniqueMode::NoSameRack => c.rack_id as u64,
        UniqueMode::None if uniq_mask != 0 => (c.label_mask & uniq_mask) as u64,
        UniqueMode::None => 0x1_0000_0000 | c.server_id.0 as u64,
    }
}

/// Collapse candidates sharing a uniqueness group key into one node.
fn build_groups(candidates: &[Candidate], mode: UniqueMode, uniq_mask: u32) -> Vec<Vec<Candidate>> {
    let mut groups: Vec<(u64, Vec<Candidate>)> = Vec::new();
    for c in candidates {
        let key = group_key(c, mode, uniq_mask);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(*c),
            None => groups.push((key, vec![*c])),
        }
    }
    groups.into_iter().map(|(_, m)| m).collect()
}

fn group_matches(group: &[Candidate], expr: Option<&LabelExpr>) -> bool {
    group
        .iter()
        .any(|c| crate::labels::server_matches_labelexpr(c.label_mask, expr))
}

#[derive(Debug, Default)]
pub struct MatchResult {
    pub slot_to_group: Vec<Option<usize>>,
    pub group_to_slot: Vec<Option<usize>>,
}

/// Run the matcher. `labels` gives one expression per slot (`None` =
/// unconstrained). Returns slot/group index pairings; callers resolve a
/// matched group back to a concrete `Candidate` via `groups`.
pub fn match_placement(
    labels: &[Option<LabelExpr>],
    candidates: &[Candidate],
    uniq_mode: UniqueMode,
    uniq_mask: u32,
    labels_mode: LabelsMode,
) -> (MatchResult, Vec<Vec<Candidate>>) {
    let groups = build_groups(candidates, uniq_mode, uniq_mask);
    let k = labels.len();
    let g = groups.len();

    let mut slot_to_group: Vec<Option<usize>> = vec![None; k];
    let mut group_to_slot: Vec<Option<usize>> = vec![None; g];

    let adjacency: Vec<Vec<usize>> = labels
        .iter()
        .map(|expr| {
            (0..g)
                .filter(|&gi| group_matches(&groups[gi], expr.as_ref()))
                .collect()
        })
        .collect();

    for slot in 0..k {
        let mut visited = vec![false; g];
        try_augment(slot, &adjacency, &mut group_to_slot, &mut visited);
    }
    for (slot, g_opt) in group_to_slot.iter().enumerate() {
        if let Some(s) = g_opt {
            slot_to_group[*s] = Some(slot);
        }
    }

    if labels_mode != LabelsMode::Strict {
        extend_unmatched(&mut slot_to_group, &mut group_to_slot);
    }

    (
        MatchResult {
            slot_to_group,
            group_to_slot,
        },
        groups,
    )
}

fn try_augment(
    slot: usize,
    adjacency: &[Vec<usize>],
    group_to_slot: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for &g in &adjacency[slot] {
        if visited[g] {
            continue;
        }
        visited[g] = true;
        let free_or_reassignable = match group_to_slot[g] {
            None => true,
            Some(prev_slot) => try_augment(prev_slot, adjacency, group_to_slot, visited),
        };
        if free_or_reassignable {
            group_to_slot[g] = Some(slot);
            return true;
        }
    }
    false
}

/// Non-strict "extend" pass: fill any still-unmatched slot with an
/// arbitrary unmatched group so creation can still succeed on an
/// under-labelled cluster.
fn extend_unmatched(slot_to_group: &mut [Option<usize>], group_to_slot: &mut [Option<usize>]) {
    let mut free_groups: Vec<usize> = group_to_slot
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_none())
        .map(|(g, _)| g)
        .collect();
    for (slot, assigned) in slot_to_group.iter_mut().enumerate() {
        if assigned.is_some() {
            continue;
        }
        if let Some(g) = free_groups.pop() {
            *assigned = Some(g);
            group_to_slot[g] = Some(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: u16, ip: u32, mask: u32) -> Candidate {
        Candidate {
            server_id: ServerId(id),
            ip,
            rack_id: ip,
            label_mask: mask,
        }
    }

    #[test]
    fn matches_labels_against_distinct_groups() {
        let labels = vec![Some(LabelExpr::AnyOf(0b01)), Some(LabelExpr::AnyOf(0b10))];
        let candidates = vec![cand(1, 1, 0b01), cand(2, 2, 0b10)];
        let (result, groups) = match_placement(
            &labels,
            &candidates,
            UniqueMode::None,
            0,
            LabelsMode::Default,
        );
        assert_eq!(result.slot_to_group.len(), 2);
        assert!(result.slot_to_group[0].is_some());
        assert!(result.slot_to_group[1].is_some());
        assert_ne!(result.slot_to_group[0], result.slot_to_group[1]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn no_same_ip_collapses_candidates_sharing_an_ip() {
        let labels = vec![None, None];
        let candidates = vec![cand(1, 9, 0), cand(2, 9, 0), cand(3, 10, 0)];
        let (_, groups) = match_placement(
            &labels,
            &candidates,
            UniqueMode::NoSameIp,
            0,
            LabelsMode::Default,
        );
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn strict_mode_leaves_unmatched_slot_unfilled() {
        let labels = vec![Some(LabelExpr::AnyOf(0b100))];
        let candidates = vec![cand(1, 1, 0b001)];
        let (result, _) = match_placement(
            &labels,
            &candidates,
            UniqueMode::None,
            0,
            LabelsMode::Strict,
        );
        assert!(result.slot_to_group[0].is_none());
    }

    #[test]
    fn default_mode_extends_into_unmatched_slot() {
        let labels = vec![Some(LabelExpr::AnyOf(0b100))];
        let candidates = vec![cand(1, 1, 0b001)];
        let (result, _) = match_placement(
            &labels,
            &candidates,
            UniqueMode::None,
            0,
            LabelsMode::Default,
        );
        assert!(result.slot_to_group[0].is_some());
    }
}
