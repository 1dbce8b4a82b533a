//! The chunk record and its replica inventory (spec §3.1, §3.3).

use crate::ids::{ChunkId, ServerId, SclassId};

/// One of the four states a write-side operation can leave a chunk in
/// while it is mid-flight (spec §3.1, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    None,
    Create,
    SetVersion,
    Duplicate,
    Truncate,
    DupTrunc,
    Replicate,
    LocalSplit,
}

impl Default for OperationKind {
    fn default() -> Self {
        OperationKind::None
    }
}

impl OperationKind {
    pub fn is_none(&self) -> bool {
        matches!(self, OperationKind::None)
    }
}

/// Derived storage mode (spec §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Copies,
    Ec8,
    Ec4,
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::Copies
    }
}

/// A replica's role, encoded the way spec §3.3 documents: 0 = full copy,
/// 0x10..0x1C = EC4 part, 0x20..0x30 = EC8 part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartId(pub u8);

pub const PART_COPY: PartId = PartId(0x00);
pub const EC4_BASE: u8 = 0x10;
pub const EC4_MAX: u8 = 0x1C; // 4 data + 9 checksum - 1
pub const EC8_BASE: u8 = 0x20;
pub const EC8_MAX: u8 = 0x30; // 8 data + 9 checksum - 1

impl PartId {
    pub fn is_copy(&self) -> bool {
        self.0 == PART_COPY.0
    }

    pub fn is_ec4(&self) -> bool {
        (EC4_BASE..=EC4_MAX).contains(&self.0)
    }

    pub fn is_ec8(&self) -> bool {
        (EC8_BASE..=EC8_MAX).contains(&self.0)
    }

    /// Index within its EC profile (0-based data/checksum slot).
    pub fn ec_index(&self) -> Option<u8> {
        if self.is_ec4() {
            Some(self.0 - EC4_BASE)
        } else if self.is_ec8() {
            Some(self.0 - EC8_BASE)
        } else {
            None
        }
    }

    pub fn storage_mode(&self) -> StorageMode {
        if self.is_ec4() {
            StorageMode::Ec4
        } else if self.is_ec8() {
            StorageMode::Ec8
        } else {
            StorageMode::Copies
        }
    }
}

/// The three orthogonal axes of replica health (spec §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Valid,
    TdValid,
    Busy,
    TdBusy,
    WVer,
    TdWVer,
    Invalid,
    Del,
}

impl ReplicaState {
    /// On a disk marked for removal (the "TD" axis).
    pub fn is_marked_for_removal(&self) -> bool {
        matches!(
            self,
            ReplicaState::TdValid | ReplicaState::TdBusy | ReplicaState::TdWVer
        )
    }

    /// Counts toward redundancy right now (current version, readable).
    pub fn is_valid_now(&self) -> bool {
        matches!(self, ReplicaState::Valid | ReplicaState::TdValid)
    }

    /// Involved in an in-progress master-initiated operation.
    pub fn is_busy(&self) -> bool {
        matches!(self, ReplicaState::Busy | ReplicaState::TdBusy)
    }

    pub fn is_wrong_version(&self) -> bool {
        matches!(self, ReplicaState::WVer | ReplicaState::TdWVer)
    }

    /// Strip the "on a marked-for-removal disk" bit, keeping the other axis.
    pub fn without_mfr(&self) -> ReplicaState {
        match self {
            ReplicaState::TdValid => ReplicaState::Valid,
            ReplicaState::TdBusy => ReplicaState::Busy,
            ReplicaState::TdWVer => ReplicaState::WVer,
            other => *other,
        }
    }

    /// Re-apply the "on a marked-for-removal disk" bit.
    pub fn with_mfr(&self) -> ReplicaState {
        match self {
            ReplicaState::Valid => ReplicaState::TdValid,
            ReplicaState::Busy => ReplicaState::TdBusy,
            ReplicaState::WVer => ReplicaState::TdWVer,
            other => *other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replica {
    pub server_id: ServerId,
    pub part_id: PartId,
    pub state: ReplicaState,
    pub version: u32,
}

/// The sorted, deduplicated replica set for one chunk (spec §3.1 invariants:
/// sorted by `(server_id, part_id)`, at most one replica per pair).
///
/// A plain sorted `Vec` is used rather than an intrusive arena-backed linked
/// list: chunk fan-out (goal, EC parts) is bounded and small in practice
/// (typically well under 32), so the "arena + index" advice in spec §9 is
/// applied instead to the cluster-wide file-count list and chunk registry,
/// where cardinality is large enough to matter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaList(Vec<Replica>);

impl ReplicaList {
    pub fn new() -> Self {
        ReplicaList(Vec::new())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Replica> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn sort_key(server_id: ServerId, part_id: PartId) -> (ServerId, PartId) {
        (server_id, part_id)
    }

    pub fn find(&self, server_id: ServerId, part_id: PartId) -> Option<&Replica> {
        let key = Self::sort_key(server_id, part_id);
        self.0
            .binary_search_by_key(&key, |r| Self::sort_key(r.server_id, r.part_id))
            .ok()
            .map(|i| &self.0[i])
    }

    pub fn find_mut(&mut self, server_id: ServerId, part_id: PartId) -> Option<&mut Replica> {
        let key = Self::sort_key(server_id, part_id);
        match self
            .0
            .binary_search_by_key(&key, |r| Self::sort_key(r.server_id, r.part_id))
        {
            Ok(i) => Some(&mut self.0[i]),
            Err(_) => None,
        }
    }

    /// Insert or overwrite the replica at `(server_id, part_id)`.
    pub fn upsert(&mut self, replica: Replica) {
        let key = Self::sort_key(replica.server_id, replica.part_id);
        match self
            .0
            .binary_search_by_key(&key, |r| Self::sort_key(r.server_id, r.part_id))
        {
            Ok(i) => self.0[i] = replica,
            Err(i) => self.0.insert(i, replica),
        }
    }

    pub fn remove(&mut self, server_id: ServerId, part_id: PartId) -> Option<Replica> {
        let key = Self::sort_key(server_id, part_id);
        match self
            .0
            .binary_search_by_key(&key, |r| Self::sort_key(r.server_id, r.part_id))
        {
            Ok(i) => Some(self.0.remove(i)),
            Err(_) => None,
        }
    }

    pub fn remove_server(&mut self, server_id: ServerId) -> Vec<Replica> {
        let mut removed = Vec::new();
        self.0.retain(|r| {
            if r.server_id == server_id {
                removed.push(*r);
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn servers(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.0.iter().map(|r| r.server_id)
    }
}

/// Flags and transient bits (spec §3.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFlags {
    pub arch: bool,
    pub trash: bool,
    pub needs_ver_increase: bool,
    pub allow_read_zeros: bool,
    pub interrupted: bool,
    pub write_in_progress: bool,
    pub on_danger_list: bool,
}

/// Computed goal-equivalent counts (spec §3.1, glossary "goal-equivalent").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GoalEquiv {
    /// Valid-and-to-delete counted.
    pub all: u8,
    /// Only regular (non-MFR) valid counted.
    pub reg: u8,
}

impl GoalEquiv {
    pub fn saturating(all: u32, reg: u32) -> Self {
        GoalEquiv {
            all: all.min(15) as u8,
            reg: reg.min(15) as u8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_id: ChunkId,
    /// Logical version, 30 bits used; the persisted allow-read-zeros bit
    /// lives in `flags.allow_read_zeros` in memory (spec §3.1, §6.1).
    pub version: u32,
    pub sclass_id: SclassId,
    pub flags: ChunkFlags,
    pub storage_mode: StorageMode,
    pub goal: GoalEquiv,
    pub operation: OperationKind,
    pub locked_to: i64,
    /// Raw file-count-list head; see `file_count.rs` for interpretation.
    pub file_head: u32,
    pub replicas: ReplicaList,
}

impl ChunkRecord {
    pub fn new(chunk_id: ChunkId, version: u32, sclass_id: SclassId) -> Self {
        ChunkRecord {
            chunk_id,
            version,
            sclass_id,
            flags: ChunkFlags::default(),
            storage_mode: StorageMode::Copies,
            goal: GoalEquiv::default(),
            operation: OperationKind::None,
            locked_to: 0,
            file_head: 0,
            replicas: ReplicaList::new(),
        }
    }

    /// Invariant 1 (spec §3.1): a chunk is live iff referenced, locked, or
    /// it still has replicas.
    pub fn is_live(&self, now: i64) -> bool {
        self.file_head != 0 || self.locked_to >= now || !self.replicas.is_empty()
    }

    /// Invariant: `operation != None` implies some replica is BUSY/TDBUSY.
    pub fn has_busy_replica(&self) -> bool {
        self.replicas.iter().any(|r| r.state.is_busy())
    }

    pub fn check_invariants(&self) -> Result<(), &'static str> {
        if self.goal.all < self.goal.reg {
            return Err("all_goal_equiv < reg_goal_equiv");
        }
        if !self.operation.is_none() && !self.has_busy_replica() {
            return Err("operation in progress without a BUSY replica");
        }
        let mut seen = std::collections::HashSet::new();
        for r in self.replicas.iter() {
            if !seen.insert((r.server_id, r.part_id)) {
                return Err("duplicate (server, part) in replica list");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: u16) -> ServerId {
        ServerId(n)
    }

    #[test]
    fn replica_list_stays_sorted_and_deduplicated() {
        let mut list = ReplicaList::new();
        list.upsert(Replica {
            server_id: sid(3),
            part_id: PART_COPY,
            state: ReplicaState::Valid,
            version: 1,
        });
        list.upsert(Replica {
            server_id: sid(1),
            part_id: PART_COPY,
            state: ReplicaState::Valid,
            version: 1,
        });
        list.upsert(Replica {
            server_id: sid(1),
            part_id: PART_COPY,
            state: ReplicaState::Busy,
            version: 2,
        });
        assert_eq!(list.len(), 2);
        let servers: Vec<_> = list.servers().collect();
        assert_eq!(servers, vec![sid(1), sid(3)]);
        assert_eq!(list.find(sid(1), PART_COPY).unwrap().state, ReplicaState::Busy);
    }

    #[test]
    fn part_id_classification() {
        assert!(PartId(0x00).is_copy());
        assert!(PartId(0x13).is_ec4());
        assert!(PartId(0x27).is_ec8());
        assert_eq!(PartId(0x13).ec_index(), Some(0x03));
    }

    #[test]
    fn is_live_covers_all_three_reasons() {
        let mut c = ChunkRecord::new(ChunkId(1), 1, SclassId(0));
        assert!(!c.is_live(100));
        c.file_head = 1;
        assert!(c.is_live(100));
        c.file_head = 0;
        c.locked_to = 200;
        assert!(c.is_live(100));
        c.locked_to = 0;
        c.replicas.upsert(Replica {
            server_id: sid(1),
            part_id: PART_COPY,
            state: ReplicaState::Valid,
            version: 1,
        });
        assert!(c.is_live(100));
    }

    #[test]
    fn invariant_check_flags_missing_busy_replica() {
        let mut c = ChunkRecord::new(ChunkId(1), 1, SclassId(0));
        c.operation = OperationKind::Replicate;
        assert!(c.check_invariants().is_err());
        c.replicas.upsert(Replica {
            server_id: sid(1),
            part_id: PART_COPY,
            state: ReplicaState::Busy,
            version: 1,
        });
        assert!(c.check_invariants().is_ok());
    }
}
