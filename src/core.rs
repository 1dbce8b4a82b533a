//! `Core`: the single process-wide value that owns every piece of state
//! and is the sole entry point the host process calls into (spec §9's
//! design note — one value, no background threads, driven entirely by the
//! host's tick and RPC callbacks).

use std::collections::HashMap;

use log::{info, warn};

use crate::chunk::{ChunkRecord, OperationKind, PartId, Replica, ReplicaState, PART_COPY};
use crate::config::Tunables;
use crate::decision::{self, Inventory};
use crate::error::{ChunkError, ChunkResult};
use crate::guards::{DelayProtector, ReplicationLock};
use crate::ids::{ChunkId, ChunkIdAllocator, ServerId, SclassId};
use crate::matcher::{self, Candidate};
use crate::operation::{self, OpStatus, PendingOperation, PrepareOutcome, ReconcileOutcome};
use crate::priority_queue::{DangerQueues, PriorityLevel};
use crate::registry::ChunkRegistry;
use crate::scheduler::{DeletionThrottle, FailCounterTable, LoopInfo, SweepCursor};
use crate::server_registry::ServerRegistry;
use crate::storage_class::StorageClassRegistry;
use crate::topology::{FlatTopology, Topology};
use crate::file_count::FileCountArena;

/// 7-day default `locked_to` window for orphaned chunk records created by
/// `has_chunk` from a server report (spec §4.7).
const ORPHAN_LOCK_SECS: i64 = 7 * 24 * 3600;

pub struct Core {
    config: Tunables,
    registry: ChunkRegistry,
    servers: ServerRegistry,
    storage_classes: StorageClassRegistry,
    queues: DangerQueues,
    delay_protector: DelayProtector,
    replication_lock: ReplicationLock,
    id_alloc: ChunkIdAllocator,
    file_count: FileCountArena,
    pending_ops: HashMap<ChunkId, PendingOperation>,
    fail_counters: FailCounterTable,
    deletion_throttle: DeletionThrottle,
    sweep: SweepCursor,
    loop_info: LoopInfo,
    topology: Box<dyn Topology>,
    ticks: u64,
}

impl Core {
    pub fn new(config: Tunables) -> Self {
        let config = config.clamped();
        let queues = DangerQueues::new(config.priority_queue_length);
        let deletion_throttle = DeletionThrottle::new(config.soft_del_limit, config.hard_del_limit);
        Core {
            registry: ChunkRegistry::new(),
            servers: ServerRegistry::new(),
            storage_classes: StorageClassRegistry::new(),
            queues,
            delay_protector: DelayProtector::new(),
            replication_lock: ReplicationLock::new(),
            id_alloc: ChunkIdAllocator::new(1),
            file_count: FileCountArena::new(),
            pending_ops: HashMap::new(),
            fail_counters: FailCounterTable::new(),
            deletion_throttle,
            sweep: SweepCursor::new(64),
            loop_info: LoopInfo::default(),
            topology: Box::new(FlatTopology),
            ticks: 0,
            config,
        }
    }

    pub fn set_topology(&mut self, topology: Box<dyn Topology>) {
        self.topology = topology;
    }

    pub fn storage_classes_mut(&mut self) -> &mut StorageClassRegistry {
        &mut self.storage_classes
    }

    // ---- chunk-server lifecycle (spec §4.7) ----------------------------

    pub fn connected(&mut self, ip: u32, port: u16, label_mask: u32) -> ServerId {
        self.servers.connect(ip, port, label_mask)
    }

    pub fn register_end(&mut self, id: ServerId) {
        self.servers.register_end(id);
    }

    pub fn disconnected(&mut self, id: ServerId) {
        self.servers.disconnect(id);
        warn!("chunk server {id} disconnected");
    }

    /// Bounded background walk finalising deferred disconnects
    /// (spec §4.7). Returns how many were finished this call.
    pub fn drain_disconnects(&mut self, budget: usize) -> usize {
        let mut n = 0;
        while n < budget {
            let Some(slot) = self.servers.finish_disconnect() else {
                break;
            };
            for record in self.registry.iter_mut() {
                let removed = record.replicas.remove_server(slot.id);
                if !removed.is_empty() {
                    self.queues.push(PriorityLevel::Undergoal, record.chunk_id);
                }
            }
            n += 1;
        }
        n
    }

    /// `has_chunk`: a chunk server reports it holds `(chunk_id, part_id,
    /// version)`. Creates the chunk record if missing (spec §4.7).
    pub fn has_chunk(&mut self, server_id: ServerId, chunk_id: ChunkId, part_id: PartId, version_with_mfr_bit: u32, now: i64) {
        let mfr = version_with_mfr_bit & 0x8000_0000 != 0;
        let version = version_with_mfr_bit & 0x7FFF_FFFF;
        self.id_alloc.observe(chunk_id.0);

        if self.registry.find(chunk_id).is_none() {
            let mut record = ChunkRecord::new(chunk_id, version, SclassId(0));
            record.locked_to = now + ORPHAN_LOCK_SECS;
            self.registry.insert(record);
        }

        if let Some(record) = self.registry.find_mut(chunk_id) {
            let state = if mfr { ReplicaState::TdValid } else { ReplicaState::Valid };
            record.replicas.upsert(Replica {
                server_id,
                part_id,
                state,
                version,
            });
        }
    }

    pub fn damaged(&mut self, chunk_id: ChunkId, server_id: ServerId, part_id: PartId) {
        if let Some(record) = self.registry.find_mut(chunk_id) {
            if let Some(r) = record.replicas.find_mut(server_id, part_id) {
                r.state = ReplicaState::Invalid;
            }
        }
        self.queues.push(PriorityLevel::Undergoal, chunk_id);
    }

    pub fn lost(&mut self, chunk_id: ChunkId, server_id: ServerId, part_id: PartId) {
        if let Some(record) = self.registry.find_mut(chunk_id) {
            record.replicas.remove(server_id, part_id);
        }
        self.queues.push(PriorityLevel::Undergoal, chunk_id);
    }

    // ---- file-count propagation (spec §4.2) -----------------------------

    pub fn add_file(&mut self, chunk_id: ChunkId, sclass: SclassId) -> ChunkResult<()> {
        let record = self.registry.find_mut(chunk_id).ok_or(ChunkError::NoChunk)?;
        let old_dominant = record.sclass_id;
        let (fh, head_sc) = self.file_count.add_file(record.file_head, record.sclass_id, sclass);
        record.file_head = fh;
        record.sclass_id = head_sc;
        if head_sc != old_dominant {
            self.queues.push(PriorityLevel::Undergoal, chunk_id);
        }
        Ok(())
    }

    pub fn delete_file(&mut self, chunk_id: ChunkId, sclass: SclassId, now: i64, unused_delete_timeout: Option<i64>) -> ChunkResult<()> {
        let record = self.registry.find_mut(chunk_id).ok_or(ChunkError::NoChunk)?;
        let old_dominant = record.sclass_id;
        let (fh, head_sc) = self.file_count.delete_file(record.file_head, record.sclass_id, sclass);
        record.file_head = fh;
        record.sclass_id = head_sc;
        if fh == 0 {
            if let Some(timeout) = unused_delete_timeout {
                record.locked_to = now + timeout;
            }
        }
        if head_sc != old_dominant {
            self.queues.push(PriorityLevel::Undergoal, chunk_id);
        }
        Ok(())
    }

    pub fn change_file(&mut self, chunk_id: ChunkId, old_sclass: SclassId, new_sclass: SclassId) -> ChunkResult<()> {
        let record = self.registry.find_mut(chunk_id).ok_or(ChunkError::NoChunk)?;
        let (fh, head_sc) = self.file_count.change_file(record.file_head, record.sclass_id, old_sclass, new_sclass);
        record.file_head = fh;
        record.sclass_id = head_sc;
        Ok(())
    }

    // ---- client-facing operations (spec §4.8) ---------------------------

    pub fn unlock(&mut self, chunk_id: ChunkId) -> ChunkResult<()> {
        let record = self.registry.find_mut(chunk_id).ok_or(ChunkError::NoChunk)?;
        record.locked_to = 0;
        Ok(())
    }

    pub fn set_archflag(&mut self, chunk_id: ChunkId, arch: bool) -> ChunkResult<()> {
        let record = self.registry.find_mut(chunk_id).ok_or(ChunkError::NoChunk)?;
        record.flags.arch = arch;
        Ok(())
    }

    /// `read_check`: does the chunk have a valid copy a client may read?
    pub fn read_check(&mut self, chunk_id: ChunkId) -> ChunkResult<u32> {
        let record = self.registry.find(chunk_id).ok_or(ChunkError::NoChunk)?;
        if record.replicas.iter().any(|r| r.state.is_valid_now()) {
            Ok(record.version)
        } else if record.flags.allow_read_zeros {
            Ok(record.version)
        } else {
            Err(ChunkError::ChunkLost)
        }
    }

    pub fn get_version_and_csdata(&mut self, chunk_id: ChunkId) -> ChunkResult<(u32, Vec<(ServerId, PartId, ReplicaState)>)> {
        let record = self.registry.find(chunk_id).ok_or(ChunkError::NoChunk)?;
        let data = record.replicas.iter().map(|r| (r.server_id, r.part_id, r.state)).collect();
        Ok((record.version, data))
    }

    /// `create`: allocate a new chunk id and issue CREATE to `goal` many
    /// placement-matched servers (spec §4.8 CREATE row, §4.6).
    pub fn create(&mut self, sclass: SclassId) -> ChunkResult<(ChunkId, Vec<ServerId>)> {
        let class = self
            .storage_classes
            .get(sclass)
            .cloned_def()
            .ok_or(ChunkError::NoChunkServers)?;

        let candidates: Vec<Candidate> = self
            .servers
            .candidates()
            .map(|s| Candidate {
                server_id: s.id,
                ip: s.ip,
                rack_id: self.topology.rack_id(s.ip),
                label_mask: s.label_mask,
            })
            .collect();
        if candidates.is_empty() {
            return Err(ChunkError::NoChunkServers);
        }

        let (result, groups) = matcher::match_placement(
            &class.labels,
            &candidates,
            self.config.unique_mode,
            class.uniq_mask,
            class.labels_mode,
        );
        let mut chosen: Vec<ServerId> = result
            .slot_to_group
            .iter()
            .filter_map(|g| g.map(|gi| groups[gi][0].server_id))
            .collect();
        chosen.dedup();
        if chosen.is_empty() {
            return Err(ChunkError::NoSpace);
        }

        let chunk_id = self.id_alloc.allocate();
        let mut record = ChunkRecord::new(chunk_id, 0, sclass);
        record.storage_mode = class.storage_mode();
        self.registry.insert(record);

        let record = self.registry.find_mut(chunk_id).expect("just inserted");
        record.version = 1;
        let participants: Vec<(ServerId, PartId)> = chosen.iter().map(|s| (*s, PART_COPY)).collect();
        // CREATE seats replicas directly (no prior version to bump from);
        // issue() bumps on SET_VERSION/TRUNCATE/DUPTRUNC only, which is
        // correct here since the initial version is already set to 1.
        record.operation = OperationKind::Create;
        for (server_id, part_id) in &participants {
            record.replicas.upsert(Replica {
                server_id: *server_id,
                part_id: *part_id,
                state: ReplicaState::Busy,
                version: 1,
            });
        }
        let pending = PendingOperation {
            chunk_id,
            kind: OperationKind::Create,
            participants: participants
                .iter()
                .map(|(server_id, part_id)| crate::operation::PendingParticipant {
                    server_id: *server_id,
                    part_id: *part_id,
                    pre_op_version: 0,
                    done: false,
                    last_status: None,
                })
                .collect(),
            interrupted: false,
        };
        self.pending_ops.insert(chunk_id, pending);

        info!("create chunk {chunk_id} sclass {} on {} servers", sclass.0, chosen.len());
        Ok((chunk_id, chosen))
    }

    fn modify(&mut self, chunk_id: ChunkId, kind: OperationKind, now: i64) -> ChunkResult<Vec<(ServerId, PartId)>> {
        let connected: Vec<ServerId> = self.servers.candidates().map(|s| s.id).collect();
        let record = self.registry.find_mut(chunk_id).ok_or(ChunkError::NoChunk)?;
        match operation::prepare_to_modify(record, |id| connected.contains(&id))? {
            PrepareOutcome::Ready => {}
            PrepareOutcome::NeedsRepairFirst => return Err(ChunkError::EAgain),
            PrepareOutcome::WaitForServers => return Err(ChunkError::CsNotPresent),
            PrepareOutcome::NeedsConversion => return Err(ChunkError::EAgain),
        }
        let participants: Vec<(ServerId, PartId)> = record
            .replicas
            .iter()
            .filter(|r| r.part_id.is_copy() && r.state.is_valid_now())
            .map(|r| (r.server_id, r.part_id))
            .collect();
        let pending = operation::issue(record, kind, participants.clone());
        self.pending_ops.insert(chunk_id, pending);
        self.delay_protector.touch(chunk_id, now);
        Ok(participants)
    }

    pub fn set_version(&mut self, chunk_id: ChunkId, now: i64) -> ChunkResult<Vec<(ServerId, PartId)>> {
        self.modify(chunk_id, OperationKind::SetVersion, now)
    }

    pub fn truncate(&mut self, chunk_id: ChunkId, now: i64) -> ChunkResult<Vec<(ServerId, PartId)>> {
        self.modify(chunk_id, OperationKind::Truncate, now)
    }

    pub fn duplicate(&mut self, chunk_id: ChunkId, now: i64) -> ChunkResult<(ChunkId, Vec<(ServerId, PartId)>)> {
        let new_id = self.id_alloc.allocate();
        let participants = self.modify(chunk_id, OperationKind::Duplicate, now)?;
        Ok((new_id, participants))
    }

    pub fn duptrunc(&mut self, chunk_id: ChunkId, now: i64) -> ChunkResult<(ChunkId, Vec<(ServerId, PartId)>)> {
        let new_id = self.id_alloc.allocate();
        let participants = self.modify(chunk_id, OperationKind::DupTrunc, now)?;
        Ok((new_id, participants))
    }

    /// `got_<op>_status`: fold in one participant's report.
    pub fn got_op_status(&mut self, chunk_id: ChunkId, server_id: ServerId, part_id: PartId, status: OpStatus, now: i64) -> ChunkResult<()> {
        let Some(record) = self.registry.find_mut(chunk_id) else {
            return Err(ChunkError::NoChunk);
        };
        let Some(pending) = self.pending_ops.get_mut(&chunk_id) else {
            return Err(ChunkError::NotDone);
        };
        match operation::reconcile(record, pending, server_id, part_id, status) {
            ReconcileOutcome::Pending => {}
            ReconcileOutcome::Succeeded => {
                self.pending_ops.remove(&chunk_id);
                self.delay_protector.touch(chunk_id, now);
            }
            ReconcileOutcome::Failed(err) => {
                self.pending_ops.remove(&chunk_id);
                self.queues.push(PriorityLevel::Undergoal, chunk_id);
                return Err(err);
            }
        }
        Ok(())
    }

    // ---- scheduling tick (spec §4.3) ------------------------------------

    /// Run one scheduling tick: drain I/O-ready, drain danger levels 1..8,
    /// sweep a slice of the registry, and (on a completed sweep) rotate
    /// server mfr-states and adjust the deletion throttle.
    pub fn tick(&mut self, now: i64) {
        self.ticks += 1;
        self.sweep.resize(self.registry.bucket_count().max(1));

        let io_budget = self.config.hash_cpt_max;
        for _ in 0..io_budget {
            let Some(chunk_id) = self.queues.pop(PriorityLevel::IoReady) else {
                break;
            };
            self.reevaluate(chunk_id, now);
        }

        for level in &PriorityLevel::ALL[1..] {
            let budget = 64;
            for _ in 0..budget {
                let Some(chunk_id) = self.queues.pop(*level) else {
                    break;
                };
                self.reevaluate(chunk_id, now);
            }
        }

        let per_tick = self.sweep.buckets_per_tick(self.config.loop_min_time_secs, 1000 / self.config.jobs_timer_ms.max(1));
        let (buckets, completed_pass) = self.sweep.advance(per_tick);
        let mut swept = 0u64;
        for b in buckets {
            if let Some(record) = self.registry.record_at_bucket(b) {
                let chunk_id = record.chunk_id;
                self.reevaluate(chunk_id, now);
                swept += 1;
            }
        }
        self.loop_info.record(swept);

        self.fail_counters.tick(self.config.fail_class_counter_reset_calls);

        if completed_pass {
            self.servers.rotate_mfr_states();
            self.loop_info.rotate();
            self.deletion_throttle.on_loop_end(0, 0, false, false);
            self.delay_protector.sweep(now, self.config.chunk_protection_secs);
            self.replication_lock.sweep(now);
        }
    }

    /// Recompute one chunk's danger priority and re-enqueue it if it still
    /// needs attention (the hot re-eval path §4.4 refers to).
    fn reevaluate(&mut self, chunk_id: ChunkId, now: i64) {
        if self.replication_lock.is_locked(chunk_id, now) {
            self.queues.push(PriorityLevel::Undergoal, chunk_id);
            return;
        }
        if let Some(record) = self.registry.find_mut(chunk_id) {
            // Phase A: a chunk stuck mid SET_VERSION/TRUNCATE with no
            // surviving valid copy may still be recoverable at the
            // pre-bump version (spec §4.5 Phase A).
            decision::retroactive_accept_stale_version(record);
        }
        let Some(record) = self.registry.find(chunk_id) else {
            return;
        };
        if !record.operation.is_none() || record.locked_to >= now {
            return;
        }
        let sclass = self.storage_classes.get(record.sclass_id).cloned_def();
        let goal = sclass.as_ref().map(|c| c.goal).unwrap_or(1);
        let inv: Inventory = decision::compute_inventory(record, 0);
        if let Some(level) = decision::danger_priority(&inv, goal, false, false, true, false) {
            self.queues.push(level, chunk_id);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn danger_total(&self) -> usize {
        self.queues.total()
    }
}

/// `StorageClassDef` isn't `Copy`; callers inside `Core` want an owned
/// snapshot they can use after releasing the registry borrow.
trait CloneDef {
    fn cloned_def(&self) -> Option<crate::storage_class::StorageClassDef>;
}

impl CloneDef for Option<&crate::storage_class::StorageClassDef> {
    fn cloned_def(&self) -> Option<crate::storage_class::StorageClassDef> {
        self.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_class::StorageClassDef;

    #[test]
    fn create_issues_to_matched_servers() {
        let mut core = Core::new(Tunables::default());
        core.storage_classes_mut().insert(StorageClassDef::copies(SclassId(1), "default", 2));
        let a = core.connected(1, 9001, 0);
        core.register_end(a);
        let b = core.connected(2, 9001, 0);
        core.register_end(b);

        let (chunk_id, servers) = core.create(SclassId(1)).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(core.len(), 1);
        assert_eq!(chunk_id.0, 1);
    }

    #[test]
    fn has_chunk_creates_orphan_record() {
        let mut core = Core::new(Tunables::default());
        let s = core.connected(1, 9001, 0);
        core.has_chunk(s, ChunkId(99), PART_COPY, 5, 1000);
        let (version, data) = core.get_version_and_csdata(ChunkId(99)).unwrap();
        assert_eq!(version, 5);
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn unlock_clears_locked_to() {
        let mut core = Core::new(Tunables::default());
        let s = core.connected(1, 9001, 0);
        core.has_chunk(s, ChunkId(1), PART_COPY, 1, 1000);
        core.unlock(ChunkId(1)).unwrap();
        let (version, _) = core.get_version_and_csdata(ChunkId(1)).unwrap();
        assert_eq!(version, 1);
    }
}
