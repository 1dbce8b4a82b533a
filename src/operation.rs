//! The three-phase write-side operation protocol (spec §4.8).
//!
//! `prepare_to_modify` checks preconditions, `issue` transitions the chunk
//! and records pending per-server operations, `reconcile` folds in each
//! server's reported status as it arrives. The core drives these three
//! calls; this module only holds the state machine, not the scheduling.

use crate::chunk::{ChunkRecord, OperationKind, PartId, Replica, ReplicaState};
use crate::error::{ChunkError, ChunkResult};
use crate::ids::{ChunkId, ServerId};

/// Status a chunk server reports back for one participant in an operation
/// (spec §6.2, `<op>_STATUS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Ok,
    NotDone,
    WrongVersion,
    NoChunk,
    NoSpace,
    ETimedOut,
    Mismatch,
}

/// One participant's bookkeeping while an operation is in flight.
#[derive(Debug, Clone, Copy)]
pub struct PendingParticipant {
    pub server_id: ServerId,
    pub part_id: PartId,
    pub pre_op_version: u32,
    pub done: bool,
    pub last_status: Option<OpStatus>,
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub chunk_id: ChunkId,
    pub kind: OperationKind,
    pub participants: Vec<PendingParticipant>,
    pub interrupted: bool,
}

/// Outcome of `prepare_to_modify` (spec §4.8 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    Ready,
    /// Recoverable, but needs a fast-path repair job first.
    NeedsRepairFirst,
    /// Recoverable only with currently disconnected servers.
    WaitForServers,
    /// Has EC parts but no copies; must convert to copy mode first.
    NeedsConversion,
}

pub fn prepare_to_modify(chunk: &ChunkRecord, connected: impl Fn(ServerId) -> bool) -> ChunkResult<PrepareOutcome> {
    if !chunk.operation.is_none() {
        return Err(ChunkError::ChunkBusy);
    }
    let valid_copies = chunk
        .replicas
        .iter()
        .filter(|r| r.part_id.is_copy() && r.state.is_valid_now())
        .count();
    if valid_copies > 0 {
        return Ok(PrepareOutcome::Ready);
    }
    let has_ec_parts = chunk.replicas.iter().any(|r| !r.part_id.is_copy());
    if has_ec_parts && chunk.replicas.iter().all(|r| !r.part_id.is_copy()) {
        return Ok(PrepareOutcome::NeedsConversion);
    }
    let any_recoverable = chunk.replicas.iter().any(|r| r.state.is_valid_now() || r.state.is_wrong_version());
    if !any_recoverable {
        return Err(ChunkError::ChunkLost);
    }
    let recoverable_connected = chunk
        .replicas
        .iter()
        .any(|r| (r.state.is_valid_now() || r.state.is_wrong_version()) && connected(r.server_id));
    if recoverable_connected {
        Ok(PrepareOutcome::NeedsRepairFirst)
    } else {
        Ok(PrepareOutcome::WaitForServers)
    }
}

/// Issue an operation: mark the chunk `operation = kind`, seat BUSY
/// replica placeholders, bump the version where the op demands it, and
/// return the per-server pending record for the caller to send out.
pub fn issue(
    chunk: &mut ChunkRecord,
    kind: OperationKind,
    participants: Vec<(ServerId, PartId)>,
) -> PendingOperation {
    debug_assert!(chunk.operation.is_none());
    let bumps_version = matches!(
        kind,
        OperationKind::SetVersion | OperationKind::Truncate | OperationKind::DupTrunc
    );
    if bumps_version {
        chunk.version += 1;
    }
    chunk.operation = kind;

    let mut pending = Vec::with_capacity(participants.len());
    for (server_id, part_id) in participants {
        let pre_op_version = chunk
            .replicas
            .find(server_id, part_id)
            .map(|r| r.version)
            .unwrap_or(chunk.version);
        let mfr = chunk
            .replicas
            .find(server_id, part_id)
            .map(|r| r.state.is_marked_for_removal())
            .unwrap_or(false);
        let state = if mfr {
            ReplicaState::TdBusy
        } else {
            ReplicaState::Busy
        };
        chunk.replicas.upsert(Replica {
            server_id,
            part_id,
            state,
            version: chunk.version,
        });
        pending.push(PendingParticipant {
            server_id,
            part_id,
            pre_op_version,
            done: false,
            last_status: None,
        });
    }

    PendingOperation {
        chunk_id: chunk.chunk_id,
        kind,
        participants: pending,
        interrupted: false,
    }
}

/// Outcome once every participant has reported (or the operation timed
/// out and is force-reconciled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Still waiting on some participant.
    Pending,
    Succeeded,
    /// Failed; the chunk has no valid replica of this operation's result.
    Failed(ChunkError),
}

/// Fold in one server's reported status (spec §4.8 step 3).
pub fn reconcile(
    chunk: &mut ChunkRecord,
    pending: &mut PendingOperation,
    server_id: ServerId,
    part_id: PartId,
    status: OpStatus,
) -> ReconcileOutcome {
    let participant = pending
        .participants
        .iter_mut()
        .find(|p| p.server_id == server_id && p.part_id == part_id);
    let Some(participant) = participant else {
        return ReconcileOutcome::Pending;
    };
    if participant.done {
        return ReconcileOutcome::Pending;
    }
    participant.done = true;
    participant.last_status = Some(status);

    let mfr = chunk
        .replicas
        .find(server_id, part_id)
        .map(|r| r.state.is_marked_for_removal())
        .unwrap_or(false);

    match status {
        OpStatus::Ok => {
            let new_state = if mfr { ReplicaState::TdValid } else { ReplicaState::Valid };
            if let Some(r) = chunk.replicas.find_mut(server_id, part_id) {
                r.state = new_state;
            }
        }
        OpStatus::NotDone => {
            // server never started: replica reverts to its pre-op version/state
            if let Some(r) = chunk.replicas.find_mut(server_id, part_id) {
                r.version = participant.pre_op_version;
                r.state = if mfr { ReplicaState::TdValid } else { ReplicaState::Valid };
            }
        }
        _ => {
            let new_state = if mfr { ReplicaState::TdValid } else { ReplicaState::Invalid };
            if let Some(r) = chunk.replicas.find_mut(server_id, part_id) {
                r.state = new_state;
            }
            pending.interrupted = true;
        }
    }

    let all_done = pending.participants.iter().all(|p| p.done);
    if !all_done {
        return ReconcileOutcome::Pending;
    }

    let any_valid = pending.participants.iter().any(|p| {
        chunk
            .replicas
            .find(p.server_id, p.part_id)
            .map(|r| r.state.is_valid_now())
            .unwrap_or(false)
    });

    if any_valid {
        if pending.interrupted {
            // emergency version bump: leave in SET_VERSION so a future
            // pass reconciles the surviving replicas against the new version
            chunk.version += 1;
            chunk.operation = OperationKind::SetVersion;
        } else {
            chunk.operation = OperationKind::None;
        }
        ReconcileOutcome::Succeeded
    } else {
        chunk.operation = OperationKind::None;
        let all_nospace = pending
            .participants
            .iter()
            .all(|p| p.last_status == Some(OpStatus::NoSpace));
        let err = if all_nospace {
            ChunkError::NoSpace
        } else {
            ChunkError::NotDone
        };
        ReconcileOutcome::Failed(err)
    }
}
