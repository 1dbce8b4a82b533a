//! End-to-end scenarios exercised through the public `Core` API.

use chunk_core::chunk::{PartId, ReplicaState, EC8_BASE, PART_COPY};
use chunk_core::config::Tunables;
use chunk_core::core::Core;
use chunk_core::ids::{ChunkId, SclassId};
use chunk_core::operation::OpStatus;
use chunk_core::storage_class::StorageClassDef;

fn two_server_core(goal: u8) -> (Core, chunk_core::ids::ServerId, chunk_core::ids::ServerId) {
    let mut core = Core::new(Tunables::default());
    core.storage_classes_mut()
        .insert(StorageClassDef::copies(SclassId(1), "default", goal));
    let a = core.connected(10, 9001, 0);
    core.register_end(a);
    let b = core.connected(20, 9001, 0);
    core.register_end(b);
    (core, a, b)
}

/// A freshly created chunk with goal 2 lands on two distinct servers and
/// becomes fully readable once both report success.
#[test]
fn create_then_confirm_both_replicas_reaches_quiescence() {
    let (mut core, a, b) = two_server_core(2);
    let (chunk_id, servers) = core.create(SclassId(1)).unwrap();
    assert_eq!(servers.len(), 2);

    core.got_op_status(chunk_id, a, PART_COPY, OpStatus::Ok, 0).unwrap();
    core.got_op_status(chunk_id, b, PART_COPY, OpStatus::Ok, 0).unwrap();

    let version = core.read_check(chunk_id).unwrap();
    assert_eq!(version, 1);
    for _ in 0..3 {
        core.tick(10);
    }
    assert_eq!(core.danger_total(), 0);
}

/// Losing a replica out from under a chunk drops it below goal and the
/// scheduler notices on the next danger-priority pass.
#[test]
fn server_disconnect_drives_chunk_into_undergoal() {
    let (mut core, a, b) = two_server_core(2);
    let (chunk_id, _) = core.create(SclassId(1)).unwrap();
    core.got_op_status(chunk_id, a, PART_COPY, OpStatus::Ok, 0).unwrap();
    core.got_op_status(chunk_id, b, PART_COPY, OpStatus::Ok, 0).unwrap();

    core.lost(chunk_id, b, PART_COPY);
    core.tick(10);
    assert!(core.danger_total() > 0, "losing a replica must raise a danger priority");

    let (_, data) = core.get_version_and_csdata(chunk_id).unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].0, a);
}

/// A chunk with a single remaining copy and a high goal is the most urgent
/// danger class; the queue total reflects it even before a tick runs.
#[test]
fn single_copy_with_high_goal_is_flagged_immediately_on_damage() {
    let (mut core, a, b) = two_server_core(3);
    core.storage_classes_mut()
        .insert(StorageClassDef::copies(SclassId(1), "default", 3));
    let c = core.connected(30, 9001, 0);
    core.register_end(c);

    let (chunk_id, servers) = core.create(SclassId(1)).unwrap();
    assert_eq!(servers.len(), 3);
    for s in &servers {
        core.got_op_status(chunk_id, *s, PART_COPY, OpStatus::Ok, 0).unwrap();
    }

    core.damaged(chunk_id, b, PART_COPY);
    core.damaged(chunk_id, c, PART_COPY);
    assert!(core.danger_total() > 0);
    let _ = a;
}

/// A chunk server reporting an unexpected chunk (never created through
/// this core) gets an orphan record with a protective lock rather than
/// being silently dropped.
#[test]
fn unexpected_chunk_report_creates_a_locked_orphan() {
    let mut core = Core::new(Tunables::default());
    let s = core.connected(1, 9001, 0);
    core.register_end(s);

    core.has_chunk(s, ChunkId(555), PART_COPY, 7, 1_000);
    let (version, data) = core.get_version_and_csdata(ChunkId(555)).unwrap();
    assert_eq!(version, 7);
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].2, ReplicaState::Valid);

    // still locked: read_check succeeds but the chunk is protected from
    // premature collection regardless of file references.
    assert!(core.read_check(ChunkId(555)).is_ok());
}

/// Erasure-coded parts are tracked by their own `PartId` range and are
/// distinguishable from full copies in the replica listing.
#[test]
fn ec8_parts_are_reported_with_their_storage_mode_intact() {
    let mut core = Core::new(Tunables::default());
    let s = core.connected(1, 9001, 0);
    core.register_end(s);
    let part = PartId(EC8_BASE);
    core.has_chunk(s, ChunkId(9), part, 1, 0);
    let (_, data) = core.get_version_and_csdata(ChunkId(9)).unwrap();
    assert_eq!(data[0].1, part);
    assert!(part.is_ec8());
}

/// A SET_VERSION operation that never reaches any server (every participant
/// times out) leaves the chunk reporting an error rather than silently
/// succeeding at the bumped version, and re-queues it for attention.
#[test]
fn set_version_failure_reports_nospace_and_requeues() {
    let (mut core, a, _b) = two_server_core(1);
    let (chunk_id, _) = core.create(SclassId(1)).unwrap();
    core.got_op_status(chunk_id, a, PART_COPY, OpStatus::Ok, 0).unwrap();

    core.set_version(chunk_id, 10).unwrap();
    let err = core.got_op_status(chunk_id, a, PART_COPY, OpStatus::NoSpace, 10);
    assert!(err.is_err());
    assert!(core.danger_total() > 0);
}
