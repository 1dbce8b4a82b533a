//! Chunk-server slots and the marked-for-removal lifecycle (spec §3.4, §4.7).

use std::collections::{HashMap, HashSet};

use crate::ids::ServerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfrState {
    UnknownHard,
    UnknownSoft,
    CanBeRemoved,
    ReplInProgress,
    WasInProgress,
}

impl MfrState {
    /// Transition applied once at the end of every completed sweep
    /// (spec §4.7).
    pub fn on_loop_end(self) -> MfrState {
        match self {
            MfrState::UnknownHard => MfrState::UnknownSoft,
            MfrState::UnknownSoft => MfrState::CanBeRemoved,
            MfrState::CanBeRemoved => MfrState::CanBeRemoved,
            MfrState::ReplInProgress => MfrState::WasInProgress,
            MfrState::WasInProgress => MfrState::CanBeRemoved,
        }
    }
}

/// Outward-visible connection status (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Validating,
    Ready,
    InProgress,
}

#[derive(Debug, Clone)]
pub struct ChunkServerSlot {
    pub id: ServerId,
    pub ip: u32,
    pub port: u16,
    /// 32-bit placement label bitmask (spec §4.11).
    pub label_mask: u32,
    pub marked_for_removal: bool,
    pub mfr_state: MfrState,
    pub valid: bool,
    pub registered: bool,
    pub usage: f64,
    /// Pending operation ids on this server, for disconnect reconciliation.
    pub pending_ops: Vec<u64>,
    read_active: u32,
    write_active: u32,
}

impl ChunkServerSlot {
    pub fn status(&self) -> ServerStatus {
        if !self.valid {
            ServerStatus::Validating
        } else if !self.registered {
            ServerStatus::InProgress
        } else {
            ServerStatus::Ready
        }
    }
}

pub struct ServerRegistry {
    slots: HashMap<ServerId, ChunkServerSlot>,
    free_ids: Vec<u16>,
    next_id: u16,
    ip_index: HashMap<u32, HashSet<ServerId>>,
    /// Servers disconnected but not yet swept (spec §4.7).
    deferred_disconnect: Vec<ServerId>,
    /// Global connect/register-in-progress counter (spec §8 B1: CHUNKLOST
    /// vs EAGAIN hinges on this reaching zero).
    connects_in_progress: u32,
}

impl ServerRegistry {
    pub fn new() -> Self {
        ServerRegistry {
            slots: HashMap::new(),
            free_ids: Vec::new(),
            next_id: 0,
            ip_index: HashMap::new(),
            deferred_disconnect: Vec::new(),
            connects_in_progress: 0,
        }
    }

    pub fn connect(&mut self, ip: u32, port: u16, label_mask: u32) -> ServerId {
        let id = if let Some(id) = self.free_ids.pop() {
            ServerId(id)
        } else {
            let id = ServerId(self.next_id);
            self.next_id += 1;
            id
        };
        self.slots.insert(
            id,
            ChunkServerSlot {
                id,
                ip,
                port,
                label_mask,
                marked_for_removal: false,
                mfr_state: MfrState::CanBeRemoved,
                valid: false,
                registered: false,
                usage: 0.0,
                pending_ops: Vec::new(),
                read_active: 0,
                write_active: 0,
            },
        );
        self.ip_index.entry(ip).or_default().insert(id);
        self.connects_in_progress += 1;
        id
    }

    pub fn register_end(&mut self, id: ServerId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.valid = true;
            slot.registered = true;
        }
        self.connects_in_progress = self.connects_in_progress.saturating_sub(1);
    }

    pub fn connects_in_progress(&self) -> u32 {
        self.connects_in_progress
    }

    pub fn get(&self, id: ServerId) -> Option<&ChunkServerSlot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut ChunkServerSlot> {
        self.slots.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkServerSlot> {
        self.slots.values()
    }

    pub fn candidates(&self) -> impl Iterator<Item = &ChunkServerSlot> {
        self.slots.values().filter(|s| s.status() == ServerStatus::Ready)
    }

    pub fn servers_with_ip(&self, ip: u32) -> impl Iterator<Item = ServerId> + '_ {
        self.ip_index
            .get(&ip)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Begin disconnect: move to the deferred queue, mark `UnknownHard`
    /// (spec §4.7). Returns the removed slot so the caller (the chunk
    /// registry sweep) can drop its replicas and finalize pending ops.
    pub fn disconnect(&mut self, id: ServerId) -> Option<ChunkServerSlot> {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.valid = false;
            slot.mfr_state = MfrState::UnknownHard;
        }
        self.deferred_disconnect.push(id);
        None::<ChunkServerSlot> // actual removal happens in `finish_disconnect`
    }

    /// Pop the next deferred-disconnect server, fully removing its slot.
    /// Called by the bounded background walk (spec §4.7).
    pub fn finish_disconnect(&mut self) -> Option<ChunkServerSlot> {
        let id = self.deferred_disconnect.pop()?;
        if let Some(slot) = self.slots.remove(&id) {
            if let Some(set) = self.ip_index.get_mut(&slot.ip) {
                set.remove(&id);
            }
            self.free_ids.push(id.0);
            Some(slot)
        } else {
            None
        }
    }

    pub fn has_pending_disconnects(&self) -> bool {
        !self.deferred_disconnect.is_empty()
    }

    /// Rotate every registered server's `mfr_state` at the end of a
    /// completed sweep (spec §4.3, §4.7).
    pub fn rotate_mfr_states(&mut self) {
        for slot in self.slots.values_mut() {
            slot.mfr_state = slot.mfr_state.on_loop_end();
        }
    }

    pub fn mark_undergoal_from_mfr(&mut self, id: ServerId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.mfr_state = MfrState::ReplInProgress;
        }
    }

    pub fn read_active(&self, id: ServerId) -> u32 {
        self.slots.get(&id).map(|s| s.read_active).unwrap_or(0)
    }

    pub fn write_active(&self, id: ServerId) -> u32 {
        self.slots.get(&id).map(|s| s.write_active).unwrap_or(0)
    }

    pub fn begin_read(&mut self, id: ServerId) {
        if let Some(s) = self.slots.get_mut(&id) {
            s.read_active += 1;
        }
    }

    pub fn end_read(&mut self, id: ServerId) {
        if let Some(s) = self.slots.get_mut(&id) {
            s.read_active = s.read_active.saturating_sub(1);
        }
    }

    pub fn begin_write(&mut self, id: ServerId) {
        if let Some(s) = self.slots.get_mut(&id) {
            s.write_active += 1;
        }
    }

    pub fn end_write(&mut self, id: ServerId) {
        if let Some(s) = self.slots.get_mut(&id) {
            s.write_active = s.write_active.saturating_sub(1);
        }
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_allocates_then_recycles_ids() {
        let mut reg = ServerRegistry::new();
        let a = reg.connect(1, 9001, 0);
        let b = reg.connect(2, 9001, 0);
        assert_ne!(a, b);
        reg.disconnect(a);
        let removed = reg.finish_disconnect().unwrap();
        assert_eq!(removed.id, a);
        let c = reg.connect(3, 9001, 0);
        assert_eq!(c, a, "freed id should be recycled");
    }

    #[test]
    fn mfr_state_rotation_matches_spec_table() {
        use MfrState::*;
        assert_eq!(UnknownHard.on_loop_end(), UnknownSoft);
        assert_eq!(UnknownSoft.on_loop_end(), CanBeRemoved);
        assert_eq!(CanBeRemoved.on_loop_end(), CanBeRemoved);
        assert_eq!(ReplInProgress.on_loop_end(), WasInProgress);
        assert_eq!(WasInProgress.on_loop_end(), CanBeRemoved);
    }

    #[test]
    fn ip_index_tracks_membership() {
        let mut reg = ServerRegistry::new();
        let a = reg.connect(42, 9001, 0);
        let b = reg.connect(42, 9002, 0);
        let mut ids: Vec<_> = reg.servers_with_ip(42).collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
