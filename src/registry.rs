//! The chunk registry: an open-addressed, incrementally-rehashed hash table
//! keyed by 64-bit chunk id (spec §4.1).
//!
//! Growth moves a bounded number of entries out of the old table on every
//! mutating call instead of copying the whole table at once, so a single
//! `insert`/`remove` never pays for the full rehash. Rust's `Vec<Slot>`
//! gives pointer-stable *indices* (not pointers) across this move, which is
//! all callers ever hold onto — see the design note in `file_count.rs` for
//! why that substitution is sound here.

use crate::chunk::ChunkRecord;
use crate::ids::ChunkId;

const MOVEFACTOR: usize = 16;
const INITIAL_CAPACITY: usize = 64;

enum Slot {
    Empty,
    Tombstone,
    Occupied(ChunkRecord),
}

fn hash(id: ChunkId) -> u64 {
    // splitmix64 finalizer: cheap, well-distributed, no external crate.
    let mut z = id.0.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

pub struct ChunkRegistry {
    table: Vec<Slot>,
    mask: usize,
    old_table: Vec<Slot>,
    old_cursor: usize,
    count: usize,
    cache: Option<(ChunkId, usize)>,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        let mut table = Vec::with_capacity(INITIAL_CAPACITY);
        table.resize_with(INITIAL_CAPACITY, || Slot::Empty);
        ChunkRegistry {
            table,
            mask: INITIAL_CAPACITY - 1,
            old_table: Vec::new(),
            old_cursor: 0,
            count: 0,
            cache: None,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    fn index_in(table: &[Slot], mask: usize, id: ChunkId) -> Option<usize> {
        let mut i = (hash(id) as usize) & mask;
        for _ in 0..table.len() {
            match &table[i] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(c) if c.chunk_id == id => return Some(i),
                Slot::Occupied(_) => {}
            }
            i = (i + 1) & mask;
        }
        None
    }

    fn insert_into(table: &mut Vec<Slot>, mask: usize, record: ChunkRecord) {
        let id = record.chunk_id;
        let mut i = (hash(id) as usize) & mask;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &table[i] {
                Slot::Empty => {
                    let slot = first_tombstone.unwrap_or(i);
                    table[slot] = Slot::Occupied(record);
                    return;
                }
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(i);
                    }
                }
                Slot::Occupied(c) if c.chunk_id == id => {
                    table[i] = Slot::Occupied(record);
                    return;
                }
                Slot::Occupied(_) => {}
            }
            i = (i + 1) & mask;
        }
    }

    /// Move up to `MOVEFACTOR` entries out of the old table.
    fn step_rehash(&mut self) {
        if self.old_table.is_empty() {
            return;
        }
        let mut moved = 0;
        while moved < MOVEFACTOR && self.old_cursor < self.old_table.len() {
            if let Slot::Occupied(_) = self.old_table[self.old_cursor] {
                let taken = std::mem::replace(&mut self.old_table[self.old_cursor], Slot::Tombstone);
                if let Slot::Occupied(record) = taken {
                    Self::insert_into(&mut self.table, self.mask, record);
                    moved += 1;
                }
            }
            self.old_cursor += 1;
        }
        if self.old_cursor >= self.old_table.len() {
            self.old_table = Vec::new();
            self.old_cursor = 0;
            self.cache = None;
        }
    }

    fn maybe_start_rehash(&mut self) {
        if self.old_table.is_empty() && self.count > self.table.len() {
            let new_cap = self.table.len() * 2;
            let mut new_table = Vec::with_capacity(new_cap);
            new_table.resize_with(new_cap, || Slot::Empty);
            self.old_table = std::mem::replace(&mut self.table, new_table);
            self.old_cursor = 0;
            self.mask = new_cap - 1;
            self.cache = None;
        }
    }

    pub fn find(&mut self, id: ChunkId) -> Option<&ChunkRecord> {
        self.step_rehash();
        if let Some((cached_id, idx)) = self.cache {
            if cached_id == id {
                if let Slot::Occupied(c) = &self.table[idx] {
                    return Some(c);
                }
            }
        }
        if let Some(idx) = Self::index_in(&self.table, self.mask, id) {
            self.cache = Some((id, idx));
            if let Slot::Occupied(c) = &self.table[idx] {
                return Some(c);
            }
        }
        if let Some(idx) = Self::index_in(&self.old_table, self.old_table.len().saturating_sub(1).max(1), id) {
            if let Slot::Occupied(c) = &self.old_table[idx] {
                return Some(c);
            }
        }
        None
    }

    pub fn find_mut(&mut self, id: ChunkId) -> Option<&mut ChunkRecord> {
        self.step_rehash();
        self.cache = None; // a mutable borrow may move the record's contents meaning-wise
        if let Some(idx) = Self::index_in(&self.table, self.mask, id) {
            if let Slot::Occupied(c) = &mut self.table[idx] {
                return Some(c);
            }
        }
        if !self.old_table.is_empty() {
            let old_mask = (self.old_table.len() - 1).max(1);
            if let Some(idx) = Self::index_in(&self.old_table, old_mask, id) {
                if let Slot::Occupied(c) = &mut self.old_table[idx] {
                    return Some(c);
                }
            }
        }
        None
    }

    pub fn contains(&mut self, id: ChunkId) -> bool {
        self.find(id).is_some()
    }

    /// Insert, replacing any existing record with the same id.
    pub fn insert(&mut self, record: ChunkRecord) {
        self.step_rehash();
        let id = record.chunk_id;
        // remove a stale copy still sitting in the old table, if any
        if !self.old_table.is_empty() {
            let old_mask = (self.old_table.len() - 1).max(1);
            if let Some(idx) = Self::index_in(&self.old_table, old_mask, id) {
                self.old_table[idx] = Slot::Tombstone;
            }
        }
        let existed = Self::index_in(&self.table, self.mask, id).is_some();
        Self::insert_into(&mut self.table, self.mask, record);
        if !existed {
            self.count += 1;
        }
        self.cache = None;
        self.maybe_start_rehash();
    }

    pub fn remove(&mut self, id: ChunkId) -> Option<ChunkRecord> {
        self.step_rehash();
        self.cache = None;
        if let Some(idx) = Self::index_in(&self.table, self.mask, id) {
            let taken = std::mem::replace(&mut self.table[idx], Slot::Tombstone);
            if let Slot::Occupied(record) = taken {
                self.count -= 1;
                return Some(record);
            }
        }
        if !self.old_table.is_empty() {
            let old_mask = (self.old_table.len() - 1).max(1);
            if let Some(idx) = Self::index_in(&self.old_table, old_mask, id) {
                let taken = std::mem::replace(&mut self.old_table[idx], Slot::Tombstone);
                if let Slot::Occupied(record) = taken {
                    self.count -= 1;
                    return Some(record);
                }
            }
        }
        None
    }

    /// Iterate over every occupied slot (used by the loop sweep, spec §4.3).
    pub fn iter(&self) -> impl Iterator<Item = &ChunkRecord> {
        self.table
            .iter()
            .chain(self.old_table.iter())
            .filter_map(|s| match s {
                Slot::Occupied(c) => Some(c),
                _ => None,
            })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChunkRecord> {
        self.table
            .iter_mut()
            .chain(self.old_table.iter_mut())
            .filter_map(|s| match s {
                Slot::Occupied(c) => Some(c),
                _ => None,
            })
    }

    /// The step pattern the loop sweep (spec §4.3) walks: every bucket index
    /// of the *current primary* table, used as the deterministic traversal
    /// order for one tick's worth of sweeping.
    pub fn bucket_count(&self) -> usize {
        self.table.len()
    }

    pub fn record_at_bucket(&self, bucket: usize) -> Option<&ChunkRecord> {
        match self.table.get(bucket) {
            Some(Slot::Occupied(c)) => Some(c),
            _ => None,
        }
    }
}

impl Default for ChunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SclassId;

    fn rec(id: u64) -> ChunkRecord {
        ChunkRecord::new(ChunkId(id), 1, SclassId(0))
    }

    #[test]
    fn insert_find_remove_roundtrip() {
        let mut reg = ChunkRegistry::new();
        reg.insert(rec(42));
        assert!(reg.find(ChunkId(42)).is_some());
        assert!(reg.find(ChunkId(43)).is_none());
        let removed = reg.remove(ChunkId(42)).unwrap();
        assert_eq!(removed.chunk_id, ChunkId(42));
        assert!(reg.find(ChunkId(42)).is_none());
    }

    #[test]
    fn incremental_rehash_preserves_all_entries() {
        let mut reg = ChunkRegistry::new();
        for i in 0..2000u64 {
            reg.insert(rec(i));
        }
        assert_eq!(reg.len(), 2000);
        for i in 0..2000u64 {
            assert!(reg.find(ChunkId(i)).is_some(), "missing chunk {i}");
        }
    }

    #[test]
    fn insert_overwrites_existing_id() {
        let mut reg = ChunkRegistry::new();
        reg.insert(rec(1));
        let mut replacement = rec(1);
        replacement.version = 99;
        reg.insert(replacement);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.find(ChunkId(1)).unwrap().version, 99);
    }

    #[test]
    fn repeated_find_hits_the_cache_path() {
        let mut reg = ChunkRegistry::new();
        reg.insert(rec(7));
        assert!(reg.find(ChunkId(7)).is_some());
        assert!(reg.find(ChunkId(7)).is_some());
    }
}
