// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Indexes archetypes by content hash and memoizes the add/remove adjacency
//! between neighboring archetypes.

use ahash::RandomState;
use smallvec::SmallVec;
use std::collections::HashMap;

use crate::archetype::{hash_kinds, Archetype, ArchetypeId, DEFAULT_CHUNK_CAPACITY};
use crate::component::{ComponentId, ComponentRegistry};
use crate::entity::EntityId;
use crate::tick::Tick;

/// The outcome of moving one row from a source archetype into a destination
/// archetype during a structural change (add/remove component, spawn).
pub struct RowMove {
    /// The row the entity now occupies in the destination archetype.
    pub new_row: usize,
    /// The entity that was swapped into the source row's old slot, if any.
    pub displaced: Option<EntityId>,
    /// Pointers for component kinds present in the destination but not the
    /// source; the caller must initialize each of these exactly once.
    pub new_kind_ptrs: SmallVec<[(ComponentId, *mut u8); 4]>,
}

/// Owns every archetype in a world and the hash index used to resolve a
/// kind set to its archetype in O(1), plus the memoized `traverse_add` /
/// `traverse_remove` adjacency.
pub struct ArchetypeGraph {
    archetypes: Vec<Archetype>,
    by_hash: HashMap<u64, ArchetypeId, RandomState>,
    generation: u64,
    chunk_capacity: usize,
    hysteresis_fraction: f64,
}

impl ArchetypeGraph {
    pub fn new(chunk_capacity: usize, hysteresis_fraction: f64, registry: &ComponentRegistry) -> Self {
        let empty = Archetype::new(ArchetypeId(0), SmallVec::new(), registry, chunk_capacity, hysteresis_fraction);
        let mut by_hash = HashMap::default();
        by_hash.insert(empty.hash(), ArchetypeId(0));
        Self {
            archetypes: vec![empty],
            by_hash,
            generation: 1,
            chunk_capacity,
            hysteresis_fraction,
        }
    }

    pub fn with_default_capacity(registry: &ComponentRegistry) -> Self {
        Self::new(DEFAULT_CHUNK_CAPACITY, 0.5, registry)
    }

    pub fn empty_archetype(&self) -> ArchetypeId {
        ArchetypeId(0)
    }

    pub fn get(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.index()]
    }

    pub fn get_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id.index()]
    }

    /// Bumped every time a new archetype is created; query planners use this
    /// to invalidate their cached matched-archetype lists.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn iter(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// O(1) lookup of the archetype exactly matching `kinds` (order-independent).
    pub fn archetype_of(&self, kinds: &[ComponentId]) -> Option<ArchetypeId> {
        let mut sorted: SmallVec<[ComponentId; 8]> = SmallVec::from_slice(kinds);
        sorted.sort_unstable();
        self.by_hash.get(&hash_kinds(&sorted)).copied()
    }

    fn get_or_create(&mut self, sorted_kinds: SmallVec<[ComponentId; 8]>, registry: &ComponentRegistry) -> ArchetypeId {
        let hash = hash_kinds(&sorted_kinds);
        if let Some(&id) = self.by_hash.get(&hash) {
            return id;
        }
        let id = ArchetypeId(self.archetypes.len() as u32);
        let archetype = Archetype::new(id, sorted_kinds, registry, self.chunk_capacity, self.hysteresis_fraction);
        self.by_hash.insert(archetype.hash(), id);
        self.archetypes.push(archetype);
        self.generation += 1;
        id
    }

    /// The archetype reached by adding `kind` to `from`. Memoized on both
    /// endpoints so that `traverse_remove(traverse_add(A, k), k) == A`
    /// returns the cached edge rather than recomputing it.
    pub fn traverse_add(&mut self, from: ArchetypeId, kind: ComponentId, registry: &ComponentRegistry) -> ArchetypeId {
        if let Some(&to) = self.archetypes[from.index()].add_edges.get(&kind) {
            return to;
        }
        if self.archetypes[from.index()].contains(kind) {
            return from;
        }
        let mut kinds: SmallVec<[ComponentId; 8]> = SmallVec::from_slice(self.archetypes[from.index()].kinds());
        kinds.push(kind);
        kinds.sort_unstable();
        let to = self.get_or_create(kinds, registry);
        self.archetypes[from.index()].add_edges.insert(kind, to);
        self.archetypes[to.index()].remove_edges.insert(kind, from);
        to
    }

    /// Symmetric to `traverse_add`.
    pub fn traverse_remove(&mut self, from: ArchetypeId, kind: ComponentId, registry: &ComponentRegistry) -> ArchetypeId {
        if let Some(&to) = self.archetypes[from.index()].remove_edges.get(&kind) {
            return to;
        }
        if !self.archetypes[from.index()].contains(kind) {
            return from;
        }
        let mut kinds: SmallVec<[ComponentId; 8]> = SmallVec::from_slice(self.archetypes[from.index()].kinds());
        kinds.retain(|&k| k != kind);
        let to = self.get_or_create(kinds, registry);
        self.archetypes[from.index()].remove_edges.insert(kind, to);
        self.archetypes[to.index()].add_edges.insert(kind, from);
        to
    }

    /// Rebase every archetype's stored ticks; called from the world's
    /// periodic tick maintenance pass.
    pub fn rebase_ticks(&mut self, engine: &crate::tick::ChangeTickEngine) {
        for archetype in &mut self.archetypes {
            archetype.rebase_ticks(engine);
        }
    }

    fn borrow_pair_mut(&mut self, first: ArchetypeId, second: ArchetypeId) -> (&mut Archetype, &mut Archetype) {
        assert_ne!(first, second, "move_row requires distinct archetypes");
        let (lo, hi, swapped) = if first.index() < second.index() {
            (first, second, false)
        } else {
            (second, first, true)
        };
        let (left, right) = self.archetypes.split_at_mut(hi.index());
        let lo_ref = &mut left[lo.index()];
        let hi_ref = &mut right[0];
        if swapped {
            (hi_ref, lo_ref)
        } else {
            (lo_ref, hi_ref)
        }
    }

    /// Move the entity at `row` in `from` into `to`, copying every shared
    /// component's bytes and dropping any that `to` no longer carries.
    /// Columns `to` has that `from` didn't are returned as raw pointers for
    /// the caller to initialize.
    pub fn move_row(
        &mut self,
        from: ArchetypeId,
        row: usize,
        to: ArchetypeId,
        tick: Tick,
        registry: &ComponentRegistry,
    ) -> RowMove {
        let entity = self.archetypes[from.index()].entity_at(row);
        let (src, dst) = self.borrow_pair_mut(from, to);
        let (new_row, ptrs) = dst.allocate_row(entity, tick);

        let mut new_kind_ptrs = SmallVec::new();
        for (&kind, &dst_ptr) in dst.kinds().iter().zip(ptrs.iter()) {
            if src.contains(kind) {
                let size = registry.describe(kind).size;
                unsafe {
                    let src_ptr = src.column_row_ptr(kind, row);
                    if size > 0 {
                        std::ptr::copy_nonoverlapping(src_ptr, dst_ptr, size);
                    }
                }
            } else {
                new_kind_ptrs.push((kind, dst_ptr));
            }
        }

        let dst_has = |kind: ComponentId| dst.contains(kind);
        let displaced = src.vacate_row_selective(row, dst_has);

        RowMove {
            new_row,
            displaced,
            new_kind_ptrs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;

    #[derive(Debug, Clone, Copy)]
    struct A(u32);
    #[derive(Debug, Clone, Copy)]
    struct B(u32);

    #[test]
    fn traverse_add_then_remove_is_identity() {
        let mut registry = ComponentRegistry::new();
        let a = registry.register::<A>().unwrap();
        let b = registry.register::<B>().unwrap();
        let mut graph = ArchetypeGraph::new(4, 0.5, &registry);

        let empty = graph.empty_archetype();
        let with_a = graph.traverse_add(empty, a, &registry);
        let with_ab = graph.traverse_add(with_a, b, &registry);
        let back_to_a = graph.traverse_remove(with_ab, b, &registry);
        assert_eq!(back_to_a, with_a);
        let back_to_empty = graph.traverse_remove(back_to_a, a, &registry);
        assert_eq!(back_to_empty, empty);
    }

    #[test]
    fn traverse_add_is_memoized() {
        let mut registry = ComponentRegistry::new();
        let a = registry.register::<A>().unwrap();
        let mut graph = ArchetypeGraph::new(4, 0.5, &registry);
        let empty = graph.empty_archetype();
        let first = graph.traverse_add(empty, a, &registry);
        let second = graph.traverse_add(empty, a, &registry);
        assert_eq!(first, second);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn move_row_copies_shared_and_exposes_new_kind() {
        let mut registry = ComponentRegistry::new();
        let a = registry.register::<A>().unwrap();
        let b = registry.register::<B>().unwrap();
        let mut graph = ArchetypeGraph::new(4, 0.5, &registry);

        let empty = graph.empty_archetype();
        let with_a = graph.traverse_add(empty, a, &registry);
        let with_ab = graph.traverse_add(with_a, b, &registry);

        let entity = EntityId::from_raw_for_test(0, 0);
        let (row, ptrs) = graph.get_mut(with_a).allocate_row(entity, Tick(1));
        unsafe { (ptrs[0] as *mut A).write(A(42)) };

        let mv = graph.move_row(with_a, row, with_ab, Tick(2), &registry);
        assert_eq!(mv.new_kind_ptrs.len(), 1);
        assert_eq!(mv.new_kind_ptrs[0].0, b);
        unsafe { (mv.new_kind_ptrs[0].1 as *mut B).write(B(7)) };

        let moved_a = unsafe { &*(graph.get(with_ab).column_row_ptr(a, mv.new_row) as *const A) };
        assert_eq!(moved_a.0, 42);
        assert_eq!(graph.get(with_a).len(), 0);
    }
}
