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

//! Archetype column storage: one archetype per distinct, sorted component
//! kind set, with chunk-quantized column capacity and per-cell change ticks.

use std::hash::{Hash, Hasher};

use ahash::RandomState;
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use std::collections::HashMap;

use crate::component::{ComponentId, ComponentRegistry, RawColumn};
use crate::entity::EntityId;
use crate::tick::Tick;

/// Power-of-two row capacity of one logical chunk, the default from §6.
pub const DEFAULT_CHUNK_CAPACITY: usize = 4096;

/// Stable id of an archetype within a world's archetype graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ArchetypeId(pub u32);

impl ArchetypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Permutation-independent content hash of a sorted kind set.
pub fn hash_kinds(kinds: &[ComponentId]) -> u64 {
    let mut hasher = FxHasher::default();
    kinds.hash(&mut hasher);
    hasher.finish()
}

struct ArchetypeColumn {
    data: RawColumn,
    added: Vec<Tick>,
    changed: Vec<Tick>,
}

impl ArchetypeColumn {
    fn new(data: RawColumn) -> Self {
        Self {
            data,
            added: Vec::new(),
            changed: Vec::new(),
        }
    }

    fn push_uninit(&mut self, tick: Tick) -> *mut u8 {
        let ptr = self.data.push_uninit();
        self.added.push(tick);
        self.changed.push(tick);
        ptr
    }

    /// # Safety
    /// `row` must be `< len`.
    unsafe fn swap_remove_drop(&mut self, row: usize) {
        self.data.swap_remove_drop(row);
        self.added.swap_remove(row);
        self.changed.swap_remove(row);
    }

    /// # Safety
    /// `row` must be `< len`. Caller has already taken ownership of the bytes.
    unsafe fn swap_remove_no_drop(&mut self, row: usize) {
        self.data.swap_remove_no_drop(row);
        self.added.swap_remove(row);
        self.changed.swap_remove(row);
    }

    fn shrink_to(&mut self, rows: usize) {
        self.data.shrink_to(rows);
    }
}

/// Column storage for one distinct, sorted component kind set. Rows
/// `[0, len)` are live and contiguous, column capacity grows in
/// `chunk_capacity`-row increments and is released back down once the
/// fraction of trailing empty chunks exceeds `hysteresis_fraction`.
///
/// Chunks are not separate allocations: a "chunk" is a `chunk_capacity`-row
/// window of one contiguous per-kind column, which keeps cross-chunk row
/// moves a single memcpy instead of a cross-allocation copy while still
/// satisfying chunk-quantized growth/release and chunk-at-a-time iteration
/// (see `chunk_ranges`). Recorded as a deliberate simplification in
/// `DESIGN.md`.
pub struct Archetype {
    id: ArchetypeId,
    kinds: SmallVec<[ComponentId; 8]>,
    hash: u64,
    columns: Vec<ArchetypeColumn>,
    entities: Vec<EntityId>,
    chunk_capacity: usize,
    hysteresis_fraction: f64,
    pub(crate) add_edges: HashMap<ComponentId, ArchetypeId, RandomState>,
    pub(crate) remove_edges: HashMap<ComponentId, ArchetypeId, RandomState>,
}

impl Archetype {
    pub fn new(
        id: ArchetypeId,
        mut kinds: SmallVec<[ComponentId; 8]>,
        registry: &ComponentRegistry,
        chunk_capacity: usize,
        hysteresis_fraction: f64,
    ) -> Self {
        kinds.sort_unstable();
        let hash = hash_kinds(&kinds);
        let columns = kinds
            .iter()
            .map(|&kind| ArchetypeColumn::new(registry.array_factory(kind)))
            .collect();
        Self {
            id,
            kinds,
            hash,
            columns,
            entities: Vec::new(),
            chunk_capacity,
            hysteresis_fraction,
            add_edges: HashMap::default(),
            remove_edges: HashMap::default(),
        }
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn kinds(&self) -> &[ComponentId] {
        &self.kinds
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn contains(&self, kind: ComponentId) -> bool {
        self.kinds.binary_search(&kind).is_ok()
    }

    pub fn is_superset_of(&self, required: &[ComponentId]) -> bool {
        required.iter().all(|k| self.contains(*k))
    }

    pub fn is_disjoint_from(&self, forbidden: &[ComponentId]) -> bool {
        forbidden.iter().all(|k| !self.contains(*k))
    }

    pub fn column_index(&self, kind: ComponentId) -> Option<usize> {
        self.kinds.binary_search(&kind).ok()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.len() == 0
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn entity_at(&self, row: usize) -> EntityId {
        self.entities[row]
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Logical `(chunk_index, slot)` coordinates of a row.
    pub fn chunk_coords(&self, row: usize) -> (usize, usize) {
        (row / self.chunk_capacity, row % self.chunk_capacity)
    }

    /// Row ranges of each live logical chunk, for chunk-at-a-time iteration.
    pub fn chunk_ranges(&self) -> Vec<std::ops::Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = 0;
        while start < self.entities.len() {
            let end = (start + self.chunk_capacity).min(self.entities.len());
            ranges.push(start..end);
            start = end;
        }
        ranges
    }

    /// Reserve a new row across every column, returning its index and one
    /// writable, uninitialized pointer per kind (parallel to `self.kinds()`).
    /// The caller must initialize every returned pointer exactly once.
    pub fn allocate_row(&mut self, entity: EntityId, tick: Tick) -> (usize, SmallVec<[*mut u8; 8]>) {
        let row = self.entities.len();
        self.entities.push(entity);
        let ptrs = self.columns.iter_mut().map(|c| c.push_uninit(tick)).collect();
        (row, ptrs)
    }

    /// # Safety
    /// `row` must be `< len()` and `kind` must be a column of this archetype.
    pub unsafe fn column_row_ptr(&self, kind: ComponentId, row: usize) -> *const u8 {
        let ci = self.column_index(kind).expect("kind not in archetype");
        self.columns[ci].data.row_ptr(row)
    }

    /// # Safety
    /// `row` must be `< len()` and `kind` must be a column of this archetype.
    pub unsafe fn column_row_mut_ptr(&mut self, kind: ComponentId, row: usize) -> *mut u8 {
        let ci = self.column_index(kind).expect("kind not in archetype");
        self.columns[ci].data.row_mut_ptr(row)
    }

    pub fn mark_changed(&mut self, kind: ComponentId, row: usize, tick: Tick) {
        if let Some(ci) = self.column_index(kind) {
            self.columns[ci].changed[row] = tick;
        }
    }

    pub fn added_tick(&self, kind: ComponentId, row: usize) -> Option<Tick> {
        self.column_index(kind).map(|ci| self.columns[ci].added[row])
    }

    pub fn changed_tick(&self, kind: ComponentId, row: usize) -> Option<Tick> {
        self.column_index(kind).map(|ci| self.columns[ci].changed[row])
    }

    /// Remove `row`, dropping its values. Returns the entity that was moved
    /// into `row`'s slot (the former last row), if any.
    pub fn remove_row(&mut self, row: usize) -> Option<EntityId> {
        debug_assert!(row < self.entities.len());
        let last = self.entities.len() - 1;
        let moved = row != last;
        let displaced = if moved { Some(self.entities[last]) } else { None };
        for col in &mut self.columns {
            unsafe { col.swap_remove_drop(row) };
        }
        self.entities.swap_remove(row);
        displaced
    }

    /// Remove `row` without dropping its values, because the caller already
    /// moved every column's bytes out (used mid-archetype-transition). Returns
    /// the entity displaced into `row`, if any.
    pub fn vacate_row_moved(&mut self, row: usize) -> Option<EntityId> {
        debug_assert!(row < self.entities.len());
        let last = self.entities.len() - 1;
        let moved = row != last;
        let displaced = if moved { Some(self.entities[last]) } else { None };
        for col in &mut self.columns {
            unsafe { col.swap_remove_no_drop(row) };
        }
        self.entities.swap_remove(row);
        displaced
    }

    /// Remove `row`, dropping only the columns for which `moved_out` returns
    /// `false` (the rest have already had their bytes moved into another
    /// archetype by the caller). Returns the entity displaced into `row`.
    pub fn vacate_row_selective<F: Fn(ComponentId) -> bool>(&mut self, row: usize, moved_out: F) -> Option<EntityId> {
        debug_assert!(row < self.entities.len());
        let last = self.entities.len() - 1;
        let moved = row != last;
        let displaced = if moved { Some(self.entities[last]) } else { None };
        for (i, col) in self.columns.iter_mut().enumerate() {
            let kind = self.kinds[i];
            unsafe {
                if moved_out(kind) {
                    col.swap_remove_no_drop(row);
                } else {
                    col.swap_remove_drop(row);
                }
            }
        }
        self.entities.swap_remove(row);
        displaced
    }

    /// Clamp every stored added/changed tick so its distance from the
    /// engine's current tick never exceeds the maintenance threshold.
    pub fn rebase_ticks(&mut self, engine: &crate::tick::ChangeTickEngine) {
        for col in &mut self.columns {
            for t in col.added.iter_mut().chain(col.changed.iter_mut()) {
                *t = engine.rebase(*t);
            }
        }
    }

    /// Release backing storage for fully-empty trailing chunks once their
    /// share of the allocated chunk count exceeds `hysteresis_fraction`.
    pub fn compact(&mut self) {
        if self.columns.is_empty() || self.chunk_capacity == 0 {
            return;
        }
        let used_chunks = self.entities.len().div_ceil(self.chunk_capacity).max(1);
        let allocated_rows = self.columns[0].data.allocated_rows();
        let allocated_chunks = allocated_rows.div_ceil(self.chunk_capacity).max(used_chunks);
        let empty_chunks = allocated_chunks - used_chunks;
        if empty_chunks == 0 {
            return;
        }
        let ratio = empty_chunks as f64 / used_chunks as f64;
        if ratio > self.hysteresis_fraction {
            let target_rows = used_chunks * self.chunk_capacity;
            for col in &mut self.columns {
                col.shrink_to(target_rows);
            }
        }
    }
}

impl std::fmt::Debug for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("kinds", &self.kinds)
            .field("len", &self.entities.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick::Tick;

    #[derive(Debug, Clone, Copy)]
    struct Position {
        x: f32,
        y: f32,
    }

    fn test_archetype(registry: &mut ComponentRegistry) -> Archetype {
        let kind = registry.register::<Position>().unwrap();
        Archetype::new(ArchetypeId(0), SmallVec::from_slice(&[kind]), registry, 4, 0.5)
    }

    #[test]
    fn hash_is_permutation_independent() {
        let mut registry = ComponentRegistry::new();
        let a = registry.register::<Position>().unwrap();
        #[derive(Debug, Clone, Copy)]
        struct Velocity;
        let b = registry.register::<Velocity>().unwrap();

        let ab = hash_kinds(&{
            let mut v = SmallVec::<[ComponentId; 8]>::from_slice(&[a, b]);
            v.sort_unstable();
            v
        });
        let ba = hash_kinds(&{
            let mut v = SmallVec::<[ComponentId; 8]>::from_slice(&[b, a]);
            v.sort_unstable();
            v
        });
        assert_eq!(ab, ba);
    }

    #[test]
    fn allocate_and_remove_row_keeps_contiguity() {
        let mut registry = ComponentRegistry::new();
        let kind = registry.register::<Position>().unwrap();
        let mut archetype = Archetype::new(ArchetypeId(0), SmallVec::from_slice(&[kind]), &registry, 4, 0.5);

        let e0 = EntityId::from_raw_for_test(0, 0);
        let e1 = EntityId::from_raw_for_test(1, 0);
        let (row0, ptrs0) = archetype.allocate_row(e0, Tick(1));
        unsafe { (ptrs0[0] as *mut Position).write(Position { x: 1.0, y: 1.0 }) };
        let (row1, ptrs1) = archetype.allocate_row(e1, Tick(1));
        unsafe { (ptrs1[0] as *mut Position).write(Position { x: 2.0, y: 2.0 }) };
        assert_eq!(row0, 0);
        assert_eq!(row1, 1);
        assert_eq!(archetype.len(), 2);

        let displaced = archetype.remove_row(0);
        assert_eq!(displaced, Some(e1));
        assert_eq!(archetype.len(), 1);
        let remaining = unsafe { &*(archetype.column_row_ptr(kind, 0) as *const Position) };
        assert_eq!(remaining.x, 2.0);
    }

    #[test]
    fn compact_shrinks_after_large_drop() {
        let mut registry = ComponentRegistry::new();
        let mut archetype = test_archetype(&mut registry);
        for i in 0..16u32 {
            let e = EntityId::from_raw_for_test(i, 0);
            let (_, ptrs) = archetype.allocate_row(e, Tick(1));
            unsafe { (ptrs[0] as *mut Position).write(Position { x: 0.0, y: 0.0 }) };
        }
        while archetype.len() > 1 {
            archetype.remove_row(0);
        }
        archetype.compact();
    }
}
