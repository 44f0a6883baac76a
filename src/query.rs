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

//! Query planning and iteration: matches archetypes against required,
//! forbidden and optional kind multisets, and iterates the matched rows.

use smallvec::SmallVec;
use std::ops::{Deref, DerefMut};

use crate::archetype::{Archetype, ArchetypeId};
use crate::archetype_graph::ArchetypeGraph;
use crate::component::{Component, ComponentId, ComponentRegistry};
use crate::entity::EntityId;
use crate::error::{EcsError, Result};
use crate::tick::Tick;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Access {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug)]
struct Term {
    kind: ComponentId,
    access: Access,
}

#[derive(Clone, Copy, Debug)]
enum ChangeFilter {
    Added(ComponentId),
    Changed(ComponentId),
}

/// The set of component kinds a query reads and writes. Two summaries that
/// both touch a kind conflict unless both only read it.
#[derive(Clone, Debug, Default)]
pub struct AccessSummary {
    pub reads: SmallVec<[ComponentId; 8]>,
    pub writes: SmallVec<[ComponentId; 8]>,
}

impl AccessSummary {
    pub fn conflicts_with(&self, other: &AccessSummary) -> bool {
        self.writes.iter().any(|k| other.writes.contains(k) || other.reads.contains(k))
            || other.writes.iter().any(|k| self.reads.contains(k))
    }
}

/// Builds a [`QueryState`] from required/forbidden/optional terms,
/// registering any component types seen for the first time.
pub struct QueryBuilder<'r> {
    registry: &'r mut ComponentRegistry,
    required: SmallVec<[Term; 8]>,
    forbidden: SmallVec<[ComponentId; 4]>,
    optional: SmallVec<[Term; 4]>,
    filters: SmallVec<[ChangeFilter; 4]>,
}

impl<'r> QueryBuilder<'r> {
    pub fn new(registry: &'r mut ComponentRegistry) -> Self {
        Self {
            registry,
            required: SmallVec::new(),
            forbidden: SmallVec::new(),
            optional: SmallVec::new(),
            filters: SmallVec::new(),
        }
    }

    pub fn read<T: Component>(mut self) -> Result<Self> {
        let kind = self.registry.register::<T>()?;
        self.required.push(Term { kind, access: Access::Read });
        Ok(self)
    }

    pub fn write<T: Component>(mut self) -> Result<Self> {
        let kind = self.registry.register::<T>()?;
        self.required.push(Term { kind, access: Access::Write });
        Ok(self)
    }

    pub fn without<T: Component>(mut self) -> Result<Self> {
        let kind = self.registry.register::<T>()?;
        self.forbidden.push(kind);
        Ok(self)
    }

    pub fn optional_read<T: Component>(mut self) -> Result<Self> {
        let kind = self.registry.register::<T>()?;
        self.optional.push(Term { kind, access: Access::Read });
        Ok(self)
    }

    pub fn optional_write<T: Component>(mut self) -> Result<Self> {
        let kind = self.registry.register::<T>()?;
        self.optional.push(Term { kind, access: Access::Write });
        Ok(self)
    }

    pub fn added<T: Component>(mut self) -> Result<Self> {
        let kind = self.registry.register::<T>()?;
        self.filters.push(ChangeFilter::Added(kind));
        Ok(self)
    }

    pub fn changed<T: Component>(mut self) -> Result<Self> {
        let kind = self.registry.register::<T>()?;
        self.filters.push(ChangeFilter::Changed(kind));
        Ok(self)
    }

    pub fn build(self) -> Result<QueryState> {
        let mut writes: SmallVec<[ComponentId; 8]> = SmallVec::new();
        let mut reads: SmallVec<[ComponentId; 8]> = SmallVec::new();
        for term in self.required.iter().chain(self.optional.iter()) {
            match term.access {
                Access::Write => {
                    if writes.contains(&term.kind) {
                        return Err(EcsError::ConflictingAccess(self.registry.describe(term.kind).name));
                    }
                    writes.push(term.kind);
                }
                Access::Read => reads.push(term.kind),
            }
        }
        for kind in &writes {
            if reads.contains(kind) {
                return Err(EcsError::ConflictingAccess(self.registry.describe(*kind).name));
            }
        }

        Ok(QueryState {
            required: self.required,
            forbidden: self.forbidden,
            optional: self.optional,
            filters: self.filters,
            access: AccessSummary { reads, writes },
            matched: Vec::new(),
            cached_generation: None,
        })
    }
}

/// A built, reusable query: its access summary is fixed, and its
/// matched-archetype list is recomputed only when the archetype graph's
/// generation advances.
pub struct QueryState {
    required: SmallVec<[Term; 8]>,
    forbidden: SmallVec<[ComponentId; 4]>,
    optional: SmallVec<[Term; 4]>,
    filters: SmallVec<[ChangeFilter; 4]>,
    access: AccessSummary,
    matched: Vec<ArchetypeId>,
    cached_generation: Option<u64>,
}

impl QueryState {
    pub fn access(&self) -> &AccessSummary {
        &self.access
    }

    fn matches(&self, archetype: &Archetype) -> bool {
        self.required.iter().all(|t| archetype.contains(t.kind)) && self.forbidden.iter().all(|k| !archetype.contains(*k))
    }

    fn refresh(&mut self, graph: &ArchetypeGraph) {
        if self.cached_generation == Some(graph.generation()) {
            return;
        }
        self.matched.clear();
        self.matched.extend(graph.iter().filter(|a| self.matches(a)).map(|a| a.id()));
        self.cached_generation = Some(graph.generation());
    }

    /// Re-scans the matched archetypes fresh each call; does not share
    /// progress with `iter`.
    pub fn count(&mut self, graph: &ArchetypeGraph) -> usize {
        self.refresh(graph);
        self.matched.iter().map(|&id| graph.get(id).len()).sum()
    }

    pub fn contains_archetype(&mut self, graph: &ArchetypeGraph, archetype: ArchetypeId) -> bool {
        self.refresh(graph);
        self.matched.contains(&archetype)
    }

    /// Fails with `NotUnique` unless exactly one row across every matched
    /// archetype satisfies this query.
    pub fn single(&mut self, graph: &ArchetypeGraph) -> Result<EntityId> {
        self.refresh(graph);
        let mut found = None;
        let mut matched_count = 0usize;
        for &id in &self.matched {
            let archetype = graph.get(id);
            matched_count += archetype.len();
            if found.is_none() && archetype.len() > 0 {
                found = Some(archetype.entity_at(0));
            }
        }
        if matched_count == 1 {
            Ok(found.expect("count is 1 but no row found"))
        } else {
            Err(EcsError::NotUnique { matched: matched_count })
        }
    }

    /// Iterate every matched row. `last_run_tick`/`this_run_tick` bound the
    /// window `Added`/`Changed` filters inspect.
    pub fn iter<'w>(&'w mut self, graph: &'w mut ArchetypeGraph, last_run_tick: Tick, this_run_tick: Tick) -> QueryIter<'w> {
        self.refresh(graph);
        let start_generation = graph.generation();
        QueryIter {
            filters: &self.filters,
            matched: &self.matched,
            graph,
            start_generation,
            archetype_cursor: 0,
            row_cursor: 0,
            last_run_tick,
            this_run_tick,
        }
    }
}

/// A single matched row, giving access to its required/optional components
/// by the `ComponentId` the query was built with.
pub struct RowView<'w> {
    entity: EntityId,
    archetype: *mut Archetype,
    row: usize,
    tick: Tick,
    _marker: std::marker::PhantomData<&'w mut Archetype>,
}

impl<'w> RowView<'w> {
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn get<T: Component>(&self, kind: ComponentId) -> Option<&'w T> {
        let archetype = unsafe { &*self.archetype };
        if !archetype.contains(kind) {
            return None;
        }
        let ptr = unsafe { archetype.column_row_ptr(kind, self.row) };
        Some(unsafe { &*(ptr as *const T) })
    }

    pub fn get_mut<T: Component>(&self, kind: ComponentId) -> Option<WriteHandle<'w, T>> {
        let archetype = unsafe { &mut *self.archetype };
        if !archetype.contains(kind) {
            return None;
        }
        let ptr = unsafe { archetype.column_row_mut_ptr(kind, self.row) };
        Some(WriteHandle {
            value: unsafe { &mut *(ptr as *mut T) },
            archetype: self.archetype,
            kind,
            row: self.row,
            tick: self.tick,
            marked: false,
        })
    }

    fn added_tick(&self, kind: ComponentId) -> Option<Tick> {
        unsafe { &*self.archetype }.added_tick(kind, self.row)
    }

    fn changed_tick(&self, kind: ComponentId) -> Option<Tick> {
        unsafe { &*self.archetype }.changed_tick(kind, self.row)
    }
}

/// A mutable view into one cell. Marks the cell's changed-tick on drop (or
/// eagerly via [`WriteHandle::mark`]).
pub struct WriteHandle<'w, T> {
    value: &'w mut T,
    archetype: *mut Archetype,
    kind: ComponentId,
    row: usize,
    tick: Tick,
    marked: bool,
}

impl<'w, T> WriteHandle<'w, T> {
    pub fn mark(&mut self) {
        if !self.marked {
            unsafe { (*self.archetype).mark_changed(self.kind, self.row, self.tick) };
            self.marked = true;
        }
    }
}

impl<'w, T> Deref for WriteHandle<'w, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value
    }
}

impl<'w, T> DerefMut for WriteHandle<'w, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
    }
}

impl<'w, T> Drop for WriteHandle<'w, T> {
    fn drop(&mut self) {
        self.mark();
    }
}

/// Iterator over a query's matched rows. Panics with a descriptive message
/// if the archetype graph's generation advances mid-iteration: observing a
/// structural change here is a contract violation, not a recoverable failure.
pub struct QueryIter<'w> {
    filters: &'w SmallVec<[ChangeFilter; 4]>,
    matched: &'w [ArchetypeId],
    graph: &'w mut ArchetypeGraph,
    start_generation: u64,
    archetype_cursor: usize,
    row_cursor: usize,
    last_run_tick: Tick,
    this_run_tick: Tick,
}

impl<'w> QueryIter<'w> {
    fn passes_filters(&self, view: &RowView<'_>) -> bool {
        self.filters.iter().all(|f| match *f {
            ChangeFilter::Added(kind) => view
                .added_tick(kind)
                .is_some_and(|t| t.is_newer_than(self.last_run_tick, self.this_run_tick)),
            ChangeFilter::Changed(kind) => view
                .changed_tick(kind)
                .is_some_and(|t| t.is_newer_than(self.last_run_tick, self.this_run_tick)),
        })
    }
}

impl<'w> Iterator for QueryIter<'w> {
    type Item = RowView<'w>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.graph.generation() != self.start_generation {
            panic!("{}", EcsError::StaleIteration);
        }
        loop {
            if self.archetype_cursor >= self.matched.len() {
                return None;
            }
            let archetype_id = self.matched[self.archetype_cursor];
            let archetype_ptr: *mut Archetype = self.graph.get_mut(archetype_id) as *mut Archetype;
            let len = unsafe { &*archetype_ptr }.len();
            if self.row_cursor >= len {
                self.archetype_cursor += 1;
                self.row_cursor = 0;
                continue;
            }
            let row = self.row_cursor;
            self.row_cursor += 1;
            let entity = unsafe { &*archetype_ptr }.entity_at(row);
            let view = RowView {
                entity,
                archetype: archetype_ptr,
                row,
                tick: self.this_run_tick,
                _marker: std::marker::PhantomData,
            };
            if self.filters.is_empty() || self.passes_filters(&view) {
                return Some(view);
            }
        }
    }
}
