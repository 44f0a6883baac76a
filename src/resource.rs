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

//! Resource store: typed singleton values keyed by `TypeId`, each carrying
//! its own added/changed tick independent of any archetype.

use ahash::RandomState;
use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::tick::Tick;

struct ResourceCell {
    value: Box<dyn Any + Send + Sync>,
    added: Tick,
    changed: Tick,
}

/// Holds at most one value per type. The executor is responsible for
/// enforcing single-writer access to a resource across a schedule; this
/// store itself is not internally synchronized.
#[derive(Default)]
pub struct ResourceStore {
    cells: HashMap<TypeId, ResourceCell, RandomState>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the resource, stamping both ticks with `tick`.
    pub fn insert<R: Send + Sync + 'static>(&mut self, value: R, tick: Tick) {
        self.cells.insert(
            TypeId::of::<R>(),
            ResourceCell {
                value: Box::new(value),
                added: tick,
                changed: tick,
            },
        );
    }

    /// Insert the resource only if absent, via `R::default()`.
    pub fn init<R: Send + Sync + Default + 'static>(&mut self, tick: Tick) {
        self.cells.entry(TypeId::of::<R>()).or_insert_with(|| ResourceCell {
            value: Box::new(R::default()),
            added: tick,
            changed: tick,
        });
    }

    pub fn remove<R: Send + Sync + 'static>(&mut self) -> Option<R> {
        self.cells
            .remove(&TypeId::of::<R>())
            .and_then(|cell| cell.value.downcast::<R>().ok())
            .map(|boxed| *boxed)
    }

    pub fn contains<R: 'static>(&self) -> bool {
        self.cells.contains_key(&TypeId::of::<R>())
    }

    pub fn get<R: Send + Sync + 'static>(&self) -> Option<&R> {
        self.cells.get(&TypeId::of::<R>()).and_then(|cell| cell.value.downcast_ref())
    }

    /// Mutable access also stamps the resource's changed-tick with `tick`.
    pub fn get_mut<R: Send + Sync + 'static>(&mut self, tick: Tick) -> Option<&mut R> {
        let cell = self.cells.get_mut(&TypeId::of::<R>())?;
        cell.changed = tick;
        cell.value.downcast_mut()
    }

    pub fn added_tick<R: 'static>(&self) -> Option<Tick> {
        self.cells.get(&TypeId::of::<R>()).map(|c| c.added)
    }

    pub fn changed_tick<R: 'static>(&self) -> Option<Tick> {
        self.cells.get(&TypeId::of::<R>()).map(|c| c.changed)
    }

    /// Rebase every resource's stored ticks; called from the world's
    /// periodic tick maintenance pass.
    pub fn rebase_all(&mut self, engine: &crate::tick::ChangeTickEngine) {
        for cell in self.cells.values_mut() {
            cell.added = engine.rebase(cell.added);
            cell.changed = engine.rebase(cell.changed);
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
