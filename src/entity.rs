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

//! Entity identifiers and the generational directory that allocates them.
//!
//! Entities are not backed by `slotmap` here: the contract needs
//! `create_at(hint)` with a distinguishable `EntityIndexInUse` failure and a
//! tombstone count driven purely by destroy operations, neither of which a
//! generic slot map exposes directly.

use crate::archetype::ArchetypeId;
use crate::error::{EcsError, Result};

/// A 64-bit entity handle packing a 32-bit index and a 32-bit generation.
/// Reusing an index always bumps its generation, so a stale handle can never
/// resolve to the entity that now occupies its old index.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(u64);

impl EntityId {
    fn new(index: u32, generation: u32) -> Self {
        EntityId(((generation as u64) << 32) | index as u64)
    }

    pub fn index(self) -> u32 {
        self.0 as u32
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

#[cfg(test)]
impl EntityId {
    pub(crate) fn from_raw_for_test(index: u32, generation: u32) -> Self {
        EntityId::new(index, generation)
    }
}

impl std::fmt::Debug for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

/// Where a live entity's row currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub row: usize,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Free { generation: u32 },
    Pending { generation: u32 },
    Occupied { generation: u32, location: EntityLocation },
}

impl Slot {
    fn generation(&self) -> u32 {
        match *self {
            Slot::Free { generation } | Slot::Pending { generation } | Slot::Occupied { generation, .. } => generation,
        }
    }
}

/// Allocates and recycles entity identifiers, and tracks each live entity's
/// archetype/row. A destroyed slot is pushed onto the free list and its
/// generation bumped; every destroy also advances a tombstone counter the
/// change-tick maintenance pass can consult as a cheap "has structure moved"
/// signal.
#[derive(Debug, Default)]
pub struct EntityDirectory {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    tombstones: u64,
}

impl EntityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh index or recycle a freed one with a bumped generation.
    /// The returned entity has no location yet; callers must call
    /// [`EntityDirectory::set_location`] before the entity is observable.
    ///
    /// Panics if the `u32` index space is exhausted; see
    /// [`EntityDirectory::try_create`] for a fallible version.
    pub fn create(&mut self) -> EntityId {
        self.try_create().expect("entity index space exhausted")
    }

    /// Like [`EntityDirectory::create`], but fails with
    /// `EntityCapacityExhausted` instead of panicking once every `u32` index
    /// has been used at least once and none are free to recycle.
    pub fn try_create(&mut self) -> Result<EntityId> {
        if let Some(index) = self.free_list.pop() {
            let generation = self.slots[index as usize].generation();
            self.slots[index as usize] = Slot::Pending { generation };
            Ok(EntityId::new(index, generation))
        } else if self.slots.len() < u32::MAX as usize {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Pending { generation: 0 });
            Ok(EntityId::new(index, 0))
        } else {
            Err(EcsError::EntityCapacityExhausted {
                attempted: self.slots.len() + 1,
                capacity: u32::MAX as usize,
            })
        }
    }

    /// Allocate at a specific index. Fails with `EntityIndexInUse` if that
    /// index is currently occupied or pending.
    pub fn create_at(&mut self, index: u32) -> Result<EntityId> {
        let idx = index as usize;
        if idx < self.slots.len() {
            match self.slots[idx] {
                Slot::Occupied { .. } | Slot::Pending { .. } => {
                    return Err(EcsError::EntityIndexInUse(index));
                }
                Slot::Free { generation } => {
                    if let Some(pos) = self.free_list.iter().position(|&i| i == index) {
                        self.free_list.swap_remove(pos);
                    }
                    self.slots[idx] = Slot::Pending { generation };
                }
            }
        } else {
            while self.slots.len() < idx {
                let gap = self.slots.len() as u32;
                self.slots.push(Slot::Free { generation: 0 });
                self.free_list.push(gap);
            }
            self.slots.push(Slot::Pending { generation: 0 });
        }
        let generation = self.slots[idx].generation();
        Ok(EntityId::new(index, generation))
    }

    /// Record where a newly created (or moved) entity's row now lives.
    pub fn set_location(&mut self, entity: EntityId, location: EntityLocation) {
        let idx = entity.index() as usize;
        debug_assert_eq!(self.slots[idx].generation(), entity.generation());
        self.slots[idx] = Slot::Occupied {
            generation: entity.generation(),
            location,
        };
    }

    /// Resolve a handle to its current location, or fail if the handle is
    /// stale (wrong generation, or the slot is free/pending).
    pub fn resolve(&self, entity: EntityId) -> Result<EntityLocation> {
        let idx = entity.index() as usize;
        match self.slots.get(idx) {
            Some(Slot::Occupied { generation, location }) if *generation == entity.generation() => Ok(*location),
            _ => Err(EcsError::EntityStale),
        }
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.resolve(entity).is_ok()
    }

    /// Mark the slot dead, bump its generation, and free the index for reuse.
    /// Returns the entity's last known location so the caller can compact the
    /// archetype it was removed from.
    pub fn destroy(&mut self, entity: EntityId) -> Result<EntityLocation> {
        let idx = entity.index() as usize;
        let location = self.resolve(entity)?;
        let next_generation = entity.generation().wrapping_add(1);
        self.slots[idx] = Slot::Free {
            generation: next_generation,
        };
        self.free_list.push(entity.index());
        self.tombstones += 1;
        Ok(location)
    }

    pub fn tombstone_count(&self) -> u64 {
        self.tombstones
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
