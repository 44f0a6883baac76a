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

//! A secondary world (typically a render or presentation world) mirrored
//! from a primary one. The primary's spawns, despawns and component
//! mutations are queued as [`crate::world::SyncRecord`]s; [`SubWorld::sync`]
//! drains that queue, maps each primary entity to its mirror via a
//! back-reference table, and runs a caller-supplied extract function to copy
//! primary state into the secondary.

use std::any::TypeId;
use std::collections::{HashMap, VecDeque};

use crate::entity::EntityId;
use crate::error::Result;
use crate::world::{SyncRecord, World};

/// Reads from the primary world, writes into the secondary, for one
/// primary/secondary entity pair that needs (re)mirroring this frame.
pub type ExtractFn<'a> = dyn FnMut(&World, &mut World, EntityId, EntityId) -> Result<()> + 'a;

/// A secondary [`World`] plus the bookkeeping needed to keep it in sync with
/// a primary one: a bidirectional entity back-reference table, a pending
/// queue of sync records not yet applied, and an optional whitelist
/// restricting which component kinds trigger a re-extract.
pub struct SubWorld {
    world: World,
    primary_to_secondary: HashMap<EntityId, EntityId>,
    secondary_to_primary: HashMap<EntityId, EntityId>,
    pending: VecDeque<SyncRecord>,
    whitelist: Vec<TypeId>,
}

impl SubWorld {
    pub fn new(world: World) -> Self {
        Self {
            world,
            primary_to_secondary: HashMap::new(),
            secondary_to_primary: HashMap::new(),
            pending: VecDeque::new(),
            whitelist: Vec::new(),
        }
    }

    /// Restrict which component kinds' `ComponentAdded`/`ComponentRemoved`
    /// records trigger a re-extract. An empty whitelist (the default) means
    /// every kind triggers one.
    pub fn with_whitelist(mut self, kinds: Vec<TypeId>) -> Self {
        self.whitelist = kinds;
        self
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn mirror_of(&self, primary_entity: EntityId) -> Option<EntityId> {
        self.primary_to_secondary.get(&primary_entity).copied()
    }

    pub fn primary_of(&self, secondary_entity: EntityId) -> Option<EntityId> {
        self.secondary_to_primary.get(&secondary_entity).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue records observed on the primary, typically the result of
    /// `primary.drain_sync_log()`.
    pub fn enqueue(&mut self, records: impl IntoIterator<Item = SyncRecord>) {
        self.pending.extend(records);
    }

    fn allows(&self, kind: TypeId) -> bool {
        self.whitelist.is_empty() || self.whitelist.contains(&kind)
    }

    fn mirror_or_create(&mut self, primary_entity: EntityId) -> EntityId {
        if let Some(&secondary) = self.primary_to_secondary.get(&primary_entity) {
            return secondary;
        }
        let secondary = self.world.spawn_empty();
        self.primary_to_secondary.insert(primary_entity, secondary);
        self.secondary_to_primary.insert(secondary, primary_entity);
        secondary
    }

    fn forget(&mut self, primary_entity: EntityId) {
        if let Some(secondary) = self.primary_to_secondary.remove(&primary_entity) {
            self.secondary_to_primary.remove(&secondary);
            let _ = self.world.despawn(secondary);
        }
    }

    /// Drain every pending sync record, invoking `extract` once per entity
    /// that needs (re)mirroring. A despawn on the primary despawns the
    /// mirror entity directly, with no extract call.
    pub fn sync(&mut self, primary: &World, mut extract: Box<ExtractFn<'_>>) -> Result<()> {
        while let Some(record) = self.pending.pop_front() {
            match record {
                SyncRecord::Spawned(primary_entity) => {
                    let secondary_entity = self.mirror_or_create(primary_entity);
                    extract(primary, &mut self.world, primary_entity, secondary_entity)?;
                }
                SyncRecord::ComponentAdded(primary_entity, kind) | SyncRecord::ComponentRemoved(primary_entity, kind) => {
                    if !self.allows(kind) {
                        continue;
                    }
                    if let Some(&secondary_entity) = self.primary_to_secondary.get(&primary_entity) {
                        extract(primary, &mut self.world, primary_entity, secondary_entity)?;
                    }
                }
                SyncRecord::Despawned(primary_entity) => {
                    self.forget(primary_entity);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct RenderPosition {
        x: f32,
    }

    #[test]
    fn spawn_on_primary_mirrors_into_secondary() {
        let mut primary = World::with_config(WorldConfig::default());
        let mut sub = SubWorld::new(World::with_config(WorldConfig::default()));

        let entity = primary.spawn((Position { x: 1.0 },));
        sub.enqueue(primary.drain_sync_log());
        sub.sync(
            &primary,
            Box::new(|primary, secondary, primary_entity, secondary_entity| {
                if let Some(pos) = primary.get_component::<Position>(primary_entity) {
                    secondary.add_component(secondary_entity, RenderPosition { x: pos.x })?;
                }
                Ok(())
            }),
        )
        .unwrap();

        let mirror = sub.mirror_of(entity).unwrap();
        assert_eq!(sub.world().get_component::<RenderPosition>(mirror), Some(&RenderPosition { x: 1.0 }));
    }

    #[test]
    fn despawn_on_primary_despawns_the_mirror() {
        let mut primary = World::with_config(WorldConfig::default());
        let mut sub = SubWorld::new(World::with_config(WorldConfig::default()));

        let entity = primary.spawn((Position { x: 1.0 },));
        sub.enqueue(primary.drain_sync_log());
        sub.sync(&primary, Box::new(|_, _, _, _| Ok(()))).unwrap();
        let mirror = sub.mirror_of(entity).unwrap();

        primary.despawn(entity).unwrap();
        sub.enqueue(primary.drain_sync_log());
        sub.sync(&primary, Box::new(|_, _, _, _| Ok(()))).unwrap();

        assert!(sub.mirror_of(entity).is_none());
        assert!(!sub.world().is_alive(mirror));
    }

    #[test]
    fn whitelist_filters_component_triggered_resync() {
        let mut primary = World::with_config(WorldConfig::default());
        let mut sub = SubWorld::new(World::with_config(WorldConfig::default()))
            .with_whitelist(vec![TypeId::of::<Position>()]);

        #[derive(Debug, Clone, Copy)]
        struct Irrelevant;

        let entity = primary.spawn((Position { x: 0.0 },));
        sub.enqueue(primary.drain_sync_log());
        sub.sync(&primary, Box::new(|_, _, _, _| Ok(()))).unwrap();

        primary.add_component(entity, Irrelevant).unwrap();
        sub.enqueue(primary.drain_sync_log());
        let mut calls = 0;
        sub.sync(
            &primary,
            Box::new(|_, _, _, _| {
                calls += 1;
                Ok(())
            }),
        )
        .unwrap();
        assert_eq!(calls, 0);
    }
}
