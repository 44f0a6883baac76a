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

//! Deferred structural-change log. Systems queue commands against their own
//! `CommandBuffer` while running; the executor applies every buffer, in
//! insertion order, at the next schedule barrier.

use crate::component::{Bundle, Component};
use crate::entity::EntityId;
use crate::error::Result;
use crate::world::World;

type WorldMutation = Box<dyn FnOnce(&mut World) -> Result<()> + Send>;
type EntityMutation = Box<dyn FnOnce(&mut World, EntityId) -> Result<()> + Send>;

enum Command {
    /// The entity id was already reserved (and is observable by the caller)
    /// at queue time; `insert` materializes its row and writes its bundle.
    SpawnAt { entity: EntityId, insert: EntityMutation },
    Despawn(EntityId),
    EntityMutation { entity: EntityId, mutate: EntityMutation },
    World(WorldMutation),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SpawnAt { entity, .. } => f.debug_tuple("SpawnAt").field(entity).finish(),
            Command::Despawn(e) => f.debug_tuple("Despawn").field(e).finish(),
            Command::EntityMutation { entity, .. } => f.debug_tuple("EntityMutation").field(entity).finish(),
            Command::World(_) => write!(f, "World(...)"),
        }
    }
}

/// Deferred record of structural changes: spawns, despawns, component
/// inserts/removes, and resource inserts/removes. Every queued command keeps
/// its insertion order; `apply` runs them in that order against a `&mut
/// World` at the next barrier. A command whose target entity is no longer
/// alive by the time it applies is silently dropped, except `spawn`, which
/// always materializes its reserved id.
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
        }
    }

    /// Reserve an entity id from `world` immediately (so the caller can wire
    /// it into other data this frame) and queue the row materialization plus
    /// bundle write for the next barrier.
    pub fn spawn<B: Bundle>(&mut self, world: &World, bundle: B) -> EntityId {
        let entity = world.reserve_entity();
        self.commands.push(Command::SpawnAt {
            entity,
            insert: Box::new(move |world, entity| world.materialize_spawn(entity, bundle)),
        });
        entity
    }

    /// Reserve an entity id with no components; a later command in this same
    /// buffer (or another buffer applied after it) may still add components.
    pub fn spawn_empty(&mut self, world: &World) -> EntityId {
        let entity = world.reserve_entity();
        self.commands.push(Command::SpawnAt {
            entity,
            insert: Box::new(move |world, entity| world.materialize_empty(entity)),
        });
        entity
    }

    pub fn despawn(&mut self, entity: EntityId) {
        self.commands.push(Command::Despawn(entity));
    }

    pub fn insert<T: Component>(&mut self, entity: EntityId, component: T) {
        self.commands.push(Command::EntityMutation {
            entity,
            mutate: Box::new(move |world, entity| world.add_component(entity, component)),
        });
    }

    pub fn remove<T: Component>(&mut self, entity: EntityId) {
        self.commands.push(Command::EntityMutation {
            entity,
            mutate: Box::new(move |world, entity| world.remove_component::<T>(entity).map(|_| ())),
        });
    }

    pub fn insert_resource<T: Component>(&mut self, resource: T) {
        self.commands.push(Command::World(Box::new(move |world| {
            world.insert_resource(resource);
            Ok(())
        })));
    }

    pub fn remove_resource<T: Component>(&mut self) {
        self.commands.push(Command::World(Box::new(move |world| {
            world.remove_resource::<T>();
            Ok(())
        })));
    }

    /// Queue an arbitrary world mutation, run unconditionally at apply time.
    pub fn add<F>(&mut self, f: F)
    where
        F: FnOnce(&mut World) -> Result<()> + Send + 'static,
    {
        self.commands.push(Command::World(Box::new(f)));
    }

    /// Apply every queued command to `world`, in insertion order, and clear
    /// the buffer. Entity-targeted commands whose entity has since died are
    /// skipped, except `spawn`/`spawn_empty`.
    pub fn apply(&mut self, world: &mut World) -> Result<()> {
        for command in self.commands.drain(..) {
            match command {
                Command::SpawnAt { entity, insert } => insert(world, entity)?,
                Command::Despawn(entity) => {
                    if world.is_alive(entity) {
                        world.despawn(entity)?;
                    }
                }
                Command::EntityMutation { entity, mutate } => {
                    if world.is_alive(entity) {
                        mutate(world, entity)?;
                    }
                }
                Command::World(f) => f(world)?,
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;

    #[derive(Debug, Clone, Copy)]
    struct Marker(u32);

    #[test]
    fn despawn_of_dead_entity_is_silently_skipped() {
        let mut world = World::with_config(WorldConfig::default());
        let entity = world.spawn((Marker(1),));
        world.despawn(entity).unwrap();

        let mut buffer = CommandBuffer::new();
        buffer.despawn(entity);
        assert!(buffer.apply(&mut world).is_ok());
    }

    #[test]
    fn spawn_reserves_an_observable_id_before_apply() {
        let world = World::with_config(WorldConfig::default());
        let mut buffer = CommandBuffer::new();
        let entity = buffer.spawn(&world, (Marker(7),));
        assert_eq!(buffer.len(), 1);
        assert_ne!(entity.index(), u32::MAX);
    }

    #[test]
    fn apply_clears_the_buffer_in_insertion_order() {
        let mut world = World::with_config(WorldConfig::default());
        let mut buffer = CommandBuffer::new();
        let e1 = buffer.spawn(&world, (Marker(1),));
        buffer.insert(e1, Marker(2));
        buffer.apply(&mut world).unwrap();
        assert!(buffer.is_empty());
        assert!(world.is_alive(e1));
    }
}
