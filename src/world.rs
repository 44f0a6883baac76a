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

//! World: ties the entity directory, archetype graph, component registry,
//! change-tick clock, resources and messages into the single handle systems
//! and commands operate against.

use std::any::TypeId;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::archetype_graph::ArchetypeGraph;
use crate::component::{Bundle, Component, ComponentRegistry};
use crate::config::WorldConfig;
use crate::entity::{EntityDirectory, EntityId, EntityLocation};
use crate::error::{EcsError, Result};
use crate::executor::Executor;
use crate::message::MessageBus;
use crate::query::{QueryBuilder, QueryIter, QueryState};
use crate::resource::ResourceStore;
use crate::schedule::Schedule;
use crate::tick::{ChangeTickEngine, Tick};

/// A structural change a [`crate::subworld::SubWorld`] may want to mirror.
/// Pushed onto the world's sync log by every spawn/despawn/component
/// mutation, regardless of whether any sub-world is attached; draining an
/// unread log is just a `Vec::clear`.
#[derive(Clone, Debug)]
pub enum SyncRecord {
    Spawned(EntityId),
    Despawned(EntityId),
    ComponentAdded(EntityId, TypeId),
    ComponentRemoved(EntityId, TypeId),
}

/// Owns every piece of world state: the entity directory (behind a mutex so
/// `reserve_entity` can be called through a shared reference from a
/// `CommandBuffer`), the archetype graph, the component registry, the
/// change-tick clock, resources and the message bus.
pub struct World {
    entities: Mutex<EntityDirectory>,
    graph: ArchetypeGraph,
    registry: ComponentRegistry,
    tick_engine: ChangeTickEngine,
    resources: ResourceStore,
    messages: MessageBus,
    config: WorldConfig,
    sync_log: Mutex<Vec<SyncRecord>>,
    schedules: HashMap<&'static str, Schedule>,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        let registry = ComponentRegistry::new();
        let graph = ArchetypeGraph::new(config.archetype_chunk_capacity, config.chunk_hysteresis_fraction, &registry);
        let tick_engine = ChangeTickEngine::new(config.tick_maintenance_threshold);
        Self {
            entities: Mutex::new(EntityDirectory::new()),
            graph,
            registry,
            tick_engine,
            resources: ResourceStore::new(),
            messages: MessageBus::new(),
            config,
            sync_log: Mutex::new(Vec::new()),
            schedules: HashMap::new(),
        }
    }

    /// Drain every structural-change record queued since the last drain, for
    /// a sub-world harness to fold into its own pending-sync queue.
    pub fn drain_sync_log(&mut self) -> Vec<SyncRecord> {
        std::mem::take(&mut *self.sync_log.lock())
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn tick_engine(&self) -> &ChangeTickEngine {
        &self.tick_engine
    }

    pub fn current_tick(&self) -> Tick {
        self.tick_engine.current()
    }

    pub fn archetype_graph(&self) -> &ArchetypeGraph {
        &self.graph
    }

    pub fn archetype_graph_mut(&mut self) -> &mut ArchetypeGraph {
        &mut self.graph
    }

    pub fn component_registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceStore {
        &mut self.resources
    }

    pub fn messages(&self) -> &MessageBus {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut MessageBus {
        &mut self.messages
    }

    pub fn entity_count(&self) -> usize {
        self.entities.lock().len()
    }

    /// Reserve an entity id without materializing its row. The id is
    /// immediately observable (comparable, storable) but `is_alive` returns
    /// `false` for it until [`World::materialize_spawn`] or
    /// [`World::materialize_empty`] gives it a location. `CommandBuffer::spawn`
    /// relies on this to hand callers a usable id before the deferred insert runs.
    ///
    /// Panics once the `u32` entity index space is exhausted; see
    /// [`World::try_reserve_entity`] for a fallible version.
    pub fn reserve_entity(&self) -> EntityId {
        self.entities.lock().create()
    }

    /// Like [`World::reserve_entity`], but fails with
    /// `EntityCapacityExhausted` instead of panicking.
    pub fn try_reserve_entity(&self) -> Result<EntityId> {
        self.entities.lock().try_create()
    }

    /// Materializes a reserved entity's row with `bundle`'s components.
    pub fn materialize_spawn<B: Bundle>(&mut self, entity: EntityId, bundle: B) -> Result<()> {
        let kind_ids = B::register_components(&mut self.registry)?;

        let mut archetype_id = self.graph.empty_archetype();
        for &kind in &kind_ids {
            archetype_id = self.graph.traverse_add(archetype_id, kind, &self.registry);
        }

        let tick = self.tick_engine.current();
        let archetype = self.graph.get_mut(archetype_id);
        let (row, ptrs) = archetype.allocate_row(entity, tick);

        let mut write_ptrs: smallvec::SmallVec<[*mut u8; 8]> = smallvec::SmallVec::new();
        for &kind in &kind_ids {
            let index = archetype.column_index(kind).expect("registered kind missing from its own archetype");
            write_ptrs.push(ptrs[index]);
        }
        unsafe { bundle.write_components(&write_ptrs) };

        self.entities.get_mut().set_location(entity, EntityLocation { archetype: archetype_id, row });
        self.sync_log.get_mut().push(SyncRecord::Spawned(entity));
        Ok(())
    }

    /// Materializes a reserved entity's row with no components at all.
    pub fn materialize_empty(&mut self, entity: EntityId) -> Result<()> {
        let archetype_id = self.graph.empty_archetype();
        let tick = self.tick_engine.current();
        let (row, _ptrs) = self.graph.get_mut(archetype_id).allocate_row(entity, tick);
        self.entities.get_mut().set_location(entity, EntityLocation { archetype: archetype_id, row });
        self.sync_log.get_mut().push(SyncRecord::Spawned(entity));
        Ok(())
    }

    /// Reserve and materialize an entity in one call, for direct (non-deferred)
    /// use outside a system's command buffer.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> EntityId {
        let entity = self.entities.get_mut().create();
        self.materialize_spawn(entity, bundle)
            .expect("a freshly reserved entity cannot fail to materialize");
        entity
    }

    pub fn spawn_empty(&mut self) -> EntityId {
        let entity = self.entities.get_mut().create();
        self.materialize_empty(entity).expect("a freshly reserved entity cannot fail to materialize");
        entity
    }

    /// Spawn every bundle in `bundles`, returning their entity ids in order.
    pub fn spawn_batch<B: Bundle, I: IntoIterator<Item = B>>(&mut self, bundles: I) -> Vec<EntityId> {
        bundles.into_iter().map(|bundle| self.spawn(bundle)).collect()
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.entities.lock().is_alive(entity)
    }

    pub fn despawn(&mut self, entity: EntityId) -> Result<()> {
        let location = self.entities.get_mut().destroy(entity)?;
        let archetype = self.graph.get_mut(location.archetype);
        if let Some(displaced) = archetype.remove_row(location.row) {
            self.entities.get_mut().set_location(displaced, location);
        }
        self.sync_log.get_mut().push(SyncRecord::Despawned(entity));
        Ok(())
    }

    /// Insert `component` on `entity`, overwriting it in place if `entity`
    /// already carries that kind, or moving it to the archetype with that
    /// kind added otherwise.
    pub fn add_component<T: Component>(&mut self, entity: EntityId, component: T) -> Result<()> {
        let location = self.entities.get_mut().resolve(entity)?;
        let kind = self.registry.register::<T>()?;
        let from = location.archetype;

        if self.graph.get(from).contains(kind) {
            let tick = self.tick_engine.current();
            let archetype = self.graph.get_mut(from);
            unsafe {
                let ptr = archetype.column_row_mut_ptr(kind, location.row) as *mut T;
                std::ptr::write(ptr, component);
            }
            archetype.mark_changed(kind, location.row, tick);
            self.sync_log.get_mut().push(SyncRecord::ComponentAdded(entity, TypeId::of::<T>()));
            return Ok(());
        }

        let to = self.graph.traverse_add(from, kind, &self.registry);
        let tick = self.tick_engine.current();
        let mv = self.graph.move_row(from, location.row, to, tick, &self.registry);

        for &(new_kind, ptr) in &mv.new_kind_ptrs {
            if new_kind == kind {
                unsafe { std::ptr::write(ptr as *mut T, component) };
            }
        }

        if let Some(displaced) = mv.displaced {
            self.entities.get_mut().set_location(displaced, location);
        }
        self.entities.get_mut().set_location(entity, EntityLocation { archetype: to, row: mv.new_row });
        self.sync_log.get_mut().push(SyncRecord::ComponentAdded(entity, TypeId::of::<T>()));
        Ok(())
    }

    /// Remove `entity`'s `T` component, if present. A no-op (not an error)
    /// if `entity` never carried that kind.
    pub fn remove_component<T: Component>(&mut self, entity: EntityId) -> Result<()> {
        let location = self.entities.get_mut().resolve(entity)?;
        let Some(kind) = self.registry.id_of::<T>() else {
            return Ok(());
        };
        let from = location.archetype;
        if !self.graph.get(from).contains(kind) {
            return Ok(());
        }

        let to = self.graph.traverse_remove(from, kind, &self.registry);
        let tick = self.tick_engine.current();
        let mv = self.graph.move_row(from, location.row, to, tick, &self.registry);
        debug_assert!(mv.new_kind_ptrs.is_empty(), "removing a component should add no new columns");

        if let Some(displaced) = mv.displaced {
            self.entities.get_mut().set_location(displaced, location);
        }
        self.entities.get_mut().set_location(entity, EntityLocation { archetype: to, row: mv.new_row });
        self.sync_log.get_mut().push(SyncRecord::ComponentRemoved(entity, TypeId::of::<T>()));
        Ok(())
    }

    pub fn has_component<T: Component>(&self, entity: EntityId) -> bool {
        self.get_component::<T>(entity).is_some()
    }

    pub fn get_component<T: Component>(&self, entity: EntityId) -> Option<&T> {
        let location = self.entities.lock().resolve(entity).ok()?;
        let kind = self.registry.id_of::<T>()?;
        let archetype = self.graph.get(location.archetype);
        if !archetype.contains(kind) {
            return None;
        }
        unsafe { Some(&*(archetype.column_row_ptr(kind, location.row) as *const T)) }
    }

    pub fn get_component_mut<T: Component>(&mut self, entity: EntityId) -> Option<&mut T> {
        let location = self.entities.get_mut().resolve(entity).ok()?;
        let kind = self.registry.id_of::<T>()?;
        let tick = self.tick_engine.current();
        let archetype = self.graph.get_mut(location.archetype);
        if !archetype.contains(kind) {
            return None;
        }
        archetype.mark_changed(kind, location.row, tick);
        unsafe { Some(&mut *(archetype.column_row_mut_ptr(kind, location.row) as *mut T)) }
    }

    pub fn insert_resource<R: Component>(&mut self, resource: R) {
        let tick = self.tick_engine.current();
        self.resources.insert(resource, tick);
    }

    pub fn init_resource<R: Component + Default>(&mut self) {
        let tick = self.tick_engine.current();
        self.resources.init::<R>(tick);
    }

    pub fn remove_resource<R: Component>(&mut self) -> Option<R> {
        self.resources.remove::<R>()
    }

    pub fn resource<R: Component>(&self) -> Option<&R> {
        self.resources.get::<R>()
    }

    pub fn resource_mut<R: Component>(&mut self) -> Option<&mut R> {
        let tick = self.tick_engine.current();
        self.resources.get_mut::<R>(tick)
    }

    /// Like [`World::resource`], but fails with `ResourceNotFound` instead of
    /// returning `None`, for callers that treat a missing resource as fatal.
    pub fn resource_or_err<R: Component>(&self) -> Result<&R> {
        self.resource::<R>().ok_or(EcsError::ResourceNotFound(std::any::TypeId::of::<R>()))
    }

    /// Start building a query against this world's component registry.
    pub fn query_builder(&mut self) -> QueryBuilder<'_> {
        QueryBuilder::new(&mut self.registry)
    }

    /// Iterate `state`'s matched rows, bounding `Added`/`Changed` filters by
    /// `last_run_tick` against the world's current tick.
    pub fn run_query<'w>(&'w mut self, state: &'w mut QueryState, last_run_tick: Tick) -> QueryIter<'w> {
        let this_run_tick = self.tick_engine.current();
        state.iter(&mut self.graph, last_run_tick, this_run_tick)
    }

    /// Advance the change-tick clock by one. Called exactly once per
    /// `Executor::execute_frame` invocation (see `executor.rs`), not once per
    /// stage; also runs a tick-maintenance rebase sweep over every archetype
    /// column and resource cell if the clock has drifted past its threshold.
    pub fn advance_tick(&mut self) -> Tick {
        let tick = self.tick_engine.advance();
        if self.tick_engine.needs_maintenance(Tick::ZERO) {
            self.graph.rebase_ticks(&self.tick_engine);
            self.resources.rebase_all(&self.tick_engine);
        }
        tick
    }

    /// Register a named schedule so later code can run it by name through
    /// [`World::run_schedule`] without having to thread a `&mut Schedule`
    /// through alongside the world. Replaces any schedule already registered
    /// under `name`.
    pub fn add_schedule(&mut self, name: &'static str, schedule: Schedule) {
        self.schedules.insert(name, schedule);
    }

    pub fn has_schedule(&self, name: &str) -> bool {
        self.schedules.contains_key(name)
    }

    pub fn schedule_mut(&mut self, name: &str) -> Option<&mut Schedule> {
        self.schedules.get_mut(name)
    }

    /// Run the schedule registered under `name` for one frame through
    /// `executor`. The schedule is removed from the registry for the
    /// duration of the call and reinserted afterward: `Executor::execute_frame`
    /// needs `&mut World` and `&mut Schedule` simultaneously, which a
    /// schedule stored inside the world it runs against can't hand out at
    /// the same time as itself.
    pub fn run_schedule(&mut self, name: &'static str, executor: &mut Executor) -> Result<()> {
        let mut schedule = self.schedules.remove(name).ok_or(EcsError::ScheduleNotFound(name))?;
        let result = executor.execute_frame(self, &mut schedule);
        self.schedules.insert(name, schedule);
        result
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Velocity {
        dx: f32,
    }

    #[test]
    fn spawn_then_get_component_round_trips() {
        let mut world = World::new();
        let entity = world.spawn((Position { x: 1.0, y: 2.0 },));
        assert_eq!(world.get_component::<Position>(entity), Some(&Position { x: 1.0, y: 2.0 }));
    }

    #[test]
    fn reserved_entity_is_not_alive_until_materialized() {
        let world = World::new();
        let entity = world.reserve_entity();
        assert!(!world.is_alive(entity));
    }

    #[test]
    fn despawn_then_resolve_fails() {
        let mut world = World::new();
        let entity = world.spawn((Position { x: 0.0, y: 0.0 },));
        world.despawn(entity).unwrap();
        assert!(!world.is_alive(entity));
        assert!(world.get_component::<Position>(entity).is_none());
    }

    #[test]
    fn add_component_moves_entity_to_new_archetype() {
        let mut world = World::new();
        let entity = world.spawn((Position { x: 0.0, y: 0.0 },));
        world.add_component(entity, Velocity { dx: 3.0 }).unwrap();
        assert_eq!(world.get_component::<Velocity>(entity), Some(&Velocity { dx: 3.0 }));
        assert_eq!(world.get_component::<Position>(entity), Some(&Position { x: 0.0, y: 0.0 }));
    }

    #[test]
    fn remove_component_moves_entity_back() {
        let mut world = World::new();
        let entity = world.spawn((Position { x: 0.0, y: 0.0 }, Velocity { dx: 1.0 }));
        world.remove_component::<Velocity>(entity).unwrap();
        assert!(world.get_component::<Velocity>(entity).is_none());
        assert!(world.get_component::<Position>(entity).is_some());
    }

    #[test]
    fn despawn_displaces_last_row_into_freed_slot() {
        let mut world = World::new();
        let e0 = world.spawn((Position { x: 0.0, y: 0.0 },));
        let e1 = world.spawn((Position { x: 1.0, y: 1.0 },));
        world.despawn(e0).unwrap();
        assert_eq!(world.get_component::<Position>(e1), Some(&Position { x: 1.0, y: 1.0 }));
    }

    #[test]
    fn resources_round_trip() {
        let mut world = World::new();
        world.insert_resource(42u32);
        assert_eq!(world.resource::<u32>(), Some(&42));
        *world.resource_mut::<u32>().unwrap() += 1;
        assert_eq!(world.resource::<u32>(), Some(&43));
        assert_eq!(world.remove_resource::<u32>(), Some(43));
        assert!(world.resource::<u32>().is_none());
    }

    #[test]
    fn query_matches_spawned_entities() {
        let mut world = World::new();
        world.spawn((Position { x: 0.0, y: 0.0 },));
        world.spawn((Position { x: 1.0, y: 1.0 }, Velocity { dx: 1.0 }));

        let last_run = world.current_tick();
        let mut state = world.query_builder().read::<Position>().unwrap().build().unwrap();
        let count = {
            let mut iter = world.run_query(&mut state, last_run);
            let mut n = 0;
            while iter.next().is_some() {
                n += 1;
            }
            n
        };
        assert_eq!(count, 2);
    }

    #[test]
    fn try_reserve_entity_succeeds_like_reserve_entity() {
        let world = World::new();
        let entity = world.try_reserve_entity().unwrap();
        assert!(!world.is_alive(entity));
    }

    #[test]
    fn run_schedule_runs_the_registered_schedule_once() {
        use crate::command::CommandBuffer;
        use crate::executor::{Executor, ExitRequested};
        use crate::system::{System, SystemAccess};
        use crate::config::ExecutorKind;

        struct SendExit;
        impl System for SendExit {
            fn access(&self) -> SystemAccess {
                SystemAccess::empty()
            }
            fn name(&self) -> &'static str {
                "send_exit"
            }
            fn run(&mut self, _world: &World, commands: &mut CommandBuffer) -> Result<()> {
                commands.add(|world| {
                    world.messages_mut().send(ExitRequested);
                    Ok(())
                });
                Ok(())
            }
        }

        let mut world = World::new();
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(SendExit));
        world.add_schedule("frame", schedule);

        let mut executor = Executor::new(ExecutorKind::SingleThreaded);
        assert!(world.has_schedule("frame"));
        world.run_schedule("frame", &mut executor).unwrap();
        assert!(world.has_schedule("frame"));

        let mut reader = crate::message::MessageReader::<ExitRequested>::new();
        assert_eq!(world.messages().read(&mut reader).len(), 1);
    }

    #[test]
    fn run_schedule_fails_for_an_unregistered_name() {
        let mut world = World::new();
        let mut executor = crate::executor::Executor::new(crate::config::ExecutorKind::SingleThreaded);
        let err = world.run_schedule("missing", &mut executor).unwrap_err();
        assert!(matches!(err, EcsError::ScheduleNotFound("missing")));
    }
}
