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

//! End-to-end scenarios spanning the world, schedule, command buffer and
//! query planner together.

use archetype_ecs::{CommandBuffer, Executor, ExecutorKind, Schedule, System, SystemAccess, Tick, World};

#[derive(Debug, Clone, Copy, PartialEq)]
struct A(u32);
#[derive(Debug, Clone, Copy, PartialEq)]
struct B(u32);
#[derive(Debug, Clone, Copy, PartialEq)]
struct C(u32);

#[test]
fn query_matches_archetypes_by_required_and_forbidden_sets() {
    let mut world = World::new();
    world.spawn((A(1),));
    world.spawn((A(2), B(2)));
    world.spawn((A(3), B(3), C(3)));

    let last_run = world.current_tick();
    let mut state = world.query_builder().read::<A>().unwrap().without::<C>().unwrap().build().unwrap();
    let mut count = 0;
    {
        let mut iter = world.run_query(&mut state, last_run);
        while iter.next().is_some() {
            count += 1;
        }
    }
    assert_eq!(count, 2);
}

#[test]
fn query_with_required_and_without_partitions_a_thousand_entities() {
    let mut world = World::new();
    for i in 0..1000u32 {
        let e = world.spawn((A(i),));
        if i % 2 == 1 {
            world.add_component(e, B(i)).unwrap();
        }
    }

    let last_run = world.current_tick();

    let mut with_both = world.query_builder().read::<A>().unwrap().read::<B>().unwrap().build().unwrap();
    let mut n_both = 0;
    {
        let mut iter = world.run_query(&mut with_both, last_run);
        while iter.next().is_some() {
            n_both += 1;
        }
    }
    assert_eq!(n_both, 500);

    let mut without_b = world.query_builder().read::<A>().unwrap().without::<B>().unwrap().build().unwrap();
    let mut n_without = 0;
    {
        let mut iter = world.run_query(&mut without_b, last_run);
        while iter.next().is_some() {
            n_without += 1;
        }
    }
    assert_eq!(n_without, 500);
}

struct SpawnWithPosition;
impl System for SpawnWithPosition {
    fn access(&self) -> SystemAccess {
        SystemAccess::empty()
    }
    fn name(&self) -> &'static str {
        "spawn_with_position"
    }
    fn run(&mut self, world: &World, commands: &mut CommandBuffer) -> archetype_ecs::Result<()> {
        commands.spawn(world, (A(7),));
        Ok(())
    }
}

#[test]
fn system_spawning_through_commands_is_observed_after_the_barrier() {
    let mut world = World::new();
    let mut schedule = Schedule::new();
    schedule.add_system(Box::new(SpawnWithPosition));
    let mut executor = Executor::new(ExecutorKind::SingleThreaded);

    executor.execute_frame(&mut world, &mut schedule).unwrap();

    let last_run = Tick::ZERO;
    let kind = world.component_registry().id_of::<A>().unwrap();
    let mut state = world.query_builder().read::<A>().unwrap().build().unwrap();
    let mut found = Vec::new();
    {
        let mut iter = world.run_query(&mut state, last_run);
        while let Some(row) = iter.next() {
            found.push(row.get::<A>(kind).copied());
        }
    }
    assert_eq!(found, vec![Some(A(7))]);
}

struct Writer;
impl System for Writer {
    fn access(&self) -> SystemAccess {
        let mut access = SystemAccess::empty();
        access.resource_writes.push(std::any::TypeId::of::<u32>());
        access
    }
    fn name(&self) -> &'static str {
        "writer"
    }
    fn run(&mut self, _world: &World, commands: &mut CommandBuffer) -> archetype_ecs::Result<()> {
        commands.insert_resource(1u32);
        Ok(())
    }
}

struct Reader;
impl System for Reader {
    fn access(&self) -> SystemAccess {
        let mut access = SystemAccess::empty();
        access.resource_reads.push(std::any::TypeId::of::<u32>());
        access
    }
    fn name(&self) -> &'static str {
        "reader"
    }
    fn run(&mut self, world: &World, commands: &mut CommandBuffer) -> archetype_ecs::Result<()> {
        let value = *world.resource::<u32>().expect("writer's barrier already ran");
        commands.insert_resource(value * 2);
        Ok(())
    }
}

#[test]
fn conflicting_systems_with_no_ordering_edge_fail_to_build() {
    let mut schedule = Schedule::new();
    schedule.add_system(Box::new(Writer));
    schedule.add_system(Box::new(Reader));
    let err = schedule.ensure_built().unwrap_err();
    assert!(matches!(err, archetype_ecs::EcsError::ConflictingAccess(_)));
}

#[test]
fn explicit_after_edge_makes_the_second_system_observe_the_first_writes() {
    let mut world = World::new();
    let mut schedule = Schedule::new();
    schedule.add_system(Box::new(Writer));
    schedule.add_system(Box::new(Reader));
    schedule.add_system_after("reader", "writer");

    let mut executor = Executor::new(ExecutorKind::SingleThreaded);
    executor.execute_frame(&mut world, &mut schedule).unwrap();
    assert_eq!(world.resource::<u32>(), Some(&2));
}

#[test]
fn change_detection_window_closes_after_one_extra_frame() {
    let mut world = World::new();
    let entity = world.spawn((A(0),));

    let t0 = world.current_tick();
    world.advance_tick();
    *world.get_component_mut::<A>(entity).unwrap() = A(1);
    let t2 = world.advance_tick();

    let mut changed_at_t0 = world.query_builder().read::<A>().unwrap().changed::<A>().unwrap().build().unwrap();
    let mut found = 0;
    {
        let mut iter = world.run_query(&mut changed_at_t0, t0);
        while iter.next().is_some() {
            found += 1;
        }
    }
    assert_eq!(found, 1);

    let mut changed_at_t2 = world.query_builder().read::<A>().unwrap().changed::<A>().unwrap().build().unwrap();
    let mut found_again = 0;
    {
        let mut iter = world.run_query(&mut changed_at_t2, t2);
        while iter.next().is_some() {
            found_again += 1;
        }
    }
    assert_eq!(found_again, 0);
}

#[test]
fn spawn_then_despawn_leaves_counts_unchanged() {
    let mut world = World::new();
    let before_entities = world.entity_count();
    let empty = world.archetype_graph().empty_archetype();
    let before_rows = world.archetype_graph().get(empty).len();

    let entity = world.spawn_empty();
    world.despawn(entity).unwrap();

    assert_eq!(world.entity_count(), before_entities);
    assert_eq!(world.archetype_graph().get(empty).len(), before_rows);
}
