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

//! Builds a set of systems into stages of mutually non-conflicting work,
//! honoring explicit before/after edges on top of the access-conflict edges
//! `SystemAccess::conflicts_with` implies.

use rustc_hash::FxHashMap;

use crate::error::{EcsError, Result};
use crate::system::{BoxedSystem, RunCondition, SystemAccess, SystemId};

/// A named group of systems. Ordering edges may target a set instead of a
/// single system; the planner expands a set-level edge into one edge per
/// member of that set before the usual topological sort runs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SystemSet(pub &'static str);

struct SystemEntry {
    id: SystemId,
    name: &'static str,
    system: BoxedSystem,
    condition: Option<Box<dyn RunCondition>>,
    set: Option<SystemSet>,
}

/// One explicit ordering edge, named at registration time and resolved to
/// ids (possibly several, if either end names a set) when the schedule is
/// (re)built.
struct OrderingEdge {
    before: &'static str,
    after: &'static str,
    without_barrier: bool,
}

/// A batch of systems with no pairwise access conflict; the executor may run
/// all of them concurrently (or in any order, single-threaded).
pub struct Stage {
    pub(crate) systems: Vec<SystemId>,
    /// Whether every edge crossing into the next stage was declared
    /// `_without_barrier`, so the executor may skip the command-buffer flush
    /// after this stage.
    pub(crate) skip_trailing_barrier: bool,
}

impl Stage {
    fn new() -> Self {
        Self {
            systems: Vec::new(),
            skip_trailing_barrier: false,
        }
    }
}

/// Dependency-ordered, conflict-free stage plan over a fixed set of systems.
/// Call `add_system`/`add_system_before`/`add_system_after` to register
/// systems and edges, then `ensure_built` (or let the executor call it) to
/// produce the stage plan lazily.
pub struct Schedule {
    entries: Vec<SystemEntry>,
    edges: Vec<OrderingEdge>,
    sets: Vec<SystemSet>,
    next_id: u32,
    stages: Option<Vec<Stage>>,
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            edges: Vec::new(),
            sets: Vec::new(),
            next_id: 0,
            stages: None,
        }
    }

    pub fn from_systems(systems: Vec<BoxedSystem>) -> Self {
        let mut schedule = Self::new();
        for system in systems {
            schedule.add_system(system);
        }
        schedule
    }

    pub fn add_system(&mut self, system: BoxedSystem) -> SystemId {
        let id = SystemId(self.next_id);
        self.next_id += 1;
        let name = system.name();
        self.entries.push(SystemEntry {
            id,
            name,
            system,
            condition: None,
            set: None,
        });
        self.invalidate();
        id
    }

    pub fn add_system_with_condition(&mut self, system: BoxedSystem, condition: Box<dyn RunCondition>) -> SystemId {
        let id = self.add_system(system);
        self.entries.last_mut().unwrap().condition = Some(condition);
        id
    }

    /// Register `system` as a member of `set`. Ordering edges declared
    /// against `set` (via [`Schedule::add_set`]) apply to every system added
    /// this way, expanded to system-level edges when the schedule builds.
    pub fn add_system_in_set(&mut self, system: BoxedSystem, set: SystemSet) -> SystemId {
        let id = self.add_system(system);
        self.entries.last_mut().unwrap().set = Some(set);
        id
    }

    /// Register `set`, optionally ordering it relative to another set or
    /// system named by `before`/`after`. Safe to call more than once for the
    /// same set (e.g. once to register it, once to add an edge).
    pub fn add_set(&mut self, set: SystemSet, before: Option<&'static str>, after: Option<&'static str>) {
        if !self.sets.contains(&set) {
            self.sets.push(set);
        }
        if let Some(before_name) = before {
            self.edges.push(OrderingEdge {
                before: set.0,
                after: before_name,
                without_barrier: false,
            });
        }
        if let Some(after_name) = after {
            self.edges.push(OrderingEdge {
                before: after_name,
                after: set.0,
                without_barrier: false,
            });
        }
        self.invalidate();
    }

    /// Declare that the system named `before` must run in an earlier or the
    /// same stage as the system named `after`, with a barrier flushed
    /// between their stages if they land in different ones.
    pub fn add_system_before(&mut self, before: &'static str, after: &'static str) {
        self.edges.push(OrderingEdge {
            before,
            after,
            without_barrier: false,
        });
        self.invalidate();
    }

    pub fn add_system_after(&mut self, after: &'static str, before: &'static str) {
        self.add_system_before(before, after);
    }

    /// Like [`Schedule::add_system_before`], but the command-buffer flush
    /// that would otherwise separate the two systems' stages is skipped for
    /// this edge: `after` may run without observing `before`'s queued
    /// commands. [`Schedule::rebuild`] only omits a stage's trailing barrier
    /// when every edge crossing that boundary was declared this way.
    pub fn add_system_before_without_barrier(&mut self, before: &'static str, after: &'static str) {
        self.edges.push(OrderingEdge {
            before,
            after,
            without_barrier: true,
        });
        self.invalidate();
    }

    pub fn add_system_after_without_barrier(&mut self, after: &'static str, before: &'static str) {
        self.add_system_before_without_barrier(before, after);
    }

    pub fn invalidate(&mut self) {
        self.stages = None;
    }

    pub fn system_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stage_count(&mut self) -> Result<usize> {
        self.ensure_built()?;
        Ok(self.stages.as_ref().unwrap().len())
    }

    pub fn ensure_built(&mut self) -> Result<()> {
        if self.stages.is_none() {
            self.rebuild()?;
        }
        Ok(())
    }

    /// Resolves an edge endpoint to the system indices it names: a single
    /// element if `name` is a system, every member if `name` is a
    /// registered [`SystemSet`], or `SystemNotFound` if it is neither.
    fn resolve_group(&self, name_to_index: &FxHashMap<&'static str, usize>, name: &'static str) -> Result<Vec<usize>> {
        if let Some(&idx) = name_to_index.get(name) {
            return Ok(vec![idx]);
        }
        if self.sets.iter().any(|s| s.0 == name) {
            return Ok(self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.set == Some(SystemSet(name)))
                .map(|(i, _)| i)
                .collect());
        }
        Err(EcsError::SystemNotFound)
    }

    /// Topologically orders the systems by combining the access-conflict
    /// graph with explicit before/after edges (set-level edges expanded to
    /// per-system edges first), then greedily packs the ordering into
    /// conflict-free stages. Fails with `ConflictingAccess` if two systems
    /// conflict and neither this schedule's edges nor their transitive
    /// closure orders one before the other — an access conflict is only
    /// resolved by an explicit edge, never invented silently.
    fn rebuild(&mut self) -> Result<()> {
        let n = self.entries.len();
        let mut name_to_index = FxHashMap::default();
        for (i, e) in self.entries.iter().enumerate() {
            name_to_index.insert(e.name, i);
        }

        // Flatten every edge (expanding set endpoints to one entry per
        // member) once; both the topological sort and the barrier-skip pass
        // below read from this same list.
        let mut resolved_edges: Vec<(usize, usize, bool)> = Vec::new();
        for edge in &self.edges {
            let befores = self.resolve_group(&name_to_index, edge.before)?;
            let afters = self.resolve_group(&name_to_index, edge.after)?;
            for &before in &befores {
                for &after in &afters {
                    resolved_edges.push((before, after, edge.without_barrier));
                }
            }
        }

        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree: Vec<usize> = vec![0; n];
        for &(before, after, _) in &resolved_edges {
            adjacency[before].push(after);
            indegree[after] += 1;
        }

        let access: Vec<SystemAccess> = self.entries.iter().map(|e| e.system.access()).collect();

        let mut queue: std::collections::VecDeque<usize> =
            (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        let mut remaining_indegree = indegree.clone();

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &next in &adjacency[node] {
                remaining_indegree[next] -= 1;
                if remaining_indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != n {
            let stuck: Vec<String> = (0..n)
                .filter(|i| !order.contains(i))
                .map(|i| self.entries[i].name.to_string())
                .collect();
            return Err(EcsError::CycleInSchedule(stuck));
        }

        // A node's transitive descendants, built in reverse topological
        // order so a node's direct successors are already complete.
        let mut descendants: Vec<std::collections::HashSet<usize>> = vec![Default::default(); n];
        for &node in order.iter().rev() {
            let mut reachable = std::collections::HashSet::new();
            for &next in &adjacency[node] {
                reachable.insert(next);
                for &d in &descendants[next] {
                    reachable.insert(d);
                }
            }
            descendants[node] = reachable;
        }

        for i in 0..n {
            for j in (i + 1)..n {
                if access[i].conflicts_with(&access[j]) && !descendants[i].contains(&j) && !descendants[j].contains(&i) {
                    return Err(EcsError::ConflictingAccess(self.entries[i].name));
                }
            }
        }

        // Greedily pack the topological order into the fewest stages such
        // that no two systems in a stage conflict, and an explicit edge
        // never places its `after` system in the same or an earlier stage
        // than its `before` system. The conflict check above guarantees any
        // two systems landing in different stages here either don't
        // conflict or are ordered by an edge; it can never fail to find a
        // slot.
        let mut stage_of = vec![usize::MAX; n];
        let mut stages: Vec<Stage> = Vec::new();

        'outer: for &node in &order {
            let min_stage = adjacency
                .iter()
                .enumerate()
                .filter(|(from, targets)| targets.contains(&node) && stage_of[*from] != usize::MAX)
                .map(|(from, _)| stage_of[from] + 1)
                .max()
                .unwrap_or(0);

            for stage_idx in min_stage..stages.len() {
                let stage = &stages[stage_idx];
                let conflicts = stage.systems.iter().any(|sid| {
                    let other = sid.0 as usize;
                    access[node].conflicts_with(&access[other])
                });
                if !conflicts {
                    stages[stage_idx].systems.push(self.entries[node].id);
                    stage_of[node] = stage_idx;
                    continue 'outer;
                }
            }

            let mut new_stage = Stage::new();
            new_stage.systems.push(self.entries[node].id);
            stage_of[node] = stages.len();
            stages.push(new_stage);
        }

        // A stage's trailing barrier may be skipped only if at least one
        // edge crosses into a later stage, and every edge that does was
        // declared `_without_barrier`.
        for stage_idx in 0..stages.len() {
            let mut saw_crossing_edge = false;
            let mut saw_barrier_edge = false;
            for &(before, after, without_barrier) in &resolved_edges {
                if stage_of[before] == stage_idx && stage_of[after] > stage_idx {
                    saw_crossing_edge = true;
                    if !without_barrier {
                        saw_barrier_edge = true;
                    }
                }
            }
            stages[stage_idx].skip_trailing_barrier = saw_crossing_edge && !saw_barrier_edge;
        }

        self.stages = Some(stages);
        Ok(())
    }

    pub(crate) fn stages(&self) -> &[Stage] {
        self.stages.as_ref().expect("ensure_built was called")
    }

    pub(crate) fn entry_index(&self, id: SystemId) -> usize {
        id.0 as usize
    }

    pub(crate) fn entry(&mut self, id: SystemId) -> &mut SystemEntry {
        let index = self.entry_index(id);
        &mut self.entries[index]
    }

    /// Disjoint mutable borrows of several entries at once, for the parallel
    /// executor. Safe because `ids` always comes from a single stage, whose
    /// system ids are guaranteed distinct by construction in `rebuild`.
    #[cfg(feature = "parallel")]
    pub(crate) fn entries_disjoint_mut(&mut self, ids: &[SystemId]) -> Vec<&mut SystemEntry> {
        let base = self.entries.as_mut_ptr();
        ids.iter()
            .map(|id| {
                let index = self.entry_index(*id);
                // SAFETY: each `index` is distinct within `ids`, so the
                // resulting `&mut` references never alias.
                unsafe { &mut *base.add(index) }
            })
            .collect()
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn should_run(entry: &SystemEntry, world: &crate::world::World) -> bool {
    match &entry.condition {
        Some(cond) => cond.should_run(world),
        None => true,
    }
}

pub(crate) fn run_system(
    entry: &mut SystemEntry,
    world: &crate::world::World,
    commands: &mut crate::command::CommandBuffer,
) -> Result<()> {
    entry.system.run(world, commands)
}

pub(crate) fn entry_name(entry: &SystemEntry) -> &'static str {
    entry.name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuffer;
    use crate::world::World;

    struct Noop(&'static str);
    impl crate::system::System for Noop {
        fn access(&self) -> SystemAccess {
            SystemAccess::empty()
        }
        fn name(&self) -> &'static str {
            self.0
        }
        fn run(&mut self, _world: &World, _commands: &mut CommandBuffer) -> Result<()> {
            Ok(())
        }
    }

    struct Exclusive(&'static str);
    impl crate::system::System for Exclusive {
        fn access(&self) -> SystemAccess {
            let mut access = SystemAccess::empty();
            access.exclusive = true;
            access
        }
        fn name(&self) -> &'static str {
            self.0
        }
        fn run(&mut self, _world: &World, _commands: &mut CommandBuffer) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn independent_systems_share_a_stage() {
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(Noop("a")));
        schedule.add_system(Box::new(Noop("b")));
        assert_eq!(schedule.stage_count().unwrap(), 1);
    }

    #[test]
    fn exclusive_systems_each_get_their_own_stage() {
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(Exclusive("a")));
        schedule.add_system(Box::new(Exclusive("b")));
        schedule.add_system_before("a", "b");
        assert_eq!(schedule.stage_count().unwrap(), 2);
    }

    #[test]
    fn conflicting_systems_with_no_edge_fail_to_build() {
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(Exclusive("a")));
        schedule.add_system(Box::new(Exclusive("b")));
        let err = schedule.ensure_built().unwrap_err();
        assert!(matches!(err, EcsError::ConflictingAccess("a")));
    }

    #[test]
    fn set_level_edge_expands_to_every_member() {
        let mut schedule = Schedule::new();
        schedule.add_system_in_set(Box::new(Noop("early_a")), SystemSet("early"));
        schedule.add_system_in_set(Box::new(Noop("early_b")), SystemSet("early"));
        schedule.add_system_in_set(Box::new(Noop("late_a")), SystemSet("late"));
        schedule.add_set(SystemSet("early"), Some("late"), None);
        schedule.add_set(SystemSet("late"), None, None);

        schedule.ensure_built().unwrap();
        let stages = schedule.stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].systems.len(), 2);
        assert_eq!(stages[1].systems.len(), 1);
    }

    #[test]
    fn without_barrier_edge_lets_the_stage_skip_its_flush() {
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(Noop("a")));
        schedule.add_system(Box::new(Noop("b")));
        schedule.add_system_before_without_barrier("a", "b");
        schedule.ensure_built().unwrap();
        let stages = schedule.stages();
        assert_eq!(stages.len(), 2);
        assert!(stages[0].skip_trailing_barrier);
    }

    #[test]
    fn barrier_edge_forces_a_flush_even_if_another_edge_opts_out() {
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(Noop("a")));
        schedule.add_system(Box::new(Noop("b")));
        schedule.add_system(Box::new(Noop("c")));
        schedule.add_system_before_without_barrier("a", "c");
        schedule.add_system_before("b", "c");
        schedule.ensure_built().unwrap();
        let stages = schedule.stages();
        assert_eq!(stages.len(), 2);
        assert!(!stages[0].skip_trailing_barrier);
    }

    #[test]
    fn explicit_before_edge_forces_separate_stages() {
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(Noop("a")));
        schedule.add_system(Box::new(Noop("b")));
        schedule.add_system_before("a", "b");
        schedule.ensure_built().unwrap();
        let stages = schedule.stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].systems[0].0, 0);
        assert_eq!(stages[1].systems[0].0, 1);
    }

    #[test]
    fn cycle_is_reported_with_offending_names() {
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(Noop("a")));
        schedule.add_system(Box::new(Noop("b")));
        schedule.add_system_before("a", "b");
        schedule.add_system_before("b", "a");
        let err = schedule.ensure_built().unwrap_err();
        match err {
            EcsError::CycleInSchedule(names) => {
                assert_eq!(names.len(), 2);
            }
            other => panic!("expected CycleInSchedule, got {other:?}"),
        }
    }
}
