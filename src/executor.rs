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

//! Runs a [`Schedule`] against a [`World`]: executes each stage, flushes
//! command buffers at the barrier between stages, and (optionally) records
//! per-system timing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::command::CommandBuffer;
use crate::config::ExecutorKind;
use crate::error::Result;
use crate::message::MessageReader;
use crate::schedule::{run_system, should_run, Schedule};
use crate::system::SystemId;
use crate::world::World;

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemStats {
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub call_count: u64,
}

/// Rolling per-system timing, used for `#[cfg(feature = "profiling")]`
/// diagnostics; carries no cost beyond a `HashMap` insert when disabled.
#[derive(Default)]
pub struct SystemProfiler {
    timings: HashMap<SystemId, Vec<Duration>>,
}

impl SystemProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_execution(&mut self, id: SystemId, elapsed: Duration) {
        self.timings.entry(id).or_default().push(elapsed);
    }

    pub fn get_stats(&self, id: SystemId) -> Option<SystemStats> {
        let samples = self.timings.get(&id)?;
        if samples.is_empty() {
            return None;
        }
        let min = *samples.iter().min().unwrap();
        let max = *samples.iter().max().unwrap();
        let total: Duration = samples.iter().sum();
        let avg = total / samples.len() as u32;
        Some(SystemStats {
            min,
            max,
            avg,
            call_count: samples.len() as u64,
        })
    }

    pub fn clear(&mut self) {
        self.timings.clear();
    }
}

/// Executes a schedule's stages against a world, applying the chosen
/// [`ExecutorKind`] to decide whether a stage's systems run sequentially or
/// across a `rayon` pool.
pub struct Executor {
    kind: ExecutorKind,
    profiler: SystemProfiler,
    #[cfg(feature = "parallel")]
    worker_pool: Option<(usize, rayon::ThreadPool)>,
}

impl Executor {
    pub fn new(kind: ExecutorKind) -> Self {
        Self {
            kind,
            profiler: SystemProfiler::new(),
            #[cfg(feature = "parallel")]
            worker_pool: None,
        }
    }

    pub fn profiler(&self) -> &SystemProfiler {
        &self.profiler
    }

    /// Runs every stage of `schedule` once against `world`, in order. Each
    /// stage's systems observe `world` through a shared `&World` and queue
    /// structural changes into their own `CommandBuffer`; after a stage
    /// finishes, [`Executor::barrier`] applies every buffer from that stage
    /// before the next stage begins.
    pub fn execute_frame(&mut self, world: &mut World, schedule: &mut Schedule) -> Result<()> {
        schedule.ensure_built()?;
        let stage_count = schedule.stages().len();

        // Buffers from a stage whose trailing barrier was skipped (every
        // crossing edge declared `_without_barrier`) carry forward and flush
        // together with the next stage that does require one, rather than
        // being dropped: the opt-out defers a flush, it never cancels one.
        let mut pending: Vec<CommandBuffer> = Vec::new();
        for stage_idx in 0..stage_count {
            let system_ids: Vec<SystemId> = schedule.stages()[stage_idx].systems.clone();
            let buffers = self.run_stage(world, schedule, &system_ids)?;
            pending.extend(buffers);
            if !schedule.stages()[stage_idx].skip_trailing_barrier {
                self.barrier(world, &mut pending)?;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            self.barrier(world, &mut pending)?;
        }

        world.advance_tick();
        world.messages_mut().update();
        Ok(())
    }

    fn run_stage(
        &mut self,
        world: &World,
        schedule: &mut Schedule,
        system_ids: &[SystemId],
    ) -> Result<Vec<CommandBuffer>> {
        match self.kind {
            ExecutorKind::SingleThreaded => {
                let mut buffers = Vec::with_capacity(system_ids.len());
                for &id in system_ids {
                    let entry = schedule.entry(id);
                    if !should_run(entry, world) {
                        continue;
                    }
                    let mut commands = CommandBuffer::new();
                    let started = Instant::now();
                    run_system(entry, world, &mut commands)?;
                    self.profiler.record_execution(id, started.elapsed());
                    buffers.push(commands);
                }
                Ok(buffers)
            }
            #[cfg(feature = "parallel")]
            ExecutorKind::Parallel => self.run_stage_parallel(world, schedule, system_ids),
        }
    }

    #[cfg(feature = "parallel")]
    fn run_stage_parallel(
        &mut self,
        world: &World,
        schedule: &mut Schedule,
        system_ids: &[SystemId],
    ) -> Result<Vec<CommandBuffer>> {
        use rayon::prelude::*;

        let runnable: Vec<SystemId> = system_ids
            .iter()
            .copied()
            .filter(|&id| should_run(schedule.entry(id), world))
            .collect();

        let entries = schedule.entries_disjoint_mut(&runnable);
        let run_all = || -> Vec<(Duration, Result<CommandBuffer>)> {
            entries
                .into_par_iter()
                .map(|entry| {
                    let mut commands = CommandBuffer::new();
                    let started = Instant::now();
                    let result = run_system(entry, world, &mut commands);
                    (started.elapsed(), result.map(|_| commands))
                })
                .collect()
        };

        // `worker_count == 0` means "use the ambient rayon global pool" and
        // skips building a scoped one; otherwise the stage's systems run on
        // a pool sized to the world's config, built once and reused across
        // frames as long as the count doesn't change.
        let worker_count = world.config().worker_count;
        let results: Vec<(Duration, Result<CommandBuffer>)> = if worker_count == 0 {
            run_all()
        } else {
            if !matches!(&self.worker_pool, Some((count, _)) if *count == worker_count) {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(worker_count)
                    .build()
                    .expect("rayon thread pool construction");
                self.worker_pool = Some((worker_count, pool));
            }
            let (_, pool) = self.worker_pool.as_ref().expect("just built or already present");
            pool.install(run_all)
        };

        let mut buffers = Vec::with_capacity(results.len());
        for (&id, (elapsed, result)) in runnable.iter().zip(results) {
            self.profiler.record_execution(id, elapsed);
            buffers.push(result?);
        }
        Ok(buffers)
    }

    /// Applies every command buffer produced by the stage that just ran, in
    /// system order. This is the only point at which structural changes
    /// (spawns, despawns, component inserts/removes) become visible to the
    /// next stage's queries. The change tick itself advances once per
    /// `execute_frame` call, not at every barrier; see its call site there.
    fn barrier(&mut self, world: &mut World, buffers: &mut [CommandBuffer]) -> Result<()> {
        for buffer in buffers.iter_mut() {
            buffer.apply(world)?;
        }
        Ok(())
    }
}

/// Sent through a world's message bus to ask a running [`Runner`] to stop
/// once the schedule currently in flight finishes. A system with access to
/// `&World` can queue one through a `CommandBuffer::add` closure that calls
/// `world.messages_mut().send(ExitRequested)` when applied, or any code
/// holding `&mut World` directly can send it between frames.
#[derive(Debug, Clone, Copy)]
pub struct ExitRequested;

/// How a [`Runner`] loop ended, mirrored back to whatever started it.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitStatus {
    Success,
    Error { code: i32, message: String },
}

/// A cloneable, `Send` handle that asks a running [`Runner`] to stop from any
/// thread, independent of the world's own message bus. Built on a
/// `crossbeam` channel rather than an `Arc<AtomicBool>` so a request queues
/// even if the runner thread is between frames and not yet polling.
#[derive(Clone)]
pub struct ExitHandle {
    sender: crossbeam::channel::Sender<()>,
}

impl ExitHandle {
    pub fn request_exit(&self) {
        let _ = self.sender.send(());
    }
}

/// Drives an [`Executor`] across repeated frames until an exit is requested,
/// either in-process (an [`ExitRequested`] message on the world's bus, seen
/// by any system) or cross-thread (an [`ExitHandle`]). A schedule run is
/// never interrupted mid-flight: the in-flight frame always finishes, its
/// commands apply, and only then does the runner check for a pending exit.
pub struct Runner {
    executor: Executor,
    exit_rx: crossbeam::channel::Receiver<()>,
    exit_reader: MessageReader<ExitRequested>,
}

impl Runner {
    pub fn new(executor: Executor) -> (Self, ExitHandle) {
        let (sender, exit_rx) = crossbeam::channel::unbounded();
        (
            Self {
                executor,
                exit_rx,
                exit_reader: MessageReader::new(),
            },
            ExitHandle { sender },
        )
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Runs `schedule` against `world` one frame at a time until an exit is
    /// requested or a system returns an error, then returns the resulting
    /// status. A schedule error is reported as `ExitStatus::Error` rather
    /// than propagated, since the runner is meant to be the top of the call
    /// stack.
    pub fn run_until_exit(&mut self, world: &mut World, schedule: &mut Schedule) -> ExitStatus {
        loop {
            if let Err(err) = self.executor.execute_frame(world, schedule) {
                return ExitStatus::Error {
                    code: 1,
                    message: err.to_string(),
                };
            }
            let requested_in_process = !world.messages().read(&mut self.exit_reader).is_empty();
            let requested_cross_thread = self.exit_rx.try_recv().is_ok();
            if requested_in_process || requested_cross_thread {
                return ExitStatus::Success;
            }
        }
    }
}

#[derive(Default)]
pub struct ScheduleDebugInfo {
    pub stage_count: usize,
    pub total_systems: usize,
    pub systems_per_stage: Vec<usize>,
}

impl ScheduleDebugInfo {
    pub fn from_schedule(schedule: &mut Schedule) -> Result<Self> {
        schedule.ensure_built()?;
        let stages = schedule.stages();
        Ok(Self {
            stage_count: stages.len(),
            total_systems: schedule.system_count(),
            systems_per_stage: stages.iter().map(|s| s.systems.len()).collect(),
        })
    }

    #[cfg(feature = "profiling")]
    pub fn print_debug(&self) {
        tracing::debug!(
            stages = self.stage_count,
            systems = self.total_systems,
            per_stage = ?self.systems_per_stage,
            "schedule plan"
        );
    }

    #[cfg(not(feature = "profiling"))]
    pub fn print_debug(&self) {
        eprintln!(
            "schedule plan: {} stages, {} systems, per-stage {:?}",
            self.stage_count, self.total_systems, self.systems_per_stage
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuffer as CmdBuf;
    use crate::config::WorldConfig;
    use crate::system::{System, SystemAccess};

    struct CountingSystem {
        ran: std::sync::Arc<std::sync::atomic::AtomicU32>,
    }

    impl System for CountingSystem {
        fn access(&self) -> SystemAccess {
            SystemAccess::empty()
        }
        fn name(&self) -> &'static str {
            "counting_system"
        }
        fn run(&mut self, _world: &World, _commands: &mut CmdBuf) -> Result<()> {
            self.ran.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn execute_frame_actually_runs_every_system() {
        let mut world = World::with_config(WorldConfig::default());
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(CountingSystem { ran: ran.clone() }));

        let mut executor = Executor::new(ExecutorKind::SingleThreaded);
        executor.execute_frame(&mut world, &mut schedule).unwrap();
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn barrier_applies_queued_spawns() {
        let mut world = World::with_config(WorldConfig::default());

        struct Marker(#[allow(dead_code)] u32);

        struct SpawningSystem;
        impl System for SpawningSystem {
            fn access(&self) -> SystemAccess {
                SystemAccess::empty()
            }
            fn name(&self) -> &'static str {
                "spawning_system"
            }
            fn run(&mut self, world: &World, commands: &mut CmdBuf) -> Result<()> {
                commands.spawn(world, (Marker(1),));
                Ok(())
            }
        }

        let before = world.entity_count();
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(SpawningSystem));
        let mut executor = Executor::new(ExecutorKind::SingleThreaded);
        executor.execute_frame(&mut world, &mut schedule).unwrap();
        assert_eq!(world.entity_count(), before + 1);
    }

    #[test]
    fn runner_stops_after_a_system_sends_exit_requested() {
        let mut world = World::with_config(WorldConfig::default());
        let mut schedule = Schedule::new();

        struct SendExitOnThirdFrame {
            frames: std::sync::Arc<std::sync::atomic::AtomicU32>,
        }
        impl System for SendExitOnThirdFrame {
            fn access(&self) -> SystemAccess {
                SystemAccess::empty()
            }
            fn name(&self) -> &'static str {
                "send_exit_on_third_frame"
            }
            fn run(&mut self, _world: &World, commands: &mut CmdBuf) -> Result<()> {
                let seen = self.frames.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                if seen >= 3 {
                    commands.add(|world| {
                        world.messages_mut().send(ExitRequested);
                        Ok(())
                    });
                }
                Ok(())
            }
        }
        let frames = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        schedule.add_system(Box::new(SendExitOnThirdFrame { frames: frames.clone() }));

        let (mut runner, _handle) = Runner::new(Executor::new(ExecutorKind::SingleThreaded));
        let status = runner.run_until_exit(&mut world, &mut schedule);
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(frames.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn exit_handle_stops_the_runner_from_another_thread() {
        let mut world = World::with_config(WorldConfig::default());
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(CountingSystem { ran: ran.clone() }));

        let (mut runner, handle) = Runner::new(Executor::new(ExecutorKind::SingleThreaded));
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.request_exit();
        });

        let status = runner.run_until_exit(&mut world, &mut schedule);
        assert_eq!(status, ExitStatus::Success);
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }

    #[test]
    fn a_system_error_surfaces_as_exit_status_error() {
        let mut world = World::with_config(WorldConfig::default());
        let mut schedule = Schedule::new();

        struct AlwaysFails;
        impl System for AlwaysFails {
            fn access(&self) -> SystemAccess {
                SystemAccess::empty()
            }
            fn name(&self) -> &'static str {
                "always_fails"
            }
            fn run(&mut self, _world: &World, _commands: &mut CmdBuf) -> Result<()> {
                Err(crate::error::EcsError::SystemNotFound)
            }
        }
        schedule.add_system(Box::new(AlwaysFails));

        let (mut runner, _handle) = Runner::new(Executor::new(ExecutorKind::SingleThreaded));
        match runner.run_until_exit(&mut world, &mut schedule) {
            ExitStatus::Error { code, .. } => assert_eq!(code, 1),
            ExitStatus::Success => panic!("expected the failing system to produce an error status"),
        }
    }
}
