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

//! World configuration. Built with the struct-update pattern and handed to
//! [`crate::world::World::with_config`]; there is no environment or file
//! loading layer, by design.

use crate::archetype::DEFAULT_CHUNK_CAPACITY;
use crate::tick::DEFAULT_MAINTENANCE_THRESHOLD;

/// Which executor a schedule runs under.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecutorKind {
    /// Runs every system on the calling thread, in topological order.
    SingleThreaded,
    /// Stages disjoint-access systems onto a `rayon` thread pool.
    #[cfg(feature = "parallel")]
    Parallel,
}

impl Default for ExecutorKind {
    fn default() -> Self {
        ExecutorKind::SingleThreaded
    }
}

/// World-wide tunables. None of these affect correctness, only throughput
/// and memory shape; every field has a sensible default.
#[derive(Clone, Copy, Debug)]
pub struct WorldConfig {
    /// Row capacity of one logical archetype chunk.
    pub archetype_chunk_capacity: usize,
    /// Fraction of trailing empty chunks that triggers `Archetype::compact`.
    pub chunk_hysteresis_fraction: f64,
    /// Distance from the current tick that triggers a maintenance rebase.
    pub tick_maintenance_threshold: u32,
    /// Which executor runs this world's schedules.
    pub executor_kind: ExecutorKind,
    /// Worker count for the parallel executor; ignored otherwise. `0` means
    /// "use the ambient rayon global pool's thread count".
    pub worker_count: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            archetype_chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            chunk_hysteresis_fraction: 0.5,
            tick_maintenance_threshold: DEFAULT_MAINTENANCE_THRESHOLD,
            executor_kind: ExecutorKind::default(),
            worker_count: 0,
        }
    }
}

impl WorldConfig {
    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.archetype_chunk_capacity = capacity;
        self
    }

    pub fn with_hysteresis_fraction(mut self, fraction: f64) -> Self {
        self.chunk_hysteresis_fraction = fraction;
        self
    }

    pub fn with_tick_maintenance_threshold(mut self, threshold: u32) -> Self {
        self.tick_maintenance_threshold = threshold;
        self
    }

    pub fn with_executor_kind(mut self, kind: ExecutorKind) -> Self {
        self.executor_kind = kind;
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_apply() {
        let config = WorldConfig::default().with_chunk_capacity(256).with_worker_count(4);
        assert_eq!(config.archetype_chunk_capacity, 256);
        assert_eq!(config.worker_count, 4);
    }

    #[test]
    fn default_matches_archetype_and_tick_defaults() {
        let config = WorldConfig::default();
        assert_eq!(config.archetype_chunk_capacity, DEFAULT_CHUNK_CAPACITY);
        assert_eq!(config.tick_maintenance_threshold, DEFAULT_MAINTENANCE_THRESHOLD);
    }
}
