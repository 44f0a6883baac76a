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

//! The `System` trait and the access metadata the schedule uses to decide
//! which systems may run on the same stage.

use smallvec::SmallVec;
use std::any::TypeId;

use crate::command::CommandBuffer;
use crate::error::Result;
use crate::query::AccessSummary;
use crate::world::World;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(pub u32);

/// Everything a system touches: component kinds (via its queries), resource
/// types, and whether it needs unmediated `&mut World` access. Two systems
/// may share a stage only if neither's access conflicts with the other's.
#[derive(Clone, Debug, Default)]
pub struct SystemAccess {
    pub components: AccessSummary,
    pub resource_reads: SmallVec<[TypeId; 4]>,
    pub resource_writes: SmallVec<[TypeId; 4]>,
    /// An exclusive system conflicts with every other system, including
    /// itself paired with anything: it always runs alone in its own stage.
    pub exclusive: bool,
}

impl SystemAccess {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn conflicts_with(&self, other: &SystemAccess) -> bool {
        if self.exclusive || other.exclusive {
            return true;
        }
        self.components.conflicts_with(&other.components)
            || self
                .resource_writes
                .iter()
                .any(|r| other.resource_writes.contains(r) || other.resource_reads.contains(r))
            || other.resource_writes.iter().any(|r| self.resource_reads.contains(r))
    }
}

/// A unit of scheduled work. Systems observe the world through `&World` and
/// queue structural changes through their own `CommandBuffer`; they never
/// hold `&mut World` directly unless `SystemAccess::exclusive` is set, in
/// which case the executor gives them sole access to the stage.
pub trait System: Send + Sync {
    fn access(&self) -> SystemAccess;
    fn name(&self) -> &'static str;
    fn run(&mut self, world: &World, commands: &mut CommandBuffer) -> Result<()>;
}

pub type BoxedSystem = Box<dyn System>;

/// A predicate gating whether a system runs this schedule invocation at all.
/// Skipped systems contribute no access and never get a stage slot.
pub trait RunCondition: Send + Sync {
    fn should_run(&self, world: &World) -> bool;
}

impl<F: Fn(&World) -> bool + Send + Sync> RunCondition for F {
    fn should_run(&self, world: &World) -> bool {
        self(world)
    }
}
