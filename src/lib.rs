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

//! Archetype-based entity component system.
//!
//! Entities are dense rows grouped by their exact component set
//! (an archetype); systems declare the kinds and resources they touch so the
//! scheduler can run non-conflicting systems on the same stage, or across a
//! `rayon` pool under the parallel executor.

pub mod archetype;
pub mod archetype_graph;
pub mod command;
pub mod component;
pub mod config;
pub mod entity;
pub mod error;
pub mod executor;
pub mod message;
pub mod query;
pub mod resource;
pub mod schedule;
pub mod subworld;
pub mod system;
pub mod tick;
pub mod utils;
pub mod world;

pub use archetype::{Archetype, ArchetypeId};
pub use command::CommandBuffer;
pub use component::{Bundle, Component, ComponentId, ComponentRegistry};
pub use config::{ExecutorKind, WorldConfig};
pub use entity::{EntityId, EntityLocation};
pub use error::{EcsError, Result};
pub use executor::{
    Executor, ExitHandle, ExitRequested, ExitStatus, Runner, ScheduleDebugInfo, SystemProfiler, SystemStats,
};
pub use message::{MessageBus, MessageReader};
pub use query::{AccessSummary, QueryBuilder, QueryIter, QueryState, RowView, WriteHandle};
pub use resource::ResourceStore;
pub use schedule::{Schedule, Stage, SystemSet};
pub use subworld::SubWorld;
pub use system::{BoxedSystem, RunCondition, System, SystemAccess, SystemId};
pub use tick::{ChangeTickEngine, Tick};
pub use world::{SyncRecord, World};
