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

//! Error types

use std::any::TypeId;
use std::fmt;

/// ECS error type.
///
/// Lookup failures (a missing component, a stale entity, an empty `single()`)
/// are returned as plain `Option::None` at the call site and never appear
/// here; this enum carries only the failures the core treats as fatal to the
/// operation or the schedule that triggered them.
#[derive(Debug, Clone)]
pub enum EcsError {
    /// A component type was registered twice with conflicting size/align/drop metadata.
    KindAlreadyRegisteredWithDifferentLayout(&'static str),

    /// `create_at(hint)` was called with an index already occupied by a live entity.
    EntityIndexInUse(u32),

    /// An entity handle's generation did not match the directory's live generation.
    EntityStale,

    /// A row index was used after the row moved to a different archetype.
    RowInvalidated,

    /// A query declared conflicting access to the same component kind.
    ConflictingAccess(&'static str),

    /// `single()` matched zero or more than one row.
    NotUnique { matched: usize },

    /// The archetype generation advanced while a query iterator was live.
    StaleIteration,

    /// A schedule's before/after edges contain a cycle.
    CycleInSchedule(Vec<String>),

    /// A system id referenced in an edge was never registered in the schedule.
    SystemNotFound,

    /// `World::run_schedule`/`schedule_mut` referenced a name never passed to
    /// `World::add_schedule`.
    ScheduleNotFound(&'static str),

    /// The entity index space (`u32`) is exhausted.
    EntityCapacityExhausted { attempted: usize, capacity: usize },

    /// A resource operation referenced a type with no stored value.
    ResourceNotFound(TypeId),

    /// A sub-world extract function returned an error.
    ExtractFailed(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::KindAlreadyRegisteredWithDifferentLayout(name) => {
                write!(f, "component `{name}` re-registered with a different layout")
            }
            EcsError::EntityIndexInUse(index) => {
                write!(f, "entity index {index} is already in use")
            }
            EcsError::EntityStale => write!(f, "entity handle is stale"),
            EcsError::RowInvalidated => write!(f, "row index used after it was invalidated by a move"),
            EcsError::ConflictingAccess(name) => {
                write!(f, "conflicting access declared for `{name}`")
            }
            EcsError::NotUnique { matched } => {
                write!(f, "expected exactly one match, found {matched}")
            }
            EcsError::StaleIteration => {
                write!(f, "archetype generation advanced during iteration")
            }
            EcsError::CycleInSchedule(path) => {
                write!(f, "cycle in schedule graph: {}", path.join(" -> "))
            }
            EcsError::SystemNotFound => write!(f, "system not found"),
            EcsError::ScheduleNotFound(name) => write!(f, "no schedule registered under `{name}`"),
            EcsError::EntityCapacityExhausted { attempted, capacity } => {
                write!(f, "entity capacity exhausted: attempted {attempted}, capacity {capacity}")
            }
            EcsError::ResourceNotFound(type_id) => {
                write!(f, "resource not found: {type_id:?}")
            }
            EcsError::ExtractFailed(reason) => write!(f, "sub-world extract failed: {reason}"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
