//! Strata ECS -- in-memory columnar storage for entities with runtime schemas.
//!
//! Entities are grouped by their exact set of component types into
//! archetypes. Each archetype stores its rows in fixed-capacity chunks, one
//! contiguous column per component. Structural changes are recorded in a
//! [`CommandBuffer`](command::CommandBuffer) and applied in batches, and
//! [`QueryDescription`](query::QueryDescription)s select archetypes by
//! component-set predicates with a bloom-filter fast path and an incremental
//! match cache.
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! let mut buffer = CommandBuffer::new(&world);
//! let pending = buffer
//!     .create()
//!     .set(Position { x: 0.0, y: 0.0 })
//!     .set(Velocity { dx: 1.0, dy: 0.0 })
//!     .entity();
//! let entity = buffer.playback(&mut world).unwrap().resolve(pending).unwrap();
//!
//! let moving = QueryBuilder::new()
//!     .include::<Position>()
//!     .include::<Velocity>()
//!     .build(&world)
//!     .unwrap();
//! moving.for_each_chunk_mut(&mut world, |chunk| {
//!     let dx: Vec<f32> = chunk.column::<Velocity>().unwrap().iter().map(|v| v.dx).collect();
//!     for (pos, dx) in chunk.column_mut::<Position>().unwrap().iter_mut().zip(dx) {
//!         pos.x += dx;
//!     }
//! });
//!
//! assert_eq!(world.get::<Position>(entity).unwrap(), &Position { x: 1.0, y: 0.0 });
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod bloom;
pub mod chunk;
pub mod command;
pub mod component;
pub mod component_set;
pub mod entity;
pub mod events;
pub mod hash;
mod pending;
pub mod query;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity's slot has been vacated or reused since the handle was issued.
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::EntityId },

    /// An entity or query was used with a world other than its own.
    #[error("handle belongs to {found}, but was used with {expected}")]
    WrongWorld {
        expected: entity::WorldId,
        found: entity::WorldId,
    },

    #[error("entity {entity:?} has no component '{component}'")]
    MissingComponent {
        entity: entity::EntityId,
        component: String,
    },

    /// The registry has never assigned this id.
    #[error("component id {id} is not registered")]
    UnknownComponent { id: component::ComponentId },

    /// The buffer was played back or cleared after the handle was created.
    #[error("buffered entity {entity:?} is from an earlier generation (buffer is at {current})")]
    StaleBufferedEntity {
        entity: command::BufferedEntity,
        current: u32,
    },

    #[error("buffered entity from {found} cannot be used with {expected}")]
    WrongCommandBuffer {
        expected: command::BufferId,
        found: command::BufferId,
    },

    #[error("world has been disposed")]
    WorldDisposed,

    /// Destroy handlers kept creating entities while the world was disposed.
    #[error("dispose left {remaining} entities alive after {passes} passes")]
    DisposeIncomplete { remaining: usize, passes: usize },

    /// A component was placed in two different predicate sets.
    #[error("component {component} is already in the {existing} set and cannot be added to {requested}")]
    QueryConflict {
        component: component::ComponentId,
        existing: query::QueryFilter,
        requested: query::QueryFilter,
    },

    #[error("no entity matches the query")]
    NoMatchingEntity,

    #[error("expected a single matching entity, found {count}")]
    MultipleMatchingEntities { count: usize },

    #[error("invalid world config: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId};
    pub use crate::chunk::Chunk;
    pub use crate::command::{BufferId, BufferedEntity, CommandBuffer, PlaybackReport, Resolver};
    pub use crate::component::{Component, ComponentId, ComponentInfo, ComponentRegistry};
    pub use crate::component_set::{ComponentSet, FrozenComponentSet};
    pub use crate::entity::{Entity, EntityId, WorldId};
    pub use crate::events::{ComponentEvent, ComponentEventKind, EntityEvent, EntityEventKind, EventBus};
    pub use crate::query::{ArchetypeMatch, QueryBuilder, QueryDescription, QueryFilter};
    pub use crate::world::{World, WorldConfig};
    pub use crate::EcsError;
}
