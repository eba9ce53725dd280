//! The [`World`]: archetype index, entity slot table and event bus.
//!
//! A world owns every archetype it has ever created (the list is append-only,
//! which query caching relies on), an `ArchetypeHash -> candidates` multimap
//! used to find-or-create archetypes, and the segmented entity slot table.
//!
//! All structural mutation goes through a
//! [`CommandBuffer`](crate::command::CommandBuffer); the world itself only
//! exposes reads plus the crate-internal primitives that playback drives.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::archetype::{Archetype, ArchetypeId};
use crate::chunk::ErasedColumn;
use crate::command::CommandBuffer;
use crate::component::{Component, ComponentId, ComponentRegistry};
use crate::component_set::{ComponentSet, FrozenComponentSet};
use crate::entity::{Entity, EntityId, EntityLocation, EntitySlots, WorldId};
use crate::events::{ComponentEventKind, EntityEventKind, EventBus};
use crate::hash::ArchetypeHash;
use crate::query::QueryBuilder;
use crate::EcsError;

// ---------------------------------------------------------------------------
// WorldConfig
// ---------------------------------------------------------------------------

/// Storage tuning knobs for a [`World`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Rows per chunk. Default: 1024.
    pub chunk_capacity: usize,
    /// Emptied chunks each archetype keeps for reuse. Default: 4.
    pub chunk_hot_spares: usize,
    /// Entity slots added each time the slot table grows. Default: 1024.
    pub slot_segment_capacity: usize,
    /// Aggregation edges a command buffer memoizes before falling back to
    /// uncached archetype lookup. Default: 1024.
    pub max_aggregation_edges: usize,
    /// Idle command buffers the world keeps for reuse. Default: 8.
    pub command_buffer_pool_size: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: 1024,
            chunk_hot_spares: 4,
            slot_segment_capacity: 1024,
            max_aggregation_edges: 1024,
            command_buffer_pool_size: 8,
        }
    }
}

impl WorldConfig {
    pub fn validate(&self) -> Result<(), EcsError> {
        if self.chunk_capacity == 0 {
            return Err(EcsError::InvalidConfig {
                field: "chunk_capacity",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.slot_segment_capacity == 0 {
            return Err(EcsError::InvalidConfig {
                field: "slot_segment_capacity",
                reason: "must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Destroy passes [`World::dispose`] runs before giving up on handlers that
/// keep creating entities.
pub const MAX_DISPOSE_PASSES: usize = 16;

/// Container for all archetypes, entities and lifecycle handlers.
pub struct World {
    id: WorldId,
    config: WorldConfig,
    archetypes: Vec<Archetype>,
    archetypes_by_hash: HashMap<ArchetypeHash, Vec<ArchetypeId>>,
    slots: EntitySlots,
    events: EventBus,
    buffer_pool: Vec<CommandBuffer>,
    disposed: bool,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("id", &self.id)
            .field("entity_count", &self.slots.alive())
            .field("archetype_count", &self.archetypes.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl World {
    /// Create an empty world with default configuration.
    pub fn new() -> Self {
        Self::build(WorldConfig::default())
    }

    /// Create an empty world with `config`, after validating it.
    pub fn with_config(config: WorldConfig) -> Result<Self, EcsError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: WorldConfig) -> Self {
        Self {
            id: WorldId::next(),
            slots: EntitySlots::new(config.slot_segment_capacity),
            config,
            archetypes: Vec::new(),
            archetypes_by_hash: HashMap::new(),
            events: EventBus::new(),
            buffer_pool: Vec::new(),
            disposed: false,
        }
    }

    pub fn id(&self) -> WorldId {
        self.id
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    // -- archetypes ---------------------------------------------------------

    /// Every archetype, in creation order.
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    /// The archetype with `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this world.
    pub fn archetype(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.index()]
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Total live entities.
    pub fn entity_count(&self) -> usize {
        self.slots.alive()
    }

    /// The archetype for exactly `components`, creating it if needed.
    pub fn get_or_create_archetype(&mut self, components: &[ComponentId]) -> Result<ArchetypeId, EcsError> {
        let set = ComponentSet::from_ids(components.iter().copied());
        self.get_or_create_archetype_hashed(&set, ArchetypeHash::of(&set))
    }

    /// Like [`get_or_create_archetype`](Self::get_or_create_archetype) with a
    /// precomputed hash. `components` must be sorted and duplicate-free.
    pub(crate) fn get_or_create_archetype_hashed(
        &mut self,
        components: &[ComponentId],
        hash: ArchetypeHash,
    ) -> Result<ArchetypeId, EcsError> {
        debug_assert_eq!(hash, ArchetypeHash::of(components));
        if let Some(candidates) = self.archetypes_by_hash.get(&hash) {
            for &candidate in candidates {
                if self.archetypes[candidate.index()].components().set_equals(components) {
                    return Ok(candidate);
                }
            }
            debug!(?hash, candidates = candidates.len(), "archetype hash collision");
        }

        let registry = ComponentRegistry::global();
        let infos = components
            .iter()
            .map(|&id| registry.info(id))
            .collect::<Result<Vec<_>, _>>()?;
        let raw = u32::try_from(self.archetypes.len()).expect("archetype count overflow");
        let id = ArchetypeId::from_raw(raw);
        let set: FrozenComponentSet = ComponentSet::from_ids(components.iter().copied()).into();
        self.archetypes.push(Archetype::new(
            id,
            set,
            hash,
            infos,
            self.config.chunk_capacity,
            self.config.chunk_hot_spares,
        ));
        self.archetypes_by_hash.entry(hash).or_default().push(id);
        debug!(archetype = raw, components = components.len(), ?hash, "created archetype");
        Ok(id)
    }

    // -- entity reads -------------------------------------------------------

    /// Stored version of slot `index`; 0 for indices never issued.
    pub fn version(&self, index: i32) -> u32 {
        self.slots.version(index)
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        entity.world() == self.id && self.slots.location(entity.id()).is_some()
    }

    pub(crate) fn location(&self, id: EntityId) -> Option<EntityLocation> {
        self.slots.location(id)
    }

    fn check_world(&self, entity: Entity) -> Result<(), EcsError> {
        if entity.world() != self.id {
            return Err(EcsError::WrongWorld {
                expected: self.id,
                found: entity.world(),
            });
        }
        Ok(())
    }

    fn locate(&self, entity: Entity) -> Result<EntityLocation, EcsError> {
        self.check_world(entity)?;
        self.slots
            .location(entity.id())
            .ok_or(EcsError::StaleEntity { entity: entity.id() })
    }

    fn missing<T: Component>(entity: Entity) -> EcsError {
        EcsError::MissingComponent {
            entity: entity.id(),
            component: std::any::type_name::<T>().to_owned(),
        }
    }

    /// Borrow `entity`'s `T`.
    pub fn get<T: Component>(&self, entity: Entity) -> Result<&T, EcsError> {
        let location = self.locate(entity)?;
        self.archetypes[location.archetype.index()]
            .chunk(location.chunk)
            .column_by_id::<T>(ComponentId::of::<T>())
            .map(|column| &column[location.row])
            .ok_or_else(|| Self::missing::<T>(entity))
    }

    /// Mutably borrow `entity`'s `T`. Does not raise a modified event.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Result<&mut T, EcsError> {
        let location = self.locate(entity)?;
        self.archetypes[location.archetype.index()]
            .chunk_mut(location.chunk)
            .column_by_id_mut::<T>(ComponentId::of::<T>())
            .map(|column| &mut column[location.row])
            .ok_or_else(|| Self::missing::<T>(entity))
    }

    /// `false` for dead or foreign entities.
    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.has_id(entity, ComponentId::of::<T>())
    }

    pub fn has_id(&self, entity: Entity, component: ComponentId) -> bool {
        self.locate(entity)
            .map(|location| self.archetypes[location.archetype.index()].has_component(component))
            .unwrap_or(false)
    }

    /// `entity`'s current schema.
    pub fn component_ids(&self, entity: Entity) -> Result<FrozenComponentSet, EcsError> {
        let location = self.locate(entity)?;
        Ok(self.archetypes[location.archetype.index()].components().clone())
    }

    /// The archetype currently holding `entity`.
    pub fn archetype_of(&self, entity: Entity) -> Result<ArchetypeId, EcsError> {
        Ok(self.locate(entity)?.archetype)
    }

    // -- storage primitives used by playback --------------------------------

    /// Allocate an entity in `archetype`; `fill` supplies every column value.
    pub(crate) fn spawn_into(
        &mut self,
        archetype: ArchetypeId,
        fill: impl FnMut(ComponentId, &mut dyn ErasedColumn),
    ) -> (EntityId, EntityLocation) {
        // The row records the id, so reserve the slot first and fix the
        // location up once the row exists.
        let provisional = EntityLocation {
            archetype,
            chunk: crate::archetype::ChunkIndex::from_raw(0),
            row: 0,
        };
        let id = self.slots.allocate(provisional);
        let (chunk, row) = self.archetypes[archetype.index()].push_entity(id, fill);
        let location = EntityLocation { archetype, chunk, row };
        self.slots.set_location(id, location);
        (id, location)
    }

    /// Move a live entity to `dst`. `fill` supplies values for components the
    /// source archetype lacks. Returns the new location.
    pub(crate) fn migrate_entity(
        &mut self,
        id: EntityId,
        location: EntityLocation,
        dst: ArchetypeId,
        fill: impl FnMut(ComponentId, &mut dyn ErasedColumn),
    ) -> EntityLocation {
        if location.archetype == dst {
            return location;
        }
        let (src_archetype, dst_archetype) =
            pair_mut(&mut self.archetypes, location.archetype.index(), dst.index());
        let (chunk, row, moved) =
            src_archetype.migrate_entity(location.chunk, location.row, dst_archetype, fill);
        if let Some(moved) = moved {
            self.slots.set_row(moved, location.row);
        }
        let new_location = EntityLocation { archetype: dst, chunk, row };
        self.slots.set_location(id, new_location);
        trace!(entity = %id, from = location.archetype.index(), to = dst.index(), "migrated entity");
        new_location
    }

    /// Remove a live entity's row and vacate its slot.
    pub(crate) fn despawn(&mut self, id: EntityId, location: EntityLocation) {
        let moved = self.archetypes[location.archetype.index()].remove_entity(location.chunk, location.row);
        if let Some(moved) = moved {
            self.slots.set_row(moved, location.row);
        }
        self.slots.release(id);
    }

    /// Vacate the slots of every entity in `archetype` and clear it.
    pub(crate) fn despawn_archetype(&mut self, archetype: ArchetypeId) -> usize {
        let World { archetypes, slots, .. } = self;
        let target = &mut archetypes[archetype.index()];
        let count = target.entity_count();
        for chunk in target.chunks() {
            for &id in chunk.entities() {
                slots.release(id);
            }
        }
        target.clear();
        count
    }

    /// Mutable access to an archetype.
    pub(crate) fn archetype_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id.index()]
    }

    /// Column of `component` in the chunk holding `location`.
    pub(crate) fn column_at(&mut self, location: EntityLocation, component: ComponentId) -> Option<&mut dyn ErasedColumn> {
        self.archetypes[location.archetype.index()]
            .chunk_mut(location.chunk)
            .erased_column_mut(component)
    }

    pub(crate) fn raise_component_event(
        &mut self,
        kind: ComponentEventKind,
        component: ComponentId,
        id: EntityId,
        location: EntityLocation,
        commands: &mut CommandBuffer,
    ) {
        if !self.events.has_component_handlers(component) {
            return;
        }
        let entity = Entity::new(id, self.id);
        let World { archetypes, events, .. } = self;
        if let Some((dispatch, column)) = archetypes[location.archetype.index()].event_target(location.chunk, component) {
            dispatch(events, kind, entity, column, location.row, commands);
        }
    }

    pub(crate) fn raise_entity_event(&mut self, kind: EntityEventKind, id: EntityId, commands: &mut CommandBuffer) {
        if !self.events.has_entity_handlers(kind) {
            return;
        }
        let entity = Entity::new(id, self.id);
        self.events.raise_entity(kind, entity, commands);
    }

    pub(crate) fn has_component_handlers(&self, component: ComponentId) -> bool {
        self.events.has_component_handlers(component)
    }

    // -- command buffer pool --------------------------------------------------

    /// A cleared command buffer bound to this world, reused when possible.
    pub fn acquire_command_buffer(&mut self) -> CommandBuffer {
        match self.buffer_pool.pop() {
            Some(buffer) => buffer,
            None => CommandBuffer::new(self),
        }
    }

    /// Return a buffer for reuse. Pending work in it is discarded.
    pub fn release_command_buffer(&mut self, mut buffer: CommandBuffer) {
        if buffer.world() != self.id || self.buffer_pool.len() >= self.config.command_buffer_pool_size {
            return;
        }
        buffer.clear();
        self.buffer_pool.push(buffer);
    }

    // -- teardown ------------------------------------------------------------

    /// Destroy every entity through a command buffer, raising the usual
    /// notifications, then refuse further playbacks. Idempotent.
    ///
    /// Entities created by destroy handlers are destroyed in further passes.
    /// If the world is still populated after [`MAX_DISPOSE_PASSES`] passes it
    /// is left usable and `DisposeIncomplete` is returned.
    pub fn dispose(&mut self) -> Result<(), EcsError> {
        if self.disposed {
            return Ok(());
        }
        let everything = QueryBuilder::new().build(self)?;
        let mut destroyed = 0;
        let mut passes = 0;
        while self.entity_count() > 0 {
            if passes == MAX_DISPOSE_PASSES {
                return Err(EcsError::DisposeIncomplete {
                    remaining: self.entity_count(),
                    passes,
                });
            }
            let mut buffer = self.acquire_command_buffer();
            buffer.destroy_matching(&everything)?;
            let resolver = buffer.playback(self)?;
            self.release_command_buffer(buffer);
            destroyed += resolver.report().destroyed_by_query;
            passes += 1;
        }
        debug!(world = %self.id, destroyed, passes, "world disposed");
        self.disposed = true;
        self.buffer_pool.clear();
        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Two distinct mutable elements of one slice.
fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b, "pair_mut needs distinct indices");
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
