//! Deferred structural mutation.
//!
//! A [`CommandBuffer`] records entity creation, component sets and removals,
//! and destruction (individually or by query) without touching storage.
//! [`playback`](CommandBuffer::playback) then applies the whole batch in one
//! pass:
//!
//! 1. buffered entities are created, their components written, and
//!    component-added then entity-created notifications raised;
//! 2. query destroys clear every matching archetype outright;
//! 3. entity destroys run, skipping entities that are already dead;
//! 4. pending sets and removes are merged per entity into at most one
//!    archetype migration, followed by in-place writes.
//!
//! Operations on one entity are merged last-write-wins per component, so
//! setting a component twice yields a single notification, and modifying an
//! entity that is destroyed in the same batch only reports the destruction.
//!
//! Notifications receive a separate recursive buffer, which plays back once
//! the current batch has been fully applied.
//!
//! # Example
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, PartialEq)]
//! struct Position(i32, i32);
//! #[derive(Debug, PartialEq)]
//! struct Frozen;
//!
//! let mut world = World::new();
//! let mut buffer = CommandBuffer::new(&world);
//! let pending = buffer.create().set(Position(1, 1)).entity();
//! let resolver = buffer.playback(&mut world).unwrap();
//! let entity = resolver.resolve(pending).unwrap();
//!
//! buffer.set(entity, Position(2, 3)).unwrap().set(entity, Frozen).unwrap();
//! buffer.playback(&mut world).unwrap();
//!
//! assert_eq!(world.get::<Position>(entity).unwrap(), &Position(2, 3));
//! assert!(world.has::<Frozen>(entity));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archetype::ArchetypeId;
use crate::component::{Component, ComponentId};
use crate::component_set::ComponentSet;
use crate::entity::{Entity, EntityId, EntityLocation, WorldId};
use crate::events::{ComponentEventKind, EntityEventKind};
use crate::hash::ArchetypeHash;
use crate::pending::{PendingSets, PendingValues};
use crate::query::QueryDescription;
use crate::world::World;
use crate::EcsError;

/// Aggregation key of a buffered entity with no components yet.
const ROOT_KEY: i32 = 0;
/// Aggregation key of a buffered entity whose schema is not memoized.
const UNCACHED_KEY: i32 = -1;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`CommandBuffer`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Handle to an entity that will be created when its buffer plays back.
///
/// Only the [`Resolver`] returned by that playback can turn it into an
/// [`Entity`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferedEntity {
    index: u32,
    buffer: BufferId,
    version: u32,
}

impl BufferedEntity {
    pub fn buffer(self) -> BufferId {
        self.buffer
    }

    /// Buffer generation this handle was issued in.
    pub fn version(self) -> u32 {
        self.version
    }
}

/// Chained setter returned by [`CommandBuffer::create`].
pub struct BufferedEntityBuilder<'a> {
    buffer: &'a mut CommandBuffer,
    entity: BufferedEntity,
}

impl BufferedEntityBuilder<'_> {
    /// Stage `value`; a later value of the same type replaces it.
    pub fn set<T: Component>(self, value: T) -> Self {
        self.buffer.stage_buffered(self.entity.index as usize, value);
        self
    }

    pub fn entity(&self) -> BufferedEntity {
        self.entity
    }
}

// ---------------------------------------------------------------------------
// PlaybackReport
// ---------------------------------------------------------------------------

/// Counters describing one playback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackReport {
    /// Buffered entities instantiated.
    pub created: usize,
    /// Entities destroyed individually.
    pub destroyed: usize,
    /// Entities destroyed by query.
    pub destroyed_by_query: usize,
    /// Live entities that had sets or removes applied.
    pub modified: usize,
    /// Modified entities that moved to another archetype.
    pub migrated: usize,
    /// Archetypes created during this playback.
    pub archetypes_created: usize,
}

// ---------------------------------------------------------------------------
// Internal records
// ---------------------------------------------------------------------------

struct BufferedRecord {
    sets: PendingSets,
    key: i32,
}

#[derive(Default)]
struct Modification {
    sets: PendingSets,
    removes: ComponentSet,
}

impl Modification {
    fn clear(&mut self) {
        self.sets.clear();
        self.removes.clear();
    }
}

/// Memo of `(aggregation key, added component) -> next key`.
///
/// Buffered entities that receive the same sequence of new components end up
/// on the same key, so their destination archetype is resolved once per key.
struct AggregationEdges {
    next: HashMap<(i32, ComponentId), i32>,
    capacity: usize,
    exhausted: bool,
}

impl AggregationEdges {
    fn new(capacity: usize) -> Self {
        Self {
            next: HashMap::new(),
            capacity,
            exhausted: false,
        }
    }

    fn step(&mut self, key: i32, component: ComponentId) -> i32 {
        if key == UNCACHED_KEY {
            return UNCACHED_KEY;
        }
        if let Some(&next) = self.next.get(&(key, component)) {
            return next;
        }
        if self.next.len() >= self.capacity {
            if !self.exhausted {
                self.exhausted = true;
                debug!(
                    capacity = self.capacity,
                    "aggregation edges exhausted, falling back to per-entity archetype lookup"
                );
            }
            return UNCACHED_KEY;
        }
        let next = self.next.len() as i32 + 1;
        self.next.insert((key, component), next);
        next
    }

    /// Number of distinct keys, including the root.
    fn key_count(&self) -> usize {
        self.next.len() + 1
    }

    fn clear(&mut self) {
        self.next.clear();
        self.exhausted = false;
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// Records deferred mutations for one [`World`] and applies them in batches.
///
/// Every mutating method takes `&mut self`, and so does
/// [`playback`](Self::playback), so a buffer can never be mutated while it
/// is playing back. Handlers invoked during playback are given a different
/// buffer.
pub struct CommandBuffer {
    id: BufferId,
    world: WorldId,
    version: u32,
    values: PendingValues,
    buffered: Vec<BufferedRecord>,
    modifications: Vec<(EntityId, Modification)>,
    modification_slots: HashMap<EntityId, usize>,
    spare_modifications: Vec<Modification>,
    destroys: Vec<EntityId>,
    query_destroys: Vec<QueryDescription>,
    edges: AggregationEdges,
    has_operations: bool,
    scratch: ComponentSet,
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("id", &self.id)
            .field("world", &self.world)
            .field("version", &self.version)
            .field("buffered", &self.buffered.len())
            .field("modifications", &self.modifications.len())
            .field("destroys", &self.destroys.len())
            .field("query_destroys", &self.query_destroys.len())
            .finish()
    }
}

impl CommandBuffer {
    /// Create an empty buffer targeting `world`.
    pub fn new(world: &World) -> Self {
        Self {
            id: BufferId::next(),
            world: world.id(),
            version: 1,
            values: PendingValues::new(),
            buffered: Vec::new(),
            modifications: Vec::new(),
            modification_slots: HashMap::new(),
            spare_modifications: Vec::new(),
            destroys: Vec::new(),
            query_destroys: Vec::new(),
            edges: AggregationEdges::new(world.config().max_aggregation_edges),
            has_operations: false,
            scratch: ComponentSet::new(),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// The world this buffer targets.
    pub fn world(&self) -> WorldId {
        self.world
    }

    /// Current generation; advances on every playback and clear.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn has_buffered_operations(&self) -> bool {
        self.has_operations
    }

    // -- recording ----------------------------------------------------------

    /// Queue a new entity.
    pub fn create(&mut self) -> BufferedEntityBuilder<'_> {
        let index = u32::try_from(self.buffered.len()).expect("buffered entity count overflow");
        self.buffered.push(BufferedRecord {
            sets: PendingSets::default(),
            key: ROOT_KEY,
        });
        self.has_operations = true;
        let entity = BufferedEntity {
            index,
            buffer: self.id,
            version: self.version,
        };
        BufferedEntityBuilder { buffer: self, entity }
    }

    /// Stage `value` on a queued entity.
    pub fn set_buffered<T: Component>(&mut self, entity: BufferedEntity, value: T) -> Result<&mut Self, EcsError> {
        if entity.buffer != self.id {
            return Err(EcsError::WrongCommandBuffer {
                expected: self.id,
                found: entity.buffer,
            });
        }
        if entity.version != self.version {
            return Err(EcsError::StaleBufferedEntity {
                entity,
                current: self.version,
            });
        }
        self.stage_buffered(entity.index as usize, value);
        Ok(self)
    }

    fn stage_buffered<T: Component>(&mut self, index: usize, value: T) {
        let component = ComponentId::of::<T>();
        let record = &mut self.buffered[index];
        match record.sets.get(component) {
            Some(staged) => self.values.overwrite(staged, value),
            None => {
                let staged = self.values.push(value);
                record.sets.insert(component, staged);
                record.key = self.edges.step(record.key, component);
            }
        }
    }

    /// Set `T` on a live entity, adding it if absent.
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> Result<&mut Self, EcsError> {
        self.check_world(entity.world())?;
        let component = ComponentId::of::<T>();
        let slot = self.modification_slot(entity.id());
        let modification = &mut self.modifications[slot].1;
        modification.removes.remove(component);
        match modification.sets.get(component) {
            Some(staged) => self.values.overwrite(staged, value),
            None => {
                let staged = self.values.push(value);
                modification.sets.insert(component, staged);
            }
        }
        Ok(self)
    }

    /// Remove `T` from a live entity. Cancels a pending set of `T`.
    pub fn remove<T: Component>(&mut self, entity: Entity) -> Result<&mut Self, EcsError> {
        self.remove_id(entity, ComponentId::of::<T>())
    }

    pub fn remove_id(&mut self, entity: Entity, component: ComponentId) -> Result<&mut Self, EcsError> {
        self.check_world(entity.world())?;
        let slot = self.modification_slot(entity.id());
        let modification = &mut self.modifications[slot].1;
        modification.sets.remove(component);
        modification.removes.insert(component);
        Ok(self)
    }

    /// Destroy `entity`. Destroying an already-dead entity is a no-op.
    pub fn destroy(&mut self, entity: Entity) -> Result<&mut Self, EcsError> {
        self.check_world(entity.world())?;
        self.destroys.push(entity.id());
        self.has_operations = true;
        Ok(self)
    }

    /// Destroy every entity in `entities`. Nothing is queued if any of them
    /// belongs to another world.
    pub fn destroy_many(&mut self, entities: &[Entity]) -> Result<&mut Self, EcsError> {
        for entity in entities {
            self.check_world(entity.world())?;
        }
        self.destroys.extend(entities.iter().map(|e| e.id()));
        self.has_operations |= !entities.is_empty();
        Ok(self)
    }

    /// Destroy every entity matching `query` at playback time.
    pub fn destroy_matching(&mut self, query: &QueryDescription) -> Result<&mut Self, EcsError> {
        self.check_world(query.world())?;
        self.query_destroys.push(query.clone());
        self.has_operations = true;
        Ok(self)
    }

    /// Drop all recorded work and advance the generation, invalidating every
    /// outstanding [`BufferedEntity`].
    pub fn clear(&mut self) {
        self.values.clear();
        self.buffered.clear();
        for (_, mut modification) in self.modifications.drain(..) {
            modification.clear();
            self.spare_modifications.push(modification);
        }
        self.modification_slots.clear();
        self.destroys.clear();
        self.query_destroys.clear();
        self.edges.clear();
        self.has_operations = false;
        self.version = self.version.wrapping_add(1);
    }

    fn check_world(&self, world: WorldId) -> Result<(), EcsError> {
        if world != self.world {
            return Err(EcsError::WrongWorld {
                expected: self.world,
                found: world,
            });
        }
        Ok(())
    }

    fn modification_slot(&mut self, id: EntityId) -> usize {
        self.has_operations = true;
        if let Some(&slot) = self.modification_slots.get(&id) {
            return slot;
        }
        let slot = self.modifications.len();
        let record = self.spare_modifications.pop().unwrap_or_default();
        self.modifications.push((id, record));
        self.modification_slots.insert(id, slot);
        slot
    }

    // -- playback -----------------------------------------------------------

    /// Apply every recorded operation to `world`, then play back whatever the
    /// notification handlers queued.
    ///
    /// The buffer is cleared and its generation advanced. The returned
    /// [`Resolver`] maps this generation's buffered entities to real ones.
    pub fn playback(&mut self, world: &mut World) -> Result<Resolver, EcsError> {
        self.check_world(world.id())?;
        if world.is_disposed() {
            return Err(EcsError::WorldDisposed);
        }

        let version = self.version;
        if !self.has_operations {
            self.version = self.version.wrapping_add(1);
            return Ok(Resolver {
                buffer: self.id,
                version,
                world: world.id(),
                entities: Vec::new(),
                report: PlaybackReport::default(),
            });
        }

        let archetypes_before = world.archetype_count();
        let mut recursive = world.acquire_command_buffer();
        let mut report = PlaybackReport::default();

        let entities = self.create_buffered(world, &mut recursive, &mut report)?;
        self.destroy_queried(world, &mut recursive, &mut report);
        self.destroy_listed(world, &mut recursive, &mut report);
        self.apply_modifications(world, &mut recursive, &mut report)?;

        report.archetypes_created = world.archetype_count() - archetypes_before;
        debug!(
            buffer = self.id.0,
            version,
            created = report.created,
            destroyed = report.destroyed,
            destroyed_by_query = report.destroyed_by_query,
            modified = report.modified,
            migrated = report.migrated,
            archetypes_created = report.archetypes_created,
            "command buffer played back"
        );
        self.clear();

        let chained = recursive.playback(world);
        world.release_command_buffer(recursive);
        chained?;

        Ok(Resolver {
            buffer: self.id,
            version,
            world: world.id(),
            entities,
            report,
        })
    }

    fn create_buffered(
        &mut self,
        world: &mut World,
        recursive: &mut CommandBuffer,
        report: &mut PlaybackReport,
    ) -> Result<Vec<EntityId>, EcsError> {
        let mut entities = Vec::with_capacity(self.buffered.len());
        if self.buffered.is_empty() {
            return Ok(entities);
        }

        let mut by_key: Vec<Option<ArchetypeId>> = vec![None; self.edges.key_count()];
        for record in &self.buffered {
            let cached = usize::try_from(record.key)
                .ok()
                .and_then(|key| by_key[key]);
            let archetype = match cached {
                Some(archetype) => archetype,
                None => {
                    self.scratch.clear();
                    for component in record.sets.components() {
                        self.scratch.insert(component);
                    }
                    let archetype =
                        world.get_or_create_archetype_hashed(&self.scratch, ArchetypeHash::of(&self.scratch))?;
                    if let Ok(key) = usize::try_from(record.key) {
                        by_key[key] = Some(archetype);
                    }
                    archetype
                }
            };

            let values = &mut self.values;
            let sets = &record.sets;
            let (id, location) = world.spawn_into(archetype, |component, column| match sets.get(component) {
                Some(staged) => values.push_into(staged, column),
                None => panic!("archetype column {component} has no staged value"),
            });
            entities.push(id);
            report.created += 1;

            for component in record.sets.components() {
                world.raise_component_event(ComponentEventKind::Added, component, id, location, recursive);
            }
            world.raise_entity_event(EntityEventKind::Created, id, recursive);
        }
        Ok(entities)
    }

    fn destroy_queried(&mut self, world: &mut World, recursive: &mut CommandBuffer, report: &mut PlaybackReport) {
        for query in &self.query_destroys {
            let matches = query.matches(world);
            for matched in matches.iter() {
                if world.archetype(matched.archetype).is_empty() {
                    continue;
                }
                notify_archetype_destroyed(world, matched.archetype, recursive);
                report.destroyed_by_query += world.despawn_archetype(matched.archetype);
            }
        }
    }

    fn destroy_listed(&mut self, world: &mut World, recursive: &mut CommandBuffer, report: &mut PlaybackReport) {
        for &id in &self.destroys {
            let Some(location) = world.location(id) else {
                continue;
            };
            let components = world.archetype(location.archetype).components().clone();
            for &component in components.iter() {
                world.raise_component_event(ComponentEventKind::Removed, component, id, location, recursive);
            }
            world.raise_entity_event(EntityEventKind::Destroyed, id, recursive);
            world.despawn(id, location);
            report.destroyed += 1;
        }
    }

    fn apply_modifications(
        &mut self,
        world: &mut World,
        recursive: &mut CommandBuffer,
        report: &mut PlaybackReport,
    ) -> Result<(), EcsError> {
        for (id, modification) in &self.modifications {
            let id = *id;
            let Some(mut location) = world.location(id) else {
                continue;
            };
            let source = world.archetype(location.archetype);
            let before = source.components().clone();
            let mut hash = source.hash();

            self.scratch.clear();
            self.scratch.union_with(&before);
            let mut structural = false;
            for component in modification.sets.components() {
                if self.scratch.insert(component) {
                    hash = hash.toggle(component);
                    structural = true;
                }
            }
            for &component in modification.removes.iter() {
                if self.scratch.remove(component) {
                    hash = hash.toggle(component);
                    structural = true;
                }
            }

            if structural {
                for &component in before.iter() {
                    if !self.scratch.contains(component) {
                        world.raise_component_event(ComponentEventKind::Removed, component, id, location, recursive);
                    }
                }
                let destination = world.get_or_create_archetype_hashed(&self.scratch, hash)?;
                let values = &mut self.values;
                let sets = &modification.sets;
                location = world.migrate_entity(id, location, destination, |component, column| {
                    match sets.get(component) {
                        Some(staged) => values.push_into(staged, column),
                        None => panic!("added column {component} has no staged value"),
                    }
                });
                report.migrated += 1;
            }

            for (component, staged) in modification.sets.iter() {
                if before.contains(component) {
                    if let Some(column) = world.column_at(location, component) {
                        self.values.write_into(staged, column, location.row);
                    }
                    world.raise_component_event(ComponentEventKind::Modified, component, id, location, recursive);
                } else {
                    world.raise_component_event(ComponentEventKind::Added, component, id, location, recursive);
                }
            }
            report.modified += 1;
        }
        Ok(())
    }
}

/// Raise removed/destroyed notifications for every row of `archetype`.
fn notify_archetype_destroyed(world: &mut World, archetype: ArchetypeId, recursive: &mut CommandBuffer) {
    let components = world.archetype(archetype).components().clone();
    let watched = components.iter().any(|&c| world.has_component_handlers(c));
    if !watched && !world.events().has_entity_handlers(EntityEventKind::Destroyed) {
        return;
    }

    let chunks = world.archetype(archetype).live_chunks().to_vec();
    for chunk in chunks {
        let rows = world.archetype(archetype).chunk(chunk).entities().to_vec();
        for (row, id) in rows.into_iter().enumerate() {
            let location = EntityLocation { archetype, chunk, row };
            for &component in components.iter() {
                world.raise_component_event(ComponentEventKind::Removed, component, id, location, recursive);
            }
            world.raise_entity_event(EntityEventKind::Destroyed, id, recursive);
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Maps the [`BufferedEntity`] handles of one playback to real entities.
#[derive(Debug)]
pub struct Resolver {
    buffer: BufferId,
    version: u32,
    world: WorldId,
    entities: Vec<EntityId>,
    report: PlaybackReport,
}

impl Resolver {
    /// The entity created for `handle`.
    ///
    /// Fails if `handle` came from another buffer or from another generation
    /// of this buffer.
    pub fn resolve(&self, handle: BufferedEntity) -> Result<Entity, EcsError> {
        if handle.buffer != self.buffer {
            return Err(EcsError::WrongCommandBuffer {
                expected: self.buffer,
                found: handle.buffer,
            });
        }
        if handle.version != self.version {
            return Err(EcsError::StaleBufferedEntity {
                entity: handle,
                current: self.version,
            });
        }
        self.entities
            .get(handle.index as usize)
            .map(|&id| Entity::new(id, self.world))
            .ok_or(EcsError::StaleBufferedEntity {
                entity: handle,
                current: self.version,
            })
    }

    /// Number of entities created by the playback.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// The `index`-th created entity, in creation order.
    pub fn get(&self, index: usize) -> Option<Entity> {
        self.entities.get(index).map(|&id| Entity::new(id, self.world))
    }

    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities.iter().map(move |&id| Entity::new(id, self.world))
    }

    pub fn report(&self) -> &PlaybackReport {
        &self.report
    }

    /// Buffer generation this resolver answers for.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Release the resolver. Handles can no longer be resolved through it.
    pub fn dispose(self) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
