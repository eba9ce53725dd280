//! Archetype storage.
//!
//! An [`Archetype`] owns every entity whose component schema is exactly its
//! [`FrozenComponentSet`]. Rows live in fixed-capacity [`Chunk`]s that all
//! share one column layout. The archetype keeps:
//!
//! - the live chunks, in allocation order;
//! - a short "chunks with space" list so inserts never scan full chunks;
//! - a bounded stack of emptied "hot spare" chunks that are reused before any
//!   new chunk is allocated.
//!
//! Chunks are addressed by a stable [`ChunkIndex`] into a slab, so entity
//! locations stay valid while other chunks are emptied or recycled.
//!
//! Archetypes are created lazily by the [`World`](crate::world::World) and are
//! never destroyed.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::bloom::ComponentBloomFilter;
use crate::chunk::{Chunk, ChunkLayout, ErasedColumn};
use crate::component::{ComponentId, ComponentInfo};
use crate::component_set::FrozenComponentSet;
use crate::entity::EntityId;
use crate::events::ComponentDispatch;
use crate::hash::ArchetypeHash;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifies an archetype within its world. Index into `World::archetypes`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchetypeId(u32);

impl ArchetypeId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({})", self.0)
    }
}

/// Stable slot of a chunk within its archetype.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct ChunkIndex(u32);

impl ChunkIndex {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    fn slot(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// All chunks holding entities of one exact component schema.
pub struct Archetype {
    id: ArchetypeId,
    hash: ArchetypeHash,
    bloom: ComponentBloomFilter,
    layout: Arc<ChunkLayout>,
    chunk_capacity: usize,
    hot_spare_limit: usize,

    /// Chunk slab; `None` marks a free slot.
    slab: Vec<Option<Chunk>>,
    free_slots: Vec<ChunkIndex>,
    /// Slots holding at least one entity, in allocation order.
    live: Vec<ChunkIndex>,
    /// Live chunks that are not full.
    with_space: Vec<ChunkIndex>,
    hot_spares: Vec<Chunk>,

    entity_count: usize,
}

impl Archetype {
    pub(crate) fn new(
        id: ArchetypeId,
        components: FrozenComponentSet,
        hash: ArchetypeHash,
        infos: Vec<Arc<ComponentInfo>>,
        chunk_capacity: usize,
        hot_spare_limit: usize,
    ) -> Self {
        debug_assert_eq!(components.len(), infos.len());
        let bloom = components.bloom();
        Self {
            id,
            hash,
            bloom,
            layout: Arc::new(ChunkLayout::new(components, infos)),
            chunk_capacity,
            hot_spare_limit,
            slab: Vec::new(),
            free_slots: Vec::new(),
            live: Vec::new(),
            with_space: Vec::new(),
            hot_spares: Vec::new(),
            entity_count: 0,
        }
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// The exact schema of this archetype.
    pub fn components(&self) -> &FrozenComponentSet {
        &self.layout.components
    }

    pub fn hash(&self) -> ArchetypeHash {
        self.hash
    }

    pub fn bloom(&self) -> &ComponentBloomFilter {
        &self.bloom
    }

    pub fn has_component(&self, id: ComponentId) -> bool {
        self.layout.column_index(id).is_some()
    }

    /// Column position of `id` in every chunk of this archetype.
    pub fn column_index(&self, id: ComponentId) -> Option<usize> {
        self.layout.column_index(id)
    }

    /// Descriptor of component `id`, if it is part of this archetype.
    pub fn descriptor(&self, id: ComponentId) -> Option<&ComponentInfo> {
        self.layout
            .column_index(id)
            .map(|column| self.layout.infos[column].as_ref())
    }

    pub fn entity_count(&self) -> usize {
        self.entity_count
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    /// Live chunks in allocation order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.live.iter().map(move |&index| self.chunk(index))
    }

    pub fn chunk_count(&self) -> usize {
        self.live.len()
    }

    /// Emptied chunks waiting to be reused.
    pub fn hot_spare_count(&self) -> usize {
        self.hot_spares.len()
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    pub(crate) fn chunk(&self, index: ChunkIndex) -> &Chunk {
        match self.slab.get(index.slot()) {
            Some(Some(chunk)) => chunk,
            _ => panic!("archetype {:?} has no chunk at {:?}", self.id, index),
        }
    }

    pub(crate) fn chunk_mut(&mut self, index: ChunkIndex) -> &mut Chunk {
        let id = self.id;
        match self.slab.get_mut(index.slot()) {
            Some(Some(chunk)) => chunk,
            _ => panic!("archetype {id:?} has no chunk at {index:?}"),
        }
    }

    /// Stable indices of the live chunks.
    pub(crate) fn live_chunks(&self) -> &[ChunkIndex] {
        &self.live
    }

    pub(crate) fn for_each_chunk_mut(&mut self, mut f: impl FnMut(&mut Chunk)) {
        for &index in &self.live {
            if let Some(chunk) = self.slab[index.slot()].as_mut() {
                f(chunk);
            }
        }
    }

    /// The dispatcher and column for raising an event on `id` at `chunk`.
    pub(crate) fn event_target(
        &mut self,
        chunk: ChunkIndex,
        id: ComponentId,
    ) -> Option<(ComponentDispatch, &mut dyn ErasedColumn)> {
        let column = self.layout.column_index(id)?;
        let dispatch = self.layout.infos[column].dispatch;
        let column = self.chunk_mut(chunk).erased_column_mut(id)?;
        Some((dispatch, column))
    }

    // -- structural operations ---------------------------------------------

    /// Find a chunk with free capacity, reusing a hot spare or allocating.
    fn chunk_with_space(&mut self) -> ChunkIndex {
        let slab = &self.slab;
        self.with_space
            .retain(|index| matches!(&slab[index.slot()], Some(chunk) if !chunk.is_full()));
        if let Some(&index) = self.with_space.last() {
            return index;
        }

        let chunk = match self.hot_spares.pop() {
            Some(chunk) => {
                trace!(archetype = self.id.0, "reusing hot spare chunk");
                chunk
            }
            None => Chunk::new(Arc::clone(&self.layout), self.chunk_capacity),
        };
        let index = match self.free_slots.pop() {
            Some(index) => {
                self.slab[index.slot()] = Some(chunk);
                index
            }
            None => {
                let raw = u32::try_from(self.slab.len()).expect("chunk slab overflow");
                self.slab.push(Some(chunk));
                ChunkIndex(raw)
            }
        };
        self.live.push(index);
        self.with_space.push(index);
        index
    }

    /// Append a row for `entity`. See [`Chunk::push`] for the `fill` contract.
    pub(crate) fn push_entity(
        &mut self,
        entity: EntityId,
        fill: impl FnMut(ComponentId, &mut dyn ErasedColumn),
    ) -> (ChunkIndex, usize) {
        let index = self.chunk_with_space();
        let row = self.chunk_mut(index).push(entity, fill);
        self.entity_count += 1;
        (index, row)
    }

    /// Swap-remove the row at `(chunk, row)`.
    ///
    /// Returns the entity that now occupies `row`, whose slot must be updated.
    pub(crate) fn remove_entity(&mut self, chunk: ChunkIndex, row: usize) -> Option<EntityId> {
        let moved = self.chunk_mut(chunk).swap_remove(row);
        self.after_row_removed(chunk);
        moved
    }

    /// Move the row at `(chunk, row)` into `dst`.
    ///
    /// Returns the destination `(chunk, row)` and the entity swapped into the
    /// vacated source row, if any.
    pub(crate) fn migrate_entity(
        &mut self,
        chunk: ChunkIndex,
        row: usize,
        dst: &mut Archetype,
        fill: impl FnMut(ComponentId, &mut dyn ErasedColumn),
    ) -> (ChunkIndex, usize, Option<EntityId>) {
        let dst_index = dst.chunk_with_space();
        let dst_chunk = dst.chunk_mut(dst_index);
        let (dst_row, moved) = match self.slab.get_mut(chunk.slot()) {
            Some(Some(src_chunk)) => src_chunk.move_row_to(row, dst_chunk, fill),
            _ => panic!("archetype {:?} has no chunk at {:?}", self.id, chunk),
        };
        dst.entity_count += 1;
        self.after_row_removed(chunk);
        (dst_index, dst_row, moved)
    }

    fn after_row_removed(&mut self, index: ChunkIndex) {
        self.entity_count -= 1;
        let len = self.chunk(index).len();
        if len == 0 {
            self.live.retain(|&i| i != index);
            self.with_space.retain(|&i| i != index);
            if let Some(chunk) = self.slab[index.slot()].take() {
                self.recycle(chunk);
            }
            self.free_slots.push(index);
        } else if len + 1 == self.chunk_capacity && !self.with_space.contains(&index) {
            self.with_space.push(index);
        }
    }

    fn recycle(&mut self, mut chunk: Chunk) {
        if self.hot_spares.len() < self.hot_spare_limit {
            chunk.clear();
            trace!(archetype = self.id.0, spares = self.hot_spares.len() + 1, "chunk parked as hot spare");
            self.hot_spares.push(chunk);
        }
    }

    /// Drop every row of every chunk. Slots of the removed entities are the
    /// caller's responsibility.
    pub(crate) fn clear(&mut self) {
        let live = std::mem::take(&mut self.live);
        for index in live {
            if let Some(chunk) = self.slab[index.slot()].take() {
                self.recycle(chunk);
            }
        }
        self.slab.clear();
        self.free_slots.clear();
        self.with_space.clear();
        self.entity_count = 0;
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("components", self.components())
            .field("hash", &self.hash)
            .field("entity_count", &self.entity_count)
            .field("chunks", &self.live.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
