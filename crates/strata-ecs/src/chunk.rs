//! Fixed-capacity columnar storage blocks.
//!
//! A [`Chunk`] stores up to `capacity` rows of one archetype: an entity-id
//! column plus one column per component, all indexed by the same row number.
//! Rows `[0, len)` are always live and packed. Removing a row moves the last
//! row into the hole, so no column ever has gaps.
//!
//! Columns are type-erased behind [`ErasedColumn`]. The concrete storage is a
//! plain `Vec<T>` (see [`TypedColumn`]) created by the factory registered for
//! the component type, so no reflection or raw allocation is involved.

use std::any::Any;
use std::sync::Arc;

use crate::component::{Component, ComponentId, ComponentInfo};
use crate::component_set::FrozenComponentSet;
use crate::entity::EntityId;

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

/// Type-erased operations on one component column.
pub(crate) trait ErasedColumn: Any + Send + Sync {
    fn len(&self) -> usize;

    /// Remove `row`, dropping its value. The last row fills the hole.
    fn swap_remove(&mut self, row: usize);

    /// Move `row`'s value onto the end of `dst`. The last row fills the hole.
    fn swap_remove_into(&mut self, row: usize, dst: &mut dyn ErasedColumn);

    /// Drop every value, keeping the allocation.
    fn clear(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Concrete column storage for `T`.
pub(crate) struct TypedColumn<T> {
    id: ComponentId,
    pub(crate) values: Vec<T>,
}

impl<T: Component> TypedColumn<T> {
    /// Column factory registered with each component type.
    pub fn boxed(id: ComponentId, capacity: usize) -> Box<dyn ErasedColumn> {
        Box::new(Self {
            id,
            values: Vec::with_capacity(capacity),
        })
    }

    /// Downcast an erased column.
    ///
    /// # Panics
    ///
    /// Panics if `column` does not store `T`; that means the column layout is
    /// corrupt.
    pub fn downcast_mut(column: &mut dyn ErasedColumn) -> &mut Self {
        match column.as_any_mut().downcast_mut::<Self>() {
            Some(typed) => typed,
            None => panic!(
                "column type mismatch: expected {}",
                std::any::type_name::<T>()
            ),
        }
    }

    pub fn downcast_ref(column: &dyn ErasedColumn) -> &Self {
        match column.as_any().downcast_ref::<Self>() {
            Some(typed) => typed,
            None => panic!(
                "column type mismatch: expected {}",
                std::any::type_name::<T>()
            ),
        }
    }
}

impl<T: Component> ErasedColumn for TypedColumn<T> {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn swap_remove(&mut self, row: usize) {
        self.values.swap_remove(row);
    }

    fn swap_remove_into(&mut self, row: usize, dst: &mut dyn ErasedColumn) {
        let value = self.values.swap_remove(row);
        let dst = Self::downcast_mut(dst);
        debug_assert_eq!(dst.id, self.id);
        dst.values.push(value);
    }

    fn clear(&mut self) {
        self.values.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// ChunkLayout
// ---------------------------------------------------------------------------

/// Column layout shared by every chunk of one archetype.
#[derive(Debug)]
pub(crate) struct ChunkLayout {
    pub components: FrozenComponentSet,
    /// Component id -> column index, -1 when absent. Sized to the largest id.
    pub column_by_id: Vec<i32>,
    /// Descriptor per column, in column order.
    pub infos: Vec<Arc<ComponentInfo>>,
}

impl ChunkLayout {
    pub fn new(components: FrozenComponentSet, infos: Vec<Arc<ComponentInfo>>) -> Self {
        let table_len = components.max_id().map_or(0, |id| id.index() + 1);
        let mut column_by_id = vec![-1; table_len];
        for (column, id) in components.iter().enumerate() {
            column_by_id[id.index()] = column as i32;
        }
        Self {
            components,
            column_by_id,
            infos,
        }
    }

    #[inline]
    pub fn column_index(&self, id: ComponentId) -> Option<usize> {
        match self.column_by_id.get(id.index()) {
            Some(&column) if column >= 0 => Some(column as usize),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A block of up to `capacity` packed rows belonging to one archetype.
pub struct Chunk {
    layout: Arc<ChunkLayout>,
    entities: Vec<EntityId>,
    columns: Vec<Box<dyn ErasedColumn>>,
    capacity: usize,
}

impl Chunk {
    pub(crate) fn new(layout: Arc<ChunkLayout>, capacity: usize) -> Self {
        let columns = layout
            .infos
            .iter()
            .map(|info| (info.new_column)(info.id, capacity))
            .collect();
        Self {
            layout,
            entities: Vec::with_capacity(capacity),
            columns,
            capacity,
        }
    }

    /// Number of live rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.entities.len() >= self.capacity
    }

    /// Entity ids of the live rows, in row order.
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// The schema of the owning archetype.
    pub fn component_ids(&self) -> &FrozenComponentSet {
        &self.layout.components
    }

    pub fn has_component(&self, id: ComponentId) -> bool {
        self.layout.column_index(id).is_some()
    }

    /// The live values of `T`, or `None` if the archetype lacks `T`.
    pub fn column<T: Component>(&self) -> Option<&[T]> {
        self.column_by_id(ComponentId::of::<T>())
    }

    /// Mutable live values of `T`, or `None` if the archetype lacks `T`.
    pub fn column_mut<T: Component>(&mut self) -> Option<&mut [T]> {
        self.column_by_id_mut(ComponentId::of::<T>())
    }

    pub(crate) fn column_by_id<T: Component>(&self, id: ComponentId) -> Option<&[T]> {
        let column = self.layout.column_index(id)?;
        Some(&TypedColumn::<T>::downcast_ref(self.columns[column].as_ref()).values)
    }

    pub(crate) fn column_by_id_mut<T: Component>(&mut self, id: ComponentId) -> Option<&mut [T]> {
        let column = self.layout.column_index(id)?;
        Some(&mut TypedColumn::<T>::downcast_mut(self.columns[column].as_mut()).values)
    }

    pub(crate) fn erased_column_mut(&mut self, id: ComponentId) -> Option<&mut dyn ErasedColumn> {
        let column = self.layout.column_index(id)?;
        Some(self.columns[column].as_mut())
    }

    /// Append a row for `entity`; `fill` must push exactly one value into each
    /// column it is handed. Returns the new row.
    pub(crate) fn push(
        &mut self,
        entity: EntityId,
        mut fill: impl FnMut(ComponentId, &mut dyn ErasedColumn),
    ) -> usize {
        debug_assert!(!self.is_full(), "push into a full chunk");
        let row = self.entities.len();
        for (column, info) in self.columns.iter_mut().zip(self.layout.infos.iter()) {
            fill(info.id, column.as_mut());
            debug_assert_eq!(column.len(), row + 1, "column {} not filled", info.name);
        }
        self.entities.push(entity);
        row
    }

    /// Remove `row`. Returns the entity that was moved into `row`, if any.
    pub(crate) fn swap_remove(&mut self, row: usize) -> Option<EntityId> {
        for column in &mut self.columns {
            column.swap_remove(row);
        }
        self.entities.swap_remove(row);
        self.entities.get(row).copied()
    }

    /// Move `row` into `dst`.
    ///
    /// Components present in both layouts are moved; components only in this
    /// chunk are dropped; components only in `dst` are supplied by `fill`.
    /// Returns the new row in `dst` and the entity swapped into `row` here.
    pub(crate) fn move_row_to(
        &mut self,
        row: usize,
        dst: &mut Chunk,
        mut fill: impl FnMut(ComponentId, &mut dyn ErasedColumn),
    ) -> (usize, Option<EntityId>) {
        debug_assert!(!dst.is_full(), "move into a full chunk");
        let entity = self.entities[row];
        let dst_row = dst.entities.len();

        let mut moved = vec![false; self.columns.len()];
        for (dst_column, info) in dst.columns.iter_mut().zip(dst.layout.infos.iter()) {
            match self.layout.column_index(info.id) {
                Some(src_column) => {
                    self.columns[src_column].swap_remove_into(row, dst_column.as_mut());
                    moved[src_column] = true;
                }
                None => fill(info.id, dst_column.as_mut()),
            }
            debug_assert_eq!(dst_column.len(), dst_row + 1, "column {} not filled", info.name);
        }
        for (column, was_moved) in self.columns.iter_mut().zip(moved) {
            if !was_moved {
                column.swap_remove(row);
            }
        }

        dst.entities.push(entity);
        self.entities.swap_remove(row);
        (dst_row, self.entities.get(row).copied())
    }

    /// Drop every row, keeping allocations for reuse.
    pub(crate) fn clear(&mut self) {
        for column in &mut self.columns {
            column.clear();
        }
        self.entities.clear();
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("components", &self.layout.components)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
