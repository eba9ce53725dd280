//! Typed staging area for component values recorded by a command buffer.
//!
//! Values are grouped in one list per component type, so recording a `set`
//! never boxes the value. A [`PendingId`] addresses one staged value; playback
//! moves it straight into a chunk column.

use std::any::Any;
use std::collections::HashMap;

use crate::chunk::{ErasedColumn, TypedColumn};
use crate::component::{Component, ComponentId};

/// Address of one staged value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PendingId {
    pub component: ComponentId,
    index: u32,
}

trait ErasedPending: Any + Send + Sync {
    fn clear(&mut self);
    fn push_into(&mut self, index: usize, column: &mut dyn ErasedColumn);
    fn write_into(&mut self, index: usize, column: &mut dyn ErasedColumn, row: usize);
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct PendingList<T>(Vec<Option<T>>);

impl<T: Component> PendingList<T> {
    fn take(&mut self, index: usize) -> T {
        match self.0.get_mut(index).and_then(Option::take) {
            Some(value) => value,
            None => panic!(
                "staged {} value {index} missing or already consumed",
                std::any::type_name::<T>()
            ),
        }
    }
}

impl<T: Component> ErasedPending for PendingList<T> {
    fn clear(&mut self) {
        self.0.clear();
    }

    fn push_into(&mut self, index: usize, column: &mut dyn ErasedColumn) {
        let value = self.take(index);
        TypedColumn::<T>::downcast_mut(column).values.push(value);
    }

    fn write_into(&mut self, index: usize, column: &mut dyn ErasedColumn, row: usize) {
        let value = self.take(index);
        TypedColumn::<T>::downcast_mut(column).values[row] = value;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-type lists of staged values. Lists are kept across [`clear`](Self::clear)
/// so a reused buffer does not reallocate them.
#[derive(Default)]
pub(crate) struct PendingValues {
    lists: HashMap<ComponentId, Box<dyn ErasedPending>>,
}

impl PendingValues {
    pub fn new() -> Self {
        Self::default()
    }

    fn list_mut<T: Component>(&mut self, id: ComponentId) -> &mut PendingList<T> {
        let list = self
            .lists
            .entry(id)
            .or_insert_with(|| Box::new(PendingList::<T>(Vec::new())));
        match list.as_any_mut().downcast_mut::<PendingList<T>>() {
            Some(list) => list,
            None => panic!("staged list for {id} holds a different type"),
        }
    }

    /// Stage `value`, returning its address.
    pub fn push<T: Component>(&mut self, value: T) -> PendingId {
        let component = ComponentId::of::<T>();
        let list = self.list_mut::<T>(component);
        let index = u32::try_from(list.0.len()).expect("staged value count overflow");
        list.0.push(Some(value));
        PendingId { component, index }
    }

    /// Replace the staged value at `id`.
    pub fn overwrite<T: Component>(&mut self, id: PendingId, value: T) {
        let list = self.list_mut::<T>(id.component);
        list.0[id.index as usize] = Some(value);
    }

    /// Move the staged value onto the end of `column`.
    pub fn push_into(&mut self, id: PendingId, column: &mut dyn ErasedColumn) {
        self.erased(id).push_into(id.index as usize, column);
    }

    /// Move the staged value into `column[row]`, dropping the old value.
    pub fn write_into(&mut self, id: PendingId, column: &mut dyn ErasedColumn, row: usize) {
        self.erased(id).write_into(id.index as usize, column, row);
    }

    fn erased(&mut self, id: PendingId) -> &mut dyn ErasedPending {
        match self.lists.get_mut(&id.component) {
            Some(list) => list.as_mut(),
            None => panic!("no staged values for {}", id.component),
        }
    }

    pub fn clear(&mut self) {
        for list in self.lists.values_mut() {
            list.clear();
        }
    }
}

/// Sorted `(component, staged value)` pairs for one entity.
#[derive(Default, Debug, Clone)]
pub(crate) struct PendingSets {
    entries: Vec<(ComponentId, PendingId)>,
}

impl PendingSets {
    pub fn get(&self, component: ComponentId) -> Option<PendingId> {
        self.entries
            .binary_search_by_key(&component, |&(c, _)| c)
            .ok()
            .map(|i| self.entries[i].1)
    }

    /// Insert a new entry. Returns `false` (and leaves the set unchanged) if
    /// `component` already has one.
    pub fn insert(&mut self, component: ComponentId, pending: PendingId) -> bool {
        match self.entries.binary_search_by_key(&component, |&(c, _)| c) {
            Ok(_) => false,
            Err(pos) => {
                self.entries.insert(pos, (component, pending));
                true
            }
        }
    }

    pub fn remove(&mut self, component: ComponentId) -> bool {
        match self.entries.binary_search_by_key(&component, |&(c, _)| c) {
            Ok(pos) => {
                self.entries.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComponentId, PendingId)> + '_ {
        self.entries.iter().copied()
    }

    pub fn components(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.entries.iter().map(|&(c, _)| c)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
