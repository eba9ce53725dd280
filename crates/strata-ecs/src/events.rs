//! Lifecycle notifications raised during command-buffer playback.
//!
//! Five kinds of event exist: entity created/destroyed and component
//! added/modified/removed. Handlers are closures registered on a world's
//! [`EventBus`]. Each one receives the affected [`Entity`] and a
//! `&mut CommandBuffer` for chaining further mutations; component handlers
//! also get `&mut T` to the stored value. Both borrows last only for the call.
//!
//! Chained mutations go to a separate recursive buffer that plays back after
//! the triggering batch has been fully applied.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use strata_ecs::prelude::*;
//!
//! struct Health(u32);
//!
//! let mut world = World::new();
//! let added = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&added);
//! world.events_mut().on_component_added::<Health>(move |event| {
//!     event.value.0 += 1;
//!     counter.fetch_add(1, Ordering::Relaxed);
//! });
//!
//! let mut buffer = CommandBuffer::new(&world);
//! let pending = buffer.create().set(Health(10)).entity();
//! let resolver = buffer.playback(&mut world).unwrap();
//! let entity = resolver.resolve(pending).unwrap();
//!
//! assert_eq!(added.load(Ordering::Relaxed), 1);
//! assert_eq!(world.get::<Health>(entity).unwrap().0, 11);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::chunk::{ErasedColumn, TypedColumn};
use crate::command::CommandBuffer;
use crate::component::{Component, ComponentId};
use crate::entity::Entity;

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// Which component lifecycle transition is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentEventKind {
    Added,
    Modified,
    Removed,
}

/// Which entity lifecycle transition is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEventKind {
    Created,
    Destroyed,
}

/// Payload for entity created/destroyed handlers.
pub struct EntityEvent<'a> {
    pub entity: Entity,
    /// Buffer for follow-up mutations; played back after the current batch.
    pub commands: &'a mut CommandBuffer,
}

/// Payload for component added/modified/removed handlers.
pub struct ComponentEvent<'a, T> {
    pub entity: Entity,
    /// The stored value. For removals this is the value about to be dropped.
    pub value: &'a mut T,
    /// Buffer for follow-up mutations; played back after the current batch.
    pub commands: &'a mut CommandBuffer,
}

type EntityHandler = Box<dyn FnMut(EntityEvent<'_>) + Send + Sync>;
type ComponentHandler<T> = Box<dyn FnMut(ComponentEvent<'_, T>) + Send + Sync>;

/// Type-erased entry point that raises one component event.
///
/// One is monomorphized per component type at registration and stored in the
/// component's [`ComponentInfo`](crate::component::ComponentInfo).
pub(crate) type ComponentDispatch = fn(
    &mut EventBus,
    ComponentEventKind,
    Entity,
    &mut dyn ErasedColumn,
    usize,
    &mut CommandBuffer,
);

struct ComponentHandlers<T> {
    added: Vec<ComponentHandler<T>>,
    modified: Vec<ComponentHandler<T>>,
    removed: Vec<ComponentHandler<T>>,
}

impl<T> Default for ComponentHandlers<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            modified: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<T> ComponentHandlers<T> {
    fn of_kind(&mut self, kind: ComponentEventKind) -> &mut Vec<ComponentHandler<T>> {
        match kind {
            ComponentEventKind::Added => &mut self.added,
            ComponentEventKind::Modified => &mut self.modified,
            ComponentEventKind::Removed => &mut self.removed,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Handler registry owned by a [`World`](crate::world::World).
#[derive(Default)]
pub struct EventBus {
    created: Vec<EntityHandler>,
    destroyed: Vec<EntityHandler>,
    /// `ComponentHandlers<T>` keyed by `T`'s id.
    components: HashMap<ComponentId, Box<dyn Any + Send + Sync>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_entity_created(&mut self, handler: impl FnMut(EntityEvent<'_>) + Send + Sync + 'static) {
        self.created.push(Box::new(handler));
    }

    pub fn on_entity_destroyed(&mut self, handler: impl FnMut(EntityEvent<'_>) + Send + Sync + 'static) {
        self.destroyed.push(Box::new(handler));
    }

    pub fn on_component_added<T: Component>(
        &mut self,
        handler: impl FnMut(ComponentEvent<'_, T>) + Send + Sync + 'static,
    ) {
        self.subscribe(ComponentEventKind::Added, Box::new(handler));
    }

    pub fn on_component_modified<T: Component>(
        &mut self,
        handler: impl FnMut(ComponentEvent<'_, T>) + Send + Sync + 'static,
    ) {
        self.subscribe(ComponentEventKind::Modified, Box::new(handler));
    }

    pub fn on_component_removed<T: Component>(
        &mut self,
        handler: impl FnMut(ComponentEvent<'_, T>) + Send + Sync + 'static,
    ) {
        self.subscribe(ComponentEventKind::Removed, Box::new(handler));
    }

    fn subscribe<T: Component>(&mut self, kind: ComponentEventKind, handler: ComponentHandler<T>) {
        let handlers = self
            .components
            .entry(ComponentId::of::<T>())
            .or_insert_with(|| Box::new(ComponentHandlers::<T>::default()));
        match handlers.downcast_mut::<ComponentHandlers<T>>() {
            Some(handlers) => handlers.of_kind(kind).push(handler),
            None => unreachable!("handler table keyed by the wrong component id"),
        }
    }

    /// `true` if any handler is registered for component `id`.
    #[inline]
    pub fn has_component_handlers(&self, id: ComponentId) -> bool {
        self.components.contains_key(&id)
    }

    #[inline]
    pub fn has_entity_handlers(&self, kind: EntityEventKind) -> bool {
        match kind {
            EntityEventKind::Created => !self.created.is_empty(),
            EntityEventKind::Destroyed => !self.destroyed.is_empty(),
        }
    }

    /// Remove every handler.
    pub fn clear(&mut self) {
        self.created.clear();
        self.destroyed.clear();
        self.components.clear();
    }

    pub(crate) fn raise_entity(&mut self, kind: EntityEventKind, entity: Entity, commands: &mut CommandBuffer) {
        let handlers = match kind {
            EntityEventKind::Created => &mut self.created,
            EntityEventKind::Destroyed => &mut self.destroyed,
        };
        for handler in handlers.iter_mut() {
            handler(EntityEvent {
                entity,
                commands: &mut *commands,
            });
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("created", &self.created.len())
            .field("destroyed", &self.destroyed.len())
            .field("component_types", &self.components.len())
            .finish()
    }
}

/// Raise a component event for the value of `T` at `row` of `column`.
pub(crate) fn dispatch_component_event<T: Component>(
    bus: &mut EventBus,
    kind: ComponentEventKind,
    entity: Entity,
    column: &mut dyn ErasedColumn,
    row: usize,
    commands: &mut CommandBuffer,
) {
    let Some(handlers) = bus.components.get_mut(&ComponentId::of::<T>()) else {
        return;
    };
    let Some(handlers) = handlers.downcast_mut::<ComponentHandlers<T>>() else {
        return;
    };
    let value = &mut TypedColumn::<T>::downcast_mut(column).values[row];
    for handler in handlers.of_kind(kind).iter_mut() {
        handler(ComponentEvent {
            entity,
            value: &mut *value,
            commands: &mut *commands,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Score(u32);

    #[test]
    fn subscriptions_are_tracked_per_component() {
        let mut bus = EventBus::new();
        let id = ComponentId::of::<Score>();
        assert!(!bus.has_component_handlers(id));
        assert!(!bus.has_entity_handlers(EntityEventKind::Created));

        bus.on_component_removed::<Score>(|_| {});
        bus.on_entity_created(|_| {});
        assert!(bus.has_component_handlers(id));
        assert!(bus.has_entity_handlers(EntityEventKind::Created));
        assert!(!bus.has_entity_handlers(EntityEventKind::Destroyed));

        bus.clear();
        assert!(!bus.has_component_handlers(id));
        assert!(!bus.has_entity_handlers(EntityEventKind::Created));
    }
}
