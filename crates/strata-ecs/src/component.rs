//! Component type registration and metadata.
//!
//! Any `Send + Sync + 'static` type can be a [`Component`]. The first time a
//! type is seen, the process-wide [`ComponentRegistry`] hands it a dense
//! [`ComponentId`] (starting at 1) together with the per-type plumbing the
//! storage layer needs: a column factory and a lifecycle-event dispatcher.
//! Ids are stable for the lifetime of the process and are shared by every
//! [`World`](crate::world::World).
//!
//! Registration can happen explicitly at startup or lazily on first use:
//!
//! ```
//! use strata_ecs::component::{ComponentId, ComponentRegistry};
//!
//! struct Mass(f32);
//!
//! let id = ComponentRegistry::global().register_named::<Mass>("mass");
//! assert_eq!(ComponentId::of::<Mass>(), id);
//! assert_eq!(ComponentRegistry::global().info(id).unwrap().name, "mass");
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::chunk::{ErasedColumn, TypedColumn};
use crate::events::{dispatch_component_event, ComponentDispatch};
use crate::EcsError;

/// Marker for types that can be stored as components.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

// ---------------------------------------------------------------------------
// ComponentId
// ---------------------------------------------------------------------------

/// Small positive integer identifying a component type. Zero is never issued.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(u32);

impl ComponentId {
    /// The id of `T`, registering it if this is the first use.
    #[inline]
    pub fn of<T: Component>() -> Self {
        ComponentRegistry::global().register::<T>()
    }

    /// Wrap a raw id. The id is not checked against the registry.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Position in sparse tables keyed by id.
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata and type-erased operations for one registered component type.
pub struct ComponentInfo {
    /// Id assigned at registration time.
    pub id: ComponentId,
    /// Display name; `std::any::type_name` unless registered with a name.
    pub name: String,
    /// `std::mem::size_of::<T>()`
    pub size: usize,
    /// `std::mem::align_of::<T>()`
    pub align: usize,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
    pub(crate) new_column: fn(ComponentId, usize) -> Box<dyn ErasedColumn>,
    pub(crate) dispatch: ComponentDispatch,
}

impl ComponentInfo {
    fn of<T: Component>(id: ComponentId, name: String) -> Self {
        Self {
            id,
            name,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            type_id: TypeId::of::<T>(),
            new_column: TypedColumn::<T>::boxed,
            dispatch: dispatch_component_event::<T>,
        }
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

static GLOBAL_REGISTRY: Lazy<ComponentRegistry> = Lazy::new(ComponentRegistry::new);

#[derive(Default)]
struct RegistryState {
    by_type: HashMap<TypeId, ComponentId>,
    by_name: HashMap<String, ComponentId>,
    /// Indexed by `id - 1`.
    infos: Vec<Arc<ComponentInfo>>,
}

/// Thread-safe mapping from Rust types to [`ComponentId`]s and their metadata.
///
/// Lookups take a shared lock. Registering an unseen type retries under the
/// exclusive lock, so two threads racing to register the same type both end
/// up with the same id.
pub struct ComponentRegistry {
    state: RwLock<RegistryState>,
}

impl ComponentRegistry {
    /// Create an empty registry. Worlds always use [`global`](Self::global).
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static ComponentRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register `T` (idempotent), naming it after its Rust type.
    pub fn register<T: Component>(&self) -> ComponentId {
        if let Some(id) = self.lookup::<T>() {
            return id;
        }
        self.register_slow::<T>(None)
    }

    /// Register `T` (idempotent) under an explicit display name.
    ///
    /// If `T` is already registered the existing id is returned and `name` is
    /// ignored.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already taken by a different type.
    pub fn register_named<T: Component>(&self, name: &str) -> ComponentId {
        if let Some(id) = self.lookup::<T>() {
            return id;
        }
        self.register_slow::<T>(Some(name))
    }

    fn register_slow<T: Component>(&self, name: Option<&str>) -> ComponentId {
        let mut state = self.state.write();
        let type_id = TypeId::of::<T>();
        if let Some(&existing) = state.by_type.get(&type_id) {
            return existing;
        }

        let name = name.unwrap_or_else(|| std::any::type_name::<T>()).to_owned();
        if state.by_name.contains_key(&name) {
            panic!("component name '{name}' is already registered for a different type");
        }

        let raw = u32::try_from(state.infos.len() + 1).expect("component id space exhausted");
        let id = ComponentId(raw);
        state.infos.push(Arc::new(ComponentInfo::of::<T>(id, name.clone())));
        state.by_type.insert(type_id, id);
        trace!(component = %name, id = raw, "registered component type");
        state.by_name.insert(name, id);
        id
    }

    /// The id of `T`, if it has been registered.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentId> {
        self.state.read().by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentId> {
        self.state.read().by_name.get(name).copied()
    }

    /// Metadata for `id`.
    pub fn info(&self, id: ComponentId) -> Result<Arc<ComponentInfo>, EcsError> {
        let state = self.state.read();
        id.index()
            .checked_sub(1)
            .and_then(|slot| state.infos.get(slot))
            .cloned()
            .ok_or(EcsError::UnknownComponent { id })
    }

    /// Display name for `id`, or a placeholder for unknown ids.
    pub fn name_of(&self, id: ComponentId) -> String {
        match self.info(id) {
            Ok(info) => info.name.clone(),
            Err(_) => format!("<unregistered {id}>"),
        }
    }

    /// Every id issued so far, ascending.
    pub fn component_ids(&self) -> Vec<ComponentId> {
        self.state.read().infos.iter().map(|info| info.id).collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().infos.is_empty()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
