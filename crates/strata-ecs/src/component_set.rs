//! Sorted, duplicate-free sets of [`ComponentId`]s.
//!
//! A schema is identified by the exact set of component ids it contains. Both
//! set flavours here keep their ids strictly increasing, which turns superset,
//! overlap and equality tests into single linear merge scans.
//!
//! - [`ComponentSet`] is the mutable working form used by builders and the
//!   command buffer playback loop.
//! - [`FrozenComponentSet`] is the immutable, cheaply clonable form shared by
//!   archetypes, chunks and query descriptions.
//!
//! ```
//! use strata_ecs::component::ComponentId;
//! use strata_ecs::component_set::ComponentSet;
//!
//! let a = ComponentId::from_raw(1);
//! let b = ComponentId::from_raw(4);
//!
//! let mut set = ComponentSet::new();
//! assert!(set.insert(b));
//! assert!(set.insert(a));
//! assert!(!set.insert(a));
//! assert_eq!(set.as_slice(), &[a, b]);
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::bloom::ComponentBloomFilter;
use crate::component::ComponentId;

// ---------------------------------------------------------------------------
// Merge-scan primitives
// ---------------------------------------------------------------------------

/// `true` if every id of `subset` is present in `superset`.
///
/// Both slices must be sorted and duplicate-free.
pub fn is_superset(superset: &[ComponentId], subset: &[ComponentId]) -> bool {
    if subset.len() > superset.len() {
        return false;
    }
    let mut i = 0;
    for &wanted in subset {
        loop {
            match superset.get(i) {
                None => return false,
                Some(&have) if have < wanted => i += 1,
                Some(&have) if have == wanted => {
                    i += 1;
                    break;
                }
                Some(_) => return false,
            }
        }
    }
    true
}

/// `true` if the two sorted slices share at least one id.
pub fn overlaps(a: &[ComponentId], b: &[ComponentId]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => return true,
        }
    }
    false
}

/// Write the intersection of two sorted slices into `out` (cleared first).
pub fn intersect_into(a: &[ComponentId], b: &[ComponentId], out: &mut Vec<ComponentId>) {
    out.clear();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentSet
// ---------------------------------------------------------------------------

/// A mutable ordered set of component ids.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ComponentSet {
    ids: Vec<ComponentId>,
}

impl ComponentSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self { ids: Vec::new() }
    }

    /// Create an empty set with room for `capacity` ids.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Vec::with_capacity(capacity),
        }
    }

    /// Build a set from arbitrary ids; duplicates collapse.
    pub fn from_ids(ids: impl IntoIterator<Item = ComponentId>) -> Self {
        let mut ids: Vec<ComponentId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    /// Insert `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: ComponentId) -> bool {
        match self.ids.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, id);
                true
            }
        }
    }

    /// Remove `id`. Returns `false` if it was absent.
    pub fn remove(&mut self, id: ComponentId) -> bool {
        match self.ids.binary_search(&id) {
            Ok(pos) => {
                self.ids.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Add every id of `other` to this set.
    pub fn union_with(&mut self, other: &[ComponentId]) {
        if other.is_empty() {
            return;
        }
        if self.ids.is_empty() {
            self.ids.extend_from_slice(other);
            return;
        }
        let mut merged = Vec::with_capacity(self.ids.len() + other.len());
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.len() {
            match self.ids[i].cmp(&other[j]) {
                std::cmp::Ordering::Less => {
                    merged.push(self.ids[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(other[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    merged.push(self.ids[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&self.ids[i..]);
        merged.extend_from_slice(&other[j..]);
        self.ids = merged;
    }

    /// Keep only ids that are also present in `other`.
    pub fn intersect_with(&mut self, other: &[ComponentId]) {
        let mut j = 0;
        self.ids.retain(|id| {
            while j < other.len() && other[j] < *id {
                j += 1;
            }
            j < other.len() && other[j] == *id
        });
    }

    pub fn is_superset_of(&self, other: &[ComponentId]) -> bool {
        is_superset(&self.ids, other)
    }

    pub fn overlaps(&self, other: &[ComponentId]) -> bool {
        overlaps(&self.ids, other)
    }

    pub fn set_equals(&self, other: &[ComponentId]) -> bool {
        self.ids.as_slice() == other
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn as_slice(&self) -> &[ComponentId] {
        &self.ids
    }

    /// Snapshot the current contents into an immutable set.
    pub fn freeze(&self) -> FrozenComponentSet {
        FrozenComponentSet {
            ids: Arc::from(self.ids.as_slice()),
        }
    }

    /// Bloom filter over the current contents.
    pub fn bloom(&self) -> ComponentBloomFilter {
        ComponentBloomFilter::from_ids(self.ids.iter().copied())
    }
}

impl Deref for ComponentSet {
    type Target = [ComponentId];

    fn deref(&self) -> &[ComponentId] {
        &self.ids
    }
}

impl fmt::Debug for ComponentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ids.iter()).finish()
    }
}

impl FromIterator<ComponentId> for ComponentSet {
    fn from_iter<I: IntoIterator<Item = ComponentId>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}

impl<'a> IntoIterator for &'a ComponentSet {
    type Item = &'a ComponentId;
    type IntoIter = std::slice::Iter<'a, ComponentId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

// ---------------------------------------------------------------------------
// FrozenComponentSet
// ---------------------------------------------------------------------------

/// An immutable ordered set of component ids, shared by reference count.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FrozenComponentSet {
    ids: Arc<[ComponentId]>,
}

impl FrozenComponentSet {
    pub fn empty() -> Self {
        Self {
            ids: Arc::from(Vec::new()),
        }
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Position of `id` within the set, if present.
    pub fn position(&self, id: ComponentId) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    pub fn is_superset_of(&self, other: &[ComponentId]) -> bool {
        is_superset(&self.ids, other)
    }

    pub fn overlaps(&self, other: &[ComponentId]) -> bool {
        overlaps(&self.ids, other)
    }

    pub fn set_equals(&self, other: &[ComponentId]) -> bool {
        &*self.ids == other
    }

    pub fn as_slice(&self) -> &[ComponentId] {
        &self.ids
    }

    /// Largest id in the set, if any.
    pub fn max_id(&self) -> Option<ComponentId> {
        self.ids.last().copied()
    }

    /// Copy back into a mutable set.
    pub fn thaw(&self) -> ComponentSet {
        ComponentSet {
            ids: self.ids.to_vec(),
        }
    }

    pub fn bloom(&self) -> ComponentBloomFilter {
        ComponentBloomFilter::from_ids(self.ids.iter().copied())
    }
}

impl Default for FrozenComponentSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl Deref for FrozenComponentSet {
    type Target = [ComponentId];

    fn deref(&self) -> &[ComponentId] {
        &self.ids
    }
}

impl fmt::Debug for FrozenComponentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ids.iter()).finish()
    }
}

impl From<ComponentSet> for FrozenComponentSet {
    fn from(set: ComponentSet) -> Self {
        Self {
            ids: Arc::from(set.ids),
        }
    }
}

impl<'a> IntoIterator for &'a FrozenComponentSet {
    type Item = &'a ComponentId;
    type IntoIter = std::slice::Iter<'a, ComponentId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
