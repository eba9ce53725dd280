//! Entity identifiers and the versioned storage-slot table.
//!
//! An [`EntityId`] is an `(index, version)` pair. The index names a reusable
//! slot in the world's [`EntitySlots`] table; the version is bumped every time
//! the slot is vacated, which makes every outstanding handle to the previous
//! occupant stale. Index 0 and version 0 are never issued, so
//! `EntityId::default()` is always invalid.
//!
//! An [`Entity`] additionally records which [`WorldId`] issued it, so handles
//! cannot be used against a different world by accident.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::archetype::{ArchetypeId, ChunkIndex};

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A versioned entity identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    index: i32,
    version: u32,
}

impl EntityId {
    /// Construct an `EntityId` from an index and version.
    #[inline]
    pub const fn new(index: i32, version: u32) -> Self {
        Self { index, version }
    }

    #[inline]
    pub const fn index(self) -> i32 {
        self.index
    }

    #[inline]
    pub const fn version(self) -> u32 {
        self.version
    }

    /// `false` for the reserved default id.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.index > 0 && self.version != 0
    }

    /// Pack into a `u64` as `[version: u32 | index: u32]`.
    #[inline]
    pub fn to_raw(self) -> u64 {
        (self.version as u64) << 32 | self.index as u32 as u64
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32 as i32,
            version: (raw >> 32) as u32,
        }
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index, self.version)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.version)
    }
}

// ---------------------------------------------------------------------------
// WorldId / Entity
// ---------------------------------------------------------------------------

static NEXT_WORLD_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`World`](crate::world::World).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct WorldId(u64);

impl WorldId {
    pub(crate) fn next() -> Self {
        Self(NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "world#{}", self.0)
    }
}

/// An entity handle bound to the world that created it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    id: EntityId,
    world: WorldId,
}

impl Entity {
    pub(crate) fn new(id: EntityId, world: WorldId) -> Self {
        Self { id, world }
    }

    #[inline]
    pub fn id(self) -> EntityId {
        self.id
    }

    #[inline]
    pub fn index(self) -> i32 {
        self.id.index
    }

    #[inline]
    pub fn version(self) -> u32 {
        self.id.version
    }

    #[inline]
    pub fn world(self) -> WorldId {
        self.world
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}@{})", self.id, self.world.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

// ---------------------------------------------------------------------------
// EntitySlots
// ---------------------------------------------------------------------------

/// Where a live entity's row currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EntityLocation {
    pub archetype: ArchetypeId,
    pub chunk: ChunkIndex,
    pub row: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct StorageSlot {
    /// Version of the current (or next) occupant; 0 until first use.
    version: u32,
    /// `None` while the slot is vacant.
    location: Option<EntityLocation>,
}

/// Versioned slot table, grown one fixed-size segment at a time.
///
/// Vacated indices are reused last-in-first-out. The version is bumped when a
/// slot is vacated (skipping 0 on wrap-around), so the next occupant gets a
/// fresh version and all old handles fail their version check.
#[derive(Debug)]
pub(crate) struct EntitySlots {
    segments: Vec<Box<[StorageSlot]>>,
    segment_capacity: usize,
    next_index: i32,
    free: Vec<i32>,
    alive: usize,
}

impl EntitySlots {
    pub fn new(segment_capacity: usize) -> Self {
        Self {
            segments: Vec::new(),
            segment_capacity,
            next_index: 1,
            free: Vec::new(),
            alive: 0,
        }
    }

    /// Slots addressable without growing.
    pub fn capacity(&self) -> usize {
        self.segments.len() * self.segment_capacity
    }

    pub fn alive(&self) -> usize {
        self.alive
    }

    /// Claim a slot for a new entity at `location`.
    pub fn allocate(&mut self, location: EntityLocation) -> EntityId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self.next_index;
                self.next_index = index
                    .checked_add(1)
                    .expect("entity index space exhausted");
                if index as usize >= self.capacity() {
                    self.segments
                        .push(vec![StorageSlot::default(); self.segment_capacity].into_boxed_slice());
                }
                index
            }
        };

        let slot = self.slot_mut(index);
        if slot.version == 0 {
            slot.version = 1;
        }
        slot.location = Some(location);
        let version = slot.version;
        self.alive += 1;
        EntityId::new(index, version)
    }

    /// Vacate `id`'s slot. Returns `false` if `id` was not alive.
    pub fn release(&mut self, id: EntityId) -> bool {
        if self.location(id).is_none() {
            return false;
        }
        let slot = self.slot_mut(id.index);
        slot.location = None;
        slot.version = match slot.version.wrapping_add(1) {
            0 => 1,
            v => v,
        };
        self.free.push(id.index);
        self.alive -= 1;
        true
    }

    /// Current version stored for `index`; 0 if the index was never issued.
    pub fn version(&self, index: i32) -> u32 {
        self.try_slot(index).map_or(0, |slot| slot.version)
    }

    /// Location of `id` if it is alive.
    pub fn location(&self, id: EntityId) -> Option<EntityLocation> {
        let slot = self.try_slot(id.index)?;
        if slot.version == id.version {
            slot.location
        } else {
            None
        }
    }

    /// Point a live entity at a new location.
    pub fn set_location(&mut self, id: EntityId, location: EntityLocation) {
        let slot = self.slot_mut(id.index);
        debug_assert_eq!(slot.version, id.version, "relocating a stale entity");
        slot.location = Some(location);
    }

    /// Update only the row of a live entity (after a swap-remove).
    pub fn set_row(&mut self, id: EntityId, row: usize) {
        let slot = self.slot_mut(id.index);
        match slot.location.as_mut() {
            Some(location) => location.row = row,
            None => panic!("swap-remove moved vacant slot {id}"),
        }
    }

    fn try_slot(&self, index: i32) -> Option<&StorageSlot> {
        if index <= 0 {
            return None;
        }
        let index = index as usize;
        self.segments
            .get(index / self.segment_capacity)
            .map(|segment| &segment[index % self.segment_capacity])
    }

    fn slot_mut(&mut self, index: i32) -> &mut StorageSlot {
        let capacity = self.capacity();
        let position = usize::try_from(index)
            .ok()
            .filter(|&i| i > 0 && i < capacity)
            .unwrap_or_else(|| {
                panic!("entity index {index} outside storage table capacity {capacity}")
            });
        &mut self.segments[position / self.segment_capacity][position % self.segment_capacity]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(row: usize) -> EntityLocation {
        EntityLocation {
            archetype: ArchetypeId::from_raw(0),
            chunk: ChunkIndex::from_raw(0),
            row,
        }
    }

    #[test]
    fn default_id_is_invalid() {
        assert!(!EntityId::default().is_valid());
        assert!(EntityId::new(1, 1).is_valid());
        assert!(!EntityId::new(1, 0).is_valid());
    }

    #[test]
    fn raw_round_trip() {
        let id = EntityId::new(123, 456);
        assert_eq!(EntityId::from_raw(id.to_raw()), id);
        assert_eq!(format!("{id:?}"), "EntityId(123v456)");
        assert_eq!(format!("{id}"), "123v456");
    }

    #[test]
    fn first_allocation_is_index_one_version_one() {
        let mut slots = EntitySlots::new(4);
        let e = slots.allocate(loc(0));
        assert_eq!(e, EntityId::new(1, 1));
        assert_eq!(slots.version(1), 1);
        assert_eq!(slots.alive(), 1);
    }

    #[test]
    fn release_bumps_version_and_reuses_last_freed() {
        let mut slots = EntitySlots::new(4);
        let a = slots.allocate(loc(0));
        let b = slots.allocate(loc(1));
        assert!(slots.release(a));
        assert!(slots.release(b));
        assert!(!slots.release(b));

        assert_eq!(slots.version(a.index()), 2);
        assert!(slots.location(a).is_none());

        let reused = slots.allocate(loc(0));
        assert_eq!(reused, EntityId::new(b.index(), 2));
        let reused_again = slots.allocate(loc(1));
        assert_eq!(reused_again, EntityId::new(a.index(), 2));
        assert!(slots.location(a).is_none());
        assert_eq!(slots.location(reused_again), Some(loc(1)));
    }

    #[test]
    fn grows_by_segments() {
        let mut slots = EntitySlots::new(4);
        let ids: Vec<_> = (0..10).map(|row| slots.allocate(loc(row))).collect();
        assert_eq!(ids.last().unwrap().index(), 10);
        assert_eq!(slots.capacity(), 12);
        for (row, id) in ids.iter().enumerate() {
            assert_eq!(slots.location(*id).unwrap().row, row);
        }
    }

    #[test]
    fn out_of_range_version_is_zero() {
        let slots = EntitySlots::new(4);
        assert_eq!(slots.version(0), 0);
        assert_eq!(slots.version(-3), 0);
        assert_eq!(slots.version(1_000), 0);
        assert!(slots.location(EntityId::new(1_000, 1)).is_none());
    }

    #[test]
    #[should_panic(expected = "outside storage table capacity")]
    fn slot_access_past_capacity_is_fatal() {
        let mut slots = EntitySlots::new(4);
        slots.allocate(loc(0));
        slots.set_row(EntityId::new(40, 1), 0);
    }

    #[test]
    fn world_ids_are_unique() {
        assert_ne!(WorldId::next(), WorldId::next());
    }
}
