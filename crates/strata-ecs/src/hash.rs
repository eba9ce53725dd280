//! Seeded component-id hashing and the order-independent [`ArchetypeHash`].
//!
//! Both the schema bloom filter and the archetype fingerprint need a family of
//! independent 64-bit hashes over a component id. They are derived from
//! BLAKE3 in keyed mode: the seed (little-endian, zero-padded to 32 bytes) is
//! the key, and the id's 4 little-endian bytes are the input.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::ComponentId;

/// Seed used for archetype fingerprints.
const ARCHETYPE_HASH_SEED: u64 = 17;

/// Hash `id` under `seed`, returning the first 8 bytes of the digest.
pub fn seeded_hash(seed: u64, id: ComponentId) -> u64 {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    let digest = blake3::keyed_hash(&key, &id.raw().to_le_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(word)
}

// ---------------------------------------------------------------------------
// ArchetypeHash
// ---------------------------------------------------------------------------

/// Order-independent fingerprint of a component-id set.
///
/// The hash of a set is the XOR of the per-id hashes of its members, so adding
/// or removing a single id is one [`toggle`](Self::toggle). The empty set
/// hashes to zero. Distinct sets may collide; lookups always confirm with a
/// full set comparison.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchetypeHash(u64);

impl ArchetypeHash {
    /// Hash of the empty set.
    pub const EMPTY: ArchetypeHash = ArchetypeHash(0);

    /// Fingerprint an entire set.
    pub fn of(ids: &[ComponentId]) -> Self {
        ids.iter().fold(Self::EMPTY, |hash, &id| hash.toggle(id))
    }

    /// Flip `id`'s membership in the fingerprinted set.
    #[inline]
    #[must_use]
    pub fn toggle(self, id: ComponentId) -> Self {
        Self(self.0 ^ seeded_hash(ARCHETYPE_HASH_SEED, id))
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ArchetypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeHash({:016x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> ComponentId {
        ComponentId::from_raw(raw)
    }

    #[test]
    fn empty_set_hashes_to_zero() {
        assert_eq!(ArchetypeHash::of(&[]), ArchetypeHash::EMPTY);
        assert_eq!(ArchetypeHash::EMPTY.to_raw(), 0);
    }

    #[test]
    fn toggle_is_an_involution() {
        let h = ArchetypeHash::of(&[id(1), id(2)]);
        assert_eq!(h.toggle(id(9)).toggle(id(9)), h);
        assert_eq!(h.toggle(id(2)), ArchetypeHash::of(&[id(1)]));
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let forward = ArchetypeHash::EMPTY.toggle(id(3)).toggle(id(5)).toggle(id(8));
        let backward = ArchetypeHash::EMPTY.toggle(id(8)).toggle(id(5)).toggle(id(3));
        assert_eq!(forward, backward);
        assert_eq!(forward, ArchetypeHash::of(&[id(3), id(5), id(8)]));
    }

    #[test]
    fn seeds_produce_independent_hashes() {
        assert_ne!(seeded_hash(1, id(42)), seeded_hash(2, id(42)));
        assert_ne!(seeded_hash(1, id(42)), seeded_hash(1, id(43)));
        assert_eq!(seeded_hash(7, id(42)), seeded_hash(7, id(42)));
    }
}
