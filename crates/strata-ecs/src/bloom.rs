//! Fixed-size probabilistic membership filter over component-id sets.
//!
//! Every id sets one bit in each of six 64-bit words; the bit position in
//! word `k` comes from [`seeded_hash`] under the `k`-th seed, masked to six
//! bits. Two filters *may* intersect only if every pair of corresponding words
//! shares at least one bit, so a genuine common id is never missed.

use std::fmt;

use crate::component::ComponentId;
use crate::hash::seeded_hash;

const WORDS: usize = 6;

const SEEDS: [u64; WORDS] = [
    136_920_569,
    803_654_167,
    786_675_075,
    562_713_536,
    703_121_798,
    133_703_782,
];

/// Six-word bloom filter used to fast-reject schema predicates.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ComponentBloomFilter {
    words: [u64; WORDS],
}

impl ComponentBloomFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: impl IntoIterator<Item = ComponentId>) -> Self {
        let mut filter = Self::new();
        for id in ids {
            filter.add(id);
        }
        filter
    }

    pub fn add(&mut self, id: ComponentId) {
        for (word, seed) in self.words.iter_mut().zip(SEEDS) {
            *word |= 1u64 << (seeded_hash(seed, id) & 0x3F);
        }
    }

    /// Bitwise OR of both filters.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut words = self.words;
        for (word, theirs) in words.iter_mut().zip(other.words) {
            *word |= theirs;
        }
        Self { words }
    }

    /// `false` only when the underlying sets are definitely disjoint.
    pub fn may_intersect(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & b != 0)
    }

    /// `false` only when some id of `other` is definitely missing from `self`.
    pub fn may_contain_all(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & b == *b)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

impl fmt::Debug for ComponentBloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentBloomFilter(")?;
        for (i, w) in self.words.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{w:016x}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(raw: &[u32]) -> ComponentBloomFilter {
        ComponentBloomFilter::from_ids(raw.iter().map(|&r| ComponentId::from_raw(r)))
    }

    #[test]
    fn empty_filter_intersects_nothing() {
        let empty = ComponentBloomFilter::new();
        assert!(empty.is_empty());
        assert!(!empty.may_intersect(&filter(&[1, 2, 3])));
        assert!(!filter(&[1]).may_intersect(&empty));
    }

    #[test]
    fn shared_id_always_intersects() {
        for shared in 1..200u32 {
            let a = filter(&[shared, shared + 1000]);
            let b = filter(&[shared, shared + 2000]);
            assert!(a.may_intersect(&b), "missed shared id {shared}");
        }
    }

    #[test]
    fn one_bit_per_word() {
        let f = filter(&[12]);
        assert!(f.words.iter().all(|w| w.count_ones() == 1));
    }

    #[test]
    fn subset_is_always_contained() {
        let whole = filter(&[3, 9, 27, 81]);
        assert!(whole.may_contain_all(&filter(&[9, 81])));
        assert!(whole.may_contain_all(&ComponentBloomFilter::new()));
        assert!(!ComponentBloomFilter::new().may_contain_all(&filter(&[9])));
    }

    #[test]
    fn union_matches_incremental_adds() {
        let a = filter(&[1, 2]);
        let b = filter(&[3, 4]);
        assert_eq!(a.union(&b), filter(&[1, 2, 3, 4]));
    }

    #[test]
    fn disjoint_small_sets_are_mostly_rejected() {
        let mut rejected = 0;
        let trials = 2_000u32;
        for t in 0..trials {
            let base = t * 8 + 1;
            let a = filter(&[base, base + 1, base + 2, base + 3]);
            let b = filter(&[base + 4, base + 5, base + 6, base + 7]);
            if !a.may_intersect(&b) {
                rejected += 1;
            }
        }
        assert!(
            rejected * 100 > trials * 99,
            "only {rejected}/{trials} disjoint pairs rejected"
        );
    }
}
