//! Schema-predicate queries over a world's archetypes.
//!
//! A [`QueryBuilder`] collects four component sets:
//!
//! - **include**: the archetype must contain all of them;
//! - **exclude**: the archetype must contain none of them;
//! - **at least one of**: the archetype must contain one or more;
//! - **exactly one of**: the archetype must contain exactly one.
//!
//! [`QueryBuilder::build`] freezes them into a [`QueryDescription`], which
//! caches its matching archetypes together with the archetype count they were
//! computed at. Archetypes are only ever appended to a world, so a stale cache
//! is repaired by testing just the archetypes created since.
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! struct Pos(f32);
//! struct Sleeping;
//!
//! let mut world = World::new();
//! let mut buffer = CommandBuffer::new(&world);
//! buffer.create().set(Pos(0.0));
//! buffer.create().set(Pos(1.0)).set(Sleeping);
//! buffer.playback(&mut world).unwrap();
//!
//! let awake = QueryBuilder::new()
//!     .include::<Pos>()
//!     .exclude::<Sleeping>()
//!     .build(&world)
//!     .unwrap();
//! assert_eq!(awake.count(&world), 1);
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::archetype::{Archetype, ArchetypeId};
use crate::bloom::ComponentBloomFilter;
use crate::chunk::Chunk;
use crate::component::{Component, ComponentId};
use crate::component_set::{intersect_into, ComponentSet, FrozenComponentSet};
use crate::entity::{Entity, WorldId};
use crate::world::World;
use crate::EcsError;

/// The predicate set a component was placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFilter {
    Include,
    Exclude,
    AtLeastOneOf,
    ExactlyOneOf,
}

impl fmt::Display for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryFilter::Include => "include",
            QueryFilter::Exclude => "exclude",
            QueryFilter::AtLeastOneOf => "at-least-one-of",
            QueryFilter::ExactlyOneOf => "exactly-one-of",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// QueryBuilder
// ---------------------------------------------------------------------------

/// Accumulates predicates for a [`QueryDescription`].
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    include: ComponentSet,
    exclude: ComponentSet,
    at_least_one: ComponentSet,
    exactly_one: ComponentSet,
    /// First component placed in two different sets.
    conflict: Option<(ComponentId, QueryFilter, QueryFilter)>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include<T: Component>(self) -> Self {
        self.with(QueryFilter::Include, ComponentId::of::<T>())
    }

    pub fn exclude<T: Component>(self) -> Self {
        self.with(QueryFilter::Exclude, ComponentId::of::<T>())
    }

    pub fn at_least_one_of<T: Component>(self) -> Self {
        self.with(QueryFilter::AtLeastOneOf, ComponentId::of::<T>())
    }

    pub fn exactly_one_of<T: Component>(self) -> Self {
        self.with(QueryFilter::ExactlyOneOf, ComponentId::of::<T>())
    }

    pub fn include_id(self, id: ComponentId) -> Self {
        self.with(QueryFilter::Include, id)
    }

    pub fn exclude_id(self, id: ComponentId) -> Self {
        self.with(QueryFilter::Exclude, id)
    }

    pub fn at_least_one_of_id(self, id: ComponentId) -> Self {
        self.with(QueryFilter::AtLeastOneOf, id)
    }

    pub fn exactly_one_of_id(self, id: ComponentId) -> Self {
        self.with(QueryFilter::ExactlyOneOf, id)
    }

    fn with(mut self, filter: QueryFilter, id: ComponentId) -> Self {
        match self.filter_of(id) {
            Some(existing) if existing != filter => {
                self.conflict.get_or_insert((id, existing, filter));
            }
            Some(_) => {}
            None => {
                self.set_mut(filter).insert(id);
            }
        }
        self
    }

    fn set_mut(&mut self, filter: QueryFilter) -> &mut ComponentSet {
        match filter {
            QueryFilter::Include => &mut self.include,
            QueryFilter::Exclude => &mut self.exclude,
            QueryFilter::AtLeastOneOf => &mut self.at_least_one,
            QueryFilter::ExactlyOneOf => &mut self.exactly_one,
        }
    }

    /// Which set, if any, `id` has been placed in.
    pub fn filter_of(&self, id: ComponentId) -> Option<QueryFilter> {
        if self.include.contains(id) {
            Some(QueryFilter::Include)
        } else if self.exclude.contains(id) {
            Some(QueryFilter::Exclude)
        } else if self.at_least_one.contains(id) {
            Some(QueryFilter::AtLeastOneOf)
        } else if self.exactly_one.contains(id) {
            Some(QueryFilter::ExactlyOneOf)
        } else {
            None
        }
    }

    pub fn is_included(&self, id: ComponentId) -> bool {
        self.include.contains(id)
    }

    pub fn is_excluded(&self, id: ComponentId) -> bool {
        self.exclude.contains(id)
    }

    pub fn is_at_least_one_of(&self, id: ComponentId) -> bool {
        self.at_least_one.contains(id)
    }

    pub fn is_exactly_one_of(&self, id: ComponentId) -> bool {
        self.exactly_one.contains(id)
    }

    /// Freeze into a description bound to `world`.
    ///
    /// Fails with [`EcsError::QueryConflict`] if a component was placed in two
    /// different sets.
    pub fn build(&self, world: &World) -> Result<QueryDescription, EcsError> {
        if let Some((component, existing, requested)) = self.conflict {
            return Err(EcsError::QueryConflict {
                component,
                existing,
                requested,
            });
        }
        let include = self.include.freeze();
        let exclude = self.exclude.freeze();
        Ok(QueryDescription {
            inner: Arc::new(QueryInner {
                world: world.id(),
                include_bloom: include.bloom(),
                exclude_bloom: exclude.bloom(),
                include,
                exclude,
                at_least_one: self.at_least_one.freeze(),
                exactly_one: self.exactly_one.freeze(),
                cache: RwLock::new(MatchCache {
                    watermark: 0,
                    matches: Arc::from(Vec::new()),
                }),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// QueryDescription
// ---------------------------------------------------------------------------

/// One archetype accepted by a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchetypeMatch {
    pub archetype: ArchetypeId,
    /// The archetype's components from the at-least-one-of set, when that set
    /// is non-empty.
    pub at_least_one: Option<FrozenComponentSet>,
    /// The archetype's single component from the exactly-one-of set, when that
    /// set is non-empty.
    pub exactly_one: Option<ComponentId>,
}

struct MatchCache {
    /// Archetype count the matches were computed at.
    watermark: usize,
    matches: Arc<[ArchetypeMatch]>,
}

struct QueryInner {
    world: WorldId,
    include: FrozenComponentSet,
    exclude: FrozenComponentSet,
    at_least_one: FrozenComponentSet,
    exactly_one: FrozenComponentSet,
    include_bloom: ComponentBloomFilter,
    exclude_bloom: ComponentBloomFilter,
    cache: RwLock<MatchCache>,
}

/// A frozen query bound to one world. Clones share the match cache.
#[derive(Clone)]
pub struct QueryDescription {
    inner: Arc<QueryInner>,
}

impl fmt::Debug for QueryDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescription")
            .field("world", &self.inner.world)
            .field("include", &self.inner.include)
            .field("exclude", &self.inner.exclude)
            .field("at_least_one", &self.inner.at_least_one)
            .field("exactly_one", &self.inner.exactly_one)
            .finish()
    }
}

impl QueryDescription {
    /// The world this query was built for.
    pub fn world(&self) -> WorldId {
        self.inner.world
    }

    pub fn include(&self) -> &FrozenComponentSet {
        &self.inner.include
    }

    pub fn exclude(&self) -> &FrozenComponentSet {
        &self.inner.exclude
    }

    pub fn at_least_one_of(&self) -> &FrozenComponentSet {
        &self.inner.at_least_one
    }

    pub fn exactly_one_of(&self) -> &FrozenComponentSet {
        &self.inner.exactly_one
    }

    pub fn is_included(&self, id: ComponentId) -> bool {
        self.inner.include.contains(id)
    }

    pub fn is_excluded(&self, id: ComponentId) -> bool {
        self.inner.exclude.contains(id)
    }

    pub fn is_at_least_one_of(&self, id: ComponentId) -> bool {
        self.inner.at_least_one.contains(id)
    }

    pub fn is_exactly_one_of(&self, id: ComponentId) -> bool {
        self.inner.exactly_one.contains(id)
    }

    /// A builder holding the same predicates.
    pub fn to_builder(&self) -> QueryBuilder {
        QueryBuilder {
            include: self.inner.include.thaw(),
            exclude: self.inner.exclude.thaw(),
            at_least_one: self.inner.at_least_one.thaw(),
            exactly_one: self.inner.exactly_one.thaw(),
            conflict: None,
        }
    }

    /// Archetype count the cached matches were last computed at.
    pub fn watermark(&self) -> usize {
        self.inner.cache.read().watermark
    }

    // -- matching -------------------------------------------------------------

    /// Test a single archetype, ignoring the cache.
    pub fn try_match(&self, archetype: &Archetype) -> Option<ArchetypeMatch> {
        let q = &*self.inner;
        let schema = archetype.components();
        let bloom = archetype.bloom();

        if !q.include.is_empty()
            && (!bloom.may_contain_all(&q.include_bloom) || !schema.is_superset_of(&q.include))
        {
            return None;
        }
        if !q.exclude.is_empty() && bloom.may_intersect(&q.exclude_bloom) && schema.overlaps(&q.exclude) {
            return None;
        }

        let mut common = Vec::new();
        let exactly_one = if q.exactly_one.is_empty() {
            None
        } else {
            intersect_into(schema, &q.exactly_one, &mut common);
            if common.len() != 1 {
                return None;
            }
            Some(common[0])
        };

        let at_least_one = if q.at_least_one.is_empty() {
            None
        } else {
            common.clear();
            intersect_into(schema, &q.at_least_one, &mut common);
            if common.is_empty() {
                return None;
            }
            Some(ComponentSet::from_ids(common).freeze())
        };

        Some(ArchetypeMatch {
            archetype: archetype.id(),
            at_least_one,
            exactly_one,
        })
    }

    /// Matching archetypes in creation order.
    ///
    /// Only archetypes created since the last call are tested. When none of
    /// them match, the previous result is returned as is.
    ///
    /// # Panics
    ///
    /// If `world` is not the world this query was built for.
    pub fn matches(&self, world: &World) -> Arc<[ArchetypeMatch]> {
        self.assert_world(world);
        let current = world.archetype_count();
        {
            let cache = self.inner.cache.read();
            if cache.watermark == current {
                return Arc::clone(&cache.matches);
            }
        }

        let mut cache = self.inner.cache.write();
        if cache.watermark != current {
            let fresh: Vec<ArchetypeMatch> = world.archetypes()[cache.watermark..current]
                .iter()
                .filter_map(|archetype| self.try_match(archetype))
                .collect();
            if !fresh.is_empty() {
                let mut merged = cache.matches.to_vec();
                merged.extend(fresh);
                cache.matches = merged.into();
            }
            cache.watermark = current;
        }
        Arc::clone(&cache.matches)
    }

    fn assert_world(&self, world: &World) {
        assert!(
            world.id() == self.inner.world,
            "query built for {} evaluated against {}",
            self.inner.world,
            world.id()
        );
    }

    // -- iteration ------------------------------------------------------------

    /// Matching archetypes, including empty ones.
    pub fn archetypes<'w>(&self, world: &'w World) -> impl Iterator<Item = &'w Archetype> + 'w {
        let ids: Vec<ArchetypeId> = self.matches(world).iter().map(|m| m.archetype).collect();
        ids.into_iter().map(move |id| world.archetype(id))
    }

    /// Live chunks of every matching archetype.
    pub fn chunks<'w>(&self, world: &'w World) -> impl Iterator<Item = &'w Chunk> + 'w {
        self.archetypes(world).flat_map(Archetype::chunks)
    }

    /// Run `f` on every live chunk of every matching archetype.
    pub fn for_each_chunk_mut(&self, world: &mut World, mut f: impl FnMut(&mut Chunk)) {
        let matches = self.matches(world);
        for matched in matches.iter() {
            world.archetype_mut(matched.archetype).for_each_chunk_mut(&mut f);
        }
    }

    /// Every matching entity, archetype by archetype, chunk by chunk.
    pub fn iter<'w>(&self, world: &'w World) -> QueryIter<'w> {
        QueryIter {
            world,
            matches: self.matches(world),
            archetype: 0,
            chunk: 0,
            row: 0,
        }
    }

    // -- aggregates -----------------------------------------------------------

    pub fn count(&self, world: &World) -> usize {
        self.archetypes(world).map(Archetype::entity_count).sum()
    }

    pub fn any(&self, world: &World) -> bool {
        self.archetypes(world).any(|a| !a.is_empty())
    }

    /// `true` if `entity` is alive in `world` and its archetype matches.
    pub fn contains(&self, world: &World, entity: Entity) -> bool {
        let Ok(archetype) = world.archetype_of(entity) else {
            return false;
        };
        self.matches(world)
            .binary_search_by_key(&archetype, |m| m.archetype)
            .is_ok()
    }

    pub fn first(&self, world: &World) -> Result<Entity, EcsError> {
        self.first_or_default(world).ok_or(EcsError::NoMatchingEntity)
    }

    pub fn first_or_default(&self, world: &World) -> Option<Entity> {
        self.iter(world).next()
    }

    /// The only matching entity. Fails if there are none or several.
    pub fn single(&self, world: &World) -> Result<Entity, EcsError> {
        self.single_or_default(world)?.ok_or(EcsError::NoMatchingEntity)
    }

    /// Like [`single`](Self::single) but `None` when nothing matches.
    pub fn single_or_default(&self, world: &World) -> Result<Option<Entity>, EcsError> {
        match self.count(world) {
            0 => Ok(None),
            1 => Ok(self.first_or_default(world)),
            count => Err(EcsError::MultipleMatchingEntities { count }),
        }
    }

    /// A matching entity chosen uniformly over all matching rows.
    pub fn random_or_default(&self, world: &World, rng: &mut impl Rng) -> Option<Entity> {
        let total = self.count(world);
        if total == 0 {
            return None;
        }
        let mut pick = rng.gen_range(0..total);
        for archetype in self.archetypes(world) {
            if pick >= archetype.entity_count() {
                pick -= archetype.entity_count();
                continue;
            }
            for chunk in archetype.chunks() {
                if pick < chunk.len() {
                    return Some(Entity::new(chunk.entities()[pick], world.id()));
                }
                pick -= chunk.len();
            }
        }
        None
    }
}

/// Iterator over the entities matched by a [`QueryDescription`].
pub struct QueryIter<'w> {
    world: &'w World,
    matches: Arc<[ArchetypeMatch]>,
    archetype: usize,
    chunk: usize,
    row: usize,
}

impl Iterator for QueryIter<'_> {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        loop {
            let matched = self.matches.get(self.archetype)?;
            let archetype = self.world.archetype(matched.archetype);
            let Some(&index) = archetype.live_chunks().get(self.chunk) else {
                self.archetype += 1;
                self.chunk = 0;
                continue;
            };
            match archetype.chunk(index).entities().get(self.row) {
                Some(&id) => {
                    self.row += 1;
                    return Some(Entity::new(id, self.world.id()));
                }
                None => {
                    self.chunk += 1;
                    self.row = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuffer;
    use rand_pcg::Pcg64;
    use rand::SeedableRng;

    #[derive(Debug, Clone, PartialEq)]
    struct A(u32);
    #[derive(Debug, Clone, PartialEq)]
    struct B(u32);
    #[derive(Debug, Clone, PartialEq)]
    struct C(u32);

    /// One entity each in `{A}`, `{A, B}` and `{}`.
    fn three_archetypes() -> (World, Entity, Entity, Entity) {
        let mut world = World::new();
        let mut buffer = CommandBuffer::new(&world);
        let a = buffer.create().set(A(1)).entity();
        let ab = buffer.create().set(A(2)).set(B(2)).entity();
        let empty = buffer.create().entity();
        let resolver = buffer.playback(&mut world).unwrap();
        let a = resolver.resolve(a).unwrap();
        let ab = resolver.resolve(ab).unwrap();
        let empty = resolver.resolve(empty).unwrap();
        (world, a, ab, empty)
    }

    #[test]
    fn include_exclude_selects_single_archetype() {
        let (world, a, ab, empty) = three_archetypes();
        let query = QueryBuilder::new().include::<A>().exclude::<B>().build(&world).unwrap();

        assert_eq!(query.count(&world), 1);
        assert!(query.contains(&world, a));
        assert!(!query.contains(&world, ab));
        assert!(!query.contains(&world, empty));
        assert_eq!(query.single(&world).unwrap(), a);
    }

    #[test]
    fn empty_query_matches_everything() {
        let (world, ..) = three_archetypes();
        let query = QueryBuilder::new().build(&world).unwrap();
        assert_eq!(query.count(&world), 3);
        assert_eq!(query.iter(&world).count(), 3);
        assert!(matches!(
            query.single(&world),
            Err(EcsError::MultipleMatchingEntities { count: 3 })
        ));
    }

    #[test]
    fn conflicting_predicates_fail_to_build() {
        let world = World::new();
        let err = QueryBuilder::new().include::<A>().exclude::<A>().build(&world).unwrap_err();
        assert!(matches!(
            err,
            EcsError::QueryConflict {
                existing: QueryFilter::Include,
                requested: QueryFilter::Exclude,
                ..
            }
        ));
        assert!(QueryBuilder::new().include::<A>().include::<A>().build(&world).is_ok());
    }

    #[test]
    fn union_predicates_record_what_matched() {
        let (world, ..) = three_archetypes();
        let exactly = QueryBuilder::new().exactly_one_of::<A>().exactly_one_of::<B>().build(&world).unwrap();
        let matched = exactly.matches(&world);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].exactly_one, Some(ComponentId::of::<A>()));

        let any = QueryBuilder::new().at_least_one_of::<A>().at_least_one_of::<B>().build(&world).unwrap();
        let matched = any.matches(&world);
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[1].at_least_one.as_ref().map(|s| s.len()), Some(2));
    }

    #[test]
    fn cache_extends_with_new_archetypes_only() {
        let (mut world, ..) = three_archetypes();
        let query = QueryBuilder::new().include::<A>().build(&world).unwrap();
        let first = query.matches(&world);
        assert_eq!(query.watermark(), world.archetype_count());

        world.get_or_create_archetype(&[ComponentId::of::<C>()]).unwrap();
        let unchanged = query.matches(&world);
        assert!(Arc::ptr_eq(&first, &unchanged));
        assert_eq!(query.watermark(), world.archetype_count());

        world
            .get_or_create_archetype(&[ComponentId::of::<A>(), ComponentId::of::<C>()])
            .unwrap();
        let extended = query.matches(&world);
        assert_eq!(extended.len(), first.len() + 1);

        let fresh = query.to_builder().build(&world).unwrap();
        assert_eq!(&*fresh.matches(&world), &*extended);
    }

    #[test]
    fn clones_share_the_cache() {
        let (world, ..) = three_archetypes();
        let query = QueryBuilder::new().include::<A>().build(&world).unwrap();
        let clone = query.clone();
        let matches = query.matches(&world);
        assert_eq!(clone.watermark(), world.archetype_count());
        assert!(Arc::ptr_eq(&matches, &clone.matches(&world)));
    }

    #[test]
    fn first_and_single_report_absence() {
        let (world, ..) = three_archetypes();
        let none = QueryBuilder::new().include::<C>().build(&world).unwrap();
        assert!(matches!(none.first(&world), Err(EcsError::NoMatchingEntity)));
        assert!(matches!(none.single(&world), Err(EcsError::NoMatchingEntity)));
        assert_eq!(none.single_or_default(&world).unwrap(), None);
        assert!(!none.any(&world));
    }

    #[test]
    fn for_each_chunk_mut_writes_columns() {
        let (mut world, a, ab, _) = three_archetypes();
        let query = QueryBuilder::new().include::<A>().build(&world).unwrap();
        query.for_each_chunk_mut(&mut world, |chunk| {
            if let Some(values) = chunk.column_mut::<A>() {
                for value in values {
                    value.0 *= 10;
                }
            }
        });
        assert_eq!(world.get::<A>(a).unwrap(), &A(10));
        assert_eq!(world.get::<A>(ab).unwrap(), &A(20));
        assert_eq!(query.chunks(&world).count(), 2);
    }

    #[test]
    fn random_pick_covers_every_match() {
        let mut world = World::new();
        let mut buffer = CommandBuffer::new(&world);
        for i in 0..6 {
            if i % 2 == 0 {
                buffer.create().set(A(i));
            } else {
                buffer.create().set(A(i)).set(B(i));
            }
        }
        let resolver = buffer.playback(&mut world).unwrap();
        let query = QueryBuilder::new().include::<A>().build(&world).unwrap();

        let mut rng = Pcg64::seed_from_u64(7);
        let mut hits = std::collections::HashMap::new();
        for _ in 0..600 {
            let e = query.random_or_default(&world, &mut rng).unwrap();
            *hits.entry(e).or_insert(0usize) += 1;
        }
        assert_eq!(hits.len(), resolver.len());
        assert!(hits.values().all(|&n| n > 50), "skewed picks: {hits:?}");

        let none = QueryBuilder::new().include::<C>().build(&world).unwrap();
        assert_eq!(none.random_or_default(&world, &mut rng), None);
    }

    #[test]
    #[should_panic(expected = "evaluated against")]
    fn foreign_world_panics() {
        let (world, ..) = three_archetypes();
        let other = World::new();
        let query = QueryBuilder::new().build(&world).unwrap();
        query.count(&other);
    }
}
