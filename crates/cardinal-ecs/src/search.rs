//! Searches: cached archetype filtering plus per-entity predicates.
//!
//! A [`Search`] remembers which archetypes matched its filter and how many
//! archetypes it has already examined. Archetypes are append-only, so each
//! evaluation only has to look at archetypes created since the last one.
//! The one exception is a world rollback that drops archetypes; the world's
//! archetype generation then changes and the cache starts over.
//!
//! A search's cache is tied to the world it was first evaluated against;
//! use one `Search` per world.

use std::collections::BTreeSet;
use std::fmt;

use crate::archetype::ArchetypeId;
use crate::component::ComponentRegistry;
use crate::cql;
use crate::entity::EntityId;
use crate::filter::ComponentFilter;
use crate::world::World;
use crate::EcsError;

/// Per-entity predicate applied after archetype filtering.
///
/// Non-fatal errors (see [`EcsError::is_fatal`]) exclude the entity; fatal
/// errors abort the search.
pub type WhereFn = Box<dyn Fn(&World, EntityId) -> Result<bool, EcsError> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct ArchetypeCache {
    /// Matching archetypes, ascending.
    archetypes: Vec<ArchetypeId>,
    /// Number of archetypes already examined.
    seen: usize,
    /// World archetype generation the cache was built against.
    generation: u64,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// A reusable query over a world's entities.
pub struct Search {
    filter: ComponentFilter,
    cache: ArchetypeCache,
    predicate: Option<WhereFn>,
}

impl fmt::Debug for Search {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Search")
            .field("filter", &self.filter)
            .field("cache", &self.cache)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Search {
    pub fn new(filter: ComponentFilter) -> Self {
        Self {
            filter,
            cache: ArchetypeCache::default(),
            predicate: None,
        }
    }

    /// Build a search from CQL text.
    pub fn from_cql(text: &str, registry: &ComponentRegistry) -> Result<Self, EcsError> {
        Ok(Self::new(cql::parse_with_registry(text, registry)?))
    }

    /// Restrict results to entities for which `predicate` returns `true`.
    ///
    /// Calling this again combines predicates with logical AND.
    pub fn where_fn<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&World, EntityId) -> Result<bool, EcsError> + Send + Sync + 'static,
    {
        let combined: WhereFn = match self.predicate.take() {
            None => Box::new(predicate),
            Some(previous) => Box::new(move |world: &World, entity: EntityId| {
                Ok(previous(world, entity)? && predicate(world, entity)?)
            }),
        };
        self.predicate = Some(combined);
        self
    }

    pub fn filter(&self) -> &ComponentFilter {
        &self.filter
    }

    /// How many archetypes this search has examined so far.
    pub fn cursor(&self) -> usize {
        self.cache.seen
    }

    /// Bring the archetype cache up to date and return the matching
    /// archetypes in ascending id order.
    pub fn evaluate(&mut self, world: &World) -> &[ArchetypeId] {
        let archetypes = world.archetypes();
        if self.cache.generation != world.archetype_generation() {
            self.cache = ArchetypeCache {
                generation: world.archetype_generation(),
                ..ArchetypeCache::default()
            };
        }
        if self.cache.seen < archetypes.len() {
            let found = archetypes.search_from(&self.filter, self.cache.seen);
            self.cache.archetypes.extend(found);
            self.cache.seen = archetypes.len();
        }
        &self.cache.archetypes
    }

    fn accepts(&self, world: &World, entity: EntityId) -> Result<bool, EcsError> {
        let Some(predicate) = &self.predicate else {
            return Ok(true);
        };
        match predicate(world, entity) {
            Ok(keep) => Ok(keep),
            Err(e) if !e.is_fatal() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Visit matching entities in archetype then row order until `visit`
    /// returns `false`.
    pub fn each<F>(&mut self, world: &World, mut visit: F) -> Result<(), EcsError>
    where
        F: FnMut(EntityId) -> bool,
    {
        self.evaluate(world);
        for &archetype in &self.cache.archetypes {
            let Some(archetype) = world.archetypes().get(archetype) else {
                continue;
            };
            for &entity in archetype.entities() {
                if self.accepts(world, entity)? && !visit(entity) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// All matching entities.
    pub fn collect(&mut self, world: &World) -> Result<Vec<EntityId>, EcsError> {
        let mut out = Vec::new();
        self.each(world, |entity| {
            out.push(entity);
            true
        })?;
        Ok(out)
    }

    pub fn count(&mut self, world: &World) -> Result<usize, EcsError> {
        if self.predicate.is_none() {
            let archetypes = world.archetypes();
            return Ok(self
                .evaluate(world)
                .iter()
                .filter_map(|id| archetypes.get(*id))
                .map(|arch| arch.len())
                .sum());
        }
        let mut count = 0;
        self.each(world, |_| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    /// The first matching entity in iteration order.
    pub fn first(&mut self, world: &World) -> Result<Option<EntityId>, EcsError> {
        let mut first = None;
        self.each(world, |entity| {
            first = Some(entity);
            false
        })?;
        Ok(first)
    }
}

// ---------------------------------------------------------------------------
// ComposedSearch
// ---------------------------------------------------------------------------

/// Set algebra over the results of other searches.
///
/// Unlike a plain [`Search`], results are de-duplicated and sorted by
/// entity id.
#[derive(Debug)]
pub enum ComposedSearch {
    Leaf(Search),
    And(Vec<ComposedSearch>),
    Or(Vec<ComposedSearch>),
    /// Every live entity not matched by the inner search.
    Not(Box<ComposedSearch>),
}

impl From<Search> for ComposedSearch {
    fn from(search: Search) -> Self {
        ComposedSearch::Leaf(search)
    }
}

impl ComposedSearch {
    pub fn and(searches: impl IntoIterator<Item = ComposedSearch>) -> Self {
        ComposedSearch::And(searches.into_iter().collect())
    }

    pub fn or(searches: impl IntoIterator<Item = ComposedSearch>) -> Self {
        ComposedSearch::Or(searches.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(search: impl Into<ComposedSearch>) -> Self {
        ComposedSearch::Not(Box::new(search.into()))
    }

    fn evaluate(&mut self, world: &World) -> Result<BTreeSet<EntityId>, EcsError> {
        match self {
            ComposedSearch::Leaf(search) => Ok(search.collect(world)?.into_iter().collect()),
            ComposedSearch::And(children) => {
                let mut result: Option<BTreeSet<EntityId>> = None;
                for child in children {
                    let ids = child.evaluate(world)?;
                    result = Some(match result {
                        None => ids,
                        Some(acc) => acc.intersection(&ids).copied().collect(),
                    });
                }
                Ok(result.unwrap_or_else(|| world.entity_ids().into_iter().collect()))
            }
            ComposedSearch::Or(children) => {
                let mut result = BTreeSet::new();
                for child in children {
                    result.extend(child.evaluate(world)?);
                }
                Ok(result)
            }
            ComposedSearch::Not(inner) => {
                let excluded = inner.evaluate(world)?;
                Ok(world
                    .entity_ids()
                    .into_iter()
                    .filter(|e| !excluded.contains(e))
                    .collect())
            }
        }
    }

    /// Matching entities, ascending.
    pub fn collect(&mut self, world: &World) -> Result<Vec<EntityId>, EcsError> {
        Ok(self.evaluate(world)?.into_iter().collect())
    }

    pub fn count(&mut self, world: &World) -> Result<usize, EcsError> {
        Ok(self.evaluate(world)?.len())
    }

    /// The smallest matching entity id.
    pub fn first(&mut self, world: &World) -> Result<Option<EntityId>, EcsError> {
        Ok(self.evaluate(world)?.into_iter().next())
    }

    /// Visit matching entities in ascending order until `visit` returns
    /// `false`.
    pub fn each<F>(&mut self, world: &World, mut visit: F) -> Result<(), EcsError>
    where
        F: FnMut(EntityId) -> bool,
    {
        for entity in self.evaluate(world)? {
            if !visit(entity) {
                break;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter;
    use crate::world::ComponentBundle;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Alpha(i32);

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Beta(i32);

    fn world() -> World {
        let mut world = World::new();
        world.register_component::<Alpha>("Alpha").unwrap();
        world.register_component::<Beta>("Beta").unwrap();
        world
    }

    #[test]
    fn cache_only_examines_new_archetypes() {
        let mut w = world();
        let alpha = w.component_id::<Alpha>().unwrap();
        w.create_many(50, ComponentBundle::new().with(Alpha(1))).unwrap();

        let mut search = Search::new(filter::contains([alpha]));
        assert_eq!(search.count(&w).unwrap(), 50);
        assert_eq!(search.cursor(), 1);

        w.create_many(50, ComponentBundle::new().with(Alpha(2))).unwrap();
        w.create_many(50, ComponentBundle::new().with(Beta(2))).unwrap();
        assert_eq!(w.archetype_count(), 2);

        // Only the Beta archetype is new; the Alpha one stays cached.
        assert_eq!(search.count(&w).unwrap(), 100);
        assert_eq!(search.cursor(), 2);
        assert_eq!(search.evaluate(&w).len(), 1);

        w.create(ComponentBundle::new().with(Alpha(3)).with(Beta(3)))
            .unwrap();
        assert_eq!(search.count(&w).unwrap(), 101);
        assert_eq!(search.cursor(), 3);
        assert_eq!(search.evaluate(&w).len(), 2);
    }

    #[test]
    fn cache_starts_over_after_a_rollback_drops_archetypes() {
        let mut w = world();
        let beta = w.component_id::<Beta>().unwrap();
        w.create(ComponentBundle::new().with(Alpha(1))).unwrap();
        w.commit(1).unwrap();

        // Archetype 1 is {Beta} until the rollback, then {Alpha, Beta}.
        w.create(ComponentBundle::new().with(Beta(1))).unwrap();
        let mut search = Search::new(filter::exact([beta]));
        assert_eq!(search.count(&w).unwrap(), 1);

        w.rollback();
        assert_eq!(w.archetype_count(), 1);
        w.create(ComponentBundle::new().with(Alpha(2)).with(Beta(2)))
            .unwrap();
        assert_eq!(w.archetype_count(), 2);
        assert_eq!(search.count(&w).unwrap(), 0);
        assert_eq!(search.cursor(), 2);
    }

    #[test]
    fn where_fn_filters_by_value() {
        let mut w = world();
        for i in 0..6 {
            w.create(ComponentBundle::new().with(Alpha(i))).unwrap();
        }

        let mut search = Search::new(filter::all())
            .where_fn(|world, e| Ok(world.get_component::<Alpha>(e)?.0 % 2 == 0))
            .where_fn(|world, e| Ok(world.get_component::<Alpha>(e)?.0 > 0));

        let ids = search.collect(&w).unwrap();
        let values: Vec<i32> = ids
            .iter()
            .map(|e| w.get_component::<Alpha>(*e).unwrap().0)
            .collect();
        assert_eq!(values, vec![2, 4]);
    }

    #[test]
    fn where_fn_skips_non_fatal_errors() {
        let mut w = world();
        w.create(ComponentBundle::new().with(Alpha(1))).unwrap();
        let b = w.create(ComponentBundle::new().with(Beta(1))).unwrap();

        // Beta is missing on one entity: that entity is skipped, not fatal.
        let mut search =
            Search::new(filter::all()).where_fn(|world, e| Ok(world.get_component::<Beta>(e)?.0 == 1));
        assert_eq!(search.collect(&w).unwrap(), vec![b]);
    }

    #[test]
    fn where_fn_propagates_fatal_errors() {
        let mut w = world();
        w.create(ComponentBundle::new().with(Alpha(1))).unwrap();

        let mut search = Search::new(filter::all())
            .where_fn(|_, _| Err(EcsError::StateMismatch("boom".into())));
        assert!(matches!(
            search.count(&w),
            Err(EcsError::StateMismatch(_))
        ));
    }

    #[test]
    fn first_and_early_exit() {
        let mut w = world();
        let e1 = w.create(ComponentBundle::new().with(Alpha(1))).unwrap();
        w.create(ComponentBundle::new().with(Alpha(2))).unwrap();

        let mut search = Search::new(filter::all());
        assert_eq!(search.first(&w).unwrap(), Some(e1));

        let mut seen = 0;
        search
            .each(&w, |_| {
                seen += 1;
                false
            })
            .unwrap();
        assert_eq!(seen, 1);

        let mut empty = Search::new(filter::exact([w.component_id::<Beta>().unwrap()]));
        assert_eq!(empty.first(&w).unwrap(), None);
    }

    #[test]
    fn composed_searches_are_sorted_and_unique() {
        let mut w = world();
        let alpha = w.component_id::<Alpha>().unwrap();
        let beta = w.component_id::<Beta>().unwrap();
        let a = w.create(ComponentBundle::new().with(Alpha(0))).unwrap();
        let b = w.create(ComponentBundle::new().with(Beta(0))).unwrap();
        let ab = w
            .create(ComponentBundle::new().with(Alpha(0)).with(Beta(0)))
            .unwrap();

        let mut either = ComposedSearch::or([
            Search::new(filter::contains([beta])).into(),
            Search::new(filter::contains([alpha])).into(),
        ]);
        assert_eq!(either.collect(&w).unwrap(), vec![a, b, ab]);

        let mut both = ComposedSearch::and([
            Search::new(filter::contains([alpha])).into(),
            Search::new(filter::contains([beta])).into(),
        ]);
        assert_eq!(both.collect(&w).unwrap(), vec![ab]);

        let mut neither_alpha = ComposedSearch::not(Search::new(filter::contains([alpha])));
        assert_eq!(neither_alpha.collect(&w).unwrap(), vec![b]);
        assert_eq!(neither_alpha.first(&w).unwrap(), Some(b));
    }

    #[test]
    fn from_cql_uses_registered_names() {
        let mut w = world();
        w.create(ComponentBundle::new().with(Alpha(0)).with(Beta(0)))
            .unwrap();
        let mut search = Search::from_cql("CONTAINS(Alpha) & !EXACT(Alpha)", w.registry()).unwrap();
        assert_eq!(search.count(&w).unwrap(), 1);

        let err = Search::from_cql("CONTAINS(Gamma)", w.registry()).unwrap_err();
        assert!(matches!(err, EcsError::Cql(_)));
    }
}
