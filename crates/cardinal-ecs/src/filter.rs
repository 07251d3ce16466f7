//! Component filters: boolean predicates over an archetype's component set.
//!
//! A filter never looks at component values, only at which component types
//! an archetype carries. Filters are built with the free constructor
//! functions in this module or compiled from CQL text by [`crate::cql`].

use crate::component::ComponentTypeId;

/// A predicate over a sorted component set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentFilter {
    /// Matches every archetype.
    All,
    /// Matches archetypes whose component set equals this one. Sorted, unique.
    Exact(Vec<ComponentTypeId>),
    /// Matches archetypes whose component set is a superset of this one.
    /// Sorted, unique.
    Contains(Vec<ComponentTypeId>),
    Not(Box<ComponentFilter>),
    /// Matches when every child matches. An empty list matches everything.
    And(Vec<ComponentFilter>),
    /// Matches when any child matches. An empty list matches nothing.
    Or(Vec<ComponentFilter>),
}

fn normalized(types: impl IntoIterator<Item = ComponentTypeId>) -> Vec<ComponentTypeId> {
    let mut types: Vec<_> = types.into_iter().collect();
    types.sort_unstable();
    types.dedup();
    types
}

/// Matches every archetype.
pub fn all() -> ComponentFilter {
    ComponentFilter::All
}

/// Matches archetypes with exactly these component types.
pub fn exact(types: impl IntoIterator<Item = ComponentTypeId>) -> ComponentFilter {
    ComponentFilter::Exact(normalized(types))
}

/// Matches archetypes carrying at least these component types.
pub fn contains(types: impl IntoIterator<Item = ComponentTypeId>) -> ComponentFilter {
    ComponentFilter::Contains(normalized(types))
}

pub fn not(inner: ComponentFilter) -> ComponentFilter {
    ComponentFilter::Not(Box::new(inner))
}

pub fn and(left: ComponentFilter, right: ComponentFilter) -> ComponentFilter {
    ComponentFilter::And(vec![left, right])
}

pub fn or(left: ComponentFilter, right: ComponentFilter) -> ComponentFilter {
    ComponentFilter::Or(vec![left, right])
}

impl ComponentFilter {
    /// Evaluate against a sorted, deduplicated component set.
    pub fn matches(&self, components: &[ComponentTypeId]) -> bool {
        match self {
            ComponentFilter::All => true,
            ComponentFilter::Exact(types) => types.as_slice() == components,
            ComponentFilter::Contains(types) => types
                .iter()
                .all(|t| components.binary_search(t).is_ok()),
            ComponentFilter::Not(inner) => !inner.matches(components),
            ComponentFilter::And(children) => children.iter().all(|f| f.matches(components)),
            ComponentFilter::Or(children) => children.iter().any(|f| f.matches(components)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
