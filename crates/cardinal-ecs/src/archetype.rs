//! Archetype bookkeeping for the ECS.
//!
//! An [`Archetype`] groups all entities that share the exact same set of
//! component types. It owns only the row list (row index -> entity); the
//! component values for each row live in the
//! [`ColumnStore`](crate::storage::ColumnStore) under the same
//! `(archetype, index)` address.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::ComponentTypeId;
use crate::entity::EntityId;
use crate::filter::ComponentFilter;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype within the world. Assigned in creation order from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// The rows of one archetype.
#[derive(Debug, Clone)]
pub struct Archetype {
    id: ArchetypeId,
    /// Sorted, deduplicated.
    component_types: Vec<ComponentTypeId>,
    /// Row index -> entity.
    entities: Vec<EntityId>,
}

impl Archetype {
    fn new(id: ArchetypeId, component_types: Vec<ComponentTypeId>) -> Self {
        Self {
            id,
            component_types,
            entities: Vec::new(),
        }
    }

    /// This archetype's identifier.
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// The sorted component types that define this archetype.
    pub fn component_types(&self) -> &[ComponentTypeId] {
        &self.component_types
    }

    /// Whether this archetype includes `type_id`.
    pub fn has_component(&self, type_id: ComponentTypeId) -> bool {
        self.component_types.binary_search(&type_id).is_ok()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Row index -> entity.
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Append a row, returning its index.
    pub(crate) fn push(&mut self, entity: EntityId) -> usize {
        self.entities.push(entity);
        self.entities.len() - 1
    }

    /// Swap-remove `row`. Returns the entity that was moved into `row`, if
    /// the removed row was not the last one.
    ///
    /// `row` must be in bounds; callers resolve it from the location index.
    pub(crate) fn swap_remove(&mut self, row: usize) -> Option<EntityId> {
        debug_assert!(row < self.entities.len(), "row {row} out of bounds");
        self.entities.swap_remove(row);
        self.entities.get(row).copied()
    }
}

// ---------------------------------------------------------------------------
// ArchetypeRegistry
// ---------------------------------------------------------------------------

/// All archetypes of a world, addressable by id or by component set.
#[derive(Debug, Clone, Default)]
pub struct ArchetypeRegistry {
    /// Indexed by `ArchetypeId.0`.
    archetypes: Vec<Archetype>,
    /// Sorted component set -> archetype.
    index: HashMap<Vec<ComponentTypeId>, ArchetypeId>,
}

impl ArchetypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(types: &[ComponentTypeId]) -> Vec<ComponentTypeId> {
        let mut sorted = types.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted
    }

    /// The archetype for exactly this component set, if it exists.
    pub fn lookup(&self, types: &[ComponentTypeId]) -> Option<ArchetypeId> {
        self.index.get(&Self::normalize(types)).copied()
    }

    /// The id this component set has, or would get if created next.
    ///
    /// Lets callers address a new archetype's columns before committing to
    /// creating it.
    pub(crate) fn reserve(&self, types: &[ComponentTypeId]) -> ArchetypeId {
        self.lookup(types)
            .unwrap_or(ArchetypeId(self.archetypes.len() as u32))
    }

    /// Rows in an archetype, or 0 for one that does not exist yet.
    pub(crate) fn row_count(&self, id: ArchetypeId) -> usize {
        self.get(id).map_or(0, Archetype::len)
    }

    /// Return the archetype for this component set, creating it if needed.
    ///
    /// Order and duplicates in `types` are irrelevant.
    pub fn get_or_create(&mut self, types: &[ComponentTypeId]) -> ArchetypeId {
        let sorted = Self::normalize(types);
        if let Some(&id) = self.index.get(&sorted) {
            return id;
        }

        let id = ArchetypeId(self.archetypes.len() as u32);
        tracing::debug!(archetype = id.0, components = ?sorted, "created archetype");
        self.archetypes.push(Archetype::new(id, sorted.clone()));
        self.index.insert(sorted, id);
        id
    }

    /// Component set of an archetype.
    pub fn components_of(&self, id: ArchetypeId) -> Result<&[ComponentTypeId], EcsError> {
        self.get(id)
            .map(Archetype::component_types)
            .ok_or(EcsError::UnknownArchetype(id))
    }

    pub fn get(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.0 as usize)
    }

    pub(crate) fn get_mut(&mut self, id: ArchetypeId) -> Result<&mut Archetype, EcsError> {
        self.archetypes
            .get_mut(id.0 as usize)
            .ok_or(EcsError::UnknownArchetype(id))
    }

    /// Number of archetypes ever created.
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// All archetypes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    /// Archetypes with id `>= start` matching `filter`, in id order.
    ///
    /// Archetypes are append-only, so a caller that remembers how many it
    /// has seen can resume from there and only evaluate new ones.
    pub fn search_from(&self, filter: &ComponentFilter, start: usize) -> Vec<ArchetypeId> {
        self.archetypes
            .iter()
            .skip(start)
            .filter(|arch| filter.matches(&arch.component_types))
            .map(|arch| arch.id)
            .collect()
    }

    /// All archetypes matching `filter`.
    pub fn search(&self, filter: &ComponentFilter) -> Vec<ArchetypeId> {
        self.search_from(filter, 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter;

    fn c(raw: u32) -> ComponentTypeId {
        ComponentTypeId::from_raw(raw)
    }

    #[test]
    fn get_or_create_is_order_insensitive() {
        let mut reg = ArchetypeRegistry::new();
        let a = reg.get_or_create(&[c(2), c(1)]);
        let b = reg.get_or_create(&[c(1), c(2), c(2)]);
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.components_of(a).unwrap(), &[c(1), c(2)]);
    }

    #[test]
    fn ids_follow_creation_order() {
        let mut reg = ArchetypeRegistry::new();
        let a = reg.get_or_create(&[c(1)]);
        let b = reg.get_or_create(&[c(2)]);
        assert_eq!(a.raw(), 0);
        assert_eq!(b.raw(), 1);
        assert_eq!(reg.lookup(&[c(2)]), Some(b));
        assert_eq!(reg.lookup(&[c(3)]), None);
    }

    #[test]
    fn swap_remove_reports_moved_entity() {
        let mut reg = ArchetypeRegistry::new();
        let id = reg.get_or_create(&[c(1)]);
        let arch = reg.get_mut(id).unwrap();
        for raw in 1..=3 {
            arch.push(EntityId::from_raw(raw));
        }

        // Removing the first row moves the last entity into it.
        assert_eq!(arch.swap_remove(0), Some(EntityId::from_raw(3)));
        assert_eq!(arch.entities(), &[EntityId::from_raw(3), EntityId::from_raw(2)]);

        // Removing the last row moves nothing.
        assert_eq!(arch.swap_remove(1), None);
        assert_eq!(arch.len(), 1);
    }

    #[test]
    fn search_from_skips_seen_archetypes() {
        let mut reg = ArchetypeRegistry::new();
        let a = reg.get_or_create(&[c(1)]);
        let _b = reg.get_or_create(&[c(2)]);
        let ab = reg.get_or_create(&[c(1), c(2)]);

        let f = filter::contains([c(1)]);
        assert_eq!(reg.search(&f), vec![a, ab]);
        assert_eq!(reg.search_from(&f, 1), vec![ab]);
        assert!(reg.search_from(&f, 3).is_empty());
    }

    #[test]
    fn unknown_archetype_is_an_error() {
        let reg = ArchetypeRegistry::new();
        assert!(matches!(
            reg.components_of(ArchetypeId::from_raw(4)),
            Err(EcsError::UnknownArchetype(_))
        ));
    }
}
