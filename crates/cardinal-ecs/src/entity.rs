//! Entity identifiers, allocation and the location index.
//!
//! [`EntityId`]s are allocated monotonically starting at 1 and are never
//! reused. Every live entity has exactly one [`Location`]: the archetype it
//! belongs to and its row index inside that archetype.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::archetype::ArchetypeId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A unique entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Reconstruct from a raw `u64`.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw `u64` representation.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Hands out fresh [`EntityId`]s. Ids are never recycled.
#[derive(Debug, Clone)]
pub struct EntityAllocator {
    next: u64,
}

impl EntityAllocator {
    /// Create an allocator whose first id is 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate a fresh [`EntityId`].
    pub fn allocate(&mut self) -> EntityId {
        let id = EntityId(self.next);
        self.next += 1;
        id
    }

    /// The id the next call to [`allocate`](Self::allocate) will return.
    pub fn peek_next(&self) -> u64 {
        self.next
    }

    /// Resume allocation from a persisted counter.
    pub(crate) fn restore(&mut self, next: u64) {
        self.next = next.max(1);
    }
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// Where an entity's row lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Archetype containing the entity.
    pub archetype: ArchetypeId,
    /// Row index inside the archetype (and every column of it).
    pub index: usize,
}

impl Location {
    pub fn new(archetype: ArchetypeId, index: usize) -> Self {
        Self { archetype, index }
    }
}

// ---------------------------------------------------------------------------
// EntityLocationIndex
// ---------------------------------------------------------------------------

/// Dense map from [`EntityId`] to [`Location`].
///
/// Because ids are allocated sequentially, a `Vec` indexed by the raw id is
/// both compact and O(1). The index also remembers which entities were
/// inserted, moved or removed since [`clear_changes`](Self::clear_changes),
/// so a commit only persists those.
#[derive(Debug, Clone, Default)]
pub struct EntityLocationIndex {
    slots: Vec<Option<Location>>,
    count: usize,
    changed: BTreeSet<EntityId>,
}

impl EntityLocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(entity: EntityId) -> usize {
        entity.0 as usize
    }

    /// Record the location of a newly created entity.
    pub fn insert(&mut self, entity: EntityId, location: Location) {
        let slot = Self::slot(entity);
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, None);
        }
        if self.slots[slot].replace(location).is_none() {
            self.count += 1;
        }
        self.changed.insert(entity);
    }

    /// Forget an entity, returning its last location.
    pub fn remove(&mut self, entity: EntityId) -> Result<Location, EcsError> {
        let location = self
            .slots
            .get_mut(Self::slot(entity))
            .and_then(Option::take)
            .ok_or(EcsError::EntityNotFound(entity))?;
        self.count -= 1;
        self.changed.insert(entity);
        Ok(location)
    }

    /// Look up where an entity lives.
    pub fn get_location(&self, entity: EntityId) -> Result<Location, EcsError> {
        self.slots
            .get(Self::slot(entity))
            .copied()
            .flatten()
            .ok_or(EcsError::EntityNotFound(entity))
    }

    /// Update the location of a live entity.
    pub fn set_location(&mut self, entity: EntityId, location: Location) -> Result<(), EcsError> {
        match self.slots.get_mut(Self::slot(entity)) {
            Some(slot) if slot.is_some() => {
                if *slot != Some(location) {
                    *slot = Some(location);
                    self.changed.insert(entity);
                }
                Ok(())
            }
            _ => Err(EcsError::EntityNotFound(entity)),
        }
    }

    /// Whether the entity is live.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.get_location(entity).is_ok()
    }

    /// Number of live entities.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Entities whose location changed since the last
    /// [`clear_changes`](Self::clear_changes): the live ones with their
    /// current location, and the removed ones.
    pub fn changes(&self) -> (Vec<(EntityId, Location)>, Vec<EntityId>) {
        let mut placed = Vec::new();
        let mut removed = Vec::new();
        for &entity in &self.changed {
            match self.get_location(entity) {
                Ok(location) => placed.push((entity, location)),
                Err(_) => removed.push(entity),
            }
        }
        (placed, removed)
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn clear_changes(&mut self) {
        self.changed.clear();
    }

    /// Iterate over live entities in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, Location)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, loc)| loc.map(|loc| (EntityId(slot as u64), loc)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_starts_at_one_and_never_reuses() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_eq!(a.to_raw(), 1);
        assert_eq!(b.to_raw(), 2);
        assert_eq!(alloc.peek_next(), 3);
    }

    #[test]
    fn location_index_lifecycle() {
        let mut index = EntityLocationIndex::new();
        let e = EntityId::from_raw(5);
        let loc = Location::new(ArchetypeId::from_raw(0), 3);

        index.insert(e, loc);
        assert_eq!(index.count(), 1);
        assert_eq!(index.get_location(e).unwrap(), loc);

        let moved = Location::new(ArchetypeId::from_raw(1), 0);
        index.set_location(e, moved).unwrap();
        assert_eq!(index.get_location(e).unwrap(), moved);

        assert_eq!(index.remove(e).unwrap(), moved);
        assert_eq!(index.count(), 0);
        assert!(matches!(
            index.get_location(e),
            Err(EcsError::EntityNotFound(_))
        ));
    }

    #[test]
    fn set_location_on_missing_entity_fails() {
        let mut index = EntityLocationIndex::new();
        let err = index
            .set_location(EntityId::from_raw(9), Location::new(ArchetypeId::from_raw(0), 0))
            .unwrap_err();
        assert!(matches!(err, EcsError::EntityNotFound(_)));
    }

    #[test]
    fn changes_cover_inserts_moves_and_removals() {
        let mut index = EntityLocationIndex::new();
        let arch = ArchetypeId::from_raw(0);
        let (a, b, c) = (EntityId(1), EntityId(2), EntityId(3));
        index.insert(a, Location::new(arch, 0));
        index.insert(b, Location::new(arch, 1));
        index.insert(c, Location::new(arch, 2));
        index.clear_changes();
        assert!(!index.has_changes());

        // Rewriting an unchanged location is not a change.
        index.set_location(b, Location::new(arch, 1)).unwrap();
        assert!(!index.has_changes());

        index.remove(a).unwrap();
        index.set_location(c, Location::new(arch, 0)).unwrap();
        let (placed, removed) = index.changes();
        assert_eq!(placed, vec![(c, Location::new(arch, 0))]);
        assert_eq!(removed, vec![a]);
    }

    #[test]
    fn iter_is_ascending() {
        let mut index = EntityLocationIndex::new();
        let arch = ArchetypeId::from_raw(0);
        for raw in [7, 2, 4] {
            index.insert(EntityId::from_raw(raw), Location::new(arch, 0));
        }
        let ids: Vec<u64> = index.iter().map(|(e, _)| e.to_raw()).collect();
        assert_eq!(ids, vec![2, 4, 7]);
    }
}
