//! The [`World`] is the top-level container for the ECS. It owns the entity
//! allocator, the component registry, the archetype registry, the entity
//! location index and the column store, and keeps all of them consistent.
//!
//! Every mutating operation validates first and then touches the column
//! store through a single row-level call, so a failure leaves the world
//! exactly as it was.
//!
//! Changes accumulate until [`World::commit`]. [`World::rollback`] returns
//! the world to its last committed state, which is how the tick engine
//! undoes a failed tick.

use std::any::TypeId;

use crate::archetype::{ArchetypeId, ArchetypeRegistry};
use crate::component::{
    self, Component, ComponentInfo, ComponentRegistry, ComponentSchema, ComponentTypeId,
};
use crate::entity::{EntityAllocator, EntityId, EntityLocationIndex, Location};
use crate::filter::ComponentFilter;
use crate::search::Search;
use crate::storage::memory::MemoryColumnStore;
use crate::storage::{ColumnStore, RowMigration, StorageError, WorldCommit};
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PendingComponent {
    type_id: TypeId,
    type_name: &'static str,
    encoded: Result<Vec<u8>, String>,
}

/// The initial component values of a new entity.
///
/// ```
/// # use cardinal_ecs::prelude::*;
/// # #[derive(Clone, Default, serde::Serialize, serde::Deserialize)] struct Pos(f32, f32);
/// # #[derive(Clone, Default, serde::Serialize, serde::Deserialize)] struct Vel(f32, f32);
/// let bundle = ComponentBundle::new().with(Pos(0.0, 0.0)).with(Vel(1.0, 0.0));
/// assert_eq!(bundle.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ComponentBundle {
    components: Vec<PendingComponent>,
}

impl ComponentBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component value. Encoding errors surface when the bundle is
    /// used.
    pub fn with<T: Component>(mut self, value: T) -> Self {
        self.components.push(PendingComponent {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            encoded: serde_json::to_vec(&value).map_err(|e| e.to_string()),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Structural state as of the last commit, saved by the first structural
/// change after it.
#[derive(Debug, Clone)]
struct Checkpoint {
    archetypes: ArchetypeRegistry,
    locations: EntityLocationIndex,
    next_entity: u64,
}

/// The central ECS container.
pub struct World {
    registry: ComponentRegistry,
    archetypes: ArchetypeRegistry,
    locations: EntityLocationIndex,
    allocator: EntityAllocator,
    store: Box<dyn ColumnStore>,
    checkpoint: Option<Checkpoint>,
    /// Bumped whenever a rollback drops archetypes.
    archetype_generation: u64,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.locations.count())
            .field("archetype_count", &self.archetypes.len())
            .field("registered_components", &self.registry.len())
            .field("durable", &self.store.is_durable())
            .finish()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create an empty world over an in-memory column store.
    pub fn new() -> Self {
        Self::with_store(Box::new(MemoryColumnStore::new()))
    }

    /// Create an empty world over the given column store.
    pub fn with_store(store: Box<dyn ColumnStore>) -> Self {
        Self {
            registry: ComponentRegistry::new(),
            archetypes: ArchetypeRegistry::new(),
            locations: EntityLocationIndex::new(),
            allocator: EntityAllocator::new(),
            store,
            checkpoint: None,
            archetype_generation: 0,
        }
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn archetypes(&self) -> &ArchetypeRegistry {
        &self.archetypes
    }

    /// Changes each time archetype ids are reused after a rollback. Caches
    /// keyed by archetype id must be rebuilt when it moves.
    pub fn archetype_generation(&self) -> u64 {
        self.archetype_generation
    }

    fn save_checkpoint(&mut self) {
        if self.checkpoint.is_none() {
            self.checkpoint = Some(Checkpoint {
                archetypes: self.archetypes.clone(),
                locations: self.locations.clone(),
                next_entity: self.allocator.peek_next(),
            });
        }
    }

    /// Register component type `T` under `name`.
    ///
    /// If the column store already holds a schema for `name` it must equal
    /// `T`'s schema; otherwise `T`'s schema is stored.
    pub fn register_component<T: Component>(
        &mut self,
        name: &str,
    ) -> Result<ComponentTypeId, EcsError> {
        let persisted = self.store.load_schema(name)?;
        let id = self.registry.register::<T>(name, persisted.as_ref())?;
        if persisted.is_none() {
            let schema = ComponentSchema::of::<T>(name)?;
            self.store.store_schema(name, &schema)?;
        }
        tracing::debug!(component = name, id = id.raw(), "registered component");
        Ok(id)
    }

    /// The id of a registered component type.
    pub fn component_id<T: Component>(&self) -> Result<ComponentTypeId, EcsError> {
        self.registry
            .lookup::<T>()
            .ok_or_else(|| self.registry.unknown(std::any::type_name::<T>()))
    }

    fn info<T: Component>(&self) -> Result<&ComponentInfo, EcsError> {
        let id = self.component_id::<T>()?;
        self.info_of(id)
    }

    fn info_of(&self, id: ComponentTypeId) -> Result<&ComponentInfo, EcsError> {
        self.registry
            .get_info(id)
            .ok_or(EcsError::UnknownComponentId(id))
    }

    // -- creation ------------------------------------------------------------

    fn resolve_bundle(
        &self,
        bundle: ComponentBundle,
    ) -> Result<Vec<(ComponentTypeId, Vec<u8>)>, EcsError> {
        let mut values = Vec::with_capacity(bundle.len());
        for pending in bundle.components {
            let id = self
                .registry
                .lookup_type_id(pending.type_id)
                .ok_or_else(|| self.registry.unknown(pending.type_name))?;
            let bytes = pending
                .encoded
                .map_err(|details| EcsError::ComponentSerializationError {
                    component: self.registry.name_of(id),
                    details,
                })?;
            values.push((id, bytes));
        }
        values.sort_by_key(|(id, _)| *id);
        if let Some(pair) = values.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(EcsError::DuplicateInBundle {
                component: self.registry.name_of(pair[0].0),
            });
        }
        if values.is_empty() {
            return Err(EcsError::EntityMustHaveAtLeastOneComponent);
        }
        Ok(values)
    }

    /// Append a row for a fresh entity. `values` is sorted and non-empty.
    fn insert_row(
        &mut self,
        values: Vec<(ComponentTypeId, Vec<u8>)>,
    ) -> Result<EntityId, EcsError> {
        let types: Vec<ComponentTypeId> = values.iter().map(|(id, _)| *id).collect();
        let archetype = self.archetypes.reserve(&types);
        let expected = self.archetypes.row_count(archetype);

        self.save_checkpoint();
        let index = self.store.push_row(archetype, values)?;
        if index != expected {
            return Err(StorageError::Corrupt(format!(
                "archetype {archetype} has {expected} rows but its columns have {index}"
            ))
            .into());
        }

        self.archetypes.get_or_create(&types);
        let entity = self.allocator.allocate();
        self.archetypes.get_mut(archetype)?.push(entity);
        self.locations.insert(entity, Location::new(archetype, index));
        tracing::trace!(%entity, archetype = archetype.raw(), "created entity");
        Ok(entity)
    }

    /// Create an entity with the given component values.
    pub fn create(&mut self, bundle: ComponentBundle) -> Result<EntityId, EcsError> {
        let values = self.resolve_bundle(bundle)?;
        self.insert_row(values)
    }

    /// Create `count` entities sharing the same initial values.
    pub fn create_many(
        &mut self,
        count: usize,
        bundle: ComponentBundle,
    ) -> Result<Vec<EntityId>, EcsError> {
        let values = self.resolve_bundle(bundle)?;
        (0..count).map(|_| self.insert_row(values.clone())).collect()
    }

    /// Create an entity carrying the default value of each listed component.
    pub fn create_default(&mut self, types: &[ComponentTypeId]) -> Result<EntityId, EcsError> {
        let mut types = types.to_vec();
        types.sort_unstable();
        types.dedup();
        if types.is_empty() {
            return Err(EcsError::EntityMustHaveAtLeastOneComponent);
        }
        let values = types
            .into_iter()
            .map(|id| Ok((id, self.info_of(id)?.default_bytes.clone())))
            .collect::<Result<Vec<_>, EcsError>>()?;
        self.insert_row(values)
    }

    // -- removal -------------------------------------------------------------

    /// Remove an entity and all of its component values.
    pub fn remove(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let loc = self.locations.get_location(entity)?;
        let types = self.archetypes.components_of(loc.archetype)?.to_vec();
        self.save_checkpoint();
        self.store.swap_remove_row(loc.archetype, &types, loc.index)?;

        let moved = self.archetypes.get_mut(loc.archetype)?.swap_remove(loc.index);
        self.locations.remove(entity)?;
        if let Some(moved) = moved {
            self.locations.set_location(moved, loc)?;
        }
        tracing::trace!(%entity, "removed entity");
        Ok(())
    }

    // -- component set changes -------------------------------------------------

    /// Move `entity` to the archetype for `dst_types`, discarding `dropped`
    /// and appending `added` in the store.
    fn migrate(
        &mut self,
        entity: EntityId,
        loc: Location,
        dst_types: &[ComponentTypeId],
        dropped: &[ComponentTypeId],
        added: Vec<(ComponentTypeId, Vec<u8>)>,
    ) -> Result<(), EcsError> {
        let src_types = self.archetypes.components_of(loc.archetype)?.to_vec();
        let carried: Vec<ComponentTypeId> = src_types
            .iter()
            .copied()
            .filter(|t| !dropped.contains(t))
            .collect();
        let dst = self.archetypes.reserve(dst_types);
        let expected = self.archetypes.row_count(dst);

        self.save_checkpoint();
        let index = self.store.migrate_row(RowMigration {
            src: loc.archetype,
            index: loc.index,
            dst,
            carried: &carried,
            dropped,
            added,
        })?;
        if index != expected {
            return Err(StorageError::Corrupt(format!(
                "archetype {dst} has {expected} rows but its columns have {index}"
            ))
            .into());
        }

        self.archetypes.get_or_create(dst_types);
        let moved = self.archetypes.get_mut(loc.archetype)?.swap_remove(loc.index);
        if let Some(moved) = moved {
            self.locations.set_location(moved, loc)?;
        }
        self.archetypes.get_mut(dst)?.push(entity);
        self.locations.set_location(entity, Location::new(dst, index))?;
        tracing::trace!(
            %entity,
            from = loc.archetype.raw(),
            to = dst.raw(),
            "migrated entity"
        );
        Ok(())
    }

    fn add_component_bytes(
        &mut self,
        entity: EntityId,
        id: ComponentTypeId,
        bytes: Vec<u8>,
    ) -> Result<(), EcsError> {
        let loc = self.locations.get_location(entity)?;
        let src_types = self.archetypes.components_of(loc.archetype)?;
        if src_types.binary_search(&id).is_ok() {
            return Err(EcsError::ComponentAlreadyOnEntity {
                entity,
                component: self.registry.name_of(id),
            });
        }
        let mut dst_types = src_types.to_vec();
        dst_types.push(id);
        self.migrate(entity, loc, &dst_types, &[], vec![(id, bytes)])
    }

    /// Attach the default value of `T` to an entity.
    pub fn add_component_to<T: Component>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let info = self.info::<T>()?;
        let (id, bytes) = (info.id, info.default_bytes.clone());
        self.add_component_bytes(entity, id, bytes)
    }

    /// Attach `value` to an entity.
    pub fn add_component_with<T: Component>(
        &mut self,
        entity: EntityId,
        value: T,
    ) -> Result<(), EcsError> {
        let info = self.info::<T>()?;
        let id = info.id;
        let bytes = component::encode(&info.name, &value)?;
        self.add_component_bytes(entity, id, bytes)
    }

    /// Detach `T` from an entity, discarding its value.
    ///
    /// Removing an entity's last component is rejected; use
    /// [`remove`](Self::remove) instead.
    pub fn remove_component_from<T: Component>(
        &mut self,
        entity: EntityId,
    ) -> Result<(), EcsError> {
        let id = self.component_id::<T>()?;
        let loc = self.require_component(entity, id)?;
        let src_types = self.archetypes.components_of(loc.archetype)?;
        if src_types.len() == 1 {
            return Err(EcsError::EntityMustHaveAtLeastOneComponent);
        }
        let dst_types: Vec<ComponentTypeId> =
            src_types.iter().copied().filter(|t| *t != id).collect();
        self.migrate(entity, loc, &dst_types, &[id], Vec::new())
    }

    // -- value access ----------------------------------------------------------

    /// Location of an entity that must carry component `id`.
    fn require_component(
        &self,
        entity: EntityId,
        id: ComponentTypeId,
    ) -> Result<Location, EcsError> {
        let loc = self.locations.get_location(entity)?;
        let archetype = self
            .archetypes
            .get(loc.archetype)
            .ok_or(EcsError::UnknownArchetype(loc.archetype))?;
        if !archetype.has_component(id) {
            return Err(EcsError::ComponentNotOnEntity {
                entity,
                component: self.registry.name_of(id),
            });
        }
        Ok(loc)
    }

    /// The encoded value of component `id` on an entity.
    pub fn get_component_raw(
        &self,
        entity: EntityId,
        id: ComponentTypeId,
    ) -> Result<Vec<u8>, EcsError> {
        let loc = self.require_component(entity, id)?;
        Ok(self.store.get(id, loc.archetype, loc.index)?)
    }

    /// Overwrite the encoded value of component `id` on an entity.
    pub fn set_component_raw(
        &mut self,
        entity: EntityId,
        id: ComponentTypeId,
        bytes: Vec<u8>,
    ) -> Result<(), EcsError> {
        let loc = self.require_component(entity, id)?;
        Ok(self.store.set(id, loc.archetype, loc.index, bytes)?)
    }

    pub fn get_component<T: Component>(&self, entity: EntityId) -> Result<T, EcsError> {
        let info = self.info::<T>()?;
        let bytes = self.get_component_raw(entity, info.id)?;
        component::decode(&info.name, &bytes)
    }

    pub fn set_component<T: Component>(
        &mut self,
        entity: EntityId,
        value: T,
    ) -> Result<(), EcsError> {
        let info = self.info::<T>()?;
        let id = info.id;
        let bytes = component::encode(&info.name, &value)?;
        self.set_component_raw(entity, id, bytes)
    }

    /// Read, modify and write back a component value.
    pub fn update_component<T, F>(&mut self, entity: EntityId, f: F) -> Result<(), EcsError>
    where
        T: Component,
        F: FnOnce(&mut T),
    {
        let mut value = self.get_component::<T>(entity)?;
        f(&mut value);
        self.set_component(entity, value)
    }

    /// A component value as JSON, addressed by registered name.
    pub fn get_component_by_name(
        &self,
        entity: EntityId,
        name: &str,
    ) -> Result<serde_json::Value, EcsError> {
        let id = self.registry.get_by_name(name)?.id;
        let bytes = self.get_component_raw(entity, id)?;
        serde_json::from_slice(&bytes).map_err(|e| EcsError::ComponentDeserializationError {
            component: name.to_owned(),
            details: e.to_string(),
        })
    }

    /// Overwrite a component value from JSON, addressed by registered name.
    ///
    /// The value must have the component's schema.
    pub fn set_component_by_name(
        &mut self,
        entity: EntityId,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), EcsError> {
        let info = self.registry.get_by_name(name)?;
        let id = info.id;
        let schema = ComponentSchema::from_value(value);
        if schema != info.schema {
            return Err(EcsError::ComponentSerializationError {
                component: name.to_owned(),
                details: format!("value has schema {schema}, expected {}", info.schema),
            });
        }
        let bytes = serde_json::to_vec(value).map_err(|e| EcsError::ComponentSerializationError {
            component: name.to_owned(),
            details: e.to_string(),
        })?;
        self.set_component_raw(entity, id, bytes)
    }

    pub fn has_component<T: Component>(&self, entity: EntityId) -> Result<bool, EcsError> {
        let id = self.component_id::<T>()?;
        match self.require_component(entity, id) {
            Ok(_) => Ok(true),
            Err(EcsError::ComponentNotOnEntity { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The sorted component set of an entity.
    pub fn components_of(&self, entity: EntityId) -> Result<Vec<ComponentTypeId>, EcsError> {
        let loc = self.locations.get_location(entity)?;
        Ok(self.archetypes.components_of(loc.archetype)?.to_vec())
    }

    pub fn location(&self, entity: EntityId) -> Result<Location, EcsError> {
        self.locations.get_location(entity)
    }

    // -- introspection ---------------------------------------------------------

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.locations.contains(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.locations.count()
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// All live entities, ascending.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.locations.iter().map(|(entity, _)| entity).collect()
    }

    pub fn search(&self, filter: ComponentFilter) -> Search {
        Search::new(filter)
    }

    pub fn search_cql(&self, text: &str) -> Result<Search, EcsError> {
        Search::from_cql(text, &self.registry)
    }

    /// BLAKE3 digest over every archetype, row and component value.
    ///
    /// Two worlds that went through the same operations in the same order
    /// have the same hash.
    pub fn state_hash(&self) -> Result<blake3::Hash, EcsError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.allocator.peek_next().to_le_bytes());
        for archetype in self.archetypes.iter() {
            hasher.update(&archetype.id().raw().to_le_bytes());
            hasher.update(&(archetype.component_types().len() as u64).to_le_bytes());
            for id in archetype.component_types() {
                hasher.update(&id.raw().to_le_bytes());
            }
            for (index, entity) in archetype.entities().iter().enumerate() {
                hasher.update(&entity.to_raw().to_le_bytes());
                for &id in archetype.component_types() {
                    let bytes = self.store.get(id, archetype.id(), index)?;
                    hasher.update(&(bytes.len() as u64).to_le_bytes());
                    hasher.update(&bytes);
                }
            }
        }
        Ok(hasher.finalize())
    }

    /// Verify that the location index, the archetype rows and the column
    /// lengths all agree.
    pub fn check_consistency(&self) -> Result<(), EcsError> {
        let mismatch = |msg: String| Err(EcsError::StateMismatch(msg));
        let mut rows = 0;
        for archetype in self.archetypes.iter() {
            rows += archetype.len();
            for (index, &entity) in archetype.entities().iter().enumerate() {
                let loc = self.locations.get_location(entity)?;
                if loc != Location::new(archetype.id(), index) {
                    return mismatch(format!(
                        "entity {entity} is row {index} of archetype {} but indexed at {loc:?}",
                        archetype.id()
                    ));
                }
            }
            for &id in archetype.component_types() {
                let len = self.store.column_len(id, archetype.id())?;
                if len != archetype.len() {
                    return mismatch(format!(
                        "column {id:?} of archetype {} has {len} values for {} rows",
                        archetype.id(),
                        archetype.len()
                    ));
                }
            }
        }
        if rows != self.locations.count() {
            return mismatch(format!(
                "{rows} archetype rows but {} indexed entities",
                self.locations.count()
            ));
        }
        Ok(())
    }

    // -- persistence -----------------------------------------------------------

    /// Make every change since the last commit permanent, tagged with
    /// `tick` (the number of ticks whose effects are included).
    ///
    /// Only locations that changed are handed to the store. If the store
    /// fails, the world is rolled back to the previous commit.
    pub fn commit(&mut self, tick: u64) -> Result<(), EcsError> {
        let (placed, removed) = self.locations.changes();
        let commit = WorldCommit {
            next_entity: self.allocator.peek_next(),
            archetypes: self
                .archetypes
                .iter()
                .map(|arch| arch.component_types().to_vec())
                .collect(),
            placed,
            removed,
            tick,
        };
        if let Err(err) = self.store.commit(&commit) {
            self.rollback();
            return Err(err.into());
        }
        self.locations.clear_changes();
        self.checkpoint = None;
        tracing::trace!(
            tick,
            placed = commit.placed.len(),
            removed = commit.removed.len(),
            "world committed"
        );
        Ok(())
    }

    /// Undo every change since the last commit.
    pub fn rollback(&mut self) {
        self.store.discard();
        if let Some(checkpoint) = self.checkpoint.take() {
            if checkpoint.archetypes.len() < self.archetypes.len() {
                self.archetype_generation += 1;
            }
            self.archetypes = checkpoint.archetypes;
            self.locations = checkpoint.locations;
            self.allocator.restore(checkpoint.next_entity);
        }
        tracing::debug!(entities = self.locations.count(), "world rolled back");
    }

    /// Whether anything changed since the last commit.
    pub fn has_uncommitted(&self) -> bool {
        self.checkpoint.is_some() || self.locations.has_changes() || self.store.has_pending()
    }

    /// Whether committed state survives a restart.
    pub fn is_durable(&self) -> bool {
        self.store.is_durable()
    }

    /// Record that tick `tick` is starting over the encoded inputs `batch`.
    ///
    /// Changes made outside any tick are committed first, so a rollback of
    /// this tick keeps them.
    pub fn begin_tick(&mut self, tick: u64, batch: &[u8]) -> Result<(), EcsError> {
        if self.has_uncommitted() {
            self.commit(tick)?;
        }
        self.store.begin_tick(tick, batch)?;
        Ok(())
    }

    /// A tick that began but never committed, with the inputs recorded by
    /// [`begin_tick`](Self::begin_tick).
    pub fn pending_tick(&self) -> Result<Option<(u64, Vec<u8>)>, EcsError> {
        Ok(self.store.pending_tick()?)
    }

    /// Restore structural metadata from the column store.
    ///
    /// Must be called after all components are registered and before any
    /// entity is created. Returns the tick of the last commit, or `None` if
    /// the store holds no committed state.
    pub fn load(&mut self) -> Result<Option<u64>, EcsError> {
        let Some(meta) = self.store.load_meta()? else {
            return Ok(None);
        };
        if self.locations.count() > 0 || !self.archetypes.is_empty() {
            return Err(EcsError::StateMismatch(
                "cannot load into a world that already holds entities".into(),
            ));
        }

        let mut archetypes = ArchetypeRegistry::new();
        for (index, types) in meta.archetypes.iter().enumerate() {
            if let Some(unknown) = types.iter().find(|t| self.registry.get_info(**t).is_none()) {
                return Err(EcsError::StateMismatch(format!(
                    "archetype {index} uses unregistered component {unknown:?}"
                )));
            }
            let id = archetypes.get_or_create(types);
            if id.raw() as usize != index {
                return Err(EcsError::StateMismatch(format!(
                    "archetype {index} duplicates archetype {id}"
                )));
            }
        }

        let mut rows = meta.locations.clone();
        rows.sort_by_key(|(_, loc)| (loc.archetype, loc.index));
        let mut locations = EntityLocationIndex::new();
        for (entity, loc) in rows {
            if entity.to_raw() >= meta.next_entity {
                return Err(EcsError::StateMismatch(format!(
                    "entity {entity} is beyond the allocator ({})",
                    meta.next_entity
                )));
            }
            let archetype = archetypes.get_mut(loc.archetype)?;
            if archetype.len() != loc.index {
                return Err(EcsError::StateMismatch(format!(
                    "archetype {} has a gap at row {}",
                    loc.archetype,
                    archetype.len()
                )));
            }
            archetype.push(entity);
            locations.insert(entity, loc);
        }

        for archetype in archetypes.iter() {
            for &id in archetype.component_types() {
                let len = self.store.column_len(id, archetype.id())?;
                if len != archetype.len() {
                    return Err(EcsError::StateMismatch(format!(
                        "column {id:?} of archetype {} has {len} values for {} rows",
                        archetype.id(),
                        archetype.len()
                    )));
                }
            }
        }

        locations.clear_changes();
        self.archetypes = archetypes;
        self.locations = locations;
        self.allocator.restore(meta.next_entity);
        self.checkpoint = None;
        tracing::info!(
            tick = meta.tick,
            entities = self.locations.count(),
            archetypes = self.archetypes.len(),
            "loaded persisted world state"
        );
        Ok(Some(meta.tick))
    }

    /// Id of the archetype an entity currently belongs to.
    pub fn archetype_of(&self, entity: EntityId) -> Result<ArchetypeId, EcsError> {
        Ok(self.locations.get_location(entity)?.archetype)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter;
    use crate::storage::kv::{KvColumnStore, MemoryKv};
    use std::sync::Arc;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health {
        value: i64,
    }

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Name(String);

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Tag;

    fn setup(world: &mut World) {
        world.register_component::<Health>("Health").unwrap();
        world.register_component::<Name>("Name").unwrap();
        world.register_component::<Tag>("Tag").unwrap();
    }

    fn kv_world(kv: &MemoryKv) -> World {
        let mut world = World::with_store(Box::new(KvColumnStore::new(Arc::new(kv.clone()), "w")));
        setup(&mut world);
        world
    }

    // -- 1. creation ---------------------------------------------------------

    #[test]
    fn entity_ids_are_monotonic() {
        let mut world = World::new();
        setup(&mut world);
        let a = world.create(ComponentBundle::new().with(Tag)).unwrap();
        world.remove(a).unwrap();
        let b = world.create(ComponentBundle::new().with(Tag)).unwrap();
        assert_eq!(a.to_raw(), 1);
        assert_eq!(b.to_raw(), 2);
    }

    #[test]
    fn create_rejects_empty_and_duplicate_bundles() {
        let mut world = World::new();
        setup(&mut world);
        assert!(matches!(
            world.create(ComponentBundle::new()),
            Err(EcsError::EntityMustHaveAtLeastOneComponent)
        ));
        assert!(matches!(
            world.create(ComponentBundle::new().with(Tag).with(Tag)),
            Err(EcsError::DuplicateInBundle { .. })
        ));
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn create_with_unregistered_component_fails() {
        #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
        struct Unregistered;

        let mut world = World::new();
        setup(&mut world);
        let err = world
            .create(ComponentBundle::new().with(Unregistered))
            .unwrap_err();
        assert!(matches!(err, EcsError::UnknownComponent { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn create_many_and_defaults() {
        let mut world = World::new();
        setup(&mut world);
        let ids = world
            .create_many(3, ComponentBundle::new().with(Health { value: 5 }))
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(world.archetype_count(), 1);

        let health = world.component_id::<Health>().unwrap();
        let name = world.component_id::<Name>().unwrap();
        let e = world.create_default(&[name, health]).unwrap();
        assert_eq!(world.get_component::<Health>(e).unwrap(), Health::default());
        assert_eq!(world.get_component::<Name>(e).unwrap(), Name::default());
    }

    // -- 2. swap-remove ------------------------------------------------------

    #[test]
    fn remove_relocates_last_row() {
        let mut world = World::new();
        setup(&mut world);
        let ids: Vec<EntityId> = (0..3)
            .map(|i| {
                world
                    .create(ComponentBundle::new().with(Health { value: i }))
                    .unwrap()
            })
            .collect();

        world.remove(ids[0]).unwrap();

        let loc = world.location(ids[2]).unwrap();
        assert_eq!(loc.index, 0);
        assert_eq!(world.get_component::<Health>(ids[2]).unwrap().value, 2);
        assert_eq!(world.get_component::<Health>(ids[1]).unwrap().value, 1);
        assert!(!world.is_alive(ids[0]));
        world.check_consistency().unwrap();

        assert!(matches!(
            world.remove(ids[0]),
            Err(EcsError::EntityNotFound(_))
        ));
    }

    // -- 3. migration --------------------------------------------------------

    #[test]
    fn add_and_remove_components() {
        let mut world = World::new();
        setup(&mut world);
        let other = world
            .create(ComponentBundle::new().with(Health { value: 1 }))
            .unwrap();
        let e = world
            .create(ComponentBundle::new().with(Health { value: 2 }))
            .unwrap();

        world
            .add_component_with(e, Name("hero".into()))
            .unwrap();
        assert_eq!(world.get_component::<Name>(e).unwrap(), Name("hero".into()));
        assert_eq!(world.get_component::<Health>(e).unwrap().value, 2);

        assert!(matches!(
            world.add_component_to::<Name>(e),
            Err(EcsError::ComponentAlreadyOnEntity { .. })
        ));

        world.remove_component_from::<Health>(e).unwrap();
        assert!(!world.has_component::<Health>(e).unwrap());
        assert!(matches!(
            world.remove_component_from::<Health>(e),
            Err(EcsError::ComponentNotOnEntity { .. })
        ));
        assert!(matches!(
            world.remove_component_from::<Name>(e),
            Err(EcsError::EntityMustHaveAtLeastOneComponent)
        ));

        assert_eq!(world.get_component::<Health>(other).unwrap().value, 1);
        world.check_consistency().unwrap();
    }

    #[test]
    fn set_and_update_component() {
        let mut world = World::new();
        setup(&mut world);
        let e = world.create(ComponentBundle::new().with(Health::default())).unwrap();

        world.set_component(e, Health { value: 10 }).unwrap();
        world
            .update_component::<Health, _>(e, |h| h.value -= 3)
            .unwrap();
        assert_eq!(world.get_component::<Health>(e).unwrap().value, 7);

        assert!(matches!(
            world.set_component(e, Name("x".into())),
            Err(EcsError::ComponentNotOnEntity { .. })
        ));
    }

    #[test]
    fn by_name_access_checks_schema() {
        let mut world = World::new();
        setup(&mut world);
        let e = world.create(ComponentBundle::new().with(Health { value: 4 })).unwrap();

        assert_eq!(
            world.get_component_by_name(e, "Health").unwrap(),
            serde_json::json!({ "value": 4 })
        );
        world
            .set_component_by_name(e, "Health", &serde_json::json!({ "value": 9 }))
            .unwrap();
        assert_eq!(world.get_component::<Health>(e).unwrap().value, 9);

        let err = world
            .set_component_by_name(e, "Health", &serde_json::json!({ "hp": 9 }))
            .unwrap_err();
        assert!(matches!(err, EcsError::ComponentSerializationError { .. }));
        assert!(matches!(
            world.get_component_by_name(e, "Mana"),
            Err(EcsError::UnknownComponent { .. })
        ));
    }

    // -- 4. hashing ----------------------------------------------------------

    #[test]
    fn state_hash_tracks_values() {
        let build = |value: i64| {
            let mut world = World::new();
            setup(&mut world);
            world
                .create(ComponentBundle::new().with(Health { value }).with(Tag))
                .unwrap();
            world.state_hash().unwrap()
        };
        assert_eq!(build(1), build(1));
        assert_ne!(build(1), build(2));
    }

    // -- 5. durable store ----------------------------------------------------

    #[test]
    fn kv_world_reloads_committed_state() {
        let kv = MemoryKv::new();
        let mut world = kv_world(&kv);
        let a = world.create(ComponentBundle::new().with(Health { value: 3 })).unwrap();
        let b = world
            .create(ComponentBundle::new().with(Health { value: 4 }).with(Tag))
            .unwrap();
        world.remove(a).unwrap();
        world.commit(12).unwrap();
        let hash = world.state_hash().unwrap();

        let mut reopened = kv_world(&kv);
        assert_eq!(reopened.load().unwrap(), Some(12));
        assert_eq!(reopened.state_hash().unwrap(), hash);
        assert_eq!(reopened.get_component::<Health>(b).unwrap().value, 4);
        reopened.check_consistency().unwrap();

        let c = reopened.create(ComponentBundle::new().with(Tag)).unwrap();
        assert_eq!(c.to_raw(), 3);
    }

    #[test]
    fn kv_world_rejects_changed_schema() {
        #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
        struct HealthV2 {
            value: i64,
            max: i64,
        }

        let kv = MemoryKv::new();
        let _world = kv_world(&kv);

        let mut world = World::with_store(Box::new(KvColumnStore::new(Arc::new(kv), "w")));
        let err = world.register_component::<HealthV2>("Health").unwrap_err();
        assert!(matches!(err, EcsError::SchemaMismatch { .. }));
    }

    #[test]
    fn backend_failure_leaves_world_unchanged() {
        let kv = MemoryKv::new();
        let mut world = kv_world(&kv);
        let e = world.create(ComponentBundle::new().with(Health { value: 1 })).unwrap();
        world.commit(1).unwrap();
        let before = world.state_hash().unwrap();

        kv.set_available(false);
        let err = world.add_component_to::<Tag>(e).unwrap_err();
        assert!(err.is_fatal());
        // The removal is staged in process; the commit cannot land it.
        world.remove(e).unwrap();
        assert!(world.commit(2).unwrap_err().is_fatal());
        kv.set_available(true);

        assert!(world.is_alive(e));
        assert_eq!(world.state_hash().unwrap(), before);
        assert_eq!(world.components_of(e).unwrap().len(), 1);
        world.check_consistency().unwrap();
    }

    // -- 6. rollback ---------------------------------------------------------

    #[test]
    fn rollback_restores_the_last_commit() {
        let mut world = World::new();
        setup(&mut world);
        let a = world.create(ComponentBundle::new().with(Health { value: 1 })).unwrap();
        let b = world.create(ComponentBundle::new().with(Health { value: 2 })).unwrap();
        world.commit(1).unwrap();
        let before = world.state_hash().unwrap();
        assert!(!world.has_uncommitted());

        world.set_component(a, Health { value: 50 }).unwrap();
        world.add_component_to::<Tag>(b).unwrap();
        world.remove(a).unwrap();
        world.create(ComponentBundle::new().with(Name("new".into()))).unwrap();
        assert!(world.has_uncommitted());

        world.rollback();
        assert!(!world.has_uncommitted());
        assert_eq!(world.state_hash().unwrap(), before);
        assert_eq!(world.get_component::<Health>(a).unwrap().value, 1);
        assert_eq!(world.components_of(b).unwrap().len(), 1);
        assert_eq!(world.archetype_count(), 1);
        world.check_consistency().unwrap();

        // Ids handed out by the discarded work are handed out again.
        let c = world.create(ComponentBundle::new().with(Tag)).unwrap();
        assert_eq!(c.to_raw(), 3);
    }

    #[test]
    fn value_only_rollback_keeps_archetype_generation() {
        let mut world = World::new();
        setup(&mut world);
        let a = world.create(ComponentBundle::new().with(Health { value: 1 })).unwrap();
        world.commit(1).unwrap();

        world.set_component(a, Health { value: 9 }).unwrap();
        world.rollback();
        assert_eq!(world.get_component::<Health>(a).unwrap().value, 1);
        assert_eq!(world.archetype_generation(), 0);

        world.create(ComponentBundle::new().with(Tag)).unwrap();
        world.rollback();
        assert_eq!(world.archetype_generation(), 1);
    }

    #[test]
    fn uncommitted_kv_changes_never_reload() {
        let kv = MemoryKv::new();
        let mut world = kv_world(&kv);
        let a = world.create(ComponentBundle::new().with(Health { value: 1 })).unwrap();
        world.commit(1).unwrap();
        let committed = world.state_hash().unwrap();

        world.update_component::<Health, _>(a, |h| h.value += 7).unwrap();
        world.create(ComponentBundle::new().with(Tag)).unwrap();
        drop(world);

        let mut reopened = kv_world(&kv);
        assert_eq!(reopened.load().unwrap(), Some(1));
        assert_eq!(reopened.state_hash().unwrap(), committed);
        assert_eq!(reopened.get_component::<Health>(a).unwrap().value, 1);
    }

    #[test]
    fn incremental_commits_reload_moved_and_removed_entities() {
        let kv = MemoryKv::new();
        let mut world = kv_world(&kv);
        let ids = world
            .create_many(4, ComponentBundle::new().with(Health { value: 1 }))
            .unwrap();
        world.commit(1).unwrap();

        world.remove(ids[0]).unwrap();
        world.add_component_to::<Tag>(ids[2]).unwrap();
        world.commit(2).unwrap();
        world.remove(ids[3]).unwrap();
        world.commit(3).unwrap();
        let hash = world.state_hash().unwrap();

        let mut reopened = kv_world(&kv);
        assert_eq!(reopened.load().unwrap(), Some(3));
        assert_eq!(reopened.state_hash().unwrap(), hash);
        assert_eq!(reopened.entity_ids(), vec![ids[1], ids[2]]);
        reopened.check_consistency().unwrap();
    }

    #[test]
    fn begin_tick_commits_outside_work_and_marks_the_tick() {
        let kv = MemoryKv::new();
        let mut world = kv_world(&kv);
        let a = world.create(ComponentBundle::new().with(Health { value: 1 })).unwrap();

        world.begin_tick(0, b"inputs").unwrap();
        assert!(!world.has_uncommitted());
        assert_eq!(world.pending_tick().unwrap(), Some((0, b"inputs".to_vec())));

        world.remove(a).unwrap();
        world.rollback();
        assert!(world.is_alive(a));

        world.commit(1).unwrap();
        assert_eq!(world.pending_tick().unwrap(), None);
    }

    #[test]
    fn search_helpers() {
        let mut world = World::new();
        setup(&mut world);
        world.create(ComponentBundle::new().with(Tag)).unwrap();
        let tag = world.component_id::<Tag>().unwrap();
        assert_eq!(world.search(filter::exact([tag])).count(&world).unwrap(), 1);
        assert_eq!(world.search_cql("ALL()").unwrap().count(&world).unwrap(), 1);
    }
}
