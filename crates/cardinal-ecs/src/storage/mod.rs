//! Column storage for component values.
//!
//! A [`ColumnStore`] holds one column per `(component type, archetype)` pair.
//! Each column is a dense list of encoded values whose index matches the row
//! index in the owning [`Archetype`](crate::archetype::Archetype). The store
//! knows nothing about entities; the [`World`](crate::world::World) drives
//! it so that every column of an archetype always has exactly as many values
//! as the archetype has rows.
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::MemoryColumnStore`]: plain `Vec`s, nothing survives a restart.
//! - [`kv::KvColumnStore`]: columns as lists in a [`kv::KvBackend`], with
//!   world metadata persisted on every commit so a restarted process can
//!   resume from the last committed tick.
//!
//! Writes are pending until [`ColumnStore::commit`]. Both stores can drop
//! everything written since the last commit with [`ColumnStore::discard`],
//! which is how a failed tick leaves no trace.

pub mod kv;
pub mod memory;

use serde::{Deserialize, Serialize};

use crate::archetype::ArchetypeId;
use crate::component::{ComponentSchema, ComponentTypeId};
use crate::entity::{EntityId, Location};

/// Failures raised by a [`ColumnStore`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No value stored at `(component, archetype, index)`.
    #[error("no value for component {component:?} in archetype {archetype} at index {index}")]
    MissingValue {
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    },

    /// The backing key-value store failed.
    #[error("kv backend error: {0}")]
    Backend(#[from] kv::KvError),

    /// Stored data is inconsistent or cannot be decoded.
    #[error("corrupt storage: {0}")]
    Corrupt(String),
}

/// A whole-row move between archetypes, applied atomically by
/// [`ColumnStore::migrate_row`].
#[derive(Debug, Clone)]
pub struct RowMigration<'a> {
    /// Archetype the row leaves.
    pub src: ArchetypeId,
    /// Row index in `src`.
    pub index: usize,
    /// Archetype the row joins.
    pub dst: ArchetypeId,
    /// Components present in both archetypes; their values move.
    pub carried: &'a [ComponentTypeId],
    /// Components only in `src`; their values are discarded.
    pub dropped: &'a [ComponentTypeId],
    /// Components only in `dst`, with their initial encoded values.
    pub added: Vec<(ComponentTypeId, Vec<u8>)>,
}

/// Structural state of a world as loaded from a durable store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldMeta {
    /// Next id the entity allocator will hand out.
    pub next_entity: u64,
    /// Component set of each archetype, indexed by archetype id.
    pub archetypes: Vec<Vec<ComponentTypeId>>,
    /// Location of every live entity.
    pub locations: Vec<(EntityId, Location)>,
    /// Last tick whose effects are included.
    pub tick: u64,
}

/// What changed structurally since the previous commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorldCommit {
    pub next_entity: u64,
    /// Component set of each archetype, indexed by archetype id.
    pub archetypes: Vec<Vec<ComponentTypeId>>,
    /// Entities created or moved since the previous commit.
    pub placed: Vec<(EntityId, Location)>,
    /// Entities removed since the previous commit.
    pub removed: Vec<EntityId>,
    pub tick: u64,
}

/// Storage for encoded component values.
///
/// Single-column operations are building blocks; the row-level operations
/// (`push_row`, `swap_remove_row`, `migrate_row`) are what the world uses,
/// and each of them must either apply completely or leave the store
/// untouched.
///
/// Column writes stay pending until [`commit`](Self::commit) and are
/// dropped by [`discard`](Self::discard). Reads always see pending writes.
pub trait ColumnStore: Send {
    /// Append a value to a column, returning its index.
    fn push(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        value: Vec<u8>,
    ) -> Result<usize, StorageError>;

    fn get(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<Vec<u8>, StorageError>;

    /// Overwrite an existing value.
    fn set(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
        value: Vec<u8>,
    ) -> Result<(), StorageError>;

    /// Remove the value at `index` by moving the column's last value into
    /// its slot. Returns the removed value.
    fn swap_remove(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<Vec<u8>, StorageError>;

    /// Swap-remove a value from `src` and append it to `dst`'s column,
    /// returning its new index.
    fn move_value(
        &mut self,
        component: ComponentTypeId,
        src: ArchetypeId,
        index: usize,
        dst: ArchetypeId,
    ) -> Result<usize, StorageError>;

    fn contains(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<bool, StorageError>;

    fn column_len(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
    ) -> Result<usize, StorageError>;

    /// Append one value per component of a new row. Returns the row index.
    fn push_row(
        &mut self,
        archetype: ArchetypeId,
        values: Vec<(ComponentTypeId, Vec<u8>)>,
    ) -> Result<usize, StorageError>;

    /// Swap-remove row `index` from every listed column.
    fn swap_remove_row(
        &mut self,
        archetype: ArchetypeId,
        components: &[ComponentTypeId],
        index: usize,
    ) -> Result<(), StorageError>;

    /// Move a row between archetypes. Returns the row index in `dst`.
    fn migrate_row(&mut self, migration: RowMigration<'_>) -> Result<usize, StorageError>;

    /// The schema previously stored for a component name, if any.
    fn load_schema(&self, _name: &str) -> Result<Option<ComponentSchema>, StorageError> {
        Ok(None)
    }

    fn store_schema(&mut self, _name: &str, _schema: &ComponentSchema) -> Result<(), StorageError> {
        Ok(())
    }

    /// Make every pending write permanent, together with the structural
    /// changes in `commit`. Either all of it lands or none of it does; after
    /// a failure the caller must [`discard`](Self::discard).
    fn commit(&mut self, commit: &WorldCommit) -> Result<(), StorageError>;

    /// Drop every write made since the last commit.
    fn discard(&mut self);

    /// Whether any column write is waiting for a commit.
    fn has_pending(&self) -> bool;

    /// Record that tick `tick` is about to run over `batch`, an opaque
    /// encoding of its inputs. The record is cleared by the next commit.
    fn begin_tick(&mut self, _tick: u64, _batch: &[u8]) -> Result<(), StorageError> {
        Ok(())
    }

    /// The tick that began but never committed, with its recorded inputs.
    fn pending_tick(&self) -> Result<Option<(u64, Vec<u8>)>, StorageError> {
        Ok(None)
    }

    /// Metadata from the last commit, if the store has any.
    fn load_meta(&self) -> Result<Option<WorldMeta>, StorageError> {
        Ok(None)
    }

    /// Whether committed state survives a restart.
    fn is_durable(&self) -> bool {
        false
    }
}

/// Every value a row migration must read before it writes anything.
pub(crate) fn migration_sources(migration: &RowMigration<'_>) -> Vec<ComponentTypeId> {
    migration
        .carried
        .iter()
        .chain(migration.dropped)
        .copied()
        .collect()
}

/// Any one component of the destination archetype, used to read its length.
pub(crate) fn migration_witness(migration: &RowMigration<'_>) -> Option<ComponentTypeId> {
    migration
        .carried
        .first()
        .copied()
        .or_else(|| migration.added.first().map(|(c, _)| *c))
}
