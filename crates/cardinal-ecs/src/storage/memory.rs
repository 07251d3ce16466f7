//! In-process column store.

use std::collections::HashMap;

use super::{
    migration_sources, migration_witness, ColumnStore, RowMigration, StorageError, WorldCommit,
};
use crate::archetype::ArchetypeId;
use crate::component::{ComponentSchema, ComponentTypeId};

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// A densely packed list of encoded values for one component in one
/// archetype.
#[derive(Debug, Clone, Default)]
pub struct Column {
    values: Vec<Vec<u8>>,
}

impl Column {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn push(&mut self, value: Vec<u8>) -> usize {
        self.values.push(value);
        self.values.len() - 1
    }

    fn get(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).map(Vec::as_slice)
    }

    fn swap_remove(&mut self, index: usize) -> Option<Vec<u8>> {
        (index < self.values.len()).then(|| self.values.swap_remove(index))
    }
}

// ---------------------------------------------------------------------------
// MemoryColumnStore
// ---------------------------------------------------------------------------

/// [`ColumnStore`] backed by plain vectors.
///
/// Columns are grouped per component type, then indexed by archetype id.
/// The first write to a column after a commit saves a copy of it, and
/// [`discard`](ColumnStore::discard) puts those copies back.
#[derive(Debug, Default)]
pub struct MemoryColumnStore {
    columns: HashMap<ComponentTypeId, Vec<Column>>,
    schemas: HashMap<String, ComponentSchema>,
    /// Column contents as of the last commit, for columns written since.
    undo: HashMap<(ComponentTypeId, ArchetypeId), Column>,
}

impl MemoryColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn column(&self, component: ComponentTypeId, archetype: ArchetypeId) -> Option<&Column> {
        self.columns
            .get(&component)?
            .get(archetype.raw() as usize)
    }

    fn column_mut(&mut self, component: ComponentTypeId, archetype: ArchetypeId) -> &mut Column {
        if !self.undo.contains_key(&(component, archetype)) {
            let saved = self.column(component, archetype).cloned().unwrap_or_default();
            self.undo.insert((component, archetype), saved);
        }
        self.slot_mut(component, archetype)
    }

    fn slot_mut(&mut self, component: ComponentTypeId, archetype: ArchetypeId) -> &mut Column {
        let per_archetype = self.columns.entry(component).or_default();
        let slot = archetype.raw() as usize;
        if slot >= per_archetype.len() {
            per_archetype.resize_with(slot + 1, Column::default);
        }
        &mut per_archetype[slot]
    }

    fn require(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<(), StorageError> {
        if self.contains(component, archetype, index)? {
            Ok(())
        } else {
            Err(StorageError::MissingValue {
                component,
                archetype,
                index,
            })
        }
    }
}

impl ColumnStore for MemoryColumnStore {
    fn push(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        value: Vec<u8>,
    ) -> Result<usize, StorageError> {
        Ok(self.column_mut(component, archetype).push(value))
    }

    fn get(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<Vec<u8>, StorageError> {
        self.column(component, archetype)
            .and_then(|col| col.get(index))
            .map(<[u8]>::to_vec)
            .ok_or(StorageError::MissingValue {
                component,
                archetype,
                index,
            })
    }

    fn set(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
        value: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.require(component, archetype, index)?;
        self.column_mut(component, archetype).values[index] = value;
        Ok(())
    }

    fn swap_remove(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<Vec<u8>, StorageError> {
        self.require(component, archetype, index)?;
        self.column_mut(component, archetype)
            .swap_remove(index)
            .ok_or(StorageError::MissingValue {
                component,
                archetype,
                index,
            })
    }

    fn move_value(
        &mut self,
        component: ComponentTypeId,
        src: ArchetypeId,
        index: usize,
        dst: ArchetypeId,
    ) -> Result<usize, StorageError> {
        let value = self.swap_remove(component, src, index)?;
        Ok(self.column_mut(component, dst).push(value))
    }

    fn contains(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<bool, StorageError> {
        Ok(self
            .column(component, archetype)
            .is_some_and(|col| index < col.len()))
    }

    fn column_len(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
    ) -> Result<usize, StorageError> {
        Ok(self.column(component, archetype).map_or(0, Column::len))
    }

    fn push_row(
        &mut self,
        archetype: ArchetypeId,
        values: Vec<(ComponentTypeId, Vec<u8>)>,
    ) -> Result<usize, StorageError> {
        let Some(&(first, _)) = values.first() else {
            return Err(StorageError::Corrupt("cannot push an empty row".into()));
        };
        let row = self.column_len(first, archetype)?;
        for (component, _) in &values {
            let len = self.column_len(*component, archetype)?;
            if len != row {
                return Err(StorageError::Corrupt(format!(
                    "archetype {archetype} columns disagree on length ({len} != {row})"
                )));
            }
        }
        for (component, value) in values {
            self.column_mut(component, archetype).push(value);
        }
        Ok(row)
    }

    fn swap_remove_row(
        &mut self,
        archetype: ArchetypeId,
        components: &[ComponentTypeId],
        index: usize,
    ) -> Result<(), StorageError> {
        for component in components {
            self.require(*component, archetype, index)?;
        }
        for component in components {
            self.swap_remove(*component, archetype, index)?;
        }
        Ok(())
    }

    fn migrate_row(&mut self, migration: RowMigration<'_>) -> Result<usize, StorageError> {
        for component in migration_sources(&migration) {
            self.require(component, migration.src, migration.index)?;
        }
        let witness = migration_witness(&migration)
            .ok_or_else(|| StorageError::Corrupt("migration leaves an empty row".into()))?;
        let row = self.column_len(witness, migration.dst)?;

        for component in migration.carried {
            self.move_value(*component, migration.src, migration.index, migration.dst)?;
        }
        for component in migration.dropped {
            self.swap_remove(*component, migration.src, migration.index)?;
        }
        for (component, value) in migration.added {
            self.column_mut(component, migration.dst).push(value);
        }
        Ok(row)
    }

    fn load_schema(&self, name: &str) -> Result<Option<ComponentSchema>, StorageError> {
        Ok(self.schemas.get(name).cloned())
    }

    fn store_schema(&mut self, name: &str, schema: &ComponentSchema) -> Result<(), StorageError> {
        self.schemas.insert(name.to_owned(), schema.clone());
        Ok(())
    }

    fn commit(&mut self, _commit: &WorldCommit) -> Result<(), StorageError> {
        self.undo.clear();
        Ok(())
    }

    fn discard(&mut self) {
        let saved: Vec<_> = self.undo.drain().collect();
        for ((component, archetype), column) in saved {
            *self.slot_mut(component, archetype) = column;
        }
    }

    fn has_pending(&self) -> bool {
        !self.undo.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
