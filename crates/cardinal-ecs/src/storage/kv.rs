//! Key-value backed column store.
//!
//! [`KvBackend`] models the small subset of a Redis-like server the engine
//! needs: strings, lists, hashes and sorted sets, plus an atomic multi-write
//! [`exec`](KvBackend::exec). [`MemoryKv`] is an in-process implementation
//! that can be cloned and shared; clones see the same data, which is how
//! tests simulate a process restart against the same database.
//!
//! Key layout used by [`KvColumnStore`] under a namespace `ns`:
//!
//! | key                          | type   | contents                          |
//! |------------------------------|--------|-----------------------------------|
//! | `ns:col:{component}:{arch}`  | list   | encoded values, one per row       |
//! | `ns:schema`                  | hash   | component name -> schema JSON     |
//! | `ns:meta`                    | string | allocator, archetypes, tick       |
//! | `ns:loc`                     | hash   | entity id -> location JSON        |
//! | `ns:tick:start`              | string | tick that began but not committed |
//! | `ns:pending`                 | string | that tick's encoded inputs        |

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::{
    migration_sources, migration_witness, ColumnStore, RowMigration, StorageError, WorldCommit,
    WorldMeta,
};
use crate::archetype::ArchetypeId;
use crate::component::{ComponentSchema, ComponentTypeId};
use crate::entity::{EntityId, Location};

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Failures raised by a [`KvBackend`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("index {index} out of range for list '{key}'")]
    IndexOutOfRange { key: String, index: usize },

    #[error("pop from empty list '{0}'")]
    EmptyList(String),
}

/// A single write inside an [`exec`](KvBackend::exec) batch.
#[derive(Debug, Clone, PartialEq)]
pub enum KvWrite {
    Set { key: String, value: Vec<u8> },
    Del { key: String },
    ListPush { key: String, value: Vec<u8> },
    ListSet { key: String, index: usize, value: Vec<u8> },
    ListPop { key: String },
    HashSet { key: String, field: String, value: Vec<u8> },
    HashDel { key: String, field: String },
}

/// Redis-shaped key-value operations.
///
/// Implementations must be safe to share across threads. `exec` applies all
/// writes or none of them.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    fn list_len(&self, key: &str) -> Result<usize, KvError>;

    fn list_get(&self, key: &str, index: usize) -> Result<Option<Vec<u8>>, KvError>;

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// All fields of a hash, sorted by field name.
    fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, KvError>;

    /// Add `member` with `score`. Returns `true` if the member was new.
    fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, KvError>;

    /// Member with the highest score.
    fn zmax(&self, key: &str) -> Result<Option<(String, f64)>, KvError>;

    fn zcard(&self, key: &str) -> Result<usize, KvError>;

    /// Remove members with `min <= score <= max`. Returns how many were removed.
    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<usize, KvError>;

    /// Apply a batch of writes atomically.
    fn exec(&self, batch: Vec<KvWrite>) -> Result<(), KvError>;
}

// ---------------------------------------------------------------------------
// MemoryKv
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct KvState {
    available: bool,
    strings: HashMap<String, Vec<u8>>,
    lists: HashMap<String, Vec<Vec<u8>>>,
    hashes: HashMap<String, BTreeMap<String, Vec<u8>>>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

/// In-process [`KvBackend`]. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct MemoryKv {
    inner: Arc<Mutex<KvState>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(KvState {
                available: true,
                ..KvState::default()
            })),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        match self.inner.lock() {
            Ok(mut state) => state.available = available,
            Err(poisoned) => poisoned.into_inner().available = available,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, KvState>, KvError> {
        let state = self
            .inner
            .lock()
            .map_err(|_| KvError::Unavailable("state lock poisoned".into()))?;
        if !state.available {
            return Err(KvError::Unavailable("backend marked unavailable".into()));
        }
        Ok(state)
    }
}

impl KvBackend for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.state()?.strings.get(key).cloned())
    }

    fn list_len(&self, key: &str) -> Result<usize, KvError> {
        Ok(self.state()?.lists.get(key).map_or(0, Vec::len))
    }

    fn list_get(&self, key: &str, index: usize) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .state()?
            .lists
            .get(key)
            .and_then(|list| list.get(index))
            .cloned())
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .state()?
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        Ok(self
            .state()?
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, KvError> {
        let mut state = self.state()?;
        let set = state.zsets.entry(key.to_owned()).or_default();
        Ok(set.insert(member.to_owned(), score).is_none())
    }

    fn zmax(&self, key: &str) -> Result<Option<(String, f64)>, KvError> {
        Ok(self.state()?.zsets.get(key).and_then(|set| {
            set.iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(member, score)| (member.clone(), *score))
        }))
    }

    fn zcard(&self, key: &str) -> Result<usize, KvError> {
        Ok(self.state()?.zsets.get(key).map_or(0, HashMap::len))
    }

    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<usize, KvError> {
        let mut state = self.state()?;
        let Some(set) = state.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, score| *score < min || *score > max);
        Ok(before - set.len())
    }

    fn exec(&self, batch: Vec<KvWrite>) -> Result<(), KvError> {
        let mut state = self.state()?;

        // Stage every touched list so a failing write leaves nothing behind.
        let mut staged: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        for write in &batch {
            let key = match write {
                KvWrite::ListPush { key, .. }
                | KvWrite::ListSet { key, .. }
                | KvWrite::ListPop { key }
                | KvWrite::Del { key } => key,
                _ => continue,
            };
            if !staged.contains_key(key) {
                let current = state.lists.get(key).cloned().unwrap_or_default();
                staged.insert(key.clone(), current);
            }
        }

        let mut other = Vec::new();
        for write in batch {
            match write {
                KvWrite::ListPush { key, value } => {
                    staged.entry(key).or_default().push(value);
                }
                KvWrite::ListSet { key, index, value } => {
                    let slot = staged
                        .get_mut(&key)
                        .and_then(|list| list.get_mut(index))
                        .ok_or_else(|| KvError::IndexOutOfRange {
                            key: key.clone(),
                            index,
                        })?;
                    *slot = value;
                }
                KvWrite::ListPop { key } => {
                    staged
                        .get_mut(&key)
                        .and_then(Vec::pop)
                        .ok_or_else(|| KvError::EmptyList(key.clone()))?;
                }
                KvWrite::Del { key } => {
                    staged.insert(key.clone(), Vec::new());
                    other.push(KvWrite::Del { key });
                }
                write => other.push(write),
            }
        }

        for (key, list) in staged {
            if list.is_empty() {
                state.lists.remove(&key);
            } else {
                state.lists.insert(key, list);
            }
        }
        for write in other {
            match write {
                KvWrite::Set { key, value } => {
                    state.strings.insert(key, value);
                }
                KvWrite::HashSet { key, field, value } => {
                    state.hashes.entry(key).or_default().insert(field, value);
                }
                KvWrite::HashDel { key, field } => {
                    if let Some(hash) = state.hashes.get_mut(&key) {
                        hash.remove(&field);
                        if hash.is_empty() {
                            state.hashes.remove(&key);
                        }
                    }
                }
                KvWrite::Del { key } => {
                    state.strings.remove(&key);
                    state.hashes.remove(&key);
                    state.zsets.remove(&key);
                }
                KvWrite::ListPush { .. } | KvWrite::ListSet { .. } | KvWrite::ListPop { .. } => {}
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KvColumnStore
// ---------------------------------------------------------------------------

/// The persisted part of [`WorldMeta`] that is not the location table.
#[derive(Debug, Serialize, Deserialize)]
struct MetaHeader {
    next_entity: u64,
    archetypes: Vec<Vec<ComponentTypeId>>,
    tick: u64,
}

/// A column list as the current tick sees it: the committed list, cut to
/// `len`, with `values` laid over it.
#[derive(Debug, Default)]
struct StagedList {
    len: usize,
    values: HashMap<usize, Vec<u8>>,
}

/// [`ColumnStore`] over a [`KvBackend`].
///
/// Column writes are staged in process and replayed against the backend in
/// the single `exec` batch that [`commit`](ColumnStore::commit) issues,
/// together with the world metadata, the changed locations and the removal
/// of the tick-in-progress record. A crash or a failed tick therefore never
/// leaves part of a tick in the backend.
pub struct KvColumnStore {
    kv: Arc<dyn KvBackend>,
    namespace: String,
    staged: HashMap<String, StagedList>,
    /// List writes since the last commit, in order.
    writes: Vec<KvWrite>,
}

impl KvColumnStore {
    pub fn new(kv: Arc<dyn KvBackend>, namespace: impl Into<String>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
            staged: HashMap::new(),
            writes: Vec::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn column_key(&self, component: ComponentTypeId, archetype: ArchetypeId) -> String {
        format!(
            "{}:col:{}:{}",
            self.namespace,
            component.raw(),
            archetype.raw()
        )
    }

    fn schema_key(&self) -> String {
        format!("{}:schema", self.namespace)
    }

    fn meta_key(&self) -> String {
        format!("{}:meta", self.namespace)
    }

    fn location_key(&self) -> String {
        format!("{}:loc", self.namespace)
    }

    fn tick_start_key(&self) -> String {
        format!("{}:tick:start", self.namespace)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.namespace)
    }

    fn list_len(&self, key: &str) -> Result<usize, StorageError> {
        match self.staged.get(key) {
            Some(list) => Ok(list.len),
            None => Ok(self.kv.list_len(key)?),
        }
    }

    fn list_get(&self, key: &str, index: usize) -> Result<Option<Vec<u8>>, StorageError> {
        match self.staged.get(key) {
            Some(list) if index >= list.len => Ok(None),
            Some(list) => match list.values.get(&index) {
                Some(value) => Ok(Some(value.clone())),
                None => Ok(self.kv.list_get(key, index)?),
            },
            None => Ok(self.kv.list_get(key, index)?),
        }
    }

    /// Apply a batch of list writes to the staged view.
    ///
    /// The whole batch is checked against the current lengths before
    /// anything is staged.
    fn stage(&mut self, batch: Vec<KvWrite>) -> Result<(), StorageError> {
        // Current length of every touched list, then its length after the batch.
        let mut current: HashMap<String, usize> = HashMap::new();
        let mut after: HashMap<String, usize> = HashMap::new();
        for write in &batch {
            let key = match write {
                KvWrite::ListPush { key, .. }
                | KvWrite::ListSet { key, .. }
                | KvWrite::ListPop { key } => key,
                other => {
                    return Err(StorageError::Corrupt(format!(
                        "cannot stage {other:?}"
                    )))
                }
            };
            if !current.contains_key(key) {
                let len = self.list_len(key)?;
                current.insert(key.clone(), len);
                after.insert(key.clone(), len);
            }
            let len = after.entry(key.clone()).or_default();
            match write {
                KvWrite::ListPush { .. } => *len += 1,
                KvWrite::ListSet { index, .. } if *index < *len => {}
                KvWrite::ListSet { index, .. } => {
                    return Err(KvError::IndexOutOfRange {
                        key: key.clone(),
                        index: *index,
                    }
                    .into())
                }
                _ if *len > 0 => *len -= 1,
                _ => return Err(KvError::EmptyList(key.clone()).into()),
            }
        }

        for (key, len) in current {
            self.staged.entry(key).or_insert_with(|| StagedList {
                len,
                values: HashMap::new(),
            });
        }
        for write in &batch {
            match write {
                KvWrite::ListPush { key, value } => {
                    if let Some(list) = self.staged.get_mut(key) {
                        list.values.insert(list.len, value.clone());
                        list.len += 1;
                    }
                }
                KvWrite::ListSet { key, index, value } => {
                    if let Some(list) = self.staged.get_mut(key) {
                        list.values.insert(*index, value.clone());
                    }
                }
                KvWrite::ListPop { key } => {
                    if let Some(list) = self.staged.get_mut(key) {
                        list.len -= 1;
                        list.values.remove(&list.len);
                    }
                }
                _ => {}
            }
        }
        self.writes.extend(batch);
        Ok(())
    }

    fn read(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<Vec<u8>, StorageError> {
        self.list_get(&self.column_key(component, archetype), index)?
            .ok_or(StorageError::MissingValue {
                component,
                archetype,
                index,
            })
    }

    /// Writes that swap-remove `index` from a column of length `len`.
    fn swap_remove_writes(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
        len: usize,
        batch: &mut Vec<KvWrite>,
    ) -> Result<(), StorageError> {
        let key = self.column_key(component, archetype);
        let last = len.checked_sub(1).ok_or(StorageError::MissingValue {
            component,
            archetype,
            index,
        })?;
        if index != last {
            let moved = self.read(component, archetype, last)?;
            batch.push(KvWrite::ListSet {
                key: key.clone(),
                index,
                value: moved,
            });
        }
        batch.push(KvWrite::ListPop { key });
        Ok(())
    }

    fn checked_len(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<usize, StorageError> {
        let len = self.column_len(component, archetype)?;
        if index >= len {
            return Err(StorageError::MissingValue {
                component,
                archetype,
                index,
            });
        }
        Ok(len)
    }
}

fn corrupt(what: &str, err: serde_json::Error) -> StorageError {
    StorageError::Corrupt(format!("{what}: {err}"))
}

impl ColumnStore for KvColumnStore {
    fn push(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        value: Vec<u8>,
    ) -> Result<usize, StorageError> {
        let index = self.column_len(component, archetype)?;
        self.stage(vec![KvWrite::ListPush {
            key: self.column_key(component, archetype),
            value,
        }])?;
        Ok(index)
    }

    fn get(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<Vec<u8>, StorageError> {
        self.read(component, archetype, index)
    }

    fn set(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
        value: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.checked_len(component, archetype, index)?;
        self.stage(vec![KvWrite::ListSet {
            key: self.column_key(component, archetype),
            index,
            value,
        }])
    }

    fn swap_remove(
        &mut self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<Vec<u8>, StorageError> {
        let len = self.checked_len(component, archetype, index)?;
        let removed = self.read(component, archetype, index)?;
        let mut batch = Vec::new();
        self.swap_remove_writes(component, archetype, index, len, &mut batch)?;
        self.stage(batch)?;
        Ok(removed)
    }

    fn move_value(
        &mut self,
        component: ComponentTypeId,
        src: ArchetypeId,
        index: usize,
        dst: ArchetypeId,
    ) -> Result<usize, StorageError> {
        let len = self.checked_len(component, src, index)?;
        let value = self.read(component, src, index)?;
        let new_index = self.column_len(component, dst)?;

        let mut batch = Vec::new();
        self.swap_remove_writes(component, src, index, len, &mut batch)?;
        batch.push(KvWrite::ListPush {
            key: self.column_key(component, dst),
            value,
        });
        self.stage(batch)?;
        Ok(new_index)
    }

    fn contains(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
        index: usize,
    ) -> Result<bool, StorageError> {
        Ok(index < self.column_len(component, archetype)?)
    }

    fn column_len(
        &self,
        component: ComponentTypeId,
        archetype: ArchetypeId,
    ) -> Result<usize, StorageError> {
        self.list_len(&self.column_key(component, archetype))
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
        let mut batch = Vec::with_capacity(values.len());
        for (component, value) in values {
            let len = self.column_len(component, archetype)?;
            if len != row {
                return Err(StorageError::Corrupt(format!(
                    "archetype {archetype} columns disagree on length ({len} != {row})"
                )));
            }
            batch.push(KvWrite::ListPush {
                key: self.column_key(component, archetype),
                value,
            });
        }
        self.stage(batch)?;
        Ok(row)
    }

    fn swap_remove_row(
        &mut self,
        archetype: ArchetypeId,
        components: &[ComponentTypeId],
        index: usize,
    ) -> Result<(), StorageError> {
        let mut batch = Vec::new();
        for &component in components {
            let len = self.checked_len(component, archetype, index)?;
            self.swap_remove_writes(component, archetype, index, len, &mut batch)?;
        }
        self.stage(batch)
    }

    fn migrate_row(&mut self, migration: RowMigration<'_>) -> Result<usize, StorageError> {
        let src_lens = migration_sources(&migration)
            .into_iter()
            .map(|c| Ok((c, self.checked_len(c, migration.src, migration.index)?)))
            .collect::<Result<HashMap<_, _>, StorageError>>()?;
        let witness = migration_witness(&migration)
            .ok_or_else(|| StorageError::Corrupt("migration leaves an empty row".into()))?;
        let row = self.column_len(witness, migration.dst)?;

        let mut batch = Vec::new();
        for &component in migration.carried {
            let value = self.read(component, migration.src, migration.index)?;
            let len = src_lens[&component];
            self.swap_remove_writes(component, migration.src, migration.index, len, &mut batch)?;
            batch.push(KvWrite::ListPush {
                key: self.column_key(component, migration.dst),
                value,
            });
        }
        for &component in migration.dropped {
            let len = src_lens[&component];
            self.swap_remove_writes(component, migration.src, migration.index, len, &mut batch)?;
        }
        for (component, value) in migration.added {
            batch.push(KvWrite::ListPush {
                key: self.column_key(component, migration.dst),
                value,
            });
        }
        self.stage(batch)?;
        Ok(row)
    }

    fn load_schema(&self, name: &str) -> Result<Option<ComponentSchema>, StorageError> {
        self.kv
            .hash_get(&self.schema_key(), name)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(|e| corrupt("schema", e)))
            .transpose()
    }

    fn store_schema(&mut self, name: &str, schema: &ComponentSchema) -> Result<(), StorageError> {
        self.kv.exec(vec![KvWrite::HashSet {
            key: self.schema_key(),
            field: name.to_owned(),
            value: schema.to_bytes(),
        }])?;
        Ok(())
    }

    fn commit(&mut self, commit: &WorldCommit) -> Result<(), StorageError> {
        let header = MetaHeader {
            next_entity: commit.next_entity,
            archetypes: commit.archetypes.clone(),
            tick: commit.tick,
        };
        let header = serde_json::to_vec(&header).map_err(|e| corrupt("meta", e))?;

        let location_key = self.location_key();
        let mut batch = std::mem::take(&mut self.writes);
        batch.reserve(commit.placed.len() + commit.removed.len() + 3);
        for (entity, location) in &commit.placed {
            batch.push(KvWrite::HashSet {
                key: location_key.clone(),
                field: entity.to_raw().to_string(),
                value: serde_json::to_vec(location).map_err(|e| corrupt("location", e))?,
            });
        }
        for entity in &commit.removed {
            batch.push(KvWrite::HashDel {
                key: location_key.clone(),
                field: entity.to_raw().to_string(),
            });
        }
        batch.push(KvWrite::Set {
            key: self.meta_key(),
            value: header,
        });
        batch.push(KvWrite::Del {
            key: self.tick_start_key(),
        });
        batch.push(KvWrite::Del {
            key: self.pending_key(),
        });

        let writes = batch.len();
        self.staged.clear();
        self.kv.exec(batch)?;
        tracing::trace!(
            namespace = %self.namespace,
            tick = commit.tick,
            writes,
            "committed column writes"
        );
        Ok(())
    }

    fn discard(&mut self) {
        self.staged.clear();
        self.writes.clear();
    }

    fn has_pending(&self) -> bool {
        !self.writes.is_empty()
    }

    fn begin_tick(&mut self, tick: u64, batch: &[u8]) -> Result<(), StorageError> {
        self.kv.exec(vec![
            KvWrite::Set {
                key: self.tick_start_key(),
                value: tick.to_string().into_bytes(),
            },
            KvWrite::Set {
                key: self.pending_key(),
                value: batch.to_vec(),
            },
        ])?;
        Ok(())
    }

    fn pending_tick(&self) -> Result<Option<(u64, Vec<u8>)>, StorageError> {
        let Some(start) = self.kv.get(&self.tick_start_key())? else {
            return Ok(None);
        };
        let tick = std::str::from_utf8(&start)
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or_else(|| StorageError::Corrupt("unreadable tick-in-progress marker".into()))?;
        let batch = self
            .kv
            .get(&self.pending_key())?
            .ok_or_else(|| StorageError::Corrupt(format!("tick {tick} began without inputs")))?;
        Ok(Some((tick, batch)))
    }

    fn load_meta(&self) -> Result<Option<WorldMeta>, StorageError> {
        let Some(header) = self.kv.get(&self.meta_key())? else {
            return Ok(None);
        };
        let header: MetaHeader = serde_json::from_slice(&header).map_err(|e| corrupt("meta", e))?;

        let mut locations = Vec::new();
        for (field, value) in self.kv.hash_get_all(&self.location_key())? {
            let raw: u64 = field
                .parse()
                .map_err(|_| StorageError::Corrupt(format!("bad entity id '{field}'")))?;
            let location: Location =
                serde_json::from_slice(&value).map_err(|e| corrupt("location", e))?;
            locations.push((EntityId::from_raw(raw), location));
        }
        locations.sort_by_key(|(entity, _)| *entity);

        Ok(Some(WorldMeta {
            next_entity: header.next_entity,
            archetypes: header.archetypes,
            locations,
            tick: header.tick,
        }))
    }

    fn is_durable(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn c(raw: u32) -> ComponentTypeId {
        ComponentTypeId::from_raw(raw)
    }

    fn a(raw: u32) -> ArchetypeId {
        ArchetypeId::from_raw(raw)
    }

    fn store(kv: &MemoryKv) -> KvColumnStore {
        KvColumnStore::new(Arc::new(kv.clone()), "test")
    }

    #[test]
    fn exec_is_all_or_nothing() {
        let kv = MemoryKv::new();
        kv.exec(vec![KvWrite::ListPush {
            key: "l".into(),
            value: b"a".to_vec(),
        }])
        .unwrap();

        let err = kv
            .exec(vec![
                KvWrite::ListPush {
                    key: "l".into(),
                    value: b"b".to_vec(),
                },
                KvWrite::Set {
                    key: "s".into(),
                    value: b"x".to_vec(),
                },
                KvWrite::ListSet {
                    key: "l".into(),
                    index: 9,
                    value: vec![],
                },
            ])
            .unwrap_err();

        assert!(matches!(err, KvError::IndexOutOfRange { .. }));
        assert_eq!(kv.list_len("l").unwrap(), 1);
        assert_eq!(kv.get("s").unwrap(), None);
    }

    #[test]
    fn sorted_set_operations() {
        let kv = MemoryKv::new();
        assert!(kv.zadd("z", 5.0, "5").unwrap());
        assert!(!kv.zadd("z", 5.0, "5").unwrap());
        kv.zadd("z", 9.0, "9").unwrap();
        kv.zadd("z", 1.0, "1").unwrap();

        assert_eq!(kv.zmax("z").unwrap(), Some(("9".to_owned(), 9.0)));
        assert_eq!(kv.zrem_range_by_score("z", 0.0, 5.0).unwrap(), 2);
        assert_eq!(kv.zcard("z").unwrap(), 1);
    }

    #[test]
    fn unavailable_backend_fails_every_call() {
        let kv = MemoryKv::new();
        kv.set_available(false);
        assert!(matches!(kv.get("k"), Err(KvError::Unavailable(_))));
        kv.set_available(true);
        assert_eq!(kv.get("k").unwrap(), None);
    }

    #[test]
    fn column_ops_match_memory_semantics() {
        let kv = MemoryKv::new();
        let mut store = store(&kv);
        for v in [b"a", b"b", b"c"] {
            store.push(c(1), a(0), v.to_vec()).unwrap();
        }
        assert_eq!(store.swap_remove(c(1), a(0), 0).unwrap(), b"a");
        assert_eq!(store.get(c(1), a(0), 0).unwrap(), b"c");
        assert_eq!(store.get(c(1), a(0), 1).unwrap(), b"b");

        let new_index = store.move_value(c(1), a(0), 1, a(1)).unwrap();
        assert_eq!(new_index, 0);
        assert_eq!(store.get(c(1), a(1), 0).unwrap(), b"b");
        assert_eq!(store.column_len(c(1), a(0)).unwrap(), 1);
    }

    #[test]
    fn failed_migration_leaves_state_untouched() {
        let kv = MemoryKv::new();
        let mut store = store(&kv);
        store.push_row(a(0), vec![(c(1), b"one".to_vec())]).unwrap();

        // Component 2 is not in the source archetype.
        let err = store
            .migrate_row(RowMigration {
                src: a(0),
                index: 0,
                dst: a(1),
                carried: &[c(1), c(2)],
                dropped: &[],
                added: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingValue { .. }));
        assert_eq!(store.column_len(c(1), a(0)).unwrap(), 1);
        assert_eq!(store.column_len(c(1), a(1)).unwrap(), 0);
    }

    fn commit_at(tick: u64) -> WorldCommit {
        WorldCommit {
            next_entity: 1,
            tick,
            ..WorldCommit::default()
        }
    }

    #[test]
    fn meta_round_trips_through_commit() {
        let kv = MemoryKv::new();
        let mut store = store(&kv);
        store
            .commit(&WorldCommit {
                next_entity: 4,
                archetypes: vec![vec![c(1)], vec![c(1), c(2)]],
                placed: vec![
                    (EntityId::from_raw(1), Location::new(a(0), 0)),
                    (EntityId::from_raw(3), Location::new(a(1), 0)),
                ],
                removed: vec![],
                tick: 7,
            })
            .unwrap();

        // A second store over the same backend sees the committed state.
        let reopened = KvColumnStore::new(Arc::new(kv.clone()), "test");
        assert_eq!(
            reopened.load_meta().unwrap(),
            Some(WorldMeta {
                next_entity: 4,
                archetypes: vec![vec![c(1)], vec![c(1), c(2)]],
                locations: vec![
                    (EntityId::from_raw(1), Location::new(a(0), 0)),
                    (EntityId::from_raw(3), Location::new(a(1), 0)),
                ],
                tick: 7,
            })
        );

        let other_namespace = KvColumnStore::new(Arc::new(kv), "other");
        assert_eq!(other_namespace.load_meta().unwrap(), None);
    }

    #[test]
    fn column_writes_reach_the_backend_only_on_commit() {
        let kv = MemoryKv::new();
        let mut store = store(&kv);
        store.push_row(a(0), vec![(c(1), b"a".to_vec())]).unwrap();
        store.push_row(a(0), vec![(c(1), b"b".to_vec())]).unwrap();
        store.swap_remove(c(1), a(0), 0).unwrap();

        assert!(store.has_pending());
        assert_eq!(store.column_len(c(1), a(0)).unwrap(), 1);
        assert_eq!(store.get(c(1), a(0), 0).unwrap(), b"b");
        assert_eq!(kv.list_len("test:col:1:0").unwrap(), 0);

        store.commit(&commit_at(1)).unwrap();
        assert!(!store.has_pending());
        assert_eq!(kv.list_len("test:col:1:0").unwrap(), 1);
        assert_eq!(kv.list_get("test:col:1:0", 0).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn discard_drops_staged_writes() {
        let kv = MemoryKv::new();
        let mut store = store(&kv);
        store.push_row(a(0), vec![(c(1), b"a".to_vec())]).unwrap();
        store.commit(&commit_at(1)).unwrap();

        store.set(c(1), a(0), 0, b"changed".to_vec()).unwrap();
        store.push_row(a(0), vec![(c(1), b"b".to_vec())]).unwrap();
        store.discard();

        assert!(!store.has_pending());
        assert_eq!(store.column_len(c(1), a(0)).unwrap(), 1);
        assert_eq!(store.get(c(1), a(0), 0).unwrap(), b"a");

        // Nothing discarded resurfaces on the next commit.
        store.commit(&commit_at(2)).unwrap();
        assert_eq!(kv.list_len("test:col:1:0").unwrap(), 1);
        assert_eq!(kv.list_get("test:col:1:0", 0).unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn staged_pops_and_pushes_read_back_correctly() {
        let kv = MemoryKv::new();
        let mut store = store(&kv);
        for v in [b"a", b"b", b"c"] {
            store.push(c(1), a(0), v.to_vec()).unwrap();
        }
        store.commit(&commit_at(1)).unwrap();

        // Pop below the committed length, then grow past it again.
        store.swap_remove(c(1), a(0), 2).unwrap();
        store.swap_remove(c(1), a(0), 0).unwrap();
        store.push(c(1), a(0), b"d".to_vec()).unwrap();
        store.push(c(1), a(0), b"e".to_vec()).unwrap();

        let staged: Vec<Vec<u8>> = (0..3).map(|i| store.get(c(1), a(0), i).unwrap()).collect();
        assert_eq!(staged, vec![b"b".to_vec(), b"d".to_vec(), b"e".to_vec()]);
        assert!(!store.contains(c(1), a(0), 3).unwrap());

        store.commit(&commit_at(2)).unwrap();
        let reopened = KvColumnStore::new(Arc::new(kv), "test");
        let committed: Vec<Vec<u8>> =
            (0..3).map(|i| reopened.get(c(1), a(0), i).unwrap()).collect();
        assert_eq!(committed, staged);
    }

    #[test]
    fn commit_touches_only_changed_locations() {
        let kv = MemoryKv::new();
        let mut store = store(&kv);
        let e = EntityId::from_raw;
        store
            .commit(&WorldCommit {
                next_entity: 4,
                archetypes: vec![vec![c(1)]],
                placed: vec![
                    (e(1), Location::new(a(0), 0)),
                    (e(2), Location::new(a(0), 1)),
                    (e(3), Location::new(a(0), 2)),
                ],
                removed: vec![],
                tick: 1,
            })
            .unwrap();

        // Entity 1 is removed and entity 3 takes its row.
        store
            .commit(&WorldCommit {
                next_entity: 4,
                archetypes: vec![vec![c(1)]],
                placed: vec![(e(3), Location::new(a(0), 0))],
                removed: vec![e(1)],
                tick: 2,
            })
            .unwrap();

        let meta = store.load_meta().unwrap().unwrap();
        assert_eq!(meta.tick, 2);
        assert_eq!(
            meta.locations,
            vec![
                (e(2), Location::new(a(0), 1)),
                (e(3), Location::new(a(0), 0)),
            ]
        );
    }

    #[test]
    fn failed_commit_writes_nothing() {
        let kv = MemoryKv::new();
        let mut store = store(&kv);
        store.push_row(a(0), vec![(c(1), b"a".to_vec())]).unwrap();

        kv.set_available(false);
        assert!(matches!(
            store.commit(&commit_at(1)),
            Err(StorageError::Backend(KvError::Unavailable(_)))
        ));
        store.discard();
        kv.set_available(true);

        assert_eq!(kv.list_len("test:col:1:0").unwrap(), 0);
        assert_eq!(store.load_meta().unwrap(), None);
    }

    #[test]
    fn pending_tick_lives_until_commit() {
        let kv = MemoryKv::new();
        let mut store = store(&kv);
        assert_eq!(store.pending_tick().unwrap(), None);

        store.begin_tick(3, b"[1,2]").unwrap();
        let reopened = KvColumnStore::new(Arc::new(kv.clone()), "test");
        assert_eq!(reopened.pending_tick().unwrap(), Some((3, b"[1,2]".to_vec())));

        store.commit(&commit_at(4)).unwrap();
        assert_eq!(reopened.pending_tick().unwrap(), None);
    }
}
