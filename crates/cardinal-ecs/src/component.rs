//! Component type registration, schemas and value encoding.
//!
//! Every component type used in the ECS must be registered at runtime in a
//! [`ComponentRegistry`]. Registration produces a [`ComponentTypeId`] that is
//! used as the key for archetype lookups, column storage and filter matching.
//!
//! Component values are stored as JSON-encoded bytes. The shape of a
//! component's default value doubles as its [`ComponentSchema`], which is
//! persisted by durable stores and checked again on every restart.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::EcsError;

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// Marker for types that can be stored as components.
///
/// Implemented automatically for every `Clone + Default + Serialize +
/// DeserializeOwned + Send + Sync + 'static` type. The `Default` value is
/// what [`World::add_component_to`](crate::world::World::add_component_to)
/// attaches.
pub trait Component: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Component for T where T: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// Encode a component value to its stored byte form.
pub fn encode<T: Component>(name: &str, value: &T) -> Result<Vec<u8>, EcsError> {
    serde_json::to_vec(value).map_err(|e| EcsError::ComponentSerializationError {
        component: name.to_owned(),
        details: e.to_string(),
    })
}

/// Decode a component value from its stored byte form.
pub fn decode<T: Component>(name: &str, bytes: &[u8]) -> Result<T, EcsError> {
    serde_json::from_slice(bytes).map_err(|e| EcsError::ComponentDeserializationError {
        component: name.to_owned(),
        details: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
///
/// Ids are assigned sequentially starting at 1 in registration order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    /// Construct from a raw id. Mostly useful in tests and when decoding
    /// persisted metadata.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw numeric id.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentSchema
// ---------------------------------------------------------------------------

/// The JSON shape of a value, used as a component's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object { fields: BTreeMap<String, FieldKind> },
}

impl FieldKind {
    fn of(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FieldKind::Null,
            Value::Bool(_) => FieldKind::Bool,
            Value::Number(_) => FieldKind::Number,
            Value::String(_) => FieldKind::String,
            Value::Array(_) => FieldKind::Array,
            Value::Object(map) => FieldKind::Object {
                fields: map
                    .iter()
                    .map(|(k, v)| (k.clone(), FieldKind::of(v)))
                    .collect(),
            },
        }
    }
}

/// Schema of a component type, derived from the JSON shape of its default
/// value.
///
/// Two schemas are compatible iff they are equal: same field names with the
/// same kinds, recursively. Integer and float fields are both `Number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSchema {
    root: FieldKind,
}

impl ComponentSchema {
    /// Derive a schema from an arbitrary JSON value.
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self {
            root: FieldKind::of(value),
        }
    }

    /// Derive the schema of component type `T` from `T::default()`.
    pub fn of<T: Component>(name: &str) -> Result<Self, EcsError> {
        let value =
            serde_json::to_value(T::default()).map_err(|e| EcsError::ComponentSerializationError {
                component: name.to_owned(),
                details: e.to_string(),
            })?;
        Ok(Self::from_value(&value))
    }

    /// The root field kind.
    pub fn root(&self) -> &FieldKind {
        &self.root
    }

    /// Serialize for persistence.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a tree of enums with string keys cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a persisted schema.
    pub fn from_bytes(name: &str, bytes: &[u8]) -> Result<Self, EcsError> {
        serde_json::from_slice(bytes).map_err(|e| EcsError::ComponentDeserializationError {
            component: format!("{name} (schema)"),
            details: e.to_string(),
        })
    }
}

impl fmt::Display for ComponentSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentTypeId,
    /// Unique name supplied by the caller.
    pub name: String,
    /// Schema derived from the default value.
    pub schema: ComponentSchema,
    /// Encoded default value, used when a component is added without data.
    pub default_bytes: Vec<u8>,
    /// Rust `TypeId` for typed lookups.
    pub type_id: TypeId,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types and names to [`ComponentTypeId`]s and their
/// metadata.
///
/// Names and Rust types are both unique: registering either twice fails.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    /// TypeId -> ComponentTypeId for typed lookup.
    by_type: HashMap<TypeId, ComponentTypeId>,
    /// Name -> ComponentTypeId for lookup by string name (CQL, messages).
    by_name: HashMap<String, ComponentTypeId>,
    /// Indexed by `ComponentTypeId.0 - 1`.
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register component type `T` under `name`.
    ///
    /// `persisted` is the schema a durable store already holds for `name`,
    /// if any; registration fails when it differs from `T`'s schema.
    pub fn register<T: Component>(
        &mut self,
        name: &str,
        persisted: Option<&ComponentSchema>,
    ) -> Result<ComponentTypeId, EcsError> {
        let schema = ComponentSchema::of::<T>(name)?;
        let default_bytes = encode(name, &T::default())?;
        self.register_raw(name, TypeId::of::<T>(), schema, default_bytes, persisted)
    }

    fn register_raw(
        &mut self,
        name: &str,
        type_id: TypeId,
        schema: ComponentSchema,
        default_bytes: Vec<u8>,
        persisted: Option<&ComponentSchema>,
    ) -> Result<ComponentTypeId, EcsError> {
        if self.by_name.contains_key(name) {
            return Err(EcsError::DuplicateComponent {
                name: name.to_owned(),
            });
        }
        if let Some(existing) = self.by_type.get(&type_id) {
            let existing = self
                .get_info(*existing)
                .map(|info| info.name.clone())
                .unwrap_or_default();
            return Err(EcsError::DuplicateComponent { name: existing });
        }
        if let Some(stored) = persisted {
            if *stored != schema {
                return Err(EcsError::SchemaMismatch {
                    name: name.to_owned(),
                    stored: stored.to_string(),
                    registering: schema.to_string(),
                });
            }
        }

        let id = ComponentTypeId(self.infos.len() as u32 + 1);
        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            schema,
            default_bytes,
            type_id,
        });
        self.by_type.insert(type_id, id);
        self.by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Look up a component type by its Rust type.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up a component type by its `TypeId`.
    pub fn lookup_type_id(&self, type_id: TypeId) -> Option<ComponentTypeId> {
        self.by_type.get(&type_id).copied()
    }

    /// Look up a component type by its registered string name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Get the [`ComponentInfo`] for a registered component type ID.
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.infos.get(index)
    }

    /// Get the [`ComponentInfo`] for a name, or an `UnknownComponent` error.
    pub fn get_by_name(&self, name: &str) -> Result<&ComponentInfo, EcsError> {
        self.lookup_by_name(name)
            .and_then(|id| self.get_info(id))
            .ok_or_else(|| self.unknown(name))
    }

    /// The registered name of `id`, or a placeholder for unknown ids.
    pub fn name_of(&self, id: ComponentTypeId) -> String {
        match self.get_info(id) {
            Some(info) => info.name.clone(),
            None => format!("{id:?}"),
        }
    }

    /// All registered components in id order.
    pub fn list_all(&self) -> &[ComponentInfo] {
        &self.infos
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Returns the names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Build an `UnknownComponent` error listing what is registered.
    pub(crate) fn unknown(&self, name: &str) -> EcsError {
        EcsError::UnknownComponent {
            name: name.to_owned(),
            registered: self.registered_names().join(", "),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
