//! Cardinal ECS -- archetype-based entity component storage for tick-driven
//! game servers.
//!
//! Entities are grouped into archetypes (one per unique set of component
//! types). Component values are stored as opaque encoded bytes in a pluggable
//! [`ColumnStore`](storage::ColumnStore), addressed by `(archetype, index)`.
//! The [`World`](world::World) keeps the archetype row lists, the entity
//! location index and the column store in lockstep.
//!
//! # Quick Start
//!
//! ```
//! use cardinal_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Health { value: i64 }
//!
//! let mut world = World::new();
//! let health = world.register_component::<Health>("Health").unwrap();
//!
//! let entity = world.create(ComponentBundle::new().with(Health { value: 10 })).unwrap();
//! assert_eq!(world.get_component::<Health>(entity).unwrap(), Health { value: 10 });
//!
//! let mut search = Search::new(filter::contains([health]));
//! assert_eq!(search.count(&world).unwrap(), 1);
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod component;
pub mod cql;
pub mod entity;
pub mod filter;
pub mod search;
pub mod storage;
pub mod world;

use archetype::ArchetypeId;
use component::ComponentTypeId;
use entity::EntityId;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// A component with this name (or Rust type) is already registered.
    #[error("component '{name}' is already registered")]
    DuplicateComponent { name: String },

    /// The schema persisted for this component name differs from the schema
    /// of the type being registered.
    #[error("component '{name}' does not match the schema stored for it (stored: {stored}, registering: {registering})")]
    SchemaMismatch {
        name: String,
        stored: String,
        registering: String,
    },

    /// A component type was referenced that has not been registered.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// A numeric component id does not belong to any registered component.
    #[error("component id {0:?} is not registered")]
    UnknownComponentId(ComponentTypeId),

    /// The entity does not exist (never created or already removed).
    #[error("entity {0} does not exist")]
    EntityNotFound(EntityId),

    /// The entity exists but does not carry the requested component.
    #[error("component '{component}' is not on entity {entity}")]
    ComponentNotOnEntity { entity: EntityId, component: String },

    /// The entity already carries the component being added.
    #[error("component '{component}' is already on entity {entity}")]
    ComponentAlreadyOnEntity { entity: EntityId, component: String },

    /// An entity may never be left without components.
    #[error("an entity must have at least one component")]
    EntityMustHaveAtLeastOneComponent,

    /// The same component type was supplied twice when creating an entity.
    #[error("component '{component}' appears more than once in the bundle")]
    DuplicateInBundle { component: String },

    /// The archetype id does not exist.
    #[error("archetype {0} does not exist")]
    UnknownArchetype(ArchetypeId),

    /// Encoding a component value failed.
    #[error("failed to encode component '{component}': {details}")]
    ComponentSerializationError { component: String, details: String },

    /// Decoding a component value failed.
    #[error("failed to deserialize component '{component}': {details}")]
    ComponentDeserializationError { component: String, details: String },

    /// Persisted state cannot be reconciled with this world.
    #[error("persisted state mismatch: {0}")]
    StateMismatch(String),

    /// The column store failed.
    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    /// A CQL query failed to compile.
    #[error(transparent)]
    Cql(#[from] cql::CqlError),
}

impl EcsError {
    /// Whether this error must abort the surrounding tick.
    ///
    /// Missing entities and component presence mismatches are expected
    /// outcomes of systems racing each other within one tick; callers may
    /// skip the entity and keep going. Everything else (storage failures,
    /// codec failures, registration problems) is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EcsError::EntityNotFound(_)
                | EcsError::ComponentNotOnEntity { .. }
                | EcsError::ComponentAlreadyOnEntity { .. }
                | EcsError::EntityMustHaveAtLeastOneComponent
        )
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId, ArchetypeRegistry};
    pub use crate::component::{
        Component, ComponentInfo, ComponentRegistry, ComponentSchema, ComponentTypeId,
    };
    pub use crate::cql;
    pub use crate::entity::{EntityId, EntityLocationIndex, Location};
    pub use crate::filter::{self, ComponentFilter};
    pub use crate::search::{ComposedSearch, Search};
    pub use crate::storage::kv::{KvBackend, KvColumnStore, MemoryKv};
    pub use crate::storage::memory::MemoryColumnStore;
    pub use crate::storage::ColumnStore;
    pub use crate::world::{ComponentBundle, World};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    fn setup_world() -> (World, ComponentTypeId, ComponentTypeId) {
        let mut world = World::new();
        let pos = world.register_component::<Position>("position").unwrap();
        let vel = world.register_component::<Velocity>("velocity").unwrap();
        (world, pos, vel)
    }

    #[test]
    fn create_then_read_back() {
        let (mut world, _, _) = setup_world();
        let e = world
            .create(
                ComponentBundle::new()
                    .with(Position { x: 1.0, y: 2.0 })
                    .with(Velocity { dx: 3.0, dy: 4.0 }),
            )
            .unwrap();

        assert_eq!(
            world.get_component::<Position>(e).unwrap(),
            Position { x: 1.0, y: 2.0 }
        );
        assert_eq!(
            world.get_component::<Velocity>(e).unwrap(),
            Velocity { dx: 3.0, dy: 4.0 }
        );
    }

    #[test]
    fn add_component_migrates_and_keeps_data() {
        let (mut world, _, vel) = setup_world();
        let e = world
            .create(ComponentBundle::new().with(Position { x: 1.0, y: 2.0 }))
            .unwrap();
        let archetypes_before = world.archetype_count();

        world.add_component_to::<Velocity>(e).unwrap();

        assert!(world.components_of(e).unwrap().contains(&vel));
        assert_eq!(
            world.get_component::<Position>(e).unwrap(),
            Position { x: 1.0, y: 2.0 }
        );
        assert_eq!(world.get_component::<Velocity>(e).unwrap(), Velocity::default());
        assert!(world.archetype_count() > archetypes_before);
        world.check_consistency().unwrap();
    }

    #[test]
    fn lookup_errors_are_not_fatal() {
        let (mut world, _, _) = setup_world();
        let e = world
            .create(ComponentBundle::new().with(Position::default()))
            .unwrap();

        let err = world.get_component::<Velocity>(e).unwrap_err();
        assert!(matches!(err, EcsError::ComponentNotOnEntity { .. }));
        assert!(!err.is_fatal());

        world.remove(e).unwrap();
        let err = world.get_component::<Position>(e).unwrap_err();
        assert!(matches!(err, EcsError::EntityNotFound(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn storage_errors_are_fatal() {
        let err = EcsError::Storage(crate::storage::StorageError::Corrupt("x".into()));
        assert!(err.is_fatal());
    }
}
