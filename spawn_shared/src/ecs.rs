//! Entity/component system (minimal ECS).
//!
//! Typed component storages keyed by entity id. The server's entity factory
//! materializes player entities here.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use serde::{Deserialize, Serialize};

use crate::{
    math::{Quat, Vec3},
    net::ClientId,
};

/// Opaque entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Type-erased storage so `despawn` can strip every component of an entity.
trait Storage: Any + Send + Sync {
    fn remove_entity(&mut self, entity: EntityId);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: 'static + Send + Sync> Storage for HashMap<EntityId, T> {
    fn remove_entity(&mut self, entity: EntityId) {
        self.remove(&entity);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Simple world that can store typed components.
#[derive(Default)]
pub struct World {
    next_id: u64,
    alive: Vec<EntityId>,
    storages: HashMap<TypeId, Box<dyn Storage>>,
}

impl World {
    /// Creates a new entity.
    pub fn spawn(&mut self) -> EntityId {
        self.next_id += 1;
        let id = EntityId(self.next_id);
        self.alive.push(id);
        id
    }

    /// Removes an entity and all of its components. Returns false if it was not alive.
    pub fn despawn(&mut self, entity: EntityId) -> bool {
        let Some(idx) = self.alive.iter().position(|e| *e == entity) else {
            return false;
        };
        self.alive.swap_remove(idx);
        for storage in self.storages.values_mut() {
            storage.remove_entity(entity);
        }
        true
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.alive.contains(&entity)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    /// Inserts/replaces a component for an entity.
    pub fn insert<T: 'static + Send + Sync>(&mut self, entity: EntityId, component: T) {
        let storage = self
            .storages
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(HashMap::<EntityId, T>::new()));

        if let Some(storage) = storage.as_any_mut().downcast_mut::<HashMap<EntityId, T>>() {
            storage.insert(entity, component);
        }
    }

    /// Gets a component reference.
    pub fn get<T: 'static + Send + Sync>(&self, entity: EntityId) -> Option<&T> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any().downcast_ref::<HashMap<EntityId, T>>())
            .and_then(|storage| storage.get(&entity))
    }

    /// Gets a mutable component reference.
    pub fn get_mut<T: 'static + Send + Sync>(&mut self, entity: EntityId) -> Option<&mut T> {
        self.storages
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any_mut().downcast_mut::<HashMap<EntityId, T>>())
            .and_then(|storage| storage.get_mut(&entity))
    }

    /// Iterates entities with a given component.
    pub fn iter<T: 'static + Send + Sync>(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any().downcast_ref::<HashMap<EntityId, T>>())
            .into_iter()
            .flat_map(|storage| storage.iter().map(|(k, v)| (*k, v)))
    }
}

/// World-space position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position(pub Vec3);

/// World-space orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rotation(pub Quat);

/// The connection that controls this entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner(pub ClientId);

/// Name of the template the entity was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template(pub String);
