//! Entity factory: materializes a client's controlled entity.

use anyhow::bail;
use spawn_shared::{
    ecs::{EntityId, Owner, Position, Rotation, Template, World},
    math::{Quat, Vec3},
    net::ClientId,
};
use tracing::debug;

use crate::pool::Placement;

/// Creates and destroys player entities on behalf of the orchestrator.
pub trait EntityFactory {
    /// Checked once at initialization (e.g. the template exists).
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Builds the entity for `client` and binds its network identity.
    fn spawn_entity(&mut self, client: ClientId, placement: &Placement) -> anyhow::Result<EntityId>;

    fn despawn_entity(&mut self, entity: EntityId);

    /// An entity that already belongs to `client`, if one survived.
    fn find_owned(&self, _client: ClientId) -> Option<EntityId> {
        None
    }

    /// Position and orientation of a live entity.
    fn pose_of(&self, _entity: EntityId) -> Option<(Vec3, Quat)> {
        None
    }
}

/// Factory backed by the shared ECS [`World`].
#[derive(Default)]
pub struct WorldFactory {
    world: World,
    template: String,
}

impl WorldFactory {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            world: World::default(),
            template: template.into(),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn owner_of(&self, entity: EntityId) -> Option<ClientId> {
        self.world.get::<Owner>(entity).map(|o| o.0)
    }
}

impl EntityFactory for WorldFactory {
    fn validate(&self) -> anyhow::Result<()> {
        if self.template.trim().is_empty() {
            bail!("no player template configured");
        }
        Ok(())
    }

    fn spawn_entity(&mut self, client: ClientId, placement: &Placement) -> anyhow::Result<EntityId> {
        if self.find_owned(client).is_some() {
            bail!("client {client} already owns an entity");
        }
        let ent = self.world.spawn();
        self.world.insert(ent, Position(placement.position));
        self.world.insert(ent, Rotation(placement.rotation));
        self.world.insert(ent, Owner(client));
        self.world.insert(ent, Template(self.template.clone()));
        debug!(client_id = ?client, entity = ?ent, template = %self.template, "Built player entity");
        Ok(ent)
    }

    fn despawn_entity(&mut self, entity: EntityId) {
        if !self.world.despawn(entity) {
            debug!(entity = ?entity, "Despawn of unknown entity ignored");
        }
    }

    fn find_owned(&self, client: ClientId) -> Option<EntityId> {
        self.world
            .iter::<Owner>()
            .filter(|(_, owner)| owner.0 == client)
            .map(|(ent, _)| ent)
            .min()
    }

    fn pose_of(&self, entity: EntityId) -> Option<(Vec3, Quat)> {
        let position = self.world.get::<Position>(entity)?.0;
        let rotation = self.world.get::<Rotation>(entity).map(|r| r.0).unwrap_or_default();
        Some((position, rotation))
    }
}
