//! Authoritative entity table. Only the simulation loop writes to it;
//! network tasks hand their events to the loop instead of touching state.

use crate::entity::{EntityState, ServerEntity};
use log::{error, info};
use shared::{EntityId, Vec2};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub struct EntityTable {
    entities: HashMap<EntityId, ServerEntity>,
    next_id: EntityId,
}

impl EntityTable {
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> EntityId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn spawn_player(&mut self, name: &str) -> EntityId {
        let id = self.allocate_id();
        let player = ServerEntity::player(id, name);
        info!(
            "Spawned player {} ({:?}) at ({:.1}, {:.1})",
            id, name, player.position.x, player.position.y
        );
        self.entities.insert(id, player);
        id
    }

    pub fn spawn_projectile(
        &mut self,
        position: Vec2,
        dir: f32,
        owner: Option<EntityId>,
    ) -> EntityId {
        let id = self.allocate_id();
        self.entities
            .insert(id, ServerEntity::projectile(id, position, dir, owner));
        id
    }

    pub fn spawn_static_prop(&mut self, position: Vec2, rotation: u8, asset: &str) -> EntityId {
        let id = self.allocate_id();
        self.entities
            .insert(id, ServerEntity::static_prop(id, position, rotation, asset));
        id
    }

    pub fn spawn_pickup_orb(&mut self, position: Vec2) -> EntityId {
        let id = self.allocate_id();
        self.entities.insert(id, ServerEntity::pickup_orb(id, position));
        id
    }

    pub fn get(&self, id: EntityId) -> Option<&ServerEntity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut ServerEntity> {
        self.entities.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerEntity> {
        self.entities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerEntity> {
        self.entities.values_mut()
    }

    /// Ids in ascending order, so per-tick iteration is deterministic.
    pub fn sorted_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Soft removal: the entity stays in the table and can reappear later.
    pub fn set_hidden(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            if entity.state == EntityState::Alive {
                entity.state = EntityState::Hidden;
            }
        }
    }

    pub fn set_visible(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            if entity.state == EntityState::Hidden {
                entity.state = EntityState::Alive;
            }
        }
    }

    /// Hard removal: marks the entity destroyed. The record is kept until the
    /// broadcast has told every connection, then purged.
    pub fn destroy(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.state = EntityState::Destroyed;
        }
    }

    /// Runs each alive entity's behavior. A panicking behavior takes out
    /// that one entity, not the tick.
    pub fn update_all(&mut self, dt: f32) {
        for entity in self.entities.values_mut() {
            if entity.state != EntityState::Alive {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| entity.update(dt)));
            if result.is_err() {
                error!("Behavior for entity {} panicked, destroying it", entity.id);
                entity.state = EntityState::Destroyed;
            }
        }
    }

    /// Drops entities whose destruction has already been broadcast. Ids are
    /// not recycled; `next_id` only ever grows.
    pub fn purge_destroyed(&mut self) {
        self.entities
            .retain(|_, entity| entity.state != EntityState::Destroyed);
    }
}

impl Default for EntityTable {
    fn default() -> Self {
        Self::new()
    }
}
