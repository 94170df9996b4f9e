//! Client-side mirror of the server's entity set.
//!
//! The cache replays each update's four lists in order and pools entity
//! allocations. A pooled entity is wiped completely before reuse so no
//! stale field can leak into the next life.

use log::{error, warn};
use shared::{merge_fields, EntityId, EntityKind, FieldMap, FieldTag, UpdatePacket, Vec2};
use std::collections::{HashMap, VecDeque};

/// Lifecycle notifications surfaced to the host (rendering, audio, UI).
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    Appeared(EntityId),
    Disappeared(EntityId),
    Destroyed(EntityId),
}

/// Smoothed values the host actually draws. Server values land in the
/// `server_*` fields; the interpolator moves these toward them.
#[derive(Debug, Clone, Default)]
pub struct RenderTransform {
    pub position: Vec2,
    pub dir: f32,
    pub rotation: f32,
    pub health: f32,
}

#[derive(Debug, Clone)]
pub struct ClientEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Last authoritative values, merged from deltas.
    pub fields: FieldMap,
    pub rendered: RenderTransform,
}

impl ClientEntity {
    fn blank() -> Self {
        Self {
            id: 0,
            kind: EntityKind::Player,
            fields: FieldMap::new(),
            rendered: RenderTransform::default(),
        }
    }

    /// Wipes every field back to the blank state. Pooled entities must come
    /// out indistinguishable from a fresh allocation.
    fn reset(&mut self) {
        *self = Self::blank();
    }

    fn init(&mut self, id: EntityId, kind: EntityKind, fields: FieldMap) {
        self.id = id;
        self.kind = kind;
        // Rendered values start at the authoritative ones so a new entity
        // does not slide in from the pool's old position
        self.rendered.position = fields
            .get(&FieldTag::Position)
            .and_then(|v| v.as_vec2())
            .unwrap_or(Vec2::ZERO);
        self.rendered.dir = fields
            .get(&FieldTag::Dir)
            .and_then(|v| v.as_float())
            .unwrap_or(0.0);
        self.rendered.rotation = fields
            .get(&FieldTag::Rotation)
            .and_then(|v| v.as_rot())
            .map(|r| r as f32 * std::f32::consts::FRAC_PI_2)
            .unwrap_or(0.0);
        self.rendered.health = fields
            .get(&FieldTag::Health)
            .and_then(|v| v.as_float())
            .unwrap_or(1.0);
        self.fields = fields;
    }

    pub fn server_position(&self) -> Vec2 {
        self.fields
            .get(&FieldTag::Position)
            .and_then(|v| v.as_vec2())
            .unwrap_or(self.rendered.position)
    }

    pub fn server_dir(&self) -> f32 {
        self.fields
            .get(&FieldTag::Dir)
            .and_then(|v| v.as_float())
            .unwrap_or(self.rendered.dir)
    }

    pub fn server_rotation(&self) -> u8 {
        self.fields
            .get(&FieldTag::Rotation)
            .and_then(|v| v.as_rot())
            .unwrap_or(0)
    }

    pub fn server_health(&self) -> f32 {
        self.fields
            .get(&FieldTag::Health)
            .and_then(|v| v.as_float())
            .unwrap_or(self.rendered.health)
    }

    pub fn label(&self) -> &str {
        self.fields
            .get(&FieldTag::Label)
            .and_then(|v| v.as_text())
            .unwrap_or("")
    }
}

#[derive(Default)]
pub struct ClientEntityCache {
    entities: HashMap<EntityId, ClientEntity>,
    pool: Vec<ClientEntity>,
    events: VecDeque<EntityEvent>,
}

impl ClientEntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays one tick's lists in order: appeared, updated, disappeared,
    /// destroyed. Ordering guarantees no list entry references an id before
    /// its appearance in the same packet.
    pub fn apply(&mut self, update: &UpdatePacket) {
        for record in &update.appeared {
            if self.entities.contains_key(&record.id) {
                // The server never re-announces a live entity; this is a
                // desync worth failing loudly on in development builds
                error!("Duplicate appearance for entity {}", record.id);
                debug_assert!(false, "duplicate appearance for entity {}", record.id);
                self.recycle(record.id);
            }
            let mut entity = self.pool.pop().unwrap_or_else(ClientEntity::blank);
            entity.init(record.id, record.kind, record.fields.clone());
            self.entities.insert(record.id, entity);
            self.events.push_back(EntityEvent::Appeared(record.id));
        }

        for delta in &update.updated {
            match self.entities.get_mut(&delta.id) {
                Some(entity) => merge_fields(&mut entity.fields, &delta.fields),
                None => warn!("Update for unknown entity {}, ignoring", delta.id),
            }
        }

        for &id in &update.disappeared {
            if self.recycle(id) {
                self.events.push_back(EntityEvent::Disappeared(id));
            } else {
                warn!("Disappearance of unknown entity {}, ignoring", id);
            }
        }

        for &id in &update.destroyed {
            if self.recycle(id) {
                self.events.push_back(EntityEvent::Destroyed(id));
            } else {
                warn!("Destruction of unknown entity {}, ignoring", id);
            }
        }
    }

    fn recycle(&mut self, id: EntityId) -> bool {
        match self.entities.remove(&id) {
            Some(mut entity) => {
                entity.reset();
                self.pool.push(entity);
                true
            }
            None => false,
        }
    }

    /// Drops every entity, as on a connection loss. The server will resend
    /// full records if the session comes back.
    pub fn clear(&mut self) {
        let ids: Vec<EntityId> = self.entities.keys().copied().collect();
        for id in ids {
            if self.recycle(id) {
                self.events.push_back(EntityEvent::Destroyed(id));
            }
        }
    }

    pub fn drain_events(&mut self) -> Vec<EntityEvent> {
        self.events.drain(..).collect()
    }

    pub fn get(&self, id: EntityId) -> Option<&ClientEntity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut ClientEntity> {
        self.entities.get_mut(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &ClientEntity> {
        self.entities.values()
    }

    pub fn entities_mut(&mut self) -> impl Iterator<Item = &mut ClientEntity> {
        self.entities.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }
}
