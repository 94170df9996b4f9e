//! Server-side entity representation and per-kind behavior.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::entity::{FLAG_SELECTABLE, FLAG_SLEEPING};
use shared::{
    EntityId, EntityKind, EntityRecord, FieldMap, FieldTag, FieldValue, Rect, Vec2,
    PROJECTILE_SPEED, PROJECTILE_TTL, WORLD_HEIGHT, WORLD_WIDTH,
};

/// Lifecycle state tracked by the table. `Hidden` entities still exist and
/// keep their id; `Destroyed` entities are purged after the next broadcast
/// and their id is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Alive,
    Hidden,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct ServerEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub state: EntityState,

    pub position: Vec2,
    pub velocity: Vec2,
    /// Quarter-turn orientation, 0..=3.
    pub rotation: u8,
    /// Facing/aim angle in radians.
    pub dir: f32,
    pub asset: String,
    pub label: String,
    pub shapes: Vec<Rect>,
    pub flags: u8,
    pub health: f32,

    /// Remaining lifetime for self-expiring kinds, in seconds.
    pub ttl: f32,
    /// Connection-driven movement intent, applied each tick for players.
    pub move_dir: Vec2,
    /// Entity that spawned this one; projectiles never hit their owner.
    pub owner: Option<EntityId>,
}

impl ServerEntity {
    fn blank(id: EntityId, kind: EntityKind) -> Self {
        Self {
            id,
            kind,
            state: EntityState::Alive,
            position: Vec2::ZERO,
            velocity: Vec2::ZERO,
            rotation: 0,
            dir: 0.0,
            asset: String::new(),
            label: String::new(),
            shapes: Vec::new(),
            flags: 0,
            health: 1.0,
            ttl: 0.0,
            move_dir: Vec2::ZERO,
            owner: None,
        }
    }

    /// New player avatar with a seeded spawn jitter so tests are repeatable.
    pub fn player(id: EntityId, name: &str) -> Self {
        let mut rng = StdRng::seed_from_u64(id as u64);
        let mut entity = Self::blank(id, EntityKind::Player);
        entity.position = Vec2::new(
            rng.gen_range(50.0..WORLD_WIDTH - 50.0),
            rng.gen_range(50.0..WORLD_HEIGHT - 50.0),
        );
        entity.asset = "player".to_string();
        entity.label = name.to_string();
        entity.flags = FLAG_SELECTABLE;
        entity
    }

    pub fn projectile(id: EntityId, position: Vec2, dir: f32, owner: Option<EntityId>) -> Self {
        let mut entity = Self::blank(id, EntityKind::Projectile);
        entity.position = position;
        entity.dir = dir;
        entity.velocity = Vec2::from_angle(dir) * PROJECTILE_SPEED;
        entity.asset = "projectile".to_string();
        entity.ttl = PROJECTILE_TTL;
        entity.owner = owner;
        entity
    }

    pub fn static_prop(id: EntityId, position: Vec2, rotation: u8, asset: &str) -> Self {
        let mut entity = Self::blank(id, EntityKind::StaticProp);
        entity.position = position;
        entity.rotation = rotation % 4;
        entity.asset = asset.to_string();
        entity.shapes = vec![Rect::new(Vec2::ZERO, Vec2::new(32.0, 32.0))];
        entity.flags = FLAG_SELECTABLE | FLAG_SLEEPING;
        entity
    }

    pub fn pickup_orb(id: EntityId, position: Vec2) -> Self {
        let mut entity = Self::blank(id, EntityKind::PickupOrb);
        entity.position = position;
        entity.asset = "orb".to_string();
        entity.health = 0.25;
        entity
    }

    /// Advances this entity by one tick. Movement integration happens here;
    /// cross-entity interactions (hits, pickups) are the loop's job.
    pub fn update(&mut self, dt: f32) {
        match self.kind {
            EntityKind::Player => {
                self.velocity = self.move_dir.normalized() * shared::PLAYER_SPEED;
                self.position += self.velocity * dt;
                self.position = self.position.clamped(
                    Vec2::ZERO,
                    Vec2::new(WORLD_WIDTH, WORLD_HEIGHT),
                );
            }
            EntityKind::Projectile => {
                self.position += self.velocity * dt;
                self.ttl -= dt;
                if self.ttl <= 0.0 || !self.in_bounds() {
                    self.state = EntityState::Destroyed;
                }
            }
            EntityKind::StaticProp | EntityKind::PickupOrb => {}
        }
    }

    fn in_bounds(&self) -> bool {
        self.position.x >= 0.0
            && self.position.x <= WORLD_WIDTH
            && self.position.y >= 0.0
            && self.position.y <= WORLD_HEIGHT
    }

    /// Current values for every tag in this kind's schema. Snapshots diff
    /// these maps; tags outside the schema are never emitted.
    pub fn fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        for tag in self.kind.schema() {
            let value = match tag {
                FieldTag::Position => FieldValue::Vec2(self.position),
                FieldTag::Velocity => FieldValue::Vec2(self.velocity),
                FieldTag::Rotation => FieldValue::Rot(self.rotation),
                FieldTag::Dir => FieldValue::Float(self.dir),
                FieldTag::Asset => FieldValue::Text(self.asset.clone()),
                FieldTag::Label => FieldValue::Text(self.label.clone()),
                FieldTag::Shapes => FieldValue::Shapes(self.shapes.clone()),
                FieldTag::Flags => FieldValue::Flags(self.flags),
                FieldTag::Health => FieldValue::Float(self.health),
            };
            fields.insert(*tag, value);
        }
        fields
    }

    pub fn record(&self) -> EntityRecord {
        EntityRecord {
            id: self.id,
            kind: self.kind,
            fields: self.fields(),
        }
    }
}
