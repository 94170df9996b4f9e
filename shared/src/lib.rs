//! Types shared between the authoritative server and the client mirror:
//! the entity data model, the sparse field-tag encoding, the wire protocol,
//! and the framing used over the reliable ordered transport.

pub mod entity;
pub mod framing;
pub mod math;
pub mod wire;

pub use entity::{
    diff_fields, merge_fields, EntityDelta, EntityId, EntityKind, EntityRecord, FieldMap, FieldTag,
    FieldValue,
};
pub use math::{lerp, lerp_angle, Rect, Vec2};
pub use wire::{ClientPacket, ServerPacket, UpdatePacket};

/// Default interval between authoritative ticks.
pub const TICK_INTERVAL_MS: u64 = 50;

/// Upper bound on the delta-time handed to behaviors after a stall.
pub const MAX_TICK_DELTA: f32 = 0.1;

pub const WORLD_WIDTH: f32 = 800.0;
pub const WORLD_HEIGHT: f32 = 600.0;

pub const PLAYER_SPEED: f32 = 300.0;
pub const PROJECTILE_SPEED: f32 = 450.0;
pub const PROJECTILE_TTL: f32 = 2.0;

/// Gain for the client-side rendered-value lerp (`k` in `lerp(a, b, k*dt)`).
pub const INTERP_GAIN: f32 = 8.0;
