//! Entity data model and the sparse field-tag encoding.
//!
//! Every entity is a flat record of typed values addressed by small integer
//! tags. A snapshot carries only the tags that changed since the last send
//! to a given connection; an absent tag always means "unchanged", never
//! "reset to default".

use crate::math::{Rect, Vec2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server-assigned identifier, from a monotonically increasing counter.
/// Never reused for the lifetime of a process.
pub type EntityId = u32;

/// Closed set of entity kinds. The kind decides which field tags are
/// meaningful and which client-side representation gets instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Player,
    Projectile,
    StaticProp,
    PickupOrb,
}

/// Sparse-update keys. Tag 0 is the entity id, carried structurally in
/// records and deltas; it never appears inside a field map.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum FieldTag {
    Position = 1,
    Velocity = 2,
    Rotation = 3,
    Dir = 4,
    Asset = 5,
    Label = 6,
    Shapes = 7,
    Flags = 8,
    Health = 9,
}

/// Bit set carried in the `Flags` field.
pub const FLAG_SELECTABLE: u8 = 1 << 0;
pub const FLAG_SLEEPING: u8 = 1 << 1;

/// Self-describing field value, so a delta can be applied without knowing
/// the kind's schema up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Vec2(Vec2),
    Float(f32),
    /// Quarter-turn rotation, 0..=3.
    Rot(u8),
    Text(String),
    Shapes(Vec<Rect>),
    Flags(u8),
}

impl FieldValue {
    pub fn as_vec2(&self) -> Option<Vec2> {
        match self {
            FieldValue::Vec2(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_rot(&self) -> Option<u8> {
        match self {
            FieldValue::Rot(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_shapes(&self) -> Option<&[Rect]> {
        match self {
            FieldValue::Shapes(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_flags(&self) -> Option<u8> {
        match self {
            FieldValue::Flags(f) => Some(*f),
            _ => None,
        }
    }
}

/// Map of only the tags present; ordered so encoded output is deterministic.
pub type FieldMap = BTreeMap<FieldTag, FieldValue>;

impl EntityKind {
    /// The fixed set of tags that are ever populated for this kind.
    pub fn schema(self) -> &'static [FieldTag] {
        use FieldTag::*;
        match self {
            EntityKind::Player => &[Position, Velocity, Rotation, Dir, Asset, Label, Flags, Health],
            EntityKind::Projectile => &[Position, Velocity, Dir, Asset],
            EntityKind::StaticProp => &[Position, Rotation, Asset, Shapes, Flags],
            EntityKind::PickupOrb => &[Position, Asset, Health],
        }
    }

    pub fn allows(self, tag: FieldTag) -> bool {
        self.schema().contains(&tag)
    }
}

/// Full record sent when an entity first appears to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    pub fields: FieldMap,
}

/// Changed tags only, sent for an entity the connection already knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDelta {
    pub id: EntityId,
    pub fields: FieldMap,
}

/// Tags of `next` whose values differ from `prev` (including tags absent
/// from `prev`).
pub fn diff_fields(prev: &FieldMap, next: &FieldMap) -> FieldMap {
    next.iter()
        .filter(|(tag, value)| prev.get(tag) != Some(value))
        .map(|(tag, value)| (*tag, value.clone()))
        .collect()
}

/// Overlays `delta` onto `base`; tags absent from the delta keep their
/// current value.
pub fn merge_fields(base: &mut FieldMap, delta: &FieldMap) {
    for (tag, value) in delta {
        base.insert(*tag, value.clone());
    }
}
