//! Frame-rate-independent smoothing between server snapshots.
//!
//! Each frame the rendered values move toward the latest authoritative
//! values by `t = clamp(gain * dt, 0, 1)`. Longer frames take bigger steps,
//! so convergence speed does not depend on the frame rate.

use crate::cache::ClientEntityCache;
use shared::{lerp, lerp_angle, EntityId, INTERP_GAIN};
use std::f32::consts::FRAC_PI_2;

pub struct Interpolator {
    gain: f32,
}

impl Interpolator {
    pub fn new() -> Self {
        Self { gain: INTERP_GAIN }
    }

    pub fn with_gain(gain: f32) -> Self {
        Self { gain }
    }

    /// Advances every entity's rendered transform by one frame. The local
    /// avatar's aim is not smoothed: it mirrors this player's own input and
    /// lagging it behind the cursor feels broken.
    pub fn step(&self, cache: &mut ClientEntityCache, local_id: Option<EntityId>, dt: f32) {
        let t = (self.gain * dt).clamp(0.0, 1.0);

        for entity in cache.entities_mut() {
            let target_position = entity.server_position();
            let target_dir = entity.server_dir();
            let target_rotation = entity.server_rotation() as f32 * FRAC_PI_2;
            let target_health = entity.server_health();

            entity.rendered.position = entity.rendered.position.lerp(target_position, t);
            entity.rendered.rotation = lerp_angle(entity.rendered.rotation, target_rotation, t);
            entity.rendered.health = lerp(entity.rendered.health, target_health, t);

            if local_id == Some(entity.id) {
                entity.rendered.dir = target_dir;
            } else {
                entity.rendered.dir = lerp_angle(entity.rendered.dir, target_dir, t);
            }
        }
    }
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new()
    }
}
