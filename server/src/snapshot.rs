//! Per-connection delta production.
//!
//! Each connection carries a `SnapshotView`: the field values it was last
//! sent for every entity it currently knows. A broadcast diffs the table
//! against the view and emits the four lifecycle lists. The view is updated
//! in the same pass, so the next tick diffs against what actually went out.

use crate::entity::EntityState;
use crate::table::EntityTable;
use shared::{diff_fields, merge_fields, EntityDelta, EntityId, FieldMap, UpdatePacket};
use std::collections::HashMap;

/// What one connection has been told so far.
#[derive(Debug, Default)]
pub struct SnapshotView {
    known: HashMap<EntityId, FieldMap>,
}

impl SnapshotView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knows(&self, id: EntityId) -> bool {
        self.known.contains_key(&id)
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }
}

/// Builds the update for one connection and advances its view. Entities are
/// visited in ascending id order so every connection sees the same tick in
/// the same order.
pub fn build_update(view: &mut SnapshotView, table: &EntityTable, tick: u64) -> UpdatePacket {
    let mut update = UpdatePacket::empty(tick);

    for id in table.sorted_ids() {
        let entity = match table.get(id) {
            Some(entity) => entity,
            None => continue,
        };

        match entity.state {
            EntityState::Alive => {
                let fields = entity.fields();
                match view.known.get_mut(&id) {
                    Some(sent) => {
                        let delta = diff_fields(sent, &fields);
                        if !delta.is_empty() {
                            merge_fields(sent, &delta);
                            update.updated.push(EntityDelta { id, fields: delta });
                        }
                    }
                    None => {
                        view.known.insert(id, fields.clone());
                        update.appeared.push(entity.record());
                    }
                }
            }
            EntityState::Hidden => {
                // Soft removal: only connections that knew it hear about it,
                // and it may appear again later as a fresh full record.
                if view.known.remove(&id).is_some() {
                    update.disappeared.push(id);
                }
            }
            EntityState::Destroyed => {
                if view.known.remove(&id).is_some() {
                    update.destroyed.push(id);
                }
            }
        }
    }

    // Entities purged from the table without a Destroyed broadcast would be
    // leaked client-side; sweep anything the view knows that no longer exists.
    let stale: Vec<EntityId> = view
        .known
        .keys()
        .copied()
        .filter(|id| table.get(*id).is_none())
        .collect();
    for id in stale {
        view.known.remove(&id);
        update.destroyed.push(id);
    }

    update
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{FieldTag, FieldValue, Vec2};

    #[test]
    fn test_first_sight_is_appeared_with_full_record() {
        let mut table = EntityTable::new();
        let id = table.spawn_player("ada");
        let mut view = SnapshotView::new();

        let update = build_update(&mut view, &table, 1);
        assert_eq!(update.appeared.len(), 1);
        assert_eq!(update.appeared[0].id, id);
        assert!(update.updated.is_empty());
        assert!(view.knows(id));
    }

    #[test]
    fn test_unchanged_entity_emits_nothing() {
        let mut table = EntityTable::new();
        table.spawn_static_prop(Vec2::new(100.0, 100.0), 0, "crate");
        let mut view = SnapshotView::new();

        build_update(&mut view, &table, 1);
        let update = build_update(&mut view, &table, 2);
        assert!(update.is_empty());
    }

    #[test]
    fn test_change_emits_only_changed_tags() {
        let mut table = EntityTable::new();
        let id = table.spawn_player("ada");
        let mut view = SnapshotView::new();
        build_update(&mut view, &table, 1);

        table.get_mut(id).unwrap().health = 0.5;
        let update = build_update(&mut view, &table, 2);
        assert_eq!(update.updated.len(), 1);
        let delta = &update.updated[0];
        assert_eq!(delta.fields.len(), 1);
        assert_eq!(
            delta.fields.get(&FieldTag::Health),
            Some(&FieldValue::Float(0.5))
        );
    }

    #[test]
    fn test_hide_then_show_goes_disappeared_then_appeared() {
        let mut table = EntityTable::new();
        let id = table.spawn_player("ada");
        let mut view = SnapshotView::new();
        build_update(&mut view, &table, 1);

        table.set_hidden(id);
        let update = build_update(&mut view, &table, 2);
        assert_eq!(update.disappeared, vec![id]);
        assert!(update.destroyed.is_empty());
        assert!(!view.knows(id));

        table.set_visible(id);
        let update = build_update(&mut view, &table, 3);
        assert_eq!(update.appeared.len(), 1);
        assert_eq!(update.appeared[0].id, id);
    }

    #[test]
    fn test_destroy_reported_once_per_view() {
        let mut table = EntityTable::new();
        let id = table.spawn_pickup_orb(Vec2::new(50.0, 50.0));
        let mut view = SnapshotView::new();
        build_update(&mut view, &table, 1);

        table.destroy(id);
        let update = build_update(&mut view, &table, 2);
        assert_eq!(update.destroyed, vec![id]);

        table.purge_destroyed();
        let update = build_update(&mut view, &table, 3);
        assert!(update.is_empty());
    }

    #[test]
    fn test_destroy_never_seen_is_silent() {
        let mut table = EntityTable::new();
        let id = table.spawn_pickup_orb(Vec2::new(50.0, 50.0));
        table.destroy(id);

        // This view never learned about the orb
        let mut view = SnapshotView::new();
        let update = build_update(&mut view, &table, 1);
        assert!(update.is_empty());
    }

    #[test]
    fn test_late_joiner_gets_full_bootstrap() {
        let mut table = EntityTable::new();
        table.spawn_player("ada");
        table.spawn_static_prop(Vec2::new(200.0, 200.0), 1, "crate");
        table.spawn_pickup_orb(Vec2::new(300.0, 300.0));

        let mut early = SnapshotView::new();
        build_update(&mut early, &table, 1);

        let mut late = SnapshotView::new();
        let update = build_update(&mut late, &table, 50);
        assert_eq!(update.appeared.len(), 3);
        assert_eq!(late.known_count(), 3);
    }

    #[test]
    fn test_views_are_independent() {
        let mut table = EntityTable::new();
        let id = table.spawn_player("ada");
        let mut seen = SnapshotView::new();
        let mut unseen = SnapshotView::new();
        build_update(&mut seen, &table, 1);

        table.get_mut(id).unwrap().health = 0.1;
        let for_seen = build_update(&mut seen, &table, 2);
        let for_unseen = build_update(&mut unseen, &table, 2);

        assert_eq!(for_seen.updated.len(), 1);
        assert!(for_seen.appeared.is_empty());
        assert_eq!(for_unseen.appeared.len(), 1);
        assert!(for_unseen.updated.is_empty());
    }

    #[test]
    fn test_ids_emitted_in_ascending_order() {
        let mut table = EntityTable::new();
        for _ in 0..6 {
            table.spawn_pickup_orb(Vec2::ZERO);
        }
        let mut view = SnapshotView::new();
        let update = build_update(&mut view, &table, 1);
        let ids: Vec<_> = update.appeared.iter().map(|r| r.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }
}
