//! Draws remote cursors and selection indicators from presence snapshots.

use crate::presence::{Identity, PresenceSnapshot};
use crate::scene::{DecorationId, Scene};
use crate::shapes::SerializableColor;
use kurbo::Point;
use std::collections::{HashMap, HashSet};

/// Keeps the scene's presence decorations in step with the latest snapshot.
///
/// Cursors are keyed by identity id, so several connections of the same
/// person share one cursor. Selection indicators are rebuilt on every
/// render; the scene keeps them attached to their target between renders.
#[derive(Debug)]
pub struct PresenceRenderer {
    local_identity: String,
    cursors: HashMap<String, DecorationId>,
    indicators: Vec<DecorationId>,
    inset: f64,
    tag_offset: f64,
}

fn identity_color(identity: &Identity) -> SerializableColor {
    SerializableColor::from_hex(&identity.color).unwrap_or_else(SerializableColor::black)
}

impl PresenceRenderer {
    pub fn new(local_identity: impl Into<String>, inset: f64, tag_offset: f64) -> Self {
        Self {
            local_identity: local_identity.into(),
            cursors: HashMap::new(),
            indicators: Vec::new(),
            inset,
            tag_offset,
        }
    }

    pub fn cursor_for(&self, identity_id: &str) -> Option<DecorationId> {
        self.cursors.get(identity_id).copied()
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn indicator_count(&self) -> usize {
        self.indicators.len()
    }

    pub fn render(&mut self, snapshot: &PresenceSnapshot, scene: &mut Scene) {
        let remote: Vec<&Identity> = snapshot
            .values()
            .filter_map(|state| state.identity.as_ref())
            .filter(|identity| identity.id != self.local_identity)
            .collect();
        let present: HashSet<&str> = remote.iter().map(|identity| identity.id.as_str()).collect();

        self.cursors.retain(|owner, decoration| {
            let keep = present.contains(owner.as_str());
            if !keep {
                scene.remove_decoration(*decoration);
            }
            keep
        });

        for state in snapshot.values() {
            let (Some(identity), Some(pointer)) = (&state.identity, &state.pointer) else {
                continue;
            };
            if identity.id == self.local_identity {
                continue;
            }
            let at = Point::new(pointer.x, pointer.y);
            let moved = self
                .cursors
                .get(&identity.id)
                .is_some_and(|decoration| scene.move_cursor(*decoration, at));
            if !moved {
                let decoration =
                    scene.add_cursor(&identity.id, &identity.name, identity_color(identity), at);
                self.cursors.insert(identity.id.clone(), decoration);
            }
        }

        for decoration in self.indicators.drain(..) {
            scene.remove_decoration(decoration);
        }
        for state in snapshot.values() {
            let (Some(identity), Some(selection)) = (&state.identity, &state.selection) else {
                continue;
            };
            if identity.id == self.local_identity {
                continue;
            }
            if let Some((border, tag)) = scene.add_selection_indicator(
                &identity.id,
                &identity.name,
                identity_color(identity),
                &selection.shape_id,
                self.inset,
                self.tag_offset,
            ) {
                self.indicators.push(border);
                self.indicators.push(tag);
            }
        }

        scene.raise_cursors();
        scene.request_render();
    }

    /// Remove every decoration this renderer placed.
    pub fn clear(&mut self, scene: &mut Scene) {
        for (_, decoration) in self.cursors.drain() {
            scene.remove_decoration(decoration);
        }
        for decoration in self.indicators.drain(..) {
            scene.remove_decoration(decoration);
        }
        scene.request_render();
    }
}
