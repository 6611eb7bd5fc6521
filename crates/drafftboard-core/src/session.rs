//! One user's connection to a shared board.
//!
//! A [`BoardSession`] owns the local scene, the replica, both adapters and
//! the tool machine, and speaks [`WireMessage`]s to whatever relay the host
//! provides. Outgoing messages are queued as JSON strings and collected with
//! [`BoardSession::take_outgoing`]; incoming ones go to
//! [`BoardSession::handle_message`].

use crate::config::SessionConfig;
use crate::error::{SyncError, SyncResult};
use crate::feed::Subscription;
use crate::presence::{
    Identity, PresenceAdapter, PresenceChannel, PresenceSnapshot, PresenceState,
};
use crate::presence_render::PresenceRenderer;
use crate::replica::{ChangeBatch, CrdtReplica, ReplicatedMap};
use crate::scene::{ActiveSelection, Scene};
use crate::shapes::{FontStyle, SerializableColor, Shape, ShapeId, TextAlign};
use crate::sync::{BatchReport, PublishTarget, SyncAdapter};
use crate::tools::{PointerEvent, ToolEffect, ToolKind, ToolMachine};
use crate::wire::{WireMessage, decode_payload};
use kurbo::Affine;
use std::time::Instant;
use uuid::Uuid;

/// Live subscriptions of a connected session. Dropping them detaches the
/// session from the replica and the presence channel.
struct Subscriptions {
    changes: Subscription<ChangeBatch>,
    presence: Subscription<PresenceSnapshot>,
}

pub struct BoardSession {
    room: String,
    connection_id: String,
    config: SessionConfig,
    identity: Identity,
    scene: Scene,
    replica: CrdtReplica,
    sync: SyncAdapter,
    presence: PresenceAdapter,
    renderer: PresenceRenderer,
    tools: ToolMachine,
    subscriptions: Option<Subscriptions>,
    outgoing: Vec<String>,
}

impl BoardSession {
    pub fn new(room: impl Into<String>, identity: Identity, config: SessionConfig) -> Self {
        let connection_id = Uuid::new_v4().to_string();
        let presence = PresenceAdapter::new(PresenceChannel::new(
            connection_id.clone(),
            config.presence_timeout(),
        ));
        let renderer = PresenceRenderer::new(
            identity.id.clone(),
            config.indicator_inset,
            config.name_tag_offset,
        );
        Self {
            room: room.into(),
            connection_id,
            sync: SyncAdapter::new(config.throttle_interval()),
            tools: ToolMachine::new(&config),
            config,
            identity,
            scene: Scene::new(),
            replica: CrdtReplica::new(),
            presence,
            renderer,
            subscriptions: None,
            outgoing: Vec::new(),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn replica(&self) -> &CrdtReplica {
        &self.replica
    }

    pub fn renderer(&self) -> &PresenceRenderer {
        &self.renderer
    }

    pub fn tool(&self) -> ToolKind {
        self.tools.tool()
    }

    pub fn tools(&self) -> &ToolMachine {
        &self.tools
    }

    pub fn is_connected(&self) -> bool {
        self.subscriptions.is_some()
    }

    /// What this connection currently advertises to its peers.
    pub fn local_presence(&self) -> &PresenceState {
        self.presence.channel().local_state()
    }

    /// Distinct participants, local user first.
    pub fn participants(&self) -> Vec<Identity> {
        self.presence.participants()
    }

    /// When the next throttled publish falls due, if any is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sync.next_deadline()
    }

    /// Take queued outgoing messages.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outgoing)
    }

    fn queue(&mut self, message: WireMessage) {
        match message.to_json() {
            Ok(json) => self.outgoing.push(json),
            Err(e) => log::error!("Failed to encode outgoing message: {}", e),
        }
    }

    // --- Lifecycle ---

    /// Join the room: subscribe to replica and presence changes, announce
    /// the local identity and instantiate whatever the replica already holds.
    pub fn connect(&mut self) -> BatchReport {
        if self.is_connected() {
            return BatchReport::default();
        }
        self.subscriptions = Some(Subscriptions {
            changes: self.replica.subscribe(),
            presence: self.presence.subscribe(),
        });
        self.presence.announce_identity(self.identity.clone());
        // Peers forgot us on leave, so always send the full state once.
        self.presence.channel_mut().take_outgoing();
        let state = self.presence.channel().local_state().clone();

        self.queue(WireMessage::Join {
            room: self.room.clone(),
            from: self.connection_id.clone(),
        });
        self.queue(WireMessage::Awareness {
            room: self.room.clone(),
            from: self.connection_id.clone(),
            state,
        });
        if let Err(e) = self.queue_replica_updates() {
            log::warn!("Failed to export pending updates: {}", e);
        }

        let report = self.sync.reconcile(&mut self.scene, &self.replica);
        log::info!(
            "Connected to room {} as {} ({} shapes)",
            self.room,
            self.connection_id,
            self.scene.len()
        );
        report
    }

    /// Leave the room. Pending throttled publishes are flushed or dropped
    /// per configuration, then every subscription and decoration is released.
    /// Teardown always completes; failures along the way are logged.
    pub fn disconnect(&mut self) {
        let Some(subscriptions) = self.subscriptions.take() else {
            return;
        };

        if self.config.flush_on_disconnect {
            if let Err(e) = self.sync.flush_all(&mut self.scene, &mut self.replica) {
                log::warn!("Failed to flush pending publishes on disconnect: {}", e);
            }
        } else {
            let dropped = self.sync.discard_pending();
            if dropped > 0 {
                log::debug!("Dropped {} pending publishes on disconnect", dropped);
            }
        }
        match self.replica.export_pending() {
            Ok(Some(bytes)) => {
                self.queue(WireMessage::sync(&self.room, &self.connection_id, &bytes))
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to export final updates: {}", e),
        }
        self.queue(WireMessage::Leave {
            room: self.room.clone(),
            from: self.connection_id.clone(),
        });

        drop(subscriptions);
        self.presence.channel_mut().take_outgoing();
        self.presence.channel_mut().clear_remote();
        self.renderer.clear(&mut self.scene);
        log::info!("Disconnected from room {}", self.room);
    }

    // --- Inbound ---

    /// Process one message from the relay.
    pub fn handle_message(&mut self, json: &str, now: Instant) -> SyncResult<()> {
        let message = WireMessage::from_json(json)?;
        if message.room() != self.room || message.from() == self.connection_id {
            return Ok(());
        }
        if !self.is_connected() {
            log::debug!("Ignoring {} message while disconnected", self.room);
            return Ok(());
        }

        match message {
            WireMessage::Join { from, .. } => {
                log::info!("Peer {} joined room {}", from, self.room);
                let snapshot = self.replica.export_snapshot()?;
                self.queue(WireMessage::sync(&self.room, &self.connection_id, &snapshot));
                let state = self.presence.channel().local_state().clone();
                self.queue(WireMessage::Awareness {
                    room: self.room.clone(),
                    from: self.connection_id.clone(),
                    state,
                });
            }
            WireMessage::Sync { data, .. } => {
                let bytes = decode_payload(&data)?;
                self.replica.import(&bytes)?;
            }
            WireMessage::Awareness { from, state, .. } => {
                self.presence.channel_mut().apply_remote(&from, state, now);
            }
            WireMessage::Leave { from, .. } => {
                if self.presence.channel_mut().remove(&from) {
                    log::info!("Peer {} left room {}", from, self.room);
                }
            }
        }
        self.pump(now)
    }

    /// Run deferred work: trailing throttled publishes, queued remote
    /// batches, presence expiry and rendering, then queue outgoing messages.
    pub fn pump(&mut self, now: Instant) -> SyncResult<()> {
        self.sync
            .flush_due(now, &mut self.scene, &mut self.replica)?;

        let Some(subscriptions) = &self.subscriptions else {
            return Ok(());
        };
        let batches = subscriptions.changes.drain();
        for batch in &batches {
            self.sync
                .on_remote_batch(batch, &mut self.scene, &self.replica);
        }
        if !batches.is_empty() {
            // Remote deletes may have dropped the selected shape.
            self.presence
                .update_selection(self.scene.primary_selection());
        }

        self.presence.channel_mut().expire_stale(now);
        let snapshots = match &self.subscriptions {
            Some(subscriptions) => subscriptions.presence.drain(),
            None => Vec::new(),
        };
        if let Some(latest) = snapshots.last() {
            self.renderer.render(latest, &mut self.scene);
        }

        self.queue_replica_updates()?;
        self.presence.channel_mut().heartbeat(now);
        self.queue_presence();
        Ok(())
    }

    fn queue_replica_updates(&mut self) -> SyncResult<()> {
        if !self.is_connected() {
            return Ok(());
        }
        if let Some(bytes) = self.replica.export_pending()? {
            self.queue(WireMessage::sync(&self.room, &self.connection_id, &bytes));
        }
        Ok(())
    }

    fn queue_presence(&mut self) {
        let states = self.presence.channel_mut().take_outgoing();
        if !self.is_connected() {
            return;
        }
        for state in states {
            self.queue(WireMessage::Awareness {
                room: self.room.clone(),
                from: self.connection_id.clone(),
                state,
            });
        }
    }

    // --- Pointer input ---

    /// Switch tools. A shape left mid-creation is published as drawn so far.
    pub fn set_tool(&mut self, tool: ToolKind) -> SyncResult<()> {
        for effect in self.tools.set_tool(tool) {
            if let ToolEffect::Publish(target) = effect {
                self.sync
                    .publish(&target, &mut self.scene, &mut self.replica)?;
            }
        }
        self.queue_replica_updates()
    }

    pub fn pointer_down(&mut self, event: PointerEvent) -> SyncResult<()> {
        let effects = self.tools.pointer_down(event, &mut self.scene);
        self.apply_effects(effects, event.at)
    }

    pub fn pointer_move(&mut self, event: PointerEvent) -> SyncResult<()> {
        if let Some(point) = event.point {
            self.presence.update_pointer(point.x, point.y);
        }
        let effects = self.tools.pointer_move(event, &mut self.scene);
        self.apply_effects(effects, event.at)
    }

    pub fn pointer_up(&mut self, event: PointerEvent) -> SyncResult<()> {
        let effects = self.tools.pointer_up(event, &mut self.scene);
        self.apply_effects(effects, event.at)
    }

    fn apply_effects(&mut self, effects: Vec<ToolEffect>, now: Instant) -> SyncResult<()> {
        for effect in effects {
            match effect {
                ToolEffect::Publish(target) => {
                    self.sync
                        .publish(&target, &mut self.scene, &mut self.replica)?;
                }
                ToolEffect::PublishThrottled(target) => {
                    self.sync
                        .publish_throttled(&target, now, &mut self.scene, &mut self.replica)?;
                }
                ToolEffect::SelectionChanged(selection) => {
                    self.presence.update_selection(selection);
                }
                ToolEffect::ToolChanged(tool) => log::debug!("Tool switched to {:?}", tool),
            }
        }
        self.pump(now)
    }

    // --- Selection ---

    fn active_target(&self) -> Option<PublishTarget> {
        match self.scene.active_selection()? {
            ActiveSelection::Single(id) => Some(PublishTarget::Shape(id.clone())),
            ActiveSelection::Multi { .. } => Some(PublishTarget::Selection),
        }
    }

    pub fn select(&mut self, id: &ShapeId) -> bool {
        let selected = self.scene.select(id);
        self.presence.update_selection(self.scene.primary_selection());
        self.queue_presence();
        selected
    }

    /// Select several shapes. Refused while a shape is being created.
    pub fn select_many(&mut self, ids: &[ShapeId]) -> bool {
        if !self.tools.multi_select_enabled() {
            return false;
        }
        let selected = self.scene.select_many(ids);
        self.presence.update_selection(self.scene.primary_selection());
        self.queue_presence();
        selected
    }

    pub fn clear_selection(&mut self) {
        self.scene.clear_selection();
        self.presence.update_selection(None);
        self.queue_presence();
    }

    /// Apply an interactive transform (scale, rotate) to the selection.
    pub fn transform_selection(&mut self, affine: Affine, now: Instant) -> SyncResult<()> {
        let Some(target) = self.active_target() else {
            return Ok(());
        };
        self.scene.transform_selection(affine);
        self.sync
            .publish_throttled(&target, now, &mut self.scene, &mut self.replica)?;
        self.pump(now)
    }

    /// End of an interactive transform: publish the final state.
    pub fn finish_transform(&mut self, now: Instant) -> SyncResult<()> {
        let Some(target) = self.active_target() else {
            return Ok(());
        };
        self.sync
            .publish(&target, &mut self.scene, &mut self.replica)?;
        self.pump(now)
    }

    // --- Property edits ---

    fn edit_selected<F: Fn(&mut Shape)>(&mut self, now: Instant, edit: F) -> SyncResult<bool> {
        let Some(target) = self.active_target() else {
            return Ok(false);
        };
        for id in self.scene.selected_ids() {
            self.scene.modify(&id, &edit);
        }
        self.sync
            .publish_throttled(&target, now, &mut self.scene, &mut self.replica)?;
        self.pump(now)?;
        Ok(true)
    }

    pub fn set_fill(&mut self, color: SerializableColor, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| shape.style.fill = color)
    }

    pub fn set_stroke(&mut self, color: SerializableColor, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| shape.style.stroke = color)
    }

    pub fn set_stroke_width(&mut self, width: f64, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| shape.style.stroke_width = width.max(0.0))
    }

    /// Opacity is clamped to `[0, 1]`.
    pub fn set_opacity(&mut self, opacity: f64, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| shape.style.set_opacity(opacity))
    }

    pub fn set_label(&mut self, label: &str, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| shape.label = label.to_string())
    }

    pub fn set_visible(&mut self, visible: bool, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| shape.visible = visible)
    }

    /// Resize in world units. Kinds without the requested dimension ignore it.
    pub fn set_size(
        &mut self,
        width: Option<f64>,
        height: Option<f64>,
        now: Instant,
    ) -> SyncResult<bool> {
        self.edit_selected(now, |shape| {
            shape.set_size(width, height);
        })
    }

    /// Rectangles only; negative radii clamp to 0.
    pub fn set_corner_radius(&mut self, radius: f64, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| {
            shape.set_corner_radius(radius);
        })
    }

    /// Replace the content of selected text boxes.
    pub fn set_text(&mut self, text: &str, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| {
            shape.set_text(text);
        })
    }

    pub fn set_font_size(&mut self, size: f64, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| {
            shape.set_font_size(size);
        })
    }

    pub fn set_font_family(&mut self, family: &str, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| {
            if let Some(format) = shape.text_format_mut() {
                format.font_family = family.to_string();
            }
        })
    }

    pub fn set_text_align(&mut self, align: TextAlign, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| {
            if let Some(format) = shape.text_format_mut() {
                format.align = align;
            }
        })
    }

    pub fn set_font_style(&mut self, style: FontStyle, now: Instant) -> SyncResult<bool> {
        self.edit_selected(now, |shape| {
            if let Some(format) = shape.text_format_mut() {
                format.font_style = style;
            }
        })
    }

    /// Delete the selected shapes everywhere.
    pub fn delete_selected(&mut self, now: Instant) -> SyncResult<usize> {
        let Some(target) = self.active_target() else {
            return Ok(0);
        };
        let ids = self.scene.selected_ids();
        let removed = self.sync.delete(&target, &self.scene, &mut self.replica)?;
        for id in &ids {
            self.scene.remove_shape(id);
        }
        self.presence.update_selection(None);
        self.pump(now)?;
        Ok(removed)
    }

    // --- Layers (local only) ---

    pub fn bring_forward(&mut self, id: &ShapeId) -> bool {
        self.scene.bring_forward(id)
    }

    pub fn send_backward(&mut self, id: &ShapeId) -> bool {
        self.scene.send_backward(id)
    }

    /// Look up the stored record for a shape.
    pub fn stored_record(&self, id: &ShapeId) -> Option<String> {
        self.replica.get(id.as_str())
    }

    /// Fail with `NotConnected` unless the session is in a room.
    pub fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }
}

impl Drop for BoardSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity(name: &str) -> Identity {
        Identity {
            id: format!("id-{}", name),
            name: name.to_string(),
            color: "#00aa00".to_string(),
        }
    }

    fn session(name: &str) -> BoardSession {
        BoardSession::new("room", identity(name), SessionConfig::default())
    }

    #[test]
    fn test_connect_queues_join_and_presence() {
        let mut s = session("ann");
        assert!(s.ensure_connected().is_err());
        s.connect();
        assert!(s.ensure_connected().is_ok());
        let out = s.take_outgoing();
        assert_eq!(out.len(), 2);
        assert!(matches!(
            WireMessage::from_json(&out[0]).unwrap(),
            WireMessage::Join { .. }
        ));
        let WireMessage::Awareness { state, .. } = WireMessage::from_json(&out[1]).unwrap() else {
            panic!("Expected awareness");
        };
        assert_eq!(state.identity.map(|i| i.name), Some("ann".to_string()));

        assert_eq!(s.connect(), BatchReport::default());
        assert!(s.take_outgoing().is_empty());
    }

    #[test]
    fn test_disconnect_releases_subscriptions() {
        let mut s = session("ann");
        s.connect();
        assert_eq!(s.replica().subscriber_count(), 1);
        s.disconnect();
        assert_eq!(s.replica().subscriber_count(), 0);
        assert!(!s.is_connected());
        let out = s.take_outgoing();
        assert!(matches!(
            WireMessage::from_json(out.last().unwrap()).unwrap(),
            WireMessage::Leave { .. }
        ));
        s.disconnect();
        assert!(s.take_outgoing().is_empty());
    }

    #[test]
    fn test_messages_for_other_rooms_ignored() {
        let mut s = session("ann");
        s.connect();
        s.take_outgoing();
        let foreign = WireMessage::Join {
            room: "elsewhere".to_string(),
            from: "x".to_string(),
        };
        s.handle_message(&foreign.to_json().unwrap(), Instant::now())
            .unwrap();
        assert!(s.take_outgoing().is_empty());
    }

    #[test]
    fn test_join_answered_with_snapshot_and_presence() {
        let mut s = session("ann");
        s.connect();
        s.take_outgoing();
        let join = WireMessage::Join {
            room: "room".to_string(),
            from: "peer".to_string(),
        };
        s.handle_message(&join.to_json().unwrap(), Instant::now())
            .unwrap();
        let out: Vec<WireMessage> = s
            .take_outgoing()
            .iter()
            .map(|json| WireMessage::from_json(json).unwrap())
            .collect();
        assert!(matches!(out[0], WireMessage::Sync { .. }));
        assert!(matches!(out[1], WireMessage::Awareness { .. }));
    }

    #[test]
    fn test_garbage_input_is_an_error() {
        let mut s = session("ann");
        s.connect();
        assert!(s.handle_message("not json", Instant::now()).is_err());
    }

    #[test]
    fn test_property_edit_clamps_and_publishes() {
        let mut s = session("ann");
        s.connect();
        let t0 = Instant::now();
        s.set_tool(ToolKind::Rect).unwrap();
        s.pointer_down(PointerEvent::new(0.0, 0.0, t0)).unwrap();
        s.pointer_up(PointerEvent::new(30.0, 30.0, t0)).unwrap();
        let id = s.scene().shapes_ordered().next().unwrap().id().clone();
        assert!(s.select(&id));

        let later = t0 + Duration::from_millis(100);
        assert!(s.set_opacity(3.0, later).unwrap());
        let stored = s.stored_record(&id).unwrap();
        assert!(stored.contains("\"opacity\":1.0"));

        assert!(s.set_opacity(0.25, later + Duration::from_millis(100)).unwrap());
        assert!(s.stored_record(&id).unwrap().contains("\"opacity\":0.25"));
    }

    #[test]
    fn test_no_selection_no_edit() {
        let mut s = session("ann");
        assert!(!s.set_fill(SerializableColor::black(), Instant::now()).unwrap());
        assert_eq!(s.delete_selected(Instant::now()).unwrap(), 0);
    }

    #[test]
    fn test_delete_selected() {
        let mut s = session("ann");
        s.connect();
        let t0 = Instant::now();
        s.set_tool(ToolKind::Circle).unwrap();
        s.pointer_down(PointerEvent::new(0.0, 0.0, t0)).unwrap();
        s.pointer_up(PointerEvent::new(10.0, 0.0, t0)).unwrap();
        let id = s.scene().shapes_ordered().next().unwrap().id().clone();
        s.select(&id);
        assert_eq!(s.delete_selected(t0).unwrap(), 1);
        assert!(s.scene().is_empty());
        assert!(s.stored_record(&id).is_none());
    }

    #[test]
    fn test_pending_throttle_flushed_on_disconnect() {
        let mut s = session("ann");
        s.connect();
        let t0 = Instant::now();
        s.set_tool(ToolKind::Rect).unwrap();
        s.pointer_down(PointerEvent::new(0.0, 0.0, t0)).unwrap();
        s.pointer_up(PointerEvent::new(30.0, 30.0, t0)).unwrap();
        let id = s.scene().shapes_ordered().next().unwrap().id().clone();

        s.pointer_down(PointerEvent::new(5.0, 5.0, t0)).unwrap();
        s.pointer_move(PointerEvent::new(6.0, 5.0, t0)).unwrap();
        s.pointer_move(PointerEvent::new(50.0, 5.0, t0 + Duration::from_millis(1)))
            .unwrap();
        assert!(s.next_deadline().is_some());

        s.disconnect();
        let stored = s.stored_record(&id).unwrap();
        assert!(stored.contains("\"left\":45.0"));
    }
}
