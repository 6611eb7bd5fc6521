//! Ephemeral per-connection presence: who is here, where their pointer is,
//! and what they have selected.

use crate::feed::{Feed, Subscription};
use crate::shapes::ShapeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Transport-assigned id of one connection.
pub type ConnectionId = String;

/// Who a participant is. Stable across that participant's connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    /// Hex color, e.g. `#3fa9f5`.
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRef {
    pub shape_id: ShapeId,
}

/// State one connection advertises.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<PointerPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRef>,
}

/// A single field update. Setting one field never touches the others.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceField {
    Identity(Identity),
    Pointer(Option<PointerPosition>),
    Selection(Option<SelectionRef>),
}

impl PresenceState {
    pub fn set_field(&mut self, field: PresenceField) {
        match field {
            PresenceField::Identity(identity) => self.identity = Some(identity),
            PresenceField::Pointer(pointer) => self.pointer = pointer,
            PresenceField::Selection(selection) => self.selection = selection,
        }
    }
}

/// Every known connection's state, local included.
pub type PresenceSnapshot = BTreeMap<ConnectionId, PresenceState>;

#[derive(Debug, Clone)]
struct RemoteEntry {
    state: PresenceState,
    last_seen: Instant,
}

/// Presence store for one room.
///
/// Local updates are queued for broadcast; remote states arrive whole and
/// replace what was known for that connection. Any change notifies
/// subscribers with a full snapshot.
#[derive(Debug)]
pub struct PresenceChannel {
    local_id: ConnectionId,
    local: PresenceState,
    remote: HashMap<ConnectionId, RemoteEntry>,
    timeout: Duration,
    outgoing: Vec<PresenceState>,
    /// When the local state last went out, as seen by `heartbeat`.
    last_broadcast: Option<Instant>,
    feed: Feed<PresenceSnapshot>,
}

impl PresenceChannel {
    pub fn new(local_id: impl Into<ConnectionId>, timeout: Duration) -> Self {
        Self {
            local_id: local_id.into(),
            local: PresenceState::default(),
            remote: HashMap::new(),
            timeout,
            outgoing: Vec::new(),
            last_broadcast: None,
            feed: Feed::default(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_state(&self) -> &PresenceState {
        &self.local
    }

    /// Merge one field into the local state and queue it for broadcast.
    pub fn set_local_field(&mut self, field: PresenceField) {
        self.local.set_field(field);
        self.outgoing.push(self.local.clone());
        self.notify();
    }

    /// Local states waiting to be sent, oldest first.
    pub fn take_outgoing(&mut self) -> Vec<PresenceState> {
        std::mem::take(&mut self.outgoing)
    }

    /// Re-queue the unchanged local state once half the timeout has passed
    /// without a broadcast, so peers do not expire an idle connection.
    /// Returns whether a heartbeat was queued.
    pub fn heartbeat(&mut self, now: Instant) -> bool {
        let due = self.outgoing.is_empty()
            && self
                .last_broadcast
                .is_none_or(|last| now.duration_since(last) >= self.timeout / 2);
        if due {
            self.outgoing.push(self.local.clone());
        }
        if !self.outgoing.is_empty() {
            self.last_broadcast = Some(now);
        }
        due
    }

    /// Record a peer's full state.
    pub fn apply_remote(&mut self, connection: &str, state: PresenceState, now: Instant) {
        if connection == self.local_id {
            return;
        }
        let changed = self
            .remote
            .get(connection)
            .is_none_or(|entry| entry.state != state);
        self.remote.insert(
            connection.to_string(),
            RemoteEntry {
                state,
                last_seen: now,
            },
        );
        if changed {
            self.notify();
        }
    }

    /// Forget a connection. Returns whether it was known.
    pub fn remove(&mut self, connection: &str) -> bool {
        let removed = self.remote.remove(connection).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    /// Drop connections silent for longer than the timeout.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<ConnectionId> {
        let timeout = self.timeout;
        let stale: Vec<ConnectionId> = self
            .remote
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            log::info!("Presence of connection {} expired", id);
            self.remote.remove(id);
        }
        if !stale.is_empty() {
            self.notify();
        }
        stale
    }

    /// Forget every peer.
    pub fn clear_remote(&mut self) {
        if !self.remote.is_empty() {
            self.remote.clear();
            self.notify();
        }
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        let mut snapshot: PresenceSnapshot = self
            .remote
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state.clone()))
            .collect();
        snapshot.insert(self.local_id.clone(), self.local.clone());
        snapshot
    }

    pub fn subscribe(&mut self) -> Subscription<PresenceSnapshot> {
        self.feed.subscribe()
    }

    fn notify(&mut self) {
        let snapshot = self.snapshot();
        self.feed.publish(snapshot);
    }
}

/// Typed front for the local user's presence.
#[derive(Debug)]
pub struct PresenceAdapter {
    channel: PresenceChannel,
    identity: Option<Identity>,
}

impl PresenceAdapter {
    pub fn new(channel: PresenceChannel) -> Self {
        Self {
            channel,
            identity: None,
        }
    }

    pub fn channel(&self) -> &PresenceChannel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut PresenceChannel {
        &mut self.channel
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Publish the local identity. Only the first call has any effect.
    pub fn announce_identity(&mut self, identity: Identity) -> bool {
        if self.identity.is_some() {
            return false;
        }
        self.identity = Some(identity.clone());
        self.channel.set_local_field(PresenceField::Identity(identity));
        true
    }

    /// Publish the pointer position. Sent on every call.
    pub fn update_pointer(&mut self, x: f64, y: f64) {
        self.channel
            .set_local_field(PresenceField::Pointer(Some(PointerPosition { x, y })));
    }

    pub fn clear_pointer(&mut self) {
        self.channel.set_local_field(PresenceField::Pointer(None));
    }

    /// Publish what the local user has selected. Skipped when unchanged.
    pub fn update_selection(&mut self, shape: Option<ShapeId>) {
        let selection = shape.map(|shape_id| SelectionRef { shape_id });
        if self.channel.local_state().selection == selection {
            return;
        }
        self.channel
            .set_local_field(PresenceField::Selection(selection));
    }

    /// Distinct identities in the room, local user first, then by name.
    pub fn participants(&self) -> Vec<Identity> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        if let Some(identity) = &self.identity {
            seen.insert(identity.id.clone());
            result.push(identity.clone());
        }
        let mut remote: Vec<Identity> = self
            .channel
            .snapshot()
            .into_values()
            .filter_map(|state| state.identity)
            .filter(|identity| seen.insert(identity.id.clone()))
            .collect();
        remote.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        result.extend(remote);
        result
    }

    pub fn subscribe(&mut self) -> Subscription<PresenceSnapshot> {
        self.channel.subscribe()
    }
}
