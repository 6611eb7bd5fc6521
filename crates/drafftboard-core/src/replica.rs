//! Replicated map of shape records.
//!
//! Every shape lives under its id as a serialized [`SharedRecord`] string in a
//! single map. [`CrdtReplica`] backs the map with a Loro document:
//!
//! ```text
//! LoroDoc
//! └── "objects": LoroMap<ShapeId, String>
//! ```
//!
//! Changes are delivered to subscribers in batches. Local writes produce a
//! batch of one change flagged as local origin; each imported update
//! produces one batch of remote-origin changes.
//!
//! [`SharedRecord`]: crate::shapes::SharedRecord

use crate::error::{SyncError, SyncResult};
use crate::feed::{Feed, Subscription};
use loro::{ExportMode, LoroDoc, LoroMap, LoroValue, ValueOrContainer, VersionVector};
use std::collections::{BTreeMap, HashMap};

/// Key for the shape map in the document.
pub const OBJECTS_KEY: &str = "objects";

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

/// One key-level change inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub id: String,
    pub action: ChangeAction,
    /// True when the change was made through this replica rather than imported.
    pub local_origin: bool,
}

impl KeyChange {
    pub fn local(id: impl Into<String>, action: ChangeAction) -> Self {
        Self {
            id: id.into(),
            action,
            local_origin: true,
        }
    }

    pub fn remote(id: impl Into<String>, action: ChangeAction) -> Self {
        Self {
            id: id.into(),
            action,
            local_origin: false,
        }
    }
}

/// A batch of changes delivered together.
pub type ChangeBatch = Vec<KeyChange>;

/// Shared key/value map of serialized shape records.
pub trait ReplicatedMap {
    fn get(&self, id: &str) -> Option<String>;

    /// Store a record. Emits an `Add` or `Update` with local origin.
    fn set(&mut self, id: &str, record: &str) -> SyncResult<()>;

    /// Remove a record. Deleting a missing key is a no-op.
    fn delete(&mut self, id: &str) -> SyncResult<()>;

    /// All entries, ordered by id.
    fn entries(&self) -> Vec<(String, String)>;

    /// Subscribe to change batches. Dropping the subscription unsubscribes.
    fn subscribe(&mut self) -> Subscription<ChangeBatch>;

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compute the key changes between two views of the map.
fn diff_entries(
    before: &HashMap<String, String>,
    after: &HashMap<String, String>,
) -> ChangeBatch {
    let mut changes: Vec<KeyChange> = after
        .iter()
        .filter_map(|(id, value)| match before.get(id) {
            None => Some(KeyChange::remote(id.clone(), ChangeAction::Add)),
            Some(old) if old != value => Some(KeyChange::remote(id.clone(), ChangeAction::Update)),
            Some(_) => None,
        })
        .collect();
    changes.extend(
        before
            .keys()
            .filter(|id| !after.contains_key(*id))
            .map(|id| KeyChange::remote(id.clone(), ChangeAction::Delete)),
    );
    changes.sort_by(|a, b| a.id.cmp(&b.id));
    changes
}

/// Loro-backed replicated map.
pub struct CrdtReplica {
    doc: LoroDoc,
    feed: Feed<ChangeBatch>,
    /// Version up to which local operations have been handed out by `export_pending`.
    exported: VersionVector,
}

impl CrdtReplica {
    pub fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            feed: Feed::default(),
            exported: VersionVector::default(),
        }
    }

    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    fn objects(&self) -> LoroMap {
        self.doc.get_map(OBJECTS_KEY)
    }

    fn snapshot_map(&self) -> HashMap<String, String> {
        let mut result = HashMap::new();
        if let LoroValue::Map(map) = self.objects().get_deep_value() {
            for (id, value) in map.iter() {
                match value {
                    LoroValue::String(s) => {
                        result.insert(id.clone(), s.to_string());
                    }
                    _ => log::warn!("Ignoring non-string entry '{}' in shared map", id),
                }
            }
        }
        result
    }

    /// Current version of the document.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    /// Export the full document state.
    pub fn export_snapshot(&self) -> SyncResult<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| SyncError::Replica(e.to_string()))
    }

    /// Export updates since a version.
    pub fn export_updates(&self, since: &VersionVector) -> SyncResult<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(since))
            .map_err(|e| SyncError::Replica(e.to_string()))
    }

    /// Export everything not yet handed out, or `None` when nothing changed.
    pub fn export_pending(&mut self) -> SyncResult<Option<Vec<u8>>> {
        let current = self.doc.oplog_vv();
        if current == self.exported {
            return Ok(None);
        }
        let bytes = self.export_updates(&self.exported)?;
        self.exported = current;
        Ok(Some(bytes))
    }

    /// Import an update or snapshot from another replica and notify
    /// subscribers with the resulting remote-origin batch.
    pub fn import(&mut self, bytes: &[u8]) -> SyncResult<ChangeBatch> {
        let was_synced = self.doc.oplog_vv() == self.exported;
        let before = self.snapshot_map();
        self.doc.import(bytes)?;
        let after = self.snapshot_map();
        if was_synced {
            // Imported operations are not ours to forward.
            self.exported = self.doc.oplog_vv();
        }

        let changes = diff_entries(&before, &after);
        if !changes.is_empty() {
            log::debug!("Imported update with {} changed records", changes.len());
            self.feed.publish(changes.clone());
        }
        Ok(changes)
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }
}

impl Default for CrdtReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedMap for CrdtReplica {
    fn get(&self, id: &str) -> Option<String> {
        match self.objects().get(id) {
            Some(ValueOrContainer::Value(LoroValue::String(s))) => Some(s.to_string()),
            _ => None,
        }
    }

    fn set(&mut self, id: &str, record: &str) -> SyncResult<()> {
        let map = self.objects();
        let action = match self.get(id) {
            Some(existing) if existing == record => return Ok(()),
            Some(_) => ChangeAction::Update,
            None => ChangeAction::Add,
        };
        map.insert(id, record.to_string())?;
        self.doc.commit();
        self.feed.publish(vec![KeyChange::local(id, action)]);
        Ok(())
    }

    fn delete(&mut self, id: &str) -> SyncResult<()> {
        if self.get(id).is_none() {
            return Ok(());
        }
        self.objects().delete(id)?;
        self.doc.commit();
        self.feed.publish(vec![KeyChange::local(id, ChangeAction::Delete)]);
        Ok(())
    }

    fn entries(&self) -> Vec<(String, String)> {
        let map: BTreeMap<String, String> = self.snapshot_map().into_iter().collect();
        map.into_iter().collect()
    }

    fn subscribe(&mut self) -> Subscription<ChangeBatch> {
        self.feed.subscribe()
    }

    fn len(&self) -> usize {
        self.objects().len()
    }
}

/// In-memory map without replication, for tests and offline use.
///
/// Remote changes are simulated with [`MemoryReplica::apply_remote`].
#[derive(Default)]
pub struct MemoryReplica {
    entries: BTreeMap<String, String>,
    feed: Feed<ChangeBatch>,
}

impl MemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write or remove a set of keys as if a peer had done it, delivering one batch.
    pub fn apply_remote(&mut self, writes: Vec<(&str, Option<&str>)>) -> ChangeBatch {
        let before: HashMap<String, String> = self.entries.clone().into_iter().collect();
        for (id, value) in writes {
            match value {
                Some(value) => {
                    self.entries.insert(id.to_string(), value.to_string());
                }
                None => {
                    self.entries.remove(id);
                }
            }
        }
        let after: HashMap<String, String> = self.entries.clone().into_iter().collect();
        let changes = diff_entries(&before, &after);
        if !changes.is_empty() {
            self.feed.publish(changes.clone());
        }
        changes
    }
}

impl ReplicatedMap for MemoryReplica {
    fn get(&self, id: &str) -> Option<String> {
        self.entries.get(id).cloned()
    }

    fn set(&mut self, id: &str, record: &str) -> SyncResult<()> {
        let action = match self.entries.insert(id.to_string(), record.to_string()) {
            Some(previous) if previous == record => return Ok(()),
            Some(_) => ChangeAction::Update,
            None => ChangeAction::Add,
        };
        self.feed.publish(vec![KeyChange::local(id, action)]);
        Ok(())
    }

    fn delete(&mut self, id: &str) -> SyncResult<()> {
        if self.entries.remove(id).is_some() {
            self.feed.publish(vec![KeyChange::local(id, ChangeAction::Delete)]);
        }
        Ok(())
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn subscribe(&mut self) -> Subscription<ChangeBatch> {
        self.feed.subscribe()
    }
}
