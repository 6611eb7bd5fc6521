//! Persisted per-user display color.

use crate::error::{SyncError, SyncResult};
use crate::presence::Identity;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

/// Somewhere to keep the local user's color between sessions.
pub trait IdentityStore {
    fn load_color(&self) -> SyncResult<Option<String>>;
    fn save_color(&self, color: &str) -> SyncResult<()>;
}

/// Store that forgets everything when dropped.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    color: RefCell<Option<String>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load_color(&self) -> SyncResult<Option<String>> {
        Ok(self.color.borrow().clone())
    }

    fn save_color(&self, color: &str) -> SyncResult<()> {
        *self.color.borrow_mut() = Some(color.to_string());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    color: String,
}

/// JSON file store.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<local data dir>/drafftboard/identity.json`
    pub fn default_location() -> SyncResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| SyncError::Store("Could not determine home directory".to_string()))?;
        Ok(Self::new(base.join("drafftboard").join("identity.json")))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn load_color(&self) -> SyncResult<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path).map_err(|e| {
            SyncError::Store(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        let stored: StoredIdentity = serde_json::from_str(&json)
            .map_err(|e| SyncError::Store(format!("Invalid identity file: {}", e)))?;
        Ok(Some(stored.color))
    }

    fn save_color(&self, color: &str) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SyncError::Store(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let json = serde_json::to_string(&StoredIdentity {
            color: color.to_string(),
        })?;
        fs::write(&self.path, json).map_err(|e| {
            SyncError::Store(format!("Failed to write {}: {}", self.path.display(), e))
        })
    }
}

/// Random `#rrggbb` color.
pub fn random_color() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    format!("#{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2])
}

/// The stored color, or a fresh one saved for next time. Store failures
/// are logged and fall back to an unsaved random color.
pub fn session_color(store: &dyn IdentityStore) -> String {
    match store.load_color() {
        Ok(Some(color)) => return color,
        Ok(None) => {}
        Err(e) => log::warn!("Failed to load identity color: {}", e),
    }
    let color = random_color();
    if let Err(e) = store.save_color(&color) {
        log::warn!("Failed to save identity color: {}", e);
    }
    color
}

/// Build an identity with a fresh id and the persisted color.
pub fn local_identity(name: impl Into<String>, store: &dyn IdentityStore) -> Identity {
    Identity {
        id: Uuid::new_v4().to_string(),
        name: name.into(),
        color: session_color(store),
    }
}
