//! Error types for the sync engine.

use thiserror::Error;

/// Errors produced by the sync and presence engine.
///
/// None of these are fatal to a session: callers log them and carry on
/// with the rest of the batch.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An incoming shared record is missing a required field or has a bad value.
    #[error("Malformed record {id}: {reason}")]
    MalformedRecord { id: String, reason: String },
    /// The replicated map rejected an operation.
    #[error("Replica error: {0}")]
    Replica(String),
    /// A wire envelope could not be encoded or decoded.
    #[error("Wire error: {0}")]
    Wire(String),
    /// The identity store failed to load or save.
    #[error("Identity store error: {0}")]
    Store(String),
    /// The session is not connected to a room.
    #[error("Session is not connected")]
    NotConnected,
}

impl SyncError {
    pub(crate) fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

impl From<loro::LoroError> for SyncError {
    fn from(err: loro::LoroError) -> Self {
        Self::Replica(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Wire(err.to_string())
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
