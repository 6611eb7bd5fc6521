//! Drafftboard Core Library
//!
//! Shared-canvas engine for the Drafftboard collaborative editor: shape
//! model, replicated document binding, presence, and the pointer tool
//! state machine.

pub mod config;
pub mod error;
pub mod feed;
pub mod identity;
pub mod presence;
pub mod presence_render;
pub mod replica;
pub mod scene;
pub mod session;
pub mod shapes;
pub mod sync;
pub mod throttle;
pub mod tools;
pub mod wire;

pub use config::SessionConfig;
pub use error::{SyncError, SyncResult};
pub use identity::{FileIdentityStore, IdentityStore, MemoryIdentityStore};
pub use presence::{Identity, PresenceAdapter, PresenceChannel, PresenceState};
pub use presence_render::PresenceRenderer;
pub use replica::{ChangeAction, CrdtReplica, KeyChange, MemoryReplica, ReplicatedMap};
pub use scene::{ActiveSelection, Decoration, DecorationKind, Scene};
pub use session::BoardSession;
pub use shapes::{
    FontStyle, Geometry, SerializableColor, Shape, ShapeId, SharedRecord, TextAlign, TextFormat,
};
pub use sync::{BatchReport, EchoFlag, PublishTarget, SyncAdapter};
pub use throttle::Throttle;
pub use tools::{PointerEvent, ToolEffect, ToolKind, ToolMachine, ToolState};
pub use wire::WireMessage;
