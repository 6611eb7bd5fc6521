//! Session configuration.

use crate::error::{SyncError, SyncResult};
use crate::shapes::SerializableColor;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a board session.
///
/// Every field has a default, so a partial JSON document is enough to
/// override a single value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum spacing between throttled publishes of the same target, in milliseconds.
    pub throttle_interval_ms: u64,
    /// Side length of a freshly pressed rectangle before the drag resizes it.
    pub default_rect_size: f64,
    /// Radius of a freshly pressed circle before the drag resizes it.
    pub default_circle_radius: f64,
    pub rect_fill: SerializableColor,
    pub circle_fill: SerializableColor,
    /// Content of a newly placed text shape.
    pub text_placeholder: String,
    pub text_font_size: f64,
    pub text_width: f64,
    pub brush_color: SerializableColor,
    pub brush_width: f64,
    /// Padding between a remote selection indicator and its target's bounds.
    pub indicator_inset: f64,
    /// Vertical distance between an indicator's name tag and its target's top edge.
    pub name_tag_offset: f64,
    /// Presence entries not refreshed within this many seconds are expired.
    pub presence_timeout_secs: u64,
    /// Flush pending throttled publishes on disconnect instead of dropping them.
    pub flush_on_disconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            throttle_interval_ms: 50,
            default_rect_size: 20.0,
            default_circle_radius: 20.0,
            rect_fill: SerializableColor::new(0xff, 0x11, 0x00, 255),
            circle_fill: SerializableColor::new(0x00, 0x3c, 0xff, 255),
            text_placeholder: "Type here".to_string(),
            text_font_size: 28.0,
            text_width: 200.0,
            brush_color: SerializableColor::black(),
            brush_width: 5.0,
            indicator_inset: 5.0,
            name_tag_offset: 25.0,
            presence_timeout_secs: 30,
            flush_on_disconnect: true,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::Wire(format!("Invalid config: {}", e)))
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_secs(self.presence_timeout_secs)
    }
}
