//! Shape definitions for the shared canvas.

mod geometry;
mod record;

pub use geometry::{FontStyle, Geometry, Placement, TextAlign, TextFormat, decompose_matrix};
pub use record::SharedRecord;

use kurbo::{Affine, Point, Rect, Vec2};
use peniko::Color;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SerializableColor {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    pub fn white() -> Self {
        Self::new(255, 255, 255, 255)
    }

    pub fn transparent() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Format as `#rrggbb`, or `#rrggbbaa` when not fully opaque.
    pub fn to_hex(&self) -> String {
        if self.a == 255 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }

    /// Parse `#rgb`, `#rrggbb`, `#rrggbbaa` or `transparent`.
    pub fn from_hex(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("transparent") {
            return Some(Self::transparent());
        }
        let hex = input.strip_prefix('#')?;
        if !hex.is_ascii() {
            return None;
        }
        let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        match hex.len() {
            3 => {
                let nibble = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).ok().map(|v| v * 17);
                Some(Self::new(nibble(0)?, nibble(1)?, nibble(2)?, 255))
            }
            6 => Some(Self::new(byte(0)?, byte(2)?, byte(4)?, 255)),
            8 => Some(Self::new(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
            _ => None,
        }
    }
}

impl From<Color> for SerializableColor {
    fn from(color: Color) -> Self {
        let rgba = color.to_rgba8();
        Self {
            r: rgba.r,
            g: rgba.g,
            b: rgba.b,
            a: rgba.a,
        }
    }
}

impl From<SerializableColor> for Color {
    fn from(color: SerializableColor) -> Self {
        Color::from_rgba8(color.r, color.g, color.b, color.a)
    }
}

/// Style properties shared by every shape kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeStyle {
    pub fill: SerializableColor,
    pub stroke: SerializableColor,
    pub stroke_width: f64,
    /// Overall opacity (0.0 = fully transparent, 1.0 = fully opaque).
    opacity: f64,
}

impl ShapeStyle {
    pub fn new(fill: SerializableColor, stroke: SerializableColor, stroke_width: f64) -> Self {
        Self {
            fill,
            stroke,
            stroke_width,
            opacity: 1.0,
        }
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    /// Set the opacity, clamped to `[0, 1]`. NaN is treated as fully opaque.
    pub fn set_opacity(&mut self, opacity: f64) {
        self.opacity = if opacity.is_nan() { 1.0 } else { opacity.clamp(0.0, 1.0) };
    }

    /// Get the fill color with opacity applied.
    pub fn fill_with_opacity(&self) -> Color {
        with_opacity(self.fill, self.opacity)
    }

    /// Get the stroke color with opacity applied.
    pub fn stroke_with_opacity(&self) -> Color {
        with_opacity(self.stroke, self.opacity)
    }
}

fn with_opacity(color: SerializableColor, opacity: f64) -> Color {
    let alpha = (color.a as f64 * opacity) as u8;
    Color::from_rgba8(color.r, color.g, color.b, alpha)
}

impl Default for ShapeStyle {
    fn default() -> Self {
        Self::new(SerializableColor::transparent(), SerializableColor::black(), 1.0)
    }
}

/// Globally unique shape identifier.
///
/// Ids minted locally are UUIDs; ids arriving from the replicated map are
/// kept verbatim whatever their format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeId(String);

impl ShapeId {
    /// Mint a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShapeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ShapeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One drawable entity on the canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    id: ShapeId,
    pub geometry: Geometry,
    pub placement: Placement,
    pub style: ShapeStyle,
    /// Free-text name shown in layer lists.
    pub label: String,
    pub visible: bool,
    /// Cached world-space bounding box, refreshed by `set_coords`.
    coords: Rect,
}

impl Shape {
    /// Create a shape with a freshly minted id, placed at `origin`.
    pub fn new(geometry: Geometry, origin: Point) -> Self {
        Self::with_id(ShapeId::generate(), geometry, origin)
    }

    /// Create a shape with a known id (remote records, tests).
    pub fn with_id(id: ShapeId, geometry: Geometry, origin: Point) -> Self {
        let label = geometry.kind().to_string();
        let mut shape = Self {
            id,
            geometry,
            placement: Placement::at(origin),
            style: ShapeStyle::default(),
            label,
            visible: true,
            coords: Rect::ZERO,
        };
        shape.set_coords(Affine::IDENTITY);
        shape
    }

    /// Build a rectangle at `origin`.
    pub fn rect(origin: Point, width: f64, height: f64) -> Self {
        Self::new(
            Geometry::Rect {
                width,
                height,
                corner_radius: 0.0,
            },
            origin,
        )
    }

    /// Build a circle whose bounding box starts at `origin`.
    pub fn circle(origin: Point, radius: f64) -> Self {
        Self::new(Geometry::Ellipse { radius }, origin)
    }

    /// Build a text box at `origin`.
    pub fn text(origin: Point, content: impl Into<String>, font_size: f64, width: f64) -> Self {
        Self::new(
            Geometry::Text {
                content: content.into(),
                font_size,
                width,
                format: TextFormat::default(),
            },
            origin,
        )
    }

    /// Build a path from absolute stroke points. The placement origin is the
    /// top-left of the stroke bounds; points are stored relative to it.
    pub fn path_from_stroke(points: &[Point]) -> Self {
        let origin = points
            .iter()
            .fold(None::<Point>, |acc, p| match acc {
                Some(min) => Some(Point::new(min.x.min(p.x), min.y.min(p.y))),
                None => Some(*p),
            })
            .unwrap_or(Point::ZERO);
        let local = points.iter().map(|p| *p - origin.to_vec2()).collect();
        Self::new(Geometry::Path { points: local }, origin)
    }

    pub fn id(&self) -> &ShapeId {
        &self.id
    }

    /// Wire name of this shape's kind.
    pub fn kind(&self) -> &'static str {
        self.geometry.kind()
    }

    /// Placement matrix of this shape on its own.
    pub fn affine(&self) -> Affine {
        self.placement.affine()
    }

    /// World-space bounding box as of the last `set_coords`.
    pub fn coords(&self) -> Rect {
        self.coords
    }

    /// Recompute the bounding-box cache. `outer` is any transform the shape
    /// is nested in (an active multi-selection), identity otherwise.
    pub fn set_coords(&mut self, outer: Affine) {
        let local = self.geometry.local_bounds();
        self.coords = (outer * self.affine()).transform_rect_bbox(local);
    }

    /// Move the shape by a world-space delta.
    pub fn translate(&mut self, delta: Vec2) {
        self.placement.left += delta.x;
        self.placement.top += delta.y;
    }

    /// Replace the placement with the decomposition of an absolute matrix.
    pub fn apply_matrix(&mut self, matrix: Affine) {
        self.placement = decompose_matrix(matrix);
    }

    /// Compose a world-space transform onto the current placement.
    pub fn transform(&mut self, affine: Affine) {
        self.apply_matrix(affine * self.affine());
    }

    /// Resize in world units. Rectangles take both values; text boxes take
    /// the width; circles take the width as a diameter. Scale is folded in
    /// so the visible size matches what was asked for.
    pub fn set_size(&mut self, width: Option<f64>, height: Option<f64>) -> bool {
        let sx = nonzero(self.placement.scale_x);
        let sy = nonzero(self.placement.scale_y);
        match &mut self.geometry {
            Geometry::Rect {
                width: w,
                height: h,
                ..
            } => {
                if let Some(width) = width {
                    *w = width / sx;
                }
                if let Some(height) = height {
                    *h = height / sy;
                }
                width.is_some() || height.is_some()
            }
            Geometry::Text { width: w, .. } => match width {
                Some(width) => {
                    *w = width / sx;
                    true
                }
                None => false,
            },
            Geometry::Ellipse { radius } => match width {
                Some(diameter) => {
                    *radius = diameter / 2.0 / sx;
                    true
                }
                None => false,
            },
            Geometry::Path { .. } | Geometry::Group { .. } => false,
        }
    }

    /// Round a rectangle's corners. Negative radii clamp to 0.
    pub fn set_corner_radius(&mut self, radius: f64) -> bool {
        match &mut self.geometry {
            Geometry::Rect { corner_radius, .. } if radius.is_finite() => {
                *corner_radius = radius.max(0.0);
                true
            }
            _ => false,
        }
    }

    /// Replace a text box's content.
    pub fn set_text(&mut self, text: &str) -> bool {
        match &mut self.geometry {
            Geometry::Text { content, .. } => {
                *content = text.to_string();
                true
            }
            _ => false,
        }
    }

    /// Sizes that are not positive and finite are ignored.
    pub fn set_font_size(&mut self, size: f64) -> bool {
        match &mut self.geometry {
            Geometry::Text { font_size, .. } if size.is_finite() && size > 0.0 => {
                *font_size = size;
                true
            }
            _ => false,
        }
    }

    pub fn text_format_mut(&mut self) -> Option<&mut TextFormat> {
        match &mut self.geometry {
            Geometry::Text { format, .. } => Some(format),
            _ => None,
        }
    }

    /// Hit test against the cached bounds.
    pub fn contains(&self, point: Point) -> bool {
        self.visible && self.coords.contains(point)
    }
}

fn nonzero(v: f64) -> f64 {
    if v.abs() < f64::EPSILON { 1.0 } else { v }
}
