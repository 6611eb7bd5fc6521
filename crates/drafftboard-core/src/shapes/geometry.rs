//! Per-kind geometry and placement.

use super::Shape;
use kurbo::{Affine, Point, Rect};
use serde::{Deserialize, Serialize};

/// Line height multiplier used to size text boxes.
const TEXT_LINE_HEIGHT: f64 = 1.16;

/// Horizontal alignment of text lines inside the box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
    Justify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontStyle {
    #[default]
    Normal,
    Italic,
}

/// Typography of a text box. Does not affect its bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFormat {
    pub font_family: String,
    pub align: TextAlign,
    pub font_style: FontStyle,
}

impl TextFormat {
    pub const DEFAULT_FAMILY: &'static str = "Arial";
}

impl Default for TextFormat {
    fn default() -> Self {
        Self {
            font_family: Self::DEFAULT_FAMILY.to_string(),
            align: TextAlign::default(),
            font_style: FontStyle::default(),
        }
    }
}

/// Kind-specific geometry in the shape's local frame.
///
/// The local frame's origin is the shape's `left`/`top`, so a rectangle of
/// width 50 covers `0..50` before placement.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// Width and height may be negative while a creation drag crosses the anchor.
    Rect {
        width: f64,
        height: f64,
        /// Corner rounding, 0 for sharp corners.
        corner_radius: f64,
    },
    /// Circle described by its radius; the bounding box starts at the origin.
    Ellipse { radius: f64 },
    Text {
        content: String,
        font_size: f64,
        width: f64,
        format: TextFormat,
    },
    /// Points relative to the placement origin.
    Path { points: Vec<Point> },
    /// Children are placed relative to the group's origin.
    Group { children: Vec<Shape> },
}

impl Geometry {
    /// Wire name of the kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Rect { .. } => "rect",
            Geometry::Ellipse { .. } => "circle",
            Geometry::Text { .. } => "textbox",
            Geometry::Path { .. } => "path",
            Geometry::Group { .. } => "group",
        }
    }

    /// Bounding box in the local frame.
    pub fn local_bounds(&self) -> Rect {
        match self {
            Geometry::Rect { width, height, .. } => Rect::new(0.0, 0.0, *width, *height).abs(),
            Geometry::Ellipse { radius } => {
                let d = radius.abs() * 2.0;
                Rect::new(0.0, 0.0, d, d)
            }
            Geometry::Text {
                content,
                font_size,
                width,
                ..
            } => {
                let lines = content.lines().count().max(1) as f64;
                Rect::new(0.0, 0.0, *width, lines * font_size * TEXT_LINE_HEIGHT).abs()
            }
            Geometry::Path { points } => {
                let mut iter = points.iter();
                match iter.next() {
                    Some(first) => iter.fold(Rect::from_points(*first, *first), |acc, p| {
                        acc.union_pt(*p)
                    }),
                    None => Rect::ZERO,
                }
            }
            Geometry::Group { children } => {
                let mut iter = children
                    .iter()
                    .map(|c| c.affine().transform_rect_bbox(c.geometry.local_bounds()));
                match iter.next() {
                    Some(first) => iter.fold(first, |acc, r| acc.union(r)),
                    None => Rect::ZERO,
                }
            }
        }
    }
}

/// Position, rotation and scale of a shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub left: f64,
    pub top: f64,
    /// Rotation in degrees around the origin.
    pub angle: f64,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl Placement {
    pub fn at(origin: Point) -> Self {
        Self {
            left: origin.x,
            top: origin.y,
            angle: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }

    /// translate * rotate * scale
    pub fn affine(&self) -> Affine {
        Affine::translate((self.left, self.top))
            * Affine::rotate(self.angle.to_radians())
            * Affine::scale_non_uniform(self.scale_x, self.scale_y)
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self::at(Point::ZERO)
    }
}

/// Split an absolute matrix back into a placement. Skew is discarded.
pub fn decompose_matrix(matrix: Affine) -> Placement {
    let [a, b, c, d, e, f] = matrix.as_coeffs();
    let scale_x = (a * a + b * b).sqrt();
    let (angle, scale_y) = if scale_x > f64::EPSILON {
        (b.atan2(a).to_degrees(), (a * d - c * b) / scale_x)
    } else {
        (0.0, (c * c + d * d).sqrt())
    };
    Placement {
        left: e,
        top: f,
        angle,
        scale_x,
        scale_y,
    }
}
