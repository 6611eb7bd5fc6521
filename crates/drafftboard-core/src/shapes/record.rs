//! Transport representation of a shape inside the replicated map.

use super::{
    FontStyle, Geometry, Placement, SerializableColor, Shape, ShapeId, ShapeStyle, TextAlign,
    TextFormat,
};
use crate::error::{SyncError, SyncResult};
use kurbo::{Affine, Point};
use serde::{Deserialize, Serialize};

/// Flat, serializable form of a [`Shape`].
///
/// `matrix` is only present when the shape was published as part of a
/// multi-selection; it then carries the member's absolute transform and
/// overrides the placement fields on application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedRecord {
    pub id: String,
    pub kind: String,
    pub left: f64,
    pub top: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    /// Rect corner rounding. Absent means sharp corners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corner_radius: Option<f64>,
    pub angle: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    pub fill: String,
    pub stroke: String,
    pub stroke_width: f64,
    pub opacity: f64,
    pub visible: bool,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<[f64; 6]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_align: Option<TextAlign>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_style: Option<FontStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<[f64; 2]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects: Option<Vec<SharedRecord>>,
}

impl SharedRecord {
    /// Parse the value stored under `id`. Missing fields are reported as malformed.
    pub fn from_json(id: &str, json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::malformed(id, e.to_string()))
    }

    /// Canonical serialized form. Equal shapes always produce equal bytes.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn with_matrix(mut self, matrix: Affine) -> Self {
        self.matrix = Some(matrix.as_coeffs());
        self
    }

    fn required(&self, value: Option<f64>, field: &str) -> SyncResult<f64> {
        match value {
            Some(v) if v.is_finite() => Ok(v),
            Some(_) => Err(SyncError::malformed(&self.id, format!("non-finite {}", field))),
            None => Err(SyncError::malformed(
                &self.id,
                format!("{} record without {}", self.kind, field),
            )),
        }
    }

    fn geometry(&self) -> SyncResult<Geometry> {
        match self.kind.as_str() {
            "rect" => Ok(Geometry::Rect {
                width: self.required(self.width, "width")?,
                height: self.required(self.height, "height")?,
                corner_radius: match self.corner_radius {
                    Some(r) => self.required(Some(r), "cornerRadius")?.max(0.0),
                    None => 0.0,
                },
            }),
            "circle" => Ok(Geometry::Ellipse {
                radius: self.required(self.radius, "radius")?,
            }),
            "textbox" => Ok(Geometry::Text {
                content: self
                    .text
                    .clone()
                    .ok_or_else(|| SyncError::malformed(&self.id, "textbox record without text"))?,
                font_size: self.required(self.font_size, "fontSize")?,
                width: self.required(self.width, "width")?,
                format: TextFormat {
                    font_family: self
                        .font_family
                        .clone()
                        .unwrap_or_else(|| TextFormat::DEFAULT_FAMILY.to_string()),
                    align: self.text_align.unwrap_or_default(),
                    font_style: self.font_style.unwrap_or_default(),
                },
            }),
            "path" => {
                let points = self
                    .points
                    .as_ref()
                    .ok_or_else(|| SyncError::malformed(&self.id, "path record without points"))?;
                Ok(Geometry::Path {
                    points: points.iter().map(|[x, y]| Point::new(*x, *y)).collect(),
                })
            }
            "group" => {
                let objects = self
                    .objects
                    .as_ref()
                    .ok_or_else(|| SyncError::malformed(&self.id, "group record without objects"))?;
                let children = objects
                    .iter()
                    .map(Shape::from_record)
                    .collect::<SyncResult<Vec<_>>>()?;
                Ok(Geometry::Group { children })
            }
            other => Err(SyncError::malformed(
                &self.id,
                format!("unknown kind '{}'", other),
            )),
        }
    }

    fn placement(&self) -> SyncResult<Placement> {
        let values = [self.left, self.top, self.angle, self.scale_x, self.scale_y];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SyncError::malformed(&self.id, "non-finite placement"));
        }
        Ok(Placement {
            left: self.left,
            top: self.top,
            angle: self.angle,
            scale_x: self.scale_x,
            scale_y: self.scale_y,
        })
    }

    fn style(&self) -> SyncResult<ShapeStyle> {
        let color = |value: &str, field: &str| {
            SerializableColor::from_hex(value).ok_or_else(|| {
                SyncError::malformed(&self.id, format!("bad {} color '{}'", field, value))
            })
        };
        let mut style = ShapeStyle::new(
            color(&self.fill, "fill")?,
            color(&self.stroke, "stroke")?,
            self.stroke_width,
        );
        style.set_opacity(self.opacity);
        Ok(style)
    }
}

impl Shape {
    /// Serialize into the transport record. Never carries a matrix.
    pub fn to_record(&self) -> SharedRecord {
        let mut record = SharedRecord {
            id: self.id.as_str().to_string(),
            kind: self.kind().to_string(),
            left: self.placement.left,
            top: self.placement.top,
            width: None,
            height: None,
            radius: None,
            corner_radius: None,
            angle: self.placement.angle,
            scale_x: self.placement.scale_x,
            scale_y: self.placement.scale_y,
            fill: self.style.fill.to_hex(),
            stroke: self.style.stroke.to_hex(),
            stroke_width: self.style.stroke_width,
            opacity: self.style.opacity(),
            visible: self.visible,
            label: self.label.clone(),
            matrix: None,
            text: None,
            font_size: None,
            font_family: None,
            text_align: None,
            font_style: None,
            points: None,
            objects: None,
        };
        match &self.geometry {
            Geometry::Rect {
                width,
                height,
                corner_radius,
            } => {
                record.width = Some(*width);
                record.height = Some(*height);
                if *corner_radius > 0.0 {
                    record.corner_radius = Some(*corner_radius);
                }
            }
            Geometry::Ellipse { radius } => record.radius = Some(*radius),
            Geometry::Text {
                content,
                font_size,
                width,
                format,
            } => {
                record.text = Some(content.clone());
                record.font_size = Some(*font_size);
                record.width = Some(*width);
                record.font_family = Some(format.font_family.clone());
                record.text_align = Some(format.align);
                record.font_style = Some(format.font_style);
            }
            Geometry::Path { points } => {
                record.points = Some(points.iter().map(|p| [p.x, p.y]).collect());
            }
            Geometry::Group { children } => {
                record.objects = Some(children.iter().map(Shape::to_record).collect());
            }
        }
        record
    }

    /// Instantiate a shape from a record, keeping the record's id verbatim.
    pub fn from_record(record: &SharedRecord) -> SyncResult<Shape> {
        let mut shape = Shape::with_id(
            ShapeId::from(record.id.as_str()),
            record.geometry()?,
            Point::ZERO,
        );
        shape.apply_record(record)?;
        Ok(shape)
    }

    /// Overwrite this shape's properties from a record, then the matrix if
    /// present. Validation happens before any field is touched, so a
    /// malformed record leaves the shape unchanged. Coords are not refreshed.
    pub fn apply_record(&mut self, record: &SharedRecord) -> SyncResult<()> {
        let geometry = record.geometry()?;
        let placement = record.placement()?;
        let style = record.style()?;
        let matrix = match record.matrix {
            Some(coeffs) if coeffs.iter().all(|v| v.is_finite()) => Some(Affine::new(coeffs)),
            Some(_) => return Err(SyncError::malformed(&record.id, "non-finite matrix")),
            None => None,
        };

        self.geometry = geometry;
        self.placement = placement;
        self.style = style;
        self.visible = record.visible;
        self.label = record.label.clone();
        if let Some(matrix) = matrix {
            self.apply_matrix(matrix);
        }
        Ok(())
    }
}
