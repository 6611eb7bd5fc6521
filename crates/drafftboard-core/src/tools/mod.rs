//! Pointer-driven tool state machine.
//!
//! The machine edits the scene directly and reports what should be
//! published as [`ToolEffect`]s; the caller routes those to the sync and
//! presence adapters.

use crate::config::SessionConfig;
use crate::scene::{ActiveSelection, Scene};
use crate::shapes::{SerializableColor, Shape, ShapeId, ShapeStyle};
use crate::sync::PublishTarget;
use kurbo::{Affine, Point};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Available tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    #[default]
    Select,
    Rect,
    Circle,
    Text,
    Freehand,
}

/// Shape kinds that are created by press-drag-release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateKind {
    Rect,
    Circle,
}

/// An in-progress move of the selection or a single shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Drag {
    pub target: PublishTarget,
    pub last: Point,
    pub moved: bool,
}

/// State of the current interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolState {
    Select {
        drag: Option<Drag>,
    },
    Creating {
        kind: CreateKind,
        shape: ShapeId,
        anchor: Point,
    },
    FreehandDrawing {
        /// Absolute points of the stroke in progress.
        stroke: Option<Vec<Point>>,
    },
}

impl Default for ToolState {
    fn default() -> Self {
        ToolState::Select { drag: None }
    }
}

/// A pointer event in scene coordinates. `point` is `None` when the host
/// could not resolve a position; such events are ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    pub point: Option<Point>,
    pub at: Instant,
}

impl PointerEvent {
    pub fn new(x: f64, y: f64, at: Instant) -> Self {
        Self {
            point: Some(Point::new(x, y)),
            at,
        }
    }

    pub fn without_point(at: Instant) -> Self {
        Self { point: None, at }
    }
}

/// Follow-up work requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEffect {
    Publish(PublishTarget),
    PublishThrottled(PublishTarget),
    SelectionChanged(Option<ShapeId>),
    ToolChanged(ToolKind),
}

/// Defaults applied to newly created shapes.
#[derive(Debug, Clone)]
struct CreationDefaults {
    rect_size: f64,
    circle_radius: f64,
    rect_fill: SerializableColor,
    circle_fill: SerializableColor,
    text_placeholder: String,
    text_font_size: f64,
    text_width: f64,
    brush_color: SerializableColor,
    brush_width: f64,
}

/// Current tool plus interaction state.
#[derive(Debug, Clone)]
pub struct ToolMachine {
    tool: ToolKind,
    state: ToolState,
    /// Rubber-band and shift selection; off while a shape is being created.
    multi_select: bool,
    defaults: CreationDefaults,
}

impl ToolMachine {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            tool: ToolKind::Select,
            state: ToolState::default(),
            multi_select: true,
            defaults: CreationDefaults {
                rect_size: config.default_rect_size,
                circle_radius: config.default_circle_radius,
                rect_fill: config.rect_fill,
                circle_fill: config.circle_fill,
                text_placeholder: config.text_placeholder.clone(),
                text_font_size: config.text_font_size,
                text_width: config.text_width,
                brush_color: config.brush_color,
                brush_width: config.brush_width,
            },
        }
    }

    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    pub fn state(&self) -> &ToolState {
        &self.state
    }

    pub fn multi_select_enabled(&self) -> bool {
        self.multi_select
    }

    /// True when no gesture is in progress.
    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            ToolState::Select { drag: None } | ToolState::FreehandDrawing { stroke: None }
        )
    }

    fn resting_state(tool: ToolKind) -> ToolState {
        match tool {
            ToolKind::Freehand => ToolState::FreehandDrawing { stroke: None },
            _ => ToolState::Select { drag: None },
        }
    }

    /// Switch tools. A shape still being created is kept at its current
    /// size and reported for publishing; other gestures are dropped.
    pub fn set_tool(&mut self, tool: ToolKind) -> Vec<ToolEffect> {
        let effects = self.finish_abandoned();
        self.enter(tool);
        effects
    }

    fn enter(&mut self, tool: ToolKind) {
        self.tool = tool;
        self.state = Self::resting_state(tool);
        self.multi_select = true;
    }

    /// End a creation gesture that never saw its release. The shape is
    /// already in the scene, so it has to reach the replica too.
    fn finish_abandoned(&mut self) -> Vec<ToolEffect> {
        match std::mem::take(&mut self.state) {
            ToolState::Creating { shape, .. } => {
                log::debug!("Creation of {} ended without release", shape);
                self.multi_select = true;
                vec![ToolEffect::Publish(PublishTarget::Shape(shape))]
            }
            other => {
                self.state = other;
                Vec::new()
            }
        }
    }

    pub fn pointer_down(&mut self, event: PointerEvent, scene: &mut Scene) -> Vec<ToolEffect> {
        let Some(point) = event.point else {
            return Vec::new();
        };
        let mut effects = self.finish_abandoned();
        effects.extend(self.press(point, scene));
        effects
    }

    fn press(&mut self, point: Point, scene: &mut Scene) -> Vec<ToolEffect> {
        match self.tool {
            ToolKind::Select => self.begin_select(point, scene),
            ToolKind::Rect => {
                let size = self.defaults.rect_size;
                let mut shape = Shape::rect(point, size, size);
                shape.style = ShapeStyle::new(self.defaults.rect_fill, SerializableColor::transparent(), 1.0);
                self.begin_create(CreateKind::Rect, shape, point, scene)
            }
            ToolKind::Circle => {
                let mut shape = Shape::circle(point, self.defaults.circle_radius);
                shape.style = ShapeStyle::new(self.defaults.circle_fill, SerializableColor::transparent(), 1.0);
                self.begin_create(CreateKind::Circle, shape, point, scene)
            }
            ToolKind::Text => {
                let mut shape = Shape::text(
                    point,
                    self.defaults.text_placeholder.clone(),
                    self.defaults.text_font_size,
                    self.defaults.text_width,
                );
                shape.style = ShapeStyle::new(SerializableColor::black(), SerializableColor::transparent(), 1.0);
                let id = shape.id().clone();
                scene.add_shape(shape);
                self.enter(ToolKind::Select);
                vec![
                    ToolEffect::Publish(PublishTarget::Shape(id)),
                    ToolEffect::ToolChanged(ToolKind::Select),
                ]
            }
            ToolKind::Freehand => {
                self.state = ToolState::FreehandDrawing {
                    stroke: Some(vec![point]),
                };
                Vec::new()
            }
        }
    }

    fn begin_select(&mut self, point: Point, scene: &mut Scene) -> Vec<ToolEffect> {
        let hit = scene.shape_at(point);
        let Some(hit) = hit else {
            let had_selection = scene.active_selection().is_some();
            scene.clear_selection();
            self.state = ToolState::Select { drag: None };
            return if had_selection {
                vec![ToolEffect::SelectionChanged(None)]
            } else {
                Vec::new()
            };
        };

        let mut effects = Vec::new();
        let in_multi = matches!(
            scene.active_selection(),
            Some(ActiveSelection::Multi { members, .. }) if members.contains(&hit)
        );
        let already_selected = matches!(
            scene.active_selection(),
            Some(ActiveSelection::Single(current)) if *current == hit
        );
        let target = if in_multi {
            PublishTarget::Selection
        } else {
            if !already_selected {
                scene.select(&hit);
                effects.push(ToolEffect::SelectionChanged(Some(hit.clone())));
            }
            PublishTarget::Shape(hit)
        };
        self.state = ToolState::Select {
            drag: Some(Drag {
                target,
                last: point,
                moved: false,
            }),
        };
        effects
    }

    fn begin_create(
        &mut self,
        kind: CreateKind,
        shape: Shape,
        anchor: Point,
        scene: &mut Scene,
    ) -> Vec<ToolEffect> {
        let id = shape.id().clone();
        let had_selection = scene.active_selection().is_some();
        scene.clear_selection();
        scene.add_shape(shape);
        self.multi_select = false;
        self.state = ToolState::Creating {
            kind,
            shape: id,
            anchor,
        };
        if had_selection {
            vec![ToolEffect::SelectionChanged(None)]
        } else {
            Vec::new()
        }
    }

    fn resize_created(kind: CreateKind, id: &ShapeId, anchor: Point, point: Point, scene: &mut Scene) {
        scene.modify(id, |shape| match kind {
            CreateKind::Rect => {
                shape.set_size(Some(point.x - anchor.x), Some(point.y - anchor.y));
            }
            CreateKind::Circle => {
                shape.set_size(Some(anchor.distance(point) * 2.0), None);
            }
        });
    }

    /// Returns whether anything moved.
    fn drag_to(drag: &mut Drag, point: Point, scene: &mut Scene) -> bool {
        let delta = point - drag.last;
        if delta.hypot2() == 0.0 {
            return false;
        }
        match &drag.target {
            PublishTarget::Shape(id) => {
                scene.translate_shape(id, delta);
            }
            PublishTarget::Selection => {
                scene.transform_selection(Affine::translate(delta));
            }
        }
        drag.last = point;
        drag.moved = true;
        true
    }

    pub fn pointer_move(&mut self, event: PointerEvent, scene: &mut Scene) -> Vec<ToolEffect> {
        let Some(point) = event.point else {
            return Vec::new();
        };
        match &mut self.state {
            ToolState::Creating {
                kind,
                shape,
                anchor,
            } => {
                Self::resize_created(*kind, shape, *anchor, point, scene);
                Vec::new()
            }
            ToolState::Select { drag: Some(drag) } => {
                if Self::drag_to(drag, point, scene) {
                    vec![ToolEffect::PublishThrottled(drag.target.clone())]
                } else {
                    Vec::new()
                }
            }
            ToolState::FreehandDrawing {
                stroke: Some(stroke),
            } => {
                stroke.push(point);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn pointer_up(&mut self, event: PointerEvent, scene: &mut Scene) -> Vec<ToolEffect> {
        let Some(point) = event.point else {
            return Vec::new();
        };
        match std::mem::take(&mut self.state) {
            ToolState::Creating {
                kind,
                shape,
                anchor,
            } => {
                Self::resize_created(kind, &shape, anchor, point, scene);
                self.enter(ToolKind::Select);
                vec![
                    ToolEffect::Publish(PublishTarget::Shape(shape)),
                    ToolEffect::ToolChanged(ToolKind::Select),
                ]
            }
            ToolState::Select { drag: Some(mut drag) } => {
                Self::drag_to(&mut drag, point, scene);
                self.state = ToolState::Select { drag: None };
                if drag.moved {
                    vec![ToolEffect::Publish(drag.target)]
                } else {
                    Vec::new()
                }
            }
            ToolState::FreehandDrawing {
                stroke: Some(mut stroke),
            } => {
                stroke.push(point);
                self.state = ToolState::FreehandDrawing { stroke: None };
                let mut path = Shape::path_from_stroke(&stroke);
                path.style = ShapeStyle::new(
                    SerializableColor::transparent(),
                    self.defaults.brush_color,
                    self.defaults.brush_width,
                );
                let id = path.id().clone();
                scene.add_shape(path);
                vec![ToolEffect::Publish(PublishTarget::Shape(id))]
            }
            other => {
                self.state = other;
                Vec::new()
            }
        }
    }
}
