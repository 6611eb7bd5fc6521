//! Local scene graph: shapes, layer order, active selection and decorations.

use crate::shapes::{SerializableColor, Shape, ShapeId, decompose_matrix};
use kurbo::{Affine, Point, Rect, Size, Vec2};
use std::collections::HashMap;

/// Font size used for selection name tags.
pub const NAME_TAG_FONT_SIZE: f64 = 12.0;

/// Size of the pointer glyph drawn for a remote cursor.
const CURSOR_SIZE: Size = Size::new(16.0, 16.0);

/// What the local user currently has selected.
#[derive(Debug, Clone, PartialEq)]
pub enum ActiveSelection {
    Single(ShapeId),
    /// Several shapes manipulated together. Members keep their own placement;
    /// `transform` is applied on top of it until the selection is released.
    Multi {
        members: Vec<ShapeId>,
        transform: Affine,
    },
}

impl ActiveSelection {
    pub fn contains(&self, id: &ShapeId) -> bool {
        match self {
            ActiveSelection::Single(single) => single == id,
            ActiveSelection::Multi { members, .. } => members.contains(id),
        }
    }

    pub fn ids(&self) -> Vec<ShapeId> {
        match self {
            ActiveSelection::Single(id) => vec![id.clone()],
            ActiveSelection::Multi { members, .. } => members.clone(),
        }
    }
}

/// Handle to a decoration in the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecorationId(u64);

/// Local-only visual overlays. Never part of the shared document.
#[derive(Debug, Clone, PartialEq)]
pub enum DecorationKind {
    CursorAvatar {
        owner: String,
        label: String,
    },
    SelectionBorder {
        owner: String,
        target: ShapeId,
        inset: f64,
    },
    NameTag {
        owner: String,
        label: String,
        target: ShapeId,
        offset: f64,
    },
}

impl DecorationKind {
    pub fn owner(&self) -> &str {
        match self {
            DecorationKind::CursorAvatar { owner, .. }
            | DecorationKind::SelectionBorder { owner, .. }
            | DecorationKind::NameTag { owner, .. } => owner,
        }
    }

    /// Shape this decoration follows, if any.
    pub fn target(&self) -> Option<&ShapeId> {
        match self {
            DecorationKind::CursorAvatar { .. } => None,
            DecorationKind::SelectionBorder { target, .. }
            | DecorationKind::NameTag { target, .. } => Some(target),
        }
    }

    pub fn is_cursor(&self) -> bool {
        matches!(self, DecorationKind::CursorAvatar { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoration {
    id: DecorationId,
    pub kind: DecorationKind,
    /// Unrotated bounds; `angle` rotates them around their top-left corner.
    pub bounds: Rect,
    /// Degrees.
    pub angle: f64,
    pub color: SerializableColor,
    pub dashed: bool,
}

impl Decoration {
    pub fn id(&self) -> DecorationId {
        self.id
    }
}

/// Item in paint order.
#[derive(Debug, Clone, Copy)]
pub enum RenderItem<'a> {
    Shape(&'a Shape),
    Decoration(&'a Decoration),
}

/// The local canvas.
#[derive(Debug, Default)]
pub struct Scene {
    shapes: HashMap<ShapeId, Shape>,
    /// Back to front.
    z_order: Vec<ShapeId>,
    active: Option<ActiveSelection>,
    /// Paint order, above every shape.
    decorations: Vec<Decoration>,
    next_decoration: u64,
    render_requests: u64,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn contains(&self, id: &ShapeId) -> bool {
        self.shapes.contains_key(id)
    }

    pub fn get(&self, id: &ShapeId) -> Option<&Shape> {
        self.shapes.get(id)
    }

    /// Shapes back to front.
    pub fn shapes_ordered(&self) -> impl Iterator<Item = &Shape> {
        self.z_order.iter().filter_map(|id| self.shapes.get(id))
    }

    pub fn z_order(&self) -> &[ShapeId] {
        &self.z_order
    }

    /// Ask the host to repaint.
    pub fn request_render(&mut self) {
        self.render_requests += 1;
    }

    /// Number of repaint requests made so far.
    pub fn render_requests(&self) -> u64 {
        self.render_requests
    }

    /// Insert a shape on top of the layer order. Returns false if the id is taken.
    pub fn add_shape(&mut self, mut shape: Shape) -> bool {
        let id = shape.id().clone();
        if self.shapes.contains_key(&id) {
            return false;
        }
        shape.set_coords(Affine::IDENTITY);
        self.z_order.push(id.clone());
        self.shapes.insert(id, shape);
        self.raise_cursors();
        self.request_render();
        true
    }

    /// Remove a shape along with its selection membership and any decoration anchored to it.
    pub fn remove_shape(&mut self, id: &ShapeId) -> Option<Shape> {
        let shape = self.shapes.remove(id)?;
        self.z_order.retain(|shape_id| shape_id != id);
        self.active = match self.active.take() {
            Some(ActiveSelection::Single(single)) if &single == id => None,
            Some(ActiveSelection::Multi {
                mut members,
                transform,
            }) => {
                members.retain(|member| member != id);
                Some(ActiveSelection::Multi { members, transform })
            }
            other => other,
        };
        self.collapse_selection();
        self.decorations
            .retain(|d| d.kind.target().is_none_or(|target| target != id));
        self.raise_cursors();
        self.request_render();
        Some(shape)
    }

    /// Mutate a shape, then refresh its coords and anchored decorations.
    pub fn modify<F: FnOnce(&mut Shape)>(&mut self, id: &ShapeId, f: F) -> bool {
        match self.shapes.get_mut(id) {
            Some(shape) => f(shape),
            None => return false,
        }
        self.refresh_coords(id);
        self.request_render();
        true
    }

    /// Transform nesting `id`, identity unless it is in a multi-selection.
    fn outer_transform(&self, id: &ShapeId) -> Affine {
        match &self.active {
            Some(ActiveSelection::Multi { members, transform }) if members.contains(id) => {
                *transform
            }
            _ => Affine::IDENTITY,
        }
    }

    /// Absolute transform of a shape including any multi-selection transform.
    pub fn effective_affine(&self, id: &ShapeId) -> Option<Affine> {
        let shape = self.shapes.get(id)?;
        Some(self.outer_transform(id) * shape.affine())
    }

    /// Recompute a shape's cached bounds and relayout decorations anchored to it.
    pub fn refresh_coords(&mut self, id: &ShapeId) {
        let outer = self.outer_transform(id);
        if let Some(shape) = self.shapes.get_mut(id) {
            shape.set_coords(outer);
        }
        self.relayout_anchored(id);
    }

    /// Topmost visible shape under `point`. Decorations are never hit.
    pub fn shape_at(&self, point: Point) -> Option<ShapeId> {
        self.z_order
            .iter()
            .rev()
            .find(|id| self.shapes.get(*id).is_some_and(|s| s.contains(point)))
            .cloned()
    }

    /// Move a single shape by a world-space delta.
    pub fn translate_shape(&mut self, id: &ShapeId, delta: Vec2) -> bool {
        self.modify(id, |shape| shape.translate(delta))
    }

    /// Move one layer towards the front.
    pub fn bring_forward(&mut self, id: &ShapeId) -> bool {
        let Some(pos) = self.z_order.iter().position(|shape_id| shape_id == id) else {
            return false;
        };
        if pos + 1 >= self.z_order.len() {
            return false;
        }
        self.z_order.swap(pos, pos + 1);
        self.raise_cursors();
        self.request_render();
        true
    }

    /// Move one layer towards the back.
    pub fn send_backward(&mut self, id: &ShapeId) -> bool {
        let Some(pos) = self.z_order.iter().position(|shape_id| shape_id == id) else {
            return false;
        };
        if pos == 0 {
            return false;
        }
        self.z_order.swap(pos, pos - 1);
        self.raise_cursors();
        self.request_render();
        true
    }

    // --- Selection ---

    pub fn active_selection(&self) -> Option<&ActiveSelection> {
        self.active.as_ref()
    }

    pub fn selected_ids(&self) -> Vec<ShapeId> {
        self.active.as_ref().map(ActiveSelection::ids).unwrap_or_default()
    }

    /// First selected shape, as advertised to peers.
    pub fn primary_selection(&self) -> Option<ShapeId> {
        match &self.active {
            Some(ActiveSelection::Single(id)) => Some(id.clone()),
            Some(ActiveSelection::Multi { members, .. }) => members.first().cloned(),
            None => None,
        }
    }

    pub fn is_multi_member(&self, id: &ShapeId) -> bool {
        matches!(&self.active, Some(ActiveSelection::Multi { members, .. }) if members.contains(id))
    }

    pub fn select(&mut self, id: &ShapeId) -> bool {
        self.clear_selection();
        if !self.shapes.contains_key(id) {
            return false;
        }
        self.active = Some(ActiveSelection::Single(id.clone()));
        true
    }

    /// Select several shapes at once. Unknown ids are ignored.
    pub fn select_many(&mut self, ids: &[ShapeId]) -> bool {
        self.clear_selection();
        let mut members: Vec<ShapeId> = Vec::new();
        for id in ids {
            if self.shapes.contains_key(id) && !members.contains(id) {
                members.push(id.clone());
            }
        }
        self.active = match members.len() {
            0 => None,
            1 => Some(ActiveSelection::Single(members.remove(0))),
            _ => Some(ActiveSelection::Multi {
                members,
                transform: Affine::IDENTITY,
            }),
        };
        self.active.is_some()
    }

    /// Release the selection, folding any multi-selection transform into its members.
    pub fn clear_selection(&mut self) {
        if let Some(ActiveSelection::Multi { members, transform }) = self.active.take() {
            for id in &members {
                self.bake(id, transform);
            }
            if transform != Affine::IDENTITY {
                self.request_render();
            }
        }
        self.active = None;
    }

    /// Apply a world-space transform to whatever is selected.
    pub fn transform_selection(&mut self, affine: Affine) -> bool {
        match self.active.clone() {
            Some(ActiveSelection::Single(id)) => self.modify(&id, |shape| shape.transform(affine)),
            Some(ActiveSelection::Multi { members, transform }) => {
                self.active = Some(ActiveSelection::Multi {
                    members: members.clone(),
                    transform: affine * transform,
                });
                for id in &members {
                    self.refresh_coords(id);
                }
                self.request_render();
                true
            }
            None => false,
        }
    }

    /// Pull one shape out of the multi-selection, keeping its world position.
    pub fn detach_member(&mut self, id: &ShapeId) -> bool {
        let Some(ActiveSelection::Multi { members, transform }) = &mut self.active else {
            return false;
        };
        let Some(pos) = members.iter().position(|member| member == id) else {
            return false;
        };
        members.remove(pos);
        let transform = *transform;
        self.bake(id, transform);
        self.collapse_selection();
        true
    }

    fn bake(&mut self, id: &ShapeId, transform: Affine) {
        if let Some(shape) = self.shapes.get_mut(id) {
            if transform != Affine::IDENTITY {
                shape.transform(transform);
            }
            shape.set_coords(Affine::IDENTITY);
        }
        self.relayout_anchored(id);
    }

    /// Turn a multi-selection with fewer than two members into a plain one.
    fn collapse_selection(&mut self) {
        let collapse = matches!(&self.active, Some(ActiveSelection::Multi { members, .. }) if members.len() < 2);
        if !collapse {
            return;
        }
        if let Some(ActiveSelection::Multi { members, transform }) = self.active.take() {
            let remaining = members.into_iter().next();
            if let Some(id) = &remaining {
                self.bake(id, transform);
            }
            self.active = remaining.map(ActiveSelection::Single);
        }
    }

    // --- Decorations ---

    fn next_decoration_id(&mut self) -> DecorationId {
        self.next_decoration += 1;
        DecorationId(self.next_decoration)
    }

    pub fn decorations(&self) -> &[Decoration] {
        &self.decorations
    }

    pub fn decoration(&self, id: DecorationId) -> Option<&Decoration> {
        self.decorations.iter().find(|d| d.id == id)
    }

    /// Add a remote cursor at `at`, on top of everything.
    pub fn add_cursor(
        &mut self,
        owner: impl Into<String>,
        label: impl Into<String>,
        color: SerializableColor,
        at: Point,
    ) -> DecorationId {
        let id = self.next_decoration_id();
        self.decorations.push(Decoration {
            id,
            kind: DecorationKind::CursorAvatar {
                owner: owner.into(),
                label: label.into(),
            },
            bounds: Rect::from_origin_size(at, CURSOR_SIZE),
            angle: 0.0,
            color,
            dashed: false,
        });
        id
    }

    /// Move a cursor decoration. Anchored decorations follow their target instead.
    pub fn move_cursor(&mut self, id: DecorationId, at: Point) -> bool {
        match self.decorations.iter_mut().find(|d| d.id == id) {
            Some(decoration) if decoration.kind.is_cursor() => {
                decoration.bounds = Rect::from_origin_size(at, CURSOR_SIZE);
                true
            }
            _ => false,
        }
    }

    /// Add a dashed border and a name tag around `target`.
    /// Returns `None` when the target is not in the scene.
    pub fn add_selection_indicator(
        &mut self,
        owner: &str,
        label: &str,
        color: SerializableColor,
        target: &ShapeId,
        inset: f64,
        offset: f64,
    ) -> Option<(DecorationId, DecorationId)> {
        if !self.shapes.contains_key(target) {
            return None;
        }
        let border = self.next_decoration_id();
        self.decorations.push(Decoration {
            id: border,
            kind: DecorationKind::SelectionBorder {
                owner: owner.to_string(),
                target: target.clone(),
                inset,
            },
            bounds: Rect::ZERO,
            angle: 0.0,
            color,
            dashed: true,
        });
        let tag = self.next_decoration_id();
        self.decorations.push(Decoration {
            id: tag,
            kind: DecorationKind::NameTag {
                owner: owner.to_string(),
                label: label.to_string(),
                target: target.clone(),
                offset,
            },
            bounds: Rect::ZERO,
            angle: 0.0,
            color,
            dashed: false,
        });
        self.relayout_anchored(target);
        Some((border, tag))
    }

    pub fn remove_decoration(&mut self, id: DecorationId) -> bool {
        let before = self.decorations.len();
        self.decorations.retain(|d| d.id != id);
        self.decorations.len() != before
    }

    pub fn clear_decorations(&mut self) {
        if !self.decorations.is_empty() {
            self.decorations.clear();
            self.request_render();
        }
    }

    /// Move every cursor to the top of the paint order, keeping their relative order.
    pub fn raise_cursors(&mut self) {
        let (cursors, others): (Vec<Decoration>, Vec<Decoration>) = self
            .decorations
            .drain(..)
            .partition(|d| d.kind.is_cursor());
        self.decorations = others;
        self.decorations.extend(cursors);
    }

    fn relayout_anchored(&mut self, target: &ShapeId) {
        let Some(shape) = self.shapes.get(target) else {
            return;
        };
        let placement = decompose_matrix(self.outer_transform(target) * shape.affine());
        let local = shape.geometry.local_bounds();
        let width = local.width() * placement.scale_x.abs();
        let height = local.height() * placement.scale_y.abs();

        for decoration in &mut self.decorations {
            match &decoration.kind {
                DecorationKind::SelectionBorder { target: t, inset, .. } if t == target => {
                    decoration.bounds = Rect::new(
                        placement.left - inset,
                        placement.top - inset,
                        placement.left + width + inset,
                        placement.top + height + inset,
                    );
                    decoration.angle = placement.angle;
                }
                DecorationKind::NameTag {
                    target: t,
                    offset,
                    label,
                    ..
                } if t == target => {
                    let origin = Point::new(placement.left, placement.top - offset);
                    let size = Size::new(
                        label.chars().count() as f64 * NAME_TAG_FONT_SIZE * 0.6,
                        NAME_TAG_FONT_SIZE,
                    );
                    decoration.bounds = Rect::from_origin_size(origin, size);
                }
                _ => {}
            }
        }
    }

    /// Everything to paint, back to front. Hidden shapes are skipped.
    pub fn render_list(&self) -> Vec<RenderItem<'_>> {
        self.shapes_ordered()
            .filter(|shape| shape.visible)
            .map(RenderItem::Shape)
            .chain(self.decorations.iter().map(RenderItem::Decoration))
            .collect()
    }
}
