//! Shape model: a tagged union of kinds, lock fields co-located on the
//! document, and field-level patches.
//!
//! ```text
//! Shape
//!  ├── id / created_by / created_at / updated_at
//!  ├── lock: Option<ShapeLock>      (holder + locked_at, both or neither)
//!  └── kind: ShapeKind
//!        ├── Rectangle { x, y, width, height, style }
//!        ├── Circle    { x, y, radius, style }
//!        └── Text      { x, y, content, font_size, style }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::ids::{ShapeId, Timestamp, UserId};

pub const DEFAULT_FILL: &str = "#3b82f6";
pub const DEFAULT_STROKE: &str = "#1e3a8a";
pub const DEFAULT_TEXT_FILL: &str = "#111827";
pub const DEFAULT_STROKE_WIDTH: f32 = 2.0;
pub const DEFAULT_RECT_SIZE: f32 = 100.0;
pub const DEFAULT_RADIUS: f32 = 50.0;
pub const DEFAULT_FONT_SIZE: f32 = 16.0;

/// Smallest width/height/radius a shape may have.
pub const MIN_DIMENSION: f32 = 1.0;
pub const MAX_FONT_SIZE: f32 = 512.0;

/// Paint attributes shared by every kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Style {
    pub fill: String,
    pub stroke: String,
    pub stroke_width: f32,
    /// Degrees, normalized to `[0, 360)`.
    pub rotation: f32,
    /// Clamped to `[0, 1]`.
    pub opacity: f32,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            fill: DEFAULT_FILL.to_string(),
            stroke: DEFAULT_STROKE.to_string(),
            stroke_width: DEFAULT_STROKE_WIDTH,
            rotation: 0.0,
            opacity: 1.0,
        }
    }
}

impl Style {
    fn text_default() -> Self {
        Self {
            fill: DEFAULT_TEXT_FILL.to_string(),
            stroke_width: 0.0,
            ..Self::default()
        }
    }

    fn normalize(&mut self) -> Result<(), CollabError> {
        finite("stroke_width", self.stroke_width)?;
        finite("rotation", self.rotation)?;
        finite("opacity", self.opacity)?;
        if self.stroke_width < 0.0 {
            return Err(CollabError::InvalidShape(format!(
                "stroke_width must be non-negative, got {}",
                self.stroke_width
            )));
        }
        if !is_color(&self.fill) {
            return Err(CollabError::InvalidShape(format!("invalid fill color '{}'", self.fill)));
        }
        if !is_color(&self.stroke) {
            return Err(CollabError::InvalidShape(format!(
                "invalid stroke color '{}'",
                self.stroke
            )));
        }
        self.rotation = self.rotation.rem_euclid(360.0);
        self.opacity = self.opacity.clamp(0.0, 1.0);
        Ok(())
    }
}

/// Kind-specific geometry. Matched exhaustively wherever shapes change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShapeKind {
    Rectangle {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        style: Style,
    },
    Circle {
        x: f32,
        y: f32,
        radius: f32,
        style: Style,
    },
    Text {
        x: f32,
        y: f32,
        content: String,
        font_size: f32,
        style: Style,
    },
}

impl ShapeKind {
    pub fn rectangle(x: f32, y: f32, width: f32, height: f32) -> Self {
        ShapeKind::Rectangle { x, y, width, height, style: Style::default() }
    }

    pub fn circle(x: f32, y: f32, radius: f32) -> Self {
        ShapeKind::Circle { x, y, radius, style: Style::default() }
    }

    pub fn text(x: f32, y: f32, content: impl Into<String>) -> Self {
        ShapeKind::Text {
            x,
            y,
            content: content.into(),
            font_size: DEFAULT_FONT_SIZE,
            style: Style::text_default(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShapeKind::Rectangle { .. } => "rectangle",
            ShapeKind::Circle { .. } => "circle",
            ShapeKind::Text { .. } => "text",
        }
    }

    pub fn position(&self) -> (f32, f32) {
        match self {
            ShapeKind::Rectangle { x, y, .. }
            | ShapeKind::Circle { x, y, .. }
            | ShapeKind::Text { x, y, .. } => (*x, *y),
        }
    }

    pub fn style(&self) -> &Style {
        match self {
            ShapeKind::Rectangle { style, .. }
            | ShapeKind::Circle { style, .. }
            | ShapeKind::Text { style, .. } => style,
        }
    }

    pub fn style_mut(&mut self) -> &mut Style {
        match self {
            ShapeKind::Rectangle { style, .. }
            | ShapeKind::Circle { style, .. }
            | ShapeKind::Text { style, .. } => style,
        }
    }

    /// Builder-style style override.
    pub fn with_style(mut self, style: Style) -> Self {
        *self.style_mut() = style;
        self
    }

    /// Check geometry and normalize paint attributes in place.
    pub fn validate(&mut self) -> Result<(), CollabError> {
        let (x, y) = self.position();
        finite("x", x)?;
        finite("y", y)?;
        match self {
            ShapeKind::Rectangle { width, height, .. } => {
                dimension("width", *width)?;
                dimension("height", *height)?;
            }
            ShapeKind::Circle { radius, .. } => {
                dimension("radius", *radius)?;
            }
            ShapeKind::Text { font_size, .. } => {
                finite("font_size", *font_size)?;
                if *font_size <= 0.0 || *font_size > MAX_FONT_SIZE {
                    return Err(CollabError::InvalidShape(format!(
                        "font_size must be in (0, {MAX_FONT_SIZE}], got {font_size}"
                    )));
                }
            }
        }
        self.style_mut().normalize()
    }
}

/// Lock fields. Present only while exactly one session holds the shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeLock {
    pub holder: UserId,
    pub locked_at: Timestamp,
}

/// A persistent shape document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: ShapeId,
    pub kind: ShapeKind,
    pub created_by: UserId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub lock: Option<ShapeLock>,
}

impl Shape {
    /// Validate `kind` and stamp a new, unlocked document.
    pub fn create(mut kind: ShapeKind, created_by: UserId, now: Timestamp) -> Result<Self, CollabError> {
        kind.validate()?;
        Ok(Self {
            id: ShapeId::new(),
            kind,
            created_by,
            created_at: now,
            updated_at: now,
            lock: None,
        })
    }

    pub fn locked_by(&self) -> Option<&UserId> {
        self.lock.as_ref().map(|l| &l.holder)
    }

    pub fn locked_at(&self) -> Option<Timestamp> {
        self.lock.as_ref().map(|l| l.locked_at)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn is_locked_by(&self, user: &UserId) -> bool {
        self.locked_by() == Some(user)
    }

    /// Mutation gate: unlocked shapes are writable by anyone, locked shapes
    /// only by their holder.
    pub fn check_writable(&self, caller: &UserId) -> Result<(), CollabError> {
        match &self.lock {
            Some(lock) if &lock.holder != caller => Err(CollabError::LockConflict {
                shape: self.id,
                holder: lock.holder.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Field-level update. Fields that do not exist on the target kind are
/// rejected rather than ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapePatch {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub width: Option<f32>,
    pub height: Option<f32>,
    pub radius: Option<f32>,
    pub content: Option<String>,
    pub font_size: Option<f32>,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f32>,
    pub rotation: Option<f32>,
    pub opacity: Option<f32>,
}

impl ShapePatch {
    pub fn position(x: f32, y: f32) -> Self {
        Self { x: Some(x), y: Some(y), ..Self::default() }
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = Some(fill.into());
        self
    }

    pub fn with_rotation(mut self, degrees: f32) -> Self {
        self.rotation = Some(degrees);
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = Some(opacity);
        self
    }

    pub fn with_size(mut self, width: f32, height: f32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = Some(radius);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge into `kind`. On error `kind` is left untouched.
    pub fn apply(&self, kind: &mut ShapeKind) -> Result<(), CollabError> {
        let mut next = kind.clone();
        match &mut next {
            ShapeKind::Rectangle { x, y, width, height, .. } => {
                self.reject(self.radius.is_some(), "radius", "rectangle")?;
                self.reject(self.content.is_some(), "content", "rectangle")?;
                self.reject(self.font_size.is_some(), "font_size", "rectangle")?;
                set(x, self.x);
                set(y, self.y);
                set(width, self.width);
                set(height, self.height);
            }
            ShapeKind::Circle { x, y, radius, .. } => {
                self.reject(self.width.is_some() || self.height.is_some(), "width/height", "circle")?;
                self.reject(self.content.is_some(), "content", "circle")?;
                self.reject(self.font_size.is_some(), "font_size", "circle")?;
                set(x, self.x);
                set(y, self.y);
                set(radius, self.radius);
            }
            ShapeKind::Text { x, y, content, font_size, .. } => {
                self.reject(self.width.is_some() || self.height.is_some(), "width/height", "text")?;
                self.reject(self.radius.is_some(), "radius", "text")?;
                set(x, self.x);
                set(y, self.y);
                set(font_size, self.font_size);
                if let Some(text) = &self.content {
                    *content = text.clone();
                }
            }
        }

        let style = next.style_mut();
        if let Some(fill) = &self.fill {
            style.fill = fill.clone();
        }
        if let Some(stroke) = &self.stroke {
            style.stroke = stroke.clone();
        }
        set(&mut style.stroke_width, self.stroke_width);
        set(&mut style.rotation, self.rotation);
        set(&mut style.opacity, self.opacity);

        next.validate()?;
        *kind = next;
        Ok(())
    }

    fn reject(&self, present: bool, field: &str, kind: &str) -> Result<(), CollabError> {
        if present {
            return Err(CollabError::InvalidShape(format!("{kind} has no field '{field}'")));
        }
        Ok(())
    }
}

/// A patch that rewrites every field of `kind`. Used to restore snapshots.
impl From<&ShapeKind> for ShapePatch {
    fn from(kind: &ShapeKind) -> Self {
        let style = kind.style();
        let mut patch = ShapePatch {
            fill: Some(style.fill.clone()),
            stroke: Some(style.stroke.clone()),
            stroke_width: Some(style.stroke_width),
            rotation: Some(style.rotation),
            opacity: Some(style.opacity),
            ..ShapePatch::default()
        };
        match kind {
            ShapeKind::Rectangle { x, y, width, height, .. } => {
                patch.x = Some(*x);
                patch.y = Some(*y);
                patch.width = Some(*width);
                patch.height = Some(*height);
            }
            ShapeKind::Circle { x, y, radius, .. } => {
                patch.x = Some(*x);
                patch.y = Some(*y);
                patch.radius = Some(*radius);
            }
            ShapeKind::Text { x, y, content, font_size, .. } => {
                patch.x = Some(*x);
                patch.y = Some(*y);
                patch.content = Some(content.clone());
                patch.font_size = Some(*font_size);
            }
        }
        patch
    }
}

fn set(slot: &mut f32, value: Option<f32>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn finite(field: &str, value: f32) -> Result<(), CollabError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CollabError::InvalidShape(format!("{field} must be finite")))
    }
}

fn dimension(field: &str, value: f32) -> Result<(), CollabError> {
    finite(field, value)?;
    if value < MIN_DIMENSION {
        return Err(CollabError::InvalidShape(format!(
            "{field} must be at least {MIN_DIMENSION}, got {value}"
        )));
    }
    Ok(())
}

/// `#rgb`, `#rrggbb` or `#rrggbbaa`.
fn is_color(s: &str) -> bool {
    match s.strip_prefix('#') {
        Some(hex) => matches!(hex.len(), 3 | 6 | 8) && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}
