//! Pixel boxes, fractional detection regions and coarse location keys.

use serde::{Deserialize, Serialize};

/// Default bucket size (pixels) used to derive a `LocationKey`.
pub const DEFAULT_LOCATION_THRESHOLD: u32 = 50;

/// Axis-aligned box in pixel coordinates. `x2`/`y2` are exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// Build a box, swapping inverted corners.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Integer center point, floored.
    pub fn center(&self) -> (i32, i32) {
        (
            (self.x1 + self.x2).div_euclid(2),
            (self.y1 + self.y2).div_euclid(2),
        )
    }

    /// Clip the box to a `width` x `height` frame. Returns `None` when nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Self> {
        let w = i32::try_from(width).unwrap_or(i32::MAX);
        let h = i32::try_from(height).unwrap_or(i32::MAX);
        let clipped = Self {
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
            x2: self.x2.clamp(0, w),
            y2: self.y2.clamp(0, h),
        };
        (!clipped.is_empty()).then_some(clipped)
    }

    /// Shift the box so that `origin` becomes (0, 0).
    pub fn relative_to(&self, origin: &BoundingBox) -> Self {
        Self {
            x1: self.x1 - origin.x1,
            y1: self.y1 - origin.y1,
            x2: self.x2 - origin.x1,
            y2: self.y2 - origin.y1,
        }
    }
}

/// Rectangle in fractional frame coordinates (0.0..=1.0) restricting where plates count.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRegion {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DetectionRegion {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            enabled: true,
        }
        .normalized()
    }

    /// Swap inverted corners and clamp every coordinate into `[0, 1]`.
    pub fn normalized(self) -> Self {
        let clamp = |v: f32| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        let (x1, x2) = (clamp(self.x1), clamp(self.x2));
        let (y1, y2) = (clamp(self.y1), clamp(self.y2));
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
            enabled: self.enabled,
        }
    }

    /// A region limits analysis only when enabled and non-degenerate.
    pub fn is_active(&self) -> bool {
        self.enabled && self.x2 > self.x1 && self.y2 > self.y1
    }

    pub fn to_pixels(&self, width: u32, height: u32) -> BoundingBox {
        let (w, h) = (width as f32, height as f32);
        BoundingBox::new(
            (self.x1 * w) as i32,
            (self.y1 * h) as i32,
            (self.x2 * w) as i32,
            (self.y2 * h) as i32,
        )
    }

    /// Inclusive point test in pixel space.
    pub fn contains_point(&self, x: i32, y: i32, width: u32, height: u32) -> bool {
        let rect = self.to_pixels(width, height);
        rect.x1 <= x && x <= rect.x2 && rect.y1 <= y && y <= rect.y2
    }
}

/// Returns the region only when it actually restricts analysis.
pub fn active_region(region: Option<DetectionRegion>) -> Option<DetectionRegion> {
    region.map(DetectionRegion::normalized).filter(DetectionRegion::is_active)
}

/// Coarse spatial bucket standing in for "the same plate" across frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationKey {
    pub x: i32,
    pub y: i32,
}

impl LocationKey {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn from_center(cx: i32, cy: i32, threshold: u32) -> Self {
        let t = i32::try_from(threshold.max(1)).unwrap_or(i32::MAX);
        Self {
            x: cx.div_euclid(t),
            y: cy.div_euclid(t),
        }
    }

    pub fn for_box(bbox: &BoundingBox, threshold: u32) -> Self {
        let (cx, cy) = bbox.center();
        Self::from_center(cx, cy, threshold)
    }
}

impl std::fmt::Display for LocationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.x, self.y)
    }
}
