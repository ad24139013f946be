//! Pixel-space geometry helpers shared by the evaluators.
//!
//! Everything here is pure. Coordinates are integer pixels with the origin at
//! the top-left corner of the frame and `y` growing downwards.

use serde::{Deserialize, Serialize};

/// A pixel coordinate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Integer midpoint, truncating like the landmark pipeline does.
    pub fn midpoint(self, other: Point) -> Point {
        Point::new(mid(self.x, other.x), mid(self.y, other.y))
    }
}

/// Truncating midpoint computed in `i64`, so it cannot overflow.
fn mid(a: i32, b: i32) -> i32 {
    ((i64::from(a) + i64::from(b)) / 2) as i32
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Point::new(x, y)
    }
}

/// Axis-aligned box in pixel coordinates, inclusive on all edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> i32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn center(&self) -> Point {
        Point::new(mid(self.x1, self.x2), mid(self.y1, self.y2))
    }
}

/// Euclidean distance between two pixel coordinates.
pub fn distance(a: Point, b: Point) -> f64 {
    let dx = f64::from(a.x) - f64::from(b.x);
    let dy = f64::from(a.y) - f64::from(b.y);
    dx.hypot(dy)
}

/// Magnitude of the discrete second difference `p2 - 2·p1 + p0`, i.e. the
/// per-frame acceleration of a tracked point.
pub fn second_difference(p0: Point, p1: Point, p2: Point) -> f64 {
    let ax = f64::from(p2.x) - 2.0 * f64::from(p1.x) + f64::from(p0.x);
    let ay = f64::from(p2.y) - 2.0 * f64::from(p1.y) + f64::from(p0.y);
    ax.hypot(ay)
}

/// Inclusive point-in-box test.
pub fn point_in_box(pt: Point, bbox: &BBox) -> bool {
    (bbox.x1..=bbox.x2).contains(&pt.x) && (bbox.y1..=bbox.y2).contains(&pt.y)
}

/// Grow a box by `margin` pixels on every side. The result may extend past the frame.
pub fn expand_box(bbox: &BBox, margin: i32) -> BBox {
    BBox::new(
        bbox.x1.saturating_sub(margin),
        bbox.y1.saturating_sub(margin),
        bbox.x2.saturating_add(margin),
        bbox.y2.saturating_add(margin),
    )
}

/// Clamp a box to `[0, width-1] x [0, height-1]`, swapping inverted corners.
pub fn clamp_box(bbox: BBox, width: u32, height: u32) -> BBox {
    let max_x = width.saturating_sub(1) as i32;
    let max_y = height.saturating_sub(1) as i32;
    let mut x1 = bbox.x1.clamp(0, max_x);
    let mut y1 = bbox.y1.clamp(0, max_y);
    let mut x2 = bbox.x2.clamp(0, max_x);
    let mut y2 = bbox.y2.clamp(0, max_y);
    if x2 < x1 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y2 < y1 {
        std::mem::swap(&mut y1, &mut y2);
    }
    BBox::new(x1, y1, x2, y2)
}

/// Unsigned angle in degrees, `[0, 180]`, between the vector `from -> to` and
/// the positive x axis. Returns `None` for a zero-length vector.
pub fn angle_from_horizontal(from: Point, to: Point) -> Option<f64> {
    let dx = f64::from(to.x) - f64::from(from.x);
    let dy = f64::from(to.y) - f64::from(from.y);
    if dx == 0.0 && dy == 0.0 {
        return None;
    }
    // Image y grows downwards; flip so "up" is a positive angle, then fold to [0, 180].
    Some((-dy).atan2(dx).to_degrees().abs())
}
