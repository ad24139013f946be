//! Per-frame perception signals.
//!
//! These are the only inputs an evaluator ever sees. Backends produce them
//! fresh for every frame; nothing here is carried across frames.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geometry::{clamp_box, BBox, Point};
use crate::session::SessionConfig;

/// Number of landmarks in a hand skeleton.
pub const HAND_LANDMARK_COUNT: usize = 21;

pub const WRIST: usize = 0;
pub const THUMB_TIP: usize = 4;
pub const INDEX_MCP: usize = 5;
pub const INDEX_TIP: usize = 8;
pub const MIDDLE_TIP: usize = 12;
pub const RING_TIP: usize = 16;
pub const PINKY_TIP: usize = 20;

/// Landmark indices of the five fingertips.
pub const FINGERTIPS: [usize; 5] = [THUMB_TIP, INDEX_TIP, MIDDLE_TIP, RING_TIP, PINKY_TIP];

/// Detected target object (the cup / bottle).
///
/// Only [`Detection::clamped`] builds one, so the box always lies inside the
/// frame it was detected in.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Detection {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
    score: f32,
}

impl Detection {
    /// Build a detection clamped to the frame. Returns `None` if the clamped box
    /// has no area.
    pub fn clamped(bbox: BBox, score: f32, width: u32, height: u32) -> Option<Self> {
        let b = clamp_box(bbox, width, height);
        if b.x2 <= b.x1 || b.y2 <= b.y1 {
            return None;
        }
        Some(Self {
            x1: b.x1,
            y1: b.y1,
            x2: b.x2,
            y2: b.y2,
            score,
        })
    }

    pub fn bbox(&self) -> BBox {
        BBox::new(self.x1, self.y1, self.x2, self.y2)
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn center(&self) -> Point {
        self.bbox().center()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandSide {
    Left,
    #[default]
    Right,
}

impl HandSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandSide::Left => "left",
            HandSide::Right => "right",
        }
    }

    /// Accepts `left`, `right`, `l`, `r` in any case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "l" | "left" => Some(HandSide::Left),
            "r" | "right" => Some(HandSide::Right),
            _ => None,
        }
    }
}

/// Pixel positions of one hand's landmarks, indexed 0..21.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LandmarkMap {
    points: [Option<Point>; HAND_LANDMARK_COUNT],
}

impl LandmarkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = (usize, Point)>,
    {
        let mut map = Self::new();
        for (idx, pt) in points {
            map.insert(idx, pt);
        }
        map
    }

    /// Out-of-range indices are ignored.
    pub fn insert(&mut self, idx: usize, pt: Point) {
        if let Some(slot) = self.points.get_mut(idx) {
            *slot = Some(pt);
        }
    }

    pub fn get(&self, idx: usize) -> Option<Point> {
        self.points.get(idx).copied().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.points.iter().all(Option::is_none)
    }

    /// Visible fingertips, in landmark order.
    pub fn fingertips(&self) -> impl Iterator<Item = Point> + '_ {
        FINGERTIPS.iter().filter_map(move |&idx| self.get(idx))
    }
}

/// Both hands for one frame. An empty map means that hand was not seen.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandLandmarks {
    pub left: Option<LandmarkMap>,
    pub right: Option<LandmarkMap>,
}

impl HandLandmarks {
    pub fn side(&self, side: HandSide) -> Option<&LandmarkMap> {
        let map = match side {
            HandSide::Left => self.left.as_ref(),
            HandSide::Right => self.right.as_ref(),
        };
        map.filter(|m| !m.is_empty())
    }

    /// Visible hands in iteration order: left, then right.
    pub fn visible(&self) -> impl Iterator<Item = (HandSide, &LandmarkMap)> {
        [HandSide::Left, HandSide::Right]
            .into_iter()
            .filter_map(move |side| self.side(side).map(|m| (side, m)))
    }

    pub fn is_empty(&self) -> bool {
        self.visible().next().is_none()
    }
}

/// Face/pose derived head measurements.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HeadMetrics {
    pub mouth_center: Option<Point>,
    /// Pixel distance between the ears; the scale reference for mouth thresholds.
    pub ear_distance: Option<f64>,
}

impl HeadMetrics {
    /// Ear distance if present and usable as a scale.
    pub fn scale(&self) -> Option<f64> {
        self.ear_distance.filter(|d| d.is_finite() && *d > 0.0)
    }
}

/// Everything an evaluator sees for one frame.
#[derive(Clone, Debug, Default)]
pub struct FrameSignals {
    /// Monotonic time since the loop started.
    pub timestamp: Duration,
    pub frame_width: u32,
    pub frame_height: u32,
    pub detection: Option<Detection>,
    pub hands: HandLandmarks,
    pub head: HeadMetrics,
    pub session: SessionConfig,
}

impl FrameSignals {
    /// Signals with nothing detected.
    pub fn empty(timestamp: Duration, frame_width: u32, frame_height: u32) -> Self {
        Self {
            timestamp,
            frame_width,
            frame_height,
            ..Self::default()
        }
    }

    pub fn secs(&self) -> f64 {
        self.timestamp.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_is_clamped_to_frame() {
        let det = Detection::clamped(BBox::new(-20, 10, 900, 200), 0.9, 640, 480).unwrap();
        assert_eq!(det.bbox(), BBox::new(0, 10, 639, 200));
        assert!(Detection::clamped(BBox::new(700, 10, 800, 200), 0.9, 640, 480).is_none());
    }

    #[test]
    fn empty_landmark_maps_count_as_missing_hands() {
        let hands = HandLandmarks {
            left: Some(LandmarkMap::new()),
            right: Some(LandmarkMap::from_points([(INDEX_TIP, Point::new(5, 5))])),
        };
        let visible: Vec<_> = hands.visible().map(|(s, _)| s).collect();
        assert_eq!(visible, vec![HandSide::Right]);
    }

    #[test]
    fn hand_side_parses_short_forms() {
        assert_eq!(HandSide::parse("L"), Some(HandSide::Left));
        assert_eq!(HandSide::parse(" right "), Some(HandSide::Right));
        assert_eq!(HandSide::parse("both"), None);
    }
}
