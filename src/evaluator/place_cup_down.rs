//! `place_cup_down`: lower the object into the bottom band of the frame and leave it there.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use super::{
    hold_fraction, palette, ContinuityTimer, DrawOp, Evaluator, EvaluatorResult, TaskParams,
};
use crate::geometry::{distance, second_difference, BBox, Point};
use crate::perception::Capability;
use crate::session::SessionConfig;
use crate::signals::FrameSignals;

/// The object's vertical center must be at or below this fraction of the frame height.
pub const NEAR_BOTTOM_RATIO: f64 = 0.8;
pub const DEFAULT_HOLD: Duration = Duration::from_secs(1);

/// Real height assumed for the object when converting pixels to centimetres.
pub const ASSUMED_OBJECT_HEIGHT_CM: f64 = 24.0;
/// Largest distance from the starting spot still reported as accurate.
pub const ACCURACY_THRESHOLD_CM: f64 = 10.0;
/// Median per-frame acceleration (px) still reported as smooth.
pub const SMOOTHNESS_THRESHOLD_PX: f64 = 20.0;
/// Acceleration samples kept for the median, one minute at 20 Hz.
const MAX_PATH_SAMPLES: usize = 1200;

const REQUIREMENTS: &[Capability] = &[Capability::ObjectDetection];

/// Where the object started, how far it ends up from there, and how smoothly
/// it travelled.
///
/// The centimetre scale comes from the first box seen after `start`.
#[derive(Clone, Debug, Default)]
pub struct PlacementTracker {
    start: Option<Point>,
    cm_per_px: Option<f64>,
    recent: Vec<Point>,
    accels: VecDeque<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PlacementMetrics {
    pub placement_error_cm: Option<f64>,
    pub accurate: Option<bool>,
    /// Median per-frame acceleration of the object center, lower is smoother.
    pub smoothness_px: Option<f64>,
    pub smooth: Option<bool>,
}

impl PlacementTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn push(&mut self, bbox: &BBox) {
        let center = bbox.center();
        if self.start.is_none() {
            self.start = Some(center);
            self.cm_per_px =
                (bbox.height() > 0).then(|| ASSUMED_OBJECT_HEIGHT_CM / f64::from(bbox.height()));
        }
        self.recent.push(center);
        if self.recent.len() > 3 {
            self.recent.remove(0);
        }
        if let [p0, p1, p2] = self.recent[..] {
            if self.accels.len() == MAX_PATH_SAMPLES {
                self.accels.pop_front();
            }
            self.accels.push_back(second_difference(p0, p1, p2));
        }
    }

    pub fn smoothness(&self) -> Option<f64> {
        if self.accels.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.accels.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        })
    }

    pub fn metrics(&self) -> Option<PlacementMetrics> {
        let start = self.start?;
        let current = *self.recent.last()?;
        let error = self.cm_per_px.map(|scale| distance(start, current) * scale);
        let smoothness = self.smoothness();
        Some(PlacementMetrics {
            placement_error_cm: error,
            accurate: error.map(|e| e <= ACCURACY_THRESHOLD_CM),
            smoothness_px: smoothness,
            smooth: smoothness.map(|s| s <= SMOOTHNESS_THRESHOLD_PX),
        })
    }
}

#[derive(Debug)]
pub struct PlaceCupDownEvaluator {
    hold: Duration,
    timer: ContinuityTimer,
    placement: PlacementTracker,
}

impl Default for PlaceCupDownEvaluator {
    fn default() -> Self {
        Self {
            hold: DEFAULT_HOLD,
            timer: ContinuityTimer::new(),
            placement: PlacementTracker::new(),
        }
    }
}

impl PlaceCupDownEvaluator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Evaluator for PlaceCupDownEvaluator {
    fn task_id(&self) -> &'static str {
        "place_cup_down"
    }

    fn requirements(&self) -> &'static [Capability] {
        REQUIREMENTS
    }

    fn start(&mut self, params: &TaskParams, _session: &SessionConfig) -> Result<()> {
        self.hold = params.hold_or(DEFAULT_HOLD);
        self.timer.reset();
        self.placement.reset();
        Ok(())
    }

    fn update(&mut self, signals: &FrameSignals) -> EvaluatorResult {
        let (Some(det), true) = (signals.detection, signals.frame_height > 0) else {
            self.timer.reset();
            return EvaluatorResult::idle("idle");
        };
        self.placement.push(&det.bbox());
        let metrics = self.placement.metrics();
        let line_y = (NEAR_BOTTOM_RATIO * f64::from(signals.frame_height)).round() as i32;
        let center = det.center();
        let near_bottom = center.y >= line_y;
        let held = self.timer.observe(near_bottom, signals.timestamp);

        let overlay = vec![
            DrawOp::Line {
                from: Point::new(0, line_y),
                to: Point::new(signals.frame_width.saturating_sub(1) as i32, line_y),
                color: palette::WARN,
                thickness: 1,
            },
            DrawOp::Rect {
                bbox: det.bbox(),
                color: if near_bottom {
                    palette::OK
                } else {
                    palette::TARGET
                },
                thickness: 2,
            },
        ];

        if !near_bottom {
            return EvaluatorResult::new("idle", false, 0.0)
                .with_overlay(overlay)
                .with_metrics(&metrics);
        }
        let passed = held >= self.hold;
        let state = if passed { "held_down" } else { "lowering" };
        EvaluatorResult::new(state, passed, hold_fraction(held, self.hold))
            .with_overlay(overlay)
            .with_metrics(&metrics)
    }
}
