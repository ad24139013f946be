//! `dump_into_mouth`: tip the container by turning the forearm towards horizontal.

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use super::{
    hold_fraction, palette, select_hand, ContinuityTimer, DrawOp, Evaluator, EvaluatorResult,
    HandPolicy, SelectedHand, TaskParams,
};
use crate::geometry::{angle_from_horizontal, second_difference, BBox, Point};
use crate::perception::Capability;
use crate::session::SessionConfig;
use crate::signals::{FrameSignals, LandmarkMap, INDEX_TIP, WRIST};

/// Forearm counts as tilted below this angle from horizontal...
pub const TILT_LOW_DEG: f64 = 30.0;
/// ...or above this one (pointing the other way).
pub const TILT_HIGH_DEG: f64 = 150.0;
pub const DEFAULT_HOLD: Duration = Duration::from_secs(1);

/// A pour should sweep the object through at least this many degrees.
pub const MIN_TILT_RANGE_DEG: f64 = 50.0;
/// More jerks than this and the pour is reported as not smooth.
pub const MAX_JERKS: u32 = 5;
/// Change in per-frame tilt rate that counts as a jerk.
pub const JERK_ANGLE_DEG: f64 = 10.0;
/// Per-frame acceleration of the object center that counts as a jerk.
pub const JERK_ACCEL_PX: f64 = 100.0;

const REQUIREMENTS: &[Capability] = &[
    Capability::ObjectDetection,
    Capability::HandLandmarks,
    Capability::FacePose,
];

fn forearm_tip(m: &LandmarkMap) -> Option<Point> {
    m.get(WRIST)?;
    m.get(INDEX_TIP)
}

pub fn is_tilted(angle: f64) -> bool {
    angle < TILT_LOW_DEG || angle > TILT_HIGH_DEG
}

/// Object tilt from its box shape: 0 upright, towards 90 as it lies flat.
pub fn box_tilt_deg(bbox: &BBox) -> f64 {
    f64::from(bbox.width()).atan2(f64::from(bbox.height())).to_degrees()
}

/// Running smoothness of a pour, fed one detection per frame.
///
/// Keeps only the last three samples plus the extremes, so memory stays flat
/// however long the task runs.
#[derive(Clone, Debug, Default)]
pub struct PourTracker {
    angles: [f64; 3],
    centers: [Point; 3],
    samples: u64,
    min_angle: f64,
    max_angle: f64,
    jerks: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PourMetrics {
    pub tilt_range_deg: f64,
    pub jerks: u32,
    pub full_tilt: bool,
    pub smooth: bool,
}

impl PourTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn push(&mut self, bbox: &BBox) {
        let angle = box_tilt_deg(bbox);
        let center = bbox.center();
        self.angles = [self.angles[1], self.angles[2], angle];
        self.centers = [self.centers[1], self.centers[2], center];
        if self.samples == 0 {
            self.min_angle = angle;
            self.max_angle = angle;
        } else {
            self.min_angle = self.min_angle.min(angle);
            self.max_angle = self.max_angle.max(angle);
        }
        self.samples += 1;
        if self.samples >= 3 {
            let [a0, a1, a2] = self.angles;
            if ((a2 - a1) - (a1 - a0)).abs() >= JERK_ANGLE_DEG {
                self.jerks += 1;
            }
            let [c0, c1, c2] = self.centers;
            if second_difference(c0, c1, c2) >= JERK_ACCEL_PX {
                self.jerks += 1;
            }
        }
    }

    pub fn metrics(&self) -> Option<PourMetrics> {
        if self.samples == 0 {
            return None;
        }
        let tilt_range_deg = self.max_angle - self.min_angle;
        Some(PourMetrics {
            tilt_range_deg,
            jerks: self.jerks,
            full_tilt: tilt_range_deg >= MIN_TILT_RANGE_DEG,
            smooth: self.jerks <= MAX_JERKS,
        })
    }
}

#[derive(Debug, Serialize)]
struct DumpMetrics {
    forearm_angle_deg: f64,
    #[serde(flatten)]
    pour: Option<PourMetrics>,
}

#[derive(Debug)]
pub struct DumpIntoMouthEvaluator {
    hold: Duration,
    policy: HandPolicy,
    timer: ContinuityTimer,
    pour: PourTracker,
}

impl Default for DumpIntoMouthEvaluator {
    fn default() -> Self {
        Self {
            hold: DEFAULT_HOLD,
            policy: HandPolicy::Nearest,
            timer: ContinuityTimer::new(),
            pour: PourTracker::new(),
        }
    }
}

impl DumpIntoMouthEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The hand holding the container: nearest to the object, else nearest to
    /// the mouth, else the dominant hand if it is visible.
    fn pick_hand<'a>(&self, signals: &'a FrameSignals) -> Option<SelectedHand<'a>> {
        let dominant = signals.session.dominant_hand;
        let anchor = signals
            .detection
            .map(|d| d.center())
            .or(signals.head.mouth_center);
        if let Some(anchor) = anchor {
            return select_hand(&signals.hands, anchor, self.policy, dominant, forearm_tip);
        }
        let landmarks = signals.hands.side(dominant)?;
        let tip = forearm_tip(landmarks)?;
        Some(SelectedHand {
            side: dominant,
            landmarks,
            point: tip,
            distance: 0.0,
        })
    }
}

impl Evaluator for DumpIntoMouthEvaluator {
    fn task_id(&self) -> &'static str {
        "dump_into_mouth"
    }

    fn requirements(&self) -> &'static [Capability] {
        REQUIREMENTS
    }

    fn start(&mut self, params: &TaskParams, _session: &SessionConfig) -> Result<()> {
        self.hold = params.hold_or(DEFAULT_HOLD);
        self.policy = params.hand.unwrap_or_default();
        self.timer.reset();
        self.pour.reset();
        Ok(())
    }

    fn update(&mut self, signals: &FrameSignals) -> EvaluatorResult {
        if let Some(det) = signals.detection {
            self.pour.push(&det.bbox());
        }
        let angle = self.pick_hand(signals).and_then(|hand| {
            let wrist = hand.landmarks.get(WRIST)?;
            angle_from_horizontal(wrist, hand.point).map(|a| (wrist, hand.point, a))
        });
        let Some((wrist, tip, angle)) = angle else {
            self.timer.reset();
            return EvaluatorResult::idle("idle");
        };

        let tilted = is_tilted(angle);
        let held = self.timer.observe(tilted, signals.timestamp);
        let overlay = vec![
            DrawOp::Line {
                from: wrist,
                to: tip,
                color: if tilted { palette::OK } else { palette::WARN },
                thickness: 3,
            },
            DrawOp::Label {
                origin: Point::new(wrist.x.saturating_add(10), wrist.y.saturating_add(20)),
                text: format!("{angle:.0} deg"),
                color: palette::TEXT,
            },
        ];

        let metrics = DumpMetrics {
            forearm_angle_deg: angle,
            pour: self.pour.metrics(),
        };
        if !tilted {
            return EvaluatorResult::new("idle", false, 0.0)
                .with_overlay(overlay)
                .with_metrics(&metrics);
        }
        let passed = held >= self.hold;
        let state = if passed { "held_tilt" } else { "tilting" };
        EvaluatorResult::new(state, passed, hold_fraction(held, self.hold))
            .with_overlay(overlay)
            .with_metrics(&metrics)
    }
}
