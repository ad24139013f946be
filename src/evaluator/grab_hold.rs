//! `grab_hold`: touch the object, close a full grip on it, then hold it still.

use std::time::Duration;

use anyhow::Result;
use log::debug;
use serde::Serialize;

use super::{
    hold_fraction, nearest_fingertip, palette, select_hand, ContinuityTimer, DrawOp, Evaluator,
    EvaluatorResult, GripMode, HandPolicy, StabilityAccumulator, TaskParams,
};
use crate::geometry::{distance, expand_box, point_in_box, BBox, Point};
use crate::perception::Capability;
use crate::session::SessionConfig;
use crate::signals::{FrameSignals, LandmarkMap, INDEX_TIP, THUMB_TIP};

/// Touch radius as a fraction of half the larger box side.
pub const TOUCH_DIST_RATIO: f64 = 0.60;
/// Grip radius as a fraction of half the box width.
pub const GRIP_RADIUS_RATIO: f64 = 0.65;
pub const DEFAULT_FINGERS_REQUIRED: usize = 3;
pub const GRIP_CONFIRM: Duration = Duration::from_millis(100);
pub const DEFAULT_HOLD: Duration = Duration::from_secs(5);
/// Stability threshold when no ear distance is available.
pub const DEFAULT_STABILITY_PX: f64 = 10.0;
pub const STABILITY_EAR_RATIO: f64 = 0.10;

/// Pinch search margin as a fraction of the larger box side.
const PINCH_MARGIN_RATIO: f64 = 0.15;
const PINCH_BOX_RATIO: f64 = 0.35;
const PINCH_EAR_RATIO: f64 = 0.5;

const REQUIREMENTS: &[Capability] = &[
    Capability::ObjectDetection,
    Capability::HandLandmarks,
    Capability::FacePose,
];

/// Thumb/index pinch on the object.
///
/// Both tips must sit inside the box grown by 15% of its larger side, and be
/// no further apart than half the ear distance (or 35% of the smaller box side
/// when the ear distance is unknown).
pub fn grasp_detect(landmarks: &LandmarkMap, bbox: &BBox, ear_distance: Option<f64>) -> bool {
    let (Some(thumb), Some(index)) = (landmarks.get(THUMB_TIP), landmarks.get(INDEX_TIP)) else {
        return false;
    };
    let (w, h) = (bbox.width(), bbox.height());
    let margin = (PINCH_MARGIN_RATIO * f64::from(w.max(h))) as i32;
    let grown = expand_box(bbox, margin);
    if !point_in_box(thumb, &grown) || !point_in_box(index, &grown) {
        return false;
    }
    let threshold = match ear_distance.filter(|e| e.is_finite() && *e > 0.0) {
        Some(ear) => PINCH_EAR_RATIO * ear,
        None => PINCH_BOX_RATIO * f64::from(w.min(h)),
    };
    distance(thumb, index) <= threshold
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Touched,
    Gripping,
    Held,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Touched => "touched",
            Phase::Gripping => "gripping",
            Phase::Held => "held",
        }
    }
}

#[derive(Debug)]
pub struct GrabHoldEvaluator {
    phase: Phase,
    hold: Duration,
    fingers_required: usize,
    grip: GripMode,
    stability_px: Option<f64>,
    policy: HandPolicy,
    grip_timer: ContinuityTimer,
    stability: StabilityAccumulator,
    first_touch: Option<Duration>,
    grip_completion: Option<Duration>,
}

#[derive(Debug, Serialize)]
struct GripMetrics {
    /// First touch to confirmed full grip. Set once per run.
    grip_completion_s: Option<f64>,
    /// Spread of the object center over the current hold.
    stability_std_px: Option<f64>,
    stability_threshold_px: f64,
}

impl Default for GrabHoldEvaluator {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            hold: DEFAULT_HOLD,
            fingers_required: DEFAULT_FINGERS_REQUIRED,
            grip: GripMode::Fingers,
            stability_px: None,
            policy: HandPolicy::Nearest,
            grip_timer: ContinuityTimer::new(),
            stability: StabilityAccumulator::new(),
            first_touch: None,
            grip_completion: None,
        }
    }
}

impl GrabHoldEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn stability_threshold(&self, ear_distance: Option<f64>) -> f64 {
        match (self.stability_px, ear_distance) {
            (Some(px), _) => px,
            (None, Some(ear)) => STABILITY_EAR_RATIO * ear,
            (None, None) => DEFAULT_STABILITY_PX,
        }
    }

    fn metrics(&self, ear_distance: Option<f64>) -> GripMetrics {
        GripMetrics {
            grip_completion_s: self.grip_completion.map(|d| d.as_secs_f64()),
            stability_std_px: (self.stability.count() > 0).then(|| self.stability.std_dev()),
            stability_threshold_px: self.stability_threshold(ear_distance),
        }
    }

    fn release_grip(&mut self) {
        self.grip_timer.reset();
        self.stability.reset();
        if self.phase != Phase::Idle {
            self.phase = Phase::Touched;
        }
    }
}

impl Evaluator for GrabHoldEvaluator {
    fn task_id(&self) -> &'static str {
        "grab_hold"
    }

    fn requirements(&self) -> &'static [Capability] {
        REQUIREMENTS
    }

    fn start(&mut self, params: &TaskParams, _session: &SessionConfig) -> Result<()> {
        *self = Self {
            hold: params.hold_or(DEFAULT_HOLD),
            fingers_required: params.fingers_required.unwrap_or(DEFAULT_FINGERS_REQUIRED),
            grip: params.grip.unwrap_or_default(),
            stability_px: params.stability_px,
            policy: params.hand.unwrap_or_default(),
            ..Self::default()
        };
        Ok(())
    }

    fn update(&mut self, signals: &FrameSignals) -> EvaluatorResult {
        let Some(det) = signals.detection else {
            self.release_grip();
            return EvaluatorResult::idle(self.phase.as_str());
        };
        let bbox = det.bbox();
        let center = det.center();
        let (w, h) = (f64::from(bbox.width()), f64::from(bbox.height()));
        let touch_radius = TOUCH_DIST_RATIO * 0.5 * w.max(h);
        let grip_radius = GRIP_RADIUS_RATIO * 0.5 * w;
        let ear = signals.head.scale();

        let mut overlay = vec![
            DrawOp::Rect {
                bbox,
                color: palette::TARGET,
                thickness: 2,
            },
            DrawOp::Circle {
                center,
                radius: touch_radius.round() as u32,
                color: palette::WARN,
                filled: false,
            },
            DrawOp::Circle {
                center,
                radius: grip_radius.round() as u32,
                color: palette::OK,
                filled: false,
            },
        ];

        let hand = select_hand(
            &signals.hands,
            center,
            self.policy,
            signals.session.dominant_hand,
            |m| nearest_fingertip(m, center),
        );
        let Some(hand) = hand else {
            self.release_grip();
            return EvaluatorResult::new(self.phase.as_str(), false, 0.0).with_overlay(overlay);
        };

        for tip in hand.landmarks.fingertips() {
            overlay.push(DrawOp::Circle {
                center: tip,
                radius: 5,
                color: palette::HAND,
                filled: true,
            });
        }
        let pinched = grasp_detect(hand.landmarks, &bbox, ear);
        if pinched {
            overlay.push(DrawOp::Label {
                origin: Point::new(bbox.x1, bbox.y1 - 24),
                text: "GRABBED".to_string(),
                color: palette::OK,
            });
        }

        if self.phase == Phase::Idle && hand.distance <= touch_radius {
            self.phase = Phase::Touched;
            self.first_touch.get_or_insert(signals.timestamp);
        }
        if self.phase == Phase::Idle {
            return EvaluatorResult::new("idle", false, 0.0).with_overlay(overlay);
        }

        let full_grip = match self.grip {
            GripMode::Fingers => {
                hand.landmarks
                    .fingertips()
                    .filter(|tip| distance(*tip, center) <= grip_radius)
                    .count()
                    >= self.fingers_required
            }
            GripMode::Pinch => pinched,
        };
        let held = self.grip_timer.observe(full_grip, signals.timestamp);
        if !full_grip {
            self.release_grip();
            return EvaluatorResult::new("touched", false, 0.0)
                .with_overlay(overlay)
                .with_metrics(&self.metrics(ear));
        }

        self.stability.push(center);
        self.phase = if held >= GRIP_CONFIRM {
            Phase::Held
        } else {
            Phase::Gripping
        };
        if self.phase == Phase::Held && self.grip_completion.is_none() {
            let touched_at = self.first_touch.unwrap_or(signals.timestamp);
            self.grip_completion = Some(signals.timestamp.saturating_sub(touched_at));
        }

        overlay.push(DrawOp::Label {
            origin: Point::new(bbox.x1, bbox.y2 + 8),
            text: format!(
                "HOLD {:.1}/{:.1}s",
                held.as_secs_f64(),
                self.hold.as_secs_f64()
            ),
            color: palette::TEXT,
        });

        if held < self.hold {
            let progress = hold_fraction(held, self.hold);
            return EvaluatorResult::new(self.phase.as_str(), false, progress)
                .with_overlay(overlay)
                .with_metrics(&self.metrics(ear));
        }

        let spread = self.stability.std_dev();
        let threshold = self.stability_threshold(ear);
        let metrics = self.metrics(ear);
        if spread <= threshold {
            return EvaluatorResult::new("held", true, 1.0)
                .with_overlay(overlay)
                .with_metrics(&metrics);
        }

        debug!(
            "grab_hold: unstable hold (spread {:.1}px > {:.1}px), restarting",
            spread, threshold
        );
        self.release_grip();
        EvaluatorResult::new("touched", false, 0.0)
            .with_overlay(overlay)
            .with_metrics(&metrics)
    }
}
