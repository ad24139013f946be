//! Per-task pass/fail evaluators.
//!
//! Each exercise step is a small state machine implementing [`Evaluator`]. The
//! orchestration loop owns at most one live evaluator at a time and feeds it
//! one [`FrameSignals`] per cycle.
//!
//! Evaluators MUST:
//! - Derive elapsed time only from `FrameSignals::timestamp`
//! - Return `passed = false, progress = 0` when the signals they need are absent
//! - Never panic on missing landmarks or detections
//!
//! Hold-style evaluators share [`ContinuityTimer`]: the moment the defining
//! condition reads false the accumulated hold is discarded, not paused.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ControlError;
use crate::geometry::{distance, BBox, Point};
use crate::perception::Capability;
use crate::session::SessionConfig;
use crate::signals::{FrameSignals, HandLandmarks, HandSide, LandmarkMap};

mod dump_into_mouth;
mod grab_hold;
mod hold_at_mouth;
mod lift_to_mouth;
mod place_cup_down;
mod reach;

pub use dump_into_mouth::DumpIntoMouthEvaluator;
pub use grab_hold::{grasp_detect, GrabHoldEvaluator};
pub use hold_at_mouth::HoldAtMouthEvaluator;
pub use lift_to_mouth::{LiftToMouthEvaluator, MouthCheck, DEFAULT_MOUTH_SCALE};
pub use place_cup_down::PlaceCupDownEvaluator;
pub use reach::{reach_tolerance, ReachEvaluator};

/// RGB colour for overlay primitives.
pub type Rgb = [u8; 3];

pub mod palette {
    use super::Rgb;

    pub const TARGET: Rgb = [255, 180, 0];
    pub const HAND: Rgb = [80, 210, 0];
    pub const OK: Rgb = [0, 230, 0];
    pub const WARN: Rgb = [255, 200, 0];
    pub const MOUTH: Rgb = [255, 120, 200];
    pub const TEXT: Rgb = [220, 255, 220];
}

/// One overlay draw instruction, in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DrawOp {
    Rect {
        bbox: BBox,
        color: Rgb,
        thickness: u32,
    },
    Circle {
        center: Point,
        radius: u32,
        color: Rgb,
        filled: bool,
    },
    Line {
        from: Point,
        to: Point,
        color: Rgb,
        thickness: u32,
    },
    Label {
        origin: Point,
        text: String,
        color: Rgb,
    },
}

/// Output of one `update` call.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluatorResult {
    pub passed: bool,
    /// 0 = no progress, 1 = threshold met. Not monotonic across frames.
    pub progress: f64,
    pub overlay: Vec<DrawOp>,
    /// Name of the evaluator's current state.
    pub state: &'static str,
    /// Movement-quality measurements persisted with the progress sample.
    /// They describe how the movement went and never decide `passed`.
    pub metrics: Option<Value>,
}

impl EvaluatorResult {
    /// Nothing to report: not passed, zero progress.
    pub fn idle(state: &'static str) -> Self {
        Self {
            passed: false,
            progress: 0.0,
            overlay: Vec::new(),
            state,
            metrics: None,
        }
    }

    pub fn new(state: &'static str, passed: bool, progress: f64) -> Self {
        let progress = if progress.is_finite() {
            progress.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            passed,
            progress,
            overlay: Vec::new(),
            state,
            metrics: None,
        }
    }

    pub fn with_overlay(mut self, overlay: Vec<DrawOp>) -> Self {
        self.overlay = overlay;
        self
    }

    /// Attach movement metrics. A value that fails to serialize is dropped.
    pub fn with_metrics<M: Serialize>(mut self, metrics: &M) -> Self {
        self.metrics = serde_json::to_value(metrics).ok();
        self
    }
}

/// How an evaluator chooses between two visible hands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandPolicy {
    /// Whichever hand's measured point is closest to the reference; ties go left.
    #[default]
    Nearest,
    /// Only the session's dominant hand.
    Dominant,
}

/// Full-grip condition for `grab_hold`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GripMode {
    /// At least `fingers_required` fingertips inside the grip radius.
    #[default]
    Fingers,
    /// Thumb/index pinch inside the expanded target box.
    Pinch,
}

/// Reference point compared against the mouth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouthReference {
    /// Object center, then right index tip, then left index tip.
    #[default]
    Auto,
    Object,
    RightIndex,
    LeftIndex,
}

/// Caller-supplied per-task parameters. Every field is optional; evaluators
/// ignore fields that do not apply to them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskParams {
    /// Required hold duration in seconds.
    pub seconds: Option<f64>,
    pub mouth_scale: Option<f64>,
    pub reference: Option<MouthReference>,
    pub hand: Option<HandPolicy>,
    pub grip: Option<GripMode>,
    pub fingers_required: Option<usize>,
    /// Absolute stability threshold override for `grab_hold`.
    pub stability_px: Option<f64>,
}

impl TaskParams {
    pub fn validate(&self) -> Result<(), ControlError> {
        if let Some(secs) = self.seconds {
            if !secs.is_finite() || secs <= 0.0 || secs > 600.0 {
                return Err(ControlError::InvalidParams(format!(
                    "seconds must be in (0, 600], got {secs}"
                )));
            }
        }
        if let Some(scale) = self.mouth_scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(ControlError::InvalidParams(format!(
                    "mouth_scale must be positive, got {scale}"
                )));
            }
        }
        if let Some(n) = self.fingers_required {
            if !(1..=5).contains(&n) {
                return Err(ControlError::InvalidParams(format!(
                    "fingers_required must be 1..=5, got {n}"
                )));
            }
        }
        if let Some(px) = self.stability_px {
            if !px.is_finite() || px <= 0.0 {
                return Err(ControlError::InvalidParams(format!(
                    "stability_px must be positive, got {px}"
                )));
            }
        }
        Ok(())
    }

    /// `seconds` as a duration, or `default`.
    pub fn hold_or(&self, default: Duration) -> Duration {
        self.seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(default)
    }
}

/// A per-exercise pass/fail state machine.
pub trait Evaluator: Send {
    /// Canonical task identifier.
    fn task_id(&self) -> &'static str;

    /// Perception capabilities this evaluator reads. The loop only runs (and
    /// lazily warms up) the backends named here.
    fn requirements(&self) -> &'static [Capability];

    /// Reset timers and accumulators and apply `params`. `session` is the
    /// configuration in force at selection time; per-frame reads should use
    /// `FrameSignals::session` instead.
    fn start(&mut self, params: &TaskParams, session: &SessionConfig) -> Result<()>;

    /// Advance the state machine by one frame.
    fn update(&mut self, signals: &FrameSignals) -> EvaluatorResult;

    /// Release evaluator-owned resources.
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Adopt the most recent measurement as the new pass threshold and return
    /// it. `None` when this task has nothing to calibrate or nothing has been
    /// measured yet.
    fn calibrate(&mut self) -> Option<f64> {
        None
    }
}

/// Hold-duration accumulator that resets the instant its condition is false.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContinuityTimer {
    since: Option<Duration>,
}

impl ContinuityTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame. Returns how long the condition has held continuously,
    /// or zero if it is false now.
    pub fn observe(&mut self, condition: bool, now: Duration) -> Duration {
        if !condition {
            self.since = None;
            return Duration::ZERO;
        }
        let since = *self.since.get_or_insert(now);
        now.saturating_sub(since)
    }

    pub fn reset(&mut self) {
        self.since = None;
    }

    pub fn is_running(&self) -> bool {
        self.since.is_some()
    }
}

/// Fraction of `required` covered by `held`, in `[0, 1]`.
pub fn hold_fraction(held: Duration, required: Duration) -> f64 {
    if required.is_zero() {
        return 1.0;
    }
    (held.as_secs_f64() / required.as_secs_f64()).clamp(0.0, 1.0)
}

/// Streaming positional spread (Welford), O(1) memory.
///
/// `std_dev` is the sample RMS distance of the pushed points from their mean.
#[derive(Clone, Copy, Debug, Default)]
pub struct StabilityAccumulator {
    count: u64,
    mean_x: f64,
    mean_y: f64,
    m2: f64,
}

impl StabilityAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, p: Point) {
        self.count += 1;
        let n = self.count as f64;
        let (x, y) = (f64::from(p.x), f64::from(p.y));
        let dx = x - self.mean_x;
        let dy = y - self.mean_y;
        self.mean_x += dx / n;
        self.mean_y += dy / n;
        self.m2 += dx * (x - self.mean_x) + dy * (y - self.mean_y);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).max(0.0).sqrt()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A hand picked by [`select_hand`], with the point that was measured.
#[derive(Clone, Copy, Debug)]
pub struct SelectedHand<'a> {
    pub side: HandSide,
    pub landmarks: &'a LandmarkMap,
    pub point: Point,
    pub distance: f64,
}

/// Choose a hand for an evaluator.
///
/// `point_of` extracts the point measured against `reference` (e.g. the index tip,
/// or the fingertip nearest the target). Hands missing that point are not
/// usable. Under [`HandPolicy::Nearest`] the strictly closer hand wins and
/// ties keep the first in iteration order, which is left before right.
pub fn select_hand<'a, F>(
    hands: &'a HandLandmarks,
    reference: Point,
    policy: HandPolicy,
    dominant: HandSide,
    point_of: F,
) -> Option<SelectedHand<'a>>
where
    F: Fn(&LandmarkMap) -> Option<Point>,
{
    let candidates = hands.visible().filter_map(|(side, landmarks)| {
        if policy == HandPolicy::Dominant && side != dominant {
            return None;
        }
        let pt = point_of(landmarks)?;
        Some(SelectedHand {
            side,
            landmarks,
            point: pt,
            distance: distance(pt, reference),
        })
    });

    let mut best: Option<SelectedHand<'a>> = None;
    for cand in candidates {
        match &best {
            Some(current) if cand.distance >= current.distance => {}
            _ => best = Some(cand),
        }
    }
    best
}

/// The visible fingertip nearest `reference`.
pub fn nearest_fingertip(landmarks: &LandmarkMap, reference: Point) -> Option<Point> {
    landmarks.fingertips().min_by(|a, b| {
        distance(*a, reference)
            .partial_cmp(&distance(*b, reference))
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use crate::geometry::{BBox, Point};
    use crate::signals::{Detection, FrameSignals, HeadMetrics, LandmarkMap};

    pub const FRAME_W: u32 = 1280;
    pub const FRAME_H: u32 = 720;
    pub const STEP_MS: u64 = 50;

    pub fn at_ms(ms: u64) -> FrameSignals {
        FrameSignals::empty(Duration::from_millis(ms), FRAME_W, FRAME_H)
    }

    pub fn frame(i: u64) -> FrameSignals {
        at_ms(i * STEP_MS)
    }

    pub fn det(x1: i32, y1: i32, x2: i32, y2: i32) -> Detection {
        Detection::clamped(BBox::new(x1, y1, x2, y2), 0.9, FRAME_W, FRAME_H).unwrap()
    }

    pub fn hand(points: &[(usize, (i32, i32))]) -> LandmarkMap {
        LandmarkMap::from_points(points.iter().map(|&(i, p)| (i, Point::from(p))))
    }

    pub fn head(mouth: (i32, i32), ear: f64) -> HeadMetrics {
        HeadMetrics {
            mouth_center: Some(Point::from(mouth)),
            ear_distance: Some(ear),
        }
    }
}
