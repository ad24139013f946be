//! `reach`: bring the index fingertip to the target object.

use anyhow::Result;

use super::{palette, select_hand, DrawOp, Evaluator, EvaluatorResult, HandPolicy, TaskParams};
use crate::geometry::distance;
use crate::perception::Capability;
use crate::session::{SessionConfig, TargetMode};
use crate::signals::{FrameSignals, INDEX_TIP};

/// Tolerance never drops below this, whatever the head scale.
pub const MIN_TOLERANCE_PX: f64 = 20.0;
/// Tolerance as a fraction of the head-width proxy.
pub const TOLERANCE_HEAD_RATIO: f64 = 0.6;
/// Head-width proxy used in `fixed` target mode or when no ear distance is seen.
pub const FIXED_HEAD_PROXY_PX: f64 = 100.0;

const REQUIREMENTS: &[Capability] = &[
    Capability::ObjectDetection,
    Capability::HandLandmarks,
    Capability::FacePose,
];

/// Pass radius around the target center for the given mode and head scale.
pub fn reach_tolerance(mode: TargetMode, ear_distance: Option<f64>) -> f64 {
    let proxy = match (mode, ear_distance) {
        (TargetMode::Head, Some(ear)) => ear,
        _ => FIXED_HEAD_PROXY_PX,
    };
    (TOLERANCE_HEAD_RATIO * proxy).max(MIN_TOLERANCE_PX)
}

#[derive(Debug, Default)]
pub struct ReachEvaluator {
    policy: HandPolicy,
}

impl ReachEvaluator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Evaluator for ReachEvaluator {
    fn task_id(&self) -> &'static str {
        "reach"
    }

    fn requirements(&self) -> &'static [Capability] {
        REQUIREMENTS
    }

    fn start(&mut self, params: &TaskParams, _session: &SessionConfig) -> Result<()> {
        self.policy = params.hand.unwrap_or_default();
        Ok(())
    }

    fn update(&mut self, signals: &FrameSignals) -> EvaluatorResult {
        let Some(det) = signals.detection else {
            return EvaluatorResult::idle("idle");
        };
        let target = det.center();
        let tolerance = reach_tolerance(signals.session.target_mode, signals.head.scale());

        let mut overlay = vec![
            DrawOp::Rect {
                bbox: det.bbox(),
                color: palette::TARGET,
                thickness: 2,
            },
            DrawOp::Circle {
                center: target,
                radius: tolerance.round() as u32,
                color: palette::TARGET,
                filled: false,
            },
        ];

        let hand = select_hand(
            &signals.hands,
            target,
            self.policy,
            signals.session.dominant_hand,
            |m| m.get(INDEX_TIP),
        );
        let Some(hand) = hand else {
            return EvaluatorResult::new("reaching", false, 0.0).with_overlay(overlay);
        };

        let dist = distance(hand.point, target);
        let passed = dist <= tolerance;
        let progress = if passed {
            1.0
        } else {
            1.0 - dist / (2.0 * tolerance)
        };
        overlay.push(DrawOp::Line {
            from: hand.point,
            to: target,
            color: if passed { palette::OK } else { palette::HAND },
            thickness: 2,
        });
        overlay.push(DrawOp::Circle {
            center: hand.point,
            radius: 6,
            color: palette::HAND,
            filled: true,
        });

        let state = if passed { "reached" } else { "reaching" };
        EvaluatorResult::new(state, passed, progress).with_overlay(overlay)
    }
}
