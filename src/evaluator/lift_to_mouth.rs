//! `lift_to_mouth`: bring the object (or an index fingertip) to the mouth.

use anyhow::Result;
use serde::Serialize;

use super::{palette, DrawOp, Evaluator, EvaluatorResult, MouthReference, TaskParams};
use crate::geometry::{distance, Point};
use crate::perception::Capability;
use crate::session::SessionConfig;
use crate::signals::{FrameSignals, HandSide, INDEX_TIP};

pub const DEFAULT_MOUTH_SCALE: f64 = 0.8;
pub const MIN_MOUTH_SCALE: f64 = 0.10;
pub const MAX_MOUTH_SCALE: f64 = 2.50;

const REQUIREMENTS: &[Capability] = &[
    Capability::ObjectDetection,
    Capability::HandLandmarks,
    Capability::FacePose,
];

/// One frame's mouth-proximity measurement.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MouthCheck {
    pub reference: Option<Point>,
    pub mouth: Option<Point>,
    /// `mouth_scale × ear_distance`.
    pub threshold: Option<f64>,
    pub distance: Option<f64>,
    pub at_mouth: bool,
}

/// Reported with every measurable frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MouthMetrics {
    /// Reference-to-mouth distance in ear-distance units. Calibration adopts this.
    pub distance_ratio: f64,
    pub mouth_scale: f64,
    pub threshold_px: f64,
}

impl MouthCheck {
    /// Whether enough was seen to measure anything.
    pub fn measurable(&self) -> bool {
        self.distance.is_some() && self.threshold.is_some()
    }

    pub fn progress(&self) -> f64 {
        if self.at_mouth {
            return 1.0;
        }
        match (self.distance, self.threshold) {
            (Some(d), Some(t)) if t > 0.0 => (1.0 - d / (2.0 * t)).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }

    pub fn overlay(&self) -> Vec<DrawOp> {
        let mut ops = Vec::new();
        if let (Some(mouth), Some(threshold)) = (self.mouth, self.threshold) {
            ops.push(DrawOp::Circle {
                center: mouth,
                radius: threshold.round() as u32,
                color: palette::MOUTH,
                filled: false,
            });
        }
        if let Some(reference) = self.reference {
            ops.push(DrawOp::Circle {
                center: reference,
                radius: 6,
                color: palette::TARGET,
                filled: true,
            });
        }
        if let (Some(mouth), Some(reference)) = (self.mouth, self.reference) {
            ops.push(DrawOp::Line {
                from: reference,
                to: mouth,
                color: if self.at_mouth {
                    palette::OK
                } else {
                    palette::MOUTH
                },
                thickness: 2,
            });
        }
        ops
    }
}

#[derive(Debug)]
pub struct LiftToMouthEvaluator {
    mouth_scale: f64,
    reference: MouthReference,
    last_ratio: Option<f64>,
}

impl Default for LiftToMouthEvaluator {
    fn default() -> Self {
        Self {
            mouth_scale: DEFAULT_MOUTH_SCALE,
            reference: MouthReference::Auto,
            last_ratio: None,
        }
    }
}

impl LiftToMouthEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mouth_scale(&self) -> f64 {
        self.mouth_scale
    }

    fn reference_point(&self, signals: &FrameSignals) -> Option<Point> {
        let object = || signals.detection.map(|d| d.center());
        let index = |side| signals.hands.side(side).and_then(|m| m.get(INDEX_TIP));
        match self.reference {
            MouthReference::Object => object(),
            MouthReference::RightIndex => index(HandSide::Right),
            MouthReference::LeftIndex => index(HandSide::Left),
            MouthReference::Auto => object()
                .or_else(|| index(HandSide::Right))
                .or_else(|| index(HandSide::Left)),
        }
    }

    /// Measure the at-mouth condition for one frame without touching any state.
    pub fn check(&self, signals: &FrameSignals) -> MouthCheck {
        let reference = self.reference_point(signals);
        let mouth = signals.head.mouth_center;
        let threshold = signals.head.scale().map(|ear| self.mouth_scale * ear);
        let dist = match (reference, mouth) {
            (Some(r), Some(m)) => Some(distance(r, m)),
            _ => None,
        };
        let at_mouth = matches!((dist, threshold), (Some(d), Some(t)) if d <= t);
        MouthCheck {
            reference,
            mouth,
            threshold,
            distance: dist,
            at_mouth,
        }
    }
}

impl Evaluator for LiftToMouthEvaluator {
    fn task_id(&self) -> &'static str {
        "lift_to_mouth"
    }

    fn requirements(&self) -> &'static [Capability] {
        REQUIREMENTS
    }

    fn start(&mut self, params: &TaskParams, _session: &SessionConfig) -> Result<()> {
        self.mouth_scale = params
            .mouth_scale
            .unwrap_or(DEFAULT_MOUTH_SCALE)
            .clamp(MIN_MOUTH_SCALE, MAX_MOUTH_SCALE);
        self.reference = params.reference.unwrap_or_default();
        self.last_ratio = None;
        Ok(())
    }

    fn update(&mut self, signals: &FrameSignals) -> EvaluatorResult {
        let check = self.check(signals);
        let (Some(dist), Some(ear), Some(threshold_px)) =
            (check.distance, signals.head.scale(), check.threshold)
        else {
            return EvaluatorResult::idle("idle").with_overlay(check.overlay());
        };
        let ratio = dist / ear;
        self.last_ratio = Some(ratio);
        let state = if check.at_mouth {
            "at_mouth"
        } else {
            "reaching_mouth"
        };
        let metrics = MouthMetrics {
            distance_ratio: ratio,
            mouth_scale: self.mouth_scale,
            threshold_px,
        };
        EvaluatorResult::new(state, check.at_mouth, check.progress())
            .with_overlay(check.overlay())
            .with_metrics(&metrics)
    }

    /// Adopt the last measured reference-to-mouth ratio as `mouth_scale`.
    fn calibrate(&mut self) -> Option<f64> {
        let ratio = self.last_ratio?;
        self.mouth_scale = ratio.clamp(MIN_MOUTH_SCALE, MAX_MOUTH_SCALE);
        log::info!("lift_to_mouth calibrated: mouth_scale = {:.3}", self.mouth_scale);
        Some(self.mouth_scale)
    }
}
