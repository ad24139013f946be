//! `hold_at_mouth`: keep the lift-to-mouth condition for a continuous window.

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use super::{
    hold_fraction, palette, ContinuityTimer, DrawOp, Evaluator, EvaluatorResult,
    LiftToMouthEvaluator, TaskParams,
};
use crate::geometry::Point;
use crate::perception::Capability;
use crate::session::SessionConfig;
use crate::signals::FrameSignals;

pub const DEFAULT_HOLD: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct HoldAtMouthEvaluator {
    lift: LiftToMouthEvaluator,
    hold: Duration,
    timer: ContinuityTimer,
    was_at_mouth: bool,
    retries: u32,
}

/// Hold progress plus the lift measurement for the same frame.
#[derive(Debug, Serialize)]
struct HoldMetrics {
    /// Times the object left the mouth zone after reaching it.
    retries: u32,
    held_s: f64,
    #[serde(flatten)]
    mouth: Option<Value>,
}

impl Default for HoldAtMouthEvaluator {
    fn default() -> Self {
        Self {
            lift: LiftToMouthEvaluator::new(),
            hold: DEFAULT_HOLD,
            timer: ContinuityTimer::new(),
            was_at_mouth: false,
            retries: 0,
        }
    }
}

impl HoldAtMouthEvaluator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Evaluator for HoldAtMouthEvaluator {
    fn task_id(&self) -> &'static str {
        "hold_at_mouth"
    }

    fn requirements(&self) -> &'static [Capability] {
        self.lift.requirements()
    }

    fn start(&mut self, params: &TaskParams, session: &SessionConfig) -> Result<()> {
        self.lift.start(params, session)?;
        self.hold = params.hold_or(DEFAULT_HOLD);
        self.timer.reset();
        self.was_at_mouth = false;
        self.retries = 0;
        Ok(())
    }

    fn update(&mut self, signals: &FrameSignals) -> EvaluatorResult {
        let inner = self.lift.update(signals);
        let held = self.timer.observe(inner.passed, signals.timestamp);
        if self.was_at_mouth && !inner.passed {
            self.retries += 1;
        }
        self.was_at_mouth = inner.passed;
        let metrics = HoldMetrics {
            retries: self.retries,
            held_s: held.as_secs_f64(),
            mouth: inner.metrics,
        };
        if !inner.passed {
            let state = if inner.state == "idle" {
                "idle"
            } else {
                "reaching_mouth"
            };
            return EvaluatorResult::new(state, false, 0.0)
                .with_overlay(inner.overlay)
                .with_metrics(&metrics);
        }

        let passed = held >= self.hold;
        let mut overlay = inner.overlay;
        overlay.push(DrawOp::Label {
            origin: Point::new(16, 48),
            text: format!("HOLD {:.1}s", held.as_secs_f64()),
            color: palette::TEXT,
        });
        let state = if passed { "held" } else { "at_mouth" };
        EvaluatorResult::new(state, passed, hold_fraction(held, self.hold))
            .with_overlay(overlay)
            .with_metrics(&metrics)
    }

    fn stop(&mut self) -> Result<()> {
        self.timer.reset();
        self.lift.stop()
    }

    fn calibrate(&mut self) -> Option<f64> {
        self.lift.calibrate()
    }
}
