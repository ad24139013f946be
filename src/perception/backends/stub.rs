use anyhow::Result;

use crate::frame::Frame;
use crate::perception::backend::{Capability, PerceptionBackend};
use crate::signals::{Detection, HandLandmarks, HeadMetrics};

/// Backend that supports everything and never sees anything.
///
/// Keeps the pipeline runnable without models; every evaluator stays idle.
#[derive(Debug, Default)]
pub struct StubBackend {
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of inference calls served.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl PerceptionBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, _capability: Capability) -> bool {
        true
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Option<Detection>> {
        self.calls += 1;
        Ok(None)
    }

    fn landmarks_hands(&mut self, _frame: &Frame) -> Result<HandLandmarks> {
        self.calls += 1;
        Ok(HandLandmarks::default())
    }

    fn landmarks_face_pose(&mut self, _frame: &Frame) -> Result<HeadMetrics> {
        self.calls += 1;
        Ok(HeadMetrics::default())
    }
}
