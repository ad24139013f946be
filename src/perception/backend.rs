use anyhow::Result;

use crate::frame::Frame;
use crate::signals::{Detection, HandLandmarks, HeadMetrics};

/// What a perception backend can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Target-object bounding box.
    ObjectDetection,
    /// 21-point hand skeletons.
    HandLandmarks,
    /// Mouth center and ear distance.
    FacePose,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::ObjectDetection,
        Capability::HandLandmarks,
        Capability::FacePose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ObjectDetection => "object_detection",
            Capability::HandLandmarks => "hand_landmarks",
            Capability::FacePose => "face_pose",
        }
    }
}

/// Perception backend trait.
///
/// Backends are black boxes returning typed geometry in frame pixel
/// coordinates. `Ok` with an empty value means nothing was found; `Err` is a
/// backend failure and is turned into absence by [`super::Perception`].
///
/// Only the methods for capabilities a backend `supports` are ever called.
pub trait PerceptionBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: Capability) -> bool;

    /// Highest-scoring target-class detection, if any.
    fn detect(&mut self, _frame: &Frame) -> Result<Option<Detection>> {
        Ok(None)
    }

    fn landmarks_hands(&mut self, _frame: &Frame) -> Result<HandLandmarks> {
        Ok(HandLandmarks::default())
    }

    fn landmarks_face_pose(&mut self, _frame: &Frame) -> Result<HeadMetrics> {
        Ok(HeadMetrics::default())
    }

    /// Optional warm-up hook. Called once, the first time a task needs this backend.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
