//! Perception backends and the fault-isolating facade the loop calls.
//!
//! Backends return `anyhow::Result`. [`Perception`] is the only place those
//! errors are handled: a failed or panicking call becomes "nothing seen this
//! frame" and is logged with rate limiting, so evaluators only ever deal with
//! absence.

mod backend;
pub mod backends;
mod registry;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{info, warn};

pub use backend::{Capability, PerceptionBackend};
pub use backends::{Script, ScriptedBackend, ScriptedSignals, StubBackend};
pub use registry::{BackendRegistry, SharedBackend};

use crate::frame::Frame;
use crate::session::SessionConfig;
use crate::signals::FrameSignals;

/// Failures are logged on the first occurrence and then every this many.
const FAILURE_LOG_EVERY: u64 = 100;

pub struct Perception {
    registry: BackendRegistry,
    warmed: HashSet<String>,
    failures: HashMap<Capability, u64>,
}

impl Perception {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            warmed: HashSet::new(),
            failures: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Warm up every backend serving `caps` that has not been warmed yet.
    pub fn prepare(&mut self, caps: &[Capability]) {
        for &cap in caps {
            let Ok((name, backend)) = self.registry.backend_for_capability(cap) else {
                continue;
            };
            if !self.warmed.insert(name.clone()) {
                continue;
            }
            let outcome = backend
                .lock()
                .map_err(|_| anyhow!("backend '{}' lock poisoned", name))
                .and_then(|mut guard| contain(name.as_str(), || guard.warm_up()));
            match outcome {
                Ok(()) => info!("perception backend '{}' ready for {}", name, cap.as_str()),
                Err(e) => warn!("perception backend '{}' warm-up failed: {:#}", name, e),
            }
        }
    }

    /// Run the backends for `caps` on `frame`. Capabilities not listed, and
    /// any that fail, come back empty.
    pub fn sense(
        &mut self,
        frame: &Frame,
        caps: &[Capability],
        timestamp: Duration,
        session: SessionConfig,
    ) -> FrameSignals {
        let mut signals = FrameSignals::empty(timestamp, frame.width, frame.height);
        signals.session = session;
        if caps.contains(&Capability::ObjectDetection) {
            signals.detection = self.run(Capability::ObjectDetection, frame, |b, f| b.detect(f));
        }
        if caps.contains(&Capability::HandLandmarks) {
            signals.hands = self.run(Capability::HandLandmarks, frame, |b, f| {
                b.landmarks_hands(f)
            });
        }
        if caps.contains(&Capability::FacePose) {
            signals.head = self.run(Capability::FacePose, frame, |b, f| {
                b.landmarks_face_pose(f)
            });
        }
        signals
    }

    /// Total failures seen for a capability.
    pub fn failure_count(&self, cap: Capability) -> u64 {
        self.failures.get(&cap).copied().unwrap_or(0)
    }

    fn run<T, F>(&mut self, cap: Capability, frame: &Frame, call: F) -> T
    where
        T: Default,
        F: FnOnce(&mut dyn PerceptionBackend, &Frame) -> Result<T>,
    {
        let outcome = self
            .registry
            .backend_for_capability(cap)
            .and_then(|(name, backend)| {
                let mut guard = backend
                    .lock()
                    .map_err(|_| anyhow!("backend '{}' lock poisoned", name))?;
                contain(name.as_str(), || call(&mut *guard, frame))
            });
        match outcome {
            Ok(value) => value,
            Err(e) => {
                let count = self.failures.entry(cap).or_insert(0);
                *count += 1;
                if *count == 1 || *count % FAILURE_LOG_EVERY == 0 {
                    warn!(
                        "{} failed (x{}), treating as not detected: {:#}",
                        cap.as_str(),
                        count,
                        e
                    );
                }
                T::default()
            }
        }
    }
}

/// Run a backend call, turning a panic into an error. The call runs while the
/// backend lock is held, so the lock is released normally and never poisoned.
fn contain<T>(name: &str, call: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(anyhow!(
            "backend '{}' panicked: {}",
            name,
            panic_message(&*payload)
        ))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::signals::Detection;

    /// Panics while warming up and on its first two detections.
    struct Crashing {
        calls: u32,
    }

    impl PerceptionBackend for Crashing {
        fn name(&self) -> &'static str {
            "crashing"
        }

        fn supports(&self, capability: Capability) -> bool {
            capability == Capability::ObjectDetection
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Option<Detection>> {
            self.calls += 1;
            if self.calls < 3 {
                panic!("index out of bounds in decoder");
            }
            Ok(Detection::clamped(BBox::new(1, 1, 10, 10), 0.7, 64, 48))
        }

        fn warm_up(&mut self) -> Result<()> {
            panic!("model file truncated");
        }
    }

    #[test]
    fn panicking_backend_reads_as_absence_and_recovers() {
        let mut reg = BackendRegistry::new();
        reg.register(Crashing { calls: 0 });
        let mut perception = Perception::new(reg);
        perception.prepare(&[Capability::ObjectDetection]);

        for seq in 0..2 {
            let sig = perception.sense(
                &frame(seq),
                &[Capability::ObjectDetection],
                Duration::ZERO,
                SessionConfig::default(),
            );
            assert!(sig.detection.is_none());
        }
        assert_eq!(perception.failure_count(Capability::ObjectDetection), 2);

        // The lock was not poisoned, so the backend keeps serving.
        let sig = perception.sense(
            &frame(2),
            &[Capability::ObjectDetection],
            Duration::ZERO,
            SessionConfig::default(),
        );
        assert!(sig.detection.is_some());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let err = contain::<()>("x", || panic!("boom {}", 7)).unwrap_err();
        assert!(err.to_string().contains("boom 7"));
        let err = contain::<()>("x", || std::panic::panic_any(42u8)).unwrap_err();
        assert!(err.to_string().contains("unknown panic"));
    }

    fn frame(seq: u64) -> Frame {
        Frame::from_rgb(vec![0; 64 * 48 * 3], 64, 48, seq).unwrap()
    }

    #[test]
    fn failures_become_absence() {
        let (backend, script) = ScriptedBackend::new();
        let mut reg = BackendRegistry::new();
        reg.register(backend);
        let mut perception = Perception::new(reg);

        script.push(ScriptedSignals::failure());
        let sig = perception.sense(
            &frame(0),
            &Capability::ALL,
            Duration::ZERO,
            SessionConfig::default(),
        );
        assert!(sig.detection.is_none());
        assert!(sig.hands.is_empty());
        assert_eq!(perception.failure_count(Capability::ObjectDetection), 1);
        assert_eq!(perception.failure_count(Capability::FacePose), 1);
    }

    #[test]
    fn only_requested_capabilities_run() {
        let (backend, script) = ScriptedBackend::new();
        let mut reg = BackendRegistry::new();
        reg.register(backend);
        let mut perception = Perception::new(reg);

        script.push(ScriptedSignals {
            detection: Detection::clamped(BBox::new(5, 5, 20, 20), 0.9, 64, 48),
            head: crate::signals::HeadMetrics {
                mouth_center: None,
                ear_distance: Some(30.0),
            },
            ..ScriptedSignals::default()
        });
        let sig = perception.sense(
            &frame(0),
            &[Capability::ObjectDetection],
            Duration::from_millis(50),
            SessionConfig::default(),
        );
        assert!(sig.detection.is_some());
        assert_eq!(sig.head.ear_distance, None);
        assert_eq!(sig.frame_width, 64);
    }

    #[test]
    fn missing_backend_is_absence_not_panic() {
        let mut perception = Perception::new(BackendRegistry::new());
        perception.prepare(&Capability::ALL);
        let sig = perception.sense(
            &frame(0),
            &Capability::ALL,
            Duration::ZERO,
            SessionConfig::default(),
        );
        assert!(sig.detection.is_none());
        assert_eq!(perception.failure_count(Capability::HandLandmarks), 1);
    }
}
