use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::frame::Frame;
use crate::perception::backend::{Capability, PerceptionBackend};
use crate::signals::{Detection, HandLandmarks, HeadMetrics};

/// Canned perception output for one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScriptedSignals {
    pub detection: Option<Detection>,
    pub hands: HandLandmarks,
    pub head: HeadMetrics,
    /// Make every call for this frame fail.
    pub fail: bool,
}

impl ScriptedSignals {
    pub fn failure() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

/// Shared handle for feeding a [`ScriptedBackend`] after it has been registered.
#[derive(Clone, Debug, Default)]
pub struct Script {
    queue: Arc<Mutex<VecDeque<ScriptedSignals>>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, signals: ScriptedSignals) {
        self.lock().push_back(signals);
    }

    pub fn extend<I: IntoIterator<Item = ScriptedSignals>>(&self, items: I) {
        self.lock().extend(items);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn pop(&self) -> Option<ScriptedSignals> {
        self.lock().pop_front()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ScriptedSignals>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Replays queued signals, one entry per frame sequence number.
///
/// When the queue runs dry the last entry repeats, so a pose can be held
/// without queueing every frame.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Script,
    current: ScriptedSignals,
    current_seq: Option<u64>,
}

impl ScriptedBackend {
    pub fn new() -> (Self, Script) {
        let script = Script::new();
        let backend = Self {
            script: script.clone(),
            current: ScriptedSignals::default(),
            current_seq: None,
        };
        (backend, script)
    }

    fn advance(&mut self, frame: &Frame) -> Result<&ScriptedSignals> {
        if self.current_seq != Some(frame.sequence) {
            self.current_seq = Some(frame.sequence);
            if let Some(next) = self.script.pop() {
                self.current = next;
            }
        }
        if self.current.fail {
            return Err(anyhow!("scripted failure at frame {}", frame.sequence));
        }
        Ok(&self.current)
    }
}

impl PerceptionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, _capability: Capability) -> bool {
        true
    }

    fn detect(&mut self, frame: &Frame) -> Result<Option<Detection>> {
        Ok(self.advance(frame)?.detection)
    }

    fn landmarks_hands(&mut self, frame: &Frame) -> Result<HandLandmarks> {
        Ok(self.advance(frame)?.hands.clone())
    }

    fn landmarks_face_pose(&mut self, frame: &Frame) -> Result<HeadMetrics> {
        Ok(self.advance(frame)?.head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;

    fn frame(seq: u64) -> Frame {
        Frame::from_rgb(vec![0; 12], 2, 2, seq).unwrap()
    }

    #[test]
    fn one_entry_per_frame_then_repeat_last() {
        let (mut backend, script) = ScriptedBackend::new();
        let det = Detection::clamped(BBox::new(0, 0, 1, 1), 0.8, 2, 2);
        script.push(ScriptedSignals::default());
        script.push(ScriptedSignals {
            detection: det,
            ..ScriptedSignals::default()
        });

        assert_eq!(backend.detect(&frame(0)).unwrap(), None);
        assert_eq!(backend.detect(&frame(0)).unwrap(), None);
        assert_eq!(backend.detect(&frame(1)).unwrap(), det);
        assert_eq!(backend.detect(&frame(2)).unwrap(), det);
        assert_eq!(script.pending(), 0);
    }

    #[test]
    fn failure_entries_error_every_call() {
        let (mut backend, script) = ScriptedBackend::new();
        script.push(ScriptedSignals::failure());
        assert!(backend.detect(&frame(0)).is_err());
        assert!(backend.landmarks_hands(&frame(0)).is_err());
    }
}
