//! Shared coach state and the operations the control surface exposes.
//!
//! `CoachState` lives behind an `Arc` shared by the orchestration loop and the
//! API threads. The active evaluator is only ever swapped while holding the
//! `ActiveTaskState` lock, which the loop also holds while it evaluates, so a
//! cycle never observes a half-swapped task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use log::{info, warn};

use crate::broadcast::Broadcaster;
use crate::error::ControlError;
use crate::evaluator::{Evaluator, TaskParams};
use crate::frame::FrameSlot;
use crate::registry::TaskRegistry;
use crate::session::{SessionConfig, SessionUpdate};

/// The live task, its evaluator, and pass/sticky bookkeeping.
#[derive(Default)]
pub struct ActiveTaskState {
    task: Option<String>,
    evaluator: Option<Box<dyn Evaluator>>,
    already_passed: bool,
    sticky_frames_remaining: u32,
    /// Bumped on every selection or clear.
    generation: u64,
}

impl ActiveTaskState {
    pub fn task(&self) -> Option<&str> {
        self.task.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn already_passed(&self) -> bool {
        self.already_passed
    }

    pub fn sticky_frames_remaining(&self) -> u32 {
        self.sticky_frames_remaining
    }

    pub fn evaluator_mut(&mut self) -> Option<&mut (dyn Evaluator + 'static)> {
        self.evaluator.as_deref_mut()
    }

    /// Install `evaluator` as the live task, stopping the previous one first.
    /// A failing `stop` is logged and otherwise ignored.
    pub fn replace(&mut self, task: Option<String>, evaluator: Option<Box<dyn Evaluator>>) {
        if let Some(mut old) = self.evaluator.take() {
            if let Err(e) = old.stop() {
                warn!(
                    "stopping task '{}' failed: {:#}",
                    self.task.as_deref().unwrap_or("?"),
                    e
                );
            }
        }
        self.task = task;
        self.evaluator = evaluator;
        self.already_passed = false;
        self.sticky_frames_remaining = 0;
        self.generation += 1;
    }

    /// Feed this cycle's `passed` flag. Returns true if the payload for this
    /// cycle must carry the `task_passed` event.
    ///
    /// The first pass after selection arms `sticky_frames`; that frame and the
    /// next `sticky_frames` frames carry the event. Later passes never re-arm it.
    pub fn observe_pass(&mut self, passed: bool, sticky_frames: u32) -> bool {
        if passed && !self.already_passed {
            self.already_passed = true;
            self.sticky_frames_remaining = sticky_frames;
            return true;
        }
        if self.sticky_frames_remaining > 0 {
            self.sticky_frames_remaining -= 1;
            return true;
        }
        false
    }
}

/// Everything the loop and the control surface share.
pub struct CoachState {
    registry: TaskRegistry,
    session: RwLock<SessionConfig>,
    debug_overlay: AtomicBool,
    active: Mutex<ActiveTaskState>,
    frames: FrameSlot,
    broadcaster: Broadcaster,
}

impl CoachState {
    pub fn new(registry: TaskRegistry, session: SessionConfig) -> Self {
        Self {
            registry,
            session: RwLock::new(session),
            debug_overlay: AtomicBool::new(false),
            active: Mutex::new(ActiveTaskState::default()),
            frames: FrameSlot::new(),
            broadcaster: Broadcaster::new(),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn frames(&self) -> &FrameSlot {
        &self.frames
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub(crate) fn lock_active(&self) -> Result<MutexGuard<'_, ActiveTaskState>, ControlError> {
        self.active.lock().map_err(|_| ControlError::StatePoisoned)
    }

    /// Make `name` the active task. An empty name or `none` clears it.
    ///
    /// Unknown names and invalid params are rejected before anything is
    /// stopped, so the previous task keeps running. If the new evaluator
    /// fails to start, no task is active afterwards. Returns the canonical id.
    pub fn select_task(&self, name: &str, params: &TaskParams) -> Result<Option<String>, ControlError> {
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            self.clear_task()?;
            return Ok(None);
        }

        let entry = self.registry.resolve(trimmed)?;
        params.validate()?;
        let id = entry.id.clone();
        let mut evaluator = entry.build();
        let session = self.session();

        let mut active = self.lock_active()?;
        // Stop the old evaluator before the new one starts.
        active.replace(None, None);
        evaluator
            .start(params, &session)
            .map_err(|e| ControlError::StartFailed {
                task: id.clone(),
                reason: format!("{:#}", e),
            })?;
        active.replace(Some(id.clone()), Some(evaluator));
        info!("active task -> {}", id);
        Ok(Some(id))
    }

    pub fn clear_task(&self) -> Result<(), ControlError> {
        let mut active = self.lock_active()?;
        if let Some(task) = active.task() {
            info!("active task cleared (was {})", task);
        }
        active.replace(None, None);
        Ok(())
    }

    pub fn active_task(&self) -> Result<Option<String>, ControlError> {
        Ok(self.lock_active()?.task().map(str::to_string))
    }

    /// Recalibrate the active evaluator from its latest measurement.
    ///
    /// Fails when no task is active, or the task has no calibration or has not
    /// measured anything since it started.
    pub fn calibrate(&self) -> Result<(String, f64), ControlError> {
        let mut active = self.lock_active()?;
        let task = active.task().map(str::to_string).ok_or(ControlError::NoActiveTask)?;
        let value = active
            .evaluator_mut()
            .and_then(|evaluator| evaluator.calibrate())
            .ok_or_else(|| ControlError::CalibrationUnavailable(task.clone()))?;
        info!("{} calibrated to {:.3}", task, value);
        Ok((task, value))
    }

    /// Snapshot of the session config. A poisoned lock still yields the last value.
    pub fn session(&self) -> SessionConfig {
        *self.session.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn update_session(&self, update: &SessionUpdate) -> Result<SessionConfig, ControlError> {
        let mut session = self
            .session
            .write()
            .map_err(|_| ControlError::StatePoisoned)?;
        session.apply(update)?;
        info!(
            "session -> dominant={} target_mode={}",
            session.dominant_hand.as_str(),
            session.target_mode.as_str()
        );
        Ok(*session)
    }

    pub fn debug_overlay(&self) -> bool {
        self.debug_overlay.load(Ordering::Relaxed)
    }

    pub fn set_debug_overlay(&self, enabled: bool) -> bool {
        self.debug_overlay.store(enabled, Ordering::Relaxed);
        enabled
    }
}
