//! Errors reported synchronously to control-surface callers.
//!
//! Everything else in the crate propagates `anyhow::Error`; these are the
//! failures a caller is expected to act on, so they stay structured.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("invalid task params: {0}")]
    InvalidParams(String),

    #[error("task '{task}' failed to start: {reason}")]
    StartFailed { task: String, reason: String },

    #[error("invalid session config: {0}")]
    InvalidSession(String),

    #[error("no task is active")]
    NoActiveTask,

    #[error("task '{0}' has nothing to calibrate yet")]
    CalibrationUnavailable(String),

    #[error("coach state lock poisoned")]
    StatePoisoned,
}

impl ControlError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::UnknownTask(_) => "unknown_task",
            ControlError::InvalidParams(_) => "invalid_params",
            ControlError::StartFailed { .. } => "start_failed",
            ControlError::InvalidSession(_) => "invalid_session",
            ControlError::NoActiveTask => "no_active_task",
            ControlError::CalibrationUnavailable(_) => "calibration_unavailable",
            ControlError::StatePoisoned => "internal",
        }
    }

    /// True for errors caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            ControlError::StatePoisoned | ControlError::StartFailed { .. }
        )
    }
}
