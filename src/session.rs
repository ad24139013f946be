//! Session configuration shared by the loop, the evaluators, and the control surface.

use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::signals::HandSide;

/// How reach targets derive their tolerance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    /// Tolerance from the configured fixed head-width proxy.
    #[default]
    Fixed,
    /// Tolerance scaled by the live ear distance.
    Head,
}

impl TargetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetMode::Fixed => "fixed",
            TargetMode::Head => "head",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(TargetMode::Fixed),
            "head" => Some(TargetMode::Head),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(alias = "dominant")]
    pub dominant_hand: HandSide,
    pub target_mode: TargetMode,
}

/// Partial update accepted by the control surface. Missing fields keep their value.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionUpdate {
    #[serde(default, alias = "dominant")]
    pub dominant_hand: Option<String>,
    #[serde(default)]
    pub target_mode: Option<String>,
}

impl SessionConfig {
    /// Apply a partial update. Unknown values are rejected and leave `self` unchanged.
    pub fn apply(&mut self, update: &SessionUpdate) -> Result<(), ControlError> {
        let mut next = *self;
        if let Some(raw) = update.dominant_hand.as_deref() {
            next.dominant_hand = HandSide::parse(raw).ok_or_else(|| {
                ControlError::InvalidSession(format!("unknown dominant hand '{raw}'"))
            })?;
        }
        if let Some(raw) = update.target_mode.as_deref() {
            next.target_mode = TargetMode::parse(raw).ok_or_else(|| {
                ControlError::InvalidSession(format!("unknown target mode '{raw}'"))
            })?;
        }
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_first_run() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.dominant_hand, HandSide::Right);
        assert_eq!(cfg.target_mode, TargetMode::Fixed);
    }

    #[test]
    fn partial_update_is_all_or_nothing() {
        let mut cfg = SessionConfig::default();
        let bad = SessionUpdate {
            dominant_hand: Some("l".into()),
            target_mode: Some("orbit".into()),
        };
        assert!(cfg.apply(&bad).is_err());
        assert_eq!(cfg, SessionConfig::default());

        let good: SessionUpdate =
            serde_json::from_str(r#"{"dominant":"left","target_mode":"head"}"#).unwrap();
        cfg.apply(&good).unwrap();
        assert_eq!(cfg.dominant_hand, HandSide::Left);
        assert_eq!(cfg.target_mode, TargetMode::Head);
    }
}
