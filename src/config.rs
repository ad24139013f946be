use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::ingest::CameraConfig;
use crate::orchestrator::LoopConfig;
use crate::session::{SessionConfig, TargetMode};
use crate::signals::HandSide;

const DEFAULT_DB_PATH: &str = "coach.db";
const DEFAULT_SESSION_ID: &str = "local";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_CAMERA_URL: &str = "stub://camera0";
const DEFAULT_CAMERA_WIDTH: u32 = 1280;
const DEFAULT_CAMERA_HEIGHT: u32 = 720;
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_TARGET_HZ: u32 = 20;
const DEFAULT_STICKY_FRAMES: u32 = 6;
const DEFAULT_TARGET_CLASS: u32 = 39;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_MODEL_INPUT: u32 = 640;

const MAX_TARGET_HZ: u32 = 120;
const MAX_STICKY_FRAMES: u32 = 600;
const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CoachdConfigFile {
    db_path: Option<String>,
    session_id: Option<String>,
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    #[serde(rename = "loop")]
    frame_loop: Option<LoopConfigFile>,
    session: Option<SessionConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    mirror: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct LoopConfigFile {
    target_hz: Option<u32>,
    sticky_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    dominant: Option<String>,
    target_mode: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    target_class: Option<u32>,
    confidence: Option<f32>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoachdConfig {
    pub db_path: String,
    pub session_id: String,
    pub api_addr: String,
    pub camera: CameraConfig,
    pub mirror: bool,
    pub target_hz: u32,
    pub sticky_frames: u32,
    pub session: SessionConfig,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub model_path: Option<PathBuf>,
    pub target_class: u32,
    pub confidence: f32,
    pub input_width: u32,
    pub input_height: u32,
}

impl CoachdConfig {
    /// Load from the file named by `COACH_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("COACH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like [`CoachdConfig::load`], with an explicit config file taking precedence.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            target_hz: self.target_hz,
            sticky_frames: self.sticky_frames,
            session_id: self.session_id.clone(),
            mirror: self.mirror,
            ..LoopConfig::default()
        }
    }

    fn from_file(file: CoachdConfigFile) -> Result<Self> {
        let camera_file = file.camera.unwrap_or_default();
        let loop_file = file.frame_loop.unwrap_or_default();
        let session_file = file.session.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();

        let mut session = SessionConfig::default();
        if let Some(raw) = session_file.dominant.as_deref() {
            session.dominant_hand = parse_dominant(raw)?;
        }
        if let Some(raw) = session_file.target_mode.as_deref() {
            session.target_mode = parse_target_mode(raw)?;
        }

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            session_id: file
                .session_id
                .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string()),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            camera: CameraConfig {
                url: camera_file
                    .url
                    .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                width: camera_file.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera_file.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                target_fps: camera_file.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
            },
            mirror: camera_file.mirror.unwrap_or(true),
            target_hz: loop_file.target_hz.unwrap_or(DEFAULT_TARGET_HZ),
            sticky_frames: loop_file.sticky_frames.unwrap_or(DEFAULT_STICKY_FRAMES),
            session,
            detector: DetectorSettings {
                model_path: detector_file.model_path,
                target_class: detector_file.target_class.unwrap_or(DEFAULT_TARGET_CLASS),
                confidence: detector_file.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                input_width: detector_file.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
                input_height: detector_file.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = non_empty_env("COACH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(id) = non_empty_env("COACH_SESSION_ID") {
            self.session_id = id;
        }
        if let Some(addr) = non_empty_env("COACH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = non_empty_env("COACH_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(hz) = non_empty_env("COACH_TARGET_HZ") {
            self.target_hz = hz
                .parse()
                .map_err(|_| anyhow!("COACH_TARGET_HZ must be an integer"))?;
        }
        if let Some(frames) = non_empty_env("COACH_STICKY_FRAMES") {
            self.sticky_frames = frames
                .parse()
                .map_err(|_| anyhow!("COACH_STICKY_FRAMES must be an integer"))?;
        }
        if let Some(raw) = non_empty_env("COACH_DOMINANT").or_else(|| non_empty_env("DEX_DOMINANT")) {
            self.session.dominant_hand = parse_dominant(&raw)?;
        }
        if let Some(raw) =
            non_empty_env("COACH_TARGET_MODE").or_else(|| non_empty_env("DEX_TARGET_MODE"))
        {
            self.session.target_mode = parse_target_mode(&raw)?;
        }
        if let Some(path) = non_empty_env("COACH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(1..=MAX_TARGET_HZ).contains(&self.target_hz) {
            return Err(anyhow!(
                "loop.target_hz must be in 1..={}, got {}",
                MAX_TARGET_HZ,
                self.target_hz
            ));
        }
        if self.sticky_frames > MAX_STICKY_FRAMES {
            return Err(anyhow!(
                "loop.sticky_frames must be at most {}, got {}",
                MAX_STICKY_FRAMES,
                self.sticky_frames
            ));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        validate_session_id(&self.session_id)?;
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("api.addr '{}' is not a socket address", self.api_addr))?;
        if !(self.detector.confidence > 0.0 && self.detector.confidence <= 1.0) {
            return Err(anyhow!(
                "detector.confidence must be in (0, 1], got {}",
                self.detector.confidence
            ));
        }
        Ok(())
    }
}

/// Session ids are 1-64 characters from `[A-Za-z0-9_.-]`.
pub fn validate_session_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !ok {
        return Err(anyhow!("invalid session id '{}'", id));
    }
    Ok(())
}

fn parse_dominant(raw: &str) -> Result<HandSide> {
    HandSide::parse(raw).ok_or_else(|| anyhow!("dominant hand must be left|right|l|r, got '{}'", raw))
}

fn parse_target_mode(raw: &str) -> Result<TargetMode> {
    TargetMode::parse(raw).ok_or_else(|| anyhow!("target mode must be fixed|head, got '{}'", raw))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<CoachdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(json: &str) -> Result<CoachdConfig> {
        let file: CoachdConfigFile = serde_json::from_str(json)?;
        let mut cfg = CoachdConfig::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn defaults() {
        let cfg = parsed("{}").unwrap();
        assert_eq!(cfg.db_path, "coach.db");
        assert_eq!(cfg.api_addr, "127.0.0.1:8000");
        assert_eq!(cfg.camera.url, "stub://camera0");
        assert_eq!((cfg.camera.width, cfg.camera.height), (1280, 720));
        assert!(cfg.mirror);
        assert_eq!(cfg.target_hz, 20);
        assert_eq!(cfg.sticky_frames, 6);
        assert_eq!(cfg.session, SessionConfig::default());
        assert_eq!(cfg.detector.target_class, 39);
        assert_eq!(cfg.detector.model_path, None);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parsed(r#"{"loop": {"target_hz": 0}}"#).is_err());
        assert!(parsed(r#"{"loop": {"target_hz": 121}}"#).is_err());
        assert!(parsed(r#"{"loop": {"sticky_frames": 601}}"#).is_err());
        assert!(parsed(r#"{"camera": {"width": 0}}"#).is_err());
        assert!(parsed(r#"{"session_id": "has space"}"#).is_err());
        assert!(parsed(r#"{"session": {"dominant": "both"}}"#).is_err());
        assert!(parsed(r#"{"detector": {"confidence": 1.5}}"#).is_err());
        assert!(parsed(r#"{"api": {"addr": "localhost"}}"#).is_err());
    }

    #[test]
    fn unknown_top_level_keys_are_rejected() {
        assert!(serde_json::from_str::<CoachdConfigFile>(r#"{"dbpath": "x"}"#).is_err());
    }

    #[test]
    fn session_ids() {
        assert!(validate_session_id("patient-7_a.b").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn loop_config_carries_settings() {
        let cfg = parsed(r#"{"session_id": "p1", "camera": {"mirror": false}}"#).unwrap();
        let lc = cfg.loop_config();
        assert_eq!(lc.session_id, "p1");
        assert!(!lc.mirror);
        assert_eq!(lc.target_hz, 20);
    }
}
