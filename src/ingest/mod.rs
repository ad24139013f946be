//! Frame acquisition.
//!
//! - `stub://<name>[?fail_every=N]`: synthetic frames, always available
//! - `/dev/videoN` or `v4l2:///dev/videoN`: local camera (feature: ingest-v4l2)
//!
//! Sources hand out owned RGB24 [`Frame`]s. A failed `next_frame` is a
//! transient error; the loop backs off and asks again.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Camera settings shared by every source kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Source URL or device path.
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Requested device frame rate.
    pub target_fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera0".to_string(),
            width: 1280,
            height: 720,
            target_fps: 30,
        }
    }
}

/// Counters reported in the periodic health log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub failures: u64,
    pub device: String,
}

pub trait FrameSource: Send {
    /// Open the device. Called once before the first `next_frame`.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame.
    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Open the source named by `config.url`. The source is not yet connected.
pub fn open_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    let url = config.url.trim();
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::from_config(config)?));
    }
    if url.starts_with("/dev/video") || url.starts_with("v4l2://") {
        return open_device(config);
    }
    Err(anyhow!("unsupported camera url '{}'", url))
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(config: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(V4l2Source::new(config.clone())?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(config: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "camera '{}' needs the ingest-v4l2 feature",
        config.url
    ))
}
