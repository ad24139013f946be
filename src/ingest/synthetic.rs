//! Synthetic frame source for `stub://` URLs.
//!
//! Produces a slowly drifting gradient so the preview visibly updates. An
//! optional `fail_every=N` query parameter makes every Nth capture fail, which
//! exercises the loop's retry path without hardware.

use anyhow::{anyhow, Context, Result};
use log::info;

use super::{CameraConfig, FrameSource, SourceStats};
use crate::frame::{rgb_len, Frame};

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    fail_every: Option<u64>,
    attempts: u64,
    frame_count: u64,
    failures: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            fail_every: None,
            attempts: 0,
            frame_count: 0,
            failures: 0,
            connected: false,
        }
    }

    /// Build from a `stub://name[?fail_every=N]` URL.
    pub fn from_config(config: &CameraConfig) -> Result<Self> {
        let rest = config
            .url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub url: {}", config.url))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut source = Self::new(name, config.width, config.height);
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("fail_every", n)) => {
                    let n: u64 = n
                        .parse()
                        .with_context(|| format!("invalid fail_every '{}'", n))?;
                    source.fail_every = (n > 0).then_some(n);
                }
                _ => return Err(anyhow!("unknown stub parameter '{}'", pair)),
            }
        }
        Ok(source)
    }

    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    fn render(&self) -> Result<Vec<u8>> {
        let mut pixels = vec![0u8; rgb_len(self.width, self.height)?];
        let drift = (self.frame_count % 256) as u32;
        let w = self.width.max(1);
        let h = self.height.max(1);
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = i as u32 % w;
            let y = i as u32 / w;
            px[0] = ((x * 255 / w + drift) % 256) as u8;
            px[1] = (y * 255 / h) as u8;
            px[2] = 96;
        }
        Ok(pixels)
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        info!(
            "SyntheticSource: connected to stub://{} ({}x{})",
            self.name, self.width, self.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("stub://{} not connected", self.name));
        }
        self.attempts += 1;
        if let Some(n) = self.fail_every {
            if self.attempts % n == 0 {
                self.failures += 1;
                return Err(anyhow!(
                    "stub://{}: simulated capture failure #{}",
                    self.name,
                    self.failures
                ));
            }
        }
        let pixels = self.render()?;
        let frame = Frame::from_rgb(pixels, self.width, self.height, self.frame_count)?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            failures: self.failures,
            device: format!("stub://{}", self.name),
        }
    }
}
