//! Captured frames and the latest-rendered-frame slot.
//!
//! - `Frame`: one RGB24 capture. Owned by the loop for a single cycle.
//! - `LatestFrame`: the most recent rendered JPEG, shared with MJPEG readers.
//! - `FrameSlot`: single-writer, many-reader holder for `LatestFrame`.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};

/// One RGB24 frame, row-major, no padding.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic sequence assigned by the source.
    pub sequence: u64,
    pub captured_at: Instant,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Wrap RGB24 bytes. Fails if the buffer does not match the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    /// Flip horizontally in place, so the preview behaves like a mirror.
    pub fn mirror(&mut self) {
        let row_len = self.width as usize * 3;
        if row_len == 0 {
            return;
        }
        for row in self.data.chunks_exact_mut(row_len) {
            let (mut lo, mut hi) = (0usize, self.width as usize - 1);
            while lo < hi {
                for c in 0..3 {
                    row.swap(lo * 3 + c, hi * 3 + c);
                }
                lo += 1;
                hi -= 1;
            }
        }
    }
}

/// Byte length of an RGB24 buffer, checked for overflow.
pub fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

/// The most recently rendered frame, JPEG-encoded.
#[derive(Clone, Debug)]
pub struct LatestFrame {
    pub jpeg: Arc<Vec<u8>>,
    pub sequence: u64,
    pub hud: String,
    pub rendered_at: Instant,
}

/// Shared slot holding the latest rendered frame.
#[derive(Debug, Default)]
pub struct FrameSlot {
    inner: Mutex<Option<LatestFrame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published frame. A poisoned slot is recovered.
    pub fn publish(&self, frame: LatestFrame) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(frame);
    }

    pub fn latest(&self) -> Option<LatestFrame> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
