//! Device pixel formats to RGB24.

use anyhow::{anyhow, Result};

use crate::frame::rgb_len;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    /// Full-res Y plane followed by interleaved half-res UV.
    Nv12,
    /// Packed Y0 U Y1 V.
    Yuyv,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YUYV" => Some(PixelFormat::Yuyv),
            _ => None,
        }
    }
}

pub(crate) fn to_rgb24(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>> {
    let expected = match format {
        PixelFormat::Rgb24 => rgb_len(width, height)?,
        PixelFormat::Nv12 => {
            let y = (width as usize)
                .checked_mul(height as usize)
                .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
            y + y / 2
        }
        PixelFormat::Yuyv => rgb_len(width, height)? / 3 * 2,
    };
    if pixels.len() < expected {
        return Err(anyhow!(
            "{:?} frame too short: expected {} bytes, got {}",
            format,
            expected,
            pixels.len()
        ));
    }

    let (w, h) = (width as usize, height as usize);
    match format {
        PixelFormat::Rgb24 => Ok(pixels[..expected].to_vec()),
        PixelFormat::Nv12 => {
            let mut rgb = vec![0u8; w * h * 3];
            let y_plane = w * h;
            for j in 0..h {
                for i in 0..w {
                    let uv = y_plane + (j / 2) * w + (i / 2) * 2;
                    let px = yuv_to_rgb(pixels[j * w + i], pixels[uv], pixels[uv + 1]);
                    rgb[(j * w + i) * 3..][..3].copy_from_slice(&px);
                }
            }
            Ok(rgb)
        }
        PixelFormat::Yuyv => {
            let mut rgb = Vec::with_capacity(w * h * 3);
            for quad in pixels[..expected].chunks_exact(4) {
                let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
                rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
                rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
            Ok(rgb)
        }
    }
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;
    [
        clamp_to_u8(y + 1.402 * v),
        clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_to_u8(y + 1.772 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
