#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, RgbImage};
use tract_onnx::prelude::*;

use crate::frame::Frame;
use crate::geometry::BBox;
use crate::perception::backend::{Capability, PerceptionBackend};
use crate::signals::Detection;

/// COCO class index for "bottle".
pub const DEFAULT_TARGET_CLASS: u32 = 39;

/// ONNX object detector.
///
/// Expects a detector exported with NMS baked in: input `[1, 3, H, W]` RGB in
/// `0..1`, output `[1, N, 6]` rows of `(x1, y1, x2, y2, score, class)` in
/// model-input pixels.
pub struct TractDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_width: u32,
    input_height: u32,
    target_class: u32,
    confidence_threshold: f32,
}

impl TractDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_width: u32, input_height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width,
            input_height,
            target_class: DEFAULT_TARGET_CLASS,
            confidence_threshold: 0.5,
        })
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_target_class(mut self, class: u32) -> Self {
        self.target_class = class;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
        let resized = if (frame.width, frame.height) == (self.input_width, self.input_height) {
            image
        } else {
            imageops::resize(
                &image,
                self.input_width,
                self.input_height,
                imageops::FilterType::Triangle,
            )
        };

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, self.input_width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    /// Pick the best target-class row and map it back to frame pixels.
    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Option<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let rows = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let rows = rows
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("detector output is not rank 3")?;
        let shape = rows.shape();
        if shape[2] < 6 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }

        let sx = frame.width as f32 / self.input_width as f32;
        let sy = frame.height as f32 / self.input_height as f32;
        let mut best: Option<(f32, BBox)> = None;
        for n in 0..shape[1] {
            let row = |k: usize| rows[[0, n, k]];
            let (score, class) = (row(4), row(5));
            if !score.is_finite() || score < self.confidence_threshold {
                continue;
            }
            if class.round() as i64 != i64::from(self.target_class) {
                continue;
            }
            if best.map_or(true, |(s, _)| score > s) {
                let bbox = BBox::new(
                    (row(0) * sx).round() as i32,
                    (row(1) * sy).round() as i32,
                    (row(2) * sx).round() as i32,
                    (row(3) * sy).round() as i32,
                );
                best = Some((score, bbox));
            }
        }

        Ok(best.and_then(|(score, bbox)| {
            Detection::clamped(bbox, score, frame.width, frame.height)
        }))
    }
}

impl PerceptionBackend for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::ObjectDetection)
    }

    fn detect(&mut self, frame: &Frame) -> Result<Option<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::from_rgb(
            vec![0; crate::frame::rgb_len(self.input_width, self.input_height)?],
            self.input_width,
            self.input_height,
            0,
        )?;
        self.detect(&blank).map(|_| ())
    }
}
