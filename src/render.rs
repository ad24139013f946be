//! Overlay rendering and JPEG encoding.
//!
//! Draws evaluator [`DrawOp`]s and the HUD band onto a copy of the frame.
//! Text uses the 8x8 bitmap glyphs from `font8x8`; characters outside ASCII
//! draw as `?`.

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use font8x8::legacy::BASIC_LEGACY;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::evaluator::{DrawOp, Rgb as Colour};
use crate::frame::Frame;
use crate::geometry::Point;
use crate::session::SessionConfig;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

const HUD_HEIGHT: u32 = 28;
const GLYPH: i32 = 8;
const HUD_TEXT_Y: i32 = 6;
const LABEL_H: u32 = 18;
const BAR_COLOUR: Colour = [0, 200, 90];
const TEXT_COLOUR: Colour = [255, 255, 255];
const MAX_STROKE: u32 = 32;

/// Extra HUD content shown in debug mode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DebugHud {
    pub fps: f64,
    pub session: SessionConfig,
}

/// Heads-up display for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Hud {
    pub task: Option<String>,
    pub progress: f64,
    pub state: &'static str,
    pub debug: Option<DebugHud>,
}

impl Hud {
    pub fn line(&self) -> String {
        let mut line = match &self.task {
            Some(task) => format!(
                "{} {:>3.0}% {}",
                task,
                (self.progress * 100.0).clamp(0.0, 100.0),
                self.state
            ),
            None => "no task".to_string(),
        };
        if let Some(debug) = &self.debug {
            line.push_str(&format!(
                " | {:.1} fps | {}/{}",
                debug.fps,
                debug.session.dominant_hand.as_str(),
                debug.session.target_mode.as_str()
            ));
        }
        line
    }
}

pub struct Renderer {
    quality: u8,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl Renderer {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    /// Draw `overlay` and `hud` onto a copy of `frame` and encode it as JPEG.
    pub fn render(&self, frame: &Frame, overlay: &[DrawOp], hud: &Hud) -> Result<Vec<u8>> {
        let mut canvas = Canvas::from_frame(frame)?;
        for op in overlay {
            canvas.draw(op);
        }
        canvas.hud(hud);

        let mut out = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&canvas.image)
            .context("encode JPEG")?;
        Ok(out.into_inner())
    }
}

struct Canvas {
    image: RgbImage,
}

impl Canvas {
    fn from_frame(frame: &Frame) -> Result<Self> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
        Ok(Self { image })
    }

    fn put(&mut self, x: i32, y: i32, colour: Colour) {
        if x < 0 || y < 0 {
            return;
        }
        let (x, y) = (x as u32, y as u32);
        if x < self.image.width() && y < self.image.height() {
            self.image.put_pixel(x, y, Rgb(colour));
        }
    }

    fn fill_rect(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, colour: Colour) {
        for y in y0.max(0)..=y1.min(self.image.height() as i32 - 1) {
            for x in x0.max(0)..=x1.min(self.image.width() as i32 - 1) {
                self.put(x, y, colour);
            }
        }
    }

    /// Darken a region towards black by half.
    fn shade(&mut self, x0: i32, y0: i32, x1: i32, y1: i32) {
        let (w, h) = (self.image.width() as i32, self.image.height() as i32);
        for y in y0.max(0)..=y1.min(h - 1) {
            for x in x0.max(0)..=x1.min(w - 1) {
                let px = self.image.get_pixel_mut(x as u32, y as u32);
                for c in px.0.iter_mut() {
                    *c /= 2;
                }
            }
        }
    }

    /// Draw `text` with its top-left glyph corner at `(x, y)`. Returns the x after the last glyph.
    fn text(&mut self, x: i32, y: i32, text: &str, colour: Colour) -> i32 {
        let mut cx = x;
        for ch in text.chars() {
            let code = if ch.is_ascii() { ch as usize } else { '?' as usize };
            for (row, bits) in BASIC_LEGACY[code].iter().enumerate() {
                for col in 0..GLYPH {
                    if bits & (1 << col) != 0 {
                        self.put(cx + col, y + row as i32, colour);
                    }
                }
            }
            cx = cx.saturating_add(GLYPH);
        }
        cx
    }

    /// Pull a point into a band around the image so line walks stay short.
    fn clip(&self, p: Point) -> Point {
        let reach = 2 * self.image.width().max(self.image.height()) as i32;
        Point::new(p.x.clamp(-reach, reach), p.y.clamp(-reach, reach))
    }

    fn stamp(&mut self, p: Point, thickness: u32, colour: Colour) {
        let r = (thickness.max(1) / 2) as i32;
        self.fill_rect(p.x - r, p.y - r, p.x + r, p.y + r, colour);
    }

    fn line(&mut self, from: Point, to: Point, thickness: u32, colour: Colour) {
        let (from, to) = (self.clip(from), self.clip(to));
        let thickness = thickness.min(MAX_STROKE);
        let (mut x, mut y) = (from.x, from.y);
        let dx = (to.x - from.x).abs();
        let dy = -(to.y - from.y).abs();
        let sx = if from.x < to.x { 1 } else { -1 };
        let sy = if from.y < to.y { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.stamp(Point::new(x, y), thickness, colour);
            if x == to.x && y == to.y {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    fn circle(&mut self, center: Point, radius: u32, filled: bool, colour: Colour) {
        let center = self.clip(center);
        let r = radius.min(self.image.width().max(self.image.height())) as i32;
        let outer = (r * r) as i64;
        let inner = ((r - 2).max(0) * (r - 2).max(0)) as i64;
        for dy in -r..=r {
            for dx in -r..=r {
                let d2 = (dx * dx + dy * dy) as i64;
                if d2 <= outer && (filled || d2 >= inner) {
                    self.put(center.x + dx, center.y + dy, colour);
                }
            }
        }
    }

    fn draw(&mut self, op: &DrawOp) {
        match op {
            DrawOp::Rect {
                bbox,
                color,
                thickness,
            } => {
                let corners = [
                    Point::new(bbox.x1, bbox.y1),
                    Point::new(bbox.x2, bbox.y1),
                    Point::new(bbox.x2, bbox.y2),
                    Point::new(bbox.x1, bbox.y2),
                ];
                for i in 0..4 {
                    self.line(corners[i], corners[(i + 1) % 4], *thickness, *color);
                }
            }
            DrawOp::Circle {
                center,
                radius,
                color,
                filled,
            } => self.circle(*center, *radius, *filled, *color),
            DrawOp::Line {
                from,
                to,
                color,
                thickness,
            } => self.line(*from, *to, *thickness, *color),
            DrawOp::Label {
                origin,
                text,
                color,
            } => {
                let origin = self.clip(*origin);
                let w = GLYPH.saturating_mul(text.chars().count() as i32).saturating_add(12);
                let (x1, y1) = (origin.x.saturating_add(w), origin.y + LABEL_H as i32);
                self.shade(origin.x, origin.y, x1, y1);
                self.fill_rect(origin.x, origin.y, origin.x + 3, y1, *color);
                self.text(origin.x + 8, origin.y + (LABEL_H as i32 - GLYPH) / 2, text, *color);
            }
        }
    }

    fn hud(&mut self, hud: &Hud) {
        let w = self.image.width() as i32;
        self.shade(0, 0, w - 1, HUD_HEIGHT as i32 - 1);
        self.text(8, HUD_TEXT_Y, &hud.line(), TEXT_COLOUR);
        if hud.task.is_some() {
            let filled = ((w - 16) as f64 * hud.progress.clamp(0.0, 1.0)).round() as i32;
            if filled > 0 {
                self.fill_rect(8, HUD_HEIGHT as i32 - 8, 8 + filled, HUD_HEIGHT as i32 - 4, BAR_COLOUR);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::palette;
    use crate::geometry::BBox;

    fn grey(w: u32, h: u32) -> Frame {
        Frame::from_rgb(vec![120; (w * h * 3) as usize], w, h, 7).unwrap()
    }

    #[test]
    fn renders_a_jpeg() {
        let renderer = Renderer::default();
        let overlay = vec![
            DrawOp::Rect {
                bbox: BBox::new(10, 10, 50, 40),
                color: palette::TARGET,
                thickness: 2,
            },
            DrawOp::Circle {
                center: Point::new(30, 30),
                radius: 12,
                color: palette::OK,
                filled: false,
            },
            DrawOp::Line {
                from: Point::new(-20, -20),
                to: Point::new(500, 500),
                color: palette::HAND,
                thickness: 3,
            },
            DrawOp::Label {
                origin: Point::new(60, 60),
                text: "GRABBED".into(),
                color: palette::OK,
            },
        ];
        let hud = Hud {
            task: Some("reach".into()),
            progress: 0.5,
            state: "reaching",
            debug: None,
        };
        let jpeg = renderer.render(&grey(160, 120), &overlay, &hud).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn drawing_stays_inside_the_frame() {
        let frame = grey(20, 20);
        let mut canvas = Canvas::from_frame(&frame).unwrap();
        canvas.circle(Point::new(0, 0), 30, true, [255, 0, 0]);
        canvas.line(Point::new(-100, 5), Point::new(100, 5), 5, [0, 255, 0]);
        assert_eq!(canvas.image.get_pixel(19, 19).0, [255, 0, 0]);
        assert_eq!(canvas.image.get_pixel(10, 5).0, [0, 255, 0]);
    }

    fn band_pixels(canvas: &Canvas, y0: u32, y1: u32, colour: Colour) -> Vec<(u32, u32)> {
        let mut hits = Vec::new();
        for y in y0..y1 {
            for x in 0..canvas.image.width() {
                if canvas.image.get_pixel(x, y).0 == colour {
                    hits.push((x, y));
                }
            }
        }
        hits
    }

    #[test]
    fn hud_text_is_drawn_into_the_band() {
        let hud = |task: &str| Hud {
            task: Some(task.into()),
            progress: 0.0,
            state: "idle",
            debug: None,
        };
        let frame = grey(320, 60);
        let band = (HUD_TEXT_Y as u32, (HUD_TEXT_Y + GLYPH) as u32);

        let mut reach = Canvas::from_frame(&frame).unwrap();
        reach.hud(&hud("reach"));
        let reach_px = band_pixels(&reach, band.0, band.1, TEXT_COLOUR);
        assert!(!reach_px.is_empty());

        let mut place = Canvas::from_frame(&frame).unwrap();
        place.hud(&hud("place_cup_down"));
        assert_ne!(reach_px, band_pixels(&place, band.0, band.1, TEXT_COLOUR));

        // Nothing below the band is touched by the text.
        assert!(band_pixels(&reach, HUD_HEIGHT, 60, TEXT_COLOUR).is_empty());
    }

    #[test]
    fn labels_draw_their_text() {
        let mut canvas = Canvas::from_frame(&grey(200, 60)).unwrap();
        canvas.draw(&DrawOp::Label {
            origin: Point::new(10, 20),
            text: "HOLD 3.2/5.0s".into(),
            color: palette::OK,
        });
        let text_px: Vec<_> = band_pixels(&canvas, 20, 38, palette::OK)
            .into_iter()
            .filter(|&(x, _)| x >= 18)
            .collect();
        assert!(!text_px.is_empty());
        assert!(text_px.iter().all(|&(x, _)| x < 18 + 13 * 8));
    }

    #[test]
    fn non_ascii_falls_back_to_a_glyph() {
        let mut canvas = Canvas::from_frame(&grey(40, 20)).unwrap();
        let end = canvas.text(0, 0, "✔", TEXT_COLOUR);
        assert_eq!(end, GLYPH);
        assert!(!band_pixels(&canvas, 0, 8, TEXT_COLOUR).is_empty());
    }

    #[test]
    fn extreme_overlay_coordinates_are_clipped() {
        let mut canvas = Canvas::from_frame(&grey(20, 20)).unwrap();
        canvas.draw(&DrawOp::Line {
            from: Point::new(i32::MIN, 5),
            to: Point::new(i32::MAX, 5),
            color: [0, 255, 0],
            thickness: u32::MAX,
        });
        canvas.draw(&DrawOp::Circle {
            center: Point::new(i32::MAX, i32::MAX),
            radius: u32::MAX,
            color: [255, 0, 0],
            filled: false,
        });
        assert_eq!(canvas.image.get_pixel(10, 5).0, [0, 255, 0]);
    }

    #[test]
    fn hud_line_formats() {
        let mut hud = Hud {
            task: Some("grab_hold".into()),
            progress: 0.42,
            state: "gripping",
            debug: None,
        };
        assert_eq!(hud.line(), "grab_hold  42% gripping");
        hud.debug = Some(DebugHud {
            fps: 19.84,
            session: SessionConfig::default(),
        });
        assert_eq!(hud.line(), "grab_hold  42% gripping | 19.8 fps | right/fixed");
        hud.task = None;
        assert!(hud.line().starts_with("no task"));
    }
}
