use std::io::Cursor;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgba, RgbaImage};

use crate::models::{ModelSpec, Provider};

/// Raster polarity a provider expects for a supplied binary mask.
///
/// Erase: painted pixels are removed (transparent) and everything else stays
/// opaque and protected. Protect: painted pixels are marked protected and
/// everything else is eligible for regeneration. Logical inverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskConvention {
    Erase,
    Protect,
}

impl MaskConvention {
    /// Convention for the engine currently selected. Region-editing OpenAI
    /// models take erase-to-generate masks; everything else takes protect
    /// masks described in the instruction text.
    pub fn for_model(spec: &ModelSpec) -> Self {
        if spec.provider == Provider::OpenAi && spec.supports("edit") {
            MaskConvention::Erase
        } else {
            MaskConvention::Protect
        }
    }
}

/// One freehand stroke segment in normalized [0,1] surface coordinates.
/// Width is normalized against the shorter surface edge so replaying the
/// stroke log after a resize keeps the brush proportional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeSegment {
    pub from: (f32, f32),
    pub to: (f32, f32),
    pub width: f32,
}

const HIGHLIGHT: Rgba<u8> = Rgba([239, 68, 68, 153]);

/// Tracks one stroke buffer and rasterizes it on demand for the current
/// surface dimensions.
///
/// Both rasters share the same binary coverage (round caps, stamped circular
/// brush), so the visible highlight and the exported mask agree pixel for
/// pixel. Strokes are stored normalized and replayed lazily, which makes a
/// surface resize a plain dimension change instead of a raster rescale.
#[derive(Debug, Clone)]
pub struct MaskEncoder {
    width: u32,
    height: u32,
    convention: MaskConvention,
    strokes: Vec<StrokeSegment>,
}

impl MaskEncoder {
    pub fn new(width: u32, height: u32, convention: MaskConvention) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            convention,
            strokes: Vec::new(),
        }
    }

    pub fn convention(&self) -> MaskConvention {
        self.convention
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    pub fn clear(&mut self) {
        self.strokes.clear();
    }

    /// Records a segment given in display pixels of the current surface.
    pub fn add_segment(&mut self, from: (f32, f32), to: (f32, f32), brush_px: f32) {
        let w = self.width as f32;
        let h = self.height as f32;
        let short_edge = w.min(h);
        self.strokes.push(StrokeSegment {
            from: (from.0 / w, from.1 / h),
            to: (to.0 / w, to.1 / h),
            width: (brush_px / short_edge).max(0.0),
        });
    }

    /// Changes the surface dimensions. The stroke log is kept; rasters are
    /// re-derived from it on the next request.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
    }

    /// Additive semi-transparent highlight for user feedback only.
    pub fn display_raster(&self) -> RgbaImage {
        self.render(|covered| if covered { HIGHLIGHT } else { Rgba([0, 0, 0, 0]) })
    }

    /// Provider-facing raster in the convention fixed at session start.
    pub fn export_raster(&self) -> RgbaImage {
        match self.convention {
            MaskConvention::Erase => self.render(|covered| {
                if covered {
                    Rgba([255, 255, 255, 0])
                } else {
                    Rgba([255, 255, 255, 255])
                }
            }),
            MaskConvention::Protect => self.render(|covered| {
                if covered {
                    Rgba([255, 255, 255, 255])
                } else {
                    Rgba([0, 0, 0, 0])
                }
            }),
        }
    }

    /// Finalizes the mask session: the export raster as PNG bytes.
    pub fn finish(&self) -> Result<Vec<u8>> {
        let raster = self.export_raster();
        let mut bytes = Vec::new();
        raster
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("mask PNG encode failed")?;
        Ok(bytes)
    }

    fn render(&self, paint: impl Fn(bool) -> Rgba<u8>) -> RgbaImage {
        let coverage = self.coverage();
        RgbaImage::from_fn(self.width, self.height, |x, y| {
            paint(coverage[(y * self.width + x) as usize])
        })
    }

    fn coverage(&self) -> Vec<bool> {
        let mut covered = vec![false; (self.width * self.height) as usize];
        let w = self.width as f32;
        let h = self.height as f32;
        let short_edge = w.min(h);

        for stroke in &self.strokes {
            let from = (stroke.from.0 * w, stroke.from.1 * h);
            let to = (stroke.to.0 * w, stroke.to.1 * h);
            let radius = (stroke.width * short_edge / 2.0).max(0.5);
            let dx = to.0 - from.0;
            let dy = to.1 - from.1;
            let length = (dx * dx + dy * dy).sqrt();
            let steps = (length.ceil() as usize).max(1);
            for step in 0..=steps {
                let t = step as f32 / steps as f32;
                let cx = from.0 + dx * t;
                let cy = from.1 + dy * t;
                self.stamp(&mut covered, cx, cy, radius);
            }
        }
        covered
    }

    fn stamp(&self, covered: &mut [bool], cx: f32, cy: f32, radius: f32) {
        let min_x = ((cx - radius).floor().max(0.0)) as u32;
        let min_y = ((cy - radius).floor().max(0.0)) as u32;
        let max_x = ((cx + radius).ceil() as u32).min(self.width.saturating_sub(1));
        let max_y = ((cy + radius).ceil() as u32).min(self.height.saturating_sub(1));
        let r2 = radius * radius;
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let px = x as f32 + 0.5 - cx;
                let py = y as f32 + 0.5 - cy;
                if px * px + py * py <= r2 {
                    covered[(y * self.width + x) as usize] = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::models::ModelCatalog;

    use super::*;

    fn painted(encoder: &MaskEncoder) -> MaskEncoder {
        let mut painted = encoder.clone();
        painted.add_segment((20.0, 20.0), (60.0, 40.0), 10.0);
        painted.add_segment((60.0, 40.0), (30.0, 70.0), 10.0);
        painted
    }

    #[test]
    fn erase_export_is_exact_inverse_of_protect_export() {
        let erase = painted(&MaskEncoder::new(100, 80, MaskConvention::Erase));
        let protect = painted(&MaskEncoder::new(100, 80, MaskConvention::Protect));

        let erase_raster = erase.export_raster();
        let protect_raster = protect.export_raster();
        for (a, b) in erase_raster.pixels().zip(protect_raster.pixels()) {
            assert_eq!(a.0[3], 255 - b.0[3]);
        }
    }

    #[test]
    fn display_and_export_cover_identical_pixels() {
        let encoder = painted(&MaskEncoder::new(100, 80, MaskConvention::Protect));
        let display = encoder.display_raster();
        let export = encoder.export_raster();
        for (a, b) in display.pixels().zip(export.pixels()) {
            assert_eq!(a.0[3] > 0, b.0[3] > 0);
        }
    }

    #[test]
    fn empty_buffer_exports_all_protected() {
        let erase = MaskEncoder::new(32, 32, MaskConvention::Erase);
        assert!(erase.export_raster().pixels().all(|p| p.0[3] == 255));

        let protect = MaskEncoder::new(32, 32, MaskConvention::Protect);
        assert!(protect.export_raster().pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn resize_replays_strokes_against_new_dimensions() {
        let mut encoder = MaskEncoder::new(100, 100, MaskConvention::Protect);
        encoder.add_segment((50.0, 50.0), (50.0, 50.0), 20.0);

        encoder.resize(200, 200);
        let raster = encoder.export_raster();
        assert_eq!(raster.dimensions(), (200, 200));
        // The dab stays centered and scales with the surface.
        assert!(raster.get_pixel(100, 100).0[3] == 255);
        assert!(raster.get_pixel(10, 10).0[3] == 0);
    }

    #[test]
    fn strokes_paint_inside_canvas_bounds_only() {
        let mut encoder = MaskEncoder::new(64, 64, MaskConvention::Protect);
        encoder.add_segment((-10.0, 30.0), (200.0, 30.0), 8.0);
        let raster = encoder.export_raster();
        assert_eq!(raster.dimensions(), (64, 64));
        assert!(raster.get_pixel(32, 30).0[3] == 255);
    }

    #[test]
    fn finish_emits_decodable_png() -> Result<()> {
        let encoder = painted(&MaskEncoder::new(40, 40, MaskConvention::Erase));
        let bytes = encoder.finish()?;
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!(decoded.width(), 40);
        assert_eq!(decoded.height(), 40);
        Ok(())
    }

    #[test]
    fn convention_follows_engine_capability() {
        let catalog = ModelCatalog::default();
        let dalle2 = catalog.get("dall-e-2").unwrap();
        let gemini = catalog.get("gemini-2.5-flash-image").unwrap();
        let dalle3 = catalog.get("dall-e-3").unwrap();
        assert_eq!(MaskConvention::for_model(dalle2), MaskConvention::Erase);
        assert_eq!(MaskConvention::for_model(gemini), MaskConvention::Protect);
        assert_eq!(MaskConvention::for_model(dalle3), MaskConvention::Protect);
    }
}
