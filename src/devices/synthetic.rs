//! Simulated rig: a speckle-painted specimen on a motorized stage, seen by
//! two cameras with a fixed horizontal disparity.

use super::capture::{CaptureError, CaptureSource, FramePair, Pacer};
use image::{GrayImage, Luma};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Stage position shared between the simulated actuator and camera.
#[derive(Debug, Clone, Default)]
pub struct SimStage {
    position_um: Arc<AtomicI64>,
}

impl SimStage {
    pub fn position_mm(&self) -> f64 {
        self.position_um.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn move_by_mm(&self, mm: f64) {
        self.position_um
            .fetch_add((mm * 1000.0).round() as i64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct SpeckleParams {
    pub width: u32,
    pub height: u32,
    pub px_per_mm: f64,
    pub disparity_px: f64,
    pub speckle_density: f64,
    pub seed: u64,
}

impl SpeckleParams {
    pub fn new(width: u32, height: u32, seed: u64) -> Self {
        Self {
            width,
            height,
            px_per_mm: 10.0,
            disparity_px: 12.0,
            speckle_density: 0.02,
            seed,
        }
    }
}

/// Random speckle field, stored as floats so frames can be resampled at
/// sub-pixel offsets.
struct SpeckleField {
    width: usize,
    height: usize,
    values: Vec<f32>,
}

impl SpeckleField {
    fn generate(width: usize, height: usize, density: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut values = vec![0f32; width * height];
        let count = ((width * height) as f64 * density).max(1.0) as usize;
        for _ in 0..count {
            let cx = rng.gen_range(0.0..width as f32);
            let cy = rng.gen_range(0.0..height as f32);
            let radius = rng.gen_range(1.2f32..2.8);
            let reach = (radius * 3.0).ceil() as i64;
            let denom = 2.0 * radius * radius;
            for y in (cy as i64 - reach).max(0)..(cy as i64 + reach).min(height as i64) {
                for x in (cx as i64 - reach).max(0)..(cx as i64 + reach).min(width as i64) {
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    values[y as usize * width + x as usize] += (-(dx * dx + dy * dy) / denom).exp();
                }
            }
        }
        let max = values.iter().cloned().fold(f32::EPSILON, f32::max);
        for v in &mut values {
            *v = (*v / max).min(1.0);
        }
        Self {
            width,
            height,
            values,
        }
    }

    fn sample(&self, x: f64, y: f64) -> f32 {
        let x = x.clamp(0.0, (self.width - 2) as f64);
        let y = y.clamp(0.0, (self.height - 2) as f64);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;
        let at = |xx: usize, yy: usize| self.values[yy * self.width + xx];
        let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
        let bottom = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

pub struct SpeckleCapture {
    params: SpeckleParams,
    field: SpeckleField,
    margin: f64,
    stage: SimStage,
    pacer: Pacer,
}

impl SpeckleCapture {
    pub fn new(params: SpeckleParams, stage: SimStage, frame_interval: Duration) -> Self {
        let margin = 64.0 + params.disparity_px.abs().ceil();
        let field = SpeckleField::generate(
            params.width as usize + 2 * margin as usize,
            params.height as usize + 2 * margin as usize,
            params.speckle_density,
            params.seed,
        );
        Self {
            params,
            field,
            margin,
            stage,
            pacer: Pacer::new(frame_interval),
        }
    }

    fn render(&self, shift_x: f64) -> GrayImage {
        // Keep the view inside the generated field.
        let shift = shift_x.clamp(-(self.margin - 2.0), self.margin - 2.0);
        GrayImage::from_fn(self.params.width, self.params.height, |x, y| {
            let v = self
                .field
                .sample(x as f64 + self.margin - shift, y as f64 + self.margin);
            Luma([(v * 220.0 + 20.0).round() as u8])
        })
    }

    pub(crate) fn render_pair(&self) -> Result<FramePair, CaptureError> {
        let shift = self.stage.position_mm() * self.params.px_per_mm;
        FramePair::new(
            self.render(shift),
            self.render(shift + self.params.disparity_px),
        )
    }
}

impl CaptureSource for SpeckleCapture {
    fn next_frame_pair(&mut self) -> Result<FramePair, CaptureError> {
        self.pacer.wait();
        self.render_pair()
    }

    fn describe(&self) -> String {
        format!(
            "synthetic speckle {}x{} (seed {})",
            self.params.width, self.params.height, self.params.seed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_renders_identical_frames() {
        let a = SpeckleCapture::new(SpeckleParams::new(64, 48, 7), SimStage::default(), Duration::ZERO);
        let b = SpeckleCapture::new(SpeckleParams::new(64, 48, 7), SimStage::default(), Duration::ZERO);
        assert_eq!(a.render_pair().unwrap().left, b.render_pair().unwrap().left);
    }

    #[test]
    fn stage_motion_shifts_the_image() {
        let stage = SimStage::default();
        let cap = SpeckleCapture::new(SpeckleParams::new(64, 48, 3), stage.clone(), Duration::ZERO);
        let before = cap.render_pair().unwrap();
        // 10 px/mm, so 0.3 mm moves the specimen three whole pixels.
        stage.move_by_mm(0.3);
        let after = cap.render_pair().unwrap();
        assert_eq!(
            after.left.get_pixel(20, 20),
            before.left.get_pixel(17, 20)
        );
    }

    #[test]
    fn right_camera_sees_constant_disparity() {
        let cap = SpeckleCapture::new(SpeckleParams::new(64, 48, 5), SimStage::default(), Duration::ZERO);
        let pair = cap.render_pair().unwrap();
        assert_eq!(pair.right.get_pixel(30, 10), pair.left.get_pixel(18, 10));
    }
}
