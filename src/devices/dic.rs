//! Correlation/triangulation collaborator.
//!
//! [`Correlator`] is the seam to a DIC engine. [`BlockMatchCorrelator`] is a
//! small reference engine: zero-normalized SSD block matching on a regular
//! subset grid, parabolic sub-pixel refinement, and depth from stereo
//! disparity. It is good enough to drive the rig end to end.

use super::capture::FramePair;
use anyhow::{bail, Context, Result};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    CoordinateX,
    CoordinateY,
    DisplacementX,
    DisplacementY,
    DisplacementZ,
    MatchResidual,
}

/// Parameters needed to turn disparity into depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoGeometry {
    pub focal_px: f64,
    pub baseline_mm: f64,
}

impl StereoGeometry {
    pub fn depth(&self, disparity_px: f64) -> Option<f64> {
        (disparity_px.abs() > f64::EPSILON)
            .then(|| self.focal_px * self.baseline_mm / disparity_px.abs())
    }
}

pub trait Correlator: Send {
    /// Fit the subset layout to the image extents.
    fn update_roi(&mut self, width: u32, height: u32) -> Result<()>;
    fn set_stereo_geometry(&mut self, geometry: Option<StereoGeometry>);
    fn set_reference(&mut self, pair: &FramePair) -> Result<()>;
    fn set_deformed(&mut self, pair: &FramePair) -> Result<()>;
    /// Returns `true` when the frame failed to correlate.
    fn execute_correlation(&mut self) -> bool;
    fn execute_triangulation(&mut self) -> Result<()>;
    fn execute_post_processors(&mut self) -> Result<()>;
    fn write_output(&mut self, frame_index: u64) -> Result<()>;
    fn local_num_subsets(&self) -> usize;
    fn subset_size(&self, subset: usize) -> u32;
    fn local_field_value(&self, subset: usize, field: Field) -> f64;
}

#[derive(Debug, Clone)]
pub struct BlockMatchConfig {
    pub subset_size: u32,
    pub step: u32,
    pub search_radius: u32,
    pub disparity_range: u32,
    pub roi_margin: u32,
    pub max_residual: f64,
    pub output_dir: Option<PathBuf>,
}

impl Default for BlockMatchConfig {
    fn default() -> Self {
        Self {
            subset_size: 21,
            step: 40,
            search_radius: 6,
            disparity_range: 24,
            roi_margin: 16,
            max_residual: 0.5,
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Subset {
    cx: i64,
    cy: i64,
    // Integer pixel in the current reference image the template is cut from,
    // and the displacement already accumulated when that reference was set.
    anchor: (i64, i64),
    base: (f64, f64),
    u: f64,
    v: f64,
    w: f64,
    residual: f64,
    matched: bool,
    origin_disparity: Option<f64>,
    disparity: Option<f64>,
}

impl Subset {
    fn new(cx: i64, cy: i64) -> Self {
        Self {
            cx,
            cy,
            anchor: (cx, cy),
            base: (0.0, 0.0),
            u: 0.0,
            v: 0.0,
            w: 0.0,
            residual: 0.0,
            matched: false,
            origin_disparity: None,
            disparity: None,
        }
    }
}

pub struct BlockMatchCorrelator {
    cfg: BlockMatchConfig,
    extents: Option<(u32, u32)>,
    geometry: Option<StereoGeometry>,
    reference: Option<FramePair>,
    deformed: Option<FramePair>,
    subsets: Vec<Subset>,
}

impl BlockMatchCorrelator {
    pub fn new(cfg: BlockMatchConfig) -> Self {
        Self {
            cfg,
            extents: None,
            geometry: None,
            reference: None,
            deformed: None,
            subsets: Vec::new(),
        }
    }

    fn half(&self) -> i64 {
        (self.cfg.subset_size / 2) as i64
    }

    fn build_grid(&self, width: u32, height: u32) -> Vec<Subset> {
        let half = self.half();
        let step = self.cfg.step.max(1) as i64;
        let reach = half + self.cfg.roi_margin as i64;
        let mut subsets = Vec::new();
        let mut cy = reach;
        while cy + reach < height as i64 {
            let mut cx = reach;
            while cx + reach < width as i64 {
                subsets.push(Subset::new(cx, cy));
                cx += step;
            }
            cy += step;
        }
        subsets
    }

    /// Best integer match of the template around `center` plus a parabolic
    /// sub-pixel correction. Returns (x, y, residual).
    fn locate(
        &self,
        template: &Window,
        target: &GrayImage,
        center: (i64, i64),
        rx: i64,
        ry: i64,
    ) -> Option<(f64, f64, f64)> {
        let mut costs = Vec::with_capacity(((2 * rx + 1) * (2 * ry + 1)) as usize);
        let mut best: Option<(i64, i64, f64)> = None;
        for dy in -ry..=ry {
            for dx in -rx..=rx {
                let cost = Window::cut(target, center.0 + dx, center.1 + dy, self.half())
                    .map(|w| template.znssd(&w));
                costs.push(cost);
                if let Some(c) = cost {
                    if best.map_or(true, |(_, _, b)| c < b) {
                        best = Some((dx, dy, c));
                    }
                }
            }
        }
        let (bx, by, cost) = best?;
        let width = 2 * rx + 1;
        let at = |dx: i64, dy: i64| -> Option<f64> {
            if dx.abs() > rx || dy.abs() > ry {
                return None;
            }
            costs[((dy + ry) * width + (dx + rx)) as usize]
        };
        // An exact match needs no refinement; the fit would only add bias.
        let (sx, sy) = if cost < 1e-9 {
            (0.0, 0.0)
        } else {
            (
                parabola(at(bx - 1, by), cost, at(bx + 1, by)),
                parabola(at(bx, by - 1), cost, at(bx, by + 1)),
            )
        };
        Some((
            (center.0 + bx) as f64 + sx,
            (center.1 + by) as f64 + sy,
            cost,
        ))
    }

    fn disparity_at(&self, pair: &FramePair, x: i64, y: i64) -> Option<f64> {
        let template = Window::cut(&pair.left, x, y, self.half())?;
        let range = self.cfg.disparity_range as i64;
        let (mx, _, residual) = self.locate(&template, &pair.right, (x, y), range, 0)?;
        (residual <= self.cfg.max_residual).then(|| mx - x as f64)
    }
}

fn parabola(left: Option<f64>, mid: f64, right: Option<f64>) -> f64 {
    match (left, right) {
        (Some(l), Some(r)) => {
            let denom = l - 2.0 * mid + r;
            if denom.abs() < 1e-12 {
                0.0
            } else {
                (0.5 * (l - r) / denom).clamp(-0.5, 0.5)
            }
        }
        _ => 0.0,
    }
}

/// Square pixel window, zero-mean and unit-norm for ZNSSD.
struct Window {
    values: Vec<f64>,
}

impl Window {
    fn cut(img: &GrayImage, cx: i64, cy: i64, half: i64) -> Option<Self> {
        let (w, h) = img.dimensions();
        if cx - half < 0 || cy - half < 0 || cx + half >= w as i64 || cy + half >= h as i64 {
            return None;
        }
        let mut values = Vec::with_capacity(((2 * half + 1) * (2 * half + 1)) as usize);
        for y in (cy - half)..=(cy + half) {
            for x in (cx - half)..=(cx + half) {
                values.push(img.get_pixel(x as u32, y as u32).0[0] as f64);
            }
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let mut norm = 0.0;
        for v in &mut values {
            *v -= mean;
            norm += *v * *v;
        }
        let norm = norm.sqrt();
        if norm > f64::EPSILON {
            for v in &mut values {
                *v /= norm;
            }
        }
        Some(Self { values })
    }

    /// Zero-normalized sum of squared differences: 0 for a perfect match, 4
    /// for perfectly anti-correlated windows.
    fn znssd(&self, other: &Window) -> f64 {
        self.values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

impl Correlator for BlockMatchCorrelator {
    fn update_roi(&mut self, width: u32, height: u32) -> Result<()> {
        if self.extents == Some((width, height)) {
            return Ok(());
        }
        let subsets = self.build_grid(width, height);
        if subsets.is_empty() {
            bail!(
                "no {}px subsets fit in a {width}x{height} image with a {}px margin",
                self.cfg.subset_size,
                self.cfg.roi_margin
            );
        }
        if self.extents.is_some() {
            bail!(
                "image extents changed from {:?} to {:?} mid-session",
                self.extents,
                (width, height)
            );
        }
        self.subsets = subsets;
        self.extents = Some((width, height));
        Ok(())
    }

    fn set_stereo_geometry(&mut self, geometry: Option<StereoGeometry>) {
        self.geometry = geometry;
    }

    fn set_reference(&mut self, pair: &FramePair) -> Result<()> {
        if self.subsets.is_empty() {
            bail!("set_reference called before the region of interest was set");
        }
        let first = self.reference.is_none();
        for i in 0..self.subsets.len() {
            if first {
                let (cx, cy) = (self.subsets[i].cx, self.subsets[i].cy);
                let d = self.disparity_at(pair, cx, cy);
                let s = &mut self.subsets[i];
                s.origin_disparity = d;
                s.disparity = d;
            } else {
                // Later references are previous deformed frames: follow the
                // tracked position so templates keep overlapping.
                let s = &mut self.subsets[i];
                s.anchor = (
                    (s.cx as f64 + s.u).round() as i64,
                    (s.cy as f64 + s.v).round() as i64,
                );
                s.base = (s.u, s.v);
            }
        }
        self.reference = Some(pair.clone());
        Ok(())
    }

    fn set_deformed(&mut self, pair: &FramePair) -> Result<()> {
        let Some(reference) = self.reference.as_ref() else {
            bail!("set_deformed called before a reference image was set");
        };
        if reference.dimensions() != pair.dimensions() {
            bail!(
                "deformed image is {:?}, reference is {:?}",
                pair.dimensions(),
                reference.dimensions()
            );
        }
        self.deformed = Some(pair.clone());
        Ok(())
    }

    fn execute_correlation(&mut self) -> bool {
        let (Some(reference), Some(deformed)) = (self.reference.as_ref(), self.deformed.as_ref())
        else {
            return true;
        };
        let radius = self.cfg.search_radius as i64;
        let half = self.half();
        let mut failed = false;
        let mut updates = Vec::with_capacity(self.subsets.len());
        for s in &self.subsets {
            let predicted = (
                s.anchor.0 + (s.u - s.base.0).round() as i64,
                s.anchor.1 + (s.v - s.base.1).round() as i64,
            );
            let found = Window::cut(&reference.left, s.anchor.0, s.anchor.1, half)
                .and_then(|t| self.locate(&t, &deformed.left, predicted, radius, radius))
                .filter(|&(_, _, r)| r <= self.cfg.max_residual);
            let disparity = found.and_then(|(x, y, _)| {
                self.disparity_at(deformed, x.round() as i64, y.round() as i64)
            });
            failed |= found.is_none();
            updates.push((found, disparity));
        }
        for (s, (found, disparity)) in self.subsets.iter_mut().zip(updates) {
            match found {
                Some((x, y, residual)) => {
                    s.u = s.base.0 + x - s.anchor.0 as f64;
                    s.v = s.base.1 + y - s.anchor.1 as f64;
                    s.residual = residual;
                    s.matched = true;
                }
                None => s.matched = false,
            }
            s.disparity = disparity;
        }
        failed
    }

    fn execute_triangulation(&mut self) -> Result<()> {
        for s in &mut self.subsets {
            let (Some(origin), Some(current)) = (s.origin_disparity, s.disparity) else {
                continue;
            };
            s.w = match self.geometry {
                Some(g) => match (g.depth(current), g.depth(origin)) {
                    (Some(now), Some(then)) => now - then,
                    _ => continue,
                },
                // Uncalibrated: report the disparity change in pixels.
                None => current - origin,
            };
        }
        Ok(())
    }

    fn execute_post_processors(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_output(&mut self, frame_index: u64) -> Result<()> {
        let Some(dir) = self.cfg.output_dir.as_ref() else {
            return Ok(());
        };
        let mut out = String::from("subset,x,y,u,v,w,residual,matched\n");
        for (i, s) in self.subsets.iter().enumerate() {
            let _ = writeln!(
                out,
                "{i},{},{},{:.4},{:.4},{:.4},{:.5},{}",
                s.cx, s.cy, s.u, s.v, s.w, s.residual, s.matched
            );
        }
        let path = dir.join(format!("solution_{frame_index:04}.csv"));
        std::fs::write(&path, out).with_context(|| format!("write {}", path.display()))
    }

    fn local_num_subsets(&self) -> usize {
        self.subsets.len()
    }

    fn subset_size(&self, _subset: usize) -> u32 {
        self.cfg.subset_size
    }

    fn local_field_value(&self, subset: usize, field: Field) -> f64 {
        let Some(s) = self.subsets.get(subset) else {
            return f64::NAN;
        };
        match field {
            Field::CoordinateX => s.cx as f64,
            Field::CoordinateY => s.cy as f64,
            Field::DisplacementX => s.u,
            Field::DisplacementY => s.v,
            Field::DisplacementZ => s.w,
            Field::MatchResidual => s.residual,
        }
    }
}
