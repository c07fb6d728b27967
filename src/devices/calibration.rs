//! Stereo camera-system geometry and the calibration collaborator seam.

use super::dic::StereoGeometry;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CAMERA_SYSTEM_FILE: &str = "cal.json";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Tangential distortion.
    pub p1: f64,
    pub p2: f64,
}

/// Result of a stereo calibration: both cameras plus the pose of the right
/// camera relative to the left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSystem {
    pub rms: f64,
    pub cameras: [CameraIntrinsics; 2],
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
}

impl CameraSystem {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read camera system {}", path.display()))?;
        let system: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse camera system {}", path.display()))?;
        system.validate()?;
        Ok(system)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.rms.is_finite() || self.rms < 0.0 {
            bail!("calibration rms {} is not a valid error", self.rms);
        }
        for (i, cam) in self.cameras.iter().enumerate() {
            if !(cam.fx > 0.0 && cam.fy > 0.0) {
                bail!("camera {i} has non-positive focal length");
            }
        }
        if self.baseline() <= f64::EPSILON {
            bail!("camera system has a zero-length baseline");
        }
        Ok(())
    }

    pub fn baseline(&self) -> f64 {
        self.translation.iter().map(|t| t * t).sum::<f64>().sqrt()
    }

    pub fn stereo_geometry(&self) -> StereoGeometry {
        StereoGeometry {
            focal_px: self.cameras[0].fx,
            baseline_mm: self.baseline(),
        }
    }

    /// Human-readable report printed after a calibration run.
    pub fn report(&self) -> Vec<String> {
        let mut lines = vec![format!("rms error: {:.4}", self.rms)];
        for row in &self.rotation {
            lines.push(format!("R  {:>10.6} {:>10.6} {:>10.6}", row[0], row[1], row[2]));
        }
        lines.push(format!(
            "t  {:>10.4} {:>10.4} {:>10.4}",
            self.translation[0], self.translation[1], self.translation[2]
        ));
        for (i, cam) in self.cameras.iter().enumerate() {
            lines.push(format!(
                "camera {i}: cx {:.2} cy {:.2} p1 {:.6} p2 {:.6}",
                cam.cx, cam.cy, cam.p1, cam.p2
            ));
        }
        lines
    }
}

pub trait Calibrator: Send {
    /// Compute the camera system from the frame pairs saved under `cal_dir`.
    fn calibrate(&mut self, cal_dir: &Path, frames: &[[PathBuf; 2]]) -> Result<CameraSystem>;
}

/// Uses geometry computed ahead of time instead of solving it from targets.
pub struct PrecomputedCalibrator {
    source: Option<PathBuf>,
}

impl PrecomputedCalibrator {
    pub fn new(source: Option<PathBuf>) -> Self {
        Self { source }
    }
}

impl Calibrator for PrecomputedCalibrator {
    fn calibrate(&mut self, cal_dir: &Path, frames: &[[PathBuf; 2]]) -> Result<CameraSystem> {
        let Some(source) = self.source.as_ref() else {
            bail!(
                "no calibration solver available; pass --camera-system to use precomputed geometry \
                 ({} target pairs are in {})",
                frames.len(),
                cal_dir.display()
            );
        };
        let missing: Vec<_> = frames
            .iter()
            .flatten()
            .filter(|p| !p.exists())
            .collect();
        if !missing.is_empty() {
            bail!("{} calibration images are missing, first {}", missing.len(), missing[0].display());
        }
        CameraSystem::load(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_system() -> CameraSystem {
        let cam = CameraIntrinsics {
            fx: 1200.0,
            fy: 1200.0,
            cx: 640.0,
            cy: 480.0,
            p1: 0.0001,
            p2: -0.0002,
        };
        CameraSystem {
            rms: 0.21,
            cameras: [cam, cam],
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [-60.0, 0.0, 0.0],
        }
    }

    #[test]
    fn geometry_uses_left_focal_length_and_baseline_norm() {
        let g = sample_system().stereo_geometry();
        assert_eq!(g.focal_px, 1200.0);
        assert_eq!(g.baseline_mm, 60.0);
    }

    #[test]
    fn save_then_load_preserves_system() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let path = dir.join(CAMERA_SYSTEM_FILE);
        sample_system().save(&path).unwrap();
        assert_eq!(CameraSystem::load(&path).unwrap(), sample_system());
    }

    #[test]
    fn zero_baseline_is_rejected() {
        let mut system = sample_system();
        system.translation = [0.0; 3];
        assert!(system.validate().is_err());
    }

    #[test]
    fn precomputed_calibrator_requires_a_source() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let err = PrecomputedCalibrator::new(None)
            .calibrate(dir, &[])
            .unwrap_err();
        assert!(err.to_string().contains("--camera-system"));
    }

    #[test]
    fn precomputed_calibrator_checks_captured_images() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let path = dir.join("system.json");
        sample_system().save(&path).unwrap();
        let frames = [[dir.join("Cal_0000_0.jpeg"), dir.join("Cal_0000_1.jpeg")]];
        let mut calibrator = PrecomputedCalibrator::new(Some(path));
        assert!(calibrator.calibrate(dir, &frames).is_err());

        for p in &frames[0] {
            std::fs::write(p, b"jpeg").unwrap();
        }
        assert_eq!(calibrator.calibrate(dir, &frames).unwrap(), sample_system());
    }

    #[test]
    fn report_lists_rotation_rows_and_principal_points() {
        let lines = sample_system().report();
        assert_eq!(lines[0], "rms error: 0.2100");
        assert_eq!(lines.iter().filter(|l| l.starts_with("R ")).count(), 3);
        assert!(lines.iter().any(|l| l.starts_with("camera 1: cx 640.00")));
    }
}
