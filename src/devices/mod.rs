//! Hardware collaborators: cameras, actuator link, correlation and
//! calibration engines.

pub mod calibration;
pub mod capture;
pub mod dic;
pub mod serial;
pub mod synthetic;

use crate::model::{ActuatorSpec, CaptureSpec, SessionConfig};
use anyhow::{Context, Result};
use capture::{CaptureSource, DirectoryCapture, SideBySideCapture};
use dic::{BlockMatchConfig, BlockMatchCorrelator, Correlator};
use serial::{Actuator, DryRunActuator, SerialActuator, SimActuator};
use std::path::Path;
use synthetic::{SimStage, SpeckleCapture, SpeckleParams};

/// Collaborators opened for one session.
pub struct Rig {
    pub capture: Box<dyn CaptureSource>,
    pub actuator: Box<dyn Actuator>,
}

pub fn open_rig(cfg: &SessionConfig) -> Result<Rig> {
    // The simulated camera and actuator share one stage so scripted moves
    // show up in the next frame.
    let stage = SimStage::default();

    let capture: Box<dyn CaptureSource> = match &cfg.capture {
        CaptureSpec::Synthetic => Box::new(SpeckleCapture::new(
            SpeckleParams::new(cfg.width, cfg.height, cfg.seed),
            stage.clone(),
            cfg.frame_interval,
        )),
        CaptureSpec::Directory(dir) => Box::new(
            DirectoryCapture::open(dir, cfg.frame_interval)
                .with_context(|| format!("open frame directory {}", dir.display()))?,
        ),
        CaptureSpec::SideBySide(dir) => Box::new(
            SideBySideCapture::open(dir, cfg.frame_interval)
                .with_context(|| format!("open side-by-side directory {}", dir.display()))?,
        ),
    };

    let actuator: Box<dyn Actuator> = match &cfg.actuator {
        ActuatorSpec::DryRun => Box::new(DryRunActuator::default()),
        ActuatorSpec::Sim => Box::new(SimActuator::new(stage.clone())),
        ActuatorSpec::Device(path) => Box::new(
            SerialActuator::open(path)
                .with_context(|| format!("open serial device {}", path.display()))?,
        ),
    };

    tracing::info!(
        capture = %capture.describe(),
        actuator = %actuator.describe(),
        "rig opened"
    );
    Ok(Rig { capture, actuator })
}

pub fn block_matcher(cfg: &SessionConfig, solutions_dir: Option<&Path>) -> Box<dyn Correlator> {
    Box::new(BlockMatchCorrelator::new(BlockMatchConfig {
        subset_size: cfg.subset_size,
        step: cfg.subset_step,
        search_radius: cfg.search_radius,
        disparity_range: cfg.disparity_range,
        roi_margin: cfg.roi_margin,
        max_residual: cfg.max_residual,
        output_dir: solutions_dir.map(Path::to_path_buf),
    }))
}
