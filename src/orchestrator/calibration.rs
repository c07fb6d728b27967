//! Operator-driven calibration: collect target frame pairs, then solve the
//! camera system on a worker thread that the session polls once per tick.

use crate::devices::calibration::{CameraSystem, Calibrator};
use crate::devices::capture::FramePair;
use crate::engine::persistence::{pair_paths, write_jpeg_pair};
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tracing::info;

type Solved = (Box<dyn Calibrator>, Result<CameraSystem>);

pub(crate) struct CalibrationRun {
    dir: PathBuf,
    required: usize,
    frames: Vec<[PathBuf; 2]>,
    worker: Option<JoinHandle<Solved>>,
}

impl CalibrationRun {
    pub(crate) fn new(dir: &Path, required: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            required: required.max(1),
            frames: Vec::new(),
            worker: None,
        }
    }

    pub(crate) fn captured(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn required(&self) -> usize {
        self.required
    }

    pub(crate) fn is_collecting(&self) -> bool {
        self.worker.is_none() && self.frames.len() < self.required
    }

    pub(crate) fn is_solving(&self) -> bool {
        self.worker.is_some()
    }

    /// Save `pair` as the next `Cal_<n>` target image pair.
    pub(crate) fn capture(&mut self, pair: &FramePair) -> Result<usize> {
        let paths = pair_paths(&self.dir, "Cal", self.frames.len() as u64);
        write_jpeg_pair(&paths, pair)?;
        info!(index = self.frames.len(), "calibration frame saved");
        self.frames.push(paths);
        Ok(self.frames.len())
    }

    pub(crate) fn start(&mut self, mut calibrator: Box<dyn Calibrator>) -> Result<()> {
        let dir = self.dir.clone();
        let frames = self.frames.clone();
        let handle = std::thread::Builder::new()
            .name("calibration".into())
            .spawn(move || {
                let result = calibrator.calibrate(&dir, &frames);
                (calibrator, result)
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Non-blocking; returns the solver output once the worker is done.
    pub(crate) fn poll(&mut self) -> Option<Result<Solved>> {
        if !self.worker.as_ref()?.is_finished() {
            return None;
        }
        let handle = self.worker.take()?;
        Some(
            handle
                .join()
                .map_err(|_| anyhow!("calibration thread panicked")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::calibration::PrecomputedCalibrator;
    use image::GrayImage;
    use std::time::{Duration, Instant};

    #[test]
    fn collects_required_frames_then_solves_off_thread() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let img = GrayImage::new(16, 12);
        let pair = FramePair::new(img.clone(), img).unwrap();

        let mut run = CalibrationRun::new(dir, 2);
        assert!(run.is_collecting());
        assert_eq!(run.capture(&pair).unwrap(), 1);
        assert_eq!(run.capture(&pair).unwrap(), 2);
        assert!(!run.is_collecting());
        assert!(dir.join("Cal_0001_1.jpeg").exists());

        run.start(Box::new(PrecomputedCalibrator::new(None))).unwrap();
        assert!(run.is_solving());
        let deadline = Instant::now() + Duration::from_secs(2);
        let solved = loop {
            if let Some(done) = run.poll() {
                break done;
            }
            assert!(Instant::now() < deadline, "calibration never finished");
            std::thread::sleep(Duration::from_millis(5));
        };
        let (_, result) = solved.unwrap();
        // Without precomputed geometry the solver reports a setup error.
        assert!(result.is_err());
        assert!(!run.is_solving());
    }
}
