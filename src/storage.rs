//! Output directory layout and JSON exports.

use crate::model::RunSummary;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const SUMMARY_FILE: &str = "summary.json";
pub const LOG_FILE: &str = "session.log";

/// Per-session output tree, rooted at `<output>/<session id>`.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub root: PathBuf,
    /// Frame pairs committed while running.
    pub frames: PathBuf,
    /// Operator snapshots.
    pub test_files: PathBuf,
    pub cal_files: PathBuf,
    pub solutions: PathBuf,
}

impl SessionPaths {
    pub fn new(output_root: &Path, session_id: &str) -> Self {
        let root = output_root.join(session_id);
        Self {
            frames: root.join("frames"),
            test_files: root.join("test_files"),
            cal_files: root.join("cal_files"),
            solutions: root.join("solutions"),
            root,
        }
    }

    pub fn create(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.frames,
            &self.test_files,
            &self.cal_files,
            &self.solutions,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create output directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn summary(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }

    pub fn log(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    pub fn camera_system(&self) -> PathBuf {
        self.root.join(crate::devices::calibration::CAMERA_SYSTEM_FILE)
    }
}

fn base_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dic-rig")
}

pub fn default_output_root() -> PathBuf {
    base_dir().join("sessions")
}

pub fn export_json(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("create export directory")?;
    }
    let data = serde_json::to_vec_pretty(summary)?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
