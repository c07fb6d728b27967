//! Stereo capture sources.

use image::{GrayImage, ImageError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Left/right images captured for one measurement cycle.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub left: GrayImage,
    pub right: GrayImage,
    pub captured_at: Instant,
}

impl FramePair {
    pub fn new(left: GrayImage, right: GrayImage) -> Result<Self, CaptureError> {
        if left.dimensions() != right.dimensions() {
            return Err(CaptureError::SizeMismatch {
                left: left.dimensions(),
                right: right.dimensions(),
            });
        }
        Ok(Self {
            left,
            right,
            captured_at: Instant::now(),
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.left.dimensions()
    }

    pub fn mean_intensity(&self) -> f64 {
        let n = self.left.as_raw().len();
        if n == 0 {
            return 0.0;
        }
        self.left.as_raw().iter().map(|&p| p as f64).sum::<f64>() / n as f64
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("end of stream")]
    EndOfStream,
    #[error("failed to open capture source {uri:?}")]
    Open { uri: String },
    #[error("left/right frames differ in size: {left:?} vs {right:?}")]
    SizeMismatch { left: (u32, u32), right: (u32, u32) },
    #[error("failed to decode {}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Produces a new frame pair on demand, blocking until one is available.
pub trait CaptureSource: Send {
    fn next_frame_pair(&mut self) -> Result<FramePair, CaptureError>;
    fn describe(&self) -> String;
}

/// Holds a source to a fixed frame cadence.
#[derive(Debug)]
pub(crate) struct Pacer {
    interval: Duration,
    next: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    pub(crate) fn wait(&mut self) {
        let now = Instant::now();
        if let Some(next) = self.next {
            if next > now {
                std::thread::sleep(next - now);
            }
        }
        let base = self.next.map_or(now, |n| n.max(now));
        self.next = Some(base + self.interval);
    }
}

fn load_gray(path: &Path) -> Result<GrayImage, CaptureError> {
    let img = image::open(path).map_err(|source| CaptureError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(img.to_luma8())
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("jpeg" | "jpg" | "png" | "tif" | "tiff")
    )
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, CaptureError> {
    let entries = std::fs::read_dir(dir).map_err(|_| CaptureError::Open {
        uri: dir.display().to_string(),
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Pair up `<stem>_0.<ext>` with `<stem>_1.<ext>` siblings.
fn pair_images(paths: &[PathBuf]) -> Vec<(PathBuf, PathBuf)> {
    paths
        .iter()
        .filter_map(|left| {
            let stem = left.file_stem()?.to_str()?;
            let base = stem.strip_suffix("_0")?;
            let ext = left.extension()?.to_str()?;
            let right = left.with_file_name(format!("{base}_1.{ext}"));
            paths.contains(&right).then(|| (left.clone(), right))
        })
        .collect()
}

/// Replays persisted frame pairs (`Img_0000_0.jpeg`, `Img_0000_1.jpeg`, ...).
pub struct DirectoryCapture {
    dir: PathBuf,
    pairs: Vec<(PathBuf, PathBuf)>,
    cursor: usize,
    pacer: Pacer,
}

impl DirectoryCapture {
    pub fn open(dir: &Path, frame_interval: Duration) -> Result<Self, CaptureError> {
        let pairs = pair_images(&list_images(dir)?);
        if pairs.is_empty() {
            return Err(CaptureError::Open {
                uri: dir.display().to_string(),
            });
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            pairs,
            cursor: 0,
            pacer: Pacer::new(frame_interval),
        })
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }
}

impl CaptureSource for DirectoryCapture {
    fn next_frame_pair(&mut self) -> Result<FramePair, CaptureError> {
        let Some((left, right)) = self.pairs.get(self.cursor) else {
            return Err(CaptureError::EndOfStream);
        };
        self.pacer.wait();
        let pair = FramePair::new(load_gray(left)?, load_gray(right)?)?;
        self.cursor += 1;
        Ok(pair)
    }

    fn describe(&self) -> String {
        format!("directory {} ({} pairs)", self.dir.display(), self.pair_count())
    }
}

/// Splits side-by-side stereo images into left and right halves.
pub struct SideBySideCapture {
    dir: PathBuf,
    images: Vec<PathBuf>,
    cursor: usize,
    pacer: Pacer,
}

impl SideBySideCapture {
    pub fn open(dir: &Path, frame_interval: Duration) -> Result<Self, CaptureError> {
        let images = list_images(dir)?;
        if images.is_empty() {
            return Err(CaptureError::Open {
                uri: dir.display().to_string(),
            });
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            images,
            cursor: 0,
            pacer: Pacer::new(frame_interval),
        })
    }
}

pub(crate) fn split_side_by_side(combined: &GrayImage) -> Result<FramePair, CaptureError> {
    let (w, h) = combined.dimensions();
    let half = w / 2;
    let left = image::imageops::crop_imm(combined, 0, 0, half, h).to_image();
    let right = image::imageops::crop_imm(combined, half, 0, half, h).to_image();
    FramePair::new(left, right)
}

impl CaptureSource for SideBySideCapture {
    fn next_frame_pair(&mut self) -> Result<FramePair, CaptureError> {
        let Some(path) = self.images.get(self.cursor) else {
            return Err(CaptureError::EndOfStream);
        };
        self.pacer.wait();
        let pair = split_side_by_side(&load_gray(path)?)?;
        self.cursor += 1;
        Ok(pair)
    }

    fn describe(&self) -> String {
        format!(
            "side-by-side {} ({} images)",
            self.dir.display(),
            self.images.len()
        )
    }
}
