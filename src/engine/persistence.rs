use super::exchange::{CommittedFrame, FrameExchange};
use crate::devices::capture::FramePair;
use crate::model::{InfoEvent, SessionEvent};
use anyhow::{Context, Result};
use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// `<prefix>_<index:04>_0.jpeg` and `<prefix>_<index:04>_1.jpeg` under `dir`.
pub fn pair_paths(dir: &Path, prefix: &str, index: u64) -> [PathBuf; 2] {
    [
        dir.join(format!("{prefix}_{index:04}_0.jpeg")),
        dir.join(format!("{prefix}_{index:04}_1.jpeg")),
    ]
}

pub fn write_jpeg_pair(paths: &[PathBuf; 2], pair: &FramePair) -> Result<()> {
    for (path, img) in paths.iter().zip([&pair.left, &pair.right]) {
        img.save_with_format(path, ImageFormat::Jpeg)
            .with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

/// Storage for committed frame pairs.
pub trait FrameSink: Send {
    /// Returns the written paths, or `None` when the sink keeps nothing.
    fn write_pair(&mut self, index: u64, pair: &FramePair) -> Result<Option<[PathBuf; 2]>>;
}

pub struct JpegFrameSink {
    dir: PathBuf,
}

impl JpegFrameSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl FrameSink for JpegFrameSink {
    fn write_pair(&mut self, index: u64, pair: &FramePair) -> Result<Option<[PathBuf; 2]>> {
        let paths = pair_paths(&self.dir, "Img", index);
        write_jpeg_pair(&paths, pair)?;
        Ok(Some(paths))
    }
}

/// Commits frames without touching the disk (`--no-persist`).
pub struct DiscardFrames;

impl FrameSink for DiscardFrames {
    fn write_pair(&mut self, _index: u64, _pair: &FramePair) -> Result<Option<[PathBuf; 2]>> {
        Ok(None)
    }
}

pub(crate) fn spawn(
    mut sink: Box<dyn FrameSink>,
    exchange: Arc<FrameExchange>,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> std::io::Result<JoinHandle<Box<dyn FrameSink>>> {
    std::thread::Builder::new()
        .name("persistence".into())
        .spawn(move || {
            let mut index = 0u64;
            let mut last_sequence = 0u64;
            loop {
                let (sequence, pair) = match exchange.begin_write(last_sequence) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        debug!(error = %e, "persistence released");
                        break;
                    }
                };
                if !running.load(Ordering::Acquire) {
                    break;
                }
                last_sequence = sequence;
                let paths = match sink.write_pair(index, &pair) {
                    Ok(paths) => paths,
                    Err(e) => {
                        warn!(index, error = %e, "frame write failed");
                        let _ = events.send(SessionEvent::Info(InfoEvent::FrameWriteFailed {
                            index,
                            error: format!("{e:#}"),
                        }));
                        None
                    }
                };
                exchange.commit(CommittedFrame { index, pair, paths });
                index += 1;
            }
            // The session drains the last commit before seeing the close.
            exchange.close();
            info!(committed = index, "persistence stopped");
            sink
        })
}
