pub mod acquisition;
pub mod correlation;
pub mod exchange;
pub mod persistence;
pub mod semaphore;

use crate::devices::capture::{CaptureSource, FramePair};
use crate::model::SessionEvent;
use acquisition::{AcquisitionExit, StopReason};
use anyhow::{anyhow, Context, Result};
use exchange::{CommittedFrame, FrameExchange};
use persistence::FrameSink;
use semaphore::WaitError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// What the worker threads hand back when the pipeline is torn down.
pub struct PipelineExit {
    pub source: Box<dyn CaptureSource>,
    pub sink: Box<dyn FrameSink>,
    pub reason: StopReason,
    pub published: u64,
}

/// Acquisition and persistence threads around one [`FrameExchange`].
pub struct Pipeline {
    exchange: Arc<FrameExchange>,
    running: Arc<AtomicBool>,
    acquisition: Option<JoinHandle<AcquisitionExit>>,
    persistence: Option<JoinHandle<Box<dyn FrameSink>>>,
}

impl Pipeline {
    /// Spawn both workers and arm persistence for the first frame.
    /// `reference` seeds the frame slot and is never committed itself.
    pub fn start(
        source: Box<dyn CaptureSource>,
        sink: Box<dyn FrameSink>,
        reference: FramePair,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let exchange = Arc::new(FrameExchange::new(reference));
        let running = Arc::new(AtomicBool::new(true));

        let persistence = persistence::spawn(sink, exchange.clone(), running.clone(), events)
            .context("spawn persistence thread")?;
        let mut pipeline = Self {
            exchange: exchange.clone(),
            running: running.clone(),
            acquisition: None,
            persistence: Some(persistence),
        };
        let acquisition = acquisition::spawn(source, exchange, running)
            .context("spawn acquisition thread")?;
        pipeline.acquisition = Some(acquisition);

        pipeline.exchange.release();
        info!("pipeline armed");
        Ok(pipeline)
    }

    /// Wait for the next committed frame. `TimedOut` leaves the pipeline
    /// untouched; `Cancelled` means capture has ended.
    pub fn next_frame(&self, timeout: Duration) -> Result<CommittedFrame, WaitError> {
        self.exchange.acquire_snapshot(Some(timeout))
    }

    /// Re-arm persistence once the current frame is fully processed.
    pub fn release(&self) {
        self.exchange.release();
    }

    pub fn latest(&self) -> (u64, Arc<FramePair>) {
        self.exchange.latest()
    }

    fn signal_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.exchange.close();
    }

    /// Stop both workers, join them and reclaim the camera and sink.
    pub fn shutdown(mut self) -> Result<PipelineExit> {
        self.signal_stop();
        let acquisition = self
            .acquisition
            .take()
            .ok_or_else(|| anyhow!("acquisition thread already joined"))?
            .join()
            .map_err(|_| anyhow!("acquisition thread panicked"))?;
        let sink = self
            .persistence
            .take()
            .ok_or_else(|| anyhow!("persistence thread already joined"))?
            .join()
            .map_err(|_| anyhow!("persistence thread panicked"))?;
        info!(reason = %acquisition.reason.describe(), "pipeline shut down");
        Ok(PipelineExit {
            source: acquisition.source,
            sink,
            reason: acquisition.reason,
            published: acquisition.published,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.signal_stop();
    }
}
