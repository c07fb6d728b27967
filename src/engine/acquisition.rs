use super::exchange::FrameExchange;
use crate::devices::capture::{CaptureError, CaptureSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Stopped,
    EndOfStream,
    Failed(String),
}

impl StopReason {
    pub fn describe(&self) -> String {
        match self {
            StopReason::Stopped => "stopped".into(),
            StopReason::EndOfStream => "end of stream".into(),
            StopReason::Failed(e) => format!("capture failed: {e}"),
        }
    }
}

/// Returned when the acquisition thread exits; hands the camera back.
pub struct AcquisitionExit {
    pub source: Box<dyn CaptureSource>,
    pub reason: StopReason,
    pub published: u64,
}

pub(crate) fn spawn(
    mut source: Box<dyn CaptureSource>,
    exchange: Arc<FrameExchange>,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<AcquisitionExit>> {
    std::thread::Builder::new()
        .name("acquisition".into())
        .spawn(move || {
            let mut published = 0u64;
            let reason = loop {
                if !running.load(Ordering::Acquire) {
                    break StopReason::Stopped;
                }
                match source.next_frame_pair() {
                    Ok(pair) => {
                        let seq = exchange.publish(pair);
                        published += 1;
                        debug!(seq, "frame published");
                    }
                    Err(CaptureError::EndOfStream) => break StopReason::EndOfStream,
                    Err(e) => {
                        warn!(error = %e, "capture failed");
                        break StopReason::Failed(e.to_string());
                    }
                }
            };
            if reason != StopReason::Stopped {
                // Nothing more will be published. Persistence closes the
                // rest of the exchange once it has committed what it has.
                exchange.end_of_stream();
            }
            info!(published, reason = %reason.describe(), "acquisition stopped");
            AcquisitionExit {
                source,
                reason,
                published,
            }
        })
}
