//! Shared frame slot plus the read-complete / write-complete handshake.
//!
//! Acquisition publishes into the slot without ever blocking. Persistence
//! waits on `read-complete`, snapshots the slot, writes the pair to disk and
//! commits it, then notifies `write-complete`. The session waits on
//! `write-complete`, correlates the committed frame and re-arms persistence
//! by notifying `read-complete`.

use super::semaphore::{Semaphore, WaitError};
use crate::devices::capture::FramePair;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A frame pair as handed from persistence to correlation.
#[derive(Debug, Clone)]
pub struct CommittedFrame {
    pub index: u64,
    pub pair: Arc<FramePair>,
    /// Left/right files on disk, `None` when the write failed or was skipped.
    pub paths: Option<[PathBuf; 2]>,
}

struct Slot {
    sequence: u64,
    pair: Arc<FramePair>,
    closed: bool,
}

pub struct FrameExchange {
    slot: Mutex<Slot>,
    published: Condvar,
    committed: Mutex<Option<CommittedFrame>>,
    read_complete: Semaphore,
    write_complete: Semaphore,
}

impl FrameExchange {
    /// `initial` occupies the slot as sequence 0 so readers always have a
    /// frame to look at.
    pub fn new(initial: FramePair) -> Self {
        Self {
            slot: Mutex::new(Slot {
                sequence: 0,
                pair: Arc::new(initial),
                closed: false,
            }),
            published: Condvar::new(),
            committed: Mutex::new(None),
            read_complete: Semaphore::new("read-complete", 0),
            write_complete: Semaphore::new("write-complete", 0),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the slot contents. Never waits on a consumer.
    pub fn publish(&self, pair: FramePair) -> u64 {
        let pair = Arc::new(pair);
        let mut slot = self.slot();
        slot.sequence += 1;
        slot.pair = pair;
        self.published.notify_all();
        slot.sequence
    }

    pub fn latest(&self) -> (u64, Arc<FramePair>) {
        let slot = self.slot();
        (slot.sequence, slot.pair.clone())
    }

    /// Persistence side: wait to be armed, then for a frame newer than
    /// `after`. Returns the snapshot and its sequence.
    pub fn begin_write(&self, after: u64) -> Result<(u64, Arc<FramePair>), WaitError> {
        self.read_complete.wait()?;
        let mut slot = self.slot();
        while slot.sequence <= after {
            if slot.closed {
                return Err(WaitError::Cancelled("frame-slot"));
            }
            slot = self
                .published
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok((slot.sequence, slot.pair.clone()))
    }

    pub fn commit(&self, frame: CommittedFrame) {
        *self
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(frame);
        self.write_complete.notify();
    }

    /// Correlation side: block until persistence commits a frame, or at
    /// most `timeout` when one is given.
    pub fn acquire_snapshot(&self, timeout: Option<Duration>) -> Result<CommittedFrame, WaitError> {
        match timeout {
            Some(timeout) => self.write_complete.wait_timeout(timeout)?,
            None => self.write_complete.wait()?,
        }
        self.take_committed()
    }

    fn take_committed(&self) -> Result<CommittedFrame, WaitError> {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(WaitError::Cancelled("write-complete"))
    }

    /// Re-arm persistence for the next frame.
    pub fn release(&self) {
        self.read_complete.notify();
    }

    /// Acquisition has stopped for good. Persistence still commits the
    /// newest frame if it has not seen it yet, then finds the slot closed.
    pub fn end_of_stream(&self) {
        self.slot().closed = true;
        self.published.notify_all();
    }

    /// Cancel every pending and future wait.
    pub fn close(&self) {
        self.slot().closed = true;
        self.published.notify_all();
        self.read_complete.close();
        self.write_complete.close();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.slot().closed
    }
}
