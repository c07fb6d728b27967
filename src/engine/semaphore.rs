//! Counting semaphore used for the persistence/correlation handshake.
//!
//! `notify` adds one permit and wakes a single waiter; `wait` blocks until a
//! permit is available and takes it. Closing the semaphore cancels every
//! waiter that would otherwise block, which is how the pipeline shuts down
//! without killing threads.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("wait on `{0}` was cancelled")]
    Cancelled(&'static str),
    #[error("wait on `{0}` timed out")]
    TimedOut(&'static str),
}

struct Permits {
    count: usize,
    closed: bool,
}

pub struct Semaphore {
    name: &'static str,
    permits: Mutex<Permits>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(name: &'static str, count: usize) -> Self {
        Self {
            name,
            permits: Mutex::new(Permits {
                count,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Permits> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        let mut permits = self.lock();
        permits.count += 1;
        trace!(semaphore = self.name, count = permits.count, "notify");
        self.cv.notify_one();
    }

    /// Block until a permit is available. Returns `Cancelled` once the
    /// semaphore is closed and no permit is left.
    pub fn wait(&self) -> Result<(), WaitError> {
        let mut permits = self.lock();
        while permits.count == 0 {
            if permits.closed {
                return Err(WaitError::Cancelled(self.name));
            }
            trace!(semaphore = self.name, "wait");
            permits = self.cv.wait(permits).unwrap_or_else(PoisonError::into_inner);
            trace!(semaphore = self.name, "run");
        }
        permits.count -= 1;
        Ok(())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.lock();
        while permits.count == 0 {
            if permits.closed {
                return Err(WaitError::Cancelled(self.name));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::TimedOut(self.name));
            }
            let (guard, _) = self
                .cv
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            permits = guard;
        }
        permits.count -= 1;
        Ok(())
    }

    pub fn close(&self) {
        let mut permits = self.lock();
        permits.closed = true;
        trace!(semaphore = self.name, "close");
        self.cv.notify_all();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn wait_consumes_existing_permit() {
        let sem = Semaphore::new("test", 0);
        sem.notify();
        assert_eq!(sem.available(), 1);
        sem.wait().unwrap();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn wait_does_not_return_without_permit() {
        let sem = Semaphore::new("test", 0);
        assert_eq!(
            sem.wait_timeout(Duration::from_millis(30)),
            Err(WaitError::TimedOut("test"))
        );
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn each_notify_releases_exactly_one_waiter() {
        let sem = Arc::new(Semaphore::new("test", 0));
        let released = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sem = sem.clone();
                let released = released.clone();
                thread::spawn(move || {
                    sem.wait().unwrap();
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        sem.notify();
        assert!(wait_until(|| released.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        sem.notify();
        sem.notify();
        for w in waiters {
            w.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn producers_and_consumers_never_stall() {
        let sem = Arc::new(Semaphore::new("test", 0));
        let notifies = 64;
        let consumers = 8;
        let per_consumer = 6;

        let producer = {
            let sem = sem.clone();
            thread::spawn(move || {
                for _ in 0..notifies {
                    sem.notify();
                }
            })
        };
        let handles: Vec<_> = (0..consumers)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || {
                    for _ in 0..per_consumer {
                        sem.wait().unwrap();
                    }
                })
            })
            .collect();

        producer.join().unwrap();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sem.available(), notifies - consumers * per_consumer);
    }

    #[test]
    fn close_cancels_blocked_waiter() {
        let sem = Arc::new(Semaphore::new("read-complete", 0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait())
        };
        thread::sleep(Duration::from_millis(20));
        sem.close();
        assert_eq!(
            waiter.join().unwrap(),
            Err(WaitError::Cancelled("read-complete"))
        );
        assert!(sem.is_closed());
    }

    #[test]
    fn closed_semaphore_still_hands_out_remaining_permits() {
        let sem = Semaphore::new("test", 0);
        sem.notify();
        sem.close();
        assert!(sem.wait().is_ok());
        assert!(sem.wait().is_err());
    }
}
