//! Background dirty-page cleaner.
//!
//! One thread per pool, woken periodically or on demand, writing dirty
//! frames back through the same WAL- and dependency-respecting path as the
//! synchronous `force_*` calls. Stopping the cleaner does *not* flush; a
//! clean shutdown calls `force_all` explicitly after the cleaner is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::pool::BufferPool;

/// Handle to the cleaner thread.
pub struct Cleaner {
    stop: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl Cleaner {
    /// Spawn the cleaner, sweeping every `interval`.
    #[must_use]
    pub fn start(pool: Arc<BufferPool>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new((Mutex::new(false), Condvar::new()));

        let t_stop = Arc::clone(&stop);
        let t_wake = Arc::clone(&wake);
        let thread = std::thread::Builder::new()
            .name("basalt-cleaner".into())
            .spawn(move || {
                debug!(target: "basalt.bufpool", "cleaner started");
                loop {
                    {
                        let (lock, cv) = &*t_wake;
                        let mut woken = lock.lock();
                        if !*woken {
                            cv.wait_for(&mut woken, interval);
                        }
                        *woken = false;
                    }
                    if t_stop.load(Ordering::Acquire) {
                        break;
                    }
                    match pool.force_all() {
                        Ok(written) if written > 0 => {
                            debug!(target: "basalt.bufpool", written, "cleaner pass");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(target: "basalt.bufpool", error = %e, "cleaner pass failed");
                        }
                    }
                }
                debug!(target: "basalt.bufpool", "cleaner stopped");
            })
            .expect("spawn cleaner thread");

        Self { stop, wake, thread: Some(thread) }
    }

    /// Nudge the cleaner to run a pass now.
    pub fn wakeup(&self) {
        let (lock, cv) = &*self.wake;
        *lock.lock() = true;
        cv.notify_one();
    }

    /// Signal the thread to exit and join it. No final flush.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.wakeup();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleaner")
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}
