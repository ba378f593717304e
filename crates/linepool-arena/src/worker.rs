//! Background defragmentation thread.
//!
//! The worker wakes every `defrag_interval`, sleeping in `defrag_poll_step`
//! increments so a stop request is seen quickly. Each wake it scans the
//! blocks under a shared lock. In [`DefragDispatch::OwnerThread`] mode it only
//! queues the keys it found for the owning thread, skipping keys still
//! waiting to be drained; in
//! [`DefragDispatch::Worker`] mode it takes the exclusive lock once per block
//! and compacts that block itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use linepool_core::{ArenaConfig, DefragDispatch};
use linepool_gpu::LineBackend;
use tracing::{debug, error, info};

use crate::block::BlockKey;
use crate::error::{ArenaError, Result};
use crate::state::Shared;

/// Handle to the running defrag thread.
pub(crate) struct DefragWorkerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DefragWorkerHandle {
    pub(crate) fn spawn<B: LineBackend>(
        shared: Arc<Shared<B>>,
        config: &ArenaConfig,
        requests: Sender<BlockKey>,
        errors: Sender<ArenaError>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let schedule = Schedule {
            interval: config.defrag_interval(),
            poll_step: config.defrag_poll_step(),
            dispatch: config.defrag_dispatch,
        };

        let thread = thread::Builder::new()
            .name("linepool-defrag".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                move || worker_loop(&shared, &schedule, &stop, &requests, &errors)
            })?;

        info!(
            interval_ms = config.defrag_interval_ms,
            dispatch = ?config.defrag_dispatch,
            "Defrag worker started"
        );
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it to finish.
    pub(crate) fn shutdown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(()) => {
                info!("Defrag worker stopped");
                Ok(())
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!(%message, "Defrag worker panicked");
                Err(ArenaError::WorkerPanicked(message))
            }
        }
    }
}

impl Drop for DefragWorkerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

struct Schedule {
    interval: Duration,
    poll_step: Duration,
    dispatch: DefragDispatch,
}

fn worker_loop<B: LineBackend>(
    shared: &Shared<B>,
    schedule: &Schedule,
    stop: &AtomicBool,
    requests: &Sender<BlockKey>,
    errors: &Sender<ArenaError>,
) {
    while sleep_unless_stopped(schedule, stop) {
        let candidates = shared.state.read().compaction_candidates();
        if candidates.is_empty() {
            continue;
        }
        debug!(blocks = candidates.len(), "Defrag scan found work");

        match schedule.dispatch {
            DefragDispatch::OwnerThread => {
                for key in candidates {
                    if !shared.queued.lock().insert(key) {
                        continue;
                    }
                    if requests.send(key).is_err() {
                        // Manager gone
                        return;
                    }
                }
            }
            DefragDispatch::Worker => {
                for key in candidates {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    let result = shared.state.write().compact_if_wanted(&shared.backend, key);
                    if let Err(e) = result {
                        error!(block = ?key, error = %e, "Background compaction failed");
                        if errors.send(e).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Sleep one interval in poll-step increments. Returns false once stopped.
fn sleep_unless_stopped(schedule: &Schedule, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + schedule.interval;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(schedule.poll_step.min(deadline - now));
    }
}
