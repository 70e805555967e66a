// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! The three thread-backed pools behind [`super::TaskDispatcher`].
//!
//! - [`IoPool`]: multi-thread tokio runtime, `core` async workers, up to `max`
//!   blocking threads reclaimed after the keep-alive window, and a semaphore
//!   bounding running + queued work
//! - [`CpuPool`]: fixed-size tokio runtime; closures run directly on its
//!   worker threads
//! - [`SequentialPool`]: one OS thread draining a FIFO channel
//!
//! Dropping a pool never blocks: runtimes are released with
//! `shutdown_background`, which is safe inside async contexts. Bounded,
//! cooperative termination goes through the `shutdown` methods instead.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::DispatchError;
use crate::config::PoolConfig;

/// Time given to blocking threads after the cooperative phase is over.
const FORCE_STOP_TIMEOUT: Duration = Duration::from_millis(250);

pub(crate) type SequentialJob = Box<dyn FnOnce() + Send + 'static>;

/// Wait for `tracker` to drain, then force the runtime down.
///
/// Returns `true` when everything finished inside `grace`.
fn stop_runtime(runtime: Runtime, tracker: &TaskTracker, grace: Duration) -> bool {
    tracker.close();
    let drained = runtime.block_on(async {
        tokio::time::timeout(grace, tracker.wait()).await.is_ok()
    });
    runtime.shutdown_timeout(FORCE_STOP_TIMEOUT);
    drained
}

// =============================================================================
// I/O Pool
// =============================================================================

pub(crate) struct IoPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl IoPool {
    pub(crate) fn new(config: &PoolConfig) -> Result<Self, DispatchError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.io_core_threads)
            .max_blocking_threads(config.io_max_threads)
            .thread_keep_alive(config.io_keep_alive)
            .thread_name("wallet-io")
            .enable_all()
            .build()
            .map_err(|e| DispatchError::Build(format!("io pool: {e}")))?;

        let capacity = config.io_max_threads + config.io_queue_capacity;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    fn admit(&self) -> Result<OwnedSemaphorePermit, DispatchError> {
        if self.tracker.is_closed() {
            return Err(DispatchError::Stopped);
        }
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| DispatchError::Saturated {
                pool: "io",
                capacity: self.capacity,
            })
    }

    pub(crate) fn spawn<F>(&self, work: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.admit()?;
        self.handle.spawn(self.tracker.track_future(async move {
            let _permit = permit;
            work.await;
        }));
        Ok(())
    }

    pub(crate) fn spawn_blocking<F>(&self, work: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = self.admit()?;
        let handle = self.handle.clone();
        self.handle.spawn(self.tracker.track_future(async move {
            let _permit = permit;
            if let Err(e) = handle.spawn_blocking(work).await {
                warn!(error = %e, "Blocking I/O task aborted");
            }
        }));
        Ok(())
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub(crate) fn shutdown(&self, grace: Duration) -> bool {
        let runtime = self.runtime.lock().ok().and_then(|mut rt| rt.take());
        match runtime {
            Some(runtime) => stop_runtime(runtime, &self.tracker, grace),
            None => true,
        }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().ok().and_then(Option::take) {
            runtime.shutdown_background();
        }
    }
}

// =============================================================================
// CPU Pool
// =============================================================================

pub(crate) struct CpuPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    tracker: TaskTracker,
}

impl CpuPool {
    pub(crate) fn new(config: &PoolConfig) -> Result<Self, DispatchError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.cpu_threads)
            .thread_name("wallet-cpu")
            .enable_time()
            .build()
            .map_err(|e| DispatchError::Build(format!("cpu pool: {e}")))?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            tracker: TaskTracker::new(),
        })
    }

    pub(crate) fn spawn<F>(&self, work: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(DispatchError::Stopped);
        }
        self.handle
            .spawn(self.tracker.track_future(async move { work() }));
        Ok(())
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub(crate) fn shutdown(&self, grace: Duration) -> bool {
        let runtime = self.runtime.lock().ok().and_then(|mut rt| rt.take());
        match runtime {
            Some(runtime) => stop_runtime(runtime, &self.tracker, grace),
            None => true,
        }
    }
}

impl Drop for CpuPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().ok().and_then(Option::take) {
            runtime.shutdown_background();
        }
    }
}

// =============================================================================
// Sequential Pool
// =============================================================================

/// Exactly one worker thread; jobs run in submission order.
pub(crate) struct SequentialPool {
    sender: Mutex<Option<std_mpsc::Sender<SequentialJob>>>,
    done: Mutex<Option<std_mpsc::Receiver<()>>>,
    pending: Arc<AtomicUsize>,
    force_stop: CancellationToken,
}

impl SequentialPool {
    pub(crate) fn new() -> Result<Self, DispatchError> {
        let (sender, receiver) = std_mpsc::channel::<SequentialJob>();
        let (done_tx, done_rx) = std_mpsc::channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let force_stop = CancellationToken::new();

        {
            let pending = Arc::clone(&pending);
            let force_stop = force_stop.clone();
            thread::Builder::new()
                .name("wallet-seq".to_string())
                .spawn(move || {
                    let mut skipped = 0usize;
                    while let Ok(job) = receiver.recv() {
                        pending.fetch_sub(1, Ordering::AcqRel);
                        if force_stop.is_cancelled() {
                            skipped += 1;
                            continue;
                        }
                        job();
                    }
                    if skipped > 0 {
                        warn!(skipped, "Sequential pool dropped queued jobs on forced stop");
                    }
                    debug!("Sequential worker exiting");
                    let _ = done_tx.send(());
                })
                .map_err(|e| DispatchError::Build(format!("sequential pool: {e}")))?;
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            done: Mutex::new(Some(done_rx)),
            pending,
            force_stop,
        })
    }

    pub(crate) fn submit(&self, job: SequentialJob) -> Result<(), DispatchError> {
        let guard = self.sender.lock().map_err(|_| DispatchError::Stopped)?;
        let sender = guard.as_ref().ok_or(DispatchError::Stopped)?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        sender.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            DispatchError::Stopped
        })
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Close the queue, let the worker drain it, skip whatever is left after
    /// `grace`.
    pub(crate) fn shutdown(&self, grace: Duration) -> bool {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let Some(done) = self.done.lock().ok().and_then(|mut d| d.take()) else {
            return true;
        };

        let deadline = Instant::now() + grace;
        match done.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => true,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                self.force_stop.cancel();
                false
            }
        }
    }
}

impl Drop for SequentialPool {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish the backlog and exit.
        if let Ok(sender) = self.sender.get_mut() {
            sender.take();
        }
    }
}
