// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Task Dispatcher
//!
//! Categorized execution for background work:
//!
//! | Pool | Sizing | Use |
//! |------|--------|-----|
//! | I/O | core `max(2, min(N-1, 4))`, max `2N+1`, bounded queue | network calls, store reads |
//! | CPU | fixed `max(1, N/2)` | decoding, reconciliation |
//! | Sequential | one thread | persistent-store writes, in submission order |
//! | UI | injected [`UiExecutor`] | subscriber callbacks |
//!
//! Every unit of work is wrapped: an instrumentation span named
//! `<pool>:<name>` is opened, the work runs, any error or panic is logged and
//! swallowed so siblings are unaffected, the span closes, and a warning is
//! emitted when the run exceeds the slow-task threshold.
//!
//! Submissions are never dropped silently: they either run or return a
//! [`DispatchError`].
//!
//! ## Shutdown
//!
//! [`TaskDispatcher::shutdown`] stops accepting work, waits up to the grace
//! period for running and queued work to finish, then force-cancels the rest.
//! It blocks, so async callers must run it through `spawn_blocking`.

mod pools;
pub mod ui;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::error::SyncError;
use crate::instrumentation::Instrumentation;
use pools::{CpuPool, IoPool, SequentialPool};
pub use ui::{ChannelUiExecutor, InlineUiExecutor, UiExecutor, UiJob, UiLoop};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("{pool} pool saturated ({capacity} running or queued)")]
    Saturated { pool: &'static str, capacity: usize },

    #[error("dispatcher is shut down")]
    Stopped,

    #[error("failed to build pool: {0}")]
    Build(String),
}

impl From<DispatchError> for SyncError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Stopped => SyncError::Shutdown,
            other => SyncError::Dispatch(other.to_string()),
        }
    }
}

/// Pool occupancy, for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DispatcherStatus {
    pub io_core_threads: usize,
    pub io_max_threads: usize,
    pub io_queue_capacity: usize,
    pub io_in_flight: usize,
    pub cpu_threads: usize,
    pub cpu_in_flight: usize,
    pub sequential_pending: usize,
    pub stopped: bool,
}

/// Which pools finished inside the grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub io_drained: bool,
    pub cpu_drained: bool,
    pub sequential_drained: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.io_drained && self.cpu_drained && self.sequential_drained
    }
}

pub struct TaskDispatcher {
    io: IoPool,
    cpu: CpuPool,
    sequential: SequentialPool,
    ui: Arc<dyn UiExecutor>,
    instrumentation: Arc<Instrumentation>,
    config: PoolConfig,
    stopped: AtomicBool,
}

impl TaskDispatcher {
    pub fn new(
        config: PoolConfig,
        instrumentation: Arc<Instrumentation>,
        ui: Arc<dyn UiExecutor>,
    ) -> Result<Self, DispatchError> {
        let dispatcher = Self {
            io: IoPool::new(&config)?,
            cpu: CpuPool::new(&config)?,
            sequential: SequentialPool::new()?,
            ui,
            instrumentation,
            config,
            stopped: AtomicBool::new(false),
        };
        info!(
            io_core = dispatcher.config.io_core_threads,
            io_max = dispatcher.config.io_max_threads,
            cpu = dispatcher.config.cpu_threads,
            "Task dispatcher initialized"
        );
        Ok(dispatcher)
    }

    /// Headless dispatcher sized for the current machine.
    pub fn with_defaults(instrumentation: Arc<Instrumentation>) -> Result<Self, DispatchError> {
        Self::new(PoolConfig::default(), instrumentation, Arc::new(InlineUiExecutor))
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }

    fn check_running(&self) -> Result<(), DispatchError> {
        if self.stopped.load(Ordering::Acquire) {
            Err(DispatchError::Stopped)
        } else {
            Ok(())
        }
    }

    fn wrapper(&self, pool: &str, name: &str) -> TaskWrapper {
        TaskWrapper {
            name: format!("{pool}:{name}"),
            instrumentation: Arc::clone(&self.instrumentation),
            slow_threshold: self.config.slow_task_threshold,
        }
    }

    /// Run an async unit of work on the I/O pool.
    pub fn spawn_io<F, E>(&self, name: &str, work: F) -> Result<(), DispatchError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.check_running()?;
        let wrapper = self.wrapper("io", name);
        self.io.spawn(wrapper.run_async(work))
    }

    /// Run a blocking closure on the I/O pool's elastic blocking threads.
    pub fn spawn_io_blocking<F, E>(&self, name: &str, work: F) -> Result<(), DispatchError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        self.check_running()?;
        let wrapper = self.wrapper("io", name);
        self.io.spawn_blocking(move || wrapper.run_sync(work))
    }

    /// Fire-and-forget CPU-bound work.
    pub fn spawn_cpu<F, E>(&self, name: &str, work: F) -> Result<(), DispatchError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        self.check_running()?;
        let wrapper = self.wrapper("cpu", name);
        self.cpu.spawn(move || wrapper.run_sync(work))
    }

    /// Run CPU-bound work and await its result.
    ///
    /// A panic inside `work` surfaces as [`SyncError::TaskFailure`].
    pub async fn compute<F, R>(&self, name: &str, work: F) -> Result<R, SyncError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.check_running()?;
        let wrapper = self.wrapper("cpu", name);
        let task = wrapper.name.clone();
        let (tx, rx) = oneshot::channel();
        self.cpu.spawn(move || {
            wrapper.run_sync(move || {
                let _ = tx.send(work());
                Ok::<(), SyncError>(())
            })
        })?;
        rx.await
            .map_err(|_| SyncError::task_failure(task, "task ended without a result"))
    }

    /// Run a blocking closure (store reads) on the I/O pool and await its
    /// result.
    pub async fn io_call<F, R>(&self, name: &str, work: F) -> Result<R, SyncError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.check_running()?;
        let wrapper = self.wrapper("io", name);
        let task = wrapper.name.clone();
        let (tx, rx) = oneshot::channel();
        self.io.spawn_blocking(move || {
            wrapper.run_sync(move || {
                let _ = tx.send(work());
                Ok::<(), SyncError>(())
            })
        })?;
        rx.await
            .map_err(|_| SyncError::task_failure(task, "task ended without a result"))
    }

    /// Queue work on the single sequential thread.
    ///
    /// Jobs submitted from one thread run in that order; jobs from different
    /// threads run in the order their submissions happened.
    pub fn spawn_sequential<F, E>(&self, name: &str, work: F) -> Result<(), DispatchError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        self.check_running()?;
        let wrapper = self.wrapper("seq", name);
        self.sequential
            .submit(Box::new(move || wrapper.run_sync(work)))
    }

    /// Resolve once every sequential job submitted before this call has run.
    pub async fn flush_sequential(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.sequential.submit(Box::new(move || {
            let _ = tx.send(());
        }))?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    /// Run `work` on the UI context: inline when already there, marshalled
    /// otherwise.
    pub fn run_on_ui<F>(&self, name: &str, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let wrapper = self.wrapper("ui", name);
        let job = move || {
            wrapper.run_sync(move || {
                work();
                Ok::<(), SyncError>(())
            })
        };
        if self.ui.is_ui_context() {
            job();
        } else {
            self.ui.post(Box::new(job));
        }
    }

    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            io_core_threads: self.config.io_core_threads,
            io_max_threads: self.config.io_max_threads,
            io_queue_capacity: self.config.io_queue_capacity,
            io_in_flight: self.io.in_flight(),
            cpu_threads: self.config.cpu_threads,
            cpu_in_flight: self.cpu.in_flight(),
            sequential_pending: self.sequential.pending(),
            stopped: self.stopped.load(Ordering::Acquire),
        }
    }

    /// Cooperative stop with a bounded wait, then force-cancel.
    ///
    /// Must not be called from inside an async context.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return ShutdownReport {
                io_drained: true,
                cpu_drained: true,
                sequential_drained: true,
            };
        }
        info!(grace_ms = grace.as_millis() as u64, "Task dispatcher shutting down");

        let deadline = Instant::now() + grace;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let sequential_drained = self.sequential.shutdown(remaining());
        let io_drained = self.io.shutdown(remaining());
        let cpu_drained = self.cpu.shutdown(remaining());

        let report = ShutdownReport {
            io_drained,
            cpu_drained,
            sequential_drained,
        };
        if !report.is_clean() {
            warn!(?report, "Forced cancellation of outstanding tasks");
        }
        report
    }
}

// =============================================================================
// Wrapped Execution
// =============================================================================

struct TaskWrapper {
    name: String,
    instrumentation: Arc<Instrumentation>,
    slow_threshold: Duration,
}

impl TaskWrapper {
    fn run_sync<F, E>(self, work: F)
    where
        F: FnOnce() -> Result<(), E>,
        E: fmt::Display,
    {
        let span = self.instrumentation.span(self.name.as_str());
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = %self.name, error = %e, "Background task failed"),
            Err(payload) => error!(
                task = %self.name,
                panic = %panic_message(payload.as_ref()),
                "Background task panicked"
            ),
        }
        self.finish(span.finish());
    }

    async fn run_async<F, E>(self, work: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let span = self.instrumentation.span(self.name.as_str());
        // A nested task keeps a panic from unwinding through the wrapper.
        match tokio::spawn(work).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = %self.name, error = %e, "Background task failed"),
            Err(join) if join.is_panic() => {
                let payload = join.into_panic();
                error!(
                    task = %self.name,
                    panic = %panic_message(payload.as_ref()),
                    "Background task panicked"
                );
            }
            Err(_) => warn!(task = %self.name, "Background task cancelled"),
        }
        self.finish(span.finish());
    }

    fn finish(&self, elapsed: Duration) {
        if elapsed > self.slow_threshold {
            warn!(
                task = %self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Long running task"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
