// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! UI-affine execution context.
//!
//! The core never assumes a main thread. Whoever owns the UI injects a
//! [`UiExecutor`]; headless binaries and tests use [`InlineUiExecutor`].

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::warn;

pub type UiJob = Box<dyn FnOnce() + Send + 'static>;

pub trait UiExecutor: Send + Sync {
    /// Whether the calling thread is the UI context.
    fn is_ui_context(&self) -> bool;

    /// Queue `job` to run on the UI context.
    fn post(&self, job: UiJob);
}

/// Treats every thread as the UI context, so jobs always run inline.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineUiExecutor;

impl UiExecutor for InlineUiExecutor {
    fn is_ui_context(&self) -> bool {
        true
    }

    fn post(&self, job: UiJob) {
        job();
    }
}

/// Marshals jobs onto whichever thread drives the paired [`UiLoop`].
pub struct ChannelUiExecutor {
    ui_thread: OnceLock<ThreadId>,
    sender: Sender<UiJob>,
}

impl ChannelUiExecutor {
    pub fn new() -> (Arc<Self>, UiLoop) {
        let (sender, receiver) = mpsc::channel();
        let executor = Arc::new(Self {
            ui_thread: OnceLock::new(),
            sender,
        });
        let ui_loop = UiLoop {
            receiver,
            executor: Arc::clone(&executor),
        };
        (executor, ui_loop)
    }
}

impl UiExecutor for ChannelUiExecutor {
    fn is_ui_context(&self) -> bool {
        self.ui_thread.get() == Some(&thread::current().id())
    }

    fn post(&self, job: UiJob) {
        if self.sender.send(job).is_err() {
            warn!("UI loop is gone, dropping UI job");
        }
    }
}

/// Receiving half owned by the UI thread.
pub struct UiLoop {
    receiver: Receiver<UiJob>,
    executor: Arc<ChannelUiExecutor>,
}

impl UiLoop {
    /// Bind the UI context to the calling thread. Later calls are no-ops.
    pub fn attach(&self) {
        let _ = self.executor.ui_thread.set(thread::current().id());
    }

    /// Run every queued job without blocking; returns how many ran.
    pub fn run_pending(&self) -> usize {
        self.attach();
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Run jobs as they arrive until `timeout` passes with nothing left to do.
    pub fn run_for(&self, timeout: Duration) -> usize {
        self.attach();
        let deadline = Instant::now() + timeout;
        let mut ran = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(job) => {
                    job();
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return ran
                }
            }
        }
    }
}
