// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fixed-rate sampler for a smoothed events-per-window metric.
//!
//! Producers bump a shared counter through a [`SampleHandle`]; every window
//! the sampler swaps the counter to zero, folds the count into an
//! exponential moving average, publishes it to [`Instrumentation`] and hands
//! it to the callback.
//!
//! Uses `tokio_util::sync::CancellationToken` for shutdown, like the wallet
//! sync poller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Instrumentation;

/// Weight of the newest window in the moving average.
const DEFAULT_SMOOTHING: f64 = 0.5;

/// Cheap, cloneable event counter feeding a [`RateSampler`].
#[derive(Clone, Default)]
pub struct SampleHandle {
    events: Arc<AtomicU64>,
}

impl SampleHandle {
    pub fn record(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    fn take(&self) -> u64 {
        self.events.swap(0, Ordering::AcqRel)
    }
}

pub struct RateSampler {
    handle: SampleHandle,
    window: Duration,
    smoothing: f64,
    low_watermark: Option<f64>,
    instrumentation: Arc<Instrumentation>,
}

impl RateSampler {
    pub fn new(window: Duration, instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            handle: SampleHandle::default(),
            window,
            smoothing: DEFAULT_SMOOTHING,
            low_watermark: None,
            instrumentation,
        }
    }

    /// Warn whenever the smoothed rate drops below `rate`.
    pub fn with_low_watermark(mut self, rate: f64) -> Self {
        self.low_watermark = Some(rate);
        self
    }

    pub fn with_smoothing(mut self, alpha: f64) -> Self {
        self.smoothing = alpha.clamp(0.0, 1.0);
        self
    }

    pub fn handle(&self) -> SampleHandle {
        self.handle.clone()
    }

    /// Tick until `shutdown` fires, calling `on_sample` with each smoothed rate.
    pub async fn run<F>(self, shutdown: CancellationToken, mut on_sample: F)
    where
        F: FnMut(f64) + Send,
    {
        info!(window_ms = self.window.as_millis() as u64, "Rate sampler starting");

        let mut ticker = tokio::time::interval(self.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; start counting from here.
        ticker.tick().await;
        self.handle.take();

        let mut smoothed: Option<f64> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = shutdown.cancelled() => {
                    info!("Rate sampler shutting down");
                    return;
                }
            }

            let sample = self.handle.take() as f64;
            let rate = smooth(smoothed, sample, self.smoothing);
            smoothed = Some(rate);

            self.instrumentation.set_sample_rate(rate);
            if let Some(low) = self.low_watermark {
                if rate < low {
                    warn!(rate, threshold = low, "Sampled rate below threshold");
                }
            }
            on_sample(rate);
        }
    }
}

/// Exponential moving average; the first sample seeds it.
pub fn smooth(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
        None => sample,
    }
}
