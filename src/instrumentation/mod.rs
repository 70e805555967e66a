// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Instrumentation
//!
//! Per-operation latency bookkeeping shared by the dispatcher, the HTTP
//! pipeline and the repository.
//!
//! Two ways to measure:
//!
//! - name-keyed [`Instrumentation::start`] / [`Instrumentation::end`] pairs;
//!   concurrent spans with the same name are matched first-in, first-out
//! - RAII [`Span`] guards, which record on [`Span::finish`] or on drop and
//!   therefore capture the interval even when the measured code errors out
//!
//! A [`sampler::RateSampler`] computes a smoothed rate metric on a fixed tick,
//! independent of the spans.

pub mod sampler;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

pub use sampler::{RateSampler, SampleHandle};

/// Distinct operation names tracked before new names share one bucket.
pub const MAX_OPERATIONS: usize = 256;

/// Bucket for names recorded after [`MAX_OPERATIONS`] is reached.
pub const OVERFLOW_OPERATION: &str = "(other)";

#[derive(Debug, Default, Clone, Copy)]
struct OperationTotals {
    count: u64,
    total: Duration,
    max: Duration,
}

#[derive(Debug, Default)]
struct State {
    in_flight: HashMap<String, VecDeque<Instant>>,
    totals: HashMap<String, OperationTotals>,
    sample_rate: Option<f64>,
}

/// Aggregated numbers for one operation name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStats {
    pub name: String,
    pub count: u64,
    pub total_ms: u64,
    pub average_ms: u64,
    pub max_ms: u64,
}

/// Snapshot of everything recorded so far.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentationReport {
    /// Sorted by name.
    pub operations: Vec<OperationStats>,
    /// Operations whose average exceeds the slow threshold, slowest first.
    pub slow: Vec<OperationStats>,
    pub slow_threshold_ms: u64,
    pub sample_rate: Option<f64>,
}

impl fmt::Display for InstrumentationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "===== Instrumentation Report =====")?;
        for op in &self.operations {
            writeln!(
                f,
                "- {}: {} calls, avg {}ms, max {}ms",
                op.name, op.count, op.average_ms, op.max_ms
            )?;
        }
        if !self.slow.is_empty() {
            writeln!(f, "Slow operations (avg > {}ms):", self.slow_threshold_ms)?;
            for op in &self.slow {
                writeln!(f, "- \"{}\" avg {}ms ({} calls)", op.name, op.average_ms, op.count)?;
            }
        }
        if let Some(rate) = self.sample_rate {
            writeln!(f, "Sampled rate: {rate:.1}/window")?;
        }
        Ok(())
    }
}

pub struct Instrumentation {
    state: Mutex<State>,
    slow_threshold: Duration,
}

impl Instrumentation {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            slow_threshold,
        }
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// Mark the start of `name`.
    pub fn start(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .in_flight
                .entry(name.to_string())
                .or_default()
                .push_back(Instant::now());
        }
    }

    /// Close the oldest open `start(name)` and return its elapsed time.
    ///
    /// Returns `None` when no start was recorded.
    pub fn end(&self, name: &str) -> Option<Duration> {
        let started = {
            let mut state = self.state.lock().ok()?;
            let started = state.in_flight.get_mut(name).and_then(VecDeque::pop_front);
            if state.in_flight.get(name).is_some_and(VecDeque::is_empty) {
                state.in_flight.remove(name);
            }
            started
        };

        match started {
            Some(started) => {
                let elapsed = started.elapsed();
                self.record(name, elapsed);
                Some(elapsed)
            }
            None => {
                warn!(operation = name, "No start time recorded for operation");
                None
            }
        }
    }

    /// Open an RAII span for `name`.
    pub fn span(self: &Arc<Self>, name: impl Into<String>) -> Span {
        Span {
            owner: Arc::clone(self),
            name: name.into(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Fold one completed measurement into the totals.
    pub fn record(&self, name: &str, elapsed: Duration) {
        if let Ok(mut state) = self.state.lock() {
            let bucket = if state.totals.contains_key(name) || state.totals.len() < MAX_OPERATIONS {
                name
            } else {
                OVERFLOW_OPERATION
            };
            let totals = state.totals.entry(bucket.to_string()).or_default();
            totals.count += 1;
            totals.total += elapsed;
            totals.max = totals.max.max(elapsed);
        }
        if elapsed > self.slow_threshold {
            debug!(
                operation = name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow operation"
            );
        }
    }

    /// Number of completed measurements for `name`.
    pub fn count(&self, name: &str) -> u64 {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.totals.get(name).map(|t| t.count))
            .unwrap_or(0)
    }

    /// Completed measurements across every name starting with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> u64 {
        self.state
            .lock()
            .map(|state| {
                state
                    .totals
                    .iter()
                    .filter(|(name, _)| name.starts_with(prefix))
                    .map(|(_, t)| t.count)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Number of spans currently open through `start`.
    pub fn in_flight(&self, name: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.in_flight.get(name).map(VecDeque::len))
            .unwrap_or(0)
    }

    pub fn stats(&self, name: &str) -> Option<OperationStats> {
        let state = self.state.lock().ok()?;
        state.totals.get(name).map(|t| to_stats(name, t))
    }

    pub fn set_sample_rate(&self, rate: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.sample_rate = Some(rate);
        }
    }

    pub fn sample_rate(&self) -> Option<f64> {
        self.state.lock().ok().and_then(|state| state.sample_rate)
    }

    pub fn report(&self) -> InstrumentationReport {
        let (mut operations, sample_rate) = match self.state.lock() {
            Ok(state) => (
                state
                    .totals
                    .iter()
                    .map(|(name, t)| to_stats(name, t))
                    .collect::<Vec<_>>(),
                state.sample_rate,
            ),
            Err(_) => (Vec::new(), None),
        };
        operations.sort_by(|a, b| a.name.cmp(&b.name));

        let threshold_ms = self.slow_threshold.as_millis() as u64;
        let mut slow: Vec<OperationStats> = operations
            .iter()
            .filter(|op| op.average_ms > threshold_ms)
            .cloned()
            .collect();
        slow.sort_by(|a, b| b.average_ms.cmp(&a.average_ms));

        InstrumentationReport {
            operations,
            slow,
            slow_threshold_ms: threshold_ms,
            sample_rate,
        }
    }

    /// Drop every measurement and open span.
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = State::default();
        }
    }
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SLOW_OPERATION_THRESHOLD)
    }
}

fn to_stats(name: &str, totals: &OperationTotals) -> OperationStats {
    let total_ms = totals.total.as_millis() as u64;
    OperationStats {
        name: name.to_string(),
        count: totals.count,
        total_ms,
        average_ms: total_ms / totals.count.max(1),
        max_ms: totals.max.as_millis() as u64,
    }
}

/// Open measurement; recorded exactly once.
pub struct Span {
    owner: Arc<Instrumentation>,
    name: String,
    started: Instant,
    finished: bool,
}

impl Span {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the span and return its elapsed time.
    pub fn finish(mut self) -> Duration {
        self.close()
    }

    fn close(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        if !self.finished {
            self.finished = true;
            self.owner.record(&self.name, elapsed);
        }
        elapsed
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.close();
    }
}
