// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Wallet Sync Poller
//!
//! Background task that keeps the current wallet and its first page of
//! history warm in every cache tier, so a UI opening cold (or offline) has
//! something recent to show.
//!
//! ## Strategy
//!
//! Every `interval` (default 30 s) the poller:
//! 1. Force-refreshes `wallet:current`.
//! 2. Force-refreshes page 1 of that wallet's transactions.
//!
//! Failures are logged and retried on the next sweep; a degraded refresh
//! (cached fallback) counts as a failure for logging.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::service::WalletService;
use crate::instrumentation::SampleHandle;

/// Default interval between sweeps.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

pub struct WalletSyncPoller {
    service: Arc<WalletService>,
    interval: Duration,
    sampler: Option<SampleHandle>,
}

impl WalletSyncPoller {
    pub fn new(service: Arc<WalletService>) -> Self {
        Self {
            service,
            interval: DEFAULT_SYNC_INTERVAL,
            sampler: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Count each successful sweep on `handle`.
    pub fn with_sampler(mut self, handle: SampleHandle) -> Self {
        self.sampler = Some(handle);
        self
    }

    /// Run the poller loop until the cancellation token is triggered.
    ///
    /// Should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(poller.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Wallet sync poller starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Wallet sync poller shutting down");
                return;
            }

            tokio::select! {
                synced = self.poll_step() => {
                    if synced {
                        if let Some(sampler) = &self.sampler {
                            sampler.record();
                        }
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("Wallet sync poller shutting down");
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Wallet sync poller shutting down");
                    return;
                }
            }
        }
    }

    /// One sweep. Returns whether both refreshes reached the network.
    pub async fn poll_step(&self) -> bool {
        let wallet = match self.service.refresh_current_wallet().await {
            Ok(outcome) if !outcome.is_degraded() => outcome.value,
            Ok(outcome) => {
                warn!(error = ?outcome.degraded, "Wallet sync: refresh degraded, keeping cached wallet");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Wallet sync: failed to refresh wallet");
                return false;
            }
        };

        match self.service.refresh_transactions(&wallet.wallet_id, 1).await {
            Ok(outcome) if !outcome.is_degraded() => {
                debug!(
                    wallet_id = %wallet.wallet_id,
                    balance = wallet.balance,
                    records = outcome.value.records.len(),
                    "Wallet sync: refreshed"
                );
                true
            }
            Ok(outcome) => {
                warn!(
                    wallet_id = %wallet.wallet_id,
                    error = ?outcome.degraded,
                    "Wallet sync: history refresh degraded"
                );
                false
            }
            Err(e) => {
                warn!(wallet_id = %wallet.wallet_id, error = %e, "Wallet sync: failed to refresh history");
                false
            }
        }
    }
}
