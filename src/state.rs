// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Sync Context
//!
//! Explicit lifecycle owner for everything the sync layer runs on. Nothing
//! here is a global: the app builds one [`SyncContext`] at startup, hands out
//! clones, and calls [`SyncContext::shutdown`] once on exit.
//!
//! `init` opens the three databases under the cache directory, builds the
//! dispatcher pools and the HTTP pipeline, and wires the wallet repository
//! on top. `shutdown` stops background loops, lets queued persistent writes
//! land, then stops the pools.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::dispatcher::{InlineUiExecutor, ShutdownReport, TaskDispatcher, UiExecutor};
use crate::error::{SyncError, SyncResult};
use crate::http::{CachingTransport, HttpPipeline, ReqwestTransport, Transport};
use crate::instrumentation::{Instrumentation, RateSampler};
use crate::models::CachedPayload;
use crate::repository::{RepositoryOptions, TieredCacheRepository};
use crate::storage::{CachePaths, PrefsStore, ResponseCacheStore, SnapshotDb};
use crate::wallet::{WalletClient, WalletRemoteSource, WalletService, WalletSyncPoller};

/// Window of the sync-rate sampler.
const SYNC_SAMPLE_WINDOW: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct SyncContext {
    pub config: SyncConfig,
    pub paths: CachePaths,
    pub instrumentation: Arc<Instrumentation>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub prefs: Arc<PrefsStore>,
    pub response_cache: Arc<ResponseCacheStore>,
    pub snapshots: Arc<SnapshotDb>,
    pub pipeline: Arc<HttpPipeline>,
    pub wallet: Arc<WalletService>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SyncContext {
    /// Headless context talking to the real API.
    pub fn init(config: SyncConfig) -> SyncResult<Self> {
        let network = Arc::new(ReqwestTransport::new(&config.timeouts)?);
        Self::init_with(config, Arc::new(InlineUiExecutor), network)
    }

    /// Context with an injected UI executor and network transport.
    pub fn init_with(
        config: SyncConfig,
        ui: Arc<dyn UiExecutor>,
        network: Arc<dyn Transport>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let paths = CachePaths::new(&config.cache_dir);

        let prefs = Arc::new(PrefsStore::open(&paths.prefs_db())?);
        let response_cache = Arc::new(ResponseCacheStore::open(
            &paths.responses_db(),
            config.cache_max_bytes,
        )?);
        let snapshots = Arc::new(SnapshotDb::open(&paths.snapshots_db())?);

        let instrumentation = Arc::new(Instrumentation::new(config.slow_operation_threshold));
        let dispatcher = Arc::new(TaskDispatcher::new(
            config.pools.clone(),
            Arc::clone(&instrumentation),
            ui,
        )?);

        let transport = Arc::new(
            CachingTransport::new(network, Arc::clone(&response_cache))
                .with_default_max_age(config.http_cache_policy.max_age),
        );
        let pipeline = Arc::new(
            HttpPipeline::builder(transport)
                .instrumentation(Arc::clone(&instrumentation))
                .auth(prefs.clone())
                .cache_control(config.http_cache_policy)
                .build(),
        );

        let client = Arc::new(
            WalletClient::new(Arc::clone(&pipeline), config.base_url.clone())
                .revalidating(config.http_cache_policy.max_stale),
        );
        let repository = TieredCacheRepository::<CachedPayload>::new(
            Arc::new(WalletRemoteSource::new(Arc::clone(&client))),
            snapshots.clone(),
            Arc::clone(&dispatcher),
            RepositoryOptions::from(&config),
        );
        let wallet = Arc::new(WalletService::new(repository, client));

        info!(
            base_url = %config.base_url,
            cache_dir = %paths.root().display(),
            stages = ?pipeline.stages(),
            "Sync context initialized"
        );

        Ok(Self {
            config,
            paths,
            instrumentation,
            dispatcher,
            prefs,
            response_cache,
            snapshots,
            pipeline,
            wallet,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Token cancelled when [`shutdown`](Self::shutdown) starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the wallet sync poller and its rate sampler on the current
    /// runtime. They stop when the context shuts down.
    pub fn spawn_poller(&self) {
        let sampler = RateSampler::new(SYNC_SAMPLE_WINDOW, Arc::clone(&self.instrumentation))
            .with_low_watermark(1.0);
        let poller = WalletSyncPoller::new(Arc::clone(&self.wallet))
            .with_interval(self.config.sync_interval)
            .with_sampler(sampler.handle());

        self.tasks.spawn(poller.run(self.shutdown.clone()));
        self.tasks.spawn(sampler.run(self.shutdown.clone(), |_| {}));
    }

    /// Stop background loops, drain queued persistent writes and shut the
    /// pools down, all within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> SyncResult<ShutdownReport> {
        let deadline = Instant::now() + grace;
        self.shutdown.cancel();
        self.tasks.close();

        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!("Background tasks did not stop within the grace period");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.wallet.repository().flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Flushing persistent writes failed"),
            Err(_) => warn!("Persistent writes still queued at shutdown"),
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let report = tokio::task::spawn_blocking(move || dispatcher.shutdown(remaining))
            .await
            .map_err(|e| SyncError::task_failure("shutdown", e))?;

        info!(clean = report.is_clean(), "Sync context shut down");
        Ok(report)
    }
}
