// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! `wallet-syncd`: keeps the local wallet cache warm until Ctrl-C.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wallet_sync::config::LOG_FORMAT_ENV;
use wallet_sync::{SyncConfig, SyncContext};

const DEFAULT_LOG_FILTER: &str = "info,wallet_sync=debug";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);

    match std::env::var(LOG_FORMAT_ENV).as_deref() {
        Ok("json") => builder.json().init(),
        _ => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let grace = config.shutdown_grace;

    let ctx = match SyncContext::init(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "Failed to initialize sync context");
            return ExitCode::FAILURE;
        }
    };

    ctx.spawn_poller();
    info!("Wallet sync daemon running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
    info!("Shutdown requested");

    info!(stats = ?ctx.response_cache.stats(), "Response cache");
    info!("{}", ctx.instrumentation.report());

    match ctx.shutdown(grace).await {
        Ok(report) if report.is_clean() => ExitCode::SUCCESS,
        Ok(report) => {
            error!(?report, "Shutdown left work unfinished");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "Shutdown failed");
            ExitCode::FAILURE
        }
    }
}
