// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Every knob has a sane default; [`SyncConfig::from_env`] overrides them from
//! the environment at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `WALLET_API_BASE_URL` | Wallet API base URL | `https://api.chronie.example.com/api/` |
//! | `WALLET_CACHE_DIR` | Directory for the HTTP cache, snapshot db and prefs | `./wallet-cache` |
//! | `WALLET_CACHE_MAX_BYTES` | Response cache byte budget | `10485760` (10 MB) |
//! | `WALLET_IO_CORE_THREADS` | I/O pool core size | `max(2, min(N-1, 4))` |
//! | `WALLET_IO_MAX_THREADS` | I/O pool max size | `2N+1` |
//! | `WALLET_IO_QUEUE_CAPACITY` | Bounded I/O queue length | `128` |
//! | `WALLET_CPU_THREADS` | CPU pool size | `max(1, N/2)` |
//! | `WALLET_CACHE_TTL_SECS` | Repository entry TTL | `60` |
//! | `WALLET_CACHE_MAX_STALE_SECS` | Repository stale grace period | `86400` |
//! | `WALLET_SYNC_INTERVAL_SECS` | Daemon refresh interval | `30` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,wallet_sync=debug` |

use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::error::SyncError;

pub const BASE_URL_ENV: &str = "WALLET_API_BASE_URL";
pub const CACHE_DIR_ENV: &str = "WALLET_CACHE_DIR";
pub const CACHE_MAX_BYTES_ENV: &str = "WALLET_CACHE_MAX_BYTES";
pub const IO_CORE_THREADS_ENV: &str = "WALLET_IO_CORE_THREADS";
pub const IO_MAX_THREADS_ENV: &str = "WALLET_IO_MAX_THREADS";
pub const IO_QUEUE_CAPACITY_ENV: &str = "WALLET_IO_QUEUE_CAPACITY";
pub const CPU_THREADS_ENV: &str = "WALLET_CPU_THREADS";
pub const CACHE_TTL_ENV: &str = "WALLET_CACHE_TTL_SECS";
pub const CACHE_MAX_STALE_ENV: &str = "WALLET_CACHE_MAX_STALE_SECS";
pub const SYNC_INTERVAL_ENV: &str = "WALLET_SYNC_INTERVAL_SECS";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_BASE_URL: &str = "https://api.chronie.example.com/api/";
pub const DEFAULT_CACHE_DIR: &str = "./wallet-cache";
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_IO_QUEUE_CAPACITY: usize = 128;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_SLOW_TASK_THRESHOLD: Duration = Duration::from_millis(200);
pub const DEFAULT_SLOW_OPERATION_THRESHOLD: Duration = Duration::from_millis(100);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_ENTRY_MAX_STALE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MEMORY_CAPACITY: usize = 256;

/// Sizing for the four dispatcher pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub io_core_threads: usize,
    pub io_max_threads: usize,
    pub io_queue_capacity: usize,
    pub io_keep_alive: Duration,
    pub cpu_threads: usize,
    /// Tasks running longer than this get a warning.
    pub slow_task_threshold: Duration,
}

impl PoolConfig {
    /// Derive pool sizes from the available parallelism `n`.
    pub fn for_parallelism(n: usize) -> Self {
        let n = n.max(1);
        Self {
            io_core_threads: n.saturating_sub(1).min(4).max(2),
            io_max_threads: 2 * n + 1,
            io_queue_capacity: DEFAULT_IO_QUEUE_CAPACITY,
            io_keep_alive: DEFAULT_KEEP_ALIVE,
            cpu_threads: (n / 2).max(1),
            slow_task_threshold: DEFAULT_SLOW_TASK_THRESHOLD,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let n = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::for_parallelism(n)
    }
}

/// Per-call network timeouts, independent of single-flight waiter count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            read: Duration::from_secs(20),
            request: Duration::from_secs(20),
        }
    }
}

/// Default `Cache-Control` policy applied when the caller set none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicyConfig {
    /// Online freshness window.
    pub max_age: Duration,
    /// Offline tolerance window.
    pub max_stale: Duration,
}

impl Default for CachePolicyConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_ENTRY_TTL,
            max_stale: DEFAULT_ENTRY_MAX_STALE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: Url,
    pub cache_dir: PathBuf,
    pub cache_max_bytes: u64,
    pub pools: PoolConfig,
    pub timeouts: HttpTimeouts,
    pub http_cache_policy: CachePolicyConfig,
    /// Repository TTL for memory/persistent entries.
    pub entry_ttl: Duration,
    /// Repository grace period after TTL.
    pub entry_max_stale: Duration,
    /// Max entries held by the memory tier.
    pub memory_capacity: usize,
    pub slow_operation_threshold: Duration,
    pub sync_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            pools: PoolConfig::default(),
            timeouts: HttpTimeouts::default(),
            http_cache_policy: CachePolicyConfig::default(),
            entry_ttl: DEFAULT_ENTRY_TTL,
            entry_max_stale: DEFAULT_ENTRY_MAX_STALE,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            slow_operation_threshold: DEFAULT_SLOW_OPERATION_THRESHOLD,
            sync_interval: Duration::from_secs(30),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl SyncConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(BASE_URL_ENV) {
            config.base_url = parse_base_url(&raw)?;
        }
        if let Some(dir) = lookup(CACHE_DIR_ENV) {
            config.cache_dir = PathBuf::from(dir);
        }

        config.cache_max_bytes = parsed_or(&lookup, CACHE_MAX_BYTES_ENV, config.cache_max_bytes);
        config.pools.io_core_threads =
            parsed_or(&lookup, IO_CORE_THREADS_ENV, config.pools.io_core_threads);
        config.pools.io_max_threads =
            parsed_or(&lookup, IO_MAX_THREADS_ENV, config.pools.io_max_threads);
        config.pools.io_queue_capacity =
            parsed_or(&lookup, IO_QUEUE_CAPACITY_ENV, config.pools.io_queue_capacity);
        config.pools.cpu_threads = parsed_or(&lookup, CPU_THREADS_ENV, config.pools.cpu_threads);
        config.entry_ttl = Duration::from_secs(parsed_or(
            &lookup,
            CACHE_TTL_ENV,
            config.entry_ttl.as_secs(),
        ));
        config.entry_max_stale = Duration::from_secs(parsed_or(
            &lookup,
            CACHE_MAX_STALE_ENV,
            config.entry_max_stale.as_secs(),
        ));
        config.sync_interval = Duration::from_secs(parsed_or(
            &lookup,
            SYNC_INTERVAL_ENV,
            config.sync_interval.as_secs(),
        ));

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the dispatcher cannot build.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.pools.io_core_threads == 0 || self.pools.cpu_threads == 0 {
            return Err(SyncError::Config("pool sizes must be non-zero".to_string()));
        }
        if self.pools.io_max_threads < self.pools.io_core_threads {
            return Err(SyncError::Config(format!(
                "io max threads ({}) below core threads ({})",
                self.pools.io_max_threads, self.pools.io_core_threads
            )));
        }
        if self.cache_max_bytes == 0 {
            return Err(SyncError::Config("cache max bytes must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Relative endpoint paths are joined onto the base, so it must end in `/`.
fn parse_base_url(raw: &str) -> Result<Url, SyncError> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|e| SyncError::Config(format!("invalid base URL {raw}: {e}")))
}

fn parsed_or<T, F>(lookup: &F, name: &str, default: T) -> T
where
    T: FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, "Ignoring invalid configuration value");
            default
        }),
        None => default,
    }
}
