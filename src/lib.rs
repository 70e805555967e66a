// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Wallet Sync - client-side data synchronization and caching core
//!
//! Keeps wallet data readable offline and cheap to read online: values are
//! served from memory, then an embedded redb database, then the network,
//! with single-flight fetches and stale fallbacks when the link is down.
//!
//! ## Modules
//!
//! - `repository` - tiered read/write cache (memory, persistent, network)
//! - `dispatcher` - categorized task pools (I/O, CPU, sequential, UI)
//! - `http` - interceptor pipeline and on-disk response cache
//! - `storage` - redb databases (responses, snapshots, preferences)
//! - `instrumentation` - per-operation timing and rate sampling
//! - `wallet` - wallet API client, cache keys and sync poller
//! - `state` - lifecycle context wiring everything together

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod instrumentation;
pub mod models;
pub mod repository;
pub mod state;
pub mod storage;
pub mod wallet;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use state::SyncContext;
