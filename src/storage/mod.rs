// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Embedded redb databases (pure Rust, ACID) backing the sync layer.
//!
//! ## Databases
//!
//! | File | Type | Contents |
//! |------|------|----------|
//! | `http-cache/responses.redb` | [`ResponseCacheStore`] | HTTP responses, size-bounded LRU |
//! | `snapshots.redb` | [`SnapshotDb`] | repository persistent tier |
//! | `prefs.redb` | [`PrefsStore`] | namespaced preferences, auth token |
//!
//! All three share [`StoreError`]. Opening a database creates its parent
//! directory and pre-creates every table so later read transactions don't
//! fail on a fresh file.

pub mod paths;
pub mod prefs;
pub mod response_cache;
pub mod snapshot_db;

use std::path::Path;

use redb::Database;

use crate::error::SyncError;

pub use paths::CachePaths;
pub use prefs::{PrefsStore, AUTH_PREFS, AUTH_TOKEN};
pub use response_cache::{CacheStats, CachedResponse, ResponseCacheKey, ResponseCacheStore};
pub use snapshot_db::SnapshotDb;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Create the parent directory of `path` and open (or create) the database.
pub(crate) fn open_database(path: &Path) -> StoreResult<Database> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(Database::create(path)?)
}
