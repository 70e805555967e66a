// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Crate-level error taxonomy.
//!
//! | Variant | Recoverable | Repository behavior |
//! |---------|-------------|---------------------|
//! | `Network` | yes | falls back to the last cached value |
//! | `Server` | no retry | surfaced with status code and message |
//! | `CacheCorruption` | yes | treated as a miss, re-fetched |
//! | `TaskFailure` | isolated | logged at the dispatcher boundary |
//!
//! `SyncError` is `Clone` because a single settled network fetch is handed to
//! every caller waiting on the same key.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Timeout, refused connection, DNS failure, dropped link.
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx response, or a 2xx envelope with `success = false`.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("corrupt cache entry {key}: {message}")]
    CacheCorruption { key: String, message: String },

    #[error("task {task} failed: {message}")]
    TaskFailure { task: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no remote source registered for key {0}")]
    UnknownKey(String),

    #[error("shutting down")]
    Shutdown,
}

impl SyncError {
    pub fn network(message: impl fmt::Display) -> Self {
        Self::Network(message.to_string())
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn corruption(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::CacheCorruption {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn task_failure(task: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::TaskFailure {
            task: task.into(),
            message: message.to_string(),
        }
    }

    /// Whether a cached fallback value may stand in for this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::CacheCorruption { .. } | SyncError::Dispatch(_)
        )
    }

    /// HTTP status for server errors, `None` otherwise.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
