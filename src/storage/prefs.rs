// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Namespaced string preferences.
//!
//! ## Table Layout
//!
//! - `prefs`: `"{namespace}/{key}"` → value
//!
//! The login flow writes the bearer token under
//! [`AUTH_PREFS`]/[`AUTH_TOKEN`]; the Auth interceptor reads it back through
//! the [`TokenProvider`] impl on every request.

use std::path::Path;

use redb::{Database, ReadableDatabase, TableDefinition};
use tracing::{info, warn};

use super::{open_database, StoreResult};
use crate::http::TokenProvider;

pub const AUTH_PREFS: &str = "auth_prefs";
pub const AUTH_TOKEN: &str = "auth_token";

const PREFS: TableDefinition<&str, &str> = TableDefinition::new("prefs");

fn compose(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}

pub struct PrefsStore {
    db: Database,
}

impl PrefsStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = open_database(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PREFS)?;
        }
        write_txn.commit()?;

        info!(path = %path.display(), "Preferences database opened");
        Ok(Self { db })
    }

    pub fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PREFS)?;
        let value = table.get(compose(namespace, key).as_str())?;
        Ok(value.map(|guard| guard.value().to_string()))
    }

    pub fn set(&self, namespace: &str, key: &str, value: &str) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PREFS)?;
            table.insert(compose(namespace, key).as_str(), value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Returns whether a value was present.
    pub fn remove(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(PREFS)?;
            let removed = table.remove(compose(namespace, key).as_str())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

impl TokenProvider for PrefsStore {
    fn bearer_token(&self) -> Option<String> {
        match self.get(AUTH_PREFS, AUTH_TOKEN) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read auth token, sending unauthenticated");
                None
            }
        }
    }
}
