// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persistent tier of the repository.
//!
//! ## Table Layout
//!
//! - `snapshots`: cache key → JSON [`CacheEntry`]
//!
//! Values are stored as JSON so one database can hold any payload type the
//! repositories use. Mutations are expected to arrive from the sequential
//! pool only.

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use super::{open_database, StoreResult};
use crate::error::{SyncError, SyncResult};
use crate::repository::{CacheEntry, PersistentStore};

const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

pub struct SnapshotDb {
    db: Database,
}

impl SnapshotDb {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = open_database(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SNAPSHOTS)?;
        }
        write_txn.commit()?;

        info!(path = %path.display(), "Snapshot database opened");
        Ok(Self { db })
    }

    pub fn get_raw(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS)?;
        let value = table.get(key)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    pub fn put_raw(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS)?;
            table.insert(key, bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SNAPSHOTS)?;
            let removed = table.remove(key)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Delete every key starting with `prefix`.
    pub fn delete_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let keys = self.keys_with_prefix(prefix)?;
        if keys.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS)?;
            for key in &keys {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(keys.len())
    }

    /// Keys starting with `prefix`, in key order.
    pub fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS)?;
        let mut keys = Vec::new();
        for item in table.range(prefix..)? {
            let (key, _) = item?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    pub fn len(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl<V> PersistentStore<V> for SnapshotDb
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn load(&self, key: &str) -> SyncResult<Option<CacheEntry<V>>> {
        let Some(bytes) = self.get_raw(key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SyncError::corruption(key, e))
    }

    fn save(&self, entry: &CacheEntry<V>) -> SyncResult<()> {
        let bytes = serde_json::to_vec(entry)?;
        Ok(self.put_raw(&entry.key, &bytes)?)
    }

    fn remove(&self, key: &str) -> SyncResult<bool> {
        Ok(self.delete(key)?)
    }

    fn remove_prefix(&self, prefix: &str) -> SyncResult<usize> {
        Ok(self.delete_prefix(prefix)?)
    }
}
