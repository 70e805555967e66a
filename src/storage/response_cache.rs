// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Size-bounded persistent HTTP response cache.
//!
//! ## Table Layout
//!
//! - `responses`: cache key → framed entry
//!
//! An entry is framed as `meta_len (u32 BE) | meta JSON | raw body`, so large
//! bodies are stored as-is instead of being inflated by JSON.
//!
//! The byte budget counts key plus framed value. An in-memory LRU index of
//! entry sizes decides eviction order; it is rebuilt from `stored_at` when the
//! database is opened. Entries that fail to decode are dropped and reported as
//! misses.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use lru::LruCache;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{open_database, StoreResult};

const RESPONSES: TableDefinition<&str, &[u8]> = TableDefinition::new("responses");

/// Vary headers folded into the key as a digest instead of verbatim.
const HASHED_VARY_HEADERS: &[&str] = &["authorization", "cookie"];

// =============================================================================
// Key
// =============================================================================

/// `METHOD url|header=value|...`, vary headers sorted by lowercase name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseCacheKey(String);

impl ResponseCacheKey {
    pub fn new(method: &str, url: &str, vary: &[(&str, &str)]) -> Self {
        let mut parts: Vec<(String, String)> = vary
            .iter()
            .map(|(name, value)| {
                let name = name.to_ascii_lowercase();
                let value = if HASHED_VARY_HEADERS.contains(&name.as_str()) {
                    digest(value)
                } else {
                    (*value).to_string()
                };
                (name, value)
            })
            .collect();
        parts.sort();

        let mut key = format!("{} {}", method.to_ascii_uppercase(), url);
        for (name, value) in parts {
            key.push('|');
            key.push_str(&name);
            key.push('=');
            key.push_str(&value);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn digest(value: &str) -> String {
    Sha256::digest(value.as_bytes())
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

// =============================================================================
// Entry
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
    /// End of the freshness window the response was stored with.
    pub expires_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.stored_at).max(chrono::Duration::zero())
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

#[derive(Serialize, Deserialize)]
struct EntryMeta {
    status: u16,
    headers: Vec<(String, String)>,
    stored_at: DateTime<Utc>,
    /// Absent in rows written before expiry was tracked; those count as
    /// expired.
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    body_len: u64,
}

fn encode(response: &CachedResponse) -> StoreResult<Vec<u8>> {
    let meta = serde_json::to_vec(&EntryMeta {
        status: response.status,
        headers: response.headers.clone(),
        stored_at: response.stored_at,
        expires_at: Some(response.expires_at),
        body_len: response.body.len() as u64,
    })?;
    let mut framed = Vec::with_capacity(4 + meta.len() + response.body.len());
    framed.extend_from_slice(&(meta.len() as u32).to_be_bytes());
    framed.extend_from_slice(&meta);
    framed.extend_from_slice(&response.body);
    Ok(framed)
}

fn split_frame(bytes: &[u8]) -> Result<(EntryMeta, &[u8]), String> {
    let (len, rest) = bytes
        .split_first_chunk::<4>()
        .ok_or_else(|| "truncated frame header".to_string())?;
    let meta_len = u32::from_be_bytes(*len) as usize;
    if rest.len() < meta_len {
        return Err("truncated metadata".to_string());
    }
    let (meta, body) = rest.split_at(meta_len);
    let meta: EntryMeta = serde_json::from_slice(meta).map_err(|e| e.to_string())?;
    if body.len() as u64 != meta.body_len {
        return Err(format!(
            "body length mismatch: expected {}, found {}",
            meta.body_len,
            body.len()
        ));
    }
    Ok((meta, body))
}

fn decode(bytes: &[u8]) -> Result<CachedResponse, String> {
    let (meta, body) = split_frame(bytes)?;
    Ok(CachedResponse {
        status: meta.status,
        headers: meta.headers,
        body: body.to_vec(),
        stored_at: meta.stored_at,
        expires_at: meta.expires_at.unwrap_or(meta.stored_at),
    })
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub corrupt: u64,
    pub entries: usize,
    pub size_bytes: u64,
    pub max_bytes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    corrupt: AtomicU64,
}

// =============================================================================
// Store
// =============================================================================

struct SizeIndex {
    /// Key → entry size in bytes, least recently used at the back.
    lru: LruCache<String, u64>,
    total_bytes: u64,
}

impl SizeIndex {
    fn forget(&mut self, key: &str) {
        if let Some(size) = self.lru.pop(key) {
            self.total_bytes -= size;
        }
    }
}

pub struct ResponseCacheStore {
    db: Database,
    index: Mutex<SizeIndex>,
    max_bytes: u64,
    counters: Counters,
}

impl ResponseCacheStore {
    /// Open (or create) the cache at `path` with a budget of `max_bytes`.
    pub fn open(path: &Path, max_bytes: u64) -> StoreResult<Self> {
        let db = open_database(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RESPONSES)?;
        }
        write_txn.commit()?;

        let mut entries = Vec::new();
        let mut corrupt = Vec::new();
        {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RESPONSES)?;
            for item in table.iter()? {
                let (key, value) = item?;
                let key = key.value().to_string();
                let bytes = value.value();
                match split_frame(bytes) {
                    Ok((meta, _)) => {
                        let size = (key.len() + bytes.len()) as u64;
                        entries.push((meta.stored_at, key, size));
                    }
                    Err(_) => corrupt.push(key),
                }
            }
        }

        if !corrupt.is_empty() {
            warn!(count = corrupt.len(), "Dropping corrupt cached responses");
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(RESPONSES)?;
                for key in &corrupt {
                    table.remove(key.as_str())?;
                }
            }
            write_txn.commit()?;
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut index = SizeIndex {
            lru: LruCache::unbounded(),
            total_bytes: 0,
        };
        for (_, key, size) in entries {
            index.total_bytes += size;
            index.lru.put(key, size);
        }

        info!(
            path = %path.display(),
            entries = index.lru.len(),
            size_bytes = index.total_bytes,
            max_bytes,
            "Response cache opened"
        );

        let store = Self {
            db,
            index: Mutex::new(index),
            max_bytes,
            counters: Counters::default(),
        };
        store.counters.corrupt.store(corrupt.len() as u64, Ordering::Relaxed);
        store.shrink_to_budget()?;
        Ok(store)
    }

    fn index(&self) -> MutexGuard<'_, SizeIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `key`; undecodable entries are removed and count as misses.
    pub fn get(&self, key: &ResponseCacheKey) -> StoreResult<Option<CachedResponse>> {
        let key = key.as_str();
        let bytes = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(RESPONSES)?;
            let value = table.get(key)?;
            value.map(|guard| guard.value().to_vec())
        };

        let Some(bytes) = bytes else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.index().forget(key);
            return Ok(None);
        };

        match decode(&bytes) {
            Ok(response) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.index().lru.promote(key);
                Ok(Some(response))
            }
            Err(reason) => {
                warn!(key, reason, "Corrupt cached response, treating as miss");
                self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.remove_raw(key)?;
                Ok(None)
            }
        }
    }

    /// Store `response`, evicting least recently used entries to stay within
    /// the budget. An entry larger than the whole budget is not cached.
    pub fn put(&self, key: &ResponseCacheKey, response: &CachedResponse) -> StoreResult<()> {
        let key = key.as_str();
        let framed = encode(response)?;
        let size = (key.len() + framed.len()) as u64;

        if size > self.max_bytes {
            debug!(key, size, max_bytes = self.max_bytes, "Response exceeds cache budget, not cached");
            self.remove_raw(key)?;
            return Ok(());
        }

        let mut index = self.index();
        let existing = index.lru.peek(key).copied().unwrap_or(0);
        let mut projected = index.total_bytes - existing + size;
        let mut victims = Vec::new();
        for (victim, victim_size) in index.lru.iter().rev() {
            if projected <= self.max_bytes {
                break;
            }
            if victim == key {
                continue;
            }
            projected -= victim_size;
            victims.push(victim.clone());
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(RESPONSES)?;
            table.insert(key, framed.as_slice())?;
            for victim in &victims {
                table.remove(victim.as_str())?;
            }
        }
        write_txn.commit()?;

        for victim in &victims {
            index.forget(victim);
        }
        index.forget(key);
        index.lru.put(key.to_string(), size);
        index.total_bytes += size;

        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        if !victims.is_empty() {
            self.counters
                .evictions
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
            debug!(evicted = victims.len(), size_bytes = index.total_bytes, "Evicted cached responses");
        }
        Ok(())
    }

    /// Returns `true` when an entry was removed.
    pub fn remove(&self, key: &ResponseCacheKey) -> StoreResult<bool> {
        self.remove_raw(key.as_str())
    }

    fn remove_raw(&self, key: &str) -> StoreResult<bool> {
        let mut index = self.index();
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(RESPONSES)?;
            let removed = table.remove(key)?.is_some();
            removed
        };
        write_txn.commit()?;
        index.forget(key);
        Ok(removed)
    }

    /// Drop every cached response; returns how many were removed.
    pub fn evict_all(&self) -> StoreResult<usize> {
        let mut index = self.index();
        let write_txn = self.db.begin_write()?;
        {
            write_txn.delete_table(RESPONSES)?;
            let _ = write_txn.open_table(RESPONSES)?;
        }
        write_txn.commit()?;

        let removed = index.lru.len();
        index.lru.clear();
        index.total_bytes = 0;
        self.counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        info!(removed, "Response cache cleared");
        Ok(removed)
    }

    fn shrink_to_budget(&self) -> StoreResult<()> {
        let mut index = self.index();
        if index.total_bytes <= self.max_bytes {
            return Ok(());
        }

        let mut projected = index.total_bytes;
        let mut victims = Vec::new();
        for (victim, size) in index.lru.iter().rev() {
            if projected <= self.max_bytes {
                break;
            }
            projected -= size;
            victims.push(victim.clone());
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(RESPONSES)?;
            for victim in &victims {
                table.remove(victim.as_str())?;
            }
        }
        write_txn.commit()?;

        for victim in &victims {
            index.forget(victim);
        }
        self.counters
            .evictions
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        info!(evicted = victims.len(), "Response cache shrunk to budget");
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        self.index().total_bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, size_bytes) = {
            let index = self.index();
            (index.lru.len(), index.total_bytes)
        };
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            corrupt: self.counters.corrupt.load(Ordering::Relaxed),
            entries,
            size_bytes,
            max_bytes: self.max_bytes,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
