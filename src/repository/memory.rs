// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process LRU tier.
//!
//! Holds the most recent value this process knows for each key. Freshness is
//! judged by the caller; entries only leave through capacity pressure or
//! explicit invalidation.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use super::entry::CacheEntry;

pub(crate) struct MemoryTier<V> {
    cache: Mutex<LruCache<String, CacheEntry<V>>>,
}

impl<V: Clone> MemoryTier<V> {
    /// `capacity` is the max number of keys held; zero is treated as one.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let mut cache = self.cache.lock().ok()?;
        cache.get(key).cloned()
    }

    pub(crate) fn put(&self, entry: CacheEntry<V>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(entry.key.clone(), entry);
        }
    }

    /// Insert `entry` unless a newer one is already held.
    pub(crate) fn put_if_newer(&self, entry: CacheEntry<V>) {
        if let Ok(mut cache) = self.cache.lock() {
            let newer_held = cache
                .peek(entry.key.as_str())
                .is_some_and(|held| held.inserted_at >= entry.inserted_at);
            if !newer_held {
                cache.put(entry.key.clone(), entry);
            }
        }
    }

    pub(crate) fn invalidate(&self, key: &str) -> bool {
        self.cache
            .lock()
            .map(|mut cache| cache.pop(key).is_some())
            .unwrap_or(false)
    }

    /// Drop every key starting with `prefix`; returns how many went.
    pub(crate) fn invalidate_prefix(&self, prefix: &str) -> usize {
        let Ok(mut cache) = self.cache.lock() else {
            return 0;
        };
        let doomed: Vec<String> = cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            cache.pop(key.as_str());
        }
        doomed.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::entry::FreshnessPolicy;

    fn entry(key: &str, value: u32) -> CacheEntry<u32> {
        CacheEntry::new(key, value, FreshnessPolicy::default())
    }

    #[test]
    fn put_and_get() {
        let tier = MemoryTier::new(10);
        assert!(tier.get("wallet:1").is_none());
        tier.put(entry("wallet:1", 5));
        assert_eq!(tier.get("wallet:1").unwrap().value, 5);
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let tier = MemoryTier::new(2);
        tier.put(entry("a", 1));
        tier.put(entry("b", 2));
        tier.get("a");
        tier.put(entry("c", 3));
        assert!(tier.get("a").is_some());
        assert!(tier.get("b").is_none());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn put_if_newer_keeps_latest() {
        let tier = MemoryTier::new(4);
        let older = entry("k", 1).with_inserted_at(chrono::Utc::now() - chrono::Duration::seconds(30));
        tier.put(entry("k", 2));
        tier.put_if_newer(older);
        assert_eq!(tier.get("k").unwrap().value, 2);
    }

    #[test]
    fn invalidate_prefix_only_hits_matching_keys() {
        let tier = MemoryTier::new(10);
        tier.put(entry("transactions:w1:1", 1));
        tier.put(entry("transactions:w1:2", 2));
        tier.put(entry("transactions:w2:1", 3));
        tier.put(entry("wallet:current", 4));

        assert_eq!(tier.invalidate_prefix("transactions:w1:"), 2);
        assert!(tier.get("transactions:w2:1").is_some());
        assert!(tier.invalidate("wallet:current"));
        assert!(!tier.invalidate("wallet:current"));
        assert_eq!(tier.len(), 1);
    }
}
