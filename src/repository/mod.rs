// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Tiered Cache Repository
//!
//! The façade the rest of the app reads and writes through.
//!
//! ## Read path
//!
//! | Tier | Fresh | Stale | Expired / absent |
//! |------|-------|-------|------------------|
//! | memory | return | wait for refresh | check persistent tier |
//! | persistent | return, promote | return, promote, refresh in background | wait for fetch |
//!
//! Network fetches are single-flight per key and run on the I/O pool, so a
//! caller that stops waiting does not cancel the fetch for anyone else. When
//! a fetch fails and a value is known, that value is returned with
//! [`ReadOutcome::degraded`] set; an error only surfaces when nothing is
//! known.
//!
//! A source may answer with an older copy from a cache below it
//! ([`Fetched::stale`]). That counts as a failed fetch: the copy is kept in
//! memory under its original timestamp (unless memory holds something newer)
//! and the read is served degraded.
//!
//! ## Write path
//!
//! [`TieredCacheRepository::write`] replaces the memory entry synchronously
//! and queues the persistent write on the sequential pool. The persistent
//! tier is only ever mutated from that pool.

pub mod entry;
mod memory;
mod single_flight;
pub mod subscriptions;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::dispatcher::TaskDispatcher;
use crate::error::{SyncError, SyncResult};
use crate::http::{BoxFuture, StaleCopy};
use memory::MemoryTier;
use single_flight::{Flight, Joined, SingleFlight};
use subscriptions::SubscriptionRegistry;

pub use entry::{CacheEntry, Freshness, FreshnessPolicy};
pub use subscriptions::{Callback, Subscription};

/// A value produced by a [`RemoteSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<V> {
    pub value: V,
    /// Set when the network failed and a cache below the source answered.
    pub stale: Option<StaleCopy>,
}

impl<V> Fetched<V> {
    pub fn live(value: V) -> Self {
        Self { value, stale: None }
    }

    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Fetched<U> {
        Fetched {
            value: f(self.value),
            stale: self.stale,
        }
    }
}

/// Where values come from when the cache tiers can't answer.
pub trait RemoteSource<V>: Send + Sync + 'static {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SyncResult<Fetched<V>>>;

    /// Combine a fresh fetch with the value held before it.
    ///
    /// The default replaces the old value outright.
    fn reconcile(&self, fetched: V, _previous: &V) -> V {
        fetched
    }
}

/// Durable tier. Implementations are called from pool threads and may block.
pub trait PersistentStore<V>: Send + Sync + 'static {
    /// Undecodable entries are reported as [`SyncError::CacheCorruption`].
    fn load(&self, key: &str) -> SyncResult<Option<CacheEntry<V>>>;
    fn save(&self, entry: &CacheEntry<V>) -> SyncResult<()>;
    fn remove(&self, key: &str) -> SyncResult<bool>;
    fn remove_prefix(&self, prefix: &str) -> SyncResult<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Memory,
    Persistent,
    Network,
}

#[derive(Debug, Clone)]
pub struct ReadOutcome<V> {
    pub value: V,
    pub source: ValueSource,
    /// Freshness of `value` at the time it was returned.
    pub freshness: Freshness,
    /// The fetch error a fallback value is standing in for.
    pub degraded: Option<SyncError>,
}

impl<V> ReadOutcome<V> {
    fn new(value: V, source: ValueSource, freshness: Freshness) -> Self {
        Self {
            value,
            source,
            freshness,
            degraded: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RepositoryOptions {
    pub policy: FreshnessPolicy,
    pub memory_capacity: usize,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            policy: FreshnessPolicy::default(),
            memory_capacity: crate::config::DEFAULT_MEMORY_CAPACITY,
        }
    }
}

impl From<&SyncConfig> for RepositoryOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            policy: FreshnessPolicy::new(config.entry_ttl, config.entry_max_stale),
            memory_capacity: config.memory_capacity,
        }
    }
}

struct Inner<V> {
    memory: MemoryTier<V>,
    flights: SingleFlight<V>,
    subscriptions: SubscriptionRegistry<V>,
    persistent: Arc<dyn PersistentStore<V>>,
    source: Arc<dyn RemoteSource<V>>,
    dispatcher: Arc<TaskDispatcher>,
    policy: FreshnessPolicy,
}

pub struct TieredCacheRepository<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TieredCacheRepository<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TieredCacheRepository<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        source: Arc<dyn RemoteSource<V>>,
        persistent: Arc<dyn PersistentStore<V>>,
        dispatcher: Arc<TaskDispatcher>,
        options: RepositoryOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                memory: MemoryTier::new(options.memory_capacity),
                flights: SingleFlight::new(),
                subscriptions: SubscriptionRegistry::new(),
                persistent,
                source,
                dispatcher,
                policy: options.policy,
            }),
        }
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.inner.policy
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.inner.dispatcher
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Resolve `key` through memory, then the persistent tier, then the
    /// network.
    pub async fn read(&self, key: &str) -> SyncResult<ReadOutcome<V>> {
        if let Some(entry) = self.inner.memory.get(key) {
            let freshness = entry.freshness();
            if freshness == Freshness::Fresh {
                debug!(key, "Memory hit");
                return Ok(ReadOutcome::new(entry.value, ValueSource::Memory, freshness));
            }
            debug!(key, ?freshness, "Memory entry needs refresh");
            let result = self.fetch_shared(key, false).await;
            return self.settle_read(key, result, Some((entry, ValueSource::Memory)));
        }

        match self.load_persistent(key).await {
            Some(entry) => match entry.freshness() {
                Freshness::Expired => {
                    debug!(key, "Persistent entry expired, fetching");
                    let result = self.fetch_shared(key, false).await;
                    self.settle_read(key, result, Some((entry, ValueSource::Persistent)))
                }
                freshness => {
                    debug!(key, ?freshness, "Persistent hit");
                    self.inner.memory.put_if_newer(entry.clone());
                    if freshness == Freshness::Stale {
                        self.refresh_in_background(key);
                    }
                    Ok(ReadOutcome::new(entry.value, ValueSource::Persistent, freshness))
                }
            },
            None => {
                debug!(key, "Cache miss, fetching");
                let result = self.fetch_shared(key, false).await;
                self.settle_read(key, result, None)
            }
        }
    }

    /// Force a network fetch, ignoring tier freshness. Still single-flight.
    pub async fn refresh(&self, key: &str) -> SyncResult<ReadOutcome<V>> {
        let result = self.fetch_shared(key, true).await;
        if result.is_ok() {
            return self.settle_read(key, result, None);
        }
        let fallback = match self.inner.memory.get(key) {
            Some(entry) => Some((entry, ValueSource::Memory)),
            None => self
                .load_persistent(key)
                .await
                .map(|entry| (entry, ValueSource::Persistent)),
        };
        self.settle_read(key, result, fallback)
    }

    /// Memory entry for `key`, without any freshness handling.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        self.inner.memory.get(key)
    }

    /// Whether a network fetch for `key` is running.
    pub fn is_fetching(&self, key: &str) -> bool {
        self.inner.flights.is_pending(key)
    }

    pub fn fetches_in_flight(&self) -> usize {
        self.inner.flights.in_flight()
    }

    fn settle_read(
        &self,
        key: &str,
        result: SyncResult<V>,
        fallback: Option<(CacheEntry<V>, ValueSource)>,
    ) -> SyncResult<ReadOutcome<V>> {
        let err = match result {
            Ok(value) => return Ok(ReadOutcome::new(value, ValueSource::Network, Freshness::Fresh)),
            Err(err) => err,
        };
        // The failed fetch may have left an older copy in memory.
        let held = self.inner.memory.get(key).map(|entry| (entry, ValueSource::Memory));
        match newest(fallback, held) {
            Some((entry, source)) => {
                warn!(key, error = %err, ?source, "Fetch failed, serving last known value");
                let freshness = entry.freshness();
                Ok(ReadOutcome {
                    value: entry.value,
                    source,
                    freshness,
                    degraded: Some(err),
                })
            }
            None => Err(err),
        }
    }

    async fn load_persistent(&self, key: &str) -> Option<CacheEntry<V>> {
        let store = Arc::clone(&self.inner.persistent);
        let owned = key.to_string();
        let loaded = self
            .inner
            .dispatcher
            .io_call("persistent-load", move || store.load(&owned))
            .await;

        match loaded {
            Ok(Ok(entry)) => entry,
            Ok(Err(err @ SyncError::CacheCorruption { .. })) => {
                warn!(key, error = %err, "Corrupt persistent entry, treating as miss");
                self.remove_persistent(key);
                None
            }
            Ok(Err(err)) | Err(err) => {
                warn!(key, error = %err, "Persistent tier unavailable");
                None
            }
        }
    }

    // =========================================================================
    // Single-flight fetches
    // =========================================================================

    async fn fetch_shared(&self, key: &str, force: bool) -> SyncResult<V> {
        let waiter = match self.inner.flights.join(key) {
            Joined::Follower(waiter) => waiter,
            Joined::Leader(flight, waiter) => {
                if !force {
                    // A fetch may have settled between the tier check and the join.
                    if let Some(entry) = self.inner.memory.get(key) {
                        if entry.freshness() == Freshness::Fresh {
                            flight.settle(Ok(entry.value.clone()));
                            return Ok(entry.value);
                        }
                    }
                }
                self.launch(flight);
                waiter
            }
        };
        waiter.wait().await
    }

    fn refresh_in_background(&self, key: &str) {
        if let Joined::Leader(flight, _) = self.inner.flights.join(key) {
            debug!(key, "Scheduling background refresh");
            self.launch(flight);
        }
    }

    fn launch(&self, flight: Flight<V>) {
        let repo = self.clone();
        let spawned = self.inner.dispatcher.spawn_io("fetch", async move {
            let key = flight.key().to_string();
            let span = repo
                .inner
                .dispatcher
                .instrumentation()
                .span(format!("network:{}", key_family(&key)));
            let result = repo.inner.source.fetch(&key).await;
            span.finish();

            match result {
                Ok(Fetched { value, stale: None }) => {
                    let value = repo.accept_fetched(&key, value).await;
                    let waiters = flight.settle(Ok(value));
                    debug!(key, waiters, "Fetch settled");
                    Ok(())
                }
                Ok(Fetched {
                    value,
                    stale: Some(copy),
                }) => {
                    repo.keep_stale_copy(&key, value, &copy);
                    flight.settle(Err(copy.error.clone()));
                    Err(copy.error)
                }
                Err(err) => {
                    flight.settle(Err(err.clone()));
                    Err(err)
                }
            }
        });
        if let Err(err) = spawned {
            // The dropped flight has already released every waiter.
            warn!(error = %err, "Could not schedule fetch");
        }
    }

    /// Install a fetched value in every tier and notify subscribers.
    ///
    /// The value is reconciled against the memory copy, or the persistent
    /// copy when memory has none.
    async fn accept_fetched(&self, key: &str, fetched: V) -> V {
        let previous = match self.inner.memory.get(key) {
            Some(entry) => Some(entry),
            None => self.load_persistent(key).await,
        };
        let value = match previous {
            Some(previous) => self.inner.source.reconcile(fetched, &previous.value),
            None => fetched,
        };
        let entry = CacheEntry::new(key, value.clone(), self.inner.policy);
        self.inner.memory.put(entry.clone());
        self.notify(key, &value);
        if let Err(err) = self.persist(entry) {
            warn!(key, error = %err, "Persistent write not scheduled");
        }
        value
    }

    /// Keep a copy served from below the source, dated when it was stored.
    /// It never replaces a newer memory entry and is not persisted.
    fn keep_stale_copy(&self, key: &str, value: V, copy: &StaleCopy) {
        warn!(
            key,
            stored_at = %copy.stored_at,
            error = %copy.error,
            "Source answered with an older cached copy"
        );
        let entry = CacheEntry::new(key, value, self.inner.policy).with_inserted_at(copy.stored_at);
        self.inner.memory.put_if_newer(entry);
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Replace the value for `key`.
    ///
    /// The memory entry is visible to the next read immediately; the
    /// persistent write is queued behind earlier writes on the sequential
    /// pool.
    pub fn write(&self, key: &str, value: V) -> SyncResult<()> {
        let entry = CacheEntry::new(key, value, self.inner.policy);
        self.inner.memory.put(entry.clone());
        self.notify(key, &entry.value);
        self.persist(entry)
    }

    /// Drop `key` from both tiers.
    pub fn invalidate(&self, key: &str) {
        self.inner.memory.invalidate(key);
        self.remove_persistent(key);
    }

    /// Drop every key starting with `prefix` from both tiers.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let dropped = self.inner.memory.invalidate_prefix(prefix);
        let store = Arc::clone(&self.inner.persistent);
        let owned = prefix.to_string();
        if let Err(err) = self
            .inner
            .dispatcher
            .spawn_sequential("persistent-remove", move || store.remove_prefix(&owned).map(drop))
        {
            warn!(prefix, error = %err, "Persistent removal not scheduled");
        }
        debug!(prefix, dropped, "Invalidated cached keys");
        dropped
    }

    /// Resolve once every persistent write queued so far has been applied.
    pub async fn flush(&self) -> SyncResult<()> {
        self.inner.dispatcher.flush_sequential().await
    }

    fn persist(&self, entry: CacheEntry<V>) -> SyncResult<()> {
        let store = Arc::clone(&self.inner.persistent);
        self.inner
            .dispatcher
            .spawn_sequential("persistent-save", move || store.save(&entry))?;
        Ok(())
    }

    fn remove_persistent(&self, key: &str) {
        let store = Arc::clone(&self.inner.persistent);
        let owned = key.to_string();
        if let Err(err) = self
            .inner
            .dispatcher
            .spawn_sequential("persistent-remove", move || store.remove(&owned).map(drop))
        {
            warn!(key, error = %err, "Persistent removal not scheduled");
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Call `callback` on the UI context whenever a key under `prefix` gets a
    /// new value. Keep the returned token for as long as updates are wanted.
    pub fn subscribe<F>(&self, prefix: &str, callback: F) -> Subscription
    where
        F: Fn(&str, &V) + Send + Sync + 'static,
    {
        self.inner.subscriptions.subscribe(prefix, Arc::new(callback))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    fn notify(&self, key: &str, value: &V) {
        for callback in self.inner.subscriptions.matching(key) {
            let key = key.to_string();
            let value = value.clone();
            self.inner
                .dispatcher
                .run_on_ui("notify", move || callback(&key, &value));
        }
    }
}

/// Newer of two candidate fallbacks; `a` wins ties.
fn newest<V>(
    a: Option<(CacheEntry<V>, ValueSource)>,
    b: Option<(CacheEntry<V>, ValueSource)>,
) -> Option<(CacheEntry<V>, ValueSource)> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.0.inserted_at > a.0.inserted_at { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// `wallet:1` → `wallet`, so span names stay bounded by key family.
fn key_family(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use crate::config::PoolConfig;
    use crate::dispatcher::InlineUiExecutor;
    use crate::instrumentation::Instrumentation;
    use crate::storage::SnapshotDb;

    /// Returns `"{key}#{n}"` for the n-th call, optionally failing or
    /// answering with an older copy stored at `stale_from`.
    struct CountingSource {
        calls: AtomicUsize,
        fail: AtomicBool,
        joins: AtomicBool,
        stale_from: Mutex<Option<DateTime<Utc>>>,
        delay: Duration,
    }

    impl CountingSource {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                joins: AtomicBool::new(false),
                stale_from: Mutex::new(None),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RemoteSource<String> for CountingSource {
        fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SyncResult<Fetched<String>>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.delay).await;
                if self.fail.load(Ordering::SeqCst) {
                    return Err(SyncError::network("connection refused"));
                }
                let value = format!("{key}#{n}");
                match *self.stale_from.lock().unwrap() {
                    Some(stored_at) => Ok(Fetched {
                        value,
                        stale: Some(StaleCopy {
                            stored_at,
                            error: SyncError::network("connection refused"),
                        }),
                    }),
                    None => Ok(Fetched::live(value)),
                }
            })
        }

        fn reconcile(&self, fetched: String, previous: &String) -> String {
            if self.joins.load(Ordering::SeqCst) {
                format!("{previous}+{fetched}")
            } else {
                fetched
            }
        }
    }

    #[derive(Default)]
    struct MapStore {
        entries: Mutex<HashMap<String, CacheEntry<String>>>,
    }

    impl PersistentStore<String> for MapStore {
        fn load(&self, key: &str) -> SyncResult<Option<CacheEntry<String>>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        fn save(&self, entry: &CacheEntry<String>) -> SyncResult<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(entry.key.clone(), entry.clone());
            Ok(())
        }

        fn remove(&self, key: &str) -> SyncResult<bool> {
            Ok(self.entries.lock().unwrap().remove(key).is_some())
        }

        fn remove_prefix(&self, prefix: &str) -> SyncResult<usize> {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|k, _| !k.starts_with(prefix));
            Ok(before - entries.len())
        }
    }

    struct Fixture {
        repo: TieredCacheRepository<String>,
        source: Arc<CountingSource>,
        store: Arc<MapStore>,
        dispatcher: Arc<TaskDispatcher>,
    }

    fn dispatcher() -> Arc<TaskDispatcher> {
        let inst = Arc::new(Instrumentation::default());
        Arc::new(
            TaskDispatcher::new(
                PoolConfig::for_parallelism(4),
                inst,
                Arc::new(InlineUiExecutor),
            )
            .unwrap(),
        )
    }

    fn repo_over(
        source: Arc<CountingSource>,
        store: Arc<dyn PersistentStore<String>>,
        dispatcher: Arc<TaskDispatcher>,
    ) -> TieredCacheRepository<String> {
        TieredCacheRepository::new(
            source,
            store,
            dispatcher,
            RepositoryOptions {
                policy: FreshnessPolicy::new(Duration::from_secs(60), Duration::from_secs(600)),
                memory_capacity: 16,
            },
        )
    }

    fn fixture(delay: Duration) -> Fixture {
        let dispatcher = dispatcher();
        let source = CountingSource::new(delay);
        let store = Arc::new(MapStore::default());
        let repo = repo_over(source.clone(), store.clone(), Arc::clone(&dispatcher));
        Fixture {
            repo,
            source,
            store,
            dispatcher,
        }
    }

    fn aged(key: &str, value: &str, age_secs: i64) -> CacheEntry<String> {
        let policy = FreshnessPolicy::new(Duration::from_secs(60), Duration::from_secs(600));
        CacheEntry::new(key, value.to_string(), policy)
            .with_inserted_at(chrono::Utc::now() - chrono::Duration::seconds(age_secs))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn miss_fetches_and_persists() {
        let f = fixture(Duration::ZERO);
        let outcome = f.repo.read("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "wallet:1#1");
        assert_eq!(outcome.source, ValueSource::Network);

        let again = f.repo.read("wallet:1").await.unwrap();
        assert_eq!(again.source, ValueSource::Memory);
        assert_eq!(f.source.calls(), 1);

        f.repo.flush().await.unwrap();
        assert!(f.store.entries.lock().unwrap().contains_key("wallet:1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_is_visible_before_persistence() {
        let f = fixture(Duration::ZERO);
        f.repo.write("wallet:1", "local".to_string()).unwrap();
        let outcome = f.repo.read("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "local");
        assert_eq!(outcome.source, ValueSource::Memory);
        assert_eq!(f.source.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_persistent_entry_is_served_and_refreshed() {
        let f = fixture(Duration::from_millis(20));
        f.store.save(&aged("wallet:1", "old", 120)).unwrap();

        let outcome = f.repo.read("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "old");
        assert_eq!(outcome.source, ValueSource::Persistent);
        assert_eq!(outcome.freshness, Freshness::Stale);

        for _ in 0..50 {
            if f.repo.peek("wallet:1").is_some_and(|e| e.value == "wallet:1#1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.repo.peek("wallet:1").unwrap().value, "wallet:1#1");
        assert_eq!(f.source.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_persistent_entry_blocks_on_fetch() {
        let f = fixture(Duration::ZERO);
        f.store.save(&aged("wallet:1", "ancient", 3600)).unwrap();

        let outcome = f.repo.read("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "wallet:1#1");
        assert_eq!(outcome.source, ValueSource::Network);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failure_without_fallback_is_an_error() {
        let f = fixture(Duration::ZERO);
        f.source.fail.store(true, Ordering::SeqCst);
        let err = f.repo.read("wallet:1").await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
        assert!(!f.repo.is_fetching("wallet:1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refresh_failure_falls_back_to_memory() {
        let f = fixture(Duration::ZERO);
        f.repo.write("wallet:1", "known".to_string()).unwrap();
        f.source.fail.store(true, Ordering::SeqCst);

        let outcome = f.repo.refresh("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "known");
        assert!(outcome.is_degraded());
        assert_eq!(f.source.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_refreshes_share_one_fetch() {
        let f = fixture(Duration::from_millis(50));
        let reads: Vec<_> = (0..5)
            .map(|_| {
                let repo = f.repo.clone();
                tokio::spawn(async move { repo.refresh("wallet:1").await })
            })
            .collect();
        for read in reads {
            assert_eq!(read.await.unwrap().unwrap().value, "wallet:1#1");
        }
        assert_eq!(f.source.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_read_does_not_cancel_fetch() {
        let f = fixture(Duration::from_millis(50));
        let repo = f.repo.clone();
        let abandoned = tokio::spawn(async move { repo.read("wallet:1").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();

        let outcome = f.repo.read("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "wallet:1#1");
        assert_eq!(f.source.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalidate_prefix_clears_both_tiers() {
        let f = fixture(Duration::ZERO);
        f.repo.write("transactions:w1:1", "p1".into()).unwrap();
        f.repo.write("transactions:w1:2", "p2".into()).unwrap();
        f.repo.write("wallet:current", "w".into()).unwrap();
        f.repo.flush().await.unwrap();

        assert_eq!(f.repo.invalidate_prefix("transactions:w1:"), 2);
        f.repo.flush().await.unwrap();

        assert!(f.repo.peek("transactions:w1:1").is_none());
        let entries = f.store.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("wallet:current"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribers_see_new_values_until_cancelled() {
        let f = fixture(Duration::ZERO);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = {
            let seen = Arc::clone(&seen);
            f.repo.subscribe("wallet:", move |key, value: &String| {
                seen.lock().unwrap().push(format!("{key}={value}"));
            })
        };

        f.repo.write("wallet:1", "a".into()).unwrap();
        f.repo.write("other:1", "b".into()).unwrap();
        token.cancel();
        f.repo.write("wallet:1", "c".into()).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["wallet:1=a".to_string()]);
        assert_eq!(f.repo.subscriber_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetches_are_instrumented_per_key_family() {
        let f = fixture(Duration::ZERO);
        f.repo.read("wallet:1").await.unwrap();
        f.repo.read("wallet:1").await.unwrap();
        f.repo.read("wallet:2").await.unwrap();
        f.repo.read("transactions:w1:1").await.unwrap();
        let inst = f.dispatcher.instrumentation();
        assert_eq!(inst.count("network:wallet"), 2);
        assert_eq!(inst.count("network:transactions"), 1);
        assert_eq!(inst.count("network:wallet:1"), 0);
        assert_eq!(inst.count_prefix("network:"), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_memory_entry_blocks_on_fetch() {
        let f = fixture(Duration::ZERO);
        f.repo.inner.memory.put(aged("wallet:1", "ancient", 3600));

        let outcome = f.repo.read("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "wallet:1#1");
        assert_eq!(outcome.source, ValueSource::Network);
        assert_eq!(f.repo.peek("wallet:1").unwrap().freshness(), Freshness::Fresh);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_memory_entry_is_served_degraded_when_offline() {
        let f = fixture(Duration::ZERO);
        f.repo.inner.memory.put(aged("wallet:1", "ancient", 3600));
        f.source.fail.store(true, Ordering::SeqCst);

        let outcome = f.repo.read("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "ancient");
        assert_eq!(outcome.source, ValueSource::Memory);
        assert_eq!(outcome.freshness, Freshness::Expired);
        assert!(outcome.is_degraded());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn corrupt_persistent_row_is_refetched_and_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(SnapshotDb::open(&tmp.path().join("snapshots.redb")).unwrap());
        db.put_raw("wallet:1", b"{not json").unwrap();
        let source = CountingSource::new(Duration::ZERO);
        let repo = repo_over(source.clone(), db.clone(), dispatcher());

        let outcome = repo.read("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "wallet:1#1");
        assert_eq!(outcome.source, ValueSource::Network);
        assert_eq!(source.calls(), 1);

        repo.flush().await.unwrap();
        let stored = PersistentStore::<String>::load(&*db, "wallet:1").unwrap().unwrap();
        assert_eq!(stored.value, "wallet:1#1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn corrupt_persistent_row_is_removed_even_when_offline() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(SnapshotDb::open(&tmp.path().join("snapshots.redb")).unwrap());
        db.put_raw("wallet:1", b"{not json").unwrap();
        let source = CountingSource::new(Duration::ZERO);
        source.fail.store(true, Ordering::SeqCst);
        let repo = repo_over(source.clone(), db.clone(), dispatcher());

        let err = repo.read("wallet:1").await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));

        repo.flush().await.unwrap();
        assert!(db.get_raw("wallet:1").unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn older_copy_from_source_is_degraded_and_keeps_its_time() {
        let f = fixture(Duration::ZERO);
        let stored_at = Utc::now() - chrono::Duration::seconds(120);
        *f.source.stale_from.lock().unwrap() = Some(stored_at);

        let outcome = f.repo.read("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "wallet:1#1");
        assert_eq!(outcome.source, ValueSource::Memory);
        assert_eq!(outcome.freshness, Freshness::Stale);
        assert!(matches!(outcome.degraded, Some(SyncError::Network(_))));

        let held = f.repo.peek("wallet:1").unwrap();
        assert_eq!(held.inserted_at, stored_at);
        f.repo.flush().await.unwrap();
        assert!(f.store.entries.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn older_copy_from_source_never_replaces_newer_memory() {
        let f = fixture(Duration::ZERO);
        f.repo.write("wallet:1", "local".to_string()).unwrap();
        *f.source.stale_from.lock().unwrap() = Some(Utc::now() - chrono::Duration::seconds(120));

        let outcome = f.repo.refresh("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "local");
        assert!(outcome.is_degraded());
        assert_eq!(f.repo.peek("wallet:1").unwrap().value, "local");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconcile_uses_persistent_copy_when_memory_is_empty() {
        let f = fixture(Duration::ZERO);
        f.source.joins.store(true, Ordering::SeqCst);
        f.store.save(&aged("wallet:1", "old", 3600)).unwrap();

        let outcome = f.repo.read("wallet:1").await.unwrap();
        assert_eq!(outcome.value, "old+wallet:1#1");
        assert_eq!(f.repo.peek("wallet:1").unwrap().value, "old+wallet:1#1");
    }
}
