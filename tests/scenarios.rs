// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! End-to-end behavior of the tiered repository and the response cache,
//! driven through the public API with a scripted wallet backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use wallet_sync::dispatcher::TaskDispatcher;
use wallet_sync::http::BoxFuture;
use wallet_sync::instrumentation::Instrumentation;
use wallet_sync::models::WalletSnapshot;
use wallet_sync::repository::{
    CacheEntry, Fetched, Freshness, FreshnessPolicy, PersistentStore, RemoteSource,
    RepositoryOptions, TieredCacheRepository, ValueSource,
};
use wallet_sync::storage::{CachedResponse, ResponseCacheKey, ResponseCacheStore, SnapshotDb};
use wallet_sync::{SyncError, SyncResult};

// =============================================================================
// Fixtures
// =============================================================================

fn snapshot(wallet_id: &str, balance: f64) -> WalletSnapshot {
    WalletSnapshot {
        wallet_id: wallet_id.to_string(),
        wallet_name: None,
        balance,
        currency_code: "CNY".to_string(),
        last_updated: Utc::now(),
    }
}

/// Wallet backend answering `wallet:{id}` with the configured balance.
struct FakeWalletApi {
    calls: AtomicUsize,
    offline: AtomicBool,
    balance: Mutex<f64>,
    delay: Duration,
}

impl FakeWalletApi {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            balance: Mutex::new(100.0),
            delay,
        })
    }

    fn set_balance(&self, balance: f64) {
        *self.balance.lock().unwrap() = balance;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RemoteSource<WalletSnapshot> for FakeWalletApi {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SyncResult<Fetched<WalletSnapshot>>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.offline.load(Ordering::SeqCst) {
                return Err(SyncError::network("connection refused"));
            }
            let id = key.strip_prefix("wallet:").unwrap_or(key);
            let balance = *self.balance.lock().unwrap();
            Ok(Fetched::live(snapshot(id, balance)))
        })
    }
}

/// Records every save before handing it to the real snapshot database.
struct RecordingStore {
    inner: SnapshotDb,
    saved: Mutex<Vec<f64>>,
}

impl PersistentStore<WalletSnapshot> for RecordingStore {
    fn load(&self, key: &str) -> SyncResult<Option<CacheEntry<WalletSnapshot>>> {
        self.inner.load(key)
    }

    fn save(&self, entry: &CacheEntry<WalletSnapshot>) -> SyncResult<()> {
        self.saved.lock().unwrap().push(entry.value.balance);
        self.inner.save(entry)
    }

    fn remove(&self, key: &str) -> SyncResult<bool> {
        PersistentStore::<WalletSnapshot>::remove(&self.inner, key)
    }

    fn remove_prefix(&self, prefix: &str) -> SyncResult<usize> {
        PersistentStore::<WalletSnapshot>::remove_prefix(&self.inner, prefix)
    }
}

struct Harness {
    repo: TieredCacheRepository<WalletSnapshot>,
    api: Arc<FakeWalletApi>,
    instrumentation: Arc<Instrumentation>,
    store: Arc<RecordingStore>,
    _tmp: tempfile::TempDir,
}

impl Harness {
    fn new(policy: FreshnessPolicy, fetch_delay: Duration) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let instrumentation = Arc::new(Instrumentation::default());
        let dispatcher =
            Arc::new(TaskDispatcher::with_defaults(Arc::clone(&instrumentation)).unwrap());
        let store = Arc::new(RecordingStore {
            inner: SnapshotDb::open(&tmp.path().join("snapshots.redb")).unwrap(),
            saved: Mutex::new(Vec::new()),
        });
        let api = FakeWalletApi::new(fetch_delay);
        let repo = TieredCacheRepository::<WalletSnapshot>::new(
            api.clone(),
            store.clone(),
            dispatcher,
            RepositoryOptions {
                policy,
                memory_capacity: 64,
            },
        );
        Self {
            repo,
            api,
            instrumentation,
            store,
            _tmp: tmp,
        }
    }

    fn network_calls(&self) -> u64 {
        self.instrumentation.count_prefix("network:")
    }
}

fn short_ttl() -> FreshnessPolicy {
    FreshnessPolicy::new(Duration::from_millis(50), Duration::from_secs(3600))
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn warm_memory_read_makes_no_network_call() {
    let h = Harness::new(FreshnessPolicy::default(), Duration::ZERO);
    let warm = snapshot("1", 42.0);
    h.repo.write("wallet:1", warm.clone()).unwrap();

    let outcome = h.repo.read("wallet:1").await.unwrap();

    assert_eq!(outcome.value, warm);
    assert_eq!(outcome.source, ValueSource::Memory);
    assert_eq!(outcome.freshness, Freshness::Fresh);
    assert_eq!(h.network_calls(), 0);
    assert_eq!(h.api.calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn thundering_herd_on_stale_entry_fetches_once() {
    let h = Harness::new(short_ttl(), Duration::from_millis(100));
    h.repo.write("wallet:1", snapshot("1", 10.0)).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.repo.peek("wallet:1").unwrap().freshness(), Freshness::Stale);

    h.api.set_balance(25.0);
    let readers: Vec<_> = (0..10)
        .map(|_| {
            let repo = h.repo.clone();
            tokio::spawn(async move { repo.read("wallet:1").await })
        })
        .collect();

    let mut values = Vec::new();
    for reader in readers {
        values.push(reader.await.unwrap().unwrap().value);
    }

    assert_eq!(h.api.calls(), 1);
    assert_eq!(h.network_calls(), 1);
    assert_eq!(values[0].balance, 25.0);
    assert!(values.iter().all(|v| *v == values[0]));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_fetch_falls_back_to_cached_snapshot() {
    let h = Harness::new(short_ttl(), Duration::ZERO);
    h.repo.write("wallet:1", snapshot("1", 10.0)).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    h.api.offline.store(true, Ordering::SeqCst);
    let outcome = h.repo.read("wallet:1").await.unwrap();

    assert_eq!(outcome.value.balance, 10.0);
    assert!(outcome.is_degraded());
    assert!(matches!(outcome.degraded, Some(SyncError::Network(_))));
    assert_eq!(h.api.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_fetch_without_cache_is_an_error() {
    let h = Harness::new(FreshnessPolicy::default(), Duration::ZERO);
    h.api.offline.store(true, Ordering::SeqCst);

    let err = h.repo.read("wallet:1").await.unwrap_err();
    assert!(err.is_recoverable());
}

#[test]
fn response_cache_overflow_evicts_oldest() {
    const MIB: usize = 1024 * 1024;
    let tmp = tempfile::tempdir().unwrap();
    let store =
        ResponseCacheStore::open(&tmp.path().join("responses.redb"), 10 * MIB as u64).unwrap();

    let keys: Vec<ResponseCacheKey> = (0..12)
        .map(|i| ResponseCacheKey::new("GET", &format!("https://api.test/api/blob/{i}"), &[]))
        .collect();
    for key in &keys {
        let response = CachedResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/octet-stream".to_string())],
            body: vec![7u8; MIB],
            stored_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        };
        store.put(key, &response).unwrap();
    }

    assert!(store.size_bytes() <= store.max_bytes());
    assert!(store.get(&keys[0]).unwrap().is_none());
    assert!(store.get(&keys[1]).unwrap().is_none());
    assert!(store.get(&keys[11]).unwrap().is_some());
    assert!(store.stats().evictions >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_from_two_threads_apply_in_order() {
    let h = Harness::new(FreshnessPolicy::default(), Duration::ZERO);

    std::thread::scope(|scope| {
        scope
            .spawn(|| h.repo.write("wallet:1", snapshot("1", 1.0)).unwrap())
            .join()
            .unwrap();
        scope
            .spawn(|| h.repo.write("wallet:1", snapshot("1", 2.0)).unwrap())
            .join()
            .unwrap();
    });

    assert_eq!(h.repo.read("wallet:1").await.unwrap().value.balance, 2.0);

    h.repo.flush().await.unwrap();
    assert_eq!(*h.store.saved.lock().unwrap(), vec![1.0, 2.0]);
    let stored = h.store.load("wallet:1").unwrap().unwrap();
    assert_eq!(stored.value.balance, 2.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn persisted_snapshot_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("snapshots.redb");

    {
        let instrumentation = Arc::new(Instrumentation::default());
        let dispatcher = Arc::new(TaskDispatcher::with_defaults(instrumentation).unwrap());
        let repo = TieredCacheRepository::<WalletSnapshot>::new(
            FakeWalletApi::new(Duration::ZERO),
            Arc::new(SnapshotDb::open(&path).unwrap()),
            dispatcher,
            RepositoryOptions::default(),
        );
        repo.read("wallet:1").await.unwrap();
        repo.flush().await.unwrap();
    }

    let instrumentation = Arc::new(Instrumentation::default());
    let dispatcher = Arc::new(TaskDispatcher::with_defaults(Arc::clone(&instrumentation)).unwrap());
    let api = FakeWalletApi::new(Duration::ZERO);
    api.offline.store(true, Ordering::SeqCst);
    let repo = TieredCacheRepository::<WalletSnapshot>::new(
        api.clone(),
        Arc::new(SnapshotDb::open(&path).unwrap()),
        dispatcher,
        RepositoryOptions::default(),
    );

    let outcome = repo.read("wallet:1").await.unwrap();
    assert_eq!(outcome.source, ValueSource::Persistent);
    assert_eq!(outcome.value.balance, 100.0);
    assert_eq!(api.calls(), 0);
    assert_eq!(instrumentation.count_prefix("network:"), 0);
}
