// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Response cache in front of the network transport.
//!
//! Only `GET` is cached. Responses are stored under their normalized
//! directives (see [`normalize_response`]) with an expiry of
//! `stored_at + max-age`. The request's `Cache-Control` directives (normally
//! set by the Cache-Control stage) decide reuse:
//!
//! - unexpired copy within the request's `max-age` and no `no-cache`: served
//!   without a network call
//! - network failure: stored copy younger than `max-age + max-stale` is
//!   served with a `Warning: 110` header and [`HttpResponse::stale`] set
//! - `only-if-cached` with nothing usable: synthetic `504`
//! - `2xx` network responses are stored unless the request said `no-store`
//!
//! Store reads and writes run on the blocking pool of the current runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::cache_control::{normalize_response, CacheDirectives};
use super::transport::Transport;
use super::{
    header, BoxFuture, HeaderMap, HeaderName, HeaderValue, HttpRequest, HttpResponse, Method,
    StaleCopy, StatusCode,
};
use crate::config::CachePolicyConfig;
use crate::error::{SyncError, SyncResult};
use crate::storage::{CachedResponse, ResponseCacheKey, ResponseCacheStore};

const STALE_WARNING: &str = "110 - \"Response is Stale\"";

/// Longest freshness window a stored response is given.
const MAX_RESPONSE_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub struct CachingTransport {
    inner: Arc<dyn Transport>,
    store: Arc<ResponseCacheStore>,
    vary: Vec<HeaderName>,
    default_max_age: Duration,
}

impl CachingTransport {
    /// Cache keys vary on `Authorization` and `Accept` by default.
    pub fn new(inner: Arc<dyn Transport>, store: Arc<ResponseCacheStore>) -> Self {
        Self {
            inner,
            store,
            vary: vec![header::AUTHORIZATION, header::ACCEPT],
            default_max_age: CachePolicyConfig::default().max_age,
        }
    }

    pub fn with_vary(mut self, vary: Vec<HeaderName>) -> Self {
        self.vary = vary;
        self
    }

    /// Freshness window for responses that carry no `max-age`.
    pub fn with_default_max_age(mut self, max_age: Duration) -> Self {
        self.default_max_age = max_age;
        self
    }

    pub fn store(&self) -> &Arc<ResponseCacheStore> {
        &self.store
    }

    fn key_for(&self, request: &HttpRequest) -> ResponseCacheKey {
        let vary: Vec<(&str, &str)> = self
            .vary
            .iter()
            .filter_map(|name| request.header(name).map(|value| (name.as_str(), value)))
            .collect();
        ResponseCacheKey::new(request.method.as_str(), request.url.as_str(), &vary)
    }

    async fn lookup(&self, key: &ResponseCacheKey) -> Option<CachedResponse> {
        let store = Arc::clone(&self.store);
        let owned = key.clone();
        match tokio::task::spawn_blocking(move || store.get(&owned)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(key = key.as_str(), error = %e, "Response cache read failed, treating as miss");
                None
            }
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "Response cache read aborted, treating as miss");
                None
            }
        }
    }

    /// Normalize `response` in place and store it.
    async fn remember(&self, key: &ResponseCacheKey, response: &mut HttpResponse) {
        let directives = normalize_response(&mut response.headers, self.default_max_age);
        let stored_at = Utc::now();
        let cached = CachedResponse {
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: response.body.clone(),
            stored_at,
            expires_at: expiry(stored_at, directives.max_age.unwrap_or(self.default_max_age)),
        };

        let store = Arc::clone(&self.store);
        let owned = key.clone();
        match tokio::task::spawn_blocking(move || store.put(&owned, &cached)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = key.as_str(), error = %e, "Response cache write failed"),
            Err(e) => warn!(key = key.as_str(), error = %e, "Response cache write aborted"),
        }
    }

    async fn exchange(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        if request.method != Method::GET {
            return self.inner.send(request).await;
        }

        let directives = CacheDirectives::from_headers(&request.headers).unwrap_or_default();
        let key = self.key_for(&request);
        let cached = if directives.no_store {
            None
        } else {
            self.lookup(&key).await
        };
        let now = Utc::now();
        let age_of = |c: &CachedResponse| c.age(now).to_std().unwrap_or_default();

        if let Some(hit) = &cached {
            let fresh = hit.is_fresh(now)
                && directives.max_age.is_none_or(|max_age| age_of(hit) <= max_age);
            if fresh && !directives.no_cache {
                debug!(key = key.as_str(), age_ms = age_of(hit).as_millis() as u64, "Response cache hit");
                return Ok(to_response(hit, None));
            }
        }

        let stale_limit = directives.stale_limit();
        if directives.only_if_cached {
            return Ok(match cached.filter(|c| age_of(c) <= stale_limit) {
                Some(copy) => {
                    let stale = (!copy.is_fresh(now)).then(|| StaleCopy {
                        stored_at: copy.stored_at,
                        error: SyncError::network("only-if-cached: network not consulted"),
                    });
                    to_response(&copy, stale)
                }
                None => HttpResponse::new(StatusCode::GATEWAY_TIMEOUT, Vec::new()),
            });
        }

        match self.inner.send(request).await {
            Ok(mut response) => {
                if response.is_success() && !directives.no_store {
                    self.remember(&key, &mut response).await;
                }
                Ok(response)
            }
            Err(err @ SyncError::Network(_)) => match cached.filter(|c| age_of(c) <= stale_limit) {
                Some(copy) => {
                    warn!(key = key.as_str(), error = %err, "Network failed, serving stale cached response");
                    let stale = StaleCopy {
                        stored_at: copy.stored_at,
                        error: err,
                    };
                    Ok(to_response(&copy, Some(stale)))
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

impl Transport for CachingTransport {
    fn send<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, SyncResult<HttpResponse>> {
        Box::pin(self.exchange(request))
    }
}

fn expiry(stored_at: DateTime<Utc>, max_age: Duration) -> DateTime<Utc> {
    let lifetime = chrono::Duration::from_std(max_age.min(MAX_RESPONSE_LIFETIME))
        .unwrap_or_else(|_| chrono::Duration::zero());
    stored_at + lifetime
}

fn to_response(cached: &CachedResponse, stale: Option<StaleCopy>) -> HttpResponse {
    let mut headers = HeaderMap::new();
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    if stale.is_some() {
        headers.insert(header::WARNING, HeaderValue::from_static(STALE_WARNING));
    }
    HttpResponse {
        status: StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
        headers,
        body: cached.body.clone(),
        from_cache: true,
        stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use url::Url;

    struct FakeNetwork {
        calls: AtomicUsize,
        offline: AtomicBool,
        /// Extra response headers.
        headers: Mutex<Vec<(HeaderName, &'static str)>>,
    }

    impl Transport for FakeNetwork {
        fn send<'a>(&'a self, _request: HttpRequest) -> BoxFuture<'a, SyncResult<HttpResponse>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let offline = self.offline.load(Ordering::SeqCst);
            let mut response = HttpResponse::new(StatusCode::OK, format!("body-{n}").into_bytes());
            for (name, value) in self.headers.lock().unwrap().iter() {
                response
                    .headers
                    .append(name.clone(), HeaderValue::from_static(value));
            }
            Box::pin(async move {
                if offline {
                    Err(SyncError::network("connection reset"))
                } else {
                    Ok(response)
                }
            })
        }
    }

    fn setup() -> (CachingTransport, Arc<FakeNetwork>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store =
            Arc::new(ResponseCacheStore::open(&tmp.path().join("responses.redb"), 1 << 20).unwrap());
        let network = Arc::new(FakeNetwork {
            calls: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            headers: Mutex::new(Vec::new()),
        });
        (CachingTransport::new(network.clone(), store), network, tmp)
    }

    fn get(cache_control: &'static str) -> HttpRequest {
        HttpRequest::get(Url::parse("https://api.test/api/wallets/current").unwrap())
            .with_header(header::CACHE_CONTROL, HeaderValue::from_static(cache_control))
    }

    #[tokio::test]
    async fn fresh_copy_skips_network() {
        let (cache, network, _tmp) = setup();
        let first = cache.send(get("max-age=60")).await.unwrap();
        let second = cache.send(get("max-age=60")).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.body, b"body-1");
        assert_eq!(network.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.store().stats().hits, 1);
    }

    #[tokio::test]
    async fn zero_max_age_revalidates() {
        let (cache, network, _tmp) = setup();
        cache.send(get("max-age=0, max-stale=3600")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let second = cache.send(get("max-age=0, max-stale=3600")).await.unwrap();
        assert!(!second.from_cache);
        assert_eq!(network.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn offline_serves_stale_within_max_stale() {
        let (cache, network, _tmp) = setup();
        cache.send(get("no-cache, max-age=0, max-stale=3600")).await.unwrap();
        network.offline.store(true, Ordering::SeqCst);

        let stale = cache.send(get("no-cache, max-age=0, max-stale=3600")).await.unwrap();
        assert!(stale.from_cache);
        assert_eq!(stale.body, b"body-1");
        assert!(stale.header(&header::WARNING).is_some());
        let copy = stale.stale.expect("stale marker");
        assert!(matches!(copy.error, SyncError::Network(_)));
        assert!(copy.stored_at <= Utc::now());
    }

    #[tokio::test]
    async fn server_no_store_is_stripped_before_storing() {
        let (cache, network, _tmp) = setup();
        network.headers.lock().unwrap().extend([
            (header::CACHE_CONTROL, "no-store, no-cache"),
            (header::PRAGMA, "no-cache"),
        ]);

        let first = cache.send(get("max-age=60")).await.unwrap();
        assert!(first.header(&header::PRAGMA).is_none());
        let second = cache.send(get("max-age=60")).await.unwrap();

        assert!(second.from_cache);
        assert!(second.stale.is_none());
        assert_eq!(network.calls.load(Ordering::SeqCst), 1);
        let key = cache.key_for(&get("max-age=60"));
        let stored = cache.store().get(&key).unwrap().unwrap();
        assert!(stored.headers.iter().all(|(name, _)| name != "pragma"));
        assert_eq!(stored.expires_at, stored.stored_at + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn expired_server_max_age_goes_to_network() {
        let (cache, network, _tmp) = setup();
        network
            .headers
            .lock()
            .unwrap()
            .push((header::CACHE_CONTROL, "max-age=0"));

        cache.send(get("max-age=60")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = cache.send(get("max-age=60")).await.unwrap();

        assert!(!second.from_cache);
        assert_eq!(network.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn offline_without_copy_is_an_error() {
        let (cache, network, _tmp) = setup();
        network.offline.store(true, Ordering::SeqCst);
        let err = cache.send(get("max-age=60")).await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
    }

    #[tokio::test]
    async fn only_if_cached_without_copy_is_504() {
        let (cache, network, _tmp) = setup();
        let response = cache.send(get("only-if-cached")).await.unwrap();
        assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(network.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_store_and_post_are_not_cached() {
        let (cache, network, _tmp) = setup();
        cache.send(get("no-store")).await.unwrap();
        cache.send(get("no-store")).await.unwrap();

        let url = Url::parse("https://api.test/api/transfers").unwrap();
        cache.send(HttpRequest::post(url.clone())).await.unwrap();
        cache.send(HttpRequest::post(url)).await.unwrap();

        assert_eq!(network.calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.store().stats().entries, 0);
    }

    #[tokio::test]
    async fn different_tokens_do_not_share_entries() {
        let (cache, network, _tmp) = setup();
        let alice = get("max-age=60")
            .with_header(header::AUTHORIZATION, HeaderValue::from_static("Bearer alice"));
        let bob = get("max-age=60")
            .with_header(header::AUTHORIZATION, HeaderValue::from_static("Bearer bob"));

        cache.send(alice).await.unwrap();
        let for_bob = cache.send(bob).await.unwrap();
        assert!(!for_bob.from_cache);
        assert_eq!(network.calls.load(Ordering::SeqCst), 2);
    }
}
