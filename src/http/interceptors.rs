// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! The three built-in pipeline stages.

use std::sync::Arc;

use tracing::{debug, warn};

use super::cache_control::{normalize_response, CacheDirectives};
use super::pipeline::{Interceptor, Next};
use super::{header, BoxFuture, HeaderValue, HttpRequest, HttpResponse};
use crate::config::CachePolicyConfig;
use crate::error::SyncResult;
use crate::instrumentation::Instrumentation;

// =============================================================================
// Auth
// =============================================================================

/// Source of the bearer token, written by the login flow.
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed token, for tests and scripted clients.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Adds `Accept`, a `Content-Type` for bodies that lack one, and
/// `Authorization: Bearer …` when a token is stored.
pub struct AuthInterceptor {
    tokens: Arc<dyn TokenProvider>,
}

impl AuthInterceptor {
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self { tokens }
    }

    fn decorate(&self, request: &mut HttpRequest) {
        let headers = &mut request.headers;
        headers
            .entry(header::ACCEPT)
            .or_insert_with(|| HeaderValue::from_static("application/json"));
        if request.body.is_some() {
            headers
                .entry(header::CONTENT_TYPE)
                .or_insert_with(|| HeaderValue::from_static("application/json"));
        }

        if headers.contains_key(header::AUTHORIZATION) {
            return;
        }
        let Some(token) = self.tokens.bearer_token().filter(|t| !t.is_empty()) else {
            return;
        };
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(header::AUTHORIZATION, value);
            }
            Err(_) => warn!("Stored auth token is not a valid header value, sending unauthenticated"),
        }
    }
}

impl Interceptor for AuthInterceptor {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn intercept<'a>(
        &'a self,
        mut request: HttpRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, SyncResult<HttpResponse>> {
        self.decorate(&mut request);
        next.run(request)
    }
}

// =============================================================================
// Cache-Control
// =============================================================================

/// Applies the default request policy when the caller set no directives, and
/// strips directives that would stop the response from being reused.
pub struct CacheControlInterceptor {
    policy: CachePolicyConfig,
}

impl CacheControlInterceptor {
    pub fn new(policy: CachePolicyConfig) -> Self {
        Self { policy }
    }

    fn default_directives(&self) -> CacheDirectives {
        CacheDirectives {
            max_age: Some(self.policy.max_age),
            max_stale: Some(self.policy.max_stale),
            ..Default::default()
        }
    }

    fn apply_request_policy(&self, request: &mut HttpRequest) {
        if request.headers.contains_key(header::CACHE_CONTROL) {
            return;
        }
        if let Ok(value) = HeaderValue::from_str(&self.default_directives().to_header_value()) {
            request.headers.insert(header::CACHE_CONTROL, value);
        }
    }
}

impl Interceptor for CacheControlInterceptor {
    fn name(&self) -> &'static str {
        "cache-control"
    }

    fn intercept<'a>(
        &'a self,
        mut request: HttpRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, SyncResult<HttpResponse>> {
        self.apply_request_policy(&mut request);
        Box::pin(async move {
            let mut response = next.run(request).await?;
            normalize_response(&mut response.headers, self.policy.max_age);
            Ok(response)
        })
    }
}

// =============================================================================
// Instrumentation
// =============================================================================

/// Times the whole remaining chain under `http:{path}`.
pub struct InstrumentationInterceptor {
    instrumentation: Arc<Instrumentation>,
}

impl InstrumentationInterceptor {
    pub fn new(instrumentation: Arc<Instrumentation>) -> Self {
        Self { instrumentation }
    }
}

impl Interceptor for InstrumentationInterceptor {
    fn name(&self) -> &'static str {
        "instrumentation"
    }

    fn intercept<'a>(
        &'a self,
        request: HttpRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, SyncResult<HttpResponse>> {
        Box::pin(async move {
            let method = request.method.clone();
            let path = request.path().to_string();
            let span = self.instrumentation.span(format!("http:{path}"));
            let result = next.run(request).await;
            let elapsed = span.finish();

            match &result {
                Ok(response) => debug!(
                    %method,
                    path,
                    status = response.status.as_u16(),
                    from_cache = response.from_cache,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "HTTP call completed"
                ),
                Err(e) => warn!(
                    %method,
                    path,
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "HTTP call failed"
                ),
            }
            result
        })
    }
}
