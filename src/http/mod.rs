// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # HTTP Pipeline
//!
//! Every outbound call goes through one fixed chain:
//!
//! ```text
//! Instrumentation ─▶ Auth ─▶ CacheControl ─▶ [extra] ─▶ CachingTransport ─▶ ReqwestTransport
//! ```
//!
//! Instrumentation is outermost, so the interval it records covers header
//! injection, directive rewriting and the cache lookup as well as the round
//! trip. Interceptors may log but always forward the outcome.

pub mod cache_control;
pub mod cache_layer;
pub mod interceptors;
pub mod pipeline;
pub mod transport;

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::models::decode_envelope;

pub use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
pub use reqwest::{Method, StatusCode};

pub use cache_control::CacheDirectives;
pub use cache_layer::CachingTransport;
pub use interceptors::{
    AuthInterceptor, CacheControlInterceptor, InstrumentationInterceptor, StaticToken,
    TokenProvider,
};
pub use pipeline::{HttpPipeline, HttpPipelineBuilder, Interceptor, Next};
pub use transport::{ReqwestTransport, Transport};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// JSON body; the Auth stage fills in `Content-Type`.
    pub fn with_json<T: Serialize>(mut self, body: &T) -> SyncResult<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    /// `application/x-www-form-urlencoded` body.
    pub fn with_form(mut self, fields: &[(&str, &str)]) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.body = Some(encoded.into_bytes());
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        self
    }

    /// Endpoint path, used to name instrumentation spans.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Served by the response cache rather than the network.
    pub from_cache: bool,
    /// Set when the network call failed and an older stored copy answered.
    pub stale: Option<StaleCopy>,
}

/// An older stored response standing in for a failed network call.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleCopy {
    /// When the response was originally received.
    pub stored_at: DateTime<Utc>,
    pub error: SyncError,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            from_cache: false,
            stale: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decode a `{ success, ... }` envelope into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<T> {
        decode_envelope(self.status.as_u16(), &self.body)
    }
}
