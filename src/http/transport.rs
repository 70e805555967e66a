// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Terminal round-trip stage.

use tracing::debug;

use super::{BoxFuture, HttpRequest, HttpResponse};
use crate::config::HttpTimeouts;
use crate::error::{SyncError, SyncResult};

/// Sends one request and returns whatever status came back; only failures to
/// get a response at all are errors.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, SyncResult<HttpResponse>>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with per-call connect/read/overall timeouts.
    pub fn new(timeouts: &HttpTimeouts) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .read_timeout(timeouts.read)
            .timeout(timeouts.request)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn round_trip(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;
        debug!(status = status.as_u16(), bytes = body.len(), "HTTP response received");

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
            from_cache: false,
            stale: None,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, SyncResult<HttpResponse>> {
        Box::pin(self.round_trip(request))
    }
}

fn classify(err: reqwest::Error) -> SyncError {
    if err.is_decode() {
        SyncError::Decode(err.to_string())
    } else if err.is_builder() {
        SyncError::Config(err.to_string())
    } else {
        // Timeouts, refused connections, resets, body read failures.
        SyncError::network(err)
    }
}
