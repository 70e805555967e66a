// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Interceptor chain composition.

use std::sync::Arc;

use super::interceptors::{
    AuthInterceptor, CacheControlInterceptor, InstrumentationInterceptor, TokenProvider,
};
use super::transport::Transport;
use super::{BoxFuture, HttpRequest, HttpResponse};
use crate::config::CachePolicyConfig;
use crate::error::SyncResult;
use crate::instrumentation::Instrumentation;

/// One stage of the chain. Implementations call `next.run(...)` exactly once
/// and return its outcome, possibly transformed; errors are never swallowed.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn intercept<'a>(
        &'a self,
        request: HttpRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, SyncResult<HttpResponse>>;
}

/// The rest of the chain after the current stage.
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    transport: &'a dyn Transport,
}

impl<'a> Next<'a> {
    pub fn run(self, request: HttpRequest) -> BoxFuture<'a, SyncResult<HttpResponse>> {
        match self.interceptors.split_first() {
            Some((stage, rest)) => stage.intercept(
                request,
                Next {
                    interceptors: rest,
                    transport: self.transport,
                },
            ),
            None => self.transport.send(request),
        }
    }
}

pub struct HttpPipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
    transport: Arc<dyn Transport>,
}

impl HttpPipeline {
    pub fn builder(transport: Arc<dyn Transport>) -> HttpPipelineBuilder {
        HttpPipelineBuilder {
            transport,
            instrumentation: None,
            auth: None,
            cache_control: None,
            extra: Vec::new(),
        }
    }

    pub async fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        Next {
            interceptors: &self.interceptors,
            transport: self.transport.as_ref(),
        }
        .run(request)
        .await
    }

    /// Stage names, outermost first.
    pub fn stages(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }
}

/// Collects the stages; [`build`](Self::build) puts them in the fixed order
/// Instrumentation, Auth, CacheControl, then extras in insertion order.
pub struct HttpPipelineBuilder {
    transport: Arc<dyn Transport>,
    instrumentation: Option<Arc<dyn Interceptor>>,
    auth: Option<Arc<dyn Interceptor>>,
    cache_control: Option<Arc<dyn Interceptor>>,
    extra: Vec<Arc<dyn Interceptor>>,
}

impl HttpPipelineBuilder {
    pub fn instrumentation(mut self, instrumentation: Arc<Instrumentation>) -> Self {
        self.instrumentation = Some(Arc::new(InstrumentationInterceptor::new(instrumentation)));
        self
    }

    pub fn auth(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.auth = Some(Arc::new(AuthInterceptor::new(tokens)));
        self
    }

    pub fn cache_control(mut self, policy: CachePolicyConfig) -> Self {
        self.cache_control = Some(Arc::new(CacheControlInterceptor::new(policy)));
        self
    }

    /// Extra stage between CacheControl and the transport.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.extra.push(interceptor);
        self
    }

    pub fn build(self) -> HttpPipeline {
        let interceptors = self
            .instrumentation
            .into_iter()
            .chain(self.auth)
            .chain(self.cache_control)
            .chain(self.extra)
            .collect();
        HttpPipeline {
            interceptors,
            transport: self.transport,
        }
    }
}
