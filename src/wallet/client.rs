// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Typed wallet API client over the HTTP pipeline.
//!
//! Endpoints are relative to the configured base URL (which ends in `/`).
//! Every response is a `{ success, message?, ...payload }` envelope.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::http::{header, CacheDirectives, HeaderName, HeaderValue, HttpPipeline, HttpRequest};
use crate::models::{
    CdkRedeemResponse, TransactionHistoryResponse, TransactionPage, TransferByUsernameRequest,
    TransferRequest, TransferResponse, WalletInfoResponse, WalletSnapshot,
};
use crate::repository::Fetched;

const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");

/// Default page size for transaction history.
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

pub struct WalletClient {
    pipeline: Arc<HttpPipeline>,
    base_url: Url,
    revalidate: Option<HeaderValue>,
}

impl WalletClient {
    pub fn new(pipeline: Arc<HttpPipeline>, base_url: Url) -> Self {
        Self {
            pipeline,
            base_url,
            revalidate: None,
        }
    }

    /// Send every `GET` with `no-cache`, so the response cache only answers
    /// when the network fails and its copy is younger than `max_stale`.
    pub fn revalidating(mut self, max_stale: Duration) -> Self {
        let directives = CacheDirectives {
            no_cache: true,
            max_age: Some(Duration::ZERO),
            max_stale: Some(max_stale),
            ..Default::default()
        };
        self.revalidate = HeaderValue::from_str(&directives.to_header_value()).ok();
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::Config(format!("invalid endpoint {path}: {e}")))
    }

    fn get(&self, url: Url) -> HttpRequest {
        let request = HttpRequest::get(url);
        match &self.revalidate {
            Some(value) => request.with_header(header::CACHE_CONTROL, value.clone()),
            None => request,
        }
    }

    /// Decode a read, keeping the marker of an older stored copy so callers
    /// can tell it from a live answer.
    async fn read<T: DeserializeOwned>(&self, request: HttpRequest) -> SyncResult<Fetched<T>> {
        let response = self.pipeline.execute(request).await?;
        let value = response.decode()?;
        if let Some(copy) = &response.stale {
            warn!(stored_at = %copy.stored_at, error = %copy.error, "Read answered from stored copy");
        }
        Ok(Fetched {
            value,
            stale: response.stale,
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn current_wallet(&self) -> SyncResult<Fetched<WalletSnapshot>> {
        let request = self.get(self.endpoint("wallets/current")?);
        let info: Fetched<WalletInfoResponse> = self.read(request).await?;
        Ok(info.map(Into::into))
    }

    pub async fn wallet(&self, wallet_id: &str) -> SyncResult<Fetched<WalletSnapshot>> {
        let request = self.get(self.endpoint(&format!("wallets/{wallet_id}"))?);
        let info: Fetched<WalletInfoResponse> = self.read(request).await?;
        Ok(info.map(Into::into))
    }

    pub async fn transactions(
        &self,
        wallet_id: &str,
        page: u32,
        limit: u32,
    ) -> SyncResult<Fetched<TransactionPage>> {
        let mut url = self.endpoint(&format!("wallets/{wallet_id}/transactions"))?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());

        let response: Fetched<TransactionHistoryResponse> = self.read(self.get(url)).await?;
        let page = response.map(|r| TransactionPage::from_response(wallet_id, r));
        debug!(
            wallet_id,
            page = page.value.page,
            records = page.value.records.len(),
            "Fetched transaction page"
        );
        Ok(page)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub async fn transfer_by_username(
        &self,
        request: &TransferByUsernameRequest,
    ) -> SyncResult<TransferResponse> {
        let http = HttpRequest::post(self.endpoint("transfers/by-username")?).with_json(request)?;
        let response: TransferResponse = self.pipeline.execute(http).await?.decode()?;
        info!(
            to = %request.to_username,
            transaction_id = ?response.transaction_id,
            "Transfer by username accepted"
        );
        Ok(response)
    }

    /// Wallet-to-wallet transfer, sent with a fresh `Idempotency-Key`.
    pub async fn transfer(&self, request: &TransferRequest) -> SyncResult<TransferResponse> {
        let key = Uuid::new_v4().to_string();
        let idempotency = HeaderValue::from_str(&key)
            .map_err(|e| SyncError::Config(format!("invalid idempotency key: {e}")))?;
        let http = HttpRequest::post(self.endpoint("transfers")?)
            .with_header(IDEMPOTENCY_KEY, idempotency)
            .with_json(request)?;

        let response: TransferResponse = self.pipeline.execute(http).await?.decode()?;
        info!(
            from = %request.from_wallet_id,
            to = %request.to_wallet_id,
            idempotency_key = %key,
            "Transfer accepted"
        );
        Ok(response)
    }

    pub async fn redeem_cdk(&self, code: &str, username: &str) -> SyncResult<CdkRedeemResponse> {
        let http = HttpRequest::post(self.endpoint("cdks/redeem")?)
            .with_form(&[("code", code), ("username", username)]);
        let response: CdkRedeemResponse = self.pipeline.execute(http).await?.decode()?;
        info!(amount = ?response.amount, "CDK redeemed");
        Ok(response)
    }

    pub async fn validate_cdk(&self, code: &str) -> SyncResult<CdkRedeemResponse> {
        let http = HttpRequest::post(self.endpoint("cdks/validate")?).with_form(&[("code", code)]);
        self.pipeline.execute(http).await?.decode()
    }
}
