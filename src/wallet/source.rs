// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Remote source resolving wallet cache keys against the API.

use std::sync::Arc;

use super::client::{WalletClient, DEFAULT_PAGE_LIMIT};
use super::WalletKey;
use crate::error::{SyncError, SyncResult};
use crate::http::BoxFuture;
use crate::models::CachedPayload;
use crate::repository::{Fetched, RemoteSource};

pub struct WalletRemoteSource {
    client: Arc<WalletClient>,
    page_limit: u32,
}

impl WalletRemoteSource {
    pub fn new(client: Arc<WalletClient>) -> Self {
        Self {
            client,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    async fn resolve(&self, key: &str) -> SyncResult<Fetched<CachedPayload>> {
        let parsed = WalletKey::parse(key).ok_or_else(|| SyncError::UnknownKey(key.to_string()))?;
        let fetched = match parsed {
            WalletKey::CurrentWallet => self.client.current_wallet().await?.map(CachedPayload::Wallet),
            WalletKey::Wallet(id) => self.client.wallet(&id).await?.map(CachedPayload::Wallet),
            WalletKey::Transactions { wallet_id, page } => self
                .client
                .transactions(&wallet_id, page, self.page_limit)
                .await?
                .map(CachedPayload::Transactions),
        };
        Ok(fetched)
    }
}

impl RemoteSource<CachedPayload> for WalletRemoteSource {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SyncResult<Fetched<CachedPayload>>> {
        Box::pin(self.resolve(key))
    }

    /// Settled transactions already cached survive a refetch of their page.
    fn reconcile(&self, fetched: CachedPayload, previous: &CachedPayload) -> CachedPayload {
        match (fetched, previous) {
            (CachedPayload::Transactions(new), CachedPayload::Transactions(old))
                if new.wallet_id == old.wallet_id =>
            {
                CachedPayload::Transactions(new.reconcile(old))
            }
            (fetched, _) => fetched,
        }
    }
}
