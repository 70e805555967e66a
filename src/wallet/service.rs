// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Cached wallet reads and cache-invalidating mutations.

use std::sync::Arc;

use tracing::{debug, warn};

use super::client::WalletClient;
use super::{transactions_key, transactions_prefix, wallet_key, CURRENT_WALLET_KEY};
use crate::error::{SyncError, SyncResult};
use crate::models::{
    CachedPayload, CdkRedeemResponse, TransactionPage, TransferByUsernameRequest,
    TransferRequest, TransferResponse, WalletSnapshot,
};
use crate::repository::{ReadOutcome, Subscription, TieredCacheRepository};

pub struct WalletService {
    repository: TieredCacheRepository<CachedPayload>,
    client: Arc<WalletClient>,
}

impl WalletService {
    pub fn new(repository: TieredCacheRepository<CachedPayload>, client: Arc<WalletClient>) -> Self {
        Self { repository, client }
    }

    pub fn repository(&self) -> &TieredCacheRepository<CachedPayload> {
        &self.repository
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn current_wallet(&self) -> SyncResult<ReadOutcome<WalletSnapshot>> {
        let outcome = self.repository.read(CURRENT_WALLET_KEY).await?;
        into_wallet(CURRENT_WALLET_KEY, outcome)
    }

    pub async fn refresh_current_wallet(&self) -> SyncResult<ReadOutcome<WalletSnapshot>> {
        let outcome = self.repository.refresh(CURRENT_WALLET_KEY).await?;
        into_wallet(CURRENT_WALLET_KEY, outcome)
    }

    pub async fn wallet(&self, wallet_id: &str) -> SyncResult<ReadOutcome<WalletSnapshot>> {
        let key = wallet_key(wallet_id);
        let outcome = self.repository.read(&key).await?;
        into_wallet(&key, outcome)
    }

    pub async fn transactions(
        &self,
        wallet_id: &str,
        page: u32,
    ) -> SyncResult<ReadOutcome<TransactionPage>> {
        let key = transactions_key(wallet_id, page);
        let outcome = self.repository.read(&key).await?;
        into_transactions(&key, outcome)
    }

    pub async fn refresh_transactions(
        &self,
        wallet_id: &str,
        page: u32,
    ) -> SyncResult<ReadOutcome<TransactionPage>> {
        let key = transactions_key(wallet_id, page);
        let outcome = self.repository.refresh(&key).await?;
        into_transactions(&key, outcome)
    }

    /// Call `callback` with every new snapshot of the current wallet.
    pub fn subscribe_current_wallet<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WalletSnapshot) + Send + Sync + 'static,
    {
        self.repository.subscribe(CURRENT_WALLET_KEY, move |key, payload| {
            if key == CURRENT_WALLET_KEY {
                if let Some(wallet) = payload.as_wallet() {
                    callback(wallet);
                }
            }
        })
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub async fn transfer_by_username(
        &self,
        request: &TransferByUsernameRequest,
    ) -> SyncResult<TransferResponse> {
        let response = self.client.transfer_by_username(request).await?;
        self.after_balance_change(&[]).await;
        Ok(response)
    }

    pub async fn transfer(&self, request: &TransferRequest) -> SyncResult<TransferResponse> {
        let response = self.client.transfer(request).await?;
        self.after_balance_change(&[
            request.from_wallet_id.as_str(),
            request.to_wallet_id.as_str(),
        ])
        .await;
        Ok(response)
    }

    pub async fn redeem_cdk(&self, code: &str, username: &str) -> SyncResult<CdkRedeemResponse> {
        let response = self.client.redeem_cdk(code, username).await?;
        self.after_balance_change(&[]).await;
        Ok(response)
    }

    /// Read-only check; nothing is invalidated.
    pub async fn validate_cdk(&self, code: &str) -> SyncResult<CdkRedeemResponse> {
        self.client.validate_cdk(code).await
    }

    /// Drop balances and history the mutation may have changed, then pull a
    /// fresh current wallet.
    async fn after_balance_change(&self, wallet_ids: &[&str]) {
        let mut affected: Vec<String> = wallet_ids.iter().map(|id| id.to_string()).collect();
        if let Some(current) = self.repository.peek(CURRENT_WALLET_KEY) {
            if let Some(wallet) = current.value.as_wallet() {
                affected.push(wallet.wallet_id.clone());
            }
        }
        affected.sort();
        affected.dedup();

        for wallet_id in &affected {
            self.repository.invalidate(&wallet_key(wallet_id));
            let dropped = self.repository.invalidate_prefix(&transactions_prefix(wallet_id));
            debug!(wallet_id = %wallet_id, dropped, "Invalidated wallet history");
        }

        match self.repository.refresh(CURRENT_WALLET_KEY).await {
            Ok(outcome) if outcome.is_degraded() => {
                warn!(error = ?outcome.degraded, "Post-mutation wallet refresh fell back to cache");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Post-mutation wallet refresh failed"),
        }
    }
}

fn into_wallet(
    key: &str,
    outcome: ReadOutcome<CachedPayload>,
) -> SyncResult<ReadOutcome<WalletSnapshot>> {
    let ReadOutcome {
        value,
        source,
        freshness,
        degraded,
    } = outcome;
    match value {
        CachedPayload::Wallet(wallet) => Ok(ReadOutcome {
            value: wallet,
            source,
            freshness,
            degraded,
        }),
        CachedPayload::Transactions(_) => Err(SyncError::corruption(
            key,
            "expected a wallet snapshot, found a transaction page",
        )),
    }
}

fn into_transactions(
    key: &str,
    outcome: ReadOutcome<CachedPayload>,
) -> SyncResult<ReadOutcome<TransactionPage>> {
    let ReadOutcome {
        value,
        source,
        freshness,
        degraded,
    } = outcome;
    match value {
        CachedPayload::Transactions(page) => Ok(ReadOutcome {
            value: page,
            source,
            freshness,
            degraded,
        }),
        CachedPayload::Wallet(_) => Err(SyncError::corruption(
            key,
            "expected a transaction page, found a wallet snapshot",
        )),
    }
}
