// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Wallet Data
//!
//! The wallet API bound to the tiered cache.
//!
//! ## Cache Keys
//!
//! | Key | Payload | Endpoint |
//! |-----|---------|----------|
//! | `wallet:current` | [`WalletSnapshot`](crate::models::WalletSnapshot) | `GET wallets/current` |
//! | `wallet:{id}` | [`WalletSnapshot`](crate::models::WalletSnapshot) | `GET wallets/{id}` |
//! | `transactions:{id}:{page}` | [`TransactionPage`](crate::models::TransactionPage) | `GET wallets/{id}/transactions` |
//!
//! Mutations (transfers, CDK redemption) bypass the cache and invalidate the
//! keys they affect once they succeed.

pub mod client;
pub mod poller;
pub mod service;
pub mod source;

use std::fmt;

pub use client::WalletClient;
pub use poller::WalletSyncPoller;
pub use service::WalletService;
pub use source::WalletRemoteSource;

pub const CURRENT_WALLET_KEY: &str = "wallet:current";

/// Parsed form of a wallet cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletKey {
    CurrentWallet,
    Wallet(String),
    Transactions { wallet_id: String, page: u32 },
}

impl WalletKey {
    pub fn parse(key: &str) -> Option<Self> {
        if key == CURRENT_WALLET_KEY {
            return Some(WalletKey::CurrentWallet);
        }
        if let Some(id) = key.strip_prefix("wallet:") {
            return (!id.is_empty()).then(|| WalletKey::Wallet(id.to_string()));
        }
        let rest = key.strip_prefix("transactions:")?;
        let (wallet_id, page) = rest.rsplit_once(':')?;
        if wallet_id.is_empty() {
            return None;
        }
        Some(WalletKey::Transactions {
            wallet_id: wallet_id.to_string(),
            page: page.parse().ok()?,
        })
    }
}

impl fmt::Display for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletKey::CurrentWallet => f.write_str(CURRENT_WALLET_KEY),
            WalletKey::Wallet(id) => write!(f, "wallet:{id}"),
            WalletKey::Transactions { wallet_id, page } => {
                write!(f, "transactions:{wallet_id}:{page}")
            }
        }
    }
}

pub fn wallet_key(wallet_id: &str) -> String {
    WalletKey::Wallet(wallet_id.to_string()).to_string()
}

pub fn transactions_key(wallet_id: &str, page: u32) -> String {
    WalletKey::Transactions {
        wallet_id: wallet_id.to_string(),
        page,
    }
    .to_string()
}

/// Prefix covering every cached transaction page of `wallet_id`.
pub fn transactions_prefix(wallet_id: &str) -> String {
    format!("transactions:{wallet_id}:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_parse_back() {
        assert_eq!(WalletKey::parse("wallet:current"), Some(WalletKey::CurrentWallet));
        assert_eq!(
            WalletKey::parse(&wallet_key("w-1")),
            Some(WalletKey::Wallet("w-1".to_string()))
        );
        assert_eq!(
            WalletKey::parse(&transactions_key("w-1", 3)),
            Some(WalletKey::Transactions {
                wallet_id: "w-1".to_string(),
                page: 3
            })
        );
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert_eq!(WalletKey::parse("wallet:"), None);
        assert_eq!(WalletKey::parse("transactions:w1"), None);
        assert_eq!(WalletKey::parse("transactions:w1:first"), None);
        assert_eq!(WalletKey::parse("transactions::1"), None);
        assert_eq!(WalletKey::parse("balance:w1"), None);
    }

    #[test]
    fn page_keys_fall_under_the_prefix() {
        assert!(transactions_key("w1", 2).starts_with(&transactions_prefix("w1")));
        assert!(!transactions_key("w10", 2).starts_with(&transactions_prefix("w1")));
    }
}
