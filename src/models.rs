// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Data Models
//!
//! Value objects cached by the repository and the wire shapes of the wallet
//! API they are decoded from.
//!
//! ## Model Categories
//!
//! - **Snapshots**: [`WalletSnapshot`], replaced wholesale on every fetch
//! - **History**: [`TransactionRecord`] pages, reconciled so terminal records
//!   never change once seen
//! - **Envelopes**: `{ success, message, ...payload }` responses
//! - **Mutations**: transfer and CDK request/response bodies

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Wallet Snapshot
// =============================================================================

/// Immutable view of a wallet at `last_updated`.
///
/// A fetch produces a new snapshot that replaces the previous one; snapshots
/// are never patched field by field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletSnapshot {
    pub wallet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_name: Option<String>,
    pub balance: f64,
    pub currency_code: String,
    pub last_updated: DateTime<Utc>,
}

/// `GET /wallets/current` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletInfoResponse {
    pub wallet_id: String,
    #[serde(default)]
    pub wallet_name: Option<String>,
    pub balance: f64,
    #[serde(default = "default_currency")]
    pub currency_code: String,
    /// Server time in epoch milliseconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

fn default_currency() -> String {
    "CNY".to_string()
}

impl From<WalletInfoResponse> for WalletSnapshot {
    fn from(info: WalletInfoResponse) -> Self {
        let last_updated = info
            .timestamp
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        Self {
            wallet_id: info.wallet_id,
            wallet_name: info.wallet_name,
            balance: info.balance,
            currency_code: info.currency_code,
            last_updated,
        }
    }
}

// =============================================================================
// Transactions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
    CdkRedeem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TxStatus {
    /// Terminal records are append-only.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionRecord {
    pub id: String,
    pub tx_type: TransactionType,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub status: TxStatus,
    /// The other party: recipient for outgoing, sender for incoming.
    pub counterpart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Transaction as returned by `GET /wallets/{id}/transactions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDto {
    pub transaction_id: String,
    pub amount: f64,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: TxStatus,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub direction: Direction,
    #[serde(default)]
    pub memo: Option<String>,
}

impl From<TransactionDto> for TransactionRecord {
    fn from(dto: TransactionDto) -> Self {
        let counterpart = match dto.direction {
            Direction::Outgoing => dto.recipient,
            Direction::Incoming => dto.sender,
        };
        Self {
            id: dto.transaction_id,
            tx_type: dto.tx_type,
            amount: dto.amount,
            timestamp: dto.timestamp,
            direction: dto.direction,
            status: dto.status,
            counterpart,
            memo: dto.memo,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHistoryResponse {
    #[serde(default)]
    pub transactions: Vec<TransactionDto>,
    #[serde(default = "one")]
    pub total_pages: u32,
    #[serde(default = "one")]
    pub current_page: u32,
}

fn one() -> u32 {
    1
}

/// One page of a wallet's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionPage {
    pub wallet_id: String,
    pub page: u32,
    pub total_pages: u32,
    pub records: Vec<TransactionRecord>,
    pub fetched_at: DateTime<Utc>,
}

impl TransactionPage {
    pub fn from_response(wallet_id: &str, response: TransactionHistoryResponse) -> Self {
        Self {
            wallet_id: wallet_id.to_string(),
            page: response.current_page,
            total_pages: response.total_pages,
            records: response.transactions.into_iter().map(Into::into).collect(),
            fetched_at: Utc::now(),
        }
    }

    /// Merge a freshly fetched page over the previously cached one.
    ///
    /// Records the previous page holds in a terminal state win over the new
    /// fetch; pending records are superseded. The record set and order come
    /// from the new page.
    pub fn reconcile(mut self, previous: &TransactionPage) -> Self {
        for record in &mut self.records {
            let settled = previous
                .records
                .iter()
                .find(|old| old.id == record.id && old.status.is_terminal());
            if let Some(old) = settled {
                if old != record {
                    tracing::debug!(
                        tx_id = %record.id,
                        "Keeping settled transaction over refetched copy"
                    );
                    *record = old.clone();
                }
            }
        }
        self
    }
}

// =============================================================================
// Cached Payload
// =============================================================================

/// Everything the wallet repository caches, under one serializable type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CachedPayload {
    Wallet(WalletSnapshot),
    Transactions(TransactionPage),
}

impl CachedPayload {
    pub fn as_wallet(&self) -> Option<&WalletSnapshot> {
        match self {
            CachedPayload::Wallet(w) => Some(w),
            CachedPayload::Transactions(_) => None,
        }
    }

    pub fn as_transactions(&self) -> Option<&TransactionPage> {
        match self {
            CachedPayload::Transactions(t) => Some(t),
            CachedPayload::Wallet(_) => None,
        }
    }
}

// =============================================================================
// Mutations
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferByUsernameRequest {
    pub from_username: String,
    pub to_username: String,
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub from_wallet_id: String,
    pub to_wallet_id: String,
    pub amount: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CdkRedeemResponse {
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Envelope
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeHeader {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

fn default_success() -> bool {
    true
}

/// Decode a `{ success, message, ...payload }` body.
///
/// Non-2xx statuses and `success = false` both become [`SyncError::Server`]
/// carrying the server's message when it sent one.
pub fn decode_envelope<T: DeserializeOwned>(status: u16, body: &[u8]) -> SyncResult<T> {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) if !(200..300).contains(&status) => {
            let text = String::from_utf8_lossy(body);
            let message = if text.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                text.trim().to_string()
            };
            tracing::debug!(status, error = %e, "Non-JSON error body");
            return Err(SyncError::server(status, message));
        }
        Err(e) => return Err(e.into()),
    };

    let header: EnvelopeHeader = serde_json::from_value(value.clone()).unwrap_or(EnvelopeHeader {
        success: (200..300).contains(&status),
        message: None,
        error: None,
        error_code: None,
    });

    if !(200..300).contains(&status) || !header.success {
        let message = header
            .error
            .or(header.message)
            .or(header.error_code)
            .unwrap_or_else(|| format!("HTTP {status}"));
        return Err(SyncError::server(status, message));
    }

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, status: TxStatus, amount: f64) -> TransactionRecord {
        TransactionRecord {
            id: id.to_string(),
            tx_type: TransactionType::Transfer,
            amount,
            timestamp: Utc::now(),
            direction: Direction::Outgoing,
            status,
            counterpart: Some("bob".to_string()),
            memo: None,
        }
    }

    fn page(records: Vec<TransactionRecord>) -> TransactionPage {
        TransactionPage {
            wallet_id: "w1".to_string(),
            page: 1,
            total_pages: 1,
            records,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn wallet_info_maps_to_snapshot() {
        let body = br#"{"success":true,"walletId":"w1","balance":12.5,"currencyCode":"USD","timestamp":1700000000000}"#;
        let info: WalletInfoResponse = decode_envelope(200, body).unwrap();
        let snapshot = WalletSnapshot::from(info);
        assert_eq!(snapshot.wallet_id, "w1");
        assert_eq!(snapshot.balance, 12.5);
        assert_eq!(snapshot.currency_code, "USD");
        assert_eq!(snapshot.last_updated.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn failed_envelope_becomes_server_error() {
        let body = br#"{"success":false,"message":"insufficient funds","errorCode":"E42"}"#;
        let err = decode_envelope::<TransferResponse>(200, body).unwrap_err();
        assert_eq!(err, SyncError::server(200, "insufficient funds"));
    }

    #[test]
    fn non_2xx_prefers_error_field() {
        let body = br#"{"error":"Wallet not found"}"#;
        let err = decode_envelope::<WalletInfoResponse>(404, body).unwrap_err();
        assert_eq!(err, SyncError::server(404, "Wallet not found"));
    }

    #[test]
    fn non_json_error_body_is_kept_as_message() {
        let err = decode_envelope::<WalletInfoResponse>(502, b"Bad Gateway").unwrap_err();
        assert_eq!(err, SyncError::server(502, "Bad Gateway"));
    }

    #[test]
    fn dto_counterpart_depends_on_direction() {
        let body = br#"{"transactions":[
            {"transactionId":"t1","amount":5,"sender":"alice","recipient":"bob","timestamp":1700000000000,"status":"COMPLETED","type":"TRANSFER","direction":"INCOMING"}
        ],"totalPages":3,"currentPage":1}"#;
        let response: TransactionHistoryResponse = decode_envelope(200, body).unwrap();
        let page = TransactionPage::from_response("w1", response);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.records[0].counterpart.as_deref(), Some("alice"));
        assert_eq!(page.records[0].status, TxStatus::Completed);
    }

    #[test]
    fn reconcile_keeps_terminal_and_replaces_pending() {
        let mut settled = record("t1", TxStatus::Completed, 10.0);
        settled.timestamp = Utc::now() - Duration::hours(1);
        let previous = page(vec![settled.clone(), record("t2", TxStatus::Pending, 3.0)]);

        let incoming = page(vec![
            record("t1", TxStatus::Pending, 99.0),
            record("t2", TxStatus::Completed, 3.0),
            record("t3", TxStatus::Pending, 1.0),
        ]);

        let merged = incoming.reconcile(&previous);
        assert_eq!(merged.records.len(), 3);
        assert_eq!(merged.records[0], settled);
        assert_eq!(merged.records[1].status, TxStatus::Completed);
        assert_eq!(merged.records[2].id, "t3");
    }

    #[test]
    fn payload_round_trips_with_tag() {
        let payload = CachedPayload::Wallet(WalletSnapshot {
            wallet_id: "w1".to_string(),
            wallet_name: None,
            balance: 1.0,
            currency_code: "CNY".to_string(),
            last_updated: Utc::now(),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "wallet");
        let back: CachedPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
        assert!(back.as_transactions().is_none());
    }
}
