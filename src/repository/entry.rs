// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Cache entries and their wall-clock freshness.
//!
//! ```text
//! Fresh ──(age > ttl)──▶ Stale ──(age > ttl + max_stale)──▶ Expired
//! ```
//!
//! Freshness is computed at read time from `inserted_at`; nothing ages
//! entries in the background. An entry removed by capacity pressure is
//! simply absent (`Evicted`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// `age <= ttl`
    Fresh,
    /// `ttl < age <= ttl + max_stale`: servable, triggers a refresh
    Stale,
    /// `age > ttl + max_stale`: the caller must wait for a refresh
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub ttl: Duration,
    pub max_stale: Duration,
}

impl FreshnessPolicy {
    pub fn new(ttl: Duration, max_stale: Duration) -> Self {
        Self { ttl, max_stale }
    }

    pub fn classify(&self, age: Duration) -> Freshness {
        if age <= self.ttl {
            Freshness::Fresh
        } else if age <= self.ttl.saturating_add(self.max_stale) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_ENTRY_TTL,
            crate::config::DEFAULT_ENTRY_MAX_STALE,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub inserted_at: DateTime<Utc>,
    pub ttl: Duration,
    pub max_stale: Duration,
}

impl<V> CacheEntry<V> {
    /// New entry inserted now under `policy`.
    pub fn new(key: impl Into<String>, value: V, policy: FreshnessPolicy) -> Self {
        Self {
            key: key.into(),
            value,
            inserted_at: Utc::now(),
            ttl: policy.ttl,
            max_stale: policy.max_stale,
        }
    }

    pub fn with_inserted_at(mut self, inserted_at: DateTime<Utc>) -> Self {
        self.inserted_at = inserted_at;
        self
    }

    pub fn policy(&self) -> FreshnessPolicy {
        FreshnessPolicy::new(self.ttl, self.max_stale)
    }

    /// Age at `now`; clock skew into the future counts as zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.inserted_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn freshness_at(&self, now: DateTime<Utc>) -> Freshness {
        self.policy().classify(self.age_at(now))
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness_at(Utc::now())
    }
}
