// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Pending-fetch table: at most one fetch per key in flight.
//!
//! The first caller for a key becomes the leader and receives a [`Flight`];
//! everyone arriving while it is registered gets a [`Waiter`] on the same
//! `watch` channel. Settling removes the entry and publishes the outcome under
//! the table lock, so a caller either attaches to the running fetch or starts
//! the next one, never neither.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

type Settled<V> = Option<SyncResult<V>>;
type Table<V> = Arc<Mutex<HashMap<String, watch::Sender<Settled<V>>>>>;

fn lock<V>(table: &Table<V>) -> MutexGuard<'_, HashMap<String, watch::Sender<Settled<V>>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct SingleFlight<V> {
    table: Table<V>,
}

pub(crate) enum Joined<V> {
    /// The caller must run the fetch and settle the flight.
    Leader(Flight<V>, Waiter<V>),
    /// A fetch is already running; wait for it.
    Follower(Waiter<V>),
}

impl<V: Clone> SingleFlight<V> {
    pub(crate) fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn join(&self, key: &str) -> Joined<V> {
        let mut table = lock(&self.table);
        if let Some(sender) = table.get(key) {
            debug!(key, waiters = sender.receiver_count(), "Joining in-flight fetch");
            return Joined::Follower(Waiter {
                rx: sender.subscribe(),
            });
        }

        let (sender, rx) = watch::channel(None);
        table.insert(key.to_string(), sender);
        Joined::Leader(
            Flight {
                key: key.to_string(),
                table: Arc::clone(&self.table),
                settled: false,
            },
            Waiter { rx },
        )
    }

    pub(crate) fn in_flight(&self) -> usize {
        lock(&self.table).len()
    }

    pub(crate) fn is_pending(&self, key: &str) -> bool {
        lock(&self.table).contains_key(key)
    }
}

/// Leader's handle on a registered fetch.
///
/// Dropping it unsettled (the fetch task was cancelled or never started)
/// releases every waiter with [`SyncError::Dispatch`].
pub(crate) struct Flight<V> {
    key: String,
    table: Table<V>,
    settled: bool,
}

impl<V> Flight<V> {
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Remove the pending entry and hand `result` to every waiter.
    pub(crate) fn settle(mut self, result: SyncResult<V>) -> usize {
        self.publish(result)
    }

    fn publish(&mut self, result: SyncResult<V>) -> usize {
        self.settled = true;
        let mut table = lock(&self.table);
        match table.remove(&self.key) {
            Some(sender) => {
                let waiters = sender.receiver_count();
                sender.send_replace(Some(result));
                waiters
            }
            None => 0,
        }
    }
}

impl<V> Drop for Flight<V> {
    fn drop(&mut self) {
        if !self.settled {
            let message = format!("fetch for {} abandoned", self.key);
            self.publish(Err(SyncError::Dispatch(message)));
        }
    }
}

pub(crate) struct Waiter<V> {
    rx: watch::Receiver<Settled<V>>,
}

impl<V: Clone> Waiter<V> {
    pub(crate) async fn wait(mut self) -> SyncResult<V> {
        let settled: Settled<V> = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => Option::clone(&value),
            Err(_) => None,
        };
        settled.unwrap_or(Err(SyncError::Shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn followers_share_the_leaders_result() {
        let flights = SingleFlight::<u32>::new();
        let Joined::Leader(flight, leader_wait) = flights.join("wallet:1") else {
            panic!("first caller must lead");
        };
        let followers: Vec<_> = (0..3)
            .map(|_| match flights.join("wallet:1") {
                Joined::Follower(w) => w,
                Joined::Leader(..) => panic!("second caller must follow"),
            })
            .collect();
        assert!(flights.is_pending("wallet:1"));

        assert_eq!(flight.settle(Ok(7)), 4);
        assert!(!flights.is_pending("wallet:1"));

        assert_eq!(leader_wait.wait().await, Ok(7));
        for w in followers {
            assert_eq!(w.wait().await, Ok(7));
        }
    }

    #[tokio::test]
    async fn settle_allows_a_new_leader() {
        let flights = SingleFlight::<u32>::new();
        let Joined::Leader(flight, _) = flights.join("k") else {
            panic!("expected leader");
        };
        flight.settle(Err(SyncError::network("offline")));
        assert!(matches!(flights.join("k"), Joined::Leader(..)));
    }

    #[tokio::test]
    async fn dropped_flight_releases_waiters() {
        let flights = SingleFlight::<u32>::new();
        let Joined::Leader(flight, waiter) = flights.join("k") else {
            panic!("expected leader");
        };
        drop(flight);
        assert!(matches!(waiter.wait().await, Err(SyncError::Dispatch(_))));
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let flights = SingleFlight::<u32>::new();
        assert!(matches!(flights.join("a"), Joined::Leader(..)));
        assert!(matches!(flights.join("b"), Joined::Leader(..)));
    }
}
