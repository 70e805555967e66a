// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Explicit observer registry.
//!
//! Subscribers register a key prefix and a callback and get back a
//! [`Subscription`] token. The registration lives exactly as long as the
//! token: dropping it or calling [`Subscription::cancel`] unsubscribes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub type Callback<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

struct Subscriber<V> {
    id: u64,
    prefix: String,
    callback: Callback<V>,
}

struct Registry<V> {
    next_id: u64,
    subscribers: Vec<Subscriber<V>>,
}

pub(crate) struct SubscriptionRegistry<V> {
    inner: Arc<Mutex<Registry<V>>>,
}

fn lock<V>(inner: &Mutex<Registry<V>>) -> MutexGuard<'_, Registry<V>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V: 'static> SubscriptionRegistry<V> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 1,
                subscribers: Vec::new(),
            })),
        }
    }

    pub(crate) fn subscribe(&self, prefix: &str, callback: Callback<V>) -> Subscription
    where
        V: Send,
    {
        let id = {
            let mut registry = lock(&self.inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.subscribers.push(Subscriber {
                id,
                prefix: prefix.to_string(),
                callback,
            });
            id
        };

        let weak: Weak<Mutex<Registry<V>>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).subscribers.retain(|s| s.id != id);
                }
            })),
        }
    }

    /// Callbacks whose prefix matches `key`, in registration order.
    pub(crate) fn matching(&self, key: &str) -> Vec<Callback<V>> {
        lock(&self.inner)
            .subscribers
            .iter()
            .filter(|s| key.starts_with(s.prefix.as_str()))
            .map(|s| Arc::clone(&s.callback))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

/// Registration token; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
