// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! TTL cache for values that are expensive to fetch over RPC.
//!
//! The scraper caches the agreed-final block number here and the fee
//! estimator caches its last gas fee estimate. A stale value is still
//! readable through [`TtlCache::last`] for reporting.

use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    updated_at: Instant,
    updated_at_millis: u64,
}

#[derive(Debug)]
pub struct TtlCache<T: Clone + Send + Sync> {
    entry: RwLock<Option<Entry<T>>>,
    cache_duration: Duration,
}

impl<T: Clone + Send + Sync> TtlCache<T> {
    pub fn new(cache_duration: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            cache_duration,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns the cached value if it is younger than the TTL.
    pub async fn get_if_valid(&self) -> Option<T> {
        self.entry
            .read()
            .await
            .as_ref()
            .filter(|entry| entry.updated_at.elapsed() < self.cache_duration)
            .map(|entry| entry.value.clone())
    }

    /// Last stored value with its wall-clock timestamp, regardless of age.
    pub async fn last(&self) -> Option<(u64, T)> {
        self.entry
            .read()
            .await
            .as_ref()
            .map(|entry| (entry.updated_at_millis, entry.value.clone()))
    }

    pub async fn update(&self, value: T) {
        let mut entry = self.entry.write().await;
        *entry = Some(Entry {
            value,
            updated_at: Instant::now(),
            updated_at_millis: crate::types::now_millis(),
        });
    }
}
