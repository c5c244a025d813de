// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Agreed-final block number across all providers.

use super::config::FinalityConfig;
use crate::scraper::provider::ProviderError;
use crate::scraper::quorum::ProviderQuorum;
use crate::ttl_cache::TtlCache;
use crate::types::BlockNumber;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait]
pub trait FinalityChecker: Send + Sync {
    /// Highest block every provider considers final under the configured policy.
    async fn finalized_block(&self) -> Result<BlockNumber, ProviderError>;
}

pub struct QuorumFinalityChecker {
    quorum: Arc<ProviderQuorum>,
    config: FinalityConfig,
    cache: TtlCache<BlockNumber>,
}

impl QuorumFinalityChecker {
    pub fn new(quorum: Arc<ProviderQuorum>, config: FinalityConfig) -> Self {
        let cache = TtlCache::with_secs(config.cache_duration_secs);
        Self {
            quorum,
            config,
            cache,
        }
    }
}

#[async_trait]
impl FinalityChecker for QuorumFinalityChecker {
    async fn finalized_block(&self) -> Result<BlockNumber, ProviderError> {
        if let Some(cached) = self.cache.get_if_valid().await {
            debug!("[Finality] Using cached finalized block: {}", cached);
            return Ok(cached);
        }
        let (tag, confirmations) = self.config.query();
        let agreed = self.quorum.min_block_number(tag).await?;
        let finalized = agreed.saturating_sub(confirmations);
        self.cache.update(finalized).await;
        info!(
            "[Finality] Finalized block updated: {} (mode={:?}, tag={:?})",
            finalized, self.config.mode, tag
        );
        Ok(finalized)
    }
}
