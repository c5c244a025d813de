// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{
    estimate_from_fee_history, GasFeeEstimate, FEE_HISTORY_BLOCK_COUNT,
    FEE_HISTORY_REWARD_PERCENTILE,
};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::EngineMetrics;
use crate::ttl_cache::TtlCache;
use crate::withdraw::client::TransactionClient;
use ethers::types::{BlockNumber as EthBlockNumber, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Gas fee estimates from `eth_feeHistory`, refreshed once they are older
/// than the staleness bound.
pub struct FeeEstimator {
    client: Arc<dyn TransactionClient>,
    cache: TtlCache<GasFeeEstimate>,
    min_priority_fee: U256,
    metrics: Arc<EngineMetrics>,
}

impl FeeEstimator {
    pub fn new(
        client: Arc<dyn TransactionClient>,
        staleness: Duration,
        min_priority_fee: U256,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            client,
            cache: TtlCache::new(staleness),
            min_priority_fee,
            metrics,
        }
    }

    /// Cached estimate, or a fresh one if the cached one is stale.
    pub async fn estimate(&self) -> BridgeResult<GasFeeEstimate> {
        if let Some(estimate) = self.cache.get_if_valid().await {
            return Ok(estimate);
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> BridgeResult<GasFeeEstimate> {
        let history = self
            .client
            .fee_history(
                FEE_HISTORY_BLOCK_COUNT,
                EthBlockNumber::Latest,
                &[FEE_HISTORY_REWARD_PERCENTILE],
            )
            .await
            .map_err(|e| BridgeError::FeeEstimateUnavailable(e.to_string()))?;
        let estimate = estimate_from_fee_history(&history, self.min_priority_fee)?;
        debug!(
            "[FeeEstimator] base fee {} priority fee {}",
            estimate.base_fee_per_gas, estimate.max_priority_fee_per_gas
        );
        self.cache.update(estimate).await;
        self.metrics.fee_estimate_refreshes.inc();
        Ok(estimate)
    }

    /// Last estimate with its timestamp in milliseconds, however old.
    pub async fn last_estimate(&self) -> Option<(u64, GasFeeEstimate)> {
        self.cache.last().await
    }
}
