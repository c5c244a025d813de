// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of every source-chain query to all configured providers.
//!
//! An answer is only used when every provider returned it. Errors and
//! disagreements are surfaced as recoverable [`ProviderError`]s so the
//! caller can retry the same query on the next tick.

use super::provider::{LogFilter, LogProvider, ProviderError};
use crate::error::{BridgeError, BridgeResult};
use crate::events::RawLog;
use crate::metrics::EngineMetrics;
use crate::types::{BlockNumber, BlockTag};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const MIN_PROVIDERS: usize = 2;

pub struct ProviderQuorum {
    providers: Vec<Arc<dyn LogProvider>>,
    request_timeout: Duration,
    metrics: Arc<EngineMetrics>,
}

impl ProviderQuorum {
    pub fn new(
        providers: Vec<Arc<dyn LogProvider>>,
        request_timeout: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> BridgeResult<Self> {
        if providers.len() < MIN_PROVIDERS {
            return Err(BridgeError::InternalError(format!(
                "at least {MIN_PROVIDERS} providers are required, got {}",
                providers.len()
            )));
        }
        Ok(Self {
            providers,
            request_timeout,
            metrics,
        })
    }

    async fn timed<T, F>(&self, provider: &dyn LogProvider, method: &str, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let timer = self
            .metrics
            .provider_latency
            .with_label_values(&[provider.name(), method])
            .start_timer();
        let result = match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };
        timer.observe_duration();
        if let Err(e) = &result {
            self.metrics
                .provider_errors
                .with_label_values(&[provider.name(), e.error_type()])
                .inc();
        }
        result
    }

    /// Block number of `tag` for every provider, in provider order.
    pub async fn block_numbers(&self, tag: BlockTag) -> Result<Vec<BlockNumber>, ProviderError> {
        let results = join_all(self.providers.iter().map(|provider| {
            self.timed(provider.as_ref(), "block_number", provider.block_number(tag))
        }))
        .await;
        results.into_iter().collect()
    }

    /// Lowest `tag` block across providers: every provider has seen at least this far.
    pub async fn min_block_number(&self, tag: BlockTag) -> Result<BlockNumber, ProviderError> {
        let numbers = self.block_numbers(tag).await?;
        let min = numbers
            .iter()
            .copied()
            .min()
            .ok_or_else(|| ProviderError::InvalidResponse("no providers".to_string()))?;
        debug!("[Quorum] {:?} block numbers {:?}, agreed {}", tag, numbers, min);
        Ok(min)
    }

    /// Logs matching `filter`, sorted by (block, log index), identical across all providers.
    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ProviderError> {
        let results = join_all(
            self.providers
                .iter()
                .map(|provider| self.timed(provider.as_ref(), "get_logs", provider.get_logs(filter))),
        )
        .await;

        if results
            .iter()
            .any(|r| matches!(r, Err(ProviderError::ResponseTooLarge)))
        {
            return Err(ProviderError::ResponseTooLarge);
        }

        let mut answers = Vec::with_capacity(results.len());
        for (provider, result) in self.providers.iter().zip(results) {
            match result {
                Ok(mut logs) => {
                    logs.sort_by_key(RawLog::position);
                    logs.dedup();
                    answers.push((provider.name(), logs));
                }
                Err(e) => {
                    warn!(
                        "[Quorum] Provider {} failed to fetch logs in [{}, {}]: {}",
                        provider.name(),
                        filter.from_block,
                        filter.to_block,
                        e
                    );
                    return Err(e);
                }
            }
        }

        let mut answers = answers.into_iter();
        let (first_name, first) = answers
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no providers".to_string()))?;
        for (name, logs) in answers {
            if logs != first {
                self.metrics.provider_disagreements.inc();
                return Err(ProviderError::Disagreement(format!(
                    "logs in [{}, {}]: {} returned {} logs, {} returned {}",
                    filter.from_block,
                    filter.to_block,
                    first_name,
                    first.len(),
                    name,
                    logs.len()
                )));
            }
        }
        Ok(first)
    }
}
