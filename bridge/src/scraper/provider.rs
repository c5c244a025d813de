// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::events::RawLog;
use crate::types::{BlockNumber, BlockTag};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response too large")]
    ResponseTooLarge,
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("providers disagree: {0}")]
    Disagreement(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether retrying the same query later can succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ProviderError::InvalidResponse(_))
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ProviderError::Timeout => "timeout",
            ProviderError::Transport(_) => "transport",
            ProviderError::ResponseTooLarge => "response_too_large",
            ProviderError::Rpc { .. } => "rpc",
            ProviderError::Disagreement(_) => "disagreement",
            ProviderError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// `eth_getLogs` query for the custody contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    /// Accepted values of topic 0
    pub topics: Vec<H256>,
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
}

impl LogFilter {
    pub fn with_range(&self, from_block: BlockNumber, to_block: BlockNumber) -> Self {
        Self {
            from_block,
            to_block,
            ..self.clone()
        }
    }

    pub fn block_count(&self) -> u64 {
        self.to_block.saturating_sub(self.from_block) + 1
    }
}

/// One independent source of source-chain data.
#[async_trait]
pub trait LogProvider: Send + Sync {
    /// Name used in logs and metrics labels
    fn name(&self) -> &str;

    async fn block_number(&self, tag: BlockTag) -> Result<BlockNumber, ProviderError>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ProviderError>;
}
