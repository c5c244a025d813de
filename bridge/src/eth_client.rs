// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC access to an EVM chain through ethers.
//!
//! One [`EthClient`] wraps one node. The scraper holds several of them behind
//! a [`ProviderQuorum`](crate::scraper::quorum::ProviderQuorum); the withdrawal
//! pipeline talks to one of them directly.

use crate::events::RawLog;
use crate::fees::FeeHistory;
use crate::retry_with_max_elapsed_time;
use crate::scraper::provider::{LogFilter, LogProvider, ProviderError};
use crate::types::{BlockNumber, BlockTag};
use crate::withdraw::client::{SendRawTransactionResult, TransactionClient};
use crate::withdraw::transactions::{TransactionReceipt, TransactionStatus};
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError as EthersProviderError};
use ethers::types::{
    Address, BlockId, BlockNumber as EthBlockNumber, Bytes, Filter, Log, H256, U256, U64,
};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Node error messages for `eth_getLogs` queries that hit a result limit.
const RESPONSE_TOO_LARGE_MESSAGES: [&str; 5] = [
    "query returned more than",
    "response size exceeded",
    "log response size exceeded",
    "too many results",
    "block range is too wide",
];

pub struct EthClient {
    name: String,
    provider: Provider<Http>,
    request_timeout: Duration,
}

impl EthClient {
    pub fn new(
        name: impl Into<String>,
        url: &str,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(url)?;
        Ok(Self {
            name: name.into(),
            provider,
            request_timeout,
        })
    }

    /// Fails unless the node serves `expected` chain id.
    pub async fn check_chain_id(&self, expected: u64) -> anyhow::Result<()> {
        let chain_id = self
            .call(self.provider.get_chainid())
            .await
            .map_err(|e| anyhow::anyhow!("[EthClient] {}: {}", self.name, e))?
            .as_u64();
        if chain_id != expected {
            return Err(anyhow::anyhow!(
                "provider {} serves chain {}, expected {}",
                self.name,
                chain_id,
                expected
            ));
        }
        tracing::info!("[EthClient] {} connected to chain {}", self.name, chain_id);
        Ok(())
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, EthersProviderError>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(map_provider_error),
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    async fn get_block_number(&self, tag: BlockTag) -> Result<BlockNumber, ProviderError> {
        let block_tag = match tag {
            BlockTag::Latest => {
                return self
                    .call(self.provider.get_block_number())
                    .await
                    .map(|n| n.as_u64())
            }
            BlockTag::Safe => EthBlockNumber::Safe,
            BlockTag::Finalized => EthBlockNumber::Finalized,
        };
        let block = self
            .call(self.provider.get_block(BlockId::Number(block_tag)))
            .await?
            .ok_or_else(|| ProviderError::InvalidResponse(format!("no {tag:?} block")))?;
        block
            .number
            .map(|n| n.as_u64())
            .ok_or_else(|| ProviderError::InvalidResponse(format!("{tag:?} block has no number")))
    }
}

#[async_trait]
impl LogProvider for EthClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn block_number(&self, tag: BlockTag) -> Result<BlockNumber, ProviderError> {
        retry_with_max_elapsed_time!(self.get_block_number(tag), self.request_timeout)
    }

    // Not retried here: a too-large response must reach the scraper quickly
    // so it can halve the range.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ProviderError> {
        let query = Filter::new()
            .address(filter.address)
            .topic0(filter.topics.clone())
            .from_block(filter.from_block)
            .to_block(filter.to_block);
        let logs = self.call(self.provider.get_logs(&query)).await?;
        if let Some(log) = logs.iter().find(|log| log.address != filter.address) {
            return Err(ProviderError::InvalidResponse(format!(
                "log from unexpected contract {:#x}",
                log.address
            )));
        }
        debug!(
            "[EthClient] {} returned {} logs for [{}, {}]",
            self.name,
            logs.len(),
            filter.from_block,
            filter.to_block
        );
        Ok(logs.into_iter().map(raw_log).collect())
    }
}

#[async_trait]
impl TransactionClient for EthClient {
    async fn fee_history(
        &self,
        block_count: u64,
        newest_block: EthBlockNumber,
        reward_percentiles: &[f64],
    ) -> Result<FeeHistory, ProviderError> {
        let history = retry_with_max_elapsed_time!(
            self.call(
                self.provider
                    .fee_history(block_count, newest_block, reward_percentiles)
            ),
            self.request_timeout
        )?;
        Ok(FeeHistory {
            oldest_block: history.oldest_block.as_u64(),
            base_fee_per_gas: history.base_fee_per_gas,
            reward: history.reward,
        })
    }

    async fn transaction_count(
        &self,
        address: Address,
        block: EthBlockNumber,
    ) -> Result<u64, ProviderError> {
        let count = retry_with_max_elapsed_time!(
            self.call(
                self.provider
                    .get_transaction_count(address, Some(BlockId::Number(block)))
            ),
            self.request_timeout
        )?;
        Ok(count.as_u64())
    }

    async fn send_raw_transaction(
        &self,
        raw: &Bytes,
    ) -> Result<SendRawTransactionResult, ProviderError> {
        let result = tokio::time::timeout(
            self.request_timeout,
            self.provider.send_raw_transaction(raw.clone()),
        )
        .await;
        match result {
            Err(_) => Err(ProviderError::Timeout),
            Ok(Ok(_pending)) => Ok(SendRawTransactionResult::Ok),
            Ok(Err(e)) => match map_provider_error(e) {
                ProviderError::Rpc { code, message } => {
                    match SendRawTransactionResult::from_rpc_message(&message) {
                        Some(result) => Ok(result),
                        None => {
                            warn!(
                                "[EthClient] {} rejected a transaction with an unknown error {}: {}",
                                self.name, code, message
                            );
                            Err(ProviderError::Rpc { code, message })
                        }
                    }
                }
                other => Err(other),
            },
        }
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ProviderError> {
        let receipt = retry_with_max_elapsed_time!(
            self.call(self.provider.get_transaction_receipt(hash)),
            self.request_timeout
        )?;
        convert_receipt(receipt)
    }
}

fn raw_log(log: Log) -> RawLog {
    RawLog {
        address: log.address,
        topics: log.topics,
        data: log.data,
        block_hash: log.block_hash,
        block_number: log.block_number.map(|n| n.as_u64()),
        transaction_hash: log.transaction_hash,
        log_index: log.log_index.map(|i| i.as_u64()),
        removed: log.removed.unwrap_or(false),
    }
}

/// `Ok(None)` for unknown transactions and for ones that are not yet in a
/// block.
fn convert_receipt(
    receipt: Option<ethers::types::TransactionReceipt>,
) -> Result<Option<TransactionReceipt>, ProviderError> {
    let Some(receipt) = receipt else {
        return Ok(None);
    };
    let (Some(block_hash), Some(block_number)) = (receipt.block_hash, receipt.block_number) else {
        return Ok(None);
    };
    let status = match receipt.status {
        Some(status) if status == U64::one() => TransactionStatus::Success,
        Some(_) => TransactionStatus::Failure,
        None => {
            return Err(ProviderError::InvalidResponse(format!(
                "receipt of {:#x} has no status",
                receipt.transaction_hash
            )))
        }
    };
    Ok(Some(TransactionReceipt {
        block_hash,
        block_number: block_number.as_u64(),
        effective_gas_price: receipt.effective_gas_price.unwrap_or_default(),
        gas_used: receipt.gas_used.unwrap_or(U256::zero()),
        status,
        transaction_hash: receipt.transaction_hash,
    }))
}

fn map_provider_error(err: EthersProviderError) -> ProviderError {
    match &err {
        EthersProviderError::JsonRpcClientError(inner) => {
            if let Some(response) = inner.as_error_response() {
                return rpc_error(response.code, &response.message);
            }
            if inner.as_serde_error().is_some() {
                return ProviderError::InvalidResponse(err.to_string());
            }
            ProviderError::Transport(err.to_string())
        }
        EthersProviderError::HTTPError(e) if e.is_timeout() => ProviderError::Timeout,
        EthersProviderError::HTTPError(_) => ProviderError::Transport(err.to_string()),
        EthersProviderError::SerdeJson(_) | EthersProviderError::HexError(_) => {
            ProviderError::InvalidResponse(err.to_string())
        }
        _ => ProviderError::Transport(err.to_string()),
    }
}

fn rpc_error(code: i64, message: &str) -> ProviderError {
    let lowered = message.to_ascii_lowercase();
    if RESPONSE_TOO_LARGE_MESSAGES
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        return ProviderError::ResponseTooLarge;
    }
    ProviderError::Rpc {
        code,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::HttpClientError;
    use ethers::providers::JsonRpcError;

    fn json_rpc_error(code: i64, message: &str) -> EthersProviderError {
        EthersProviderError::JsonRpcClientError(Box::new(HttpClientError::JsonRpcError(
            JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            },
        )))
    }

    #[test]
    fn test_oversized_log_responses_are_recognized() {
        assert_eq!(
            map_provider_error(json_rpc_error(-32005, "query returned more than 10000 results")),
            ProviderError::ResponseTooLarge
        );
        assert_eq!(
            map_provider_error(json_rpc_error(-32602, "Log response size exceeded.")),
            ProviderError::ResponseTooLarge
        );
        assert_eq!(
            map_provider_error(json_rpc_error(-32000, "header not found")),
            ProviderError::Rpc {
                code: -32000,
                message: "header not found".into()
            }
        );
    }

    #[test]
    fn test_send_errors_map_to_outcomes() {
        let ProviderError::Rpc { message, .. } =
            map_provider_error(json_rpc_error(-32000, "replacement transaction underpriced"))
        else {
            panic!("expected an rpc error");
        };
        assert_eq!(
            SendRawTransactionResult::from_rpc_message(&message),
            Some(SendRawTransactionResult::Underpriced)
        );
    }

    #[test]
    fn test_convert_log() {
        let log = Log {
            address: Address::repeat_byte(1),
            topics: vec![H256::repeat_byte(2)],
            data: Bytes::from(vec![0u8; 32]),
            block_hash: Some(H256::repeat_byte(3)),
            block_number: Some(U64::from(17)),
            transaction_hash: Some(H256::repeat_byte(4)),
            log_index: Some(U256::from(5)),
            removed: None,
            ..Default::default()
        };
        let raw = raw_log(log);
        assert_eq!(raw.block_number, Some(17));
        assert_eq!(raw.log_index, Some(5));
        assert!(!raw.removed);

        let pending = raw_log(Log::default());
        assert_eq!(pending.block_number, None);
        assert_eq!(pending.transaction_hash, None);
    }

    #[test]
    fn test_convert_receipt() {
        let mined = ethers::types::TransactionReceipt {
            transaction_hash: H256::repeat_byte(9),
            block_hash: Some(H256::repeat_byte(8)),
            block_number: Some(U64::from(100)),
            gas_used: Some(U256::from(21_000)),
            effective_gas_price: Some(U256::from(7)),
            status: Some(U64::zero()),
            ..Default::default()
        };
        let receipt = convert_receipt(Some(mined.clone())).unwrap().unwrap();
        assert_eq!(receipt.status, TransactionStatus::Failure);
        assert_eq!(receipt.effective_transaction_fee(), U256::from(147_000));

        let unmined = ethers::types::TransactionReceipt {
            block_hash: None,
            block_number: None,
            ..mined.clone()
        };
        assert_eq!(convert_receipt(Some(unmined)).unwrap(), None);
        assert_eq!(convert_receipt(None).unwrap(), None);

        let no_status = ethers::types::TransactionReceipt {
            status: None,
            ..mined
        };
        assert!(matches!(
            convert_receipt(Some(no_status)),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_new_rejects_bad_url() {
        assert!(EthClient::new("a", "not a url", Duration::from_secs(1)).is_err());
        assert!(EthClient::new("a", "http://localhost:8545", Duration::from_secs(1)).is_ok());
    }
}
