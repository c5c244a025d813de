// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Destination-chain calls made by the withdrawal pipeline.

use super::transactions::TransactionReceipt;
use crate::fees::FeeHistory;
use crate::scraper::provider::ProviderError;
use async_trait::async_trait;
use ethers::types::{Address, BlockNumber as EthBlockNumber, Bytes, H256};
use serde::{Deserialize, Serialize};

/// Outcome of `eth_sendRawTransaction`, with the node's error messages
/// mapped onto what the pipeline does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendRawTransactionResult {
    Ok,
    /// The node already has this exact transaction
    AlreadyKnown,
    /// Some transaction with this nonce was already mined
    NonceTooLow,
    NonceTooHigh,
    InsufficientFunds,
    /// Fee too low for inclusion or for replacing the pooled transaction
    Underpriced,
    OutOfGas,
}

impl SendRawTransactionResult {
    /// The transaction (or one with its nonce) is known to the network.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            SendRawTransactionResult::Ok
                | SendRawTransactionResult::AlreadyKnown
                | SendRawTransactionResult::NonceTooLow
        )
    }

    /// Only a same-nonce replacement at a higher fee can make progress.
    pub fn needs_replacement(&self) -> bool {
        matches!(
            self,
            SendRawTransactionResult::Underpriced | SendRawTransactionResult::OutOfGas
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SendRawTransactionResult::Ok => "ok",
            SendRawTransactionResult::AlreadyKnown => "already_known",
            SendRawTransactionResult::NonceTooLow => "nonce_too_low",
            SendRawTransactionResult::NonceTooHigh => "nonce_too_high",
            SendRawTransactionResult::InsufficientFunds => "insufficient_funds",
            SendRawTransactionResult::Underpriced => "underpriced",
            SendRawTransactionResult::OutOfGas => "out_of_gas",
        }
    }

    /// Maps a JSON-RPC error message from geth, erigon, nethermind or besu.
    pub fn from_rpc_message(message: &str) -> Option<Self> {
        let message = message.to_ascii_lowercase();
        let contains_any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));
        if contains_any(&["already known", "known transaction", "already imported", "alreadyknown"]) {
            Some(SendRawTransactionResult::AlreadyKnown)
        } else if contains_any(&["nonce too low", "oldnonce", "nonce is too low"]) {
            Some(SendRawTransactionResult::NonceTooLow)
        } else if contains_any(&["nonce too high", "nonce is too high"]) {
            Some(SendRawTransactionResult::NonceTooHigh)
        } else if contains_any(&["insufficient funds", "insufficientfunds"]) {
            Some(SendRawTransactionResult::InsufficientFunds)
        } else if contains_any(&[
            "underpriced",
            "fee too low",
            "less than block base fee",
            "feetoolow",
        ]) {
            Some(SendRawTransactionResult::Underpriced)
        } else if contains_any(&["intrinsic gas too low", "out of gas", "gas limit reached"]) {
            Some(SendRawTransactionResult::OutOfGas)
        } else {
            None
        }
    }
}

#[async_trait]
pub trait TransactionClient: Send + Sync {
    async fn fee_history(
        &self,
        block_count: u64,
        newest_block: EthBlockNumber,
        reward_percentiles: &[f64],
    ) -> Result<FeeHistory, ProviderError>;

    async fn transaction_count(
        &self,
        address: Address,
        block: EthBlockNumber,
    ) -> Result<u64, ProviderError>;

    async fn send_raw_transaction(
        &self,
        raw: &Bytes,
    ) -> Result<SendRawTransactionResult, ProviderError>;

    /// `None` while the transaction is not mined.
    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ProviderError>;
}
