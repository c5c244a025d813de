// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Source-chain events emitted by the custody contract.
//!
//! Raw logs are turned into [`SourceEvent`]s by [`parser`], then resolved
//! against the token registry by [`classifier`].

pub mod classifier;
pub mod parser;

use crate::types::{BlockNumber, EventSource, LedgerAccount, LogIndex, Principal, Subaccount};
use ethers::types::{Address, Bytes, Log, H256, U256};
use serde::{Deserialize, Serialize};

/// `DepositLog(address,address,uint256,bytes32,bytes32)` from the first custody contract.
pub const DEPOSIT_LOG_TOPIC: H256 =
    topic("deaddf8708b62ae1bf8ec4693b523254aa961b2da6bc5be57f3188ee784d6275");

/// `TokenBurn(address,uint256,bytes32,address,bytes32)`: a native or token
/// deposit, or a burn of a wrapped token.
pub const TOKEN_BURN_TOPIC: H256 =
    topic("37199deebd336af9013dbddaaf9a68e337707bb4ed64cb45ed12841af85e0377");

/// `WrappedTokenDeployed(bytes32,address)`
pub const WRAPPED_TOKEN_DEPLOYED_TOPIC: H256 =
    topic("e63ddf723173735772522be59b64b9c95be6eb8f14b87948f670ad6f8949ab2e");

pub const ALL_TOPICS: [H256; 3] = [
    DEPOSIT_LOG_TOPIC,
    TOKEN_BURN_TOPIC,
    WRAPPED_TOKEN_DEPLOYED_TOPIC,
];

const fn topic(hex: &str) -> H256 {
    const fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            _ => panic!("topic must be lowercase hex"),
        }
    }
    let bytes = hex.as_bytes();
    assert!(bytes.len() == 64, "topic must be 32 bytes");
    let mut out = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        out[i] = (nibble(bytes[2 * i]) << 4) | nibble(bytes[2 * i + 1]);
        i += 1;
    }
    H256(out)
}

/// A log as returned by a provider, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub block_hash: Option<H256>,
    pub block_number: Option<BlockNumber>,
    pub transaction_hash: Option<H256>,
    pub log_index: Option<LogIndex>,
    pub removed: bool,
}

impl RawLog {
    /// Ordering key; pending logs sort last.
    pub fn position(&self) -> (BlockNumber, LogIndex) {
        (
            self.block_number.unwrap_or(BlockNumber::MAX),
            self.log_index.unwrap_or(LogIndex::MAX),
        )
    }
}

impl From<Log> for RawLog {
    fn from(log: Log) -> Self {
        Self {
            address: log.address,
            topics: log.topics,
            data: log.data,
            block_hash: log.block_hash,
            block_number: log.block_number.map(|n| n.as_u64()),
            transaction_hash: log.transaction_hash,
            log_index: log.log_index.map(|i| i.low_u64()),
            removed: log.removed.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeDeposit {
    pub transaction_hash: H256,
    pub block_number: BlockNumber,
    pub log_index: LogIndex,
    pub from_address: Address,
    pub value: U256,
    pub principal: Principal,
    pub subaccount: Option<Subaccount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDeposit {
    pub transaction_hash: H256,
    pub block_number: BlockNumber,
    pub log_index: LogIndex,
    pub from_address: Address,
    pub value: U256,
    pub principal: Principal,
    pub subaccount: Option<Subaccount>,
    pub token_contract_address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedBurn {
    pub transaction_hash: H256,
    pub block_number: BlockNumber,
    pub log_index: LogIndex,
    pub from_address: Address,
    pub value: U256,
    pub principal: Principal,
    pub subaccount: Option<Subaccount>,
    pub wrapped_contract_address: Address,
    /// Ledger of the base token released by this burn
    pub base_ledger: Principal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedDeployed {
    pub transaction_hash: H256,
    pub block_number: BlockNumber,
    pub log_index: LogIndex,
    pub base_ledger: Principal,
    pub wrapped_contract_address: Address,
}

/// Every event kind the custody contract emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceEvent {
    NativeDeposit(NativeDeposit),
    TokenDeposit(TokenDeposit),
    WrappedBurn(WrappedBurn),
    WrappedDeployed(WrappedDeployed),
}

impl SourceEvent {
    pub fn source(&self) -> EventSource {
        let (transaction_hash, log_index) = match self {
            SourceEvent::NativeDeposit(e) => (e.transaction_hash, e.log_index),
            SourceEvent::TokenDeposit(e) => (e.transaction_hash, e.log_index),
            SourceEvent::WrappedBurn(e) => (e.transaction_hash, e.log_index),
            SourceEvent::WrappedDeployed(e) => (e.transaction_hash, e.log_index),
        };
        EventSource {
            transaction_hash,
            log_index,
        }
    }

    pub fn block_number(&self) -> BlockNumber {
        match self {
            SourceEvent::NativeDeposit(e) => e.block_number,
            SourceEvent::TokenDeposit(e) => e.block_number,
            SourceEvent::WrappedBurn(e) => e.block_number,
            SourceEvent::WrappedDeployed(e) => e.block_number,
        }
    }

    /// Transferred amount; `None` for registry events.
    pub fn value(&self) -> Option<U256> {
        match self {
            SourceEvent::NativeDeposit(e) => Some(e.value),
            SourceEvent::TokenDeposit(e) => Some(e.value),
            SourceEvent::WrappedBurn(e) => Some(e.value),
            SourceEvent::WrappedDeployed(_) => None,
        }
    }

    pub fn beneficiary(&self) -> Option<LedgerAccount> {
        match self {
            SourceEvent::NativeDeposit(e) => Some(LedgerAccount::new(e.principal, e.subaccount)),
            SourceEvent::TokenDeposit(e) => Some(LedgerAccount::new(e.principal, e.subaccount)),
            SourceEvent::WrappedBurn(e) => Some(LedgerAccount::new(e.principal, e.subaccount)),
            SourceEvent::WrappedDeployed(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceEvent::NativeDeposit(_) => "native_deposit",
            SourceEvent::TokenDeposit(_) => "token_deposit",
            SourceEvent::WrappedBurn(_) => "wrapped_burn",
            SourceEvent::WrappedDeployed(_) => "wrapped_deployed",
        }
    }

    /// Deposits are minted, burns are released.
    pub fn is_release(&self) -> bool {
        matches!(self, SourceEvent::WrappedBurn(_))
    }
}
