// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Identity and key types shared by every engine component.

use ethers::types::{BlockNumber as EthBlockNumber, H256};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type BlockNumber = u64;
pub type LogIndex = u64;
/// Index of a block on the destination ledger.
pub type LedgerIndex = u64;
/// A withdrawal is identified by the index of the native ledger burn that funded it.
pub type WithdrawalId = u64;

/// Unique key of an on-chain event: the transaction that emitted it and the
/// position of the log inside the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventSource {
    pub transaction_hash: H256,
    pub log_index: LogIndex,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.transaction_hash, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrincipalError {
    #[error("principal is longer than {max} bytes: {actual}", max = Principal::MAX_LENGTH)]
    TooLong { actual: usize },
    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),
}

/// Identity of an account owner on the destination ledger.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Principal {
    len: u8,
    bytes: [u8; Principal::MAX_LENGTH],
}

impl Principal {
    pub const MAX_LENGTH: usize = 29;
    const ANONYMOUS_TAG: u8 = 0x04;

    pub fn try_from_slice(slice: &[u8]) -> Result<Self, PrincipalError> {
        if slice.len() > Self::MAX_LENGTH {
            return Err(PrincipalError::TooLong {
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; Self::MAX_LENGTH];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Self {
            len: slice.len() as u8,
            bytes,
        })
    }

    pub fn anonymous() -> Self {
        let mut bytes = [0u8; Self::MAX_LENGTH];
        bytes[0] = Self::ANONYMOUS_TAG;
        Self { len: 1, bytes }
    }

    pub fn management() -> Self {
        Self {
            len: 0,
            bytes: [0u8; Self::MAX_LENGTH],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn is_anonymous(&self) -> bool {
        self.as_slice() == [Self::ANONYMOUS_TAG]
    }

    pub fn is_management(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_slice()))
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Principal({})", self)
    }
}

impl FromStr for Principal {
    type Err = PrincipalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| PrincipalError::InvalidHex(e.to_string()))?;
        Self::try_from_slice(&bytes)
    }
}

/// Optional 32-byte discriminator of an account under one owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subaccount(pub [u8; 32]);

impl Subaccount {
    /// An all-zero subaccount is the owner's default account.
    pub fn from_bytes(bytes: [u8; 32]) -> Option<Self> {
        if bytes == [0u8; 32] {
            None
        } else {
            Some(Self(bytes))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub owner: Principal,
    pub subaccount: Option<Subaccount>,
}

impl LedgerAccount {
    pub fn new(owner: Principal, subaccount: Option<Subaccount>) -> Self {
        Self { owner, subaccount }
    }
}

impl From<Principal> for LedgerAccount {
    fn from(owner: Principal) -> Self {
        Self {
            owner,
            subaccount: None,
        }
    }
}

impl fmt::Display for LedgerAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subaccount {
            Some(sub) => write!(f, "{}.{}", self.owner, hex::encode(sub.0)),
            None => write!(f, "{}", self.owner),
        }
    }
}

/// Which block a query is pinned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockTag {
    Latest,
    Safe,
    #[default]
    Finalized,
}

impl From<BlockTag> for EthBlockNumber {
    fn from(tag: BlockTag) -> Self {
        match tag {
            BlockTag::Latest => EthBlockNumber::Latest,
            BlockTag::Safe => EthBlockNumber::Safe,
            BlockTag::Finalized => EthBlockNumber::Finalized,
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
