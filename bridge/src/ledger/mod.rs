// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Destination-ledger operations consumed by the engine.
//!
//! `mint` moves value out of the engine's account (minting twin tokens,
//! crediting native value, or releasing locked base tokens); `burn` moves
//! value into it. Every call carries a memo naming what it settles, which the
//! ledger uses to reject replays with [`LedgerError::Duplicate`].

pub mod http;

use crate::types::{EventSource, LedgerAccount, LedgerIndex, Principal, WithdrawalId};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpLedgerClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerMemo {
    Mint(EventSource),
    Release(EventSource),
    Reimburse(WithdrawalId),
    WithdrawalFee,
    Burn { recipient: Address },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerError {
    #[error("ledger temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),
    #[error("insufficient funds, balance {balance}")]
    InsufficientFunds { balance: U256 },
    #[error("insufficient allowance, allowance {allowance}")]
    InsufficientAllowance { allowance: U256 },
    #[error("amount too low, minimum {minimum}")]
    AmountTooLow { minimum: U256 },
    #[error("duplicate of ledger block {duplicate_of}")]
    Duplicate { duplicate_of: LedgerIndex },
    #[error("ledger rejected the transfer: {0}")]
    Rejected(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::TemporarilyUnavailable(_))
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            LedgerError::TemporarilyUnavailable(_) => "temporarily_unavailable",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::InsufficientAllowance { .. } => "insufficient_allowance",
            LedgerError::AmountTooLow { .. } => "amount_too_low",
            LedgerError::Duplicate { .. } => "duplicate",
            LedgerError::Rejected(_) => "rejected",
        }
    }
}

/// A replayed transfer already settled at `duplicate_of` counts as done.
pub fn settled(result: Result<LedgerIndex, LedgerError>) -> Result<LedgerIndex, LedgerError> {
    match result {
        Err(LedgerError::Duplicate { duplicate_of }) => Ok(duplicate_of),
        other => other,
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn transfer_fee(&self, ledger: Principal) -> Result<U256, LedgerError>;

    async fn mint(
        &self,
        ledger: Principal,
        to: LedgerAccount,
        amount: U256,
        memo: LedgerMemo,
    ) -> Result<LedgerIndex, LedgerError>;

    async fn burn(
        &self,
        ledger: Principal,
        from: LedgerAccount,
        amount: U256,
        memo: LedgerMemo,
    ) -> Result<LedgerIndex, LedgerError>;
}
