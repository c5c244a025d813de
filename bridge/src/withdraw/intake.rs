// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Withdrawal requests from destination-ledger users.
//!
//! Native withdrawals burn the requested amount on the native ledger and pay
//! the transaction fee out of it. Token withdrawals and wraps first burn the
//! estimated maximum transaction fee in native token; the index of that burn
//! becomes the withdrawal id. If the second burn fails, the fee burn is
//! recorded as a failed request and reimbursed by the pipeline.

use super::transactions::ReimbursementRequest;
use super::{WithdrawalKind, WithdrawalRequest, ERC20_WITHDRAWAL_GAS_LIMIT, WRAP_GAS_LIMIT};
use crate::fees::FeeEstimator;
use crate::ledger::{settled, LedgerClient, LedgerError, LedgerMemo};
use crate::metrics::EngineMetrics;
use crate::state::audit::EventType;
use crate::state::guard::{GuardError, WithdrawGuard};
use crate::state::store::StateStore;
use crate::types::{now_millis, LedgerAccount, LedgerIndex, Principal};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveReceipt {
    /// Ledger index of the burn funding the withdrawal; also its withdrawal id.
    pub block_index: LedgerIndex,
}

/// A burn on a destination ledger that did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBurnError {
    #[error("ledger {ledger} temporarily unavailable: {message}")]
    TemporarilyUnavailable { ledger: Principal, message: String },
    #[error("insufficient funds on ledger {ledger}: balance {balance}, needed {failed_burn_amount}")]
    InsufficientFunds {
        ledger: Principal,
        balance: U256,
        failed_burn_amount: U256,
    },
    #[error("insufficient allowance on ledger {ledger}: allowance {allowance}, needed {failed_burn_amount}")]
    InsufficientAllowance {
        ledger: Principal,
        allowance: U256,
        failed_burn_amount: U256,
    },
    #[error("amount {failed_burn_amount} too low for ledger {ledger}, minimum {minimum}")]
    AmountTooLow {
        ledger: Principal,
        minimum: U256,
        failed_burn_amount: U256,
    },
    #[error("ledger {ledger} rejected the burn: {message}")]
    Rejected { ledger: Principal, message: String },
}

impl LedgerBurnError {
    fn new(ledger: Principal, failed_burn_amount: U256, err: LedgerError) -> Self {
        match err {
            LedgerError::TemporarilyUnavailable(message) => {
                LedgerBurnError::TemporarilyUnavailable { ledger, message }
            }
            LedgerError::InsufficientFunds { balance } => LedgerBurnError::InsufficientFunds {
                ledger,
                balance,
                failed_burn_amount,
            },
            LedgerError::InsufficientAllowance { allowance } => {
                LedgerBurnError::InsufficientAllowance {
                    ledger,
                    allowance,
                    failed_burn_amount,
                }
            }
            LedgerError::AmountTooLow { minimum } => LedgerBurnError::AmountTooLow {
                ledger,
                minimum,
                failed_burn_amount,
            },
            // `settled` resolves duplicates before this point.
            LedgerError::Duplicate { duplicate_of } => LedgerBurnError::Rejected {
                ledger,
                message: format!("duplicate of {duplicate_of}"),
            },
            LedgerError::Rejected(message) => LedgerBurnError::Rejected { ledger, message },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalError {
    #[error("amount too low, minimum withdrawal amount is {min_withdrawal_amount}")]
    AmountTooLow { min_withdrawal_amount: U256 },
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("a withdrawal from this principal is already being processed")]
    AlreadyProcessing,
    #[error("too many concurrent requests")]
    TooManyConcurrentRequests,
    #[error("too many pending withdrawal requests")]
    TooManyPendingRequests,
    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),
    #[error(transparent)]
    LedgerBurn(LedgerBurnError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawTokenError {
    #[error("token with ledger {ledger_id} is not supported")]
    TokenNotSupported { ledger_id: Principal },
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("a withdrawal from this principal is already being processed")]
    AlreadyProcessing,
    #[error("too many concurrent requests")]
    TooManyConcurrentRequests,
    #[error("too many pending withdrawal requests")]
    TooManyPendingRequests,
    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),
    #[error("transaction fee burn failed: {0}")]
    NativeLedgerError(LedgerBurnError),
    #[error("token burn failed: {0}")]
    TokenLedgerError(LedgerBurnError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapError {
    #[error("no wrapped token for base ledger {base_ledger}")]
    UnsupportedToken { base_ledger: Principal },
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("a withdrawal from this principal is already being processed")]
    AlreadyProcessing,
    #[error("too many concurrent requests")]
    TooManyConcurrentRequests,
    #[error("too many pending withdrawal requests")]
    TooManyPendingRequests,
    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),
    #[error("transaction fee burn failed: {0}")]
    NativeLedgerError(LedgerBurnError),
    #[error("base token lock failed: {0}")]
    BaseLedgerError(LedgerBurnError),
}

macro_rules! impl_from_guard_error {
    ($($error:ident),*) => {
        $(
            impl From<GuardError> for $error {
                fn from(err: GuardError) -> Self {
                    match err {
                        GuardError::AlreadyProcessing => $error::AlreadyProcessing,
                        GuardError::TooManyConcurrentRequests => $error::TooManyConcurrentRequests,
                        GuardError::TooManyPendingRequests => $error::TooManyPendingRequests,
                    }
                }
            }
        )*
    };
}

impl_from_guard_error!(WithdrawalError, WithdrawTokenError, WrapError);

/// Rejects destinations that would lose the withdrawn value.
pub fn validate_destination(destination: Address, custody: Address) -> Result<(), String> {
    if destination.is_zero() {
        return Err("the zero address is not a valid destination".to_string());
    }
    if destination == custody {
        return Err("cannot withdraw to the custody contract".to_string());
    }
    Ok(())
}

pub struct WithdrawalIntake {
    store: Arc<StateStore>,
    ledger: Arc<dyn LedgerClient>,
    fees: Arc<FeeEstimator>,
    metrics: Arc<EngineMetrics>,
}

impl WithdrawalIntake {
    pub fn new(
        store: Arc<StateStore>,
        ledger: Arc<dyn LedgerClient>,
        fees: Arc<FeeEstimator>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            ledger,
            fees,
            metrics,
        }
    }

    fn observe(&self, kind: &str, outcome: &str) {
        self.metrics
            .withdrawal_requests
            .with_label_values(&[kind, outcome])
            .inc();
    }

    fn guard(&self, caller: &LedgerAccount) -> Result<WithdrawGuard, GuardError> {
        let pending = self.store.read().withdrawals.pending_count();
        WithdrawGuard::new(self.store.guards(), caller.owner, pending)
    }

    async fn estimate_max_transaction_fee(&self, gas_limit: u64) -> Result<U256, String> {
        let estimate = self.fees.estimate().await.map_err(|e| e.to_string())?;
        Ok(estimate
            .to_price(U256::from(gas_limit))
            .max_transaction_fee())
    }

    async fn burn(
        &self,
        ledger: Principal,
        from: LedgerAccount,
        amount: U256,
        memo: LedgerMemo,
    ) -> Result<LedgerIndex, LedgerBurnError> {
        settled(self.ledger.burn(ledger, from, amount, memo).await)
            .map_err(|e| LedgerBurnError::new(ledger, amount, e))
    }

    async fn accept(&self, request: WithdrawalRequest) -> Result<RetrieveReceipt, String> {
        let withdrawal_id = request.withdrawal_id;
        let kind = request.kind.label();
        match self
            .store
            .record(EventType::AcceptedWithdrawalRequest(request))
            .await
        {
            Ok(()) => {
                info!("[Withdrawal] Accepted {} withdrawal {}", kind, withdrawal_id);
                self.observe(kind, "accepted");
                Ok(RetrieveReceipt {
                    block_index: withdrawal_id,
                })
            }
            Err(e) => {
                error!(
                    "[Withdrawal] Burned funds for withdrawal {} but failed to record it: {:?}",
                    withdrawal_id, e
                );
                self.observe(kind, "unrecorded");
                Err(e.to_string())
            }
        }
    }

    /// Records the fee burn of a withdrawal whose second burn failed, so it
    /// gets reimbursed.
    async fn fail_request(&self, withdrawal_id: LedgerIndex, caller: LedgerAccount, fee: U256) {
        let native_ledger = self.store.read().tokens.native.ledger_id;
        let reimbursement = ReimbursementRequest {
            withdrawal_id,
            ledger_id: native_ledger,
            to: caller,
            amount: fee,
            transaction_hash: None,
        };
        if let Err(e) = self
            .store
            .record(EventType::FailedWithdrawalRequest(reimbursement))
            .await
        {
            error!(
                "[Withdrawal] Failed to record reimbursement of fee burn {}: {:?}",
                withdrawal_id, e
            );
        }
    }

    pub async fn withdraw_native(
        &self,
        caller: LedgerAccount,
        amount: U256,
        recipient: Address,
    ) -> Result<RetrieveReceipt, WithdrawalError> {
        let (custody, minimum, withdrawal_fee, native_ledger) = {
            let state = self.store.read();
            (
                state.custody_contract_address,
                state.minimum_withdrawal_amount,
                state.withdrawal_fee,
                state.tokens.native.ledger_id,
            )
        };
        validate_destination(recipient, custody).map_err(WithdrawalError::InvalidDestination)?;
        let fee = withdrawal_fee.unwrap_or_default();
        if amount < minimum || amount <= fee {
            self.observe("native", "rejected");
            return Err(WithdrawalError::AmountTooLow {
                min_withdrawal_amount: minimum.max(fee.saturating_add(U256::one())),
            });
        }
        let _guard = self.guard(&caller)?;

        let withdrawal_id = self
            .burn(native_ledger, caller, amount, LedgerMemo::Burn { recipient })
            .await
            .map_err(|e| {
                warn!("[Withdrawal] Native burn failed: {}", e);
                self.observe("native", "burn_failed");
                WithdrawalError::LedgerBurn(e)
            })?;
        let request = WithdrawalRequest {
            withdrawal_id,
            kind: WithdrawalKind::Native,
            amount: amount - fee,
            max_transaction_fee: None,
            withdrawal_fee,
            destination: recipient,
            from: caller,
            created_at: now_millis(),
        };
        self.accept(request)
            .await
            .map_err(WithdrawalError::TemporarilyUnavailable)
    }

    pub async fn withdraw_token(
        &self,
        caller: LedgerAccount,
        ledger_id: Principal,
        amount: U256,
        recipient: Address,
    ) -> Result<RetrieveReceipt, WithdrawTokenError> {
        let (custody, token, native_ledger) = {
            let state = self.store.read();
            (
                state.custody_contract_address,
                state.tokens.erc20_by_ledger(&ledger_id).cloned(),
                state.tokens.native.ledger_id,
            )
        };
        validate_destination(recipient, custody).map_err(WithdrawTokenError::InvalidDestination)?;
        let token = token.ok_or(WithdrawTokenError::TokenNotSupported { ledger_id })?;
        let _guard = self.guard(&caller)?;

        let max_transaction_fee = self
            .estimate_max_transaction_fee(ERC20_WITHDRAWAL_GAS_LIMIT)
            .await
            .map_err(WithdrawTokenError::TemporarilyUnavailable)?;
        let withdrawal_id = self
            .burn(native_ledger, caller, max_transaction_fee, LedgerMemo::WithdrawalFee)
            .await
            .map_err(|e| {
                self.observe("token", "fee_burn_failed");
                WithdrawTokenError::NativeLedgerError(e)
            })?;

        let token_burn_index = match self
            .burn(ledger_id, caller, amount, LedgerMemo::Burn { recipient })
            .await
        {
            Ok(index) => index,
            Err(e) => {
                warn!(
                    "[Withdrawal] Token burn for withdrawal {} failed, reimbursing the fee: {}",
                    withdrawal_id, e
                );
                self.fail_request(withdrawal_id, caller, max_transaction_fee)
                    .await;
                self.observe("token", "token_burn_failed");
                return Err(WithdrawTokenError::TokenLedgerError(e));
            }
        };
        self.accept(WithdrawalRequest {
            withdrawal_id,
            kind: WithdrawalKind::Token {
                ledger_id,
                contract_address: token.contract_address,
                token_burn_index,
            },
            amount,
            max_transaction_fee: Some(max_transaction_fee),
            withdrawal_fee: None,
            destination: recipient,
            from: caller,
            created_at: now_millis(),
        })
        .await
        .map_err(WithdrawTokenError::TemporarilyUnavailable)
    }

    pub async fn wrap(
        &self,
        caller: LedgerAccount,
        base_ledger: Principal,
        amount: U256,
        recipient: Address,
    ) -> Result<RetrieveReceipt, WrapError> {
        let (custody, wrapped, native_ledger) = {
            let state = self.store.read();
            (
                state.custody_contract_address,
                state.tokens.wrapped_by_base(&base_ledger).cloned(),
                state.tokens.native.ledger_id,
            )
        };
        validate_destination(recipient, custody).map_err(WrapError::InvalidDestination)?;
        let wrapped = wrapped.ok_or(WrapError::UnsupportedToken { base_ledger })?;
        let _guard = self.guard(&caller)?;

        let max_transaction_fee = self
            .estimate_max_transaction_fee(WRAP_GAS_LIMIT)
            .await
            .map_err(WrapError::TemporarilyUnavailable)?;
        let withdrawal_id = self
            .burn(native_ledger, caller, max_transaction_fee, LedgerMemo::WithdrawalFee)
            .await
            .map_err(|e| {
                self.observe("wrap", "fee_burn_failed");
                WrapError::NativeLedgerError(e)
            })?;

        let lock_index = match self
            .burn(base_ledger, caller, amount, LedgerMemo::Burn { recipient })
            .await
        {
            Ok(index) => index,
            Err(e) => {
                warn!(
                    "[Withdrawal] Base token lock for wrap {} failed, reimbursing the fee: {}",
                    withdrawal_id, e
                );
                self.fail_request(withdrawal_id, caller, max_transaction_fee)
                    .await;
                self.observe("wrap", "lock_failed");
                return Err(WrapError::BaseLedgerError(e));
            }
        };
        self.accept(WithdrawalRequest {
            withdrawal_id,
            kind: WithdrawalKind::Wrap {
                base_ledger,
                wrapped_contract_address: wrapped.wrapped_contract_address,
                lock_index,
            },
            amount,
            max_transaction_fee: Some(max_transaction_fee),
            withdrawal_fee: None,
            destination: recipient,
            from: caller,
            created_at: now_millis(),
        })
        .await
        .map_err(WrapError::TemporarilyUnavailable)
    }
}
