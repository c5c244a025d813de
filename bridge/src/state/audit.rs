// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Audit events and how each one changes [`EngineState`].
//!
//! The state is never mutated except through [`apply_state_transition`], so
//! replaying the log from `Init` rebuilds exactly the state that was live
//! when the last event was written.

use super::guard::TaskType;
use super::tokens::Erc20Token;
use super::{EngineState, InitArg, InvalidEventRecord, MintedRecord, QuarantinedEventRecord};
use crate::error::{BridgeError, BridgeResult};
use crate::events::SourceEvent;
use crate::types::{BlockNumber, EventSource, LedgerIndex, Principal, WithdrawalId};
use crate::withdraw::transactions::{
    Eip1559Transaction, ReimbursementRecord, ReimbursementRequest, SignedTransaction,
    TransactionReceipt, TransactionStatus,
};
use crate::withdraw::{WithdrawalKind, WithdrawalRequest};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Milliseconds since the unix epoch
    pub timestamp: u64,
    pub payload: EventType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    Init(InitArg),
    SyncedToBlock {
        block_number: BlockNumber,
    },
    SkippedBlock {
        block_number: BlockNumber,
    },
    AcceptedEvent {
        event: SourceEvent,
    },
    InvalidEvent {
        source: EventSource,
        reason: String,
    },
    QuarantinedEvent {
        event: SourceEvent,
        reason: String,
    },
    MintedEvent {
        source: EventSource,
        ledger_id: Principal,
        token_symbol: String,
        amount: U256,
        ledger_index: LedgerIndex,
    },
    ReleasedEvent {
        source: EventSource,
        ledger_id: Principal,
        amount: U256,
        transfer_fee: U256,
        ledger_index: Option<LedgerIndex>,
    },
    AddedToken(Erc20Token),
    AcceptedWithdrawalRequest(WithdrawalRequest),
    FailedWithdrawalRequest(ReimbursementRequest),
    RescheduledWithdrawal {
        withdrawal_id: WithdrawalId,
    },
    CreatedTransaction {
        withdrawal_id: WithdrawalId,
        transaction: Eip1559Transaction,
    },
    SignedTransaction {
        withdrawal_id: WithdrawalId,
        transaction: SignedTransaction,
    },
    SentTransaction {
        withdrawal_id: WithdrawalId,
        transaction_hash: H256,
    },
    ReplacedTransaction {
        withdrawal_id: WithdrawalId,
        transaction: SignedTransaction,
    },
    FinalizedTransaction {
        withdrawal_id: WithdrawalId,
        receipt: TransactionReceipt,
    },
    ReimbursedWithdrawal(ReimbursementRecord),
    QuarantinedReimbursement {
        withdrawal_id: WithdrawalId,
        reason: String,
    },
    TaskFailed {
        task: TaskType,
        error: String,
    },
}

impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            EventType::Init(_) => "init",
            EventType::SyncedToBlock { .. } => "synced_to_block",
            EventType::SkippedBlock { .. } => "skipped_block",
            EventType::AcceptedEvent { .. } => "accepted_event",
            EventType::InvalidEvent { .. } => "invalid_event",
            EventType::QuarantinedEvent { .. } => "quarantined_event",
            EventType::MintedEvent { .. } => "minted_event",
            EventType::ReleasedEvent { .. } => "released_event",
            EventType::AddedToken(_) => "added_token",
            EventType::AcceptedWithdrawalRequest(_) => "accepted_withdrawal_request",
            EventType::FailedWithdrawalRequest(_) => "failed_withdrawal_request",
            EventType::RescheduledWithdrawal { .. } => "rescheduled_withdrawal",
            EventType::CreatedTransaction { .. } => "created_transaction",
            EventType::SignedTransaction { .. } => "signed_transaction",
            EventType::SentTransaction { .. } => "sent_transaction",
            EventType::ReplacedTransaction { .. } => "replaced_transaction",
            EventType::FinalizedTransaction { .. } => "finalized_transaction",
            EventType::ReimbursedWithdrawal(_) => "reimbursed_withdrawal",
            EventType::QuarantinedReimbursement { .. } => "quarantined_reimbursement",
            EventType::TaskFailed { .. } => "task_failed",
        }
    }
}

fn invalid_transition(event: &EventType, reason: impl std::fmt::Display) -> BridgeError {
    BridgeError::InvalidStateTransition(format!("{}: {}", event.name(), reason))
}

/// Applies one audit event to `state`, or leaves it untouched and errors.
pub fn apply_state_transition(state: &mut EngineState, event: &EventType) -> BridgeResult<()> {
    let fail = |reason: String| invalid_transition(event, reason);
    match event {
        EventType::Init(_) => return Err(fail("state is already initialized".to_string())),
        EventType::SyncedToBlock { block_number } => {
            if *block_number < state.last_scraped_block {
                return Err(fail(format!(
                    "cursor would move back from {} to {block_number}",
                    state.last_scraped_block
                )));
            }
            state.last_scraped_block = *block_number;
        }
        EventType::SkippedBlock { block_number } => {
            state.skipped_blocks.insert(*block_number);
        }
        EventType::AcceptedEvent { event: accepted } => {
            let source = accepted.source();
            match state.event_status(&source) {
                None | Some(super::DepositStatus::Quarantined) => {}
                Some(status) => return Err(fail(format!("{source} is already {status:?}"))),
            }
            match accepted {
                SourceEvent::WrappedDeployed(deployed) => {
                    state
                        .tokens
                        .add_wrapped(deployed.base_ledger, deployed.wrapped_contract_address)
                        .map_err(|e| fail(e.to_string()))?;
                    state.registered.insert(source, deployed.clone());
                }
                SourceEvent::NativeDeposit(deposit) => {
                    let balance = state.balances.asset_mut(Address::zero());
                    balance.deposited = balance.deposited.saturating_add(deposit.value);
                    state.pending.insert(source, accepted.clone());
                }
                SourceEvent::TokenDeposit(deposit) => {
                    let balance = state.balances.asset_mut(deposit.token_contract_address);
                    balance.deposited = balance.deposited.saturating_add(deposit.value);
                    state.pending.insert(source, accepted.clone());
                }
                SourceEvent::WrappedBurn(_) => {
                    state.pending.insert(source, accepted.clone());
                }
            }
            state.quarantined.remove(&source);
        }
        EventType::InvalidEvent { source, reason } => {
            match state.event_status(source) {
                None
                | Some(super::DepositStatus::Accepted)
                | Some(super::DepositStatus::Quarantined) => {}
                Some(status) => return Err(fail(format!("{source} is already {status:?}"))),
            }
            state.pending.remove(source);
            state.quarantined.remove(source);
            state.invalid.insert(
                *source,
                InvalidEventRecord {
                    reason: reason.clone(),
                },
            );
        }
        EventType::QuarantinedEvent { event: quarantined, reason } => {
            let source = quarantined.source();
            if state.is_known(&source) {
                return Err(fail(format!("{source} is already known")));
            }
            state.quarantined.insert(
                source,
                QuarantinedEventRecord {
                    event: quarantined.clone(),
                    reason: reason.clone(),
                },
            );
        }
        EventType::MintedEvent {
            source,
            ledger_id,
            token_symbol,
            amount,
            ledger_index,
        } => {
            let pending = state
                .pending
                .get(source)
                .filter(|e| !e.is_release())
                .ok_or_else(|| fail(format!("{source} is not a pending deposit")))?;
            let contract_address = match pending {
                SourceEvent::TokenDeposit(deposit) => deposit.token_contract_address,
                _ => Address::zero(),
            };
            let event = pending.clone();
            state.pending.remove(source);
            let balance = state.balances.asset_mut(contract_address);
            balance.minted = balance.minted.saturating_add(*amount);
            state.minted.insert(
                *source,
                MintedRecord {
                    event,
                    ledger_id: *ledger_id,
                    token_symbol: token_symbol.clone(),
                    contract_address,
                    amount: *amount,
                    ledger_index: Some(*ledger_index),
                },
            );
        }
        EventType::ReleasedEvent {
            source,
            ledger_id,
            amount,
            transfer_fee,
            ledger_index,
        } => {
            let burn = match state.pending.get(source) {
                Some(SourceEvent::WrappedBurn(burn)) => burn.clone(),
                _ => return Err(fail(format!("{source} is not a pending burn"))),
            };
            if burn.base_ledger != *ledger_id {
                return Err(fail(format!(
                    "{source} burns a twin of {}, not {ledger_id}",
                    burn.base_ledger
                )));
            }
            state.pending.remove(source);
            state
                .tokens
                .set_wrapped_transfer_fee(&burn.wrapped_contract_address, *transfer_fee);
            state.balances.unlock(burn.base_ledger, burn.value);
            state.minted.insert(
                *source,
                MintedRecord {
                    contract_address: burn.wrapped_contract_address,
                    token_symbol: state
                        .tokens
                        .symbol_of(&burn.wrapped_contract_address)
                        .unwrap_or_default(),
                    event: SourceEvent::WrappedBurn(burn),
                    ledger_id: *ledger_id,
                    amount: *amount,
                    ledger_index: *ledger_index,
                },
            );
        }
        EventType::AddedToken(token) => {
            state
                .tokens
                .add_erc20(token.clone())
                .map_err(|e| fail(e.to_string()))?;
        }
        EventType::AcceptedWithdrawalRequest(request) => {
            state
                .withdrawals
                .record_request(request.clone())
                .map_err(fail)?;
            if let WithdrawalKind::Wrap { base_ledger, .. } = &request.kind {
                state.balances.lock(*base_ledger, request.amount);
            }
        }
        EventType::FailedWithdrawalRequest(reimbursement) => {
            state
                .withdrawals
                .record_failed_request(reimbursement.clone())
                .map_err(fail)?;
        }
        EventType::RescheduledWithdrawal { withdrawal_id } => {
            state.withdrawals.reschedule(*withdrawal_id).map_err(fail)?;
        }
        EventType::CreatedTransaction {
            withdrawal_id,
            transaction,
        } => {
            state
                .withdrawals
                .record_created(*withdrawal_id, transaction.clone())
                .map_err(fail)?;
        }
        EventType::SignedTransaction {
            withdrawal_id,
            transaction,
        } => {
            state
                .withdrawals
                .record_signed(*withdrawal_id, transaction.clone())
                .map_err(fail)?;
        }
        EventType::SentTransaction {
            withdrawal_id,
            transaction_hash,
        } => {
            state
                .withdrawals
                .record_sent(*withdrawal_id, *transaction_hash)
                .map_err(fail)?;
        }
        EventType::ReplacedTransaction {
            withdrawal_id,
            transaction,
        } => {
            state
                .withdrawals
                .record_replaced(*withdrawal_id, transaction.clone())
                .map_err(fail)?;
        }
        EventType::FinalizedTransaction {
            withdrawal_id,
            receipt,
        } => {
            let native_ledger = state.tokens.native.ledger_id;
            state
                .withdrawals
                .record_finalized(*withdrawal_id, receipt.clone(), native_ledger)
                .map_err(fail)?;
            let fee = receipt.effective_transaction_fee();
            let native = state.balances.asset_mut(Address::zero());
            native.fees_paid = native.fees_paid.saturating_add(fee);
            if receipt.status == TransactionStatus::Success {
                if let Some(entry) = state.withdrawals.get(*withdrawal_id) {
                    let request = entry.request.clone();
                    let paid_out = entry
                        .attempts
                        .iter()
                        .find(|tx| tx.hash == receipt.transaction_hash)
                        .map(|tx| tx.transaction.amount)
                        .unwrap_or_default();
                    match request.kind {
                        WithdrawalKind::Native => {
                            let native = state.balances.asset_mut(Address::zero());
                            native.withdrawn = native.withdrawn.saturating_add(paid_out);
                        }
                        WithdrawalKind::Token {
                            contract_address, ..
                        } => {
                            let token = state.balances.asset_mut(contract_address);
                            token.withdrawn = token.withdrawn.saturating_add(request.amount);
                        }
                        WithdrawalKind::Wrap { .. } => {}
                    }
                }
            }
        }
        EventType::ReimbursedWithdrawal(record) => {
            state
                .withdrawals
                .record_reimbursed(record.clone())
                .map_err(fail)?;
            if let Some(request) = state
                .withdrawals
                .get(record.withdrawal_id)
                .map(|entry| entry.request.clone())
            {
                match request.kind {
                    WithdrawalKind::Native => {
                        let native = state.balances.asset_mut(Address::zero());
                        native.reimbursed = native.reimbursed.saturating_add(record.amount);
                    }
                    WithdrawalKind::Token {
                        contract_address, ..
                    } => {
                        let token = state.balances.asset_mut(contract_address);
                        token.reimbursed = token.reimbursed.saturating_add(record.amount);
                    }
                    WithdrawalKind::Wrap { base_ledger, .. } => {
                        state.balances.unlock(base_ledger, record.amount);
                    }
                }
            } else {
                let native = state.balances.asset_mut(Address::zero());
                native.reimbursed = native.reimbursed.saturating_add(record.amount);
            }
        }
        EventType::QuarantinedReimbursement {
            withdrawal_id,
            reason,
        } => {
            state
                .withdrawals
                .record_quarantined_reimbursement(*withdrawal_id, reason.clone())
                .map_err(fail)?;
        }
        EventType::TaskFailed { task, error } => {
            state.last_task_errors.insert(*task, error.clone());
        }
    }
    Ok(())
}

/// Rebuilds the state from a complete audit log.
pub fn replay<'a, I>(events: I) -> BridgeResult<EngineState>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut events = events.into_iter();
    let mut state = match events.next().map(|e| &e.payload) {
        Some(EventType::Init(init)) => EngineState::from_init(init)
            .map_err(|e| BridgeError::InvalidReplay(format!("invalid init event: {e}")))?,
        Some(other) => {
            return Err(BridgeError::InvalidReplay(format!(
                "the first event must be init, got {}",
                other.name()
            )))
        }
        None => return Err(BridgeError::InvalidReplay("the audit log is empty".to_string())),
    };
    for (index, event) in events.enumerate() {
        apply_state_transition(&mut state, &event.payload).map_err(|e| {
            BridgeError::InvalidReplay(format!("event {}: {}", index + 1, e))
        })?;
    }
    Ok(state)
}
