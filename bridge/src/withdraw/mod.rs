// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Outbound withdrawals: intake, transaction state and the four-phase pipeline.

pub mod client;
pub mod intake;
pub mod pipeline;
pub mod signer;
pub mod transactions;

use crate::types::{LedgerAccount, LedgerIndex, Principal, WithdrawalId};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use transactions::ReimbursementRecord;

pub const NATIVE_WITHDRAWAL_GAS_LIMIT: u64 = 21_000;
pub const ERC20_WITHDRAWAL_GAS_LIMIT: u64 = 66_000;
pub const WRAP_GAS_LIMIT: u64 = 100_000;
/// Requests turned into transactions per pipeline pass.
pub const WITHDRAWAL_BATCH_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WithdrawalKind {
    Native,
    Token {
        ledger_id: Principal,
        contract_address: Address,
        /// Burn of the withdrawn tokens on their ledger
        token_burn_index: LedgerIndex,
    },
    Wrap {
        base_ledger: Principal,
        wrapped_contract_address: Address,
        /// Transfer of the base tokens into the reserve
        lock_index: LedgerIndex,
    },
}

impl WithdrawalKind {
    pub fn label(&self) -> &'static str {
        match self {
            WithdrawalKind::Native => "native",
            WithdrawalKind::Token { .. } => "token",
            WithdrawalKind::Wrap { .. } => "wrap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Index of the native ledger burn that funds the transaction fee.
    pub withdrawal_id: WithdrawalId,
    pub kind: WithdrawalKind,
    /// Native: value burned net of the withdrawal fee, transaction fee included.
    /// Token and wrap: the token amount.
    pub amount: U256,
    /// Fee prepaid in native token by token and wrap withdrawals
    pub max_transaction_fee: Option<U256>,
    pub withdrawal_fee: Option<U256>,
    pub destination: Address,
    pub from: LedgerAccount,
    pub created_at: u64,
}

impl WithdrawalRequest {
    pub fn gas_limit(&self) -> U256 {
        U256::from(match self.kind {
            WithdrawalKind::Native => NATIVE_WITHDRAWAL_GAS_LIMIT,
            WithdrawalKind::Token { .. } => ERC20_WITHDRAWAL_GAS_LIMIT,
            WithdrawalKind::Wrap { .. } => WRAP_GAS_LIMIT,
        })
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, WithdrawalKind::Native)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalPhase {
    /// Accepted, waiting for a transaction
    Pending,
    Created,
    Signed,
    Sent,
    /// Mined with a failure receipt, value not yet returned
    PendingReimbursement,
    Finalized,
    Reimbursed,
}

impl WithdrawalPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawalPhase::Finalized | WithdrawalPhase::Reimbursed)
    }

    pub fn can_advance_to(&self, next: WithdrawalPhase) -> bool {
        use WithdrawalPhase::*;
        matches!(
            (self, next),
            (Pending, Created)
                | (Created, Signed)
                | (Signed, Sent)
                | (Signed | Sent, Finalized)
                | (Signed | Sent, PendingReimbursement)
                | (PendingReimbursement, Reimbursed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalPhase::Pending => "pending",
            WithdrawalPhase::Created => "created",
            WithdrawalPhase::Signed => "signed",
            WithdrawalPhase::Sent => "sent",
            WithdrawalPhase::PendingReimbursement => "pending_reimbursement",
            WithdrawalPhase::Finalized => "finalized",
            WithdrawalPhase::Reimbursed => "reimbursed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxFinalizedStatus {
    Success {
        transaction_hash: H256,
        effective_transaction_fee: U256,
    },
    PendingReimbursement {
        transaction_hash: H256,
    },
    Reimbursed {
        transaction_hash: H256,
        reimbursed_amount: U256,
        reimbursed_in_block: LedgerIndex,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    NotFound,
    Pending,
    TxCreated,
    TxSigned { transaction_hash: H256 },
    TxSent { transaction_hash: H256 },
    TxFinalized(TxFinalizedStatus),
    /// The token burn failed after the transaction fee was burned.
    RequestFailed {
        reimbursement: Option<ReimbursementRecord>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalDetail {
    pub withdrawal_id: WithdrawalId,
    pub kind: String,
    pub recipient_address: Address,
    pub from: LedgerAccount,
    pub token_symbol: String,
    pub amount: U256,
    pub max_transaction_fee: Option<U256>,
    pub status: WithdrawalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalSearch {
    ById(WithdrawalId),
    ByRecipient(Address),
    BySender(Principal),
}

#[cfg(test)]
mod tests {
    use super::*;
    use WithdrawalPhase::*;

    #[test]
    fn test_phase_only_moves_forward() {
        assert!(Pending.can_advance_to(Created));
        assert!(Created.can_advance_to(Signed));
        assert!(Signed.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Finalized));
        assert!(Sent.can_advance_to(PendingReimbursement));
        assert!(PendingReimbursement.can_advance_to(Reimbursed));

        assert!(!Sent.can_advance_to(Created));
        assert!(!Signed.can_advance_to(Created));
        assert!(!Finalized.can_advance_to(Reimbursed));
        assert!(!Reimbursed.can_advance_to(Finalized));
        assert!(!PendingReimbursement.can_advance_to(Finalized));
        assert!(!Created.can_advance_to(Sent));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Finalized.is_terminal());
        assert!(Reimbursed.is_terminal());
        assert!(!PendingReimbursement.is_terminal());
        assert!(!Sent.is_terminal());
    }

    #[test]
    fn test_gas_limits() {
        let request = |kind| WithdrawalRequest {
            withdrawal_id: 1,
            kind,
            amount: U256::one(),
            max_transaction_fee: None,
            withdrawal_fee: None,
            destination: Address::repeat_byte(1),
            from: Principal::try_from_slice(&[1]).unwrap().into(),
            created_at: 0,
        };
        assert_eq!(request(WithdrawalKind::Native).gas_limit(), U256::from(21_000));
        assert_eq!(
            request(WithdrawalKind::Token {
                ledger_id: Principal::try_from_slice(&[2]).unwrap(),
                contract_address: Address::repeat_byte(2),
                token_burn_index: 3,
            })
            .gas_limit(),
            U256::from(66_000)
        );
        assert_eq!(
            request(WithdrawalKind::Wrap {
                base_ledger: Principal::try_from_slice(&[2]).unwrap(),
                wrapped_contract_address: Address::repeat_byte(2),
                lock_index: 3,
            })
            .gas_limit(),
            U256::from(100_000)
        );
    }
}
