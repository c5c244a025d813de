// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-withdrawal transaction state.
//!
//! Every mutation here is driven by exactly one audit event and rejects any
//! transition that would move a withdrawal backward, reuse a nonce for a
//! different withdrawal, or finalize a withdrawal twice.

use super::{
    TxFinalizedStatus, WithdrawalDetail, WithdrawalKind, WithdrawalPhase, WithdrawalRequest,
    WithdrawalSearch, WithdrawalStatus,
};
use crate::fees::TransactionPrice;
use crate::types::{BlockNumber, LedgerAccount, LedgerIndex, Principal, WithdrawalId};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eip1559Transaction {
    pub chain_id: u64,
    pub from: Address,
    pub nonce: u64,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    pub gas_limit: U256,
    pub destination: Address,
    pub amount: U256,
    pub data: Bytes,
}

impl Eip1559Transaction {
    pub fn max_transaction_fee(&self) -> U256 {
        self.price().max_transaction_fee()
    }

    pub fn price(&self) -> TransactionPrice {
        TransactionPrice {
            gas_limit: self.gas_limit,
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
        }
    }

    pub fn to_typed(&self) -> TypedTransaction {
        Eip1559TransactionRequest::new()
            .from(self.from)
            .to(self.destination)
            .value(self.amount)
            .data(self.data.clone())
            .nonce(self.nonce)
            .gas(self.gas_limit)
            .max_fee_per_gas(self.max_fee_per_gas)
            .max_priority_fee_per_gas(self.max_priority_fee_per_gas)
            .chain_id(self.chain_id)
            .into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub transaction: Eip1559Transaction,
    pub hash: H256,
    /// RLP-encoded signed transaction, ready for `eth_sendRawTransaction`
    pub raw: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub block_hash: H256,
    pub block_number: BlockNumber,
    pub effective_gas_price: U256,
    pub gas_used: U256,
    pub status: TransactionStatus,
    pub transaction_hash: H256,
}

impl TransactionReceipt {
    pub fn effective_transaction_fee(&self) -> U256 {
        self.effective_gas_price.saturating_mul(self.gas_used)
    }
}

/// Value owed back to a user whose withdrawal could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReimbursementRequest {
    pub withdrawal_id: WithdrawalId,
    pub ledger_id: Principal,
    pub to: LedgerAccount,
    pub amount: U256,
    pub transaction_hash: Option<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReimbursementRecord {
    pub withdrawal_id: WithdrawalId,
    pub ledger_id: Principal,
    pub amount: U256,
    /// Ledger block of the reimbursing transfer; `None` when nothing was left to return
    pub ledger_index: Option<LedgerIndex>,
    pub transaction_hash: Option<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalEntry {
    pub request: WithdrawalRequest,
    pub phase: WithdrawalPhase,
    /// Authoritative unsigned transaction
    pub created: Option<Eip1559Transaction>,
    /// Every signed attempt; the last one is authoritative
    pub attempts: Vec<SignedTransaction>,
    /// Whether the authoritative attempt has been accepted by a node
    pub latest_broadcast: bool,
    pub receipt: Option<TransactionReceipt>,
    pub reimbursement: Option<ReimbursementRecord>,
}

impl WithdrawalEntry {
    fn new(request: WithdrawalRequest) -> Self {
        Self {
            request,
            phase: WithdrawalPhase::Pending,
            created: None,
            attempts: Vec::new(),
            latest_broadcast: false,
            receipt: None,
            reimbursement: None,
        }
    }

    pub fn latest_signed(&self) -> Option<&SignedTransaction> {
        self.attempts.last()
    }

    /// Number of same-nonce replacements signed so far.
    pub fn replacements(&self) -> u32 {
        self.attempts.len().saturating_sub(1) as u32
    }

    pub fn nonce(&self) -> Option<u64> {
        self.created.as_ref().map(|tx| tx.nonce)
    }

    pub fn needs_broadcast(&self) -> bool {
        matches!(self.phase, WithdrawalPhase::Signed | WithdrawalPhase::Sent)
            && !self.attempts.is_empty()
            && !self.latest_broadcast
    }

    pub fn is_awaiting_receipt(&self) -> bool {
        matches!(self.phase, WithdrawalPhase::Signed | WithdrawalPhase::Sent)
            && !self.attempts.is_empty()
    }

    fn advance(&mut self, next: WithdrawalPhase) -> Result<(), String> {
        if !self.phase.can_advance_to(next) {
            return Err(format!(
                "withdrawal {} cannot move from {} to {}",
                self.request.withdrawal_id,
                self.phase.as_str(),
                next.as_str()
            ));
        }
        self.phase = next;
        Ok(())
    }

    pub fn status(&self) -> WithdrawalStatus {
        let latest_hash = self.latest_signed().map(|tx| tx.hash).unwrap_or_default();
        let finalized_hash = self
            .receipt
            .as_ref()
            .map(|r| r.transaction_hash)
            .unwrap_or_default();
        match self.phase {
            WithdrawalPhase::Pending => WithdrawalStatus::Pending,
            WithdrawalPhase::Created => WithdrawalStatus::TxCreated,
            WithdrawalPhase::Signed => WithdrawalStatus::TxSigned {
                transaction_hash: latest_hash,
            },
            WithdrawalPhase::Sent => WithdrawalStatus::TxSent {
                transaction_hash: latest_hash,
            },
            WithdrawalPhase::Finalized => WithdrawalStatus::TxFinalized(TxFinalizedStatus::Success {
                transaction_hash: finalized_hash,
                effective_transaction_fee: self
                    .receipt
                    .as_ref()
                    .map(TransactionReceipt::effective_transaction_fee)
                    .unwrap_or_default(),
            }),
            WithdrawalPhase::PendingReimbursement => {
                WithdrawalStatus::TxFinalized(TxFinalizedStatus::PendingReimbursement {
                    transaction_hash: finalized_hash,
                })
            }
            WithdrawalPhase::Reimbursed => {
                let (amount, index) = self
                    .reimbursement
                    .as_ref()
                    .map(|r| (r.amount, r.ledger_index.unwrap_or_default()))
                    .unwrap_or_default();
                WithdrawalStatus::TxFinalized(TxFinalizedStatus::Reimbursed {
                    transaction_hash: finalized_hash,
                    reimbursed_amount: amount,
                    reimbursed_in_block: index,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalTransactions {
    queue: VecDeque<WithdrawalId>,
    entries: BTreeMap<WithdrawalId, WithdrawalEntry>,
    next_nonce: BTreeMap<Address, u64>,
    // Next nonce of a sender that has not created a transaction yet.
    #[serde(default)]
    initial_nonce: u64,
    pending_reimbursements: BTreeMap<WithdrawalId, ReimbursementRequest>,
    reimbursed: BTreeMap<WithdrawalId, ReimbursementRecord>,
    quarantined_reimbursements: BTreeMap<WithdrawalId, String>,
    failed_requests: BTreeSet<WithdrawalId>,
}

impl WithdrawalTransactions {
    pub fn starting_at_nonce(initial_nonce: u64) -> Self {
        Self {
            initial_nonce,
            ..Self::default()
        }
    }

    fn is_known(&self, id: WithdrawalId) -> bool {
        self.entries.contains_key(&id) || self.failed_requests.contains(&id)
    }

    fn entry_mut(&mut self, id: WithdrawalId) -> Result<&mut WithdrawalEntry, String> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| format!("unknown withdrawal {id}"))
    }

    pub fn get(&self, id: WithdrawalId) -> Option<&WithdrawalEntry> {
        self.entries.get(&id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &WithdrawalEntry> {
        self.entries.values()
    }

    pub fn next_nonce(&self, sender: &Address) -> u64 {
        self.next_nonce
            .get(sender)
            .copied()
            .unwrap_or(self.initial_nonce)
    }

    pub fn record_request(&mut self, request: WithdrawalRequest) -> Result<(), String> {
        let id = request.withdrawal_id;
        if self.is_known(id) {
            return Err(format!("withdrawal {id} already exists"));
        }
        self.queue.push_back(id);
        self.entries.insert(id, WithdrawalEntry::new(request));
        Ok(())
    }

    /// A request whose token burn failed after its fee burn succeeded.
    pub fn record_failed_request(&mut self, reimbursement: ReimbursementRequest) -> Result<(), String> {
        let id = reimbursement.withdrawal_id;
        if self.is_known(id) {
            return Err(format!("withdrawal {id} already exists"));
        }
        self.failed_requests.insert(id);
        self.pending_reimbursements.insert(id, reimbursement);
        Ok(())
    }

    pub fn reschedule(&mut self, id: WithdrawalId) -> Result<(), String> {
        let position = self
            .queue
            .iter()
            .position(|queued| *queued == id)
            .ok_or_else(|| format!("withdrawal {id} is not queued"))?;
        self.queue.remove(position);
        self.queue.push_back(id);
        Ok(())
    }

    pub fn record_created(&mut self, id: WithdrawalId, tx: Eip1559Transaction) -> Result<(), String> {
        // The account may have sent transactions we never created, so the
        // nonce can skip ahead but never go back.
        let expected = self.next_nonce(&tx.from);
        if tx.nonce < expected {
            return Err(format!(
                "withdrawal {id}: nonce {} for {:#x}, expected at least {expected}",
                tx.nonce, tx.from
            ));
        }
        let nonce = tx.nonce;
        let entry = self.entry_mut(id)?;
        entry.advance(WithdrawalPhase::Created)?;
        let sender = tx.from;
        entry.created = Some(tx);
        self.queue.retain(|queued| *queued != id);
        self.next_nonce.insert(sender, nonce + 1);
        Ok(())
    }

    pub fn record_signed(&mut self, id: WithdrawalId, signed: SignedTransaction) -> Result<(), String> {
        let entry = self.entry_mut(id)?;
        if entry.created.as_ref() != Some(&signed.transaction) {
            return Err(format!(
                "withdrawal {id}: signed transaction does not match the created one"
            ));
        }
        entry.advance(WithdrawalPhase::Signed)?;
        entry.attempts.push(signed);
        entry.latest_broadcast = false;
        Ok(())
    }

    pub fn record_replaced(&mut self, id: WithdrawalId, signed: SignedTransaction) -> Result<(), String> {
        let entry = self.entry_mut(id)?;
        if !entry.is_awaiting_receipt() {
            return Err(format!(
                "withdrawal {id} in phase {} cannot be replaced",
                entry.phase.as_str()
            ));
        }
        let previous = entry
            .latest_signed()
            .map(|tx| &tx.transaction)
            .ok_or_else(|| format!("withdrawal {id} has no signed transaction"))?;
        let next = &signed.transaction;
        if next.nonce != previous.nonce || next.from != previous.from {
            return Err(format!("withdrawal {id}: replacement must reuse nonce {}", previous.nonce));
        }
        if next.max_fee_per_gas <= previous.max_fee_per_gas
            || next.max_priority_fee_per_gas < previous.max_priority_fee_per_gas
        {
            return Err(format!("withdrawal {id}: replacement must increase the fee"));
        }
        entry.created = Some(signed.transaction.clone());
        entry.attempts.push(signed);
        entry.latest_broadcast = false;
        Ok(())
    }

    pub fn record_sent(&mut self, id: WithdrawalId, hash: H256) -> Result<(), String> {
        let entry = self.entry_mut(id)?;
        if entry.latest_signed().map(|tx| tx.hash) != Some(hash) {
            return Err(format!(
                "withdrawal {id}: {hash:#x} is not the authoritative transaction"
            ));
        }
        if entry.phase == WithdrawalPhase::Signed {
            entry.advance(WithdrawalPhase::Sent)?;
        } else if entry.phase != WithdrawalPhase::Sent {
            return Err(format!(
                "withdrawal {id} in phase {} cannot be sent",
                entry.phase.as_str()
            ));
        }
        entry.latest_broadcast = true;
        Ok(())
    }

    /// Records the one receipt of a withdrawal; a failure receipt schedules a
    /// reimbursement on `native_ledger` for native withdrawals.
    pub fn record_finalized(
        &mut self,
        id: WithdrawalId,
        receipt: TransactionReceipt,
        native_ledger: Principal,
    ) -> Result<(), String> {
        let entry = self.entry_mut(id)?;
        if !entry
            .attempts
            .iter()
            .any(|tx| tx.hash == receipt.transaction_hash)
        {
            return Err(format!(
                "withdrawal {id}: receipt for unknown transaction {:#x}",
                receipt.transaction_hash
            ));
        }
        let next = match receipt.status {
            TransactionStatus::Success => WithdrawalPhase::Finalized,
            TransactionStatus::Failure => WithdrawalPhase::PendingReimbursement,
        };
        entry.advance(next)?;
        let reimbursement = (receipt.status == TransactionStatus::Failure).then(|| {
            let (ledger_id, amount) = match &entry.request.kind {
                WithdrawalKind::Native => (
                    native_ledger,
                    entry
                        .request
                        .amount
                        .saturating_sub(receipt.effective_transaction_fee()),
                ),
                WithdrawalKind::Token { ledger_id, .. } => (*ledger_id, entry.request.amount),
                WithdrawalKind::Wrap { base_ledger, .. } => (*base_ledger, entry.request.amount),
            };
            ReimbursementRequest {
                withdrawal_id: id,
                ledger_id,
                to: entry.request.from,
                amount,
                transaction_hash: Some(receipt.transaction_hash),
            }
        });
        entry.receipt = Some(receipt);
        if let Some(request) = reimbursement {
            self.pending_reimbursements.insert(id, request);
        }
        Ok(())
    }

    pub fn record_reimbursed(&mut self, record: ReimbursementRecord) -> Result<(), String> {
        let id = record.withdrawal_id;
        if self.reimbursed.contains_key(&id) {
            return Err(format!("withdrawal {id} was already reimbursed"));
        }
        if self.pending_reimbursements.remove(&id).is_none() {
            return Err(format!("withdrawal {id} has no pending reimbursement"));
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.advance(WithdrawalPhase::Reimbursed)?;
            entry.reimbursement = Some(record.clone());
        }
        self.reimbursed.insert(id, record);
        Ok(())
    }

    pub fn record_quarantined_reimbursement(
        &mut self,
        id: WithdrawalId,
        reason: String,
    ) -> Result<(), String> {
        if self.pending_reimbursements.remove(&id).is_none() {
            return Err(format!("withdrawal {id} has no pending reimbursement"));
        }
        self.quarantined_reimbursements.insert(id, reason);
        Ok(())
    }

    /// Oldest queued requests first.
    pub fn queued_requests(&self, limit: usize) -> Vec<WithdrawalRequest> {
        self.queue
            .iter()
            .filter_map(|id| self.entries.get(id))
            .take(limit)
            .map(|entry| entry.request.clone())
            .collect()
    }

    pub fn created_transactions(&self) -> Vec<(WithdrawalId, Eip1559Transaction)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.phase == WithdrawalPhase::Created)
            .filter_map(|(id, entry)| entry.created.clone().map(|tx| (*id, tx)))
            .collect()
    }

    pub fn transactions_to_broadcast(&self) -> Vec<(WithdrawalId, SignedTransaction)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.needs_broadcast())
            .filter_map(|(id, entry)| entry.latest_signed().cloned().map(|tx| (*id, tx)))
            .collect()
    }

    pub fn awaiting_receipt(&self) -> Vec<&WithdrawalEntry> {
        self.entries
            .values()
            .filter(|entry| entry.is_awaiting_receipt())
            .collect()
    }

    pub fn reimbursement_requests(&self) -> Vec<ReimbursementRequest> {
        self.pending_reimbursements.values().cloned().collect()
    }

    pub fn reimbursed(&self) -> impl Iterator<Item = &ReimbursementRecord> {
        self.reimbursed.values()
    }

    pub fn quarantined_reimbursements(&self) -> &BTreeMap<WithdrawalId, String> {
        &self.quarantined_reimbursements
    }

    /// Requests that still hold a slot: queued or with a transaction in flight.
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| {
                !entry.phase.is_terminal() && entry.phase != WithdrawalPhase::PendingReimbursement
            })
            .count()
    }

    pub fn phase_counts(&self) -> BTreeMap<WithdrawalPhase, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.phase).or_insert(0) += 1;
        }
        counts
    }

    pub fn status(&self, id: WithdrawalId) -> WithdrawalStatus {
        if let Some(entry) = self.entries.get(&id) {
            return entry.status();
        }
        if self.failed_requests.contains(&id) {
            return WithdrawalStatus::RequestFailed {
                reimbursement: self.reimbursed.get(&id).cloned(),
            };
        }
        WithdrawalStatus::NotFound
    }

    pub fn search<'a>(&'a self, search: &WithdrawalSearch) -> Vec<&'a WithdrawalEntry> {
        self.entries
            .values()
            .filter(|entry| match search {
                WithdrawalSearch::ById(id) => entry.request.withdrawal_id == *id,
                WithdrawalSearch::ByRecipient(address) => entry.request.destination == *address,
                WithdrawalSearch::BySender(principal) => entry.request.from.owner == *principal,
            })
            .collect()
    }

    pub fn detail(&self, entry: &WithdrawalEntry, token_symbol: String) -> WithdrawalDetail {
        WithdrawalDetail {
            withdrawal_id: entry.request.withdrawal_id,
            kind: entry.request.kind.label().to_string(),
            recipient_address: entry.request.destination,
            from: entry.request.from,
            token_symbol,
            amount: entry.request.amount,
            max_transaction_fee: entry.request.max_transaction_fee,
            status: self.status(entry.request.withdrawal_id),
        }
    }
}
