// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Engine state: every index the engine acts on, derived from the audit log.

pub mod audit;
pub mod guard;
pub mod store;
pub mod tokens;

use crate::error::{BridgeError, BridgeResult};
use crate::events::classifier::{classify, Classification};
use crate::events::{SourceEvent, WrappedDeployed};
use crate::types::{BlockNumber, EventSource, LedgerIndex, Principal};
use crate::withdraw::transactions::WithdrawalTransactions;
use audit::EventType;
use ethers::types::{Address, H256, U256};
use guard::TaskType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use store::Transition;
use tokens::{Erc20Token, NativeToken, TokenRegistry};

/// Parameters recorded by the first audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitArg {
    pub chain_id: u64,
    pub custody_contract_address: Address,
    /// Scraping starts after this block
    pub last_scraped_block: BlockNumber,
    pub native: NativeToken,
    pub minimum_withdrawal_amount: U256,
    pub withdrawal_fee: Option<U256>,
    pub erc20_tokens: Vec<Erc20Token>,
    /// Nonce of the withdrawal account's first transaction
    #[serde(default)]
    pub next_transaction_nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintedRecord {
    pub event: SourceEvent,
    pub ledger_id: Principal,
    pub token_symbol: String,
    pub contract_address: Address,
    pub amount: U256,
    /// `None` when the net amount was zero and no transfer was made
    pub ledger_index: Option<LedgerIndex>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidEventRecord {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedEventRecord {
    pub event: SourceEvent,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Accepted,
    Minted,
    Released,
    Registered,
    Invalid,
    Quarantined,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    /// Total value received by the custody contract
    pub deposited: U256,
    /// Total credited on the destination ledger
    pub minted: U256,
    /// Total paid out by finalized withdrawals
    pub withdrawn: U256,
    /// Transaction fees paid out of custody
    pub fees_paid: U256,
    /// Total returned to users on the destination ledger
    pub reimbursed: U256,
}

impl AssetBalance {
    /// What the custody contract should currently hold of this asset.
    pub fn custody(&self) -> U256 {
        self.deposited
            .saturating_sub(self.withdrawn)
            .saturating_sub(self.fees_paid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    /// Keyed by contract address; the zero address is the native asset.
    pub assets: BTreeMap<Address, AssetBalance>,
    /// Base-ledger tokens held in reserve against wrapped tokens.
    pub locked: BTreeMap<Principal, U256>,
}

impl Balances {
    pub fn native(&self) -> AssetBalance {
        self.asset(&Address::zero())
    }

    pub fn asset(&self, contract: &Address) -> AssetBalance {
        self.assets.get(contract).cloned().unwrap_or_default()
    }

    pub(crate) fn asset_mut(&mut self, contract: Address) -> &mut AssetBalance {
        self.assets.entry(contract).or_default()
    }

    pub(crate) fn lock(&mut self, ledger: Principal, amount: U256) {
        let locked = self.locked.entry(ledger).or_default();
        *locked = locked.saturating_add(amount);
    }

    pub(crate) fn unlock(&mut self, ledger: Principal, amount: U256) {
        let locked = self.locked.entry(ledger).or_default();
        *locked = locked.saturating_sub(amount);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineState {
    pub chain_id: u64,
    pub custody_contract_address: Address,
    pub minimum_withdrawal_amount: U256,
    pub withdrawal_fee: Option<U256>,
    pub first_scraped_block: BlockNumber,
    pub last_scraped_block: BlockNumber,
    pub tokens: TokenRegistry,
    /// Accepted deposits and burns waiting to be minted or released
    pub pending: BTreeMap<EventSource, SourceEvent>,
    pub minted: BTreeMap<EventSource, MintedRecord>,
    /// Accepted wrapped-token deployments
    pub registered: BTreeMap<EventSource, WrappedDeployed>,
    pub invalid: BTreeMap<EventSource, InvalidEventRecord>,
    pub quarantined: BTreeMap<EventSource, QuarantinedEventRecord>,
    pub skipped_blocks: BTreeSet<BlockNumber>,
    pub withdrawals: WithdrawalTransactions,
    pub balances: Balances,
    /// Last recorded failure per task; identical consecutive failures are recorded once
    pub last_task_errors: BTreeMap<TaskType, String>,
}

impl EngineState {
    pub fn from_init(init: &InitArg) -> BridgeResult<Self> {
        let mut tokens = TokenRegistry::new(init.native.clone());
        for token in &init.erc20_tokens {
            tokens
                .add_erc20(token.clone())
                .map_err(|e| BridgeError::InvalidStateTransition(e.to_string()))?;
        }
        Ok(Self {
            chain_id: init.chain_id,
            custody_contract_address: init.custody_contract_address,
            minimum_withdrawal_amount: init.minimum_withdrawal_amount,
            withdrawal_fee: init.withdrawal_fee,
            first_scraped_block: init.last_scraped_block,
            last_scraped_block: init.last_scraped_block,
            tokens,
            pending: BTreeMap::new(),
            minted: BTreeMap::new(),
            registered: BTreeMap::new(),
            invalid: BTreeMap::new(),
            quarantined: BTreeMap::new(),
            skipped_blocks: BTreeSet::new(),
            withdrawals: WithdrawalTransactions::starting_at_nonce(init.next_transaction_nonce),
            balances: Balances::default(),
            last_task_errors: BTreeMap::new(),
        })
    }

    pub fn event_status(&self, source: &EventSource) -> Option<DepositStatus> {
        if self.pending.contains_key(source) {
            Some(DepositStatus::Accepted)
        } else if let Some(record) = self.minted.get(source) {
            Some(if record.event.is_release() {
                DepositStatus::Released
            } else {
                DepositStatus::Minted
            })
        } else if self.registered.contains_key(source) {
            Some(DepositStatus::Registered)
        } else if self.invalid.contains_key(source) {
            Some(DepositStatus::Invalid)
        } else if self.quarantined.contains_key(source) {
            Some(DepositStatus::Quarantined)
        } else {
            None
        }
    }

    pub fn is_known(&self, source: &EventSource) -> bool {
        self.event_status(source).is_some()
    }

    /// Number of disjoint indices holding `source`; exactly one once classified.
    pub fn memberships(&self, source: &EventSource) -> usize {
        [
            self.pending.contains_key(source),
            self.minted.contains_key(source),
            self.registered.contains_key(source),
            self.invalid.contains_key(source),
            self.quarantined.contains_key(source),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// Pending events in on-chain order.
    pub fn pending_in_order(&self) -> Vec<SourceEvent> {
        let mut events: Vec<_> = self.pending.values().cloned().collect();
        events.sort_by_key(|e| (e.block_number(), e.source().log_index));
        events
    }

    /// Every known event emitted by one source transaction.
    pub fn events_of_transaction(&self, transaction_hash: &H256) -> Vec<(EventSource, DepositStatus)> {
        let start = EventSource {
            transaction_hash: *transaction_hash,
            log_index: 0,
        };
        let end = EventSource {
            transaction_hash: *transaction_hash,
            log_index: u64::MAX,
        };
        let mut sources: BTreeSet<EventSource> = BTreeSet::new();
        sources.extend(self.pending.range(start..=end).map(|(s, _)| *s));
        sources.extend(self.minted.range(start..=end).map(|(s, _)| *s));
        sources.extend(self.registered.range(start..=end).map(|(s, _)| *s));
        sources.extend(self.invalid.range(start..=end).map(|(s, _)| *s));
        sources.extend(self.quarantined.range(start..=end).map(|(s, _)| *s));
        sources
            .into_iter()
            .filter_map(|s| self.event_status(&s).map(|status| (s, status)))
            .collect()
    }
}

/// Re-runs classification for every quarantined event against the current
/// registry, accepting those that now resolve.
pub fn reclassify_quarantined(tx: &mut Transition) -> BridgeResult<usize> {
    let candidates: Vec<SourceEvent> = tx
        .state()
        .quarantined
        .values()
        .map(|record| record.event.clone())
        .collect();
    let mut accepted = 0;
    for event in candidates {
        if let Classification::Accepted(event) = classify(event, &tx.state().tokens) {
            tx.record(EventType::AcceptedEvent { event })?;
            accepted += 1;
        }
    }
    Ok(accepted)
}
