// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::BridgeResult;
use crate::fees::GasFeeEstimate;
use crate::scheduler::{Engine, RegisterTokenError, RequestScrapingError};
use crate::state::audit::Event;
use crate::state::guard::TaskType;
use crate::state::store::MAX_HISTORY_PAGE;
use crate::state::tokens::{Erc20Token, NativeToken, WrappedToken};
use crate::state::{Balances, DepositStatus};
use crate::types::{BlockNumber, EventSource, LedgerAccount, Principal, WithdrawalId};
use crate::withdraw::intake::{RetrieveReceipt, WithdrawTokenError, WithdrawalError, WrapError};
use crate::withdraw::{
    WithdrawalDetail, WithdrawalKind, WithdrawalPhase, WithdrawalSearch, WithdrawalStatus,
};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawNativeArg {
    pub amount: U256,
    pub recipient: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawTokenArg {
    pub ledger_id: Principal,
    pub amount: U256,
    pub recipient: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapArg {
    pub base_ledger: Principal,
    pub amount: U256,
    pub recipient: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTokenArg {
    pub ledger_id: Principal,
    pub contract_address: Address,
    pub symbol: String,
}

impl From<AddTokenArg> for Erc20Token {
    fn from(arg: AddTokenArg) -> Self {
        Erc20Token {
            ledger_id: arg.ledger_id,
            contract_address: arg.contract_address,
            symbol: arg.symbol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTokenResult {
    /// Quarantined events that became mintable with this token
    pub reclassified: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEventStatus {
    pub source: EventSource,
    pub status: DepositStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsPage {
    pub total: usize,
    pub start: usize,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimateInfo {
    /// Milliseconds since the unix epoch
    pub timestamp: u64,
    pub estimate: GasFeeEstimate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub chain_id: u64,
    pub custody_contract_address: Address,
    pub withdrawal_sender: Address,
    pub first_scraped_block: BlockNumber,
    pub last_scraped_block: BlockNumber,
    pub last_observed_block: Option<BlockNumber>,
    pub skipped_blocks: Vec<BlockNumber>,
    pub native_token: NativeToken,
    pub erc20_tokens: Vec<Erc20Token>,
    pub wrapped_tokens: Vec<WrappedToken>,
    pub minimum_withdrawal_amount: U256,
    pub withdrawal_fee: Option<U256>,
    pub balances: Balances,
    pub pending_events: usize,
    pub quarantined_events: usize,
    pub invalid_events: usize,
    pub withdrawals: BTreeMap<WithdrawalPhase, usize>,
    pub fee_estimate: Option<FeeEstimateInfo>,
    pub last_task_errors: BTreeMap<TaskType, String>,
}

#[async_trait]
pub trait EngineRequestHandlerTrait {
    async fn withdraw_native(
        &self,
        caller: LedgerAccount,
        arg: WithdrawNativeArg,
    ) -> Result<RetrieveReceipt, WithdrawalError>;

    async fn withdraw_token(
        &self,
        caller: LedgerAccount,
        arg: WithdrawTokenArg,
    ) -> Result<RetrieveReceipt, WithdrawTokenError>;

    async fn wrap(&self, caller: LedgerAccount, arg: WrapArg) -> Result<RetrieveReceipt, WrapError>;

    fn withdrawal_status(&self, id: WithdrawalId) -> WithdrawalStatus;

    fn withdrawals(&self, search: WithdrawalSearch) -> Vec<WithdrawalDetail>;

    /// Every event emitted by the transaction, with where the engine filed it.
    fn deposit_status(&self, transaction_hash: H256) -> Vec<DepositEventStatus>;

    async fn info(&self) -> EngineInfo;

    async fn request_scraping(&self) -> Result<(), RequestScrapingError>;

    async fn events(&self, start: usize, length: usize) -> BridgeResult<EventsPage>;

    async fn add_token(&self, arg: AddTokenArg) -> Result<AddTokenResult, RegisterTokenError>;
}

pub struct EngineRequestHandler {
    engine: Arc<Engine>,
}

impl EngineRequestHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EngineRequestHandlerTrait for EngineRequestHandler {
    async fn withdraw_native(
        &self,
        caller: LedgerAccount,
        arg: WithdrawNativeArg,
    ) -> Result<RetrieveReceipt, WithdrawalError> {
        self.engine
            .intake()
            .withdraw_native(caller, arg.amount, arg.recipient)
            .await
    }

    async fn withdraw_token(
        &self,
        caller: LedgerAccount,
        arg: WithdrawTokenArg,
    ) -> Result<RetrieveReceipt, WithdrawTokenError> {
        self.engine
            .intake()
            .withdraw_token(caller, arg.ledger_id, arg.amount, arg.recipient)
            .await
    }

    async fn wrap(&self, caller: LedgerAccount, arg: WrapArg) -> Result<RetrieveReceipt, WrapError> {
        self.engine
            .intake()
            .wrap(caller, arg.base_ledger, arg.amount, arg.recipient)
            .await
    }

    fn withdrawal_status(&self, id: WithdrawalId) -> WithdrawalStatus {
        self.engine.store().read().withdrawals.status(id)
    }

    fn withdrawals(&self, search: WithdrawalSearch) -> Vec<WithdrawalDetail> {
        let state = self.engine.store().read();
        state
            .withdrawals
            .search(&search)
            .into_iter()
            .map(|entry| {
                let symbol = match &entry.request.kind {
                    WithdrawalKind::Native => Some(state.tokens.native.symbol.clone()),
                    WithdrawalKind::Token {
                        contract_address, ..
                    } => state.tokens.symbol_of(contract_address),
                    WithdrawalKind::Wrap {
                        wrapped_contract_address,
                        ..
                    } => state.tokens.symbol_of(wrapped_contract_address),
                };
                state.withdrawals.detail(entry, symbol.unwrap_or_default())
            })
            .collect()
    }

    fn deposit_status(&self, transaction_hash: H256) -> Vec<DepositEventStatus> {
        self.engine
            .store()
            .read()
            .events_of_transaction(&transaction_hash)
            .into_iter()
            .map(|(source, status)| DepositEventStatus { source, status })
            .collect()
    }

    async fn info(&self) -> EngineInfo {
        let fee_estimate = self
            .engine
            .fees()
            .last_estimate()
            .await
            .map(|(timestamp, estimate)| FeeEstimateInfo {
                timestamp,
                estimate,
            });
        let store = self.engine.store();
        let state = store.read();
        EngineInfo {
            chain_id: state.chain_id,
            custody_contract_address: state.custody_contract_address,
            withdrawal_sender: self.engine.pipeline().sender(),
            first_scraped_block: state.first_scraped_block,
            last_scraped_block: state.last_scraped_block,
            last_observed_block: store.last_observed_block(),
            skipped_blocks: state.skipped_blocks.iter().copied().collect(),
            native_token: state.tokens.native.clone(),
            erc20_tokens: state.tokens.erc20_tokens().cloned().collect(),
            wrapped_tokens: state.tokens.wrapped_tokens().cloned().collect(),
            minimum_withdrawal_amount: state.minimum_withdrawal_amount,
            withdrawal_fee: state.withdrawal_fee,
            balances: state.balances.clone(),
            pending_events: state.pending.len(),
            quarantined_events: state.quarantined.len(),
            invalid_events: state.invalid.len(),
            withdrawals: state.withdrawals.phase_counts(),
            fee_estimate,
            last_task_errors: state.last_task_errors.clone(),
        }
    }

    async fn request_scraping(&self) -> Result<(), RequestScrapingError> {
        info!("[Server] Scrape requested");
        self.engine.request_scraping().await
    }

    async fn events(&self, start: usize, length: usize) -> BridgeResult<EventsPage> {
        let store = self.engine.store();
        let total = store.event_count().await;
        let events = store.history(start, length.min(MAX_HISTORY_PAGE)).await?;
        Ok(EventsPage {
            total,
            start,
            events,
        })
    }

    async fn add_token(&self, arg: AddTokenArg) -> Result<AddTokenResult, RegisterTokenError> {
        info!(
            "[Server] Registering token {} at {:#x} on ledger {}",
            arg.symbol, arg.contract_address, arg.ledger_id
        );
        let reclassified = self.engine.register_token(arg.into()).await?;
        Ok(AddTokenResult { reclassified })
    }
}
