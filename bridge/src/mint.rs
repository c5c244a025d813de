// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Turns accepted deposits into mints and accepted burns into releases on
//! the destination ledger.
//!
//! Every ledger call carries the event's [`EventSource`] as memo, so if the
//! process dies between a successful call and its commit, the retried call
//! comes back as a duplicate and is recorded with the original index.

use crate::error::BridgeResult;
use crate::events::classifier::native_mint_amount;
use crate::events::SourceEvent;
use crate::ledger::{settled, LedgerClient, LedgerError, LedgerMemo};
use crate::metrics::EngineMetrics;
use crate::retry::RetryPolicy;
use crate::state::audit::EventType;
use crate::state::store::StateStore;
use crate::state::EngineState;
use crate::types::{EventSource, LedgerAccount, Principal};
use ethers::types::U256;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
struct FailedAttempts {
    attempts: u32,
    retry_at: Instant,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MintSummary {
    pub minted: usize,
    pub released: usize,
    pub invalid: usize,
    /// Left pending after a transient failure or while backing off
    pub deferred: usize,
}

/// What one pending event asks of the ledger.
struct Settlement {
    ledger: Principal,
    to: LedgerAccount,
    amount: U256,
    memo: LedgerMemo,
    token_symbol: String,
    /// Set for releases
    transfer_fee: Option<U256>,
}

pub struct MintDispatcher {
    store: Arc<StateStore>,
    ledger: Arc<dyn LedgerClient>,
    policy: RetryPolicy,
    metrics: Arc<EngineMetrics>,
    failures: Mutex<BTreeMap<EventSource, FailedAttempts>>,
}

impl MintDispatcher {
    pub fn new(
        store: Arc<StateStore>,
        ledger: Arc<dyn LedgerClient>,
        policy: RetryPolicy,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            ledger,
            policy,
            metrics,
            failures: Mutex::new(BTreeMap::new()),
        }
    }

    /// Settles every pending event, oldest first.
    pub async fn mint_pending(&self) -> BridgeResult<MintSummary> {
        let pending = self.store.read().pending_in_order();
        let mut summary = MintSummary::default();
        for event in pending {
            let source = event.source();
            // Earlier settlements in this pass may have refreshed cached fees.
            let state = self.store.snapshot();
            if !state.pending.contains_key(&source) {
                continue;
            }
            if self.backing_off(&source).await {
                summary.deferred += 1;
                continue;
            }
            let settlement = match self.settlement(&state, &event).await {
                Ok(settlement) => settlement,
                Err(e) => {
                    self.on_failure(&event, e, &mut summary).await?;
                    continue;
                }
            };
            let index = if settlement.amount.is_zero() {
                None
            } else {
                match settled(
                    self.ledger
                        .mint(
                            settlement.ledger,
                            settlement.to,
                            settlement.amount,
                            settlement.memo.clone(),
                        )
                        .await,
                ) {
                    Ok(index) => Some(index),
                    Err(e) => {
                        self.on_failure(&event, e, &mut summary).await?;
                        continue;
                    }
                }
            };
            self.on_success(&event, settlement, index, &mut summary).await?;
        }
        self.metrics
            .pending_events
            .set(self.store.read().pending.len() as i64);
        Ok(summary)
    }

    async fn settlement(
        &self,
        state: &EngineState,
        event: &SourceEvent,
    ) -> Result<Settlement, LedgerError> {
        let source = event.source();
        match event {
            SourceEvent::NativeDeposit(deposit) => Ok(Settlement {
                ledger: state.tokens.native.ledger_id,
                to: LedgerAccount::new(deposit.principal, deposit.subaccount),
                amount: native_mint_amount(deposit.value, state.tokens.native.transfer_fee),
                memo: LedgerMemo::Mint(source),
                token_symbol: state.tokens.native.symbol.clone(),
                transfer_fee: None,
            }),
            SourceEvent::TokenDeposit(deposit) => {
                let token = state
                    .tokens
                    .erc20_by_address(&deposit.token_contract_address)
                    .ok_or_else(|| {
                        LedgerError::Rejected(format!(
                            "token {:#x} is not registered",
                            deposit.token_contract_address
                        ))
                    })?;
                Ok(Settlement {
                    ledger: token.ledger_id,
                    to: LedgerAccount::new(deposit.principal, deposit.subaccount),
                    amount: deposit.value,
                    memo: LedgerMemo::Mint(source),
                    token_symbol: token.symbol.clone(),
                    transfer_fee: None,
                })
            }
            SourceEvent::WrappedBurn(burn) => {
                let cached = state
                    .tokens
                    .wrapped_by_address(&burn.wrapped_contract_address)
                    .and_then(|token| token.transfer_fee);
                let fee = match cached {
                    Some(fee) => fee,
                    None => self.ledger.transfer_fee(burn.base_ledger).await?,
                };
                Ok(Settlement {
                    ledger: burn.base_ledger,
                    to: LedgerAccount::new(burn.principal, burn.subaccount),
                    amount: burn.value.saturating_sub(fee),
                    memo: LedgerMemo::Release(source),
                    token_symbol: state
                        .tokens
                        .symbol_of(&burn.wrapped_contract_address)
                        .unwrap_or_default(),
                    transfer_fee: Some(fee),
                })
            }
            SourceEvent::WrappedDeployed(_) => Err(LedgerError::Rejected(
                "a deployment has nothing to mint".to_string(),
            )),
        }
    }

    async fn backing_off(&self, source: &EventSource) -> bool {
        self.failures
            .lock()
            .await
            .get(source)
            .is_some_and(|failed| Instant::now() < failed.retry_at)
    }

    async fn on_success(
        &self,
        event: &SourceEvent,
        settlement: Settlement,
        ledger_index: Option<u64>,
        summary: &mut MintSummary,
    ) -> BridgeResult<()> {
        let source = event.source();
        let record = match settlement.transfer_fee {
            Some(transfer_fee) => EventType::ReleasedEvent {
                source,
                ledger_id: settlement.ledger,
                amount: settlement.amount,
                transfer_fee,
                ledger_index,
            },
            None => EventType::MintedEvent {
                source,
                ledger_id: settlement.ledger,
                token_symbol: settlement.token_symbol.clone(),
                amount: settlement.amount,
                // Native and token mints are never zero.
                ledger_index: ledger_index.unwrap_or_default(),
            },
        };
        self.store.record(record).await?;
        self.failures.lock().await.remove(&source);
        self.metrics.mint_ok.with_label_values(&[event.kind()]).inc();
        if event.is_release() {
            summary.released += 1;
        } else {
            summary.minted += 1;
        }
        info!(
            "[Minter] {} {} {} to {} for {} at ledger index {:?}",
            if event.is_release() { "Released" } else { "Minted" },
            settlement.amount,
            settlement.token_symbol,
            settlement.to,
            source,
            ledger_index
        );
        Ok(())
    }

    async fn on_failure(
        &self,
        event: &SourceEvent,
        err: LedgerError,
        summary: &mut MintSummary,
    ) -> BridgeResult<()> {
        let source = event.source();
        self.metrics
            .mint_errors
            .with_label_values(&[err.error_type()])
            .inc();
        if err.is_transient() {
            let mut failures = self.failures.lock().await;
            let attempts = failures.get(&source).map_or(0, |f| f.attempts) + 1;
            failures.insert(
                source,
                FailedAttempts {
                    attempts,
                    retry_at: Instant::now() + self.policy.backoff_for(attempts),
                },
            );
            if self.policy.exhausted(attempts) {
                error!(
                    "[Minter] Settling {} failed {} times, still retrying: {}",
                    source, attempts, err
                );
            } else {
                warn!("[Minter] Transient failure settling {}: {}", source, err);
            }
            summary.deferred += 1;
            return Ok(());
        }
        warn!("[Minter] Ledger rejected {}, marking invalid: {}", source, err);
        self.store
            .record(EventType::InvalidEvent {
                source,
                reason: format!("ledger rejected the mint: {err}"),
            })
            .await?;
        self.failures.lock().await.remove(&source);
        self.metrics.invalid_events.inc();
        summary.invalid += 1;
        Ok(())
    }
}
