// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Single-writer scheduling of the engine's tasks.
//!
//! One loop owns the timers and runs each due task to completion before
//! looking at the next tick. Requests arriving through the server (forced
//! scrapes, withdrawals) run on their own tasks; the task guards keep a task
//! type from running twice and every state change goes through an atomic
//! commit, so the two never observe each other's partial work.

use crate::config::SchedulerConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::fees::FeeEstimator;
use crate::metrics::EngineMetrics;
use crate::mint::MintDispatcher;
use crate::scraper::EventScraper;
use crate::state::audit::EventType;
use crate::state::guard::{TaskGuard, TaskType};
use crate::state::reclassify_quarantined;
use crate::state::store::StateStore;
use crate::state::tokens::{Erc20Token, RegistryError};
use crate::withdraw::intake::WithdrawalIntake;
use crate::withdraw::pipeline::WithdrawalPipeline;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Minimum spacing between two forced scrapes.
pub const FORCED_SCRAPE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestScrapingError {
    #[error("scraping was requested less than {} seconds ago", FORCED_SCRAPE_INTERVAL.as_secs())]
    CalledTooManyTimes,
    #[error("scraping failed: {0}")]
    TemporarilyUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterTokenError {
    #[error("contract {contract_address:#x} is already registered")]
    DuplicateContract { contract_address: Address },
    #[error("ledger {ledger_id} is already registered")]
    DuplicateLedger { ledger_id: crate::types::Principal },
    #[error("the zero address is reserved for the native token")]
    NativeMarker,
    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),
}

impl From<RegistryError> for RegisterTokenError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateContract(contract_address) => {
                RegisterTokenError::DuplicateContract { contract_address }
            }
            RegistryError::DuplicateLedger(ledger_id) => {
                RegisterTokenError::DuplicateLedger { ledger_id }
            }
            RegistryError::NativeMarker => RegisterTokenError::NativeMarker,
        }
    }
}

/// Outcome of one task invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Another invocation of the same task type was running
    Skipped,
    Failed(BridgeError),
}

pub struct Engine {
    store: Arc<StateStore>,
    scraper: EventScraper,
    minter: MintDispatcher,
    intake: WithdrawalIntake,
    pipeline: WithdrawalPipeline,
    fees: Arc<FeeEstimator>,
    metrics: Arc<EngineMetrics>,
    /// Last failure recorded per task, cleared by the next success
    reported_failures: Mutex<BTreeMap<TaskType, String>>,
    last_forced_scrape: Mutex<Option<Instant>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        scraper: EventScraper,
        minter: MintDispatcher,
        intake: WithdrawalIntake,
        pipeline: WithdrawalPipeline,
        fees: Arc<FeeEstimator>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            scraper,
            minter,
            intake,
            pipeline,
            fees,
            metrics,
            reported_failures: Mutex::new(BTreeMap::new()),
            last_forced_scrape: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn intake(&self) -> &WithdrawalIntake {
        &self.intake
    }

    pub fn fees(&self) -> &Arc<FeeEstimator> {
        &self.fees
    }

    pub fn pipeline(&self) -> &WithdrawalPipeline {
        &self.pipeline
    }

    async fn dispatch(&self, task: TaskType) -> BridgeResult<()> {
        match task {
            TaskType::ScrapeLogs => self.scraper.scrape().await.map(|_| ()),
            TaskType::MintEvents => self.minter.mint_pending().await.map(|_| ()),
            TaskType::CreateTransactions => {
                self.pipeline.create_transactions_batch().await.map(|_| ())
            }
            TaskType::SignTransactions => self.pipeline.sign_transactions_batch().await.map(|_| ()),
            TaskType::SendTransactions => self.pipeline.send_transactions_batch().await.map(|_| ()),
            TaskType::FinalizeTransactions => {
                self.pipeline.finalize_transactions_batch().await.map(|_| ())
            }
            TaskType::ReimburseWithdrawals => {
                self.pipeline.reimburse_withdrawals().await.map(|_| ())
            }
            TaskType::RefreshFeeEstimate => self.fees.refresh().await.map(|_| ()),
        }
    }

    /// Runs `task` unless it is already running. Failures are logged, counted
    /// and recorded in the audit log once per distinct error.
    pub async fn run_task(&self, task: TaskType) -> TaskOutcome {
        let Some(_guard) = TaskGuard::new(self.store.guards(), task) else {
            debug!("[Scheduler] {} is already running, skipping", task);
            self.metrics
                .task_skipped
                .with_label_values(&[&task.to_string()])
                .inc();
            return TaskOutcome::Skipped;
        };
        match self.dispatch(task).await {
            Ok(()) => {
                self.reported_failures
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&task);
                self.metrics
                    .pending_events
                    .set(self.store.read().pending.len() as i64);
                TaskOutcome::Completed
            }
            Err(e) => {
                self.on_task_failure(task, &e).await;
                TaskOutcome::Failed(e)
            }
        }
    }

    async fn on_task_failure(&self, task: TaskType, err: &BridgeError) {
        let task_label = task.to_string();
        self.metrics
            .task_failures
            .with_label_values(&[task_label.as_str(), err.error_type()])
            .inc();
        let message = err.to_string();
        let repeated = {
            let mut reported = self
                .reported_failures
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let repeated = reported.get(&task) == Some(&message);
            reported.insert(task, message.clone());
            repeated
        };
        if repeated {
            debug!("[Scheduler] {} failed again: {}", task, message);
            return;
        }
        if err.is_transient() {
            warn!("[Scheduler] {} failed: {}", task, message);
        } else {
            error!("[Scheduler] {} failed: {}", task, message);
        }
        if let Err(e) = self
            .store
            .record(EventType::TaskFailed {
                task,
                error: message,
            })
            .await
        {
            error!("[Scheduler] Failed to record failure of {}: {:?}", task, e);
        }
    }

    /// Scrapes, then mints what the scrape accepted without waiting for the
    /// mint timer.
    pub async fn run_scrape_lane(&self) -> TaskOutcome {
        let outcome = self.run_task(TaskType::ScrapeLogs).await;
        if outcome == TaskOutcome::Completed {
            self.run_task(TaskType::MintEvents).await;
        }
        outcome
    }

    /// Create, sign, send, finalize, reimburse; in that order.
    pub async fn run_withdrawal_lane(&self) {
        for task in [
            TaskType::CreateTransactions,
            TaskType::SignTransactions,
            TaskType::SendTransactions,
            TaskType::FinalizeTransactions,
            TaskType::ReimburseWithdrawals,
        ] {
            self.run_task(task).await;
        }
    }

    /// Scrapes now instead of at the next tick.
    pub async fn request_scraping(&self) -> Result<(), RequestScrapingError> {
        {
            let mut last = self
                .last_forced_scrape
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if last.is_some_and(|at| at.elapsed() < FORCED_SCRAPE_INTERVAL) {
                return Err(RequestScrapingError::CalledTooManyTimes);
            }
            *last = Some(Instant::now());
        }
        info!("[Scheduler] Scrape requested");
        match self.run_task(TaskType::ScrapeLogs).await {
            TaskOutcome::Completed | TaskOutcome::Skipped => Ok(()),
            TaskOutcome::Failed(e) => Err(RequestScrapingError::TemporarilyUnavailable(
                e.to_string(),
            )),
        }
    }

    /// Adds a fungible token and accepts the quarantined deposits it resolves.
    pub async fn register_token(&self, token: Erc20Token) -> Result<usize, RegisterTokenError> {
        let symbol = token.symbol.clone();
        let result = self
            .store
            .commit(|tx| {
                if let Err(e) = tx.state().tokens.check_erc20(&token) {
                    return Ok(Err(RegisterTokenError::from(e)));
                }
                tx.record(EventType::AddedToken(token))?;
                Ok(Ok(reclassify_quarantined(tx)?))
            })
            .await
            .map_err(|e| RegisterTokenError::TemporarilyUnavailable(e.to_string()))?;
        if let Ok(reclassified) = &result {
            info!(
                "[Scheduler] Registered token {}; {} quarantined events resolved",
                symbol, reclassified
            );
        }
        result
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("[Scheduler] Starting");
        let mut scrape = time::interval(self.config.scrape_interval());
        let mut mint = time::interval(self.config.mint_interval());
        let mut withdraw = time::interval(self.config.withdrawal_interval());
        let mut fees = time::interval(self.config.fee_refresh_interval());
        for interval in [&mut scrape, &mut mint, &mut withdraw, &mut fees] {
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[Scheduler] Cancelled");
                    break;
                }
                _ = scrape.tick() => {
                    self.engine.run_scrape_lane().await;
                }
                _ = mint.tick() => {
                    self.engine.run_task(TaskType::MintEvents).await;
                }
                _ = withdraw.tick() => {
                    self.engine.run_withdrawal_lane().await;
                }
                _ = fees.tick() => {
                    self.engine.run_task(TaskType::RefreshFeeEstimate).await;
                }
            }
        }
    }
}
