// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Moves accepted withdrawal requests through create, sign, send and
//! finalize, and reimburses the ones that end with a failure receipt.
//!
//! Each step reads a snapshot, makes its outbound calls, then commits what it
//! learned per withdrawal. A commit re-checks the withdrawal against the
//! latest state, so a withdrawal that moved on in the meantime is skipped
//! instead of failing the whole step.

use super::client::{SendRawTransactionResult, TransactionClient};
use super::signer::TransactionSigner;
use super::transactions::{Eip1559Transaction, ReimbursementRecord, WithdrawalEntry};
use super::{WithdrawalKind, WithdrawalPhase, WithdrawalRequest, WITHDRAWAL_BATCH_SIZE};
use crate::error::{BridgeError, BridgeResult};
use crate::fees::{FeeEstimator, GasFeeEstimate, TransactionPrice};
use crate::finality::FinalityChecker;
use crate::ledger::{settled, LedgerClient, LedgerMemo};
use crate::metrics::EngineMetrics;
use crate::retry::RetryPolicy;
use crate::state::audit::EventType;
use crate::state::store::StateStore;
use crate::types::WithdrawalId;
use ethers::abi::{encode, Token};
use ethers::types::{Address, BlockNumber as EthBlockNumber, Bytes, U256};
use ethers::utils::id;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const ERC20_TRANSFER_SIGNATURE: &str = "transfer(address,uint256)";
const MINT_WRAPPED_TOKEN_SIGNATURE: &str = "mintWrappedToken(address,address,uint256)";

fn call_data(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(encode(tokens));
    Bytes::from(data)
}

/// Builds the first transaction of a withdrawal, or explains why the request
/// cannot afford one at `price`.
pub fn build_transaction(
    request: &WithdrawalRequest,
    price: TransactionPrice,
    nonce: u64,
    chain_id: u64,
    from: Address,
    custody_contract_address: Address,
) -> Result<Eip1559Transaction, String> {
    let max_transaction_fee = price.max_transaction_fee();
    let (destination, amount, data) = match &request.kind {
        WithdrawalKind::Native => {
            if request.amount <= max_transaction_fee {
                return Err(format!(
                    "amount {} does not cover the transaction fee {}",
                    request.amount, max_transaction_fee
                ));
            }
            (
                request.destination,
                request.amount - max_transaction_fee,
                Bytes::default(),
            )
        }
        WithdrawalKind::Token {
            contract_address, ..
        } => (
            *contract_address,
            U256::zero(),
            call_data(
                ERC20_TRANSFER_SIGNATURE,
                &[
                    Token::Address(request.destination),
                    Token::Uint(request.amount),
                ],
            ),
        ),
        WithdrawalKind::Wrap {
            wrapped_contract_address,
            ..
        } => (
            custody_contract_address,
            U256::zero(),
            call_data(
                MINT_WRAPPED_TOKEN_SIGNATURE,
                &[
                    Token::Address(*wrapped_contract_address),
                    Token::Address(request.destination),
                    Token::Uint(request.amount),
                ],
            ),
        ),
    };
    if let Some(prepaid) = request.max_transaction_fee {
        if max_transaction_fee > prepaid {
            return Err(format!(
                "transaction fee {max_transaction_fee} exceeds the prepaid fee {prepaid}"
            ));
        }
    }
    Ok(Eip1559Transaction {
        chain_id,
        from,
        nonce,
        max_priority_fee_per_gas: price.max_priority_fee_per_gas,
        max_fee_per_gas: price.max_fee_per_gas,
        gas_limit: price.gas_limit,
        destination,
        amount,
        data,
    })
}

/// Same-nonce replacement of the latest attempt at `price`. Native
/// withdrawals pay the higher fee out of the transferred value.
pub fn build_replacement(
    entry: &WithdrawalEntry,
    price: TransactionPrice,
) -> Result<Eip1559Transaction, String> {
    let previous = entry
        .latest_signed()
        .map(|signed| signed.transaction.clone())
        .ok_or_else(|| "no signed transaction to replace".to_string())?;
    let amount = if entry.request.is_native() {
        let fee = price.max_transaction_fee();
        if entry.request.amount <= fee {
            return Err(format!(
                "amount {} does not cover the replacement fee {fee}",
                entry.request.amount
            ));
        }
        entry.request.amount - fee
    } else {
        previous.amount
    };
    Ok(Eip1559Transaction {
        max_fee_per_gas: price.max_fee_per_gas,
        max_priority_fee_per_gas: price.max_priority_fee_per_gas,
        amount,
        ..previous
    })
}

pub struct WithdrawalPipeline {
    store: Arc<StateStore>,
    fees: Arc<FeeEstimator>,
    client: Arc<dyn TransactionClient>,
    signer: Arc<dyn TransactionSigner>,
    ledger: Arc<dyn LedgerClient>,
    finality: Arc<dyn FinalityChecker>,
    policy: RetryPolicy,
    metrics: Arc<EngineMetrics>,
    /// Withdrawals with a signature request outstanding
    signing: Mutex<BTreeSet<WithdrawalId>>,
}

impl WithdrawalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        fees: Arc<FeeEstimator>,
        client: Arc<dyn TransactionClient>,
        signer: Arc<dyn TransactionSigner>,
        ledger: Arc<dyn LedgerClient>,
        finality: Arc<dyn FinalityChecker>,
        policy: RetryPolicy,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            fees,
            client,
            signer,
            ledger,
            finality,
            policy,
            metrics,
            signing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn sender(&self) -> Address {
        self.signer.address()
    }

    fn observe_transition(&self, phase: WithdrawalPhase) {
        self.metrics
            .withdrawal_transitions
            .with_label_values(&[phase.as_str()])
            .inc();
    }

    fn observe_in_flight(&self) {
        let counts = self.store.read().withdrawals.phase_counts();
        for phase in [
            WithdrawalPhase::Pending,
            WithdrawalPhase::Created,
            WithdrawalPhase::Signed,
            WithdrawalPhase::Sent,
            WithdrawalPhase::PendingReimbursement,
        ] {
            self.metrics
                .withdrawals_in_flight
                .with_label_values(&[phase.as_str()])
                .set(counts.get(&phase).copied().unwrap_or_default() as i64);
        }
    }

    /// Builds one transaction for each of the oldest queued requests.
    pub async fn create_transactions_batch(&self) -> BridgeResult<usize> {
        let requests = self
            .store
            .read()
            .withdrawals
            .queued_requests(WITHDRAWAL_BATCH_SIZE);
        if requests.is_empty() {
            return Ok(0);
        }
        let estimate = self.fees.estimate().await?;
        let sender = self.sender();
        let chain_nonce = self
            .client
            .transaction_count(sender, EthBlockNumber::Latest)
            .await?;
        let created = self
            .store
            .commit(|tx| {
                let chain_id = tx.state().chain_id;
                let custody = tx.state().custody_contract_address;
                let mut created = 0;
                for request in requests {
                    let id = request.withdrawal_id;
                    let still_queued = tx
                        .state()
                        .withdrawals
                        .get(id)
                        .is_some_and(|entry| entry.phase == WithdrawalPhase::Pending);
                    if !still_queued {
                        continue;
                    }
                    let recorded_nonce = tx.state().withdrawals.next_nonce(&sender);
                    if chain_nonce > recorded_nonce {
                        warn!(
                            "[Withdrawal] Sender {:#x} has {} transactions on chain but the next recorded nonce is {}; skipping ahead",
                            sender, chain_nonce, recorded_nonce
                        );
                    }
                    let nonce = recorded_nonce.max(chain_nonce);
                    let price = estimate.to_price(request.gas_limit());
                    match build_transaction(&request, price, nonce, chain_id, sender, custody) {
                        Ok(transaction) => {
                            debug!(
                                "[Withdrawal] Created transaction for {} with nonce {}",
                                id, nonce
                            );
                            tx.record(EventType::CreatedTransaction {
                                withdrawal_id: id,
                                transaction,
                            })?;
                            created += 1;
                        }
                        Err(reason) => {
                            info!("[Withdrawal] Rescheduling {}: {}", id, reason);
                            tx.record(EventType::RescheduledWithdrawal { withdrawal_id: id })?;
                        }
                    }
                }
                Ok(created)
            })
            .await?;
        for _ in 0..created {
            self.observe_transition(WithdrawalPhase::Created);
        }
        self.observe_in_flight();
        Ok(created)
    }

    /// Requests a signature for every created transaction. A withdrawal whose
    /// signature request is still outstanding is not asked again.
    pub async fn sign_transactions_batch(&self) -> BridgeResult<usize> {
        let created = self.store.read().withdrawals.created_transactions();
        let mut signed_count = 0;
        let mut first_error = None;
        for (id, transaction) in created {
            if !self.signing.lock().await.insert(id) {
                debug!("[Withdrawal] Signature for {} already requested", id);
                continue;
            }
            let result = self.signer.sign(&transaction).await;
            self.signing.lock().await.remove(&id);
            let signed = match result {
                Ok(signed) => signed,
                Err(e) => {
                    warn!("[Withdrawal] Failed to sign transaction of {}: {}", id, e);
                    first_error.get_or_insert(BridgeError::from(e));
                    continue;
                }
            };
            let recorded = self
                .store
                .commit(|tx| {
                    let entry = tx.state().withdrawals.get(id);
                    let unchanged = entry.is_some_and(|entry| {
                        entry.phase == WithdrawalPhase::Created
                            && entry.created.as_ref() == Some(&signed.transaction)
                    });
                    if unchanged {
                        tx.record(EventType::SignedTransaction {
                            withdrawal_id: id,
                            transaction: signed,
                        })?;
                    }
                    Ok(unchanged)
                })
                .await?;
            if recorded {
                signed_count += 1;
                self.observe_transition(WithdrawalPhase::Signed);
            }
        }
        self.observe_in_flight();
        match first_error {
            Some(e) if signed_count == 0 => Err(e),
            _ => Ok(signed_count),
        }
    }

    /// Broadcasts every signed attempt not yet accepted by a node, replacing
    /// stuck or rejected ones at a bumped fee first.
    pub async fn send_transactions_batch(&self) -> BridgeResult<usize> {
        self.resubmit_stuck_transactions().await?;

        let to_broadcast = self.store.read().withdrawals.transactions_to_broadcast();
        let mut sent = 0;
        for (id, signed) in to_broadcast {
            let result = match self.client.send_raw_transaction(&signed.raw).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        "[Withdrawal] Failed to broadcast {:#x} of {}: {}",
                        signed.hash, id, e
                    );
                    continue;
                }
            };
            if result.is_accepted() {
                let recorded = self
                    .store
                    .commit(|tx| {
                        let current = tx
                            .state()
                            .withdrawals
                            .get(id)
                            .is_some_and(|entry| {
                                entry.needs_broadcast()
                                    && entry.latest_signed().map(|s| s.hash) == Some(signed.hash)
                            });
                        if current {
                            tx.record(EventType::SentTransaction {
                                withdrawal_id: id,
                                transaction_hash: signed.hash,
                            })?;
                        }
                        Ok(current)
                    })
                    .await?;
                if recorded {
                    info!(
                        "[Withdrawal] Sent {:#x} for {} ({})",
                        signed.hash,
                        id,
                        result.as_str()
                    );
                    sent += 1;
                    self.observe_transition(WithdrawalPhase::Sent);
                }
            } else if result.needs_replacement() {
                info!(
                    "[Withdrawal] Broadcast of {:#x} for {} rejected as {}, replacing",
                    signed.hash,
                    id,
                    result.as_str()
                );
                self.replace(id).await?;
            } else {
                warn!(
                    "[Withdrawal] Broadcast of {:#x} for {} rejected as {}",
                    signed.hash,
                    id,
                    result.as_str()
                );
            }
        }
        self.observe_in_flight();
        Ok(sent)
    }

    /// Replaces sent transactions whose nonce is still open and whose max fee
    /// no longer covers the current minimum.
    async fn resubmit_stuck_transactions(&self) -> BridgeResult<()> {
        let candidates: Vec<(WithdrawalId, u64, TransactionPrice)> = self
            .store
            .read()
            .withdrawals
            .entries()
            .filter(|entry| entry.phase == WithdrawalPhase::Sent && entry.latest_broadcast)
            .filter_map(|entry| {
                let latest = entry.latest_signed()?;
                Some((
                    entry.request.withdrawal_id,
                    latest.transaction.nonce,
                    latest.transaction.price(),
                ))
            })
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        let fresh = self.fees.estimate().await?;
        let latest_count = match self
            .client
            .transaction_count(self.sender(), EthBlockNumber::Latest)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!("[Withdrawal] Cannot read the latest transaction count: {}", e);
                return Ok(());
            }
        };
        for (id, nonce, price) in candidates {
            if nonce >= latest_count && !price.is_sufficient(&fresh) {
                info!(
                    "[Withdrawal] Transaction of {} with nonce {} is stuck at max fee {}",
                    id, nonce, price.max_fee_per_gas
                );
                self.replace_at(id, &fresh).await?;
            }
        }
        Ok(())
    }

    async fn replace(&self, id: WithdrawalId) -> BridgeResult<()> {
        let fresh = self.fees.estimate().await?;
        self.replace_at(id, &fresh).await
    }

    /// Signs and records a same-nonce replacement for `id`, unless the retry
    /// policy says to stop escalating.
    async fn replace_at(&self, id: WithdrawalId, fresh: &GasFeeEstimate) -> BridgeResult<()> {
        let entry = match self.store.read().withdrawals.get(id) {
            Some(entry) if entry.is_awaiting_receipt() => entry.clone(),
            _ => return Ok(()),
        };
        // An exhausted withdrawal is not reimbursed. It stays in Sent at its
        // last price and keeps being checked for a receipt.
        if self.policy.exhausted(entry.replacements()) {
            warn!(
                "[Withdrawal] {} reached {} replacements, no further fee bumps",
                id,
                entry.replacements()
            );
            return Ok(());
        }
        let Some(previous) = entry.latest_signed().map(|s| s.transaction.price()) else {
            return Ok(());
        };
        let price = previous.resubmit(fresh, &self.policy);
        let replacement = match build_replacement(&entry, price) {
            Ok(transaction) => transaction,
            Err(reason) => {
                warn!("[Withdrawal] Cannot replace transaction of {}: {}", id, reason);
                return Ok(());
            }
        };
        let signed = self.signer.sign(&replacement).await?;
        let hash = signed.hash;
        let recorded = self
            .store
            .commit(|tx| {
                let unchanged = tx.state().withdrawals.get(id).is_some_and(|current| {
                    current.is_awaiting_receipt() && current.attempts == entry.attempts
                });
                if unchanged {
                    tx.record(EventType::ReplacedTransaction {
                        withdrawal_id: id,
                        transaction: signed,
                    })?;
                }
                Ok(unchanged)
            })
            .await?;
        if recorded {
            info!(
                "[Withdrawal] Replaced transaction of {} with {:#x} at max fee {}",
                id, hash, price.max_fee_per_gas
            );
            self.metrics.withdrawal_replacements.inc();
        }
        Ok(())
    }

    /// Records the receipt of every withdrawal whose nonce is below the
    /// sender's transaction count at the agreed-final block.
    pub async fn finalize_transactions_batch(&self) -> BridgeResult<usize> {
        let awaiting: Vec<WithdrawalEntry> = self
            .store
            .read()
            .withdrawals
            .awaiting_receipt()
            .into_iter()
            .cloned()
            .collect();
        if awaiting.is_empty() {
            return Ok(0);
        }
        let finalized_block = self.finality.finalized_block().await?;
        let finalized_count = self
            .client
            .transaction_count(self.sender(), EthBlockNumber::Number(finalized_block.into()))
            .await?;

        let mut finalized = 0;
        for entry in awaiting {
            let id = entry.request.withdrawal_id;
            if entry.nonce().map_or(true, |nonce| nonce >= finalized_count) {
                continue;
            }
            let mut receipts = Vec::new();
            for attempt in &entry.attempts {
                if let Some(receipt) = self.client.transaction_receipt(attempt.hash).await? {
                    receipts.push(receipt);
                }
            }
            let receipt = match receipts.len() {
                1 => receipts.remove(0),
                0 => {
                    warn!(
                        "[Withdrawal] Nonce of {} is final but none of its {} attempts has a receipt",
                        id,
                        entry.attempts.len()
                    );
                    continue;
                }
                n => {
                    error!("[Withdrawal] {} has {} receipts for one nonce", id, n);
                    continue;
                }
            };
            let status = receipt.status;
            let hash = receipt.transaction_hash;
            let recorded = self
                .store
                .commit(|tx| {
                    let current = tx
                        .state()
                        .withdrawals
                        .get(id)
                        .is_some_and(WithdrawalEntry::is_awaiting_receipt);
                    if current {
                        tx.record(EventType::FinalizedTransaction {
                            withdrawal_id: id,
                            receipt,
                        })?;
                    }
                    Ok(current)
                })
                .await?;
            if recorded {
                info!(
                    "[Withdrawal] Finalized {} with {:#x}: {:?}",
                    id, hash, status
                );
                finalized += 1;
                let phase = self
                    .store
                    .read()
                    .withdrawals
                    .get(id)
                    .map(|entry| entry.phase)
                    .unwrap_or(WithdrawalPhase::Finalized);
                self.observe_transition(phase);
            }
        }
        self.observe_in_flight();
        Ok(finalized)
    }

    /// Returns value owed for failed withdrawals and failed requests. Each
    /// withdrawal id is reimbursed at most once.
    pub async fn reimburse_withdrawals(&self) -> BridgeResult<usize> {
        let requests = self.store.read().withdrawals.reimbursement_requests();
        let mut reimbursed = 0;
        for request in requests {
            let id = request.withdrawal_id;
            let ledger_index = if request.amount.is_zero() {
                None
            } else {
                match settled(
                    self.ledger
                        .mint(
                            request.ledger_id,
                            request.to,
                            request.amount,
                            LedgerMemo::Reimburse(id),
                        )
                        .await,
                ) {
                    Ok(index) => Some(index),
                    Err(e) if e.is_transient() => {
                        warn!("[Withdrawal] Reimbursement of {} deferred: {}", id, e);
                        continue;
                    }
                    Err(e) => {
                        error!("[Withdrawal] Reimbursement of {} rejected: {}", id, e);
                        self.store
                            .record(EventType::QuarantinedReimbursement {
                                withdrawal_id: id,
                                reason: e.to_string(),
                            })
                            .await?;
                        continue;
                    }
                }
            };
            self.store
                .record(EventType::ReimbursedWithdrawal(ReimbursementRecord {
                    withdrawal_id: id,
                    ledger_id: request.ledger_id,
                    amount: request.amount,
                    ledger_index,
                    transaction_hash: request.transaction_hash,
                }))
                .await?;
            info!(
                "[Withdrawal] Reimbursed {} of {} on ledger {}",
                request.amount, id, request.ledger_id
            );
            reimbursed += 1;
            self.metrics.withdrawal_reimbursements.inc();
            self.observe_transition(WithdrawalPhase::Reimbursed);
        }
        if reimbursed > 0 {
            self.observe_in_flight();
        }
        Ok(reimbursed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerError;
    use crate::state::store::MemoryEventLog;
    use crate::state::InitArg;
    use crate::test_utils::{
        gwei, init_arg, native_request, receipt_for, test_store, token_request, MockFinality,
        MockLedger, MockTransactionClient, TEST_PRIVATE_KEY,
    };
    use crate::withdraw::signer::WalletSigner;
    use crate::withdraw::transactions::TransactionStatus;
    use crate::withdraw::{TxFinalizedStatus, WithdrawalStatus};
    use std::time::Duration;

    struct Fixture {
        store: Arc<StateStore>,
        client: Arc<MockTransactionClient>,
        ledger: Arc<MockLedger>,
        finality: Arc<MockFinality>,
        pipeline: WithdrawalPipeline,
    }

    fn fixture(policy: RetryPolicy) -> Fixture {
        let store = test_store();
        let client = Arc::new(MockTransactionClient::new());
        client.set_fee_history(gwei(10), gwei(1));
        let ledger = Arc::new(MockLedger::new());
        let finality = Arc::new(MockFinality::new(1_000));
        let metrics = Arc::new(EngineMetrics::new_for_testing());
        let fees = Arc::new(FeeEstimator::new(
            client.clone(),
            Duration::ZERO,
            U256::zero(),
            metrics.clone(),
        ));
        let signer = Arc::new(WalletSigner::from_private_key(TEST_PRIVATE_KEY).unwrap());
        let pipeline = WithdrawalPipeline::new(
            store.clone(),
            fees,
            client.clone(),
            signer,
            ledger.clone(),
            finality.clone(),
            policy,
            metrics,
        );
        Fixture {
            store,
            client,
            ledger,
            finality,
            pipeline,
        }
    }

    impl Fixture {
        async fn accept(&self, request: WithdrawalRequest) {
            self.store
                .record(EventType::AcceptedWithdrawalRequest(request))
                .await
                .unwrap();
        }

        async fn create_sign_send(&self) {
            self.pipeline.create_transactions_batch().await.unwrap();
            self.pipeline.sign_transactions_batch().await.unwrap();
            self.pipeline.send_transactions_batch().await.unwrap();
        }

        fn entry(&self, id: WithdrawalId) -> WithdrawalEntry {
            self.store.read().withdrawals.get(id).cloned().unwrap()
        }
    }

    #[tokio::test]
    async fn test_nonces_increase_per_sender() {
        let f = fixture(RetryPolicy::default());
        for id in 1..=3 {
            f.accept(native_request(id, U256::exp10(18))).await;
        }
        assert_eq!(f.pipeline.create_transactions_batch().await.unwrap(), 3);
        let nonces: Vec<u64> = (1..=3).map(|id| f.entry(id).nonce().unwrap()).collect();
        assert_eq!(nonces, vec![0, 1, 2]);
        assert_eq!(
            f.store.read().withdrawals.next_nonce(&f.pipeline.sender()),
            3
        );
    }

    #[tokio::test]
    async fn test_nonce_skips_past_transactions_sent_elsewhere() {
        let f = fixture(RetryPolicy::default());
        // The sender key already sent three transactions the log knows nothing about.
        f.client.set_transaction_count(3);
        f.accept(native_request(1, U256::exp10(18))).await;
        f.accept(native_request(2, U256::exp10(18))).await;
        f.create_sign_send().await;
        assert_eq!(f.entry(1).nonce(), Some(3));
        assert_eq!(f.entry(2).nonce(), Some(4));

        for id in [1, 2] {
            let hash = f.entry(id).attempts[0].hash;
            f.client
                .set_receipt(receipt_for(hash, TransactionStatus::Success, 900));
        }
        f.client.set_transaction_count(5);
        assert_eq!(f.pipeline.finalize_transactions_batch().await.unwrap(), 2);
        assert_eq!(f.entry(1).phase, WithdrawalPhase::Finalized);
        assert_eq!(f.entry(2).phase, WithdrawalPhase::Finalized);
    }

    #[tokio::test]
    async fn test_first_nonce_is_seeded_from_init() {
        let f = fixture(RetryPolicy::default());
        let store = Arc::new(
            StateStore::initialize(
                InitArg {
                    next_transaction_nonce: 9,
                    ..init_arg()
                },
                Box::new(MemoryEventLog::new()),
            )
            .unwrap(),
        );
        assert_eq!(
            store.read().withdrawals.next_nonce(&f.pipeline.sender()),
            9
        );
    }

    #[tokio::test]
    async fn test_batch_is_limited() {
        let f = fixture(RetryPolicy::default());
        for id in 1..=(WITHDRAWAL_BATCH_SIZE as u64 + 2) {
            f.accept(native_request(id, U256::exp10(18))).await;
        }
        assert_eq!(
            f.pipeline.create_transactions_batch().await.unwrap(),
            WITHDRAWAL_BATCH_SIZE
        );
        assert_eq!(f.pipeline.create_transactions_batch().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unaffordable_request_is_rescheduled() {
        let f = fixture(RetryPolicy::default());
        f.accept(native_request(1, U256::from(1_000))).await;
        f.accept(native_request(2, U256::exp10(18))).await;
        assert_eq!(f.pipeline.create_transactions_batch().await.unwrap(), 1);
        let state = f.store.read();
        assert_eq!(state.withdrawals.status(1), WithdrawalStatus::Pending);
        assert_eq!(state.withdrawals.queued_requests(5)[0].withdrawal_id, 1);
        assert_eq!(state.withdrawals.get(2).unwrap().nonce(), Some(0));
    }

    #[tokio::test]
    async fn test_token_transaction_calls_transfer() {
        let f = fixture(RetryPolicy::default());
        let request = token_request(1, U256::from(500));
        f.accept(request.clone()).await;
        f.pipeline.create_transactions_batch().await.unwrap();
        let created = f.entry(1).created.unwrap();
        let WithdrawalKind::Token {
            contract_address, ..
        } = request.kind
        else {
            panic!("token request expected");
        };
        assert_eq!(created.destination, contract_address);
        assert!(created.amount.is_zero());
        assert_eq!(&created.data[..4], &id(ERC20_TRANSFER_SIGNATURE)[..]);
        assert_eq!(created.data.len(), 4 + 64);
    }

    #[tokio::test]
    async fn test_signing_is_requested_once_per_withdrawal() {
        let f = fixture(RetryPolicy::default());
        f.accept(native_request(1, U256::exp10(18))).await;
        f.pipeline.create_transactions_batch().await.unwrap();
        assert_eq!(f.pipeline.sign_transactions_batch().await.unwrap(), 1);
        assert_eq!(f.pipeline.sign_transactions_batch().await.unwrap(), 0);
        assert_eq!(f.entry(1).attempts.len(), 1);
        assert_eq!(f.entry(1).phase, WithdrawalPhase::Signed);
    }

    #[tokio::test]
    async fn test_already_known_and_nonce_too_low_count_as_sent() {
        let f = fixture(RetryPolicy::default());
        f.accept(native_request(1, U256::exp10(18))).await;
        f.accept(native_request(2, U256::exp10(18))).await;
        f.client
            .push_send_result(SendRawTransactionResult::AlreadyKnown);
        f.client
            .push_send_result(SendRawTransactionResult::NonceTooLow);
        f.create_sign_send().await;
        assert_eq!(f.entry(1).phase, WithdrawalPhase::Sent);
        assert_eq!(f.entry(2).phase, WithdrawalPhase::Sent);
        assert!(f.store.read().withdrawals.transactions_to_broadcast().is_empty());
    }

    #[tokio::test]
    async fn test_underpriced_broadcast_is_replaced_with_bumped_fee() {
        let f = fixture(RetryPolicy::default());
        f.accept(native_request(1, U256::exp10(18))).await;
        f.client
            .push_send_result(SendRawTransactionResult::Underpriced);
        f.create_sign_send().await;

        let entry = f.entry(1);
        assert_eq!(entry.attempts.len(), 2);
        assert_eq!(entry.phase, WithdrawalPhase::Signed);
        let first = &entry.attempts[0].transaction;
        let second = &entry.attempts[1].transaction;
        assert_eq!(second.nonce, first.nonce);
        assert!(second.max_fee_per_gas * U256::from(10) >= first.max_fee_per_gas * U256::from(11));
        assert!(second.max_priority_fee_per_gas * U256::from(10) >= first.max_priority_fee_per_gas * U256::from(11));
        assert_eq!(
            second.amount,
            U256::exp10(18) - second.max_transaction_fee()
        );

        // The next pass broadcasts the replacement.
        f.pipeline.send_transactions_batch().await.unwrap();
        let entry = f.entry(1);
        assert_eq!(entry.phase, WithdrawalPhase::Sent);
        assert_eq!(
            entry.status(),
            WithdrawalStatus::TxSent {
                transaction_hash: entry.attempts[1].hash
            }
        );
    }

    #[tokio::test]
    async fn test_fees_grow_at_least_ten_percent_per_resubmission() {
        let f = fixture(RetryPolicy::default().with_max_attempts(3));
        f.accept(native_request(1, U256::exp10(18))).await;
        for _ in 0..5 {
            f.client
                .push_send_result(SendRawTransactionResult::OutOfGas);
        }
        f.pipeline.create_transactions_batch().await.unwrap();
        f.pipeline.sign_transactions_batch().await.unwrap();
        for _ in 0..5 {
            f.pipeline.send_transactions_batch().await.unwrap();
        }
        let entry = f.entry(1);
        // One original plus at most three replacements.
        assert_eq!(entry.attempts.len(), 4);
        for pair in entry.attempts.windows(2) {
            let (prev, next) = (&pair[0].transaction, &pair[1].transaction);
            assert_eq!(next.nonce, prev.nonce);
            assert!(next.max_fee_per_gas * U256::from(10) >= prev.max_fee_per_gas * U256::from(11));
        }
    }

    #[tokio::test]
    async fn test_stuck_transaction_is_resubmitted() {
        let f = fixture(RetryPolicy::default());
        f.accept(native_request(1, U256::exp10(18))).await;
        f.create_sign_send().await;
        assert_eq!(f.entry(1).attempts.len(), 1);

        // Base fee jumps past the transaction's max fee.
        f.client.set_fee_history(gwei(100), gwei(1));
        f.client.set_transaction_count(0);
        f.pipeline.send_transactions_batch().await.unwrap();
        let entry = f.entry(1);
        assert_eq!(entry.attempts.len(), 2);
        assert!(entry.latest_broadcast);
        assert!(entry.attempts[1].transaction.max_fee_per_gas >= gwei(201));
    }

    #[tokio::test]
    async fn test_success_receipt_finalizes() {
        let f = fixture(RetryPolicy::default());
        f.accept(native_request(1, U256::exp10(18))).await;
        f.create_sign_send().await;
        let hash = f.entry(1).attempts[0].hash;
        f.client
            .set_receipt(receipt_for(hash, TransactionStatus::Success, 900));

        // Not final yet: the nonce is still open at the final block.
        f.client.set_transaction_count(0);
        assert_eq!(f.pipeline.finalize_transactions_batch().await.unwrap(), 0);

        f.client.set_transaction_count(1);
        assert_eq!(f.pipeline.finalize_transactions_batch().await.unwrap(), 1);
        let entry = f.entry(1);
        assert_eq!(entry.phase, WithdrawalPhase::Finalized);
        assert!(matches!(
            entry.status(),
            WithdrawalStatus::TxFinalized(TxFinalizedStatus::Success { transaction_hash, .. })
                if transaction_hash == hash
        ));
        assert_eq!(f.pipeline.reimburse_withdrawals().await.unwrap(), 0);
        assert_eq!(f.finality.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_receipt_after_max_resubmissions_is_reimbursed_once() {
        let f = fixture(RetryPolicy::default().with_max_attempts(2));
        let amount = U256::exp10(18);
        f.accept(native_request(1, amount)).await;
        for _ in 0..3 {
            f.client
                .push_send_result(SendRawTransactionResult::Underpriced);
        }
        f.pipeline.create_transactions_batch().await.unwrap();
        f.pipeline.sign_transactions_batch().await.unwrap();
        for _ in 0..4 {
            f.pipeline.send_transactions_batch().await.unwrap();
        }
        let entry = f.entry(1);
        assert_eq!(entry.replacements(), 2);
        assert_eq!(entry.phase, WithdrawalPhase::Sent);

        let last = entry.attempts.last().unwrap().hash;
        let receipt = receipt_for(last, TransactionStatus::Failure, 900);
        let fee = receipt.effective_transaction_fee();
        f.client.set_receipt(receipt);
        f.client.set_transaction_count(1);
        f.pipeline.finalize_transactions_batch().await.unwrap();
        assert_eq!(f.entry(1).phase, WithdrawalPhase::PendingReimbursement);

        assert_eq!(f.pipeline.reimburse_withdrawals().await.unwrap(), 1);
        assert_eq!(f.pipeline.reimburse_withdrawals().await.unwrap(), 0);
        let mints = f.ledger.mints();
        assert_eq!(mints.len(), 1);
        assert_eq!(mints[0].amount, amount - fee);
        assert_eq!(mints[0].memo, LedgerMemo::Reimburse(1));

        let state = f.store.read();
        assert_eq!(state.withdrawals.reimbursed().count(), 1);
        let entry = state.withdrawals.get(1).unwrap();
        assert_eq!(entry.phase, WithdrawalPhase::Reimbursed);
        assert!(matches!(
            entry.status(),
            WithdrawalStatus::TxFinalized(TxFinalizedStatus::Reimbursed { reimbursed_amount, .. })
                if reimbursed_amount == amount - fee
        ));
    }

    #[tokio::test]
    async fn test_rejected_reimbursement_is_quarantined() {
        let f = fixture(RetryPolicy::default());
        f.accept(token_request(1, U256::from(500))).await;
        f.create_sign_send().await;
        let hash = f.entry(1).attempts[0].hash;
        f.client
            .set_receipt(receipt_for(hash, TransactionStatus::Failure, 900));
        f.client.set_transaction_count(1);
        f.pipeline.finalize_transactions_batch().await.unwrap();

        f.ledger
            .fail_next_mint(LedgerError::Rejected("ledger is frozen".into()));
        assert_eq!(f.pipeline.reimburse_withdrawals().await.unwrap(), 0);
        let state = f.store.read();
        assert!(state.withdrawals.reimbursement_requests().is_empty());
        assert!(state
            .withdrawals
            .quarantined_reimbursements()
            .contains_key(&1));
        assert_eq!(
            state.withdrawals.get(1).unwrap().phase,
            WithdrawalPhase::PendingReimbursement
        );
    }

    #[tokio::test]
    async fn test_transient_reimbursement_failure_is_retried() {
        let f = fixture(RetryPolicy::default());
        f.accept(native_request(1, U256::exp10(18))).await;
        f.create_sign_send().await;
        let hash = f.entry(1).attempts[0].hash;
        f.client
            .set_receipt(receipt_for(hash, TransactionStatus::Failure, 900));
        f.client.set_transaction_count(1);
        f.pipeline.finalize_transactions_batch().await.unwrap();

        f.ledger
            .fail_next_mint(LedgerError::TemporarilyUnavailable("busy".into()));
        assert_eq!(f.pipeline.reimburse_withdrawals().await.unwrap(), 0);
        assert_eq!(f.pipeline.reimburse_withdrawals().await.unwrap(), 1);
        assert_eq!(f.entry(1).phase, WithdrawalPhase::Reimbursed);
    }
}
