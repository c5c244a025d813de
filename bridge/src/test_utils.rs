// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::events::parser::encode_principal;
use crate::events::{
    NativeDeposit, RawLog, SourceEvent, TokenDeposit, WrappedBurn, WrappedDeployed,
    TOKEN_BURN_TOPIC, WRAPPED_TOKEN_DEPLOYED_TOPIC,
};
use crate::fees::{FeeEstimator, FeeHistory};
use crate::finality::{FinalityChecker, FinalityConfig, FinalityMode, QuorumFinalityChecker};
use crate::ledger::{LedgerClient, LedgerError, LedgerMemo};
use crate::metrics::EngineMetrics;
use crate::mint::MintDispatcher;
use crate::retry::RetryPolicy;
use crate::scheduler::Engine;
use crate::scraper::provider::{LogFilter, LogProvider, ProviderError};
use crate::scraper::quorum::ProviderQuorum;
use crate::scraper::{EventScraper, DEFAULT_MAX_BLOCK_SPREAD};
use crate::state::store::{MemoryEventLog, StateStore};
use crate::state::tokens::{Erc20Token, NativeToken};
use crate::state::InitArg;
use crate::types::{BlockNumber, BlockTag, LedgerAccount, LedgerIndex, LogIndex, Principal};
use crate::withdraw::client::{SendRawTransactionResult, TransactionClient};
use crate::withdraw::intake::WithdrawalIntake;
use crate::withdraw::pipeline::WithdrawalPipeline;
use crate::withdraw::signer::WalletSigner;
use crate::withdraw::transactions::{
    Eip1559Transaction, SignedTransaction, TransactionReceipt, TransactionStatus,
};
use crate::withdraw::{WithdrawalKind, WithdrawalRequest};
use async_trait::async_trait;
use ethers::types::{Address, BlockNumber as EthBlockNumber, Bytes, H160, H256, U256};
use ethers::utils::keccak256;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

/// Well-known throwaway key, never funded on any real chain.
pub const TEST_PRIVATE_KEY: &str =
    "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
pub const TEST_CUSTODY_CONTRACT: Address = H160([0xcc; 20]);
pub const TEST_NATIVE_TRANSFER_FEE: u64 = 10_000;

const TEST_DEPOSITOR: Address = H160([0xf0; 20]);
const TEST_RECIPIENT: Address = H160([0x77; 20]);

pub fn init_for_testing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

pub fn principal_with_id(n: u8) -> Principal {
    Principal::try_from_slice(&[0x0a, 0, 0, 0, 0, 0, 0, 0, n]).unwrap()
}

pub fn address_word(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

fn u256_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

/// Hash of the transaction that emitted every test log of `block`.
pub fn transaction_hash_at(block: BlockNumber) -> H256 {
    H256(keccak256(block.to_be_bytes()))
}

pub fn test_erc20_token() -> Erc20Token {
    Erc20Token {
        ledger_id: principal_with_id(2),
        contract_address: Address::repeat_byte(0x11),
        symbol: "twUSDC".into(),
    }
}

pub fn init_arg() -> InitArg {
    InitArg {
        chain_id: 1,
        custody_contract_address: TEST_CUSTODY_CONTRACT,
        last_scraped_block: 100,
        native: NativeToken {
            ledger_id: principal_with_id(1),
            symbol: "twETH".into(),
            transfer_fee: U256::from(TEST_NATIVE_TRANSFER_FEE),
        },
        minimum_withdrawal_amount: U256::exp10(16),
        withdrawal_fee: None,
        erc20_tokens: vec![test_erc20_token()],
        next_transaction_nonce: 0,
    }
}

pub fn test_store() -> Arc<StateStore> {
    Arc::new(StateStore::initialize(init_arg(), Box::new(MemoryEventLog::new())).unwrap())
}

pub struct LogBuilder {
    block_number: BlockNumber,
    log_index: LogIndex,
    topics: Vec<H256>,
    data: Vec<u8>,
}

impl LogBuilder {
    pub fn new(block_number: BlockNumber, log_index: LogIndex) -> Self {
        Self {
            block_number,
            log_index,
            topics: vec![],
            data: vec![],
        }
    }

    pub fn topics(mut self, topics: Vec<H256>) -> Self {
        self.topics = topics;
        self
    }

    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn build(self) -> RawLog {
        RawLog {
            address: TEST_CUSTODY_CONTRACT,
            topics: self.topics,
            data: Bytes::from(self.data),
            block_hash: Some(H256::from_low_u64_be(self.block_number)),
            block_number: Some(self.block_number),
            transaction_hash: Some(transaction_hash_at(self.block_number)),
            log_index: Some(self.log_index),
            removed: false,
        }
    }
}

/// `TokenBurn` log; the zero token address marks a native deposit.
pub fn token_burn_log(
    block_number: BlockNumber,
    log_index: LogIndex,
    amount: U256,
    principal: Principal,
    token: Address,
) -> RawLog {
    let mut data = u256_word(amount).to_vec();
    data.extend_from_slice(&[0u8; 32]);
    LogBuilder::new(block_number, log_index)
        .topics(vec![
            TOKEN_BURN_TOPIC,
            H256(address_word(TEST_DEPOSITOR)),
            H256(encode_principal(&principal)),
            H256(address_word(token)),
        ])
        .data(data)
        .build()
}

pub fn deployed_log(
    block_number: BlockNumber,
    log_index: LogIndex,
    base_ledger: Principal,
    wrapped: Address,
) -> RawLog {
    LogBuilder::new(block_number, log_index)
        .topics(vec![
            WRAPPED_TOKEN_DEPLOYED_TOPIC,
            H256(encode_principal(&base_ledger)),
            H256(address_word(wrapped)),
        ])
        .build()
}

pub fn native_deposit(block_number: BlockNumber, log_index: LogIndex, value: u64) -> SourceEvent {
    SourceEvent::NativeDeposit(NativeDeposit {
        transaction_hash: transaction_hash_at(block_number),
        block_number,
        log_index,
        from_address: TEST_DEPOSITOR,
        value: U256::from(value),
        principal: principal_with_id(7),
        subaccount: None,
    })
}

pub fn token_deposit(
    block_number: BlockNumber,
    log_index: LogIndex,
    value: u64,
    token_contract_address: Address,
) -> SourceEvent {
    SourceEvent::TokenDeposit(TokenDeposit {
        transaction_hash: transaction_hash_at(block_number),
        block_number,
        log_index,
        from_address: TEST_DEPOSITOR,
        value: U256::from(value),
        principal: principal_with_id(7),
        subaccount: None,
        token_contract_address,
    })
}

pub fn wrapped_deployed(
    block_number: BlockNumber,
    log_index: LogIndex,
    base_ledger: Principal,
    wrapped_contract_address: Address,
) -> SourceEvent {
    SourceEvent::WrappedDeployed(WrappedDeployed {
        transaction_hash: transaction_hash_at(block_number),
        block_number,
        log_index,
        base_ledger,
        wrapped_contract_address,
    })
}

pub fn wrapped_burn(
    block_number: BlockNumber,
    log_index: LogIndex,
    value: u64,
    wrapped_contract_address: Address,
    base_ledger: Principal,
) -> SourceEvent {
    SourceEvent::WrappedBurn(WrappedBurn {
        transaction_hash: transaction_hash_at(block_number),
        block_number,
        log_index,
        from_address: TEST_DEPOSITOR,
        value: U256::from(value),
        principal: principal_with_id(7),
        subaccount: None,
        wrapped_contract_address,
        base_ledger,
    })
}

pub fn native_request(withdrawal_id: u64, amount: impl Into<U256>) -> WithdrawalRequest {
    WithdrawalRequest {
        withdrawal_id,
        kind: WithdrawalKind::Native,
        amount: amount.into(),
        max_transaction_fee: None,
        withdrawal_fee: None,
        destination: TEST_RECIPIENT,
        from: principal_with_id(3).into(),
        created_at: 0,
    }
}

pub fn token_request(withdrawal_id: u64, amount: impl Into<U256>) -> WithdrawalRequest {
    let token = test_erc20_token();
    WithdrawalRequest {
        withdrawal_id,
        kind: WithdrawalKind::Token {
            ledger_id: token.ledger_id,
            contract_address: token.contract_address,
            token_burn_index: withdrawal_id + 1_000,
        },
        amount: amount.into(),
        max_transaction_fee: Some(U256::exp10(17)),
        withdrawal_fee: None,
        destination: TEST_RECIPIENT,
        from: principal_with_id(3).into(),
        created_at: 0,
    }
}

pub fn test_transaction(from: Address, nonce: u64) -> Eip1559Transaction {
    Eip1559Transaction {
        chain_id: 1,
        from,
        nonce,
        max_priority_fee_per_gas: gwei(1),
        max_fee_per_gas: gwei(20),
        gas_limit: U256::from(21_000),
        destination: TEST_RECIPIENT,
        amount: U256::exp10(17),
        data: Bytes::default(),
    }
}

/// Unsigned stand-in for a signed transaction, hashed over its payload.
pub fn signed_for(transaction: Eip1559Transaction) -> SignedTransaction {
    let raw = transaction.to_typed().rlp();
    SignedTransaction {
        hash: H256(keccak256(&raw)),
        transaction,
        raw,
    }
}

pub fn receipt_for(
    transaction_hash: H256,
    status: TransactionStatus,
    block_number: BlockNumber,
) -> TransactionReceipt {
    TransactionReceipt {
        block_hash: H256::repeat_byte(0xbb),
        block_number,
        effective_gas_price: gwei(1),
        gas_used: U256::from(21_000),
        status,
        transaction_hash,
    }
}

#[derive(Default)]
struct MockLogProviderState {
    logs: Vec<RawLog>,
    block_numbers: HashMap<BlockTag, BlockNumber>,
    block_number_failures: VecDeque<ProviderError>,
    get_logs_failures: VecDeque<ProviderError>,
    requested_ranges: Vec<(BlockNumber, BlockNumber)>,
    oversized_block: Option<BlockNumber>,
    delay: Option<Duration>,
}

/// In-memory provider serving the logs added to it.
pub struct MockLogProvider {
    name: String,
    state: Mutex<MockLogProviderState>,
}

impl MockLogProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockLogProviderState::default()),
        }
    }

    pub fn add_log(&self, log: RawLog) {
        self.state.lock().unwrap().logs.push(log);
    }

    pub fn set_block_number(&self, tag: BlockTag, block_number: BlockNumber) {
        self.state
            .lock()
            .unwrap()
            .block_numbers
            .insert(tag, block_number);
    }

    pub fn fail_next_block_number(&self, err: ProviderError) {
        self.state
            .lock()
            .unwrap()
            .block_number_failures
            .push_back(err);
    }

    pub fn fail_next_get_logs(&self, err: ProviderError) {
        self.state.lock().unwrap().get_logs_failures.push_back(err);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    /// Any query covering this block is too large to answer.
    pub fn set_oversized_block(&self, block_number: BlockNumber) {
        self.state.lock().unwrap().oversized_block = Some(block_number);
    }

    pub fn requested_ranges(&self) -> Vec<(BlockNumber, BlockNumber)> {
        self.state.lock().unwrap().requested_ranges.clone()
    }
}

#[async_trait]
impl LogProvider for MockLogProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn block_number(&self, tag: BlockTag) -> Result<BlockNumber, ProviderError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.block_number_failures.pop_front() {
            return Err(err);
        }
        Ok(state.block_numbers.get(&tag).copied().unwrap_or_default())
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ProviderError> {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state
            .requested_ranges
            .push((filter.from_block, filter.to_block));
        if let Some(err) = state.get_logs_failures.pop_front() {
            return Err(err);
        }
        if let Some(oversized) = state.oversized_block {
            if (filter.from_block..=filter.to_block).contains(&oversized) {
                return Err(ProviderError::ResponseTooLarge);
            }
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.address == filter.address
                    && log.topics.first().is_some_and(|t| filter.topics.contains(t))
                    && log
                        .block_number
                        .is_some_and(|n| n >= filter.from_block && n <= filter.to_block)
            })
            .cloned()
            .collect())
    }
}

/// One mint or burn accepted by [`MockLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCall {
    pub ledger: Principal,
    pub account: LedgerAccount,
    pub amount: U256,
    pub memo: LedgerMemo,
}

#[derive(Default)]
struct MockLedgerState {
    next_index: LedgerIndex,
    mints: Vec<LedgerCall>,
    burns: Vec<LedgerCall>,
    settled_memos: HashMap<String, LedgerIndex>,
    mint_failures: VecDeque<LedgerError>,
    burn_failures: HashMap<Principal, LedgerError>,
    transfer_fees: HashMap<Principal, U256>,
    transfer_fee_calls: usize,
}

impl MockLedgerState {
    fn next_index(&mut self) -> LedgerIndex {
        self.next_index += 1;
        self.next_index
    }
}

fn memo_key(memo: &LedgerMemo) -> String {
    serde_json::to_string(memo).unwrap()
}

/// Destination ledger that deduplicates mints by memo.
pub struct MockLedger {
    state: Mutex<MockLedgerState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockLedgerState::default()),
        }
    }

    pub fn mints(&self) -> Vec<LedgerCall> {
        self.state.lock().unwrap().mints.clone()
    }

    pub fn burns(&self) -> Vec<LedgerCall> {
        self.state.lock().unwrap().burns.clone()
    }

    pub fn fail_next_mint(&self, err: LedgerError) {
        self.state.lock().unwrap().mint_failures.push_back(err);
    }

    pub fn fail_next_burn(&self, ledger: Principal, err: LedgerError) {
        self.state.lock().unwrap().burn_failures.insert(ledger, err);
    }

    /// Marks `memo` as already minted without recording a call.
    pub fn settle_memo(&self, memo: LedgerMemo) -> LedgerIndex {
        let mut state = self.state.lock().unwrap();
        let index = state.next_index();
        state.settled_memos.insert(memo_key(&memo), index);
        index
    }

    pub fn set_transfer_fee(&self, ledger: Principal, fee: U256) {
        self.state.lock().unwrap().transfer_fees.insert(ledger, fee);
    }

    pub fn transfer_fee_calls(&self) -> usize {
        self.state.lock().unwrap().transfer_fee_calls
    }

    /// Minted minus burned on `ledger`.
    pub fn supply(&self, ledger: Principal) -> U256 {
        let state = self.state.lock().unwrap();
        let sum = |calls: &[LedgerCall]| {
            calls
                .iter()
                .filter(|call| call.ledger == ledger)
                .fold(U256::zero(), |acc, call| acc + call.amount)
        };
        sum(&state.mints) - sum(&state.burns)
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn transfer_fee(&self, ledger: Principal) -> Result<U256, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.transfer_fee_calls += 1;
        Ok(state.transfer_fees.get(&ledger).copied().unwrap_or_default())
    }

    async fn mint(
        &self,
        ledger: Principal,
        to: LedgerAccount,
        amount: U256,
        memo: LedgerMemo,
    ) -> Result<LedgerIndex, LedgerError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.mint_failures.pop_front() {
            return Err(err);
        }
        let key = memo_key(&memo);
        if let Some(duplicate_of) = state.settled_memos.get(&key) {
            return Err(LedgerError::Duplicate {
                duplicate_of: *duplicate_of,
            });
        }
        let index = state.next_index();
        state.settled_memos.insert(key, index);
        state.mints.push(LedgerCall {
            ledger,
            account: to,
            amount,
            memo,
        });
        Ok(index)
    }

    async fn burn(
        &self,
        ledger: Principal,
        from: LedgerAccount,
        amount: U256,
        memo: LedgerMemo,
    ) -> Result<LedgerIndex, LedgerError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.burn_failures.remove(&ledger) {
            return Err(err);
        }
        let index = state.next_index();
        state.burns.push(LedgerCall {
            ledger,
            account: from,
            amount,
            memo,
        });
        Ok(index)
    }
}

#[derive(Default)]
struct MockTransactionClientState {
    fee_history: Option<FeeHistory>,
    fee_history_calls: usize,
    fee_history_failures: usize,
    send_results: VecDeque<SendRawTransactionResult>,
    sent: Vec<Bytes>,
    transaction_count: u64,
    receipts: HashMap<H256, TransactionReceipt>,
}

pub struct MockTransactionClient {
    state: Mutex<MockTransactionClientState>,
}

impl MockTransactionClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockTransactionClientState::default()),
        }
    }

    /// Every sampled block has `base_fee` and tips `priority_fee`.
    pub fn set_fee_history(&self, base_fee: U256, priority_fee: U256) {
        self.state.lock().unwrap().fee_history = Some(FeeHistory {
            oldest_block: 0,
            base_fee_per_gas: vec![base_fee; 2],
            reward: vec![vec![priority_fee]],
        });
    }

    pub fn fee_history_calls(&self) -> usize {
        self.state.lock().unwrap().fee_history_calls
    }

    pub fn fail_next_fee_history(&self) {
        self.state.lock().unwrap().fee_history_failures += 1;
    }

    /// Results of upcoming broadcasts, in order; `Ok` once exhausted.
    pub fn push_send_result(&self, result: SendRawTransactionResult) {
        self.state.lock().unwrap().send_results.push_back(result);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn set_transaction_count(&self, count: u64) {
        self.state.lock().unwrap().transaction_count = count;
    }

    pub fn set_receipt(&self, receipt: TransactionReceipt) {
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(receipt.transaction_hash, receipt);
    }
}

#[async_trait]
impl TransactionClient for MockTransactionClient {
    async fn fee_history(
        &self,
        block_count: u64,
        _newest_block: EthBlockNumber,
        _reward_percentiles: &[f64],
    ) -> Result<FeeHistory, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.fee_history_calls += 1;
        if state.fee_history_failures > 0 {
            state.fee_history_failures -= 1;
            return Err(ProviderError::Transport("fee history unavailable".into()));
        }
        let history = state
            .fee_history
            .clone()
            .ok_or_else(|| ProviderError::InvalidResponse("no fee history".into()))?;
        let blocks = block_count.max(1) as usize;
        Ok(FeeHistory {
            oldest_block: history.oldest_block,
            base_fee_per_gas: vec![history.base_fee_per_gas[0]; blocks + 1],
            reward: vec![history.reward[0].clone(); blocks],
        })
    }

    async fn transaction_count(
        &self,
        _address: Address,
        _block: EthBlockNumber,
    ) -> Result<u64, ProviderError> {
        Ok(self.state.lock().unwrap().transaction_count)
    }

    async fn send_raw_transaction(
        &self,
        raw: &Bytes,
    ) -> Result<SendRawTransactionResult, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(raw.clone());
        Ok(state
            .send_results
            .pop_front()
            .unwrap_or(SendRawTransactionResult::Ok))
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ProviderError> {
        Ok(self.state.lock().unwrap().receipts.get(&hash).cloned())
    }
}

/// Finality pinned to a fixed block.
pub struct MockFinality {
    block: BlockNumber,
    calls: AtomicUsize,
}

impl MockFinality {
    pub fn new(block: BlockNumber) -> Self {
        Self {
            block,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FinalityChecker for MockFinality {
    async fn finalized_block(&self) -> Result<BlockNumber, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.block)
    }
}

/// A fully wired engine over mocks: two agreeing providers, one ledger and
/// one destination-chain client.
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub ledger: Arc<MockLedger>,
    pub client: Arc<MockTransactionClient>,
    pub providers: Vec<Arc<MockLogProvider>>,
}

impl TestEngine {
    pub fn start_block(&self) -> BlockNumber {
        init_arg().last_scraped_block
    }

    pub fn native_transfer_fee(&self) -> U256 {
        self.engine.store().read().tokens.native.transfer_fee
    }

    pub fn add_log(&self, log: RawLog) {
        for provider in &self.providers {
            provider.add_log(log.clone());
        }
    }

    pub fn finalize(&self, block: BlockNumber) {
        for provider in &self.providers {
            provider.set_block_number(BlockTag::Finalized, block);
        }
    }
}

pub fn test_engine() -> TestEngine {
    let store = test_store();
    let metrics = Arc::new(EngineMetrics::new_for_testing());
    let start = init_arg().last_scraped_block;
    let providers = vec![
        Arc::new(MockLogProvider::new("a")),
        Arc::new(MockLogProvider::new("b")),
    ];
    for provider in &providers {
        for tag in [BlockTag::Latest, BlockTag::Safe, BlockTag::Finalized] {
            provider.set_block_number(tag, start);
        }
    }
    let quorum = Arc::new(
        ProviderQuorum::new(
            providers
                .iter()
                .map(|p| p.clone() as Arc<dyn LogProvider>)
                .collect(),
            Duration::from_secs(1),
            metrics.clone(),
        )
        .unwrap(),
    );
    let finality: Arc<dyn FinalityChecker> = Arc::new(QuorumFinalityChecker::new(
        quorum.clone(),
        FinalityConfig::default()
            .with_mode(FinalityMode::Native)
            .with_cache_duration(0),
    ));

    let ledger = Arc::new(MockLedger::new());
    let client = Arc::new(MockTransactionClient::new());
    client.set_fee_history(gwei(10), gwei(1));
    let fees = Arc::new(FeeEstimator::new(
        client.clone(),
        Duration::ZERO,
        U256::zero(),
        metrics.clone(),
    ));
    let signer = Arc::new(WalletSigner::from_private_key(TEST_PRIVATE_KEY).unwrap());
    let policy = RetryPolicy::default().with_backoff(Duration::ZERO, Duration::ZERO);

    let scraper = EventScraper::new(
        store.clone(),
        quorum,
        finality.clone(),
        TEST_CUSTODY_CONTRACT,
        DEFAULT_MAX_BLOCK_SPREAD,
        metrics.clone(),
    );
    let minter = MintDispatcher::new(store.clone(), ledger.clone(), policy, metrics.clone());
    let intake = WithdrawalIntake::new(store.clone(), ledger.clone(), fees.clone(), metrics.clone());
    let pipeline = WithdrawalPipeline::new(
        store.clone(),
        fees.clone(),
        client.clone(),
        signer,
        ledger.clone(),
        finality,
        policy,
        metrics.clone(),
    );
    let engine = Arc::new(Engine::new(
        store, scraper, minter, intake, pipeline, fees, metrics,
    ));
    TestEngine {
        engine,
        ledger,
        client,
        providers,
    }
}
