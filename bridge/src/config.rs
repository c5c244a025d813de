// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::finality::FinalityConfig;
use crate::retry::{RetryPolicy, MIN_BUMP_PERCENT};
use crate::scraper::DEFAULT_MAX_BLOCK_SPREAD;
use crate::state::tokens::{Erc20Token, NativeToken};
use crate::state::InitArg;
use crate::types::{BlockNumber, Principal};
use anyhow::{anyhow, Context};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use twin_bridge_config::Config;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceChainConfig {
    pub chain_id: u64,
    // Every provider must agree on logs before they are acted on.
    pub rpc_urls: Vec<String>,
    pub custody_contract_address: Address,
    // Scraping starts after this block.
    pub first_block: BlockNumber,
    #[serde(default)]
    pub finality: FinalityConfig,
    #[serde(default = "default_max_block_spread")]
    pub max_block_spread: u64,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_fee_staleness_secs")]
    pub fee_staleness_secs: u64,
    #[serde(default = "default_min_max_priority_fee_per_gas")]
    pub min_max_priority_fee_per_gas: U256,
}

fn default_max_block_spread() -> u64 {
    DEFAULT_MAX_BLOCK_SPREAD
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn default_fee_staleness_secs() -> u64 {
    10
}

fn default_min_max_priority_fee_per_gas() -> U256 {
    // 1.5 gwei
    U256::from(1_500_000_000u64)
}

impl SourceChainConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn fee_staleness(&self) -> Duration {
        Duration::from_secs(self.fee_staleness_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LedgerConfig {
    pub url: String,
    #[serde(default = "default_ledger_timeout_secs")]
    pub timeout_secs: u64,
    pub native_ledger_id: Principal,
    pub native_symbol: String,
    pub native_transfer_fee: U256,
    pub minimum_withdrawal_amount: U256,
    #[serde(default)]
    pub withdrawal_fee: Option<U256>,
}

fn default_ledger_timeout_secs() -> u64 {
    10
}

impl LedgerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SignerConfig {
    // File holding the hex encoded private key of the withdrawal sender.
    pub private_key_path: PathBuf,
    // Nonce of the sender's next transaction when the audit log is created.
    // The engine still skips ahead if the chain reports a higher count.
    #[serde(default)]
    pub next_transaction_nonce: u64,
}

impl SignerConfig {
    pub fn read_private_key(&self) -> anyhow::Result<String> {
        let key = std::fs::read_to_string(&self.private_key_path).with_context(|| {
            format!(
                "failed to read signer key from {}",
                self.private_key_path.display()
            )
        })?;
        Ok(key.trim().to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerConfig {
    #[serde(default = "default_scrape_interval_secs")]
    pub scrape_interval_secs: u64,
    #[serde(default = "default_mint_interval_secs")]
    pub mint_interval_secs: u64,
    #[serde(default = "default_withdrawal_interval_secs")]
    pub withdrawal_interval_secs: u64,
    #[serde(default = "default_fee_refresh_interval_secs")]
    pub fee_refresh_interval_secs: u64,
}

fn default_scrape_interval_secs() -> u64 {
    60
}

fn default_mint_interval_secs() -> u64 {
    10
}

fn default_withdrawal_interval_secs() -> u64 {
    30
}

fn default_fee_refresh_interval_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scrape_interval_secs: default_scrape_interval_secs(),
            mint_interval_secs: default_mint_interval_secs(),
            withdrawal_interval_secs: default_withdrawal_interval_secs(),
            fee_refresh_interval_secs: default_fee_refresh_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_scrape_interval(mut self, secs: u64) -> Self {
        self.scrape_interval_secs = secs;
        self
    }

    pub fn with_withdrawal_interval(mut self, secs: u64) -> Self {
        self.withdrawal_interval_secs = secs;
        self
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs.max(1))
    }

    pub fn mint_interval(&self) -> Duration {
        Duration::from_secs(self.mint_interval_secs.max(1))
    }

    pub fn withdrawal_interval(&self) -> Duration {
        Duration::from_secs(self.withdrawal_interval_secs.max(1))
    }

    pub fn fee_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.fee_refresh_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StateConfig {
    // Append-only JSON lines audit log; replayed on start.
    pub log_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineNodeConfig {
    // The port that the server listens on.
    pub server_listen_port: u16,
    // The port for the metrics server.
    pub metrics_port: u16,
    pub source_chain: SourceChainConfig,
    pub ledger: LedgerConfig,
    pub signer: SignerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub state: StateConfig,
    #[serde(default)]
    pub tokens: Vec<Erc20Token>,
}

impl Config for EngineNodeConfig {}

impl EngineNodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        info!("Starting config validation");
        let urls: HashSet<&String> = self.source_chain.rpc_urls.iter().collect();
        if urls.len() < 2 {
            return Err(anyhow!(
                "at least two distinct RPC urls are required, got {}",
                urls.len()
            ));
        }
        if self.source_chain.custody_contract_address.is_zero() {
            return Err(anyhow!("custody contract address must not be zero"));
        }
        if self.source_chain.max_block_spread == 0 {
            return Err(anyhow!("max-block-spread must be positive"));
        }
        if self.ledger.minimum_withdrawal_amount < self.ledger.native_transfer_fee {
            return Err(anyhow!(
                "minimum withdrawal amount {} is below the ledger transfer fee {}",
                self.ledger.minimum_withdrawal_amount,
                self.ledger.native_transfer_fee
            ));
        }
        if self.retry.bump_percent < MIN_BUMP_PERCENT {
            return Err(anyhow!(
                "bump-percent must be at least {}, got {}",
                MIN_BUMP_PERCENT,
                self.retry.bump_percent
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("max-attempts must be positive"));
        }
        for token in &self.tokens {
            if token.contract_address.is_zero() {
                return Err(anyhow!(
                    "token {} uses the native marker address",
                    token.symbol
                ));
            }
        }
        info!("Config validation complete");
        Ok(())
    }

    /// The `Init` parameters for a fresh audit log.
    pub fn to_init_arg(&self) -> InitArg {
        InitArg {
            chain_id: self.source_chain.chain_id,
            custody_contract_address: self.source_chain.custody_contract_address,
            last_scraped_block: self.source_chain.first_block,
            native: NativeToken {
                ledger_id: self.ledger.native_ledger_id,
                symbol: self.ledger.native_symbol.clone(),
                transfer_fee: self.ledger.native_transfer_fee,
            },
            minimum_withdrawal_amount: self.ledger.minimum_withdrawal_amount,
            withdrawal_fee: self.ledger.withdrawal_fee,
            erc20_tokens: self.tokens.clone(),
            next_transaction_nonce: self.signer.next_transaction_nonce,
        }
    }
}
