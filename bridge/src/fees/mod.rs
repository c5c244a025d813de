// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! EIP-1559 fee arithmetic.

pub mod estimator;

use crate::error::{BridgeError, BridgeResult};
use crate::retry::RetryPolicy;
use crate::types::BlockNumber;
use ethers::types::U256;
use serde::{Deserialize, Serialize};

pub use estimator::FeeEstimator;

/// Blocks of history sampled per estimate.
pub const FEE_HISTORY_BLOCK_COUNT: u64 = 5;
/// Percentile of priority fee rewards sampled per block.
pub const FEE_HISTORY_REWARD_PERCENTILE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasFeeEstimate {
    pub base_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl GasFeeEstimate {
    /// `2 * base_fee + priority_fee`: survives several full blocks of base fee growth.
    pub fn max_fee_per_gas(&self) -> U256 {
        self.base_fee_per_gas
            .saturating_mul(U256::from(2))
            .saturating_add(self.max_priority_fee_per_gas)
    }

    /// Lowest max fee a transaction needs to be includable right now.
    pub fn min_max_fee_per_gas(&self) -> U256 {
        self.base_fee_per_gas
            .saturating_add(self.max_priority_fee_per_gas)
    }

    pub fn to_price(&self, gas_limit: U256) -> TransactionPrice {
        TransactionPrice {
            gas_limit,
            max_fee_per_gas: self.max_fee_per_gas(),
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPrice {
    pub gas_limit: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl TransactionPrice {
    pub fn max_transaction_fee(&self) -> U256 {
        self.max_fee_per_gas.saturating_mul(self.gas_limit)
    }

    /// Price for a same-nonce replacement: both fee fields bumped, and never
    /// below what the fresh estimate asks for.
    pub fn resubmit(&self, fresh: &GasFeeEstimate, policy: &RetryPolicy) -> TransactionPrice {
        TransactionPrice {
            gas_limit: self.gas_limit,
            max_fee_per_gas: policy
                .bump(self.max_fee_per_gas)
                .max(fresh.max_fee_per_gas()),
            max_priority_fee_per_gas: policy
                .bump(self.max_priority_fee_per_gas)
                .max(fresh.max_priority_fee_per_gas),
        }
    }

    /// Whether a transaction at this price can still be included given `fresh`.
    pub fn is_sufficient(&self, fresh: &GasFeeEstimate) -> bool {
        self.max_fee_per_gas >= fresh.min_max_fee_per_gas()
    }
}

/// Response of `eth_feeHistory`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeeHistory {
    pub oldest_block: BlockNumber,
    /// One entry per sampled block plus the next block
    pub base_fee_per_gas: Vec<U256>,
    /// Per block, one reward per requested percentile
    pub reward: Vec<Vec<U256>>,
}

pub fn estimate_from_fee_history(
    history: &FeeHistory,
    min_priority_fee: U256,
) -> BridgeResult<GasFeeEstimate> {
    let base_fee_per_gas = *history.base_fee_per_gas.last().ok_or_else(|| {
        BridgeError::FeeEstimateUnavailable("fee history has no base fee".to_string())
    })?;
    let mut rewards: Vec<U256> = history
        .reward
        .iter()
        .filter_map(|per_block| per_block.first().copied())
        .collect();
    if rewards.is_empty() {
        return Err(BridgeError::FeeEstimateUnavailable(
            "fee history has no rewards".to_string(),
        ));
    }
    rewards.sort();
    let median = rewards[rewards.len() / 2];
    Ok(GasFeeEstimate {
        base_fee_per_gas,
        max_priority_fee_per_gas: median.max(min_priority_fee),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    #[test]
    fn test_max_fee_is_twice_base_plus_priority() {
        let estimate = GasFeeEstimate {
            base_fee_per_gas: gwei(30),
            max_priority_fee_per_gas: gwei(2),
        };
        assert_eq!(estimate.max_fee_per_gas(), gwei(62));
        assert_eq!(estimate.min_max_fee_per_gas(), gwei(32));
        let price = estimate.to_price(U256::from(21_000));
        assert_eq!(price.max_transaction_fee(), gwei(62) * U256::from(21_000));
    }

    #[test]
    fn test_estimate_uses_last_base_fee_and_median_reward() {
        let history = FeeHistory {
            oldest_block: 100,
            base_fee_per_gas: vec![gwei(10), gwei(11), gwei(12)],
            reward: vec![vec![gwei(3)], vec![gwei(1)], vec![gwei(2)]],
        };
        let estimate = estimate_from_fee_history(&history, U256::zero()).unwrap();
        assert_eq!(estimate.base_fee_per_gas, gwei(12));
        assert_eq!(estimate.max_priority_fee_per_gas, gwei(2));

        let floored = estimate_from_fee_history(&history, gwei(5)).unwrap();
        assert_eq!(floored.max_priority_fee_per_gas, gwei(5));
    }

    #[test]
    fn test_empty_history_is_unavailable() {
        let err = estimate_from_fee_history(&FeeHistory::default(), U256::zero()).unwrap_err();
        assert_eq!(err.error_type(), "fee_estimate_unavailable");
        let history = FeeHistory {
            oldest_block: 1,
            base_fee_per_gas: vec![gwei(1)],
            reward: vec![],
        };
        assert!(estimate_from_fee_history(&history, U256::zero()).is_err());
    }

    #[test]
    fn test_resubmit_bumps_at_least_ten_percent() {
        let policy = RetryPolicy::default();
        let price = TransactionPrice {
            gas_limit: U256::from(21_000),
            max_fee_per_gas: gwei(100),
            max_priority_fee_per_gas: gwei(2),
        };
        let low = GasFeeEstimate {
            base_fee_per_gas: gwei(1),
            max_priority_fee_per_gas: gwei(1),
        };
        let next = price.resubmit(&low, &policy);
        assert_eq!(next.max_fee_per_gas, gwei(110));
        assert_eq!(next.max_priority_fee_per_gas, gwei(2) * U256::from(11) / U256::from(10));
        assert_eq!(next.gas_limit, price.gas_limit);

        let high = GasFeeEstimate {
            base_fee_per_gas: gwei(80),
            max_priority_fee_per_gas: gwei(5),
        };
        let next = price.resubmit(&high, &policy);
        assert_eq!(next.max_fee_per_gas, gwei(165));
        assert_eq!(next.max_priority_fee_per_gas, gwei(5));
    }

    #[test]
    fn test_is_sufficient() {
        let price = TransactionPrice {
            gas_limit: U256::from(21_000),
            max_fee_per_gas: gwei(50),
            max_priority_fee_per_gas: gwei(2),
        };
        let estimate = |base| GasFeeEstimate {
            base_fee_per_gas: gwei(base),
            max_priority_fee_per_gas: gwei(2),
        };
        assert!(price.is_sufficient(&estimate(48)));
        assert!(!price.is_sufficient(&estimate(49)));
    }
}
