// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Resolves parsed events against the token registry.

use super::{SourceEvent, WrappedBurn};
use crate::state::tokens::TokenRegistry;
use crate::types::EventSource;
use ethers::types::U256;

pub const UNSUPPORTED_TOKEN: &str = "unsupported token";
pub const FEE_NOT_COVERED: &str = "deposit amount does not cover the ledger transfer fee";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Ready to mint, release, or register.
    Accepted(SourceEvent),
    /// Terminal rejection.
    Invalid { source: EventSource, reason: String },
    /// Valid, but waiting for a registry change.
    Quarantined { event: SourceEvent, reason: String },
}

pub fn classify(event: SourceEvent, registry: &TokenRegistry) -> Classification {
    let invalid = |event: &SourceEvent, reason: &str| Classification::Invalid {
        source: event.source(),
        reason: reason.to_string(),
    };
    if event.value().is_some_and(|value| value.is_zero()) {
        return invalid(&event, "amount must be greater than zero");
    }

    match event {
        SourceEvent::NativeDeposit(ref deposit) => {
            if deposit.value <= registry.native.transfer_fee {
                return invalid(&event, FEE_NOT_COVERED);
            }
            Classification::Accepted(event)
        }
        SourceEvent::TokenDeposit(deposit) => {
            if registry
                .erc20_by_address(&deposit.token_contract_address)
                .is_some()
            {
                return Classification::Accepted(SourceEvent::TokenDeposit(deposit));
            }
            match registry.wrapped_by_address(&deposit.token_contract_address) {
                Some(wrapped) => Classification::Accepted(SourceEvent::WrappedBurn(WrappedBurn {
                    transaction_hash: deposit.transaction_hash,
                    block_number: deposit.block_number,
                    log_index: deposit.log_index,
                    from_address: deposit.from_address,
                    value: deposit.value,
                    principal: deposit.principal,
                    subaccount: deposit.subaccount,
                    wrapped_contract_address: deposit.token_contract_address,
                    base_ledger: wrapped.base_ledger,
                })),
                None => Classification::Quarantined {
                    event: SourceEvent::TokenDeposit(deposit),
                    reason: UNSUPPORTED_TOKEN.to_string(),
                },
            }
        }
        SourceEvent::WrappedBurn(ref burn) => {
            if registry
                .wrapped_by_address(&burn.wrapped_contract_address)
                .is_some_and(|w| w.base_ledger == burn.base_ledger)
            {
                Classification::Accepted(event)
            } else {
                Classification::Quarantined {
                    reason: UNSUPPORTED_TOKEN.to_string(),
                    event,
                }
            }
        }
        SourceEvent::WrappedDeployed(ref deployed) => {
            match registry.check_wrapped(&deployed.base_ledger, &deployed.wrapped_contract_address)
            {
                Ok(()) => Classification::Accepted(event),
                Err(e) => invalid(&event, &format!("wrapped token deployment rejected: {e}")),
            }
        }
    }
}

/// Amount credited on the destination ledger for an accepted native deposit.
pub fn native_mint_amount(value: U256, transfer_fee: U256) -> U256 {
    value.saturating_sub(transfer_fee)
}
