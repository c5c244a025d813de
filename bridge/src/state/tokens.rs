// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Registry of the assets the engine can mint, release and withdraw.

use crate::types::Principal;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NativeToken {
    pub ledger_id: Principal,
    pub symbol: String,
    /// Fee charged by the native ledger on every transfer
    pub transfer_fee: U256,
}

/// A fungible token custodied by the contract and twinned on its own ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Erc20Token {
    pub ledger_id: Principal,
    pub contract_address: Address,
    pub symbol: String,
}

/// A source-chain contract mirroring a destination-ledger token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedToken {
    pub base_ledger: Principal,
    pub wrapped_contract_address: Address,
    /// Transfer fee of the base ledger, once fetched
    pub transfer_fee: Option<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("contract {0:#x} is already registered")]
    DuplicateContract(Address),
    #[error("ledger {0} is already registered")]
    DuplicateLedger(Principal),
    #[error("the zero address is reserved for the native token")]
    NativeMarker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRegistry {
    pub native: NativeToken,
    erc20: BTreeMap<Address, Erc20Token>,
    wrapped: BTreeMap<Address, WrappedToken>,
}

impl TokenRegistry {
    pub fn new(native: NativeToken) -> Self {
        Self {
            native,
            erc20: BTreeMap::new(),
            wrapped: BTreeMap::new(),
        }
    }

    pub fn erc20_by_address(&self, address: &Address) -> Option<&Erc20Token> {
        self.erc20.get(address)
    }

    pub fn erc20_by_ledger(&self, ledger_id: &Principal) -> Option<&Erc20Token> {
        self.erc20.values().find(|t| &t.ledger_id == ledger_id)
    }

    pub fn wrapped_by_address(&self, address: &Address) -> Option<&WrappedToken> {
        self.wrapped.get(address)
    }

    pub fn wrapped_by_base(&self, base_ledger: &Principal) -> Option<&WrappedToken> {
        self.wrapped.values().find(|t| &t.base_ledger == base_ledger)
    }

    pub fn erc20_tokens(&self) -> impl Iterator<Item = &Erc20Token> {
        self.erc20.values()
    }

    pub fn wrapped_tokens(&self) -> impl Iterator<Item = &WrappedToken> {
        self.wrapped.values()
    }

    fn ensure_free(&self, address: &Address) -> Result<(), RegistryError> {
        if address.is_zero() {
            return Err(RegistryError::NativeMarker);
        }
        if self.erc20.contains_key(address) || self.wrapped.contains_key(address) {
            return Err(RegistryError::DuplicateContract(*address));
        }
        Ok(())
    }

    pub fn check_erc20(&self, token: &Erc20Token) -> Result<(), RegistryError> {
        self.ensure_free(&token.contract_address)?;
        if token.ledger_id == self.native.ledger_id || self.erc20_by_ledger(&token.ledger_id).is_some()
        {
            return Err(RegistryError::DuplicateLedger(token.ledger_id));
        }
        Ok(())
    }

    pub fn add_erc20(&mut self, token: Erc20Token) -> Result<(), RegistryError> {
        self.check_erc20(&token)?;
        self.erc20.insert(token.contract_address, token);
        Ok(())
    }

    pub fn check_wrapped(
        &self,
        base_ledger: &Principal,
        wrapped_contract_address: &Address,
    ) -> Result<(), RegistryError> {
        self.ensure_free(wrapped_contract_address)?;
        if self.wrapped_by_base(base_ledger).is_some() {
            return Err(RegistryError::DuplicateLedger(*base_ledger));
        }
        Ok(())
    }

    pub fn add_wrapped(
        &mut self,
        base_ledger: Principal,
        wrapped_contract_address: Address,
    ) -> Result<(), RegistryError> {
        self.check_wrapped(&base_ledger, &wrapped_contract_address)?;
        self.wrapped.insert(
            wrapped_contract_address,
            WrappedToken {
                base_ledger,
                wrapped_contract_address,
                transfer_fee: None,
            },
        );
        Ok(())
    }

    pub fn set_wrapped_transfer_fee(&mut self, wrapped_contract_address: &Address, fee: U256) {
        if let Some(token) = self.wrapped.get_mut(wrapped_contract_address) {
            token.transfer_fee = Some(fee);
        }
    }

    /// Ledger and symbol an asset withdrawal or deposit settles on.
    pub fn symbol_of(&self, contract_address: &Address) -> Option<String> {
        if contract_address.is_zero() {
            return Some(self.native.symbol.clone());
        }
        self.erc20
            .get(contract_address)
            .map(|t| t.symbol.clone())
            .or_else(|| {
                self.wrapped
                    .get(contract_address)
                    .map(|t| format!("w{}", t.base_ledger))
            })
    }
}
