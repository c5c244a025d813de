// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::transactions::{Eip1559Transaction, SignedTransaction};
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256};
use ethers::utils::keccak256;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("transaction sender {sender:?} does not match signer {signer:?}")]
    WrongSender { sender: Address, signer: Address },
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Signs destination-chain transactions for the engine's sender address.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign(&self, transaction: &Eip1559Transaction) -> Result<SignedTransaction, SignerError>;
}

pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    pub fn from_private_key(private_key_hex: &str) -> Result<Self, SignerError> {
        let wallet = LocalWallet::from_str(private_key_hex.trim_start_matches("0x"))
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self::new(wallet))
    }
}

#[async_trait]
impl TransactionSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign(&self, transaction: &Eip1559Transaction) -> Result<SignedTransaction, SignerError> {
        if transaction.from != self.wallet.address() {
            return Err(SignerError::WrongSender {
                sender: transaction.from,
                signer: self.wallet.address(),
            });
        }
        let typed = transaction.to_typed();
        let signature = self
            .wallet
            .sign_transaction_sync(&typed)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        let raw = typed.rlp_signed(&signature);
        Ok(SignedTransaction {
            transaction: transaction.clone(),
            hash: H256::from(keccak256(&raw)),
            raw,
        })
    }
}
