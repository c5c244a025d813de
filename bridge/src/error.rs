// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::ledger::LedgerError;
use crate::scraper::provider::ProviderError;
use crate::state::store::StoreError;
use crate::withdraw::signer::SignerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    // Provider call failed but is expected to succeed on retry
    TransientProviderError(String),
    // Provider call failed in a way retrying will not fix
    ProviderError(String),
    // Providers returned different answers for the same query
    ProviderDisagreement(String),
    // Ledger temporarily unavailable
    TransientLedgerError(String),
    // Ledger rejected the operation
    LedgerError(String),
    // Signing request failed
    SignerError(String),
    // No usable fee estimate
    FeeEstimateUnavailable(String),
    // Token is not registered
    UnsupportedToken(String),
    // An audit event does not apply to the current state
    InvalidStateTransition(String),
    // The audit log cannot be replayed
    InvalidReplay(String),
    // Audit log persistence failed
    StorageError(String),
    // Internal engine error
    InternalError(String),
    // Uncategorized error
    Generic(String),
}

impl BridgeError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::TransientProviderError(_) => "transient_provider_error",
            BridgeError::ProviderError(_) => "provider_error",
            BridgeError::ProviderDisagreement(_) => "provider_disagreement",
            BridgeError::TransientLedgerError(_) => "transient_ledger_error",
            BridgeError::LedgerError(_) => "ledger_error",
            BridgeError::SignerError(_) => "signer_error",
            BridgeError::FeeEstimateUnavailable(_) => "fee_estimate_unavailable",
            BridgeError::UnsupportedToken(_) => "unsupported_token",
            BridgeError::InvalidStateTransition(_) => "invalid_state_transition",
            BridgeError::InvalidReplay(_) => "invalid_replay",
            BridgeError::StorageError(_) => "storage_error",
            BridgeError::InternalError(_) => "internal_error",
            BridgeError::Generic(_) => "generic",
        }
    }

    /// Errors after which the same step can simply run again on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::TransientProviderError(_)
                | BridgeError::ProviderDisagreement(_)
                | BridgeError::TransientLedgerError(_)
                | BridgeError::FeeEstimateUnavailable(_)
                | BridgeError::SignerError(_)
        )
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for BridgeError {}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl From<ProviderError> for BridgeError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Disagreement(msg) => BridgeError::ProviderDisagreement(msg),
            e if e.is_recoverable() => BridgeError::TransientProviderError(e.to_string()),
            e => BridgeError::ProviderError(e.to_string()),
        }
    }
}

impl From<LedgerError> for BridgeError {
    fn from(err: LedgerError) -> Self {
        if err.is_transient() {
            BridgeError::TransientLedgerError(err.to_string())
        } else {
            BridgeError::LedgerError(err.to_string())
        }
    }
}

impl From<SignerError> for BridgeError {
    fn from(err: SignerError) -> Self {
        BridgeError::SignerError(err.to_string())
    }
}

impl From<StoreError> for BridgeError {
    fn from(err: StoreError) -> Self {
        BridgeError::StorageError(err.to_string())
    }
}
