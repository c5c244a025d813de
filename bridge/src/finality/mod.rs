// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Finality policy for the source chain.
//!
//! A block is acted on only once every configured provider reports it final:
//!
//! 1. **Native mode**: each provider's `finalized` (or `safe`) block tag
//! 2. **Block counting mode**: each provider's `latest` minus confirmation blocks
//!
//! The agreed value is the minimum across providers and is cached for a few
//! seconds to limit RPC traffic.

mod checker;
mod config;

pub use checker::{FinalityChecker, QuorumFinalityChecker};
pub use config::{FinalityConfig, FinalityMode};
