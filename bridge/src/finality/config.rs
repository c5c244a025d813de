// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::types::BlockTag;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinalityMode {
    /// Trust the provider's `finalized` or `safe` tag.
    #[default]
    Native,
    /// `latest` minus a fixed number of confirmations.
    BlockCounting,
}

/// When a source-chain block is final enough for deposits to be minted and
/// withdrawals to be settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FinalityConfig {
    #[serde(default)]
    pub mode: FinalityMode,
    // Only read in native mode.
    #[serde(default = "default_tag")]
    pub tag: BlockTag,
    // Only read in block counting mode.
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    // Seconds an agreed final block number is reused before asking again.
    #[serde(default = "default_cache_duration_secs")]
    pub cache_duration_secs: u64,
}

fn default_tag() -> BlockTag {
    BlockTag::Finalized
}

fn default_confirmation_blocks() -> u64 {
    12
}

fn default_cache_duration_secs() -> u64 {
    10
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self {
            mode: FinalityMode::Native,
            tag: default_tag(),
            confirmation_blocks: default_confirmation_blocks(),
            cache_duration_secs: default_cache_duration_secs(),
        }
    }
}

impl FinalityConfig {
    pub fn block_counting(confirmation_blocks: u64) -> Self {
        Self {
            mode: FinalityMode::BlockCounting,
            confirmation_blocks,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: FinalityMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_tag(mut self, tag: BlockTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_cache_duration(mut self, secs: u64) -> Self {
        self.cache_duration_secs = secs;
        self
    }

    /// The tag to ask providers for, and how many blocks to subtract from
    /// their answer.
    pub fn query(&self) -> (BlockTag, u64) {
        match self.mode {
            FinalityMode::Native => (self.tag, 0),
            FinalityMode::BlockCounting => (BlockTag::Latest, self.confirmation_blocks),
        }
    }
}
