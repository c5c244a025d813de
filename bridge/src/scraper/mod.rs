// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Scrapes custody-contract logs up to the agreed-final block.
//!
//! The range after the cursor is fetched in chunks of at most
//! `max_block_spread` blocks. Each chunk's logs are parsed, classified and
//! committed together with the cursor move, so a chunk is either fully
//! ingested or not at all.

pub mod provider;
pub mod quorum;

use crate::error::BridgeResult;
use crate::events::classifier::{classify, Classification};
use crate::events::parser::{parse_log, ParseLogError};
use crate::events::{RawLog, SourceEvent, ALL_TOPICS};
use crate::finality::FinalityChecker;
use crate::metrics::EngineMetrics;
use crate::state::audit::EventType;
use crate::state::reclassify_quarantined;
use crate::state::store::StateStore;
use crate::types::BlockNumber;
use ethers::types::Address;
use provider::{LogFilter, ProviderError};
use quorum::ProviderQuorum;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_BLOCK_SPREAD: u64 = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeSummary {
    pub last_scraped_block: BlockNumber,
    pub logs: usize,
    pub accepted: usize,
    pub invalid: usize,
    pub quarantined: usize,
    pub reclassified: usize,
    pub skipped_blocks: usize,
}

impl ScrapeSummary {
    fn absorb(&mut self, chunk: ScrapeSummary) {
        self.last_scraped_block = chunk.last_scraped_block;
        self.logs += chunk.logs;
        self.accepted += chunk.accepted;
        self.invalid += chunk.invalid;
        self.quarantined += chunk.quarantined;
        self.reclassified += chunk.reclassified;
        self.skipped_blocks += chunk.skipped_blocks;
    }
}

pub struct EventScraper {
    store: Arc<StateStore>,
    quorum: Arc<ProviderQuorum>,
    finality: Arc<dyn FinalityChecker>,
    filter: LogFilter,
    max_block_spread: u64,
    metrics: Arc<EngineMetrics>,
}

impl EventScraper {
    pub fn new(
        store: Arc<StateStore>,
        quorum: Arc<ProviderQuorum>,
        finality: Arc<dyn FinalityChecker>,
        custody_contract_address: Address,
        max_block_spread: u64,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            quorum,
            finality,
            filter: LogFilter {
                address: custody_contract_address,
                topics: ALL_TOPICS.to_vec(),
                from_block: 0,
                to_block: 0,
            },
            max_block_spread: max_block_spread.max(1),
            metrics,
        }
    }

    /// Scrapes `(last_scraped_block, agreed_final_block]`.
    pub async fn scrape(&self) -> BridgeResult<ScrapeSummary> {
        let finalized = self.finality.finalized_block().await?;
        self.store.note_observed_block(finalized);
        self.metrics.last_observed_block.set(finalized as i64);

        let last_scraped = self.store.read().last_scraped_block;
        let mut summary = ScrapeSummary {
            last_scraped_block: last_scraped,
            ..Default::default()
        };
        if finalized <= last_scraped {
            debug!(
                "[Scraper] Nothing to scrape: last scraped {}, finalized {}",
                last_scraped, finalized
            );
            return Ok(summary);
        }

        let mut from = last_scraped + 1;
        while from <= finalized {
            let to = finalized.min(from.saturating_add(self.max_block_spread - 1));
            self.scrape_chunk(from, to, &mut summary).await?;
            from = to + 1;
        }
        info!(
            "[Scraper] Scraped up to block {}: {} logs, {} accepted, {} invalid, {} quarantined",
            summary.last_scraped_block,
            summary.logs,
            summary.accepted,
            summary.invalid,
            summary.quarantined
        );
        Ok(summary)
    }

    /// Fetches `[from, to]`, halving the request while the response is too large.
    async fn scrape_chunk(
        &self,
        from: BlockNumber,
        to: BlockNumber,
        summary: &mut ScrapeSummary,
    ) -> BridgeResult<()> {
        let mut start = from;
        let mut end = to;
        while start <= to {
            match self.quorum.get_logs(&self.filter.with_range(start, end)).await {
                Ok(logs) => {
                    summary.absorb(self.ingest_logs(end, logs).await?);
                    self.metrics.scraped_blocks.inc_by(end - start + 1);
                    start = end + 1;
                    end = to;
                }
                Err(ProviderError::ResponseTooLarge) if end > start => {
                    end = start + (end - start) / 2;
                    debug!("[Scraper] Response too large, retrying [{}, {}]", start, end);
                }
                Err(ProviderError::ResponseTooLarge) => {
                    warn!("[Scraper] Logs of block {} are too large to fetch, skipping", start);
                    self.store
                        .commit(|tx| {
                            tx.record(EventType::SkippedBlock {
                                block_number: start,
                            })?;
                            tx.record(EventType::SyncedToBlock {
                                block_number: start,
                            })
                        })
                        .await?;
                    self.metrics.skipped_blocks.inc();
                    self.metrics.last_scraped_block.set(start as i64);
                    summary.skipped_blocks += 1;
                    summary.last_scraped_block = start;
                    start += 1;
                    end = to;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Classifies `logs` and moves the cursor to `to_block` in one commit.
    /// Events that are already known are left untouched, so ingesting the same
    /// logs twice changes nothing.
    pub(crate) async fn ingest_logs(
        &self,
        to_block: BlockNumber,
        logs: Vec<RawLog>,
    ) -> BridgeResult<ScrapeSummary> {
        let mut accepted_kinds: Vec<&'static str> = Vec::new();
        let chunk = self
            .store
            .commit(|tx| {
                let mut chunk = ScrapeSummary {
                    last_scraped_block: to_block,
                    logs: logs.len(),
                    ..Default::default()
                };
                let mut registry_changed = false;
                for log in &logs {
                    let event = match parse_log(log) {
                        Ok(event) => event,
                        Err(ParseLogError::PendingLog(reason)) => {
                            debug!("[Scraper] Ignoring pending log: {}", reason);
                            continue;
                        }
                        Err(ParseLogError::InvalidEvent {
                            event_source: source,
                            reason,
                            ..
                        }) => {
                            if !tx.state().is_known(&source) {
                                warn!("[Scraper] Invalid event {}: {}", source, reason);
                                tx.record(EventType::InvalidEvent { source, reason })?;
                                chunk.invalid += 1;
                            }
                            continue;
                        }
                    };
                    if tx.state().is_known(&event.source()) {
                        continue;
                    }
                    match classify(event, &tx.state().tokens) {
                        Classification::Accepted(event) => {
                            registry_changed |= matches!(event, SourceEvent::WrappedDeployed(_));
                            accepted_kinds.push(event.kind());
                            tx.record(EventType::AcceptedEvent { event })?;
                            chunk.accepted += 1;
                        }
                        Classification::Invalid { source, reason } => {
                            warn!("[Scraper] Invalid event {}: {}", source, reason);
                            tx.record(EventType::InvalidEvent { source, reason })?;
                            chunk.invalid += 1;
                        }
                        Classification::Quarantined { event, reason } => {
                            info!("[Scraper] Quarantined event {}: {}", event.source(), reason);
                            tx.record(EventType::QuarantinedEvent { event, reason })?;
                            chunk.quarantined += 1;
                        }
                    }
                }
                if registry_changed {
                    chunk.reclassified = reclassify_quarantined(tx)?;
                }
                if to_block > tx.state().last_scraped_block {
                    tx.record(EventType::SyncedToBlock {
                        block_number: to_block,
                    })?;
                }
                Ok(chunk)
            })
            .await?;

        for kind in accepted_kinds {
            self.metrics.accepted_events.with_label_values(&[kind]).inc();
        }
        self.metrics.invalid_events.inc_by(chunk.invalid as u64);
        self.metrics.quarantined_events.inc_by(chunk.quarantined as u64);
        self.metrics.last_scraped_block.set(to_block as i64);
        if chunk.reclassified > 0 {
            info!(
                "[Scraper] {} quarantined events resolved by a new registration",
                chunk.reclassified
            );
        }
        Ok(chunk)
    }
}
