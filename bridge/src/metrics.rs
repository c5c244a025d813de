// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 7.5, 10., 15., 20., 30., 45.,
    60., 90., 120.,
];

#[derive(Clone, Debug)]
pub struct EngineMetrics {
    pub(crate) last_scraped_block: IntGauge,
    pub(crate) last_observed_block: IntGauge,
    pub(crate) scraped_blocks: IntCounter,
    pub(crate) skipped_blocks: IntCounter,

    pub(crate) accepted_events: IntCounterVec,
    pub(crate) invalid_events: IntCounter,
    pub(crate) quarantined_events: IntCounter,
    pub(crate) pending_events: IntGauge,

    pub(crate) provider_errors: IntCounterVec,
    pub(crate) provider_disagreements: IntCounter,
    pub(crate) provider_latency: HistogramVec,

    pub(crate) mint_ok: IntCounterVec,
    pub(crate) mint_errors: IntCounterVec,

    pub(crate) withdrawal_requests: IntCounterVec,
    pub(crate) withdrawal_transitions: IntCounterVec,
    pub(crate) withdrawal_replacements: IntCounter,
    pub(crate) withdrawal_reimbursements: IntCounter,
    pub(crate) withdrawals_in_flight: IntGaugeVec,

    pub(crate) fee_estimate_refreshes: IntCounter,
    pub(crate) task_failures: IntCounterVec,
    pub(crate) task_skipped: IntCounterVec,

    pub(crate) requests_received: IntCounterVec,
    pub(crate) requests_ok: IntCounterVec,
    pub(crate) err_requests: IntCounterVec,
    pub(crate) requests_inflight: IntGaugeVec,
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            last_scraped_block: register_int_gauge_with_registry!(
                "twin_bridge_last_scraped_block",
                "Highest source-chain block whose logs have been fully processed",
                registry,
            )?,
            last_observed_block: register_int_gauge_with_registry!(
                "twin_bridge_last_observed_block",
                "Latest block agreed final by all providers",
                registry,
            )?,
            scraped_blocks: register_int_counter_with_registry!(
                "twin_bridge_scraped_blocks",
                "Total number of source-chain blocks scraped",
                registry,
            )?,
            skipped_blocks: register_int_counter_with_registry!(
                "twin_bridge_skipped_blocks",
                "Blocks skipped because their logs could not be fetched",
                registry,
            )?,
            accepted_events: register_int_counter_vec_with_registry!(
                "twin_bridge_accepted_events",
                "Total number of accepted source events by kind",
                &["kind"],
                registry,
            )?,
            invalid_events: register_int_counter_with_registry!(
                "twin_bridge_invalid_events",
                "Total number of events rejected as invalid",
                registry,
            )?,
            quarantined_events: register_int_counter_with_registry!(
                "twin_bridge_quarantined_events",
                "Total number of events placed in quarantine",
                registry,
            )?,
            pending_events: register_int_gauge_with_registry!(
                "twin_bridge_pending_events",
                "Events waiting to be minted or released",
                registry,
            )?,
            provider_errors: register_int_counter_vec_with_registry!(
                "twin_bridge_provider_errors",
                "Provider errors by provider and error type",
                &["provider", "type"],
                registry,
            )?,
            provider_disagreements: register_int_counter_with_registry!(
                "twin_bridge_provider_disagreements",
                "Number of queries on which providers disagreed",
                registry,
            )?,
            provider_latency: register_histogram_vec_with_registry!(
                "twin_bridge_provider_latency",
                "Latency of provider queries",
                &["provider", "method"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )?,
            mint_ok: register_int_counter_vec_with_registry!(
                "twin_bridge_mint_ok",
                "Successful mint and release calls by event kind",
                &["kind"],
                registry,
            )?,
            mint_errors: register_int_counter_vec_with_registry!(
                "twin_bridge_mint_errors",
                "Failed mint and release calls by error type",
                &["type"],
                registry,
            )?,
            withdrawal_requests: register_int_counter_vec_with_registry!(
                "twin_bridge_withdrawal_requests",
                "Withdrawal requests by kind and outcome",
                &["kind", "outcome"],
                registry,
            )?,
            withdrawal_transitions: register_int_counter_vec_with_registry!(
                "twin_bridge_withdrawal_transitions",
                "Withdrawal phase transitions by target phase",
                &["phase"],
                registry,
            )?,
            withdrawal_replacements: register_int_counter_with_registry!(
                "twin_bridge_withdrawal_replacements",
                "Same-nonce replacement transactions signed",
                registry,
            )?,
            withdrawal_reimbursements: register_int_counter_with_registry!(
                "twin_bridge_withdrawal_reimbursements",
                "Withdrawals reimbursed on the destination ledger",
                registry,
            )?,
            withdrawals_in_flight: register_int_gauge_vec_with_registry!(
                "twin_bridge_withdrawals_in_flight",
                "Withdrawals per non-terminal phase",
                &["phase"],
                registry,
            )?,
            fee_estimate_refreshes: register_int_counter_with_registry!(
                "twin_bridge_fee_estimate_refreshes",
                "Number of times the gas fee estimate was refreshed",
                registry,
            )?,
            task_failures: register_int_counter_vec_with_registry!(
                "twin_bridge_task_failures",
                "Scheduler task failures by task and error type",
                &["task", "type"],
                registry,
            )?,
            task_skipped: register_int_counter_vec_with_registry!(
                "twin_bridge_task_skipped",
                "Task invocations skipped because the task was already running",
                &["task"],
                registry,
            )?,
            requests_received: register_int_counter_vec_with_registry!(
                "twin_bridge_requests_received",
                "Total number of requests received by type",
                &["type"],
                registry,
            )?,
            requests_ok: register_int_counter_vec_with_registry!(
                "twin_bridge_requests_ok",
                "Total number of ok requests by type",
                &["type"],
                registry,
            )?,
            err_requests: register_int_counter_vec_with_registry!(
                "twin_bridge_err_requests",
                "Total number of erred requests by type",
                &["type"],
                registry,
            )?,
            requests_inflight: register_int_gauge_vec_with_registry!(
                "twin_bridge_requests_inflight",
                "Total number of inflight requests by type",
                &["type"],
                registry,
            )?,
        })
    }

    #[cfg(test)]
    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry).unwrap()
    }
}
