// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::EngineNodeConfig,
    eth_client::EthClient,
    fees::FeeEstimator,
    finality::{FinalityChecker, QuorumFinalityChecker},
    ledger::http::HttpLedgerClient,
    metrics::EngineMetrics,
    mint::MintDispatcher,
    scheduler::{Engine, Scheduler},
    scraper::{provider::LogProvider, quorum::ProviderQuorum, EventScraper},
    server::{handler::EngineRequestHandler, run_metrics_server, run_server},
    state::store::{FileEventLog, StateStore},
    withdraw::{
        client::TransactionClient, intake::WithdrawalIntake, pipeline::WithdrawalPipeline,
        signer::{TransactionSigner, WalletSigner},
    },
};
use anyhow::anyhow;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wires every component from the config and spawns the scheduler, the
/// query server and the metrics server. All of them stop once `cancel` fires.
pub async fn run_engine_node(
    config: EngineNodeConfig,
    prometheus_registry: prometheus::Registry,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let metrics = Arc::new(EngineMetrics::new(&prometheus_registry)?);
    let source = &config.source_chain;

    let mut clients = Vec::with_capacity(source.rpc_urls.len());
    for (i, url) in source.rpc_urls.iter().enumerate() {
        let client = Arc::new(EthClient::new(
            format!("provider-{i}"),
            url,
            source.rpc_timeout(),
        )?);
        client.check_chain_id(source.chain_id).await?;
        clients.push(client);
    }
    let transaction_client: Arc<dyn TransactionClient> = clients
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("no RPC urls configured"))?;
    let quorum = Arc::new(ProviderQuorum::new(
        clients
            .iter()
            .map(|c| c.clone() as Arc<dyn LogProvider>)
            .collect(),
        source.rpc_timeout(),
        metrics.clone(),
    )?);
    let finality: Arc<dyn FinalityChecker> = Arc::new(QuorumFinalityChecker::new(
        quorum.clone(),
        source.finality.clone(),
    ));

    let log = FileEventLog::open(&config.state.log_path)?;
    let store = Arc::new(StateStore::open(config.to_init_arg(), Box::new(log))?);
    info!(
        "[Node] State loaded from {}, last scraped block {}",
        config.state.log_path.display(),
        store.read().last_scraped_block
    );

    let ledger = Arc::new(HttpLedgerClient::new(
        config.ledger.url.clone(),
        config.ledger.timeout(),
    )?);
    let signer = Arc::new(WalletSigner::from_private_key(
        &config.signer.read_private_key()?,
    )?);
    info!("[Node] Withdrawals are signed by {:?}", signer.address());
    let fees = Arc::new(FeeEstimator::new(
        transaction_client.clone(),
        source.fee_staleness(),
        source.min_max_priority_fee_per_gas,
        metrics.clone(),
    ));

    let scraper = EventScraper::new(
        store.clone(),
        quorum,
        finality.clone(),
        source.custody_contract_address,
        source.max_block_spread,
        metrics.clone(),
    );
    let minter = MintDispatcher::new(store.clone(), ledger.clone(), config.retry, metrics.clone());
    let intake = WithdrawalIntake::new(store.clone(), ledger.clone(), fees.clone(), metrics.clone());
    let pipeline = WithdrawalPipeline::new(
        store.clone(),
        fees.clone(),
        transaction_client,
        signer,
        ledger,
        finality,
        config.retry,
        metrics.clone(),
    );
    let engine = Arc::new(Engine::new(
        store, scraper, minter, intake, pipeline, fees, metrics.clone(),
    ));

    let mut handles = vec![];
    let scheduler = Scheduler::new(engine.clone(), config.scheduler.clone());
    let scheduler_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        scheduler.run(scheduler_cancel).await;
    }));

    let server_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        config.server_listen_port,
    );
    handles.push(run_server(
        &server_address,
        EngineRequestHandler::new(engine),
        metrics,
        cancel.clone(),
    ));

    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    handles.push(run_metrics_server(
        &metrics_address,
        prometheus_registry,
        cancel,
    ));
    Ok(handles)
}
