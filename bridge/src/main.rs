// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use twin_bridge::config::EngineNodeConfig;
use twin_bridge::node::run_engine_node;
use twin_bridge_config::Config;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineNodeConfig::load(&args.config_path)?;
    config.validate()?;

    let cancel = CancellationToken::new();
    let prometheus_registry = prometheus::Registry::new();
    let handles = run_engine_node(config, prometheus_registry, cancel.clone()).await?;
    info!("Engine node started");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received ctrl-c, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for ctrl-c: {:?}", e),
        }
    });

    for handle in futures::future::join_all(handles).await {
        handle.map_err(|e| anyhow::anyhow!("Task join error: {}", e))?;
    }
    Ok(())
}
