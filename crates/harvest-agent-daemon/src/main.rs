// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use harvest_agent::adaptor::ShutdownPolicy;
use harvest_agent::agent::Agent;
use harvest_agent::config;
use harvest_agent::connector::FileSink;
use harvest_agent::logger;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config_dir = env::var("HARVEST_CONFIG_DIR")
        .map(PathBuf::from)
        .or_else(|_| env::current_dir())
        .context("cannot determine the configuration directory")?;
    let config = config::get_config(&config_dir);

    logger::init(config.log_level).context("failed to install the logger")?;
    config.validate().context("invalid configuration")?;

    let output_dir = config
        .output_dir
        .clone()
        .unwrap_or_else(|| env::temp_dir().join("harvest-output"));
    tokio::fs::create_dir_all(&output_dir)
        .await
        .with_context(|| format!("cannot create output directory {}", output_dir.display()))?;
    info!("delivering chunks to {}", output_dir.display());
    let sink = Arc::new(FileSink::new(&output_dir));

    let agent = Agent::start(config, sink)
        .await
        .context("agent failed to start")?;

    let handle = agent.handle();
    tokio::select! {
        () = handle.requested() => info!("shutdown requested over the control connection"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(e) => error!("failed to listen for Ctrl+C: {e}"),
        },
    }

    agent
        .shutdown(ShutdownPolicy::Gracefully)
        .await
        .context("agent did not shut down cleanly")
}
