// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use tcp_gateway_rs::{
    alert::Alerter,
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    discovery::{self, TracingStore},
    gateway::Gateway,
    metric::{self, Metrics},
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("config/config_logger.yaml")?;

    // Load config
    let cfg = resolve_config_path("config/config.gateway.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;
    info!("loaded config:\n{}", cfg.show());

    let metrics = Arc::new(Metrics::new());
    let alerts = Alerter::new(&cfg)?;
    alerts.auto(format!("gateway starting\n\n{}", cfg.show()));

    let gateway = Gateway::new(cfg.clone(), metrics.clone(), alerts.clone())?;
    let shutdown = gateway.shutdown_token();

    metric::spawn_reporter(
        metrics.clone(),
        alerts.clone(),
        cfg.node.env,
        cfg.metrics.report_interval,
        shutdown.clone(),
    );

    let (tcp_addr, http_addr) = gateway.run().await?;
    info!(%tcp_addr, %http_addr, "gateway running");

    if cfg.discovery.enabled {
        discovery::spawn_heartbeat(
            Arc::new(TracingStore),
            cfg,
            metrics,
            alerts,
            shutdown,
        );
        info!("discovery heartbeat running");
    }

    // Wait for SIGINT / SIGTERM, then close listeners and live sessions.
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }

    info!("shutting down");
    gateway.close();

    Ok(())
}
