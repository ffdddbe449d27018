// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Service-discovery heartbeat. The gateway only *produces* the node
//! snapshot; the shared key/value store it lands in is an external
//! collaborator behind [`DiscoveryStore`].

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{alert::Alerter, cfg::config::Config, metric::Metrics};

/// Snapshots are published this often.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// A snapshot not refreshed within this window is considered stale.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(10);
/// How long the store keeps the registration set around.
pub const STORE_RETENTION: Duration = Duration::from_secs(86400 * 3);

/// What one gateway node publishes about itself.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub env: String,
    pub public_ip: String,
    pub local_ip: String,
    #[serde(rename = "name")]
    pub instance_name: String,
    pub instance_id: String,
    /// Composite service id; the member key in the shared store.
    pub id: String,
    pub service_type: String,
    /// Unix seconds after which this snapshot is stale.
    pub expire_time: u64,
    pub connection_num: u64,
    pub public_tcp_port: u16,
    pub private_http_port: u16,
    pub service_api_url: String,
    pub build_version: String,
    /// Last metrics summary, for humans reading the registry.
    pub metric_data: String,
}

/// Builds the current snapshot from config plus live gauges.
pub fn snapshot(cfg: &Config, metrics: &Metrics) -> NodeSnapshot {
    let node = &cfg.node;
    NodeSnapshot {
        env: node.env.to_string(),
        public_ip: node.public_ip.clone(),
        local_ip: node.local_ip.clone(),
        instance_name: node.instance_name.clone(),
        instance_id: node.instance_id.clone(),
        id: node.id.clone(),
        service_type: node.service_type.clone(),
        expire_time: (Utc::now().timestamp() as u64)
            .saturating_add(SNAPSHOT_TTL.as_secs()),
        connection_num: metrics.count_connection.load(Ordering::Relaxed).max(0) as u64,
        public_tcp_port: node.public_tcp_port,
        private_http_port: node.private_http_port,
        service_api_url: node.service_api_url.clone(),
        build_version: env!("CARGO_PKG_VERSION").to_string(),
        metric_data: metrics.last_report(),
    }
}

/// Transport for the registration set. The production deployment plugs in
/// the shared store client here; the crate only ships a logging stand-in.
pub trait DiscoveryStore: Send + Sync {
    fn publish(
        &self,
        register_key: &str,
        member_id: &str,
        payload: String,
        retention: Duration,
    ) -> BoxFuture<'static, Result<()>>;
}

/// Stand-in store: the snapshot goes to the log instead of a shared store.
pub struct TracingStore;

impl DiscoveryStore for TracingStore {
    fn publish(
        &self,
        register_key: &str,
        member_id: &str,
        payload: String,
        _retention: Duration,
    ) -> BoxFuture<'static, Result<()>> {
        let register_key = register_key.to_string();
        let member_id = member_id.to_string();
        Box::pin(async move {
            debug!(%register_key, %member_id, %payload, "discovery heartbeat");
            Ok(())
        })
    }
}

/// Publishes once immediately, then every [`HEARTBEAT_INTERVAL`] until the
/// token is cancelled. Publish failures are alerted and retried on the
/// next beat.
pub fn spawn_heartbeat(
    store: Arc<dyn DiscoveryStore>,
    cfg: Config,
    metrics: Arc<Metrics>,
    alerts: Arc<Alerter>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snap = snapshot(&cfg, &metrics);
            match serde_json::to_string(&snap) {
                Ok(payload) => {
                    if let Err(e) = store
                        .publish(
                            &cfg.discovery.register_key,
                            &snap.id,
                            payload,
                            STORE_RETENTION,
                        )
                        .await
                    {
                        alerts.auto(format!("discovery register fail: {e}"));
                    }
                },
                Err(e) => alerts.auto(format!("discovery snapshot encode fail: {e}")),
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(HEARTBEAT_INTERVAL) => {},
            }
        }
    })
}
