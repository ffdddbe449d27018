// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::Env;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Identity and listen/forward addressing of this gateway node.
    pub node: NodeConfig,
    /// Service-discovery heartbeat settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Alert sink settings.
    #[serde(default)]
    pub alert: AlertConfig,
    /// Metrics reporter settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Node identity plus the two listen ports and the backend URL.
///
/// `public_ip` / `local_ip` / `instance_*` come from the deployment layer
/// (cloud metadata, orchestrator env); the gateway only snapshots them into
/// heartbeats and alert stamps.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NodeConfig {
    /// Runtime environment tag (dev / debug / release).
    #[serde(default)]
    pub env: Env,

    #[serde(default)]
    pub public_ip: String,

    #[serde(default)]
    pub local_ip: String,

    #[serde(default)]
    pub instance_name: String,

    #[serde(default)]
    pub instance_id: String,

    /// Service type advertised in discovery snapshots.
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// TCP port for client-facing framed streams.
    pub public_tcp_port: u16,

    /// HTTP port for the internal control plane.
    pub private_http_port: u16,

    /// Backend application endpoint every client message is forwarded to.
    pub service_api_url: String,

    /// Composite service id, derived in `validate_and_normalize`.
    #[serde(default, skip_serializing)]
    pub id: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct DiscoveryConfig {
    /// When false the heartbeat task is not started.
    #[serde(default)]
    pub enabled: bool,

    /// Key under which all gateway nodes register in the shared store.
    #[serde(default = "default_register_key")]
    pub register_key: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct AlertConfig {
    /// Chat webhook endpoint; empty disables the outbound hook and alerts
    /// only reach the log.
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MetricsConfig {
    /// Interval between human-readable metric summaries.
    #[serde(default = "default_report_interval", with = "serde_secs")]
    pub report_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval: default_report_interval(),
        }
    }
}

fn default_service_type() -> String {
    "gateway".to_string()
}

fn default_register_key() -> String {
    "gateway_registered_nodes".to_string()
}

fn default_report_interval() -> Duration {
    Duration::from_secs(1800)
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        // Port 0 asks the kernel for an ephemeral port.
        ensure!(
            self.node.public_tcp_port == 0
                || self.node.public_tcp_port != self.node.private_http_port,
            "public_tcp_port and private_http_port must differ"
        );
        ensure!(
            !self.node.service_api_url.trim().is_empty(),
            "service_api_url must not be empty"
        );

        if self.node.instance_name.is_empty() {
            self.node.instance_name = "unknown".to_string();
        }
        if self.node.instance_id.is_empty() {
            self.node.instance_id = "unknown".to_string();
        }

        // Composite service id: stable across restarts of the same deployment
        // slot, unique across ports on the same host.
        self.node.id = format!(
            "{}_{}_{}",
            self.node.instance_id, self.node.public_tcp_port, self.node.private_http_port
        );

        if self.discovery.enabled {
            ensure!(
                !self.discovery.register_key.trim().is_empty(),
                "discovery.register_key must not be empty when discovery is enabled"
            );
        }

        ensure!(
            self.metrics.report_interval >= Duration::from_secs(1),
            "metrics.report_interval must be at least 1s"
        );

        Ok(())
    }

    /// Renders the loaded configuration for the startup log, masking the
    /// webhook endpoint.
    pub fn show(&self) -> String {
        let mut masked = self.clone();
        if !masked.alert.webhook_url.is_empty() {
            masked.alert.webhook_url = "***".to_string();
        }
        serde_yaml::to_string(&masked)
            .unwrap_or_else(|e| format!("<unprintable config: {e}>"))
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
