// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Operational alerting. Every alert is stamped with the node identity,
//! logged, and (when a webhook is configured) pushed to the chat hook on a
//! detached task. A bounded TTL cache keeps repeated alerts from flooding
//! the channel; the wire format of the hook itself is an external
//! collaborator.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cfg::config::Config;

/// A repeated alert with the same de-dup key is suppressed for this long.
pub const ALERT_DEDUP_TTL: Duration = Duration::from_secs(30);
/// Upper bound on distinct cached keys; expired entries are pruned when the
/// cache fills up.
pub const ALERT_DEDUP_CAP: usize = 30_000;

#[derive(Debug)]
pub struct Alerter {
    stamp: String,
    webhook_url: Option<String>,
    client: reqwest::Client,
    cache: DashMap<String, Instant>,
}

impl Alerter {
    pub fn new(cfg: &Config) -> Result<Arc<Self>> {
        let node = &cfg.node;
        let stamp = format!(
            "env: {} instance_name: {} instance_id: {} local_ip: {} uid: {}",
            node.env, node.instance_name, node.instance_id, node.local_ip, node.id
        );

        let webhook_url = match cfg.alert.webhook_url.trim() {
            "" => None,
            url => Some(url.to_string()),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Arc::new(Self {
            stamp,
            webhook_url,
            client,
            cache: DashMap::new(),
        }))
    }

    /// Emits an alert de-duplicated by an explicit key. Used on hot paths
    /// where the detail text varies per event but the condition does not.
    pub fn low_frequency(&self, key: impl Into<String>, detail: impl Into<String>) {
        let key = key.into();
        if key.trim().is_empty() {
            return;
        }
        self.emit(key, detail.into());
    }

    /// Emits an alert de-duplicated by its own text.
    pub fn auto(&self, detail: impl Into<String>) {
        let detail = detail.into();
        self.emit(detail.clone(), detail);
    }

    fn emit(&self, dedup_key: String, detail: String) {
        if !self.should_emit(dedup_key) {
            return;
        }

        let full = format!("{}\n\n{}", self.stamp, detail);
        warn!(alert = %detail, "alert");

        let Some(url) = self.webhook_url.clone() else {
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            let body = json!({
                "msg_type": "text",
                "content": { "text": full },
            });
            if let Err(e) = client.post(&url).json(&body).send().await {
                debug!("alert webhook post failed: {e}");
            }
        });
    }

    fn should_emit(&self, key: String) -> bool {
        if self.cache.len() >= ALERT_DEDUP_CAP {
            self.cache
                .retain(|_, seen| seen.elapsed() < ALERT_DEDUP_TTL);
        }

        let now = Instant::now();
        match self.cache.entry(key) {
            Entry::Occupied(mut e) => {
                if e.get().elapsed() < ALERT_DEDUP_TTL {
                    return false;
                }
                e.insert(now);
                true
            },
            Entry::Vacant(v) => {
                v.insert(now);
                true
            },
        }
    }
}
