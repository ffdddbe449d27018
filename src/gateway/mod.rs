// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The connection registry and the two listeners: the public TCP accept
//! loop and the private control-plane HTTP server.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use rand::RngExt;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    agent::Agent,
    alert::Alerter,
    cfg::{config::Config, enums::Env},
    control::{self, ControlState},
    metric::Metrics,
    pipeline::Pipeline,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent conn id is duplicated")]
    DuplicateId,
    #[error("bad agent conn id")]
    EmptyId,
}

/// Owns every live session, keyed by gateway-issued connection id.
///
/// Registration happens before a session's loops start; removal happens
/// exactly once, in the session finalizer. Callers get `Arc` views but must
/// not hold them past the session's close signal.
pub struct Gateway {
    cfg: Config,
    agents: DashMap<String, Arc<Agent>>,
    uid_base: AtomicU64,
    server_id: Arc<str>,
    metrics: Arc<Metrics>,
    alerts: Arc<Alerter>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
}

impl Gateway {
    pub fn new(
        cfg: Config,
        metrics: Arc<Metrics>,
        alerts: Arc<Alerter>,
    ) -> Result<Arc<Self>> {
        let pipeline = Arc::new(Pipeline::new(&cfg, metrics.clone(), alerts.clone())?);
        let server_id: Arc<str> = Arc::from(cfg.node.id.as_str());

        Ok(Arc::new(Self {
            cfg,
            agents: DashMap::new(),
            uid_base: AtomicU64::new(0),
            server_id,
            metrics,
            alerts,
            pipeline,
            cancel: CancellationToken::new(),
        }))
    }

    /// Binds both listeners and spawns the accept loop plus the control
    /// server. Returns the bound addresses (useful with port 0).
    pub async fn run(self: &Arc<Self>) -> Result<(SocketAddr, SocketAddr)> {
        let http_listener =
            TcpListener::bind(("0.0.0.0", self.cfg.node.private_http_port))
                .await
                .context("private http service listen fail")?;
        let http_addr = http_listener.local_addr()?;

        let state = ControlState {
            gateway: self.clone(),
            metrics: self.metrics.clone(),
            alerts: self.alerts.clone(),
        };
        let http_cancel = self.cancel.clone();
        let http_alerts = self.alerts.clone();
        tokio::spawn(async move {
            if let Err(e) = control::serve(http_listener, state, http_cancel).await {
                http_alerts.auto(format!("private http service exit: {e}"));
            }
        });

        let tcp_listener = TcpListener::bind(("0.0.0.0", self.cfg.node.public_tcp_port))
            .await
            .context("public tcp service listen fail")?;
        let tcp_addr = tcp_listener.local_addr()?;

        let accept = self.clone();
        let accept_task = tokio::spawn(async move {
            accept.loop_accept(tcp_listener).await;
        });

        // An accept-loop panic is fatal for the whole gateway: alert and
        // stop serving rather than run on without a listener.
        let watchdog = self.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_task.await
                && e.is_panic()
            {
                watchdog
                    .alerts
                    .auto("public tcp service accept panic".to_string());
                watchdog.close();
            }
        });

        info!(%tcp_addr, %http_addr, "gateway listening");
        Ok((tcp_addr, http_addr))
    }

    async fn loop_accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = listener.accept() => match res {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        debug!("accept failed: {e}");
                        continue;
                    },
                },
            };

            let uid = self.generate_conn_id();
            let agent = match Agent::new(&self, stream, uid.clone()) {
                Ok(agent) => agent,
                Err(e) => {
                    self.alerts.auto(format!("agent setup fail: {e}"));
                    continue;
                },
            };

            if let Err(e) = self.add_agent(&uid, agent.clone()) {
                self.alerts
                    .auto(format!("add agent: {} fail: {e}", agent.address()));
                // Dropping the agent closes the socket; it never ran.
                continue;
            }

            self.metrics.count_connection.fetch_add(1, Ordering::Relaxed);
            agent.run();
        }
    }

    /// `"{counter}_{nanos}_{rand}"`. Three independent parts so that
    /// restarts cannot realistically collide without a shared id oracle.
    pub fn generate_conn_id(&self) -> String {
        let _ = self.uid_base.compare_exchange(
            u64::MAX - 1000,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        let uid = self.uid_base.fetch_add(1, Ordering::AcqRel) + 1;
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let random_id: u32 = rand::rng().random_range(0..=9_999_999);

        format!("{uid}_{now}_{random_id}")
    }

    pub fn add_agent(&self, id: &str, agent: Arc<Agent>) -> Result<(), RegistryError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(RegistryError::EmptyId);
        }

        match self.agents.entry(id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateId),
            Entry::Vacant(v) => {
                v.insert(agent);
                Ok(())
            },
        }
    }

    pub fn remove_agent(&self, id: &str) -> Option<Arc<Agent>> {
        if id.trim().is_empty() {
            return None;
        }

        self.agents.remove(id).map(|(_, agent)| agent)
    }

    pub fn get_agent(&self, id: &str) -> Option<Arc<Agent>> {
        if id.trim().is_empty() {
            return None;
        }

        self.agents.get(id).map(|entry| entry.value().clone())
    }

    /// A point-in-time copy of the registry.
    pub fn snapshot(&self) -> HashMap<String, Arc<Agent>> {
        self.agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Stops the listeners and cancels every live session.
    pub fn close(&self) {
        self.cancel.cancel();
        for entry in self.agents.iter() {
            entry.value().close();
        }
    }

    /// Token cancelled on `close`; ambient tasks tie their lifetime to it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn env(&self) -> Env {
        self.cfg.node.env
    }

    pub fn server_id(&self) -> Arc<str> {
        self.server_id.clone()
    }

    pub(crate) fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub(crate) fn alerts(&self) -> Arc<Alerter> {
        self.alerts.clone()
    }

    pub(crate) fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.clone()
    }
}
