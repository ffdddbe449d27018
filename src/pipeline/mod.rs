// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The message plane: an ordered middleware chain shared by every session,
//! terminating in the HTTP forwarder.
//!
//! Stage order matters. The fan-out stage sits between the in-flight
//! increment and the in-flight decrement, so "in-flight" counts dispatched
//! pipeline tasks, not frames parsed by the read loop.

/// Terminal stage: the backend HTTP forwarder.
pub mod forward;

use std::sync::{Arc, atomic::Ordering};

use anyhow::Result;
use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};
use tokio::time::Instant;

use crate::{
    agent::Agent,
    alert::Alerter,
    cfg::{config::Config, enums::Env},
    metric::Metrics,
    pipeline::forward::forward_http,
};

/// Synthetic "client disconnected" notification pushed to the backend;
/// never sent to a client.
pub const DISCONNECT_MSG_ID: u16 = 5006;
/// Dev-environment echo target; reserved, cannot carry real traffic in dev.
pub const STRESS_ECHO_MSG_ID: u16 = 1001;
/// Cap on concurrently dispatched pipeline tasks per session.
pub const MAX_IN_FLIGHT: i32 = 10;
/// Requests at or above this wall-clock cost raise a slow-request alert.
pub const SLOW_REQUEST_MS: i64 = 4000;

/// One inbound client message after framing.
#[derive(Debug, Clone)]
pub struct Msg {
    pub id: u16,
    pub body: Bytes,
}

/// A fully composed handler.
pub type Endpoint =
    Arc<dyn Fn(Arc<Agent>, Msg) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A stage wrapping the next handler. Stages are consumed once, when the
/// chain is composed at startup.
pub type Middleware = Box<dyn FnOnce(Endpoint) -> Endpoint>;

/// Folds the stages right-to-left around the terminal endpoint, so the
/// first stage in the list runs first.
pub fn compose(stages: Vec<Middleware>, terminal: Endpoint) -> Endpoint {
    stages
        .into_iter()
        .rev()
        .fold(terminal, |next, stage| stage(next))
}

/// Shared context captured by every stage.
pub(crate) struct PipelineCtx {
    pub env: Env,
    pub service_api_url: String,
    pub client: reqwest::Client,
    pub metrics: Arc<Metrics>,
    pub alerts: Arc<Alerter>,
}

/// The chain built once at process start, plus direct access to the
/// terminal forwarder for the synthetic disconnect message.
pub struct Pipeline {
    chain: Endpoint,
    forward: Endpoint,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Pipeline")
    }
}

impl Pipeline {
    pub fn new(cfg: &Config, metrics: Arc<Metrics>, alerts: Arc<Alerter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        let ctx = Arc::new(PipelineCtx {
            env: cfg.node.env,
            service_api_url: cfg.node.service_api_url.clone(),
            client,
            metrics,
            alerts,
        });

        let forward = forward_http(ctx.clone());
        let chain = compose(
            vec![
                rate_limit(ctx.clone()),
                fan_out(ctx.clone()),
                rate_limit_end(),
                stress_echo(ctx.clone()),
                latency(ctx),
            ],
            forward.clone(),
        );

        Ok(Self { chain, forward })
    }

    /// The full middleware chain; entry point for the session read loop.
    pub fn chain(&self) -> Endpoint {
        self.chain.clone()
    }

    /// The bare forwarder, bypassing the middlewares. Used by the session
    /// finalizer for the disconnect notification.
    pub fn forward(&self) -> Endpoint {
        self.forward.clone()
    }
}

/// Counts the inbound request and drops the message once the per-session
/// in-flight cap is exceeded. The client is never told; an alert is.
fn rate_limit(ctx: Arc<PipelineCtx>) -> Middleware {
    Box::new(move |next: Endpoint| {
        Arc::new(move |agent: Arc<Agent>, msg: Msg| {
            let ctx = ctx.clone();
            let next = next.clone();
            async move {
                ctx.metrics
                    .count_public_tcp_request
                    .fetch_add(1, Ordering::Relaxed);

                if agent.vars().in_flight.load(Ordering::Acquire) > MAX_IN_FLIGHT {
                    ctx.alerts.low_frequency(
                        "public tcp service speed limit",
                        format!(
                            "public tcp service speed limit, conn id: {} client ip: {}",
                            agent.cid(),
                            agent.address()
                        ),
                    );
                    return Ok(());
                }

                agent.vars().in_flight.fetch_add(1, Ordering::AcqRel);
                next(agent, msg).await
            }
            .boxed()
        })
    })
}

/// Detaches the rest of the chain as an independent task and reports
/// success to the read loop immediately, decoupling it from backend
/// latency. Panics and errors downstream surface as alerts here.
fn fan_out(ctx: Arc<PipelineCtx>) -> Middleware {
    Box::new(move |next: Endpoint| {
        Arc::new(move |agent: Arc<Agent>, msg: Msg| {
            let ctx = ctx.clone();
            let next = next.clone();
            async move {
                tokio::spawn(async move {
                    ctx.metrics
                        .count_public_http_request
                        .fetch_add(1, Ordering::Relaxed);

                    let msg_id = msg.id;
                    let res = std::panic::AssertUnwindSafe(next(agent.clone(), msg))
                        .catch_unwind()
                        .await;
                    match res {
                        Err(_) => ctx.alerts.auto(format!(
                            "public tcp service panic, conn id: {} client ip: {} msg id: {msg_id}",
                            agent.cid(),
                            agent.address(),
                        )),
                        Ok(Err(e)) => ctx.alerts.auto(format!(
                            "public tcp service error, conn id: {} client ip: {} err: {e} msg id: {msg_id}",
                            agent.cid(),
                            agent.address(),
                        )),
                        Ok(Ok(())) => {},
                    }
                });

                Ok(())
            }
            .boxed()
        })
    })
}

struct InFlightGuard(Arc<Agent>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.vars().in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Releases the in-flight slot taken by `rate_limit` once the downstream
/// task finishes, whatever the outcome.
fn rate_limit_end() -> Middleware {
    Box::new(move |next: Endpoint| {
        Arc::new(move |agent: Arc<Agent>, msg: Msg| {
            let next = next.clone();
            async move {
                let _guard = InFlightGuard(agent.clone());
                next(agent, msg).await
            }
            .boxed()
        })
    })
}

/// Hijacks message id 1001 in the dev environment: the body is echoed back
/// on the same session and the backend is never contacted.
fn stress_echo(ctx: Arc<PipelineCtx>) -> Middleware {
    Box::new(move |next: Endpoint| {
        Arc::new(move |agent: Arc<Agent>, msg: Msg| {
            let ctx = ctx.clone();
            let next = next.clone();
            async move {
                if ctx.env.is_dev() && msg.id == STRESS_ECHO_MSG_ID {
                    agent.write(STRESS_ECHO_MSG_ID, &msg.body).await?;
                    return Ok(());
                }

                next(agent, msg).await
            }
            .boxed()
        })
    })
}

/// Records the wall-clock cost of the rest of the chain into the per-id
/// p99 histogram and alerts on slow requests.
fn latency(ctx: Arc<PipelineCtx>) -> Middleware {
    Box::new(move |next: Endpoint| {
        Arc::new(move |agent: Arc<Agent>, msg: Msg| {
            let ctx = ctx.clone();
            let next = next.clone();
            async move {
                let msg_id = msg.id;
                let start = Instant::now();
                let res = next(agent.clone(), msg).await;
                let cost_ms = start.elapsed().as_millis() as i64;

                ctx.metrics
                    .p99_public
                    .observe(&msg_id.to_string(), cost_ms);

                if cost_ms >= SLOW_REQUEST_MS {
                    ctx.alerts.auto(format!(
                        "public tcp service slow request, conn id: {} client ip: {} msg id: {} cost: {cost_ms} ms",
                        agent.cid(),
                        agent.address(),
                        msg_id
                    ));
                }

                res
            }
            .boxed()
        })
    })
}
