// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The private control plane: four POST endpoints the backend uses to push
//! frames to, and disconnect, specific client connections. Handled
//! requests always answer `200 {code, message}`; `code = 0` is success and
//! a missing target counts as success.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer};

use crate::{alert::Alerter, gateway::Gateway, metric::Metrics, pipeline::SLOW_REQUEST_MS};

/// Per-request deadline of the control server.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Grace between the final frame of `sendAndClose` and the socket close.
const SEND_AND_CLOSE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ControlState {
    pub gateway: Arc<Gateway>,
    pub metrics: Arc<Metrics>,
    pub alerts: Arc<Alerter>,
}

#[derive(Debug, Serialize)]
struct ApiReply {
    code: i32,
    message: String,
}

fn ok() -> Json<ApiReply> {
    Json(ApiReply {
        code: 0,
        message: "success".to_string(),
    })
}

fn bad_request(e: impl std::fmt::Display) -> Json<ApiReply> {
    Json(ApiReply {
        code: 1,
        message: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct CloseRequest {
    #[serde(rename = "connID")]
    conn_id: String,
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    #[serde(rename = "connID")]
    conn_id: String,
    #[serde(rename = "msgID")]
    msg_id: u16,
    #[serde(default)]
    bytes: String,
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    #[serde(rename = "connIDs")]
    conn_ids: Vec<String>,
    #[serde(rename = "msgID")]
    msg_id: u16,
    #[serde(default)]
    bytes: String,
    #[serde(rename = "durationSeconds", default)]
    duration_seconds: u64,
}

/// Kick: stop forwarding, then cancel the session. The kicked client gets
/// no disconnect notification pushed to the backend.
async fn close_agent(
    State(state): State<ControlState>,
    body: Result<Json<CloseRequest>, JsonRejection>,
) -> Json<ApiReply> {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => return bad_request(e),
    };

    if let Some(agent) = state.gateway.get_agent(&req.conn_id) {
        agent.disable();
        agent.close();
    }

    ok()
}

async fn send_agent(
    State(state): State<ControlState>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Json<ApiReply> {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => return bad_request(e),
    };

    if let Some(agent) = state.gateway.get_agent(&req.conn_id) {
        let bytes = BASE64.decode(req.bytes.as_bytes()).unwrap_or_default();
        let _ = agent.write(req.msg_id, &bytes).await;
    }

    ok()
}

/// Enqueue a final frame, then disable and close on a detached task after
/// a short grace so the frame has a chance to flush.
async fn send_and_close_agent(
    State(state): State<ControlState>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Json<ApiReply> {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => return bad_request(e),
    };

    if let Some(agent) = state.gateway.get_agent(&req.conn_id) {
        let bytes = BASE64.decode(req.bytes.as_bytes()).unwrap_or_default();
        let _ = agent.write(req.msg_id, &bytes).await;

        tokio::spawn(async move {
            agent.disable();
            sleep(SEND_AND_CLOSE_DELAY).await;
            agent.close();
        });
    }

    ok()
}

/// Rate-shaped broadcast: the targets are walked in order with
/// `duration_seconds * 1000 / len` milliseconds between sends, on a
/// detached task. Missing targets are skipped without sleeping.
async fn broadcast(
    State(state): State<ControlState>,
    body: Result<Json<BroadcastRequest>, JsonRejection>,
) -> Json<ApiReply> {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => return bad_request(e),
    };

    if req.conn_ids.is_empty() {
        return ok();
    }

    let bytes = BASE64.decode(req.bytes.as_bytes()).unwrap_or_default();
    let interval =
        Duration::from_millis(req.duration_seconds * 1000 / req.conn_ids.len() as u64);
    let gateway = state.gateway;

    tokio::spawn(async move {
        for conn_id in req.conn_ids {
            let Some(agent) = gateway.get_agent(&conn_id) else {
                continue;
            };

            let _ = agent.write(req.msg_id, &bytes).await;
            sleep(interval).await;
        }
    });

    ok()
}

async fn unknown_route(State(state): State<ControlState>, uri: Uri) -> Response {
    state
        .alerts
        .auto(format!("unknown private path: {}", uri.path()));

    (
        StatusCode::NOT_FOUND,
        Json(ApiReply {
            code: 1,
            message: "bad path".to_string(),
        }),
    )
        .into_response()
}

/// Request counter + per-path p99 + slow-request alert.
async fn track_requests(
    State(state): State<ControlState>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    use std::sync::atomic::Ordering;

    state
        .metrics
        .count_private_http_request
        .fetch_add(1, Ordering::Relaxed);

    let path = req.uri().path().to_string();
    let start = Instant::now();
    let resp = next.run(req).await;
    let cost_ms = start.elapsed().as_millis() as i64;

    state.metrics.p99_private.observe(&path, cost_ms);
    if cost_ms >= SLOW_REQUEST_MS {
        state.alerts.auto(format!(
            "private http service slow request, path: {path} cost: {cost_ms} ms"
        ));
    }

    resp
}

fn panic_response(alerts: Arc<Alerter>) -> impl Fn(Box<dyn std::any::Any + Send>) -> Response + Clone {
    move |_| {
        alerts.auto("private http service panic".to_string());
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiReply {
                code: 1,
                message: "panic".to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/agent/v1/close", post(close_agent))
        .route("/agent/v1/send", post(send_agent))
        .route("/agent/v1/sendAndClose", post(send_and_close_agent))
        .route("/agent/v1/broadcast", post(broadcast))
        .fallback(unknown_route)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_requests,
        ))
        .layer(CatchPanicLayer::custom(panic_response(state.alerts.clone())))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: ControlState,
    cancel: CancellationToken,
) -> Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
