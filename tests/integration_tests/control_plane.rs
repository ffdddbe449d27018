// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Value, json};
use tcp_gateway_rs::cfg::enums::Env;
use tokio::{
    net::TcpStream,
    time::{Instant, sleep, timeout},
};

use crate::integration_tests::common::{
    no_reply, read_frame, spawn_backend, start_gateway, wait_for_sessions,
};

async fn post(
    http_addr: SocketAddr,
    path: &str,
    body: &Value,
) -> Result<(reqwest::StatusCode, Value)> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{http_addr}{path}"))
        .json(body)
        .send()
        .await?;
    let status = resp.status();
    let body: Value = resp.json().await?;
    Ok((status, body))
}

#[tokio::test]
async fn send_pushes_a_frame_to_the_target_session() -> Result<()> {
    let (backend_url, _seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, tcp_addr, http_addr) = start_gateway(Env::Dev, backend_url).await?;

    let mut client = TcpStream::connect(tcp_addr).await?;
    wait_for_sessions(&gateway, 1).await?;
    let conn_id = gateway
        .snapshot()
        .keys()
        .next()
        .cloned()
        .expect("one session");

    let (status, reply) = post(
        http_addr,
        "/agent/v1/send",
        &json!({
            "connID": conn_id,
            "msgID": 2000,
            "bytes": BASE64.encode(b"pushed"),
        }),
    )
    .await?;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(reply["code"], 0);

    let (id, body) = timeout(Duration::from_secs(5), read_frame(&mut client)).await??;
    assert_eq!(id, 2000);
    assert_eq!(body, b"pushed");

    gateway.close();
    Ok(())
}

#[tokio::test]
async fn send_to_missing_connection_is_success() -> Result<()> {
    let (backend_url, _seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, _, http_addr) = start_gateway(Env::Dev, backend_url).await?;

    let (status, reply) = post(
        http_addr,
        "/agent/v1/send",
        &json!({"connID": "nope", "msgID": 2000, "bytes": ""}),
    )
    .await?;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(reply["code"], 0);

    gateway.close();
    Ok(())
}

#[tokio::test]
async fn close_kicks_without_disconnect_notification() -> Result<()> {
    let (backend_url, mut seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, tcp_addr, http_addr) = start_gateway(Env::Dev, backend_url).await?;

    let mut client = TcpStream::connect(tcp_addr).await?;
    wait_for_sessions(&gateway, 1).await?;
    let conn_id = gateway
        .snapshot()
        .keys()
        .next()
        .cloned()
        .expect("one session");

    let (_, reply) =
        post(http_addr, "/agent/v1/close", &json!({"connID": conn_id})).await?;
    assert_eq!(reply["code"], 0);

    // The client observes the close.
    let res = timeout(Duration::from_secs(5), read_frame(&mut client)).await?;
    assert!(res.is_err());
    wait_for_sessions(&gateway, 0).await?;

    // Kicked sessions emit no synthetic disconnect to the backend.
    sleep(Duration::from_millis(500)).await;
    assert!(seen.try_recv().is_err());

    gateway.close();
    Ok(())
}

#[tokio::test]
async fn send_and_close_flushes_before_closing() -> Result<()> {
    let (backend_url, _seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, tcp_addr, http_addr) = start_gateway(Env::Dev, backend_url).await?;

    let mut client = TcpStream::connect(tcp_addr).await?;
    wait_for_sessions(&gateway, 1).await?;
    let conn_id = gateway
        .snapshot()
        .keys()
        .next()
        .cloned()
        .expect("one session");

    let (_, reply) = post(
        http_addr,
        "/agent/v1/sendAndClose",
        &json!({
            "connID": conn_id,
            "msgID": 2001,
            "bytes": BASE64.encode(b"bye"),
        }),
    )
    .await?;
    assert_eq!(reply["code"], 0);

    // The final frame arrives, then the socket closes about a second later.
    let (id, body) = timeout(Duration::from_secs(5), read_frame(&mut client)).await??;
    assert_eq!(id, 2001);
    assert_eq!(body, b"bye");

    let res = timeout(Duration::from_secs(5), read_frame(&mut client)).await?;
    assert!(res.is_err());
    wait_for_sessions(&gateway, 0).await?;

    gateway.close();
    Ok(())
}

#[tokio::test]
async fn broadcast_is_rate_shaped() -> Result<()> {
    let (backend_url, _seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, tcp_addr, http_addr) = start_gateway(Env::Dev, backend_url).await?;

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(TcpStream::connect(tcp_addr).await?);
    }
    wait_for_sessions(&gateway, 4).await?;

    let conn_ids: Vec<String> = gateway.snapshot().keys().cloned().collect();
    let (_, reply) = post(
        http_addr,
        "/agent/v1/broadcast",
        &json!({
            "connIDs": conn_ids,
            "msgID": 2002,
            "bytes": BASE64.encode(b"all"),
            "durationSeconds": 2,
        }),
    )
    .await?;
    assert_eq!(reply["code"], 0);

    // 4 targets over 2s: sends spaced by ~500ms, last at ~1.5s.
    let start = Instant::now();
    let mut arrivals = Vec::new();
    for client in &mut clients {
        let (id, body) =
            timeout(Duration::from_secs(5), read_frame(client)).await??;
        assert_eq!(id, 2002);
        assert_eq!(body, b"all");
        arrivals.push(start.elapsed());
    }

    let last = arrivals.iter().max().expect("arrivals");
    assert!(
        *last >= Duration::from_millis(1200),
        "broadcast finished too fast: {last:?}"
    );
    assert!(
        *last < Duration::from_secs(4),
        "broadcast took too long: {last:?}"
    );

    gateway.close();
    Ok(())
}

#[tokio::test]
async fn unknown_route_and_malformed_body() -> Result<()> {
    let (backend_url, _seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, _, http_addr) = start_gateway(Env::Dev, backend_url).await?;

    let (status, reply) = post(http_addr, "/agent/v1/nope", &json!({})).await?;
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    assert_eq!(reply["code"], 1);
    assert_eq!(reply["message"], "bad path");

    // A body missing required fields is a handled failure, not a 4xx.
    let (status, reply) = post(
        http_addr,
        "/agent/v1/close",
        &json!({"unexpected": true}),
    )
    .await?;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(reply["code"], 1);

    gateway.close();
    Ok(())
}

#[tokio::test]
async fn broadcast_skips_missing_targets() -> Result<()> {
    let (backend_url, _seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, tcp_addr, http_addr) = start_gateway(Env::Dev, backend_url).await?;

    let mut client = TcpStream::connect(tcp_addr).await?;
    wait_for_sessions(&gateway, 1).await?;
    let conn_id = gateway
        .snapshot()
        .keys()
        .next()
        .cloned()
        .expect("one session");

    let (_, reply) = post(
        http_addr,
        "/agent/v1/broadcast",
        &json!({
            "connIDs": ["ghost-1", conn_id, "ghost-2"],
            "msgID": 2003,
            "bytes": BASE64.encode(b"hey"),
            "durationSeconds": 0,
        }),
    )
    .await?;
    assert_eq!(reply["code"], 0);

    let (id, body) = timeout(Duration::from_secs(5), read_frame(&mut client)).await??;
    assert_eq!(id, 2003);
    assert_eq!(body, b"hey");

    gateway.close();
    Ok(())
}
