// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use tcp_gateway_rs::{cfg::enums::Env, pipeline::forward::BackendEnvelope};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

use crate::integration_tests::common::{
    no_reply, read_frame, send_frame, send_raw_header, spawn_backend, start_gateway,
    wait_for_backend_msg, wait_for_sessions,
};

#[tokio::test]
async fn happy_round_trip() -> Result<()> {
    // Backend answers 1500 with a 1501 "ok" frame.
    let reply = Arc::new(|envelope: &BackendEnvelope| {
        (envelope.msg_id == 1500).then(|| BackendEnvelope {
            sequence_id: envelope.sequence_id,
            server_id: envelope.server_id.clone(),
            conn_id: envelope.conn_id.clone(),
            msg_id: 1501,
            bytes: BASE64.encode(b"ok"),
        })
    });
    let (backend_url, mut seen) = spawn_backend(reply, Duration::ZERO).await?;
    let (gateway, tcp_addr, _) = start_gateway(Env::Dev, backend_url).await?;

    let mut client = TcpStream::connect(tcp_addr).await?;
    wait_for_sessions(&gateway, 1).await?;

    send_frame(&mut client, 1500, b"hi").await?;

    let (id, body) = timeout(Duration::from_secs(5), read_frame(&mut client)).await??;
    assert_eq!(id, 1501);
    assert_eq!(body, b"ok");

    // The backend saw the full envelope.
    let envelope =
        wait_for_backend_msg(&mut seen, 1500, Duration::from_secs(5)).await?;
    assert_eq!(envelope.sequence_id, 1);
    assert_eq!(envelope.bytes, BASE64.encode(b"hi"));
    assert!(!envelope.conn_id.is_empty());
    assert!(!envelope.server_id.is_empty());

    gateway.close();
    Ok(())
}

#[tokio::test]
async fn bad_header_id_tears_down_and_notifies_backend() -> Result<()> {
    let (backend_url, mut seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, tcp_addr, _) = start_gateway(Env::Dev, backend_url).await?;

    let mut client = TcpStream::connect(tcp_addr).await?;
    wait_for_sessions(&gateway, 1).await?;

    send_raw_header(&mut client, 500, 10, 0).await?;

    // Session is torn down: the read side reaches EOF, no frame is echoed.
    let res = timeout(Duration::from_secs(5), read_frame(&mut client)).await?;
    assert!(res.is_err());

    // The backend gets exactly the synthetic disconnect.
    let envelope =
        wait_for_backend_msg(&mut seen, 5006, Duration::from_secs(5)).await?;
    assert!(envelope.bytes.is_empty());

    wait_for_sessions(&gateway, 0).await?;
    gateway.close();
    Ok(())
}

#[tokio::test]
async fn stress_echo_hijacks_1001_in_dev() -> Result<()> {
    let (backend_url, mut seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, tcp_addr, _) = start_gateway(Env::Dev, backend_url).await?;

    let mut client = TcpStream::connect(tcp_addr).await?;
    wait_for_sessions(&gateway, 1).await?;

    send_frame(&mut client, 1001, b"x").await?;

    let (id, body) = timeout(Duration::from_secs(5), read_frame(&mut client)).await??;
    assert_eq!(id, 1001);
    assert_eq!(body, b"x");

    // The hijack never contacts the backend.
    sleep(Duration::from_millis(300)).await;
    assert!(seen.try_recv().is_err());

    gateway.close();
    Ok(())
}

#[tokio::test]
async fn id_1001_reaches_backend_outside_dev() -> Result<()> {
    let (backend_url, mut seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, tcp_addr, _) = start_gateway(Env::Release, backend_url).await?;

    let mut client = TcpStream::connect(tcp_addr).await?;
    wait_for_sessions(&gateway, 1).await?;

    send_frame(&mut client, 1001, b"x").await?;

    let envelope =
        wait_for_backend_msg(&mut seen, 1001, Duration::from_secs(5)).await?;
    assert_eq!(envelope.bytes, BASE64.encode(b"x"));

    gateway.close();
    Ok(())
}

#[tokio::test]
async fn empty_body_frames_are_forwarded() -> Result<()> {
    let (backend_url, mut seen) = spawn_backend(no_reply(), Duration::ZERO).await?;
    let (gateway, tcp_addr, _) = start_gateway(Env::Dev, backend_url).await?;

    let mut client = TcpStream::connect(tcp_addr).await?;
    wait_for_sessions(&gateway, 1).await?;

    // size == 10: a bare header is a complete frame with an empty body.
    send_raw_header(&mut client, 1500, 10, 0).await?;

    let envelope =
        wait_for_backend_msg(&mut seen, 1500, Duration::from_secs(5)).await?;
    assert!(envelope.bytes.is_empty());

    // The session survives.
    assert_eq!(gateway.agent_count(), 1);

    gateway.close();
    Ok(())
}
