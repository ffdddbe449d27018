// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One `Agent` per live TCP connection: the read loop that feeds the
//! pipeline, the write loop that drains the outbound slab, and the
//! finalizer that runs exactly once when both loops have exited.

/// Timeouts and error classification shared by the loops.
pub mod common;

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
};

use anyhow::{Result, anyhow};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::AsyncReadExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    agent::common::{
        READ_TIMEOUT, WAKE_CAPACITY, WAKE_GRACE, WRITE_TIMEOUT, io_with_timeout,
        is_expected_disconnect,
    },
    alert::Alerter,
    frame::{
        codec::{FRAME_HEADER_LEN, FrameHeader},
        hooks::{hook_body, hook_header},
        writer::{FrameWriter, WriterError},
    },
    gateway::Gateway,
    metric::Metrics,
    pipeline::{DISCONNECT_MSG_ID, Msg, Pipeline},
};

/// Per-session middleware state. A fixed struct instead of a dynamic
/// key/value map: the set of slots the pipeline needs is known.
#[derive(Debug, Default)]
pub struct AgentVars {
    /// Concurrently dispatched pipeline tasks for this session.
    pub in_flight: AtomicI32,
    sequence: AtomicU32,
}

impl AgentVars {
    /// Next request sequence number, wrapping before `i32::MAX` so the
    /// backend can store it in a signed column.
    pub fn next_sequence(&self) -> u32 {
        const SEQ_WRAP: u32 = i32::MAX as u32 - 10_000;
        let _ = self.sequence.compare_exchange(
            SEQ_WRAP,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// The gateway's state for one live client connection.
#[derive(Debug)]
pub struct Agent {
    cid: String,
    sid: Arc<str>,
    address: String,
    gateway: Weak<Gateway>,
    pipeline: Arc<Pipeline>,
    metrics: Arc<Metrics>,
    alerts: Arc<Alerter>,

    reader: Mutex<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,

    cancel: CancellationToken,
    disabled: AtomicBool,
    finalized: AtomicBool,
    vars: AgentVars,
}

impl Agent {
    pub fn new(
        gateway: &Arc<Gateway>,
        stream: TcpStream,
        cid: String,
    ) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let address = stream.peer_addr()?.to_string();
        let (r, w) = stream.into_split();
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_CAPACITY);

        Ok(Arc::new(Self {
            cid,
            sid: gateway.server_id(),
            address,
            gateway: Arc::downgrade(gateway),
            pipeline: gateway.pipeline(),
            metrics: gateway.metrics(),
            alerts: gateway.alerts(),
            reader: Mutex::new(r),
            writer: FrameWriter::new(w),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            cancel: CancellationToken::new(),
            disabled: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            vars: AgentVars::default(),
        }))
    }

    /// Starts the read and write loops plus the supervisor that finalizes
    /// the session after both have exited.
    pub fn run(self: &Arc<Self>) {
        let reader = self.clone();
        let read = tokio::spawn(async move {
            let res = reader.clone().loop_read().await;
            reader.cancel.cancel();
            if let Err(e) = res
                && !is_expected_disconnect(&e)
            {
                reader.alerts.low_frequency(
                    e.to_string(),
                    format!(
                        "agent: {} id: {} loop read exit: {e:#}",
                        reader.address(),
                        reader.cid()
                    ),
                );
            }
        });

        let writer = self.clone();
        let write = tokio::spawn(async move {
            let res = writer.clone().loop_write().await;
            writer.cancel.cancel();
            if let Err(e) = res
                && !is_expected_disconnect(&e)
            {
                writer.alerts.low_frequency(
                    e.to_string(),
                    format!(
                        "agent: {} id: {} loop write exit: {e:#}",
                        writer.address(),
                        writer.cid()
                    ),
                );
            }
        });

        let agent = self.clone();
        tokio::spawn(async move {
            let (r, w) = tokio::join!(read, write);
            for join in [r, w] {
                if let Err(e) = join
                    && e.is_panic()
                {
                    agent.alerts.auto(format!(
                        "agent panic, id: {} ip: {}",
                        agent.cid(),
                        agent.address()
                    ));
                }
            }
            agent.finalize().await;
        });
    }

    /// Read loop: header, hooks, body, pipeline. Any error terminates the
    /// session; classification decides whether it is alert-worthy.
    async fn loop_read(self: Arc<Self>) -> Result<()> {
        let chain = self.pipeline.chain();
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        loop {
            {
                let mut r = self.reader.lock().await;
                io_with_timeout(
                    "read header",
                    r.read_exact(&mut header_buf),
                    READ_TIMEOUT,
                    &self.cancel,
                )
                .await?;
            }

            let header = FrameHeader::from_wire(&header_buf)?;
            hook_header(&header)?;

            let mut body = BytesMut::zeroed(header.body_len());
            if !body.is_empty() {
                let mut r = self.reader.lock().await;
                io_with_timeout(
                    "read body",
                    r.read_exact(&mut body[..]),
                    READ_TIMEOUT,
                    &self.cancel,
                )
                .await?;
            }
            let body = body.freeze();
            hook_body(&header, &body)?;

            // A kicked session keeps draining frames but forwards nothing.
            if !self.is_disabled() {
                chain(
                    self.clone(),
                    Msg {
                        id: header.id(),
                        body,
                    },
                )
                .await?;
            }
        }
    }

    /// Write loop: block on the wake signal, drain the slab, flush.
    async fn loop_write(self: Arc<Self>) -> Result<()> {
        let mut rx = self
            .wake_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("write loop already running"))?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                wake = rx.recv() => {
                    if wake.is_none() {
                        return Ok(());
                    }

                    let buf = self.writer.pop()?;
                    if buf.is_empty() {
                        continue;
                    }

                    self.writer.flush(&buf, WRITE_TIMEOUT, &self.cancel).await?;
                },
            }
        }
    }

    /// Enqueues a frame and nudges the write loop. Buffer first, signal
    /// second, so a dropped signal can never lose the frame.
    pub async fn write(&self, id: u16, body: &[u8]) -> Result<(), WriterError> {
        self.writer.write(id, body, 0)?;
        let _ = timeout(WAKE_GRACE, self.wake_tx.send(())).await;
        Ok(())
    }

    /// Cancels the session; idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Stops forwarding inbound frames and suppresses the disconnect
    /// notification on close.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn enable(&self) {
        self.disabled.store(false, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Composite id of this gateway node, stamped into backend envelopes.
    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn vars(&self) -> &AgentVars {
        &self.vars
    }

    /// Runs once after both loops exited: unregister, close the socket and
    /// tell the backend the client is gone (unless the session was kicked).
    async fn finalize(self: &Arc<Self>) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        self.metrics.count_connection.fetch_sub(1, Ordering::Relaxed);
        if let Some(gateway) = self.gateway.upgrade() {
            gateway.remove_agent(&self.cid);
        }
        self.writer.shutdown().await;

        if self.disabled.swap(true, Ordering::SeqCst) {
            return;
        }

        let forward = self.pipeline.forward();
        if let Err(e) = forward(
            self.clone(),
            Msg {
                id: DISCONNECT_MSG_ID,
                body: Bytes::new(),
            },
        )
        .await
        {
            self.alerts.low_frequency(
                e.to_string(),
                format!(
                    "agent: {} id: {} disconnect notify fail: {e}",
                    self.address, self.cid
                ),
            );
        }
    }
}
