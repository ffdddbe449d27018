// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, sync::Mutex, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::frame::codec::encode_into;

/// When the drained slab's backing storage grows past this, the allocation
/// is released instead of being reused, bounding steady-state memory.
pub const MAX_SLAB_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriterError {
    /// A flush failed once; the writer latches the failure and every later
    /// `write` / `pop` / `flush` returns this same value.
    #[error("writer poisoned: {reason}")]
    Poisoned {
        kind: io::ErrorKind,
        reason: String,
    },
}

impl WriterError {
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            WriterError::Poisoned { kind, .. } => *kind,
        }
    }
}

/// Outbound half of a session: an append-only frame slab in front of the
/// socket write half.
///
/// `write` appends under a short mutex, `pop` drains the whole slab, and
/// `flush` is the only place that touches the socket. The slab is the sole
/// linearisation point for writes, so frames leave the socket in enqueue
/// order as long as a single task calls `pop` + `flush`.
#[derive(Debug)]
pub struct FrameWriter<W> {
    stream: tokio::sync::Mutex<W>,
    slab: Mutex<Vec<u8>>,
    err: Mutex<Option<WriterError>>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream: tokio::sync::Mutex::new(stream),
            slab: Mutex::new(Vec::new()),
            err: Mutex::new(None),
        }
    }

    /// Returns the latched flush error, if any.
    pub fn sticky(&self) -> Option<WriterError> {
        self.err
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn latch(&self, kind: io::ErrorKind, reason: String) -> WriterError {
        let mut err = self
            .err
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = err.as_ref() {
            return existing.clone();
        }
        let e = WriterError::Poisoned { kind, reason };
        *err = Some(e.clone());
        e
    }

    /// Appends one encoded frame to the slab.
    pub fn write(&self, id: u16, body: &[u8], seq: u32) -> Result<(), WriterError> {
        if let Some(e) = self.sticky() {
            return Err(e);
        }

        let mut slab = self
            .slab
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        encode_into(&mut slab, id, body, seq);
        Ok(())
    }

    /// Drains the slab, returning everything buffered since the last call.
    ///
    /// The returned buffer may be empty when a wake raced with a previous
    /// drain; callers skip flushing in that case.
    pub fn pop(&self) -> Result<Vec<u8>, WriterError> {
        if let Some(e) = self.sticky() {
            return Err(e);
        }

        let mut slab = self
            .slab
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let out = slab.clone();

        if slab.capacity() > MAX_SLAB_CAPACITY {
            *slab = Vec::new();
        } else {
            slab.clear();
        }

        Ok(out)
    }

    /// Writes a drained buffer to the socket under `deadline`. Any failure
    /// (short of cancellation) poisons the writer permanently.
    pub async fn flush(
        &self,
        buf: &[u8],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), WriterError> {
        if let Some(e) = self.sticky() {
            return Err(e);
        }

        let mut stream = self.stream.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            res = timeout(deadline, stream.write_all(buf)) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(self.latch(e.kind(), e.to_string())),
                Err(_) => Err(self.latch(
                    io::ErrorKind::TimedOut,
                    "write deadline exceeded".to_string(),
                )),
            },
        }
    }

    /// Half-closes the write side; errors are ignored when the peer is
    /// already gone.
    pub async fn shutdown(&self) {
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
    }

    #[cfg(test)]
    fn slab_capacity(&self) -> usize {
        self.slab
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .capacity()
    }
}
