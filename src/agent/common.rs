// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::frame::{hooks::FrameError, writer::WriterError};

/// A session with no complete frame for this long is torn down.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for flushing one drained slab to the socket.
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long `Agent::write` waits to enqueue a wake signal before dropping
/// it. The frame itself is already buffered at that point.
pub(crate) const WAKE_GRACE: Duration = Duration::from_millis(5);
/// Capacity of the wake channel. Overflow is safe: `pop` drains everything
/// buffered, so a dropped signal never strands a frame.
pub(crate) const WAKE_CAPACITY: usize = 5;

#[derive(Debug, Error)]
pub enum SessionIoError {
    #[error("{0} deadline exceeded")]
    Deadline(&'static str),
    #[error("{0} cancelled")]
    Cancelled(&'static str),
}

pub(crate) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SessionIoError::Cancelled(label).into()),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(SessionIoError::Deadline(label).into()),
            }
        }
    }
}

fn is_expected_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::TimedOut
    )
}

/// Classifies loop-exit errors. Expected disconnects (peer gone, deadline,
/// cancellation, malformed frame) tear the session down silently; anything
/// else is worth an alert.
pub fn is_expected_disconnect(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<SessionIoError>().is_some() {
        return true;
    }
    if err.downcast_ref::<FrameError>().is_some() {
        return true;
    }
    if let Some(e) = err.downcast_ref::<std::io::Error>() {
        return is_expected_kind(e.kind());
    }
    if let Some(e) = err.downcast_ref::<WriterError>() {
        return is_expected_kind(e.kind());
    }

    false
}
