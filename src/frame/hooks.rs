// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

use crate::frame::codec::FrameHeader;

/// Smallest message id accepted from clients.
pub const MIN_MSG_ID: u16 = 1000;
/// Largest message id accepted from clients.
pub const MAX_MSG_ID: u16 = 60000;
/// Smallest legal `size` value: a bare header with no body.
pub const MIN_FRAME_SIZE: u32 = 10;
/// Largest legal `size` value: 1 MiB including the header.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad header id: {0}")]
    BadHeaderId(u16),
    #[error("bad header size: {0}")]
    BadHeaderSize(u32),
}

/// Validates a decoded header before the body is read.
///
/// The `seq` word is a crc placeholder and stays unchecked.
pub fn hook_header(header: &FrameHeader) -> Result<(), FrameError> {
    let id = header.id();
    if !(MIN_MSG_ID..=MAX_MSG_ID).contains(&id) {
        return Err(FrameError::BadHeaderId(id));
    }

    let size = header.size();
    if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&size) {
        return Err(FrameError::BadHeaderSize(size));
    }

    Ok(())
}

/// Validates a complete body before it enters the pipeline. Runs for every
/// frame, including ones with an empty body.
pub fn hook_body(_header: &FrameHeader, _body: &[u8]) -> Result<(), FrameError> {
    Ok(())
}
