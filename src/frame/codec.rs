// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The client-facing frame layout (all fields little-endian):
//!
//! ```text
//! offset  0 : u16 id      message id (1000..60000)
//! offset  2 : u32 size    total frame length including this header
//! offset  6 : u32 seq     reserved; crc placeholder, echoed on outbound
//! offset 10 : bytes body  (size - 10 bytes)
//! ```

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
};

/// Length of the fixed frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 10;

/// Fixed header prefixed to every frame on the wire.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    pub id: U16<LittleEndian>,   // 0..2
    pub size: U32<LittleEndian>, // 2..6
    pub seq: U32<LittleEndian>,  // 6..10
}

impl FrameHeader {
    pub fn new(id: u16, size: u32, seq: u32) -> Self {
        Self {
            id: U16::new(id),
            size: U32::new(size),
            seq: U32::new(seq),
        }
    }

    /// Reinterprets 10 raw wire bytes as a header. No validation happens
    /// here; the caller runs the header hook on the result.
    pub fn from_wire(buf: &[u8; FRAME_HEADER_LEN]) -> Result<Self> {
        Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to convert buffer FrameHeader: {e}"))
    }

    pub fn id(&self) -> u16 {
        self.id.get()
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    pub fn seq(&self) -> u32 {
        self.seq.get()
    }

    /// Body length implied by `size`; the header itself counts towards
    /// `size`, so a minimal frame (`size == 10`) has an empty body.
    pub fn body_len(&self) -> usize {
        (self.size.get() as usize).saturating_sub(FRAME_HEADER_LEN)
    }
}

/// Encodes a complete frame: header (`size = len(body) + 10`) followed by
/// the body.
pub fn encode(id: u16, body: &[u8], seq: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    let header = FrameHeader::new(id, (body.len() + FRAME_HEADER_LEN) as u32, seq);
    buf.put_slice(header.as_bytes());
    buf.put_slice(body);
    buf.freeze()
}

/// Appends an encoded frame to an existing buffer. Used by the outbound
/// writer so successive frames share one slab.
pub fn encode_into(out: &mut Vec<u8>, id: u16, body: &[u8], seq: u32) {
    out.reserve(FRAME_HEADER_LEN + body.len());
    let header = FrameHeader::new(id, (body.len() + FRAME_HEADER_LEN) as u32, seq);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
}
