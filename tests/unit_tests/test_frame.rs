// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use hex::FromHex;
use tcp_gateway_rs::frame::{
    codec::{FRAME_HEADER_LEN, FrameHeader, encode},
    hooks::{FrameError, MAX_FRAME_SIZE, MAX_MSG_ID, MIN_FRAME_SIZE, MIN_MSG_ID, hook_body, hook_header},
};

fn header_of(frame: &[u8]) -> Result<FrameHeader> {
    let mut buf = [0u8; FRAME_HEADER_LEN];
    buf.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
    FrameHeader::from_wire(&buf)
}

#[test]
fn encode_decode_round_trip() -> Result<()> {
    let body = b"hello gateway";
    let frame = encode(1500, body, 42);

    assert_eq!(frame.len(), FRAME_HEADER_LEN + body.len());

    let header = header_of(&frame)?;
    assert_eq!(header.id(), 1500);
    assert_eq!(header.size() as usize, FRAME_HEADER_LEN + body.len());
    assert_eq!(header.seq(), 42);
    assert_eq!(header.body_len(), body.len());
    assert_eq!(&frame[FRAME_HEADER_LEN..], body);

    Ok(())
}

#[test]
fn wire_layout_is_little_endian() -> Result<()> {
    // id=1500 (0x05DC), size=12 (0x0C), seq=7, body="ok"
    let expected = Vec::from_hex("dc050c000000070000006f6b")?;
    let frame = encode(1500, b"ok", 7);
    assert_eq!(&frame[..], &expected[..]);

    let header = header_of(&expected)?;
    assert_eq!(header.id(), 1500);
    assert_eq!(header.size(), 12);
    assert_eq!(header.seq(), 7);

    Ok(())
}

#[test]
fn zero_length_body_is_a_valid_frame() -> Result<()> {
    let frame = encode(1500, b"", 0);
    assert_eq!(frame.len(), FRAME_HEADER_LEN);

    let header = header_of(&frame)?;
    assert_eq!(header.size(), MIN_FRAME_SIZE);
    assert_eq!(header.body_len(), 0);
    assert_eq!(hook_header(&header), Ok(()));
    assert_eq!(hook_body(&header, b""), Ok(()));

    Ok(())
}

#[test]
fn hook_header_accepts_boundary_values() {
    for (id, size) in [
        (MIN_MSG_ID, MIN_FRAME_SIZE),
        (MAX_MSG_ID, MAX_FRAME_SIZE),
        (1500, 1024),
    ] {
        let header = FrameHeader::new(id, size, 0);
        assert_eq!(hook_header(&header), Ok(()), "id={id} size={size}");
    }
}

#[test]
fn hook_header_rejects_out_of_range_ids() {
    for id in [0, 999, 60001, u16::MAX] {
        let header = FrameHeader::new(id, 64, 0);
        assert_eq!(hook_header(&header), Err(FrameError::BadHeaderId(id)));
    }
}

#[test]
fn hook_header_rejects_out_of_range_sizes() {
    for size in [0, 9, MAX_FRAME_SIZE + 1] {
        let header = FrameHeader::new(1500, size, 0);
        assert_eq!(hook_header(&header), Err(FrameError::BadHeaderSize(size)));
    }
}
