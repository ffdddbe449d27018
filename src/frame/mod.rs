//! Wire framing: the 10-byte little-endian header, the frame codec, the
//! validation hooks and the back-pressured outbound writer.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Frame header layout and encode/decode helpers.
pub mod codec;
/// Inbound validation hooks applied by the session read loop.
pub mod hooks;
/// Outbound writer with a mutex-guarded slab and sticky flush errors.
pub mod writer;
