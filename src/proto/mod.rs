// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The NXTCP wire codec.
//!
//! Every packet on the wire is framed as
//!
//! ```text
//! +----------------+--------+--------------------+
//! | length u32, BE | type u8| body (length bytes)|
//! +----------------+--------+--------------------+
//! ```
//!
//! where `length` counts body bytes only, not the 5-byte header.
//! Integer fields are big-endian; a `string` field is a u8 length
//! prefix plus bytes, a `blob` field a u32 length prefix plus bytes.

pub mod decoder;
pub mod encoder;
pub mod packets;
mod wire;

use thiserror::Error;

pub use crate::proto::{
    decoder::Decoder,
    encoder::Encoder,
    packets::{DownstreamPacket, PacketType, UpstreamPacket},
};

/// Size of the `length | type` prefix in front of every body.
pub const FRAME_HEADER_LEN: usize = 5;

/// Upper bound on a declared body length. The largest legal body is a
/// 32 KiB blob plus a name and a few fixed fields, so anything above
/// this is stream corruption and unrecoverable.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Returned when a frame cannot be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown packet type 0x{0:02x}")]
    UnknownType(u8),
    #[error("{0:?} is not a downstream packet type")]
    NotDownstream(PacketType),
    #[error("{0:?} is not an upstream packet type")]
    NotUpstream(PacketType),
    #[error("declared frame body of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),
    #[error("truncated frame: {field} needs {needed} more bytes")]
    Truncated { field: &'static str, needed: usize },
    #[error("{field} length {length} exceeds remaining frame size {remaining}")]
    FieldOverrun {
        field: &'static str,
        length: usize,
        remaining: usize,
    },
    #[error("invalid {field} value {value}")]
    InvalidValue { field: &'static str, value: u8 },
}

impl DecodeError {
    /// Whether the error poisons the byte stream itself. Non-fatal
    /// errors consume exactly one frame and decoding can continue with
    /// the next one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FrameTooLarge(_))
    }
}
