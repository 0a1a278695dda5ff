// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Streaming decoder for the downstream half of the protocol.

use bytes::BytesMut;

use crate::proto::{DecodeError, DownstreamPacket, FRAME_HEADER_LEN, MAX_FRAME_LEN, PacketType};

/// Accumulates arbitrary byte chunks from the socket and yields one
/// decoded packet at a time.
///
/// Buffering is byte-granular: a frame split across any number of reads
/// decodes once the last byte arrives, and no byte is ever dropped on a
/// partial read. A frame is consumed from the buffer before its body is
/// parsed, so per-frame errors (unknown type, overrun fields, bad enum
/// values) leave the decoder aligned on the next frame; only
/// [`DecodeError::is_fatal`] errors poison the stream.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Appends a chunk of raw undecoded bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Tries to decode a single packet from the buffered bytes.
    ///
    /// Returns `Ok(None)` when not enough data has arrived yet.
    pub fn try_decode(&mut self) -> Result<Option<DownstreamPacket>, DecodeError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if length as usize > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(length));
        }

        let total = FRAME_HEADER_LEN + length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        // the whole frame is present; consume it before parsing so that
        // body errors cannot desynchronise the stream
        let frame = self.buf.split_to(total);
        let raw_type = frame[4];
        let packet_type =
            PacketType::from_u8(raw_type).ok_or(DecodeError::UnknownType(raw_type))?;

        DownstreamPacket::decode(packet_type, &frame[FRAME_HEADER_LEN..]).map(Some)
    }
}
