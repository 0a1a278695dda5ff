// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Field-level primitives shared by the packet encoders and decoders.

use bytes::{BufMut, Bytes, BytesMut};

use crate::proto::{DecodeError, FRAME_HEADER_LEN, PacketType};

/// Cursor over one frame body. All reads are bounds-checked against the
/// body slice; a field that runs past the end is a [`DecodeError`], not
/// a panic.
pub(crate) struct FrameReader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { body, pos: 0 }
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        let bytes = self.take(1, field)?;
        Ok(bytes[0])
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// u8 length prefix plus that many bytes.
    pub fn string(&mut self, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let length = self.u8(field)? as usize;
        self.take_var(length, field)
    }

    /// u32 length prefix plus that many bytes.
    pub fn blob(&mut self, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let length = self.u32(field)? as usize;
        self.take_var(length, field)
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let remaining = self.body.len() - self.pos;
        if remaining < n {
            return Err(DecodeError::Truncated {
                field,
                needed: n - remaining,
            });
        }
        let slice = &self.body[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_var(
        &mut self,
        length: usize,
        field: &'static str,
    ) -> Result<&'a [u8], DecodeError> {
        let remaining = self.body.len() - self.pos;
        if length > remaining {
            return Err(DecodeError::FieldOverrun {
                field,
                length,
                remaining,
            });
        }
        self.take(length, field)
    }
}

/// Builds one complete frame. The 5-byte header is reserved up front
/// and back-filled with the body length on [`FrameWriter::finish`].
pub(crate) struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new(packet_type: PacketType) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0);
        buf.put_u8(packet_type as u8);
        Self { buf }
    }

    pub fn u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Caller guarantees `value` fits a u8 length prefix; names are
    /// capped at 255 bytes by construction.
    pub fn string(&mut self, value: &[u8]) {
        debug_assert!(value.len() <= u8::MAX as usize);
        self.buf.put_u8(value.len() as u8);
        self.buf.put_slice(value);
    }

    pub fn blob(&mut self, value: &[u8]) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    pub fn finish(mut self) -> Bytes {
        let length = (self.buf.len() - FRAME_HEADER_LEN) as u32;
        self.buf[0..4].copy_from_slice(&length.to_be_bytes());
        self.buf.freeze()
    }
}
