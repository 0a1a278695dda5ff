// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Payload serialization. Payloads are opaque blobs at the protocol
//! layer; the channel runs every application value through a
//! [`Serializer`] on its way in and out.

use std::fmt::Write;

use bytes::Bytes;

/// Pluggable payload codec, chosen at channel construction.
pub trait Serializer: Send + Sync {
    fn encode(&self, value: &str) -> Bytes;

    /// Decoding must not fail: a server payload the application cannot
    /// read should still be presentable, e.g. for logging.
    fn decode(&self, raw: &[u8]) -> String;
}

/// The default serializer: UTF-8 out, permissive UTF-8 in. Invalid
/// bytes survive decoding as `\xNN` escape sequences instead of being
/// replaced or rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl Serializer for StringSerializer {
    fn encode(&self, value: &str) -> Bytes {
        Bytes::copy_from_slice(value.as_bytes())
    }

    fn decode(&self, raw: &[u8]) -> String {
        let mut out = String::with_capacity(raw.len());
        for chunk in raw.utf8_chunks() {
            out.push_str(chunk.valid());
            for byte in chunk.invalid() {
                write!(out, "\\x{byte:02x}").expect("writing to a String cannot fail");
            }
        }
        out
    }
}
