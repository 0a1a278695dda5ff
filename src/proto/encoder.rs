// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Outgoing frame queue with partial-write semantics.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::proto::UpstreamPacket;

/// FIFO queue of encoded frames waiting for the socket.
///
/// Draining works in two steps: [`Encoder::fetch_chunk`] hands out the
/// unwritten tail of the frame at the head of the queue, and
/// [`Encoder::commit`] advances past however many bytes the socket
/// actually accepted. The commit pointer never moves on its own, so a
/// short write simply leaves the remainder for the next fetch.
#[derive(Debug, Default)]
pub struct Encoder {
    queue: VecDeque<Bytes>,
    current: Option<Bytes>,
    committed: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a packet and appends the framed bytes to the queue.
    pub fn encode(&mut self, packet: &UpstreamPacket) {
        self.queue.push_back(packet.encode());
    }

    /// Returns the bytes that should be written next, or `None` when
    /// the queue is drained.
    pub fn fetch_chunk(&mut self) -> Option<Bytes> {
        if self.current.is_none() {
            self.current = self.queue.pop_front();
            self.committed = 0;
        }
        self.current
            .as_ref()
            .map(|chunk| chunk.slice(self.committed..))
    }

    /// Records that `n` fetched bytes reached the socket.
    pub fn commit(&mut self, n: usize) {
        if let Some(chunk) = &self.current {
            self.committed = (self.committed + n).min(chunk.len());
            if self.committed == chunk.len() {
                self.current = None;
                self.committed = 0;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }
}
