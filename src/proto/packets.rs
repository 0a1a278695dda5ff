// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed encode/decode of every NXTCP packet variant.
//!
//! Both directions implement both operations: the client only ever
//! sends upstream packets and receives downstream ones, but the
//! symmetric halves keep the codec testable as a round-trip and let
//! test harnesses speak the protocol with the same types.

use bytes::Bytes;

use crate::{
    proto::{
        DecodeError, FRAME_HEADER_LEN,
        wire::{FrameReader, FrameWriter},
    },
    verbs::{InterestStatus, MessageStatus, SessionState},
};

/// All packet types defined by the protocol.
///
/// Types below 0x80 carry application verbs; types at or above 0x80
/// belong to the link layer (keepalive, handshake, goodbye).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Login = 0x01,
    Session = 0x02,
    Logout = 0x03,
    Request = 0x04,
    Call = 0x05,
    Post = 0x06,
    Message = 0x07,
    Subscribe = 0x08,
    Interest = 0x09,
    Unsubscribe = 0x10,
    Ping = 0x80,
    Pong = 0x81,
    Welcome = 0x82,
    ByeBye = 0x83,
    Quit = 0x84,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::Login,
            0x02 => Self::Session,
            0x03 => Self::Logout,
            0x04 => Self::Request,
            0x05 => Self::Call,
            0x06 => Self::Post,
            0x07 => Self::Message,
            0x08 => Self::Subscribe,
            0x09 => Self::Interest,
            0x10 => Self::Unsubscribe,
            0x80 => Self::Ping,
            0x81 => Self::Pong,
            0x82 => Self::Welcome,
            0x83 => Self::ByeBye,
            0x84 => Self::Quit,
            _ => return None,
        })
    }
}

const LOGIN_FLAG_PERSIST: u8 = 1;
const LOGIN_FLAG_STANDBY: u8 = 1 << 1;
const LOGIN_FLAG_ENFORCE: u8 = 1 << 2;
const FLAG_UNIDIRECTIONAL: u8 = 1;

/// A client-to-server packet.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamPacket {
    Login {
        persist: bool,
        standby: bool,
        enforce: bool,
        name: Bytes,
    },
    Logout {
        name: Bytes,
    },
    Request {
        name: Bytes,
        unidirectional: bool,
        messageref: u32,
        timeout_ms: u32,
        payload: Bytes,
    },
    Post {
        postref: u32,
        payload: Bytes,
    },
    Subscribe {
        messageref: u32,
        name: Bytes,
        topic: Bytes,
    },
    Unsubscribe {
        name: Bytes,
        topic: Bytes,
    },
    Pong,
    Quit,
}

impl UpstreamPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Login { .. } => PacketType::Login,
            Self::Logout { .. } => PacketType::Logout,
            Self::Request { .. } => PacketType::Request,
            Self::Post { .. } => PacketType::Post,
            Self::Subscribe { .. } => PacketType::Subscribe,
            Self::Unsubscribe { .. } => PacketType::Unsubscribe,
            Self::Pong => PacketType::Pong,
            Self::Quit => PacketType::Quit,
        }
    }

    /// Encodes the packet as one complete frame, header included.
    pub fn encode(&self) -> Bytes {
        let mut frame = FrameWriter::new(self.packet_type());
        match self {
            Self::Login {
                persist,
                standby,
                enforce,
                name,
            } => {
                let mut flags = 0;
                if *persist {
                    flags |= LOGIN_FLAG_PERSIST;
                }
                if *standby {
                    flags |= LOGIN_FLAG_STANDBY;
                }
                if *enforce {
                    flags |= LOGIN_FLAG_ENFORCE;
                }
                frame.u8(flags);
                frame.string(name);
            },
            Self::Logout { name } => {
                frame.string(name);
            },
            Self::Request {
                name,
                unidirectional,
                messageref,
                timeout_ms,
                payload,
            } => {
                frame.string(name);
                frame.u8(if *unidirectional { FLAG_UNIDIRECTIONAL } else { 0 });
                // a request that expects no answer carries no reference,
                // whatever the caller allocated
                frame.u32(if *unidirectional { 0 } else { *messageref });
                frame.u32(*timeout_ms);
                frame.blob(payload);
            },
            Self::Post { postref, payload } => {
                frame.u32(*postref);
                frame.blob(payload);
            },
            Self::Subscribe {
                messageref,
                name,
                topic,
            } => {
                frame.u32(*messageref);
                frame.string(name);
                frame.blob(topic);
            },
            Self::Unsubscribe { name, topic } => {
                frame.string(name);
                frame.blob(topic);
            },
            Self::Pong | Self::Quit => {},
        }
        frame.finish()
    }

    /// Decodes one frame body of the given type.
    pub fn decode(packet_type: PacketType, body: &[u8]) -> Result<Self, DecodeError> {
        let mut frame = FrameReader::new(body);
        match packet_type {
            PacketType::Login => {
                let flags = frame.u8("flags")?;
                let name = frame.string("name")?;
                Ok(Self::Login {
                    persist: flags & LOGIN_FLAG_PERSIST != 0,
                    standby: flags & LOGIN_FLAG_STANDBY != 0,
                    enforce: flags & LOGIN_FLAG_ENFORCE != 0,
                    name: Bytes::copy_from_slice(name),
                })
            },
            PacketType::Logout => {
                let name = frame.string("name")?;
                Ok(Self::Logout {
                    name: Bytes::copy_from_slice(name),
                })
            },
            PacketType::Request => {
                let name = Bytes::copy_from_slice(frame.string("name")?);
                let flags = frame.u8("flags")?;
                let messageref = frame.u32("messageref")?;
                let timeout_ms = frame.u32("timeout")?;
                let payload = Bytes::copy_from_slice(frame.blob("payload")?);
                Ok(Self::Request {
                    name,
                    unidirectional: flags & FLAG_UNIDIRECTIONAL != 0,
                    messageref,
                    timeout_ms,
                    payload,
                })
            },
            PacketType::Post => Ok(Self::Post {
                postref: frame.u32("postref")?,
                payload: Bytes::copy_from_slice(frame.blob("payload")?),
            }),
            PacketType::Subscribe => Ok(Self::Subscribe {
                messageref: frame.u32("messageref")?,
                name: Bytes::copy_from_slice(frame.string("name")?),
                topic: Bytes::copy_from_slice(frame.blob("topic")?),
            }),
            PacketType::Unsubscribe => Ok(Self::Unsubscribe {
                name: Bytes::copy_from_slice(frame.string("name")?),
                topic: Bytes::copy_from_slice(frame.blob("topic")?),
            }),
            PacketType::Pong => Ok(Self::Pong),
            PacketType::Quit => Ok(Self::Quit),
            other => Err(DecodeError::NotUpstream(other)),
        }
    }

    /// Decodes one complete frame, header included. Intended for test
    /// harnesses that already hold exactly one frame.
    pub fn decode_frame(frame: &[u8]) -> Result<Self, DecodeError> {
        let (packet_type, body) = split_frame(frame)?;
        Self::decode(packet_type, body)
    }
}

/// A server-to-client packet.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamPacket {
    Session {
        state: SessionState,
        name: Bytes,
    },
    Call {
        unidirectional: bool,
        postref: u32,
        name: Bytes,
        payload: Bytes,
    },
    Message {
        status: MessageStatus,
        messageref: u32,
        /// Present iff `status` is OK; other statuses ignore any
        /// trailing bytes on the wire.
        payload: Option<Bytes>,
    },
    Interest {
        status: InterestStatus,
        postref: u32,
        name: Bytes,
        topic: Bytes,
    },
    Ping,
    Welcome {
        server_version: u32,
        protocol_version: u32,
    },
    ByeBye,
}

impl DownstreamPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Session { .. } => PacketType::Session,
            Self::Call { .. } => PacketType::Call,
            Self::Message { .. } => PacketType::Message,
            Self::Interest { .. } => PacketType::Interest,
            Self::Ping => PacketType::Ping,
            Self::Welcome { .. } => PacketType::Welcome,
            Self::ByeBye => PacketType::ByeBye,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut frame = FrameWriter::new(self.packet_type());
        match self {
            Self::Session { state, name } => {
                frame.u8(*state as u8);
                frame.string(name);
            },
            Self::Call {
                unidirectional,
                postref,
                name,
                payload,
            } => {
                frame.u8(if *unidirectional { FLAG_UNIDIRECTIONAL } else { 0 });
                frame.u32(*postref);
                frame.string(name);
                frame.blob(payload);
            },
            Self::Message {
                status,
                messageref,
                payload,
            } => {
                frame.u8(status.wire_value());
                frame.u32(*messageref);
                if let Some(payload) = payload {
                    frame.blob(payload);
                }
            },
            Self::Interest {
                status,
                postref,
                name,
                topic,
            } => {
                frame.u8(status.wire_value());
                frame.u32(*postref);
                frame.string(name);
                frame.blob(topic);
            },
            Self::Welcome {
                server_version,
                protocol_version,
            } => {
                frame.u32(*server_version);
                frame.u32(*protocol_version);
            },
            Self::Ping | Self::ByeBye => {},
        }
        frame.finish()
    }

    pub fn decode(packet_type: PacketType, body: &[u8]) -> Result<Self, DecodeError> {
        let mut frame = FrameReader::new(body);
        match packet_type {
            PacketType::Session => {
                let raw_state = frame.u8("state")?;
                let state = SessionState::from_u8(raw_state).ok_or(
                    DecodeError::InvalidValue {
                        field: "state",
                        value: raw_state,
                    },
                )?;
                let name = Bytes::copy_from_slice(frame.string("name")?);
                Ok(Self::Session { state, name })
            },
            PacketType::Call => {
                let flags = frame.u8("flags")?;
                Ok(Self::Call {
                    unidirectional: flags & FLAG_UNIDIRECTIONAL != 0,
                    postref: frame.u32("postref")?,
                    name: Bytes::copy_from_slice(frame.string("name")?),
                    payload: Bytes::copy_from_slice(frame.blob("payload")?),
                })
            },
            PacketType::Message => {
                let raw_status = frame.u8("status")?;
                let status = MessageStatus::from_wire(raw_status).ok_or(
                    DecodeError::InvalidValue {
                        field: "status",
                        value: raw_status,
                    },
                )?;
                let messageref = frame.u32("messageref")?;
                let payload = if status == MessageStatus::OK {
                    Some(Bytes::copy_from_slice(frame.blob("payload")?))
                } else {
                    None
                };
                Ok(Self::Message {
                    status,
                    messageref,
                    payload,
                })
            },
            PacketType::Interest => {
                let raw_status = frame.u8("status")?;
                let status = InterestStatus::from_wire(raw_status).ok_or(
                    DecodeError::InvalidValue {
                        field: "status",
                        value: raw_status,
                    },
                )?;
                Ok(Self::Interest {
                    status,
                    postref: frame.u32("postref")?,
                    name: Bytes::copy_from_slice(frame.string("name")?),
                    topic: Bytes::copy_from_slice(frame.blob("topic")?),
                })
            },
            PacketType::Ping => Ok(Self::Ping),
            PacketType::Welcome => Ok(Self::Welcome {
                server_version: frame.u32("server_version")?,
                protocol_version: frame.u32("protocol_version")?,
            }),
            PacketType::ByeBye => Ok(Self::ByeBye),
            other => Err(DecodeError::NotDownstream(other)),
        }
    }

    /// Decodes one complete frame, header included.
    pub fn decode_frame(frame: &[u8]) -> Result<Self, DecodeError> {
        let (packet_type, body) = split_frame(frame)?;
        Self::decode(packet_type, body)
    }
}

fn split_frame(frame: &[u8]) -> Result<(PacketType, &[u8]), DecodeError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::Truncated {
            field: "header",
            needed: FRAME_HEADER_LEN - frame.len(),
        });
    }
    let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body = &frame[FRAME_HEADER_LEN..];
    if body.len() < length {
        return Err(DecodeError::Truncated {
            field: "body",
            needed: length - body.len(),
        });
    }
    let packet_type =
        PacketType::from_u8(frame[4]).ok_or(DecodeError::UnknownType(frame[4]))?;
    Ok((packet_type, &body[..length]))
}
