// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The verb model: logical NXTCP operations one level above the wire
//! packets.
//!
//! Upstream verbs (`Login`, `Logout`, `Request`, `Post`, `Subscribe`,
//! `Unsubscribe`) are built by the channel handles and validated before
//! they are allowed anywhere near the backlog. Downstream verbs
//! (`Session`, `Call`, `Message`, `Interest`) are produced by the
//! connection from decoded packets and dispatched to registered
//! handlers.

use std::{fmt, time::Duration};

use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;

/// Maximum length of a name on the wire, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a payload or topic blob, in bytes (32 KiB).
pub const MAX_PAYLOAD_LEN: usize = 32 * 1024;

/// Returned when a verb fails its upstream contract.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerbError {
    #[error("name is shorter than the minimum length of 1 byte")]
    NameEmpty,
    #[error("name of {0} bytes exceeds the maximum length of {MAX_NAME_LEN}")]
    NameTooLong(usize),
    #[error("name contains invalid byte 0x{0:02x}")]
    NameInvalidByte(u8),
    #[error("payload of {0} bytes exceeds the maximum size of {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(usize),
    #[error("reference number must be greater than zero")]
    ZeroReference,
    #[error("status must carry exactly one flag")]
    AmbiguousStatus,
    #[error("{0} verbs cannot be sent upstream")]
    NotUpstream(&'static str),
}

/// A validated endpoint name.
///
/// Names identify a logical endpoint on the server. On the wire a name
/// is a byte sequence of 1..=255 bytes drawn from `0-9 A-Z a-z - _`;
/// the constructor enforces that, so a `Name` held by the rest of the
/// crate is always wire-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name(String);

impl Name {
    pub fn new(name: impl Into<String>) -> Result<Self, VerbError> {
        let name = name.into();
        Self::check(name.as_bytes())?;
        Ok(Self(name))
    }

    /// Builds a name from raw wire bytes, enforcing the same charset as
    /// [`Name::new`]. The charset is pure ASCII, so the UTF-8
    /// conversion below cannot alter the bytes.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, VerbError> {
        Self::check(bytes)?;
        Ok(Self(String::from_utf8_lossy(bytes).into_owned()))
    }

    fn check(bytes: &[u8]) -> Result<(), VerbError> {
        if bytes.is_empty() {
            return Err(VerbError::NameEmpty);
        }
        if bytes.len() > MAX_NAME_LEN {
            return Err(VerbError::NameTooLong(bytes.len()));
        }
        for &b in bytes {
            if !(b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
                return Err(VerbError::NameInvalidByte(b));
            }
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Name {
    type Error = VerbError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

bitflags! {
    /// Delivery status of an inbound message.
    ///
    /// An inbound verb carries exactly one of the base flags; the
    /// composites exist for handler filters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageStatus: u8 {
        const OK = 1;
        const TIMEOUT = 1 << 1;
        const UNREACHABLE = 1 << 2;
        const NOT_OK = Self::TIMEOUT.bits() | Self::UNREACHABLE.bits();
        const ANY = Self::OK.bits() | Self::NOT_OK.bits();
    }
}

impl MessageStatus {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::OK),
            1 => Some(Self::TIMEOUT),
            2 => Some(Self::UNREACHABLE),
            _ => None,
        }
    }

    /// Wire value of a single-flag status.
    pub fn wire_value(self) -> u8 {
        if self.contains(Self::OK) {
            0
        } else if self.contains(Self::TIMEOUT) {
            1
        } else {
            2
        }
    }
}

bitflags! {
    /// Interest state carried by an inbound interest update.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterestStatus: u8 {
        const NO_INTEREST = 1;
        const INTEREST = 1 << 1;
        const ANY = Self::NO_INTEREST.bits() | Self::INTEREST.bits();
    }
}

impl InterestStatus {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NO_INTEREST),
            1 => Some(Self::INTEREST),
            _ => None,
        }
    }

    pub fn wire_value(self) -> u8 {
        if self.contains(Self::INTEREST) { 1 } else { 0 }
    }
}

/// State of a named session as reported by the server.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ended = 0,
    Standby = 1,
    Active = 2,
}

impl SessionState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ended),
            1 => Some(Self::Standby),
            2 => Some(Self::Active),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ended => "ended",
            Self::Standby => "standby",
            Self::Active => "active",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginVerb {
    pub name: Name,
    pub enforce: bool,
    pub standby: bool,
    pub persist: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogoutVerb {
    pub name: Name,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionVerb {
    pub name: Name,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestVerb {
    pub name: Name,
    pub unidirectional: bool,
    /// Set iff the request expects a response; encoded as 0 when
    /// absent or when the request is unidirectional.
    pub messageref: Option<u32>,
    /// Server-side answer deadline; encoded in milliseconds, 0 = none.
    pub timeout: Option<Duration>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallVerb {
    pub unidirectional: bool,
    /// Absent when the caller does not expect a post back.
    pub postref: Option<u32>,
    pub name: Name,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostVerb {
    pub postref: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageVerb {
    pub messageref: u32,
    pub status: MessageStatus,
    /// Present iff `status` is [`MessageStatus::OK`].
    pub payload: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeVerb {
    pub name: Name,
    pub messageref: u32,
    pub topic: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnsubscribeVerb {
    pub name: Name,
    pub topic: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterestVerb {
    pub postref: Option<u32>,
    pub name: Name,
    pub status: InterestStatus,
    pub topic: Bytes,
}

/// A logical protocol operation, one of ten variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    Login(LoginVerb),
    Logout(LogoutVerb),
    Session(SessionVerb),
    Request(RequestVerb),
    Call(CallVerb),
    Post(PostVerb),
    Message(MessageVerb),
    Subscribe(SubscribeVerb),
    Unsubscribe(UnsubscribeVerb),
    Interest(InterestVerb),
}

impl Verb {
    /// Checks the invariants that are not already enforced by the field
    /// types: payload bounds, non-zero reference numbers, single-flag
    /// statuses. Names are validated at construction.
    pub fn validate(&self) -> Result<(), VerbError> {
        match self {
            Verb::Login(_) | Verb::Logout(_) | Verb::Session(_) => Ok(()),
            Verb::Request(v) => {
                check_ref(v.messageref)?;
                check_payload(&v.payload)
            },
            Verb::Call(v) => {
                check_ref(v.postref)?;
                check_payload(&v.payload)
            },
            Verb::Post(v) => {
                check_ref(Some(v.postref))?;
                check_payload(&v.payload)
            },
            Verb::Message(v) => {
                check_ref(Some(v.messageref))?;
                check_status(v.status.bits())?;
                match &v.payload {
                    Some(payload) => check_payload(payload),
                    None => Ok(()),
                }
            },
            Verb::Subscribe(v) => {
                check_ref(Some(v.messageref))?;
                check_payload(&v.topic)
            },
            Verb::Unsubscribe(v) => check_payload(&v.topic),
            Verb::Interest(v) => {
                check_ref(v.postref)?;
                check_status(v.status.bits())?;
                check_payload(&v.topic)
            },
        }
    }

    /// Whether this verb travels client to server.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Verb::Login(_)
                | Verb::Logout(_)
                | Verb::Request(_)
                | Verb::Post(_)
                | Verb::Subscribe(_)
                | Verb::Unsubscribe(_)
        )
    }

    /// Verb name for log lines and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Verb::Login(_) => "Login",
            Verb::Logout(_) => "Logout",
            Verb::Session(_) => "Session",
            Verb::Request(_) => "Request",
            Verb::Call(_) => "Call",
            Verb::Post(_) => "Post",
            Verb::Message(_) => "Message",
            Verb::Subscribe(_) => "Subscribe",
            Verb::Unsubscribe(_) => "Unsubscribe",
            Verb::Interest(_) => "Interest",
        }
    }
}

fn check_payload(payload: &Bytes) -> Result<(), VerbError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(VerbError::PayloadTooLarge(payload.len()));
    }
    Ok(())
}

fn check_ref(reference: Option<u32>) -> Result<(), VerbError> {
    match reference {
        Some(0) => Err(VerbError::ZeroReference),
        _ => Ok(()),
    }
}

fn check_status(bits: u8) -> Result<(), VerbError> {
    if bits.count_ones() == 1 {
        Ok(())
    } else {
        Err(VerbError::AmbiguousStatus)
    }
}
