// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The TCP connection: owns the socket, the codec pair and the
//! reconnect policy, and translates between verbs and wire packets.
//!
//! A connection is a thin handle around shared state plus a background
//! actor task that drives the state machine (see [`actor`]). The
//! channel core installs a ready observer and a downstream handler and
//! pushes verbs through [`NxtcpConnection::send_verb`]; everything else
//! happens on the actor.

mod actor;
pub mod state;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use crate::connection::state::State;
use crate::{
    cfg::config::ConnectionConfig,
    proto::{DownstreamPacket, Encoder, UpstreamPacket},
    verbs::{
        CallVerb, InterestVerb, MessageVerb, Name, SessionVerb, Verb, VerbError,
    },
};

/// Observer of ready transitions. Invoked with the current value on
/// installation, then once per transition across the ready boundary.
pub type ReadyHandler = Box<dyn Fn(bool) + Send + Sync>;

/// Receiver of decoded downstream verbs.
pub type DownstreamHandler = Box<dyn Fn(Verb) + Send + Sync>;

const LOCK: &str = "connection state lock poisoned";

/// A managed NXTCP connection.
///
/// Construction spawns the actor task, which immediately starts
/// connecting and keeps reconnecting with the configured cool-down
/// schedule until the handle is closed or dropped.
pub struct NxtcpConnection {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub address: String,
    pub cfg: ConnectionConfig,
    /// Current value of the ready flag, owned by the actor.
    ready: Mutex<bool>,
    ready_handler: Mutex<Option<ReadyHandler>>,
    downstream_handler: Mutex<Option<DownstreamHandler>>,
    /// Outgoing frame queue; present only while a socket is up. Frames
    /// queued on a link die with it.
    pub outgoing: Mutex<Option<Encoder>>,
    pub write_wake: Notify,
    pub cancel: CancellationToken,
}

impl NxtcpConnection {
    /// Creates the connection and spawns its actor. Must be called from
    /// within a tokio runtime.
    pub fn new(address: impl Into<String>, cfg: ConnectionConfig) -> Self {
        let shared = Arc::new(Shared {
            address: address.into(),
            cfg,
            ready: Mutex::new(false),
            ready_handler: Mutex::new(None),
            downstream_handler: Mutex::new(None),
            outgoing: Mutex::new(None),
            write_wake: Notify::new(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(actor::run(Arc::clone(&shared)));

        Self { shared }
    }

    /// Installs the ready observer, replacing any previous one. The
    /// observer is invoked immediately with the current value.
    pub fn set_ready_handler(&self, handler: ReadyHandler) {
        let ready = *self.shared.ready.lock().expect(LOCK);
        let mut slot = self.shared.ready_handler.lock().expect(LOCK);
        handler(ready);
        *slot = Some(handler);
    }

    /// Installs the receiver for decoded downstream verbs.
    pub fn set_downstream_handler(&self, handler: DownstreamHandler) {
        *self.shared.downstream_handler.lock().expect(LOCK) = Some(handler);
    }

    /// Encodes a verb and queues it for the socket. The caller is
    /// expected to check readiness first; a verb sent while the link is
    /// down is dropped with a warning.
    pub fn send_verb(&self, verb: Verb) {
        let packet = match upstream_packet(&verb) {
            Some(packet) => packet,
            None => {
                warn!("{} verb cannot be sent upstream, dropped", verb.kind());
                return;
            },
        };

        let mut outgoing = self.shared.outgoing.lock().expect(LOCK);
        match outgoing.as_mut() {
            Some(encoder) => {
                encoder.encode(&packet);
                drop(outgoing);
                self.shared.write_wake.notify_one();
            },
            None => warn!("link is down, {} verb dropped", verb.kind()),
        }
    }

    /// Sends a best-effort QUIT and stops the actor. Idempotent.
    pub fn close(&self) {
        if let Some(encoder) = self.shared.outgoing.lock().expect(LOCK).as_mut() {
            encoder.encode(&UpstreamPacket::Quit);
        }
        self.shared.write_wake.notify_one();
        self.shared.cancel.cancel();
    }
}

impl Drop for NxtcpConnection {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    /// Flips the ready flag and notifies the observer on change.
    pub(crate) fn set_ready(&self, value: bool) {
        {
            let mut ready = self.ready.lock().expect(LOCK);
            if *ready == value {
                return;
            }
            *ready = value;
        }

        if value {
            info!("connection is ready");
        } else {
            info!("connection is NOT ready");
        }

        if let Some(handler) = self.ready_handler.lock().expect(LOCK).as_ref() {
            handler(value);
        }
    }

    pub(crate) fn deliver_downstream(&self, verb: Verb) {
        match self.downstream_handler.lock().expect(LOCK).as_ref() {
            Some(handler) => handler(verb),
            None => debug!("no downstream handler installed, verb dropped"),
        }
    }
}

/// Maps an upstream verb onto its wire packet. Returns `None` for
/// downstream-only verbs.
fn upstream_packet(verb: &Verb) -> Option<UpstreamPacket> {
    match verb {
        Verb::Login(v) => Some(UpstreamPacket::Login {
            persist: v.persist,
            standby: v.standby,
            enforce: v.enforce,
            name: Bytes::copy_from_slice(v.name.as_bytes()),
        }),
        Verb::Logout(v) => Some(UpstreamPacket::Logout {
            name: Bytes::copy_from_slice(v.name.as_bytes()),
        }),
        Verb::Request(v) => Some(UpstreamPacket::Request {
            name: Bytes::copy_from_slice(v.name.as_bytes()),
            unidirectional: v.unidirectional,
            messageref: v.messageref.unwrap_or(0),
            timeout_ms: v
                .timeout
                .map(|timeout| timeout.as_millis() as u32)
                .unwrap_or(0),
            payload: v.payload.clone(),
        }),
        Verb::Post(v) => Some(UpstreamPacket::Post {
            postref: v.postref,
            payload: v.payload.clone(),
        }),
        Verb::Subscribe(v) => Some(UpstreamPacket::Subscribe {
            messageref: v.messageref,
            name: Bytes::copy_from_slice(v.name.as_bytes()),
            topic: v.topic.clone(),
        }),
        Verb::Unsubscribe(v) => Some(UpstreamPacket::Unsubscribe {
            name: Bytes::copy_from_slice(v.name.as_bytes()),
            topic: v.topic.clone(),
        }),
        Verb::Session(_) | Verb::Call(_) | Verb::Message(_) | Verb::Interest(_) => None,
    }
}

/// Maps a decoded downstream packet onto a verb. Link-level packets
/// (PING, WELCOME, BYEBYE) carry no verb and map to `None`.
pub(crate) fn downstream_verb(
    packet: DownstreamPacket,
) -> Result<Option<Verb>, VerbError> {
    let verb = match packet {
        DownstreamPacket::Session { state, name } => Verb::Session(SessionVerb {
            name: Name::from_wire(&name)?,
            state,
        }),
        DownstreamPacket::Call {
            unidirectional,
            postref,
            name,
            payload,
        } => Verb::Call(CallVerb {
            unidirectional,
            // a one-way call carries no way back, whatever the wire says
            postref: if unidirectional || postref == 0 {
                None
            } else {
                Some(postref)
            },
            name: Name::from_wire(&name)?,
            payload,
        }),
        DownstreamPacket::Message {
            status,
            messageref,
            payload,
        } => Verb::Message(MessageVerb {
            messageref,
            status,
            payload,
        }),
        DownstreamPacket::Interest {
            status,
            postref,
            name,
            topic,
        } => Verb::Interest(InterestVerb {
            postref: if postref == 0 { None } else { Some(postref) },
            name: Name::from_wire(&name)?,
            status,
            topic,
        }),
        DownstreamPacket::Ping
        | DownstreamPacket::Welcome { .. }
        | DownstreamPacket::ByeBye => return Ok(None),
    };
    Ok(Some(verb))
}
