// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The channel: the application-facing API and the verb dispatcher
//! behind it.
//!
//! [`Channel`] is the entry point for interacting with an NXTCP server:
//! `subscribe()` for subscriptions, `session()` for claiming a named
//! session, `request()` for request/reply. Each returns a handle (see
//! [`handles`]) that holds a weak reference back to the dispatcher.
//!
//! [`Core`] owns the connection, the outgoing backlog with its
//! auto-resend list, the messageref allocator and the handler
//! registries. It is shared behind an `Arc` and never exposed to
//! application code.

pub mod handles;

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::time::Instant;
use tracing::{info, trace, warn};

pub use crate::channel::handles::{
    Call, Interest, Message, Post, Request, RequestStub, Session, SessionOptions,
    Subscription,
};
use crate::{
    Error,
    cfg::config::ChannelConfig,
    connection::NxtcpConnection,
    serializers::Serializer,
    verbs::{CallVerb, InterestVerb, MessageVerb, Name, Verb, VerbError},
};

/// One-shot receiver of the message answering a request or feeding a
/// subscription; consumed on first delivery.
pub(crate) type MessageCallback = Box<dyn FnOnce(MessageVerb) + Send + Sync>;
pub(crate) type CallCallback = Arc<dyn Fn(CallVerb) + Send + Sync>;
pub(crate) type InterestCallback = Arc<dyn Fn(InterestVerb) + Send + Sync>;
pub(crate) type LostCallback = Arc<dyn Fn() + Send + Sync>;

const LOCK: &str = "dispatcher state lock poisoned";

/// The main API interface for interacting with NXTCP servers.
pub struct Channel {
    core: Arc<Core>,
}

impl Channel {
    /// Wires a dispatcher onto the given connection with the default
    /// channel configuration.
    pub fn new(connection: NxtcpConnection, serializer: Arc<dyn Serializer>) -> Self {
        Self::with_config(connection, serializer, ChannelConfig::default())
    }

    pub fn with_config(
        connection: NxtcpConnection,
        serializer: Arc<dyn Serializer>,
        cfg: ChannelConfig,
    ) -> Self {
        let core = Arc::new(Core::new(serializer, cfg));

        let ready = Arc::downgrade(&core);
        connection.set_ready_handler(Box::new(move |value| {
            if let Some(core) = ready.upgrade() {
                core.on_connection_ready(value);
            }
        }));

        let downstream = Arc::downgrade(&core);
        connection.set_downstream_handler(Box::new(move |verb| {
            if let Some(core) = downstream.upgrade() {
                core.on_incoming_verb(verb);
            }
        }));

        // the handlers above were installed first, so this cannot race
        // a ready report
        core.attach_connection(connection);

        Self { core }
    }

    /// Subscribes to a topic on a named session.
    pub fn subscribe(&self, name: &str, topic: &str) -> Result<Subscription, Error> {
        handles::subscribe(&self.core, name, topic)
    }

    /// Logs in on a named session.
    pub fn session(&self, name: &str) -> Result<Session, Error> {
        self.session_with(name, SessionOptions::default())
    }

    pub fn session_with(
        &self,
        name: &str,
        options: SessionOptions,
    ) -> Result<Session, Error> {
        handles::session(&self.core, name, options)
    }

    /// Creates a reusable request stub addressed at a named session.
    pub fn request(&self) -> RequestStub {
        handles::request_stub(&self.core)
    }

    /// Says goodbye to the server and stops the connection.
    pub fn close(&self) {
        if let Some(connection) = self.core.connection.get() {
            connection.close();
        }
    }
}

/// A verb waiting in the backlog for the link to come up.
struct BacklogEntry {
    verb: Verb,
    /// `None` for auto-resend entries, which never expire.
    expires: Option<Instant>,
}

/// Upstream-side state that must change atomically with readiness.
struct UpstreamState {
    ready: bool,
    backlog: VecDeque<BacklogEntry>,
    auto_resend: Vec<Verb>,
}

/// The verb dispatcher.
pub struct Core {
    connection: OnceCell<NxtcpConnection>,
    serializer: Arc<dyn Serializer>,
    cfg: ChannelConfig,

    upstream: Mutex<UpstreamState>,

    next_messageref: AtomicU32,
    message_handlers: DashMap<u32, MessageCallback>,
    call_handlers: DashMap<Name, CallCallback>,
    interest_handlers: DashMap<Name, InterestCallback>,

    lost_handlers: Mutex<Vec<(u64, LostCallback)>>,
    next_lost_id: AtomicU64,
}

impl Core {
    fn new(serializer: Arc<dyn Serializer>, cfg: ChannelConfig) -> Self {
        Self {
            connection: OnceCell::new(),
            serializer,
            cfg,
            upstream: Mutex::new(UpstreamState {
                ready: false,
                backlog: VecDeque::new(),
                auto_resend: Vec::new(),
            }),
            next_messageref: AtomicU32::new(1),
            message_handlers: DashMap::new(),
            call_handlers: DashMap::new(),
            interest_handlers: DashMap::new(),
            lost_handlers: Mutex::new(Vec::new()),
            next_lost_id: AtomicU64::new(1),
        }
    }

    fn attach_connection(&self, connection: NxtcpConnection) {
        let _ = self.connection.set(connection);
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        self.cfg.request_timeout()
    }

    pub(crate) fn default_ttl(&self) -> Duration {
        self.cfg.ttl()
    }

    pub(crate) fn encode_payload(&self, value: &str) -> Bytes {
        self.serializer.encode(value)
    }

    pub(crate) fn decode_payload(&self, raw: &[u8]) -> String {
        self.serializer.decode(raw)
    }

    /// Queues a verb for the server.
    ///
    /// `ttl` is how long the verb may wait in the backlog when the link
    /// is down; `None` means it is discarded instead of queued. With
    /// `auto_resend` the verb is also replayed on every future ready
    /// transition, ahead of the backlog.
    pub(crate) fn put_upstream(
        &self,
        verb: Verb,
        ttl: Option<Duration>,
        auto_resend: bool,
    ) -> Result<(), VerbError> {
        verb.validate()?;
        if !verb.is_upstream() {
            return Err(VerbError::NotUpstream(verb.kind()));
        }

        let mut upstream = self.upstream.lock().expect(LOCK);

        if auto_resend {
            upstream.auto_resend.push(verb.clone());
        }

        if upstream.ready {
            self.send_now(verb);
        } else if let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) {
            upstream.backlog.push_back(BacklogEntry {
                expires: Some(Instant::now() + ttl),
                verb,
            });
        } else {
            trace!("link not ready and no ttl, {} verb discarded", verb.kind());
        }

        Ok(())
    }

    /// Cancels a pending verb. Returns `true` iff the verb was still in
    /// the backlog, i.e. had not reached the wire; callers use this to
    /// decide whether a compensating verb is needed.
    pub(crate) fn cancel(&self, verb: &Verb) -> bool {
        let mut upstream = self.upstream.lock().expect(LOCK);

        if let Some(index) = upstream.auto_resend.iter().position(|v| v == verb) {
            upstream.auto_resend.remove(index);
        }

        if let Some(index) = upstream.backlog.iter().position(|entry| entry.verb == *verb)
        {
            upstream.backlog.remove(index);
            return true;
        }

        false
    }

    /// Registers a one-shot handler and returns the messageref that
    /// will route the answer to it. Refs are unique for the lifetime of
    /// the channel.
    pub(crate) fn new_messageref(&self, handler: MessageCallback) -> u32 {
        let messageref = self.next_messageref.fetch_add(1, Ordering::Relaxed);
        self.message_handlers.insert(messageref, handler);
        messageref
    }

    pub(crate) fn discard_messageref(&self, messageref: u32) {
        self.message_handlers.remove(&messageref);
    }

    pub(crate) fn set_call_handler(&self, name: Name, handler: CallCallback) {
        self.call_handlers.insert(name, handler);
    }

    pub(crate) fn remove_call_handler(&self, name: &Name) {
        self.call_handlers.remove(name);
    }

    pub(crate) fn set_interest_handler(&self, name: Name, handler: InterestCallback) {
        self.interest_handlers.insert(name, handler);
    }

    pub(crate) fn remove_interest_handler(&self, name: &Name) {
        self.interest_handlers.remove(name);
    }

    pub(crate) fn add_connection_lost_handler(&self, handler: LostCallback) -> u64 {
        let id = self.next_lost_id.fetch_add(1, Ordering::Relaxed);
        self.lost_handlers.lock().expect(LOCK).push((id, handler));
        id
    }

    pub(crate) fn remove_connection_lost_handler(&self, id: u64) {
        self.lost_handlers
            .lock()
            .expect(LOCK)
            .retain(|(entry_id, _)| *entry_id != id);
    }

    fn send_now(&self, verb: Verb) {
        if let Some(connection) = self.connection.get() {
            connection.send_verb(verb);
        }
    }

    /// Ready observer installed on the connection.
    fn on_connection_ready(&self, ready: bool) {
        let mut upstream = self.upstream.lock().expect(LOCK);
        upstream.ready = ready;

        if ready {
            info!("channel is ready");

            // state-restoring verbs go first, in registration order
            let resend = upstream.auto_resend.clone();
            for verb in resend.into_iter().rev() {
                upstream.backlog.push_front(BacklogEntry {
                    verb,
                    expires: None,
                });
            }

            let now = Instant::now();
            while let Some(entry) = upstream.backlog.pop_front() {
                if let Some(expires) = entry.expires {
                    if now > expires {
                        trace!("{} verb expired in backlog", entry.verb.kind());
                        continue;
                    }
                }
                self.send_now(entry.verb);
            }
        } else {
            info!("channel is NOT ready");

            // release the lock first: the observers synthesise verbs
            drop(upstream);

            let handlers: Vec<LostCallback> = self
                .lost_handlers
                .lock()
                .expect(LOCK)
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect();
            for handler in handlers {
                handler();
            }
        }
    }

    /// Downstream handler installed on the connection.
    fn on_incoming_verb(&self, verb: Verb) {
        if let Err(err) = verb.validate() {
            warn!("received invalid {} verb: {err}", verb.kind());
            return;
        }

        match verb {
            Verb::Message(verb) => self.on_message_verb(verb),
            Verb::Call(verb) => self.on_call_verb(verb),
            Verb::Interest(verb) => self.on_interest_verb(verb),
            Verb::Session(verb) => {
                info!("session '{}' is now {}", verb.name, verb.state);
            },
            other => warn!("unexpected downstream {} verb", other.kind()),
        }
    }

    fn on_message_verb(&self, verb: MessageVerb) {
        // removal and delivery are one step: the ref is gone before the
        // handler runs, and a second message with it is a miss
        match self.message_handlers.remove(&verb.messageref) {
            Some((_, handler)) => handler(verb),
            None => {
                warn!("no handler for message with messageref {}", verb.messageref);
            },
        }
    }

    fn on_call_verb(&self, verb: CallVerb) {
        let handler = self
            .call_handlers
            .get(&verb.name)
            .map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => handler(verb),
            None => warn!("no handler for call to {}", verb.name),
        }
    }

    fn on_interest_verb(&self, verb: InterestVerb) {
        let handler = self
            .interest_handlers
            .get(&verb.name)
            .map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => handler(verb),
            None => warn!("no handler for interest to {}", verb.name),
        }
    }
}
