// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Application-facing handles: subscriptions, requests, sessions and
//! the event objects their handlers receive.
//!
//! Handles hold a `Weak` reference to the dispatcher; a handle that
//! outlives its channel degrades to a no-op instead of keeping the
//! connection alive.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use bitflags::Flags;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::{
    Error,
    channel::{Core, MessageCallback},
    verbs::{
        CallVerb, InterestStatus, InterestVerb, LoginVerb, LogoutVerb, MessageStatus,
        MessageVerb, Name, PostVerb, RequestVerb, SubscribeVerb, UnsubscribeVerb, Verb,
    },
};

const LOCK: &str = "handle state lock poisoned";

type FilteredHandler<F, E> = (F, Box<dyn Fn(&E) + Send + Sync>);
type CallHandler = Box<dyn Fn(&Call) + Send + Sync>;

/// Ordered list of handlers with status filters. A handler fires when
/// its filter intersects the event's status; registration order is
/// preserved.
pub(crate) struct HandlerList<F, E> {
    handlers: Vec<FilteredHandler<F, E>>,
}

impl<F: Flags + Copy, E> HandlerList<F, E> {
    fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    fn add(&mut self, filter: F, handler: impl Fn(&E) + Send + Sync + 'static) {
        self.handlers.push((filter, Box::new(handler)));
    }

    fn call(&self, status: F, event: &E) {
        for (filter, handler) in &self.handlers {
            if filter.intersects(status) {
                handler(event);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// An incoming message, delivered to request and subscription handlers.
#[derive(Debug)]
pub struct Message {
    pub status: MessageStatus,
    /// Decoded payload; present only for [`MessageStatus::OK`].
    pub payload: Option<String>,
}

impl Message {
    fn from_verb(core: &Core, verb: MessageVerb) -> Self {
        let payload = if verb.status == MessageStatus::OK {
            verb.payload.as_deref().map(|raw| core.decode_payload(raw))
        } else {
            None
        };
        Self {
            status: verb.status,
            payload,
        }
    }
}

type MessageHandlers = Arc<Mutex<HandlerList<MessageStatus, Message>>>;

/// One-shot delivery callback shared by subscriptions and requests.
fn message_delivery(core: &Arc<Core>, handlers: &MessageHandlers) -> MessageCallback {
    let core = Arc::downgrade(core);
    let handlers = Arc::clone(handlers);
    Box::new(move |verb: MessageVerb| {
        let Some(core) = core.upgrade() else { return };
        let message = Message::from_verb(&core, verb);
        handlers.lock().expect(LOCK).call(message.status, &message);
    })
}

/// An active subscription on a named session's topic.
pub struct Subscription {
    core: Weak<Core>,
    name: Name,
    topic: String,
    messageref: u32,
    verb: Verb,
    handlers: MessageHandlers,
}

pub(crate) fn subscribe(
    core: &Arc<Core>,
    name: &str,
    topic: &str,
) -> Result<Subscription, Error> {
    let name = Name::new(name)?;
    let handlers: MessageHandlers = Arc::new(Mutex::new(HandlerList::new()));

    let messageref = core.new_messageref(message_delivery(core, &handlers));

    let verb = Verb::Subscribe(SubscribeVerb {
        name: name.clone(),
        messageref,
        topic: core.encode_payload(topic),
    });

    // resent on every reconnect so the server-side subscription
    // survives link loss
    if let Err(err) = core.put_upstream(verb.clone(), None, true) {
        core.discard_messageref(messageref);
        return Err(err.into());
    }

    Ok(Subscription {
        core: Arc::downgrade(core),
        name,
        topic: topic.to_owned(),
        messageref,
        verb,
        handlers,
    })
}

impl Subscription {
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Adds a handler for messages published on the topic.
    pub fn add_handler(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.add_handler_filtered(MessageStatus::ANY, handler);
    }

    pub fn add_handler_filtered(
        &self,
        filter: MessageStatus,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) {
        self.handlers.lock().expect(LOCK).add(filter, handler);
    }

    /// Cancels the subscription. If the subscribe already reached the
    /// server, an unsubscribe is sent instead.
    pub fn cancel(&self) {
        let Some(core) = self.core.upgrade() else { return };

        if !core.cancel(&self.verb) {
            let unsubscribe = Verb::Unsubscribe(UnsubscribeVerb {
                name: self.name.clone(),
                topic: core.encode_payload(&self.topic),
            });
            if let Err(err) = core.put_upstream(unsubscribe, None, false) {
                warn!("failed to enqueue unsubscribe: {err}");
            }
        }

        core.discard_messageref(self.messageref);
    }
}

/// A reusable request template.
///
/// Whether a request expects an answer is decided when [`send`] runs:
/// with at least one handler registered the request is bidirectional
/// and gets a messageref, otherwise it goes out unidirectional.
///
/// [`send`]: RequestStub::send
pub struct RequestStub {
    core: Weak<Core>,
    name: Option<Name>,
    payload: Option<String>,
    timeout: Option<Duration>,
    ttl: Option<Duration>,
    handlers: MessageHandlers,
}

pub(crate) fn request_stub(core: &Arc<Core>) -> RequestStub {
    RequestStub {
        core: Arc::downgrade(core),
        name: None,
        payload: None,
        timeout: None,
        ttl: None,
        handlers: Arc::new(Mutex::new(HandlerList::new())),
    }
}

impl RequestStub {
    pub fn set_name(&mut self, name: &str) -> Result<(), Error> {
        self.name = Some(Name::new(name)?);
        Ok(())
    }

    pub fn set_payload(&mut self, payload: &str) {
        self.payload = Some(payload.to_owned());
    }

    /// Server-side answer deadline carried in the request.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// How long the request may wait in the backlog for the link.
    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = Some(ttl);
    }

    /// Adds a response handler. Handlers are shared with every request
    /// already sent from this stub.
    pub fn add_handler(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.add_handler_filtered(MessageStatus::ANY, handler);
    }

    pub fn add_handler_filtered(
        &self,
        filter: MessageStatus,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) {
        self.handlers.lock().expect(LOCK).add(filter, handler);
    }

    /// Sends one request with the stub's attributes.
    pub fn send(&self) -> Result<Request, Error> {
        self.send_inner(None)
    }

    /// Sends one request, overriding the stub's payload.
    pub fn send_payload(&self, payload: &str) -> Result<Request, Error> {
        self.send_inner(Some(payload))
    }

    fn send_inner(&self, payload_override: Option<&str>) -> Result<Request, Error> {
        let core = self.core.upgrade().ok_or(Error::ChannelClosed)?;
        let name = self.name.clone().ok_or(Error::MissingRequestName)?;

        let payload = match payload_override {
            Some(payload) => payload,
            None => self.payload.as_deref().unwrap_or_default(),
        };
        let timeout = self.timeout.unwrap_or_else(|| core.default_timeout());
        let ttl = self.ttl.unwrap_or_else(|| core.default_ttl());

        let unidirectional = self.handlers.lock().expect(LOCK).is_empty();
        let messageref = if unidirectional {
            None
        } else {
            Some(core.new_messageref(message_delivery(&core, &self.handlers)))
        };

        let verb = Verb::Request(RequestVerb {
            name,
            unidirectional,
            messageref,
            timeout: Some(timeout),
            payload: core.encode_payload(payload),
        });

        if let Err(err) = core.put_upstream(verb.clone(), Some(ttl), false) {
            if let Some(messageref) = messageref {
                core.discard_messageref(messageref);
            }
            return Err(err.into());
        }

        Ok(Request {
            core: self.core.clone(),
            verb,
            messageref,
        })
    }
}

/// A single sent request.
pub struct Request {
    core: Weak<Core>,
    verb: Verb,
    messageref: Option<u32>,
}

impl Request {
    /// Cancels the request. Only effective while the request is still
    /// waiting in the backlog; once it reached the wire the server will
    /// process it regardless.
    pub fn cancel(&self) {
        let Some(core) = self.core.upgrade() else { return };

        if !core.cancel(&self.verb) {
            debug!("request cancellation had no effect as it was already sent");
        }

        if let Some(messageref) = self.messageref {
            core.discard_messageref(messageref);
        }
    }
}

/// Options for claiming a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Take the name over from a currently active peer.
    pub force: bool,
    /// Keep the name reserved on the server across client absence.
    pub persist: bool,
    /// Log in as a standby for the name.
    pub standby: bool,
}

/// A claimed (or claim-pending) named session.
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    core: Weak<Core>,
    name: Name,
    login_verb: Verb,
    call_handlers: Mutex<Vec<CallHandler>>,
    interest_handlers: Mutex<HandlerList<InterestStatus, Interest>>,
    /// Topics the server currently shows interest in, by raw topic
    /// bytes. Drained into synthetic no-interest events on link loss.
    current_interest: Mutex<HashMap<Bytes, InterestVerb>>,
    lost_handler_id: OnceCell<u64>,
}

pub(crate) fn session(
    core: &Arc<Core>,
    name: &str,
    options: SessionOptions,
) -> Result<Session, Error> {
    let name = Name::new(name)?;

    let login_verb = Verb::Login(LoginVerb {
        name: name.clone(),
        enforce: options.force,
        standby: options.standby,
        persist: options.persist,
    });

    let inner = Arc::new(SessionInner {
        core: Arc::downgrade(core),
        name: name.clone(),
        login_verb: login_verb.clone(),
        call_handlers: Mutex::new(Vec::new()),
        interest_handlers: Mutex::new(HandlerList::new()),
        current_interest: Mutex::new(HashMap::new()),
        lost_handler_id: OnceCell::new(),
    });

    // the dispatcher keeps these alive until cancel(); they hold the
    // session state strongly and the dispatcher weakly, so no cycle
    let on_call = Arc::clone(&inner);
    core.set_call_handler(
        name.clone(),
        Arc::new(move |verb| on_call.on_call(verb)),
    );

    let on_interest = Arc::clone(&inner);
    core.set_interest_handler(name, Arc::new(move |verb| on_interest.on_interest(verb)));

    let on_lost = Arc::clone(&inner);
    let lost_id = core.add_connection_lost_handler(Arc::new(move || {
        on_lost.on_connection_lost();
    }));
    let _ = inner.lost_handler_id.set(lost_id);

    core.put_upstream(login_verb, None, true)?;

    Ok(Session { inner })
}

impl Session {
    pub fn name(&self) -> &Name {
        &self.inner.name
    }

    /// Adds a handler for incoming calls to this session.
    pub fn add_call_handler(&self, handler: impl Fn(&Call) + Send + Sync + 'static) {
        self.inner
            .call_handlers
            .lock()
            .expect(LOCK)
            .push(Box::new(handler));
    }

    /// Adds a handler for interest updates on this session.
    pub fn add_interest_handler(
        &self,
        handler: impl Fn(&Interest) + Send + Sync + 'static,
    ) {
        self.add_interest_handler_filtered(InterestStatus::ANY, handler);
    }

    pub fn add_interest_handler_filtered(
        &self,
        filter: InterestStatus,
        handler: impl Fn(&Interest) + Send + Sync + 'static,
    ) {
        self.inner
            .interest_handlers
            .lock()
            .expect(LOCK)
            .add(filter, handler);
    }

    /// Gives the session up. If the login already reached the server a
    /// logout is sent; either way the handler slots are released.
    pub fn cancel(&self) {
        let Some(core) = self.inner.core.upgrade() else { return };

        if !core.cancel(&self.inner.login_verb) {
            let logout = Verb::Logout(LogoutVerb {
                name: self.inner.name.clone(),
            });
            if let Err(err) = core.put_upstream(logout, None, false) {
                warn!("failed to enqueue logout: {err}");
            }
        }

        core.remove_call_handler(&self.inner.name);
        core.remove_interest_handler(&self.inner.name);
        if let Some(id) = self.inner.lost_handler_id.get() {
            core.remove_connection_lost_handler(*id);
        }
    }
}

impl SessionInner {
    fn on_call(&self, verb: CallVerb) {
        let Some(core) = self.core.upgrade() else { return };

        let call = Call {
            core: self.core.clone(),
            unidirectional: verb.unidirectional,
            name: verb.name,
            postref: verb.postref,
            payload: core.decode_payload(&verb.payload),
            default_ttl: core.default_ttl(),
        };

        for handler in self.call_handlers.lock().expect(LOCK).iter() {
            handler(&call);
        }
    }

    fn on_interest(&self, verb: InterestVerb) {
        {
            let mut current = self.current_interest.lock().expect(LOCK);
            if verb.status == InterestStatus::INTEREST {
                current.insert(verb.topic.clone(), verb.clone());
            } else {
                current.remove(&verb.topic);
            }
        }

        let Some(core) = self.core.upgrade() else { return };

        let interest = Interest {
            core: self.core.clone(),
            status: verb.status,
            name: verb.name,
            postref: verb.postref,
            topic: core.decode_payload(&verb.topic),
            default_ttl: core.default_ttl(),
        };

        self.interest_handlers
            .lock()
            .expect(LOCK)
            .call(verb.status, &interest);
    }

    /// Synthesizes a no-interest for every held topic so the
    /// application never sees an interest dangle across a reconnect.
    fn on_connection_lost(&self) {
        loop {
            let entry = {
                let mut current = self.current_interest.lock().expect(LOCK);
                let key = current.keys().next().cloned();
                key.and_then(|key| current.remove(&key))
            };

            let Some(mut verb) = entry else { break };
            verb.status = InterestStatus::NO_INTEREST;
            self.on_interest(verb);
        }
    }
}

/// An incoming call to a session.
pub struct Call {
    core: Weak<Core>,
    pub unidirectional: bool,
    pub name: Name,
    postref: Option<u32>,
    pub payload: String,
    default_ttl: Duration,
}

impl Call {
    /// Posts an answer back to the caller. On a unidirectional call
    /// there is nobody to answer; the post is logged and dropped.
    pub fn post(&self, payload: &str) -> Result<Option<Post>, Error> {
        self.post_with_ttl(payload, self.default_ttl)
    }

    pub fn post_with_ttl(
        &self,
        payload: &str,
        ttl: Duration,
    ) -> Result<Option<Post>, Error> {
        if self.unidirectional {
            warn!("post done on unidirectional call, it will be ignored");
            return Ok(None);
        }
        let Some(postref) = self.postref else {
            warn!("call carries no postref, post ignored");
            return Ok(None);
        };
        send_post(&self.core, postref, payload, ttl).map(Some)
    }
}

/// An interest update on a session's topic.
pub struct Interest {
    core: Weak<Core>,
    pub status: InterestStatus,
    pub name: Name,
    postref: Option<u32>,
    pub topic: String,
    default_ttl: Duration,
}

impl Interest {
    /// Publishes a value to the interested peer. Allowed only while the
    /// interest is live.
    pub fn post(&self, payload: &str) -> Result<Option<Post>, Error> {
        self.post_with_ttl(payload, self.default_ttl)
    }

    pub fn post_with_ttl(
        &self,
        payload: &str,
        ttl: Duration,
    ) -> Result<Option<Post>, Error> {
        if self.status != InterestStatus::INTEREST {
            warn!("attempted post on lost interest, post will be ignored");
            return Ok(None);
        }
        let Some(postref) = self.postref else {
            warn!("interest carries no postref, post ignored");
            return Ok(None);
        };
        send_post(&self.core, postref, payload, ttl).map(Some)
    }
}

/// A queued post, cancellable while it waits for the link.
pub struct Post {
    core: Weak<Core>,
    verb: Verb,
}

fn send_post(
    core: &Weak<Core>,
    postref: u32,
    payload: &str,
    ttl: Duration,
) -> Result<Post, Error> {
    let strong = core.upgrade().ok_or(Error::ChannelClosed)?;

    let verb = Verb::Post(PostVerb {
        postref,
        payload: strong.encode_payload(payload),
    });
    strong.put_upstream(verb.clone(), Some(ttl), false)?;

    Ok(Post {
        core: core.clone(),
        verb,
    })
}

impl Post {
    pub fn cancel(&self) {
        let Some(core) = self.core.upgrade() else { return };
        if !core.cancel(&self.verb) {
            debug!("post cancellation had no effect as it was already sent");
        }
    }
}
