// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client runtime for the NXTCP messaging protocol: a length-prefixed
//! binary transport over TCP carrying named sessions, requests with
//! optional response, subscriptions and posts.
//!
//! ```no_run
//! use nxtcp_client_rs::create_channel;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = create_channel("nxtcp://localhost:9999")?;
//!
//! let session = channel.session("demo")?;
//! session.add_call_handler(|call| {
//!     let _ = call.post(&call.payload);
//! });
//! # Ok(())
//! # }
//! ```
//!
//! The connection is established and kept alive in the background;
//! state-defining verbs (login, subscribe) are replayed automatically
//! after every reconnect.

pub mod cfg;
pub mod channel;
pub mod connection;
pub mod proto;
pub mod serializers;
pub mod uri;
pub mod verbs;

use std::sync::Arc;

use thiserror::Error as ThisError;

use crate::{
    cfg::config::Config,
    channel::Channel,
    connection::NxtcpConnection,
    serializers::StringSerializer,
    verbs::VerbError,
};

/// Errors surfaced synchronously to the caller. Transport failures are
/// never raised this way; they feed the reconnect machinery and show up
/// only through the ready signal.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error(transparent)]
    Verb(#[from] VerbError),
    #[error("request has no target name")]
    MissingRequestName,
    #[error("channel has been shut down")]
    ChannelClosed,
}

/// Creates a connection and a channel on top of it, with default
/// configuration and the default string serializer. Must be called
/// from within a tokio runtime.
pub fn create_channel(uri: &str) -> Result<Channel, Error> {
    create_channel_with_config(uri, &Config::default())
}

pub fn create_channel_with_config(uri: &str, config: &Config) -> Result<Channel, Error> {
    let connection = create_connection_with_config(uri, config)?;
    Ok(Channel::with_config(
        connection,
        Arc::new(StringSerializer),
        config.channel.clone(),
    ))
}

/// Creates a bare connection for callers that wire their own
/// dispatcher.
pub fn create_connection(uri: &str) -> Result<NxtcpConnection, Error> {
    create_connection_with_config(uri, &Config::default())
}

pub fn create_connection_with_config(
    uri: &str,
    config: &Config,
) -> Result<NxtcpConnection, Error> {
    let address = uri::parse(uri)?;
    Ok(NxtcpConnection::new(address, config.connection.clone()))
}
