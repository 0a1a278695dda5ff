// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Demo echo client: claims a session and posts every call's payload
//! straight back to the caller.
//!
//! ```text
//! nxtcp-client-rs [uri] [session-name]
//! ```

use anyhow::{Context, Result};
use nxtcp_client_rs::{cfg::logger, channel::SessionOptions, create_channel};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    logger::try_init_default();

    let mut args = std::env::args().skip(1);
    let uri = args
        .next()
        .unwrap_or_else(|| "nxtcp://localhost:9999".to_owned());
    let name = args.next().unwrap_or_else(|| "demo".to_owned());

    let channel = create_channel(&uri).context("failed to create channel")?;

    let session = channel
        .session_with(
            &name,
            SessionOptions {
                standby: true,
                ..SessionOptions::default()
            },
        )
        .context("failed to claim session")?;

    session.add_call_handler(|call| {
        info!("received call with payload '{}'", call.payload);
        if let Err(err) = call.post(&call.payload) {
            warn!("echo post failed: {err}");
        }
    });

    info!("echoing calls to '{name}' on {uri}, press ctrl-c to quit");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    channel.close();
    Ok(())
}
