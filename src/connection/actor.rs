// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The connection actor: one task per connection handle, driving the
//! state machine through connect attempts, the welcome handshake, the
//! ready phase and the cool-down between failures.

use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedWriteHalf},
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    connection::{
        Shared, downstream_verb,
        state::{Cooldown, State},
    },
    proto::{Decoder, DownstreamPacket, Encoder, UpstreamPacket},
};

/// Protocol revision this client speaks. A welcome announcing anything
/// else is logged but tolerated.
const PROTOCOL_VERSION: u32 = 1;

const LOCK: &str = "connection state lock poisoned";

/// How one up-link ended.
enum LinkEnd {
    /// Connect failed or the established link dropped; cool down and retry.
    Failed,
    /// The handle was closed; stop for good.
    Cancelled,
}

pub(crate) async fn run(shared: Arc<Shared>) {
    let mut cooldown = Cooldown::new(&shared.cfg.cooldown_ms);

    loop {
        if shared.cancel.is_cancelled() {
            return;
        }

        match attempt(&shared, &mut cooldown).await {
            LinkEnd::Cancelled => return,
            LinkEnd::Failed => {},
        }

        // entry into Failed: wait out the cool-down before going idle
        let wait = cooldown.next_timeout();
        info!(state = ?State::Failed, "cooling down for {:.1}s", wait.as_secs_f64());
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = time::sleep(wait) => {},
        }
    }
}

/// One pass through Connecting / WaitWelcome / Ready. Returns once the
/// link is gone, with the codec dropped and ready reported false.
async fn attempt(shared: &Shared, cooldown: &mut Cooldown) -> LinkEnd {
    info!(state = ?State::Connecting, "initiating connection to {}", shared.address);

    let connect = TcpStream::connect(shared.address.as_str());
    let stream = tokio::select! {
        _ = shared.cancel.cancelled() => return LinkEnd::Cancelled,
        result = time::timeout(shared.cfg.connect_timeout(), connect) => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                info!("connection attempt failed: {err}");
                return LinkEnd::Failed;
            },
            Err(_) => {
                info!("connection attempt timed out");
                return LinkEnd::Failed;
            },
        },
    };

    // the OS accepted the connect; the cool-down schedule starts over
    cooldown.reset();

    if let Err(err) = stream.set_nodelay(shared.cfg.nodelay) {
        debug!("set_nodelay failed: {err}");
    }

    *shared.outgoing.lock().expect(LOCK) = Some(Encoder::new());
    let mut decoder = Decoder::new();

    let mut state = State::WaitWelcome;
    info!("connection successful, waiting for welcome message");

    let (mut reader, mut writer) = stream.into_split();
    let welcome_deadline = Instant::now() + shared.cfg.welcome_timeout();
    let mut read_buf = vec![0u8; shared.cfg.read_chunk_size];

    let end = loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break LinkEnd::Cancelled,

            _ = time::sleep_until(welcome_deadline), if state == State::WaitWelcome => {
                info!("no welcome message received");
                break LinkEnd::Failed;
            },

            _ = shared.write_wake.notified() => {
                if let Err(err) = flush_outgoing(shared, &mut writer).await {
                    info!("write failed: {err}");
                    break LinkEnd::Failed;
                }
            },

            result = reader.read(&mut read_buf) => match result {
                Ok(0) => {
                    info!("connection closed by server");
                    break LinkEnd::Failed;
                },
                Ok(n) => {
                    decoder.push(&read_buf[..n]);
                    if !drain_decoder(shared, &mut decoder, &mut state) {
                        break LinkEnd::Failed;
                    }
                    // a ping may have queued a pong
                    if let Err(err) = flush_outgoing(shared, &mut writer).await {
                        info!("write failed: {err}");
                        break LinkEnd::Failed;
                    }
                },
                Err(err) => {
                    info!("read failed: {err}");
                    break LinkEnd::Failed;
                },
            },
        }
    };

    if matches!(end, LinkEnd::Cancelled) {
        // give a queued QUIT a brief chance to reach the wire
        let _ = time::timeout(
            Duration::from_millis(100),
            flush_outgoing(shared, &mut writer),
        )
        .await;
        let _ = writer.shutdown().await;
    }

    // entry into Failed: close the socket, drop the codec pair
    *shared.outgoing.lock().expect(LOCK) = None;
    shared.set_ready(false);

    end
}

/// Decodes every packet currently buffered. Returns `false` when the
/// link must be failed.
fn drain_decoder(shared: &Shared, decoder: &mut Decoder, state: &mut State) -> bool {
    loop {
        match decoder.try_decode() {
            Ok(Some(packet)) => {
                if !handle_packet(shared, packet, state) {
                    return false;
                }
            },
            Ok(None) => return true,
            Err(err) if err.is_fatal() => {
                warn!("fatal decoding error: {err}");
                return false;
            },
            Err(err) => {
                // the offending frame is consumed, the stream stays usable
                warn!("decoding error: {err}");
            },
        }
    }
}

/// Returns `false` when the packet terminates the link.
fn handle_packet(shared: &Shared, packet: DownstreamPacket, state: &mut State) -> bool {
    match packet {
        DownstreamPacket::Welcome {
            server_version,
            protocol_version,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                error!("unsupported protocol version {protocol_version}");
            }
            if *state == State::WaitWelcome {
                debug!(server_version, "welcome message received");
                *state = State::Ready;
                shared.set_ready(true);
            }
            true
        },

        DownstreamPacket::Ping => {
            debug!("ping packet received, sending pong back to server");
            if let Some(encoder) = shared.outgoing.lock().expect(LOCK).as_mut() {
                encoder.encode(&UpstreamPacket::Pong);
            }
            true
        },

        DownstreamPacket::ByeBye => {
            info!("server said byebye, closing connection");
            false
        },

        other => {
            match downstream_verb(other) {
                Ok(Some(verb)) => shared.deliver_downstream(verb),
                Ok(None) => {},
                Err(err) => warn!("received malformed packet: {err}"),
            }
            true
        },
    }
}

/// Writes queued frames until the encoder runs dry, committing exactly
/// the bytes the socket accepted.
async fn flush_outgoing(shared: &Shared, writer: &mut OwnedWriteHalf) -> io::Result<()> {
    loop {
        let chunk = {
            shared
                .outgoing
                .lock()
                .expect(LOCK)
                .as_mut()
                .and_then(Encoder::fetch_chunk)
        };

        let Some(chunk) = chunk else {
            return Ok(());
        };

        let n = writer.write(&chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"));
        }
        if let Some(encoder) = shared.outgoing.lock().expect(LOCK).as_mut() {
            encoder.commit(n);
        }
    }
}
