// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-process NXTCP server harness. Each test binds its own ephemeral
//! listener; the runtime timers are shrunk to milliseconds through the
//! regular configuration layer.

use anyhow::{Context, Result, bail, ensure};
use bytes::BytesMut;
use nxtcp_client_rs::{
    cfg::config::{Config, ConnectionConfig},
    proto::{DownstreamPacket, FRAME_HEADER_LEN, UpstreamPacket},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
    time::{Duration, timeout},
};

/// Upper bound for anything a test waits on.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A window long enough that anything queued would have arrived.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(300);

/// Protocol defaults shrunk for tests: fast give-up on the welcome and
/// a single short cool-down slot.
pub fn fast_config() -> Config {
    Config {
        connection: ConnectionConfig {
            connect_timeout_ms: 1_000,
            welcome_timeout_ms: 400,
            cooldown_ms: vec![100],
            ..ConnectionConfig::default()
        },
        ..Config::default()
    }
}

pub struct TestServer {
    listener: TcpListener,
    uri: String,
}

impl TestServer {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind test listener")?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            uri: format!("nxtcp://127.0.0.1:{port}"),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn accept(&self) -> Result<ServerConn> {
        let (stream, _) = timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .context("no connection within deadline")??;
        Ok(ServerConn {
            stream,
            buf: BytesMut::new(),
        })
    }
}

/// One accepted client connection, seen from the server side.
pub struct ServerConn {
    stream: TcpStream,
    buf: BytesMut,
}

impl ServerConn {
    pub async fn send(&mut self, packet: &DownstreamPacket) -> Result<()> {
        self.stream.write_all(&packet.encode()).await?;
        Ok(())
    }

    pub async fn send_welcome(&mut self) -> Result<()> {
        self.send(&DownstreamPacket::Welcome {
            server_version: 1,
            protocol_version: 1,
        })
        .await
    }

    /// Reads until one complete upstream packet is available.
    pub async fn recv_packet(&mut self) -> Result<UpstreamPacket> {
        loop {
            if let Some(frame) = self.split_frame() {
                return Ok(UpstreamPacket::decode_frame(&frame)?);
            }

            let mut chunk = [0u8; 1024];
            let n = timeout(RECV_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .context("no packet within deadline")??;
            if n == 0 {
                bail!("connection closed while waiting for a packet");
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn split_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
        let total = FRAME_HEADER_LEN + length;
        if self.buf.len() < total {
            return None;
        }
        Some(self.buf.split_to(total).to_vec())
    }

    /// Asserts that the client sends nothing within the window.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<()> {
        let mut chunk = [0u8; 1024];
        match timeout(window, self.stream.read(&mut chunk)).await {
            Err(_) => Ok(()),
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(n)) => bail!("expected silence but received {n} bytes"),
            Ok(Err(err)) => Err(err.into()),
        }
    }

    /// Waits for the client to close its end.
    pub async fn expect_closed(&mut self, window: Duration) -> Result<()> {
        let mut chunk = [0u8; 1024];
        loop {
            match timeout(window, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return Ok(()),
                Err(_) => bail!("connection not closed within deadline"),
            }
        }
    }
}

/// Welcomes the client and waits until it is provably ready: packets
/// are processed in order, so once the pong to our ping comes back the
/// welcome has been handled too.
pub async fn handshake(conn: &mut ServerConn) -> Result<()> {
    conn.send_welcome().await?;
    conn.send(&DownstreamPacket::Ping).await?;
    let packet = conn.recv_packet().await?;
    ensure!(
        packet == UpstreamPacket::Pong,
        "expected a pong, got {packet:?}"
    );
    Ok(())
}

/// Ready observer backed by a channel, so tests can assert transitions
/// in order.
pub fn ready_probe() -> (Box<dyn Fn(bool) + Send + Sync>, UnboundedReceiver<bool>) {
    let (tx, rx) = unbounded_channel();
    let handler = Box::new(move |value: bool| {
        let _ = tx.send(value);
    });
    (handler, rx)
}

pub async fn expect_event<T>(rx: &mut UnboundedReceiver<T>) -> Result<T> {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .context("no event within deadline")?
        .context("event channel closed")
}

pub async fn expect_no_event<T>(
    rx: &mut UnboundedReceiver<T>,
    window: Duration,
) -> Result<()> {
    match timeout(window, rx.recv()).await {
        Err(_) => Ok(()),
        Ok(Some(_)) => bail!("expected no event within the window"),
        Ok(None) => Ok(()),
    }
}

pub async fn expect_ready(rx: &mut UnboundedReceiver<bool>, expected: bool) -> Result<()> {
    let value = expect_event(rx).await?;
    ensure!(value == expected, "expected ready={expected}, got {value}");
    Ok(())
}
