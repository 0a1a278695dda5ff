// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use nxtcp_client_rs::{
    channel::SessionOptions,
    create_channel_with_config,
    proto::{DownstreamPacket, UpstreamPacket},
    verbs::InterestStatus,
};
use tokio::sync::mpsc::unbounded_channel;

use crate::integration_tests::common::{
    SILENCE_WINDOW, TestServer, expect_event, expect_no_event, fast_config, handshake,
};

#[tokio::test]
async fn test_login_then_logout_compensation() -> Result<()> {
    let server = TestServer::bind().await?;
    let channel = create_channel_with_config(server.uri(), &fast_config())?;

    let mut conn = server.accept().await?;
    handshake(&mut conn).await?;

    let session = channel.session("name")?;

    let packet = conn.recv_packet().await?;
    assert_eq!(
        packet,
        UpstreamPacket::Login {
            persist: false,
            standby: false,
            enforce: false,
            name: Bytes::from_static(b"name"),
        }
    );

    // the login reached the server, so cancelling must log out
    session.cancel();

    let packet = conn.recv_packet().await?;
    assert_eq!(
        packet,
        UpstreamPacket::Logout {
            name: Bytes::from_static(b"name"),
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_session_option_flags_reach_the_wire() -> Result<()> {
    let server = TestServer::bind().await?;
    let channel = create_channel_with_config(server.uri(), &fast_config())?;

    let mut conn = server.accept().await?;
    handshake(&mut conn).await?;

    let _session = channel.session_with(
        "name",
        SessionOptions {
            force: true,
            persist: true,
            standby: true,
        },
    )?;

    let packet = conn.recv_packet().await?;
    assert_eq!(
        packet,
        UpstreamPacket::Login {
            persist: true,
            standby: true,
            enforce: true,
            name: Bytes::from_static(b"name"),
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_session_cancelled_before_login_sent() -> Result<()> {
    let server = TestServer::bind().await?;
    let channel = create_channel_with_config(server.uri(), &fast_config())?;

    // connected but not ready: the login sits in the auto-resend list
    let mut conn = server.accept().await?;

    let session = channel.session("name")?;
    session.cancel();

    handshake(&mut conn).await?;
    conn.expect_silence(SILENCE_WINDOW).await?;
    Ok(())
}

#[tokio::test]
async fn test_call_dispatch_and_post() -> Result<()> {
    let server = TestServer::bind().await?;
    let channel = create_channel_with_config(server.uri(), &fast_config())?;

    let mut conn = server.accept().await?;
    handshake(&mut conn).await?;

    let session = channel.session("svc")?;
    let _login = conn.recv_packet().await?;

    let (tx, mut calls) = unbounded_channel();
    session.add_call_handler(move |call| {
        let _ = tx.send((call.unidirectional, call.payload.clone()));
        if let Err(err) = call.post(&format!("re: {}", call.payload)) {
            panic!("post failed: {err}");
        }
    });

    conn.send(&DownstreamPacket::Call {
        unidirectional: false,
        postref: 7,
        name: Bytes::from_static(b"svc"),
        payload: Bytes::from_static(b"question"),
    })
    .await?;

    let (unidirectional, payload) = expect_event(&mut calls).await?;
    assert!(!unidirectional);
    assert_eq!(payload, "question");

    let packet = conn.recv_packet().await?;
    assert_eq!(
        packet,
        UpstreamPacket::Post {
            postref: 7,
            payload: Bytes::from_static(b"re: question"),
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_post_on_unidirectional_call_is_dropped() -> Result<()> {
    let server = TestServer::bind().await?;
    let channel = create_channel_with_config(server.uri(), &fast_config())?;

    let mut conn = server.accept().await?;
    handshake(&mut conn).await?;

    let session = channel.session("svc")?;
    let _login = conn.recv_packet().await?;

    let (tx, mut posts) = unbounded_channel();
    session.add_call_handler(move |call| {
        let posted = call
            .post("answer")
            .map(|post| post.is_some())
            .unwrap_or(false);
        let _ = tx.send(posted);
    });

    conn.send(&DownstreamPacket::Call {
        unidirectional: true,
        postref: 7,
        name: Bytes::from_static(b"svc"),
        payload: Bytes::from_static(b"fire-and-forget"),
    })
    .await?;

    assert!(!expect_event(&mut posts).await?, "post must be refused");
    conn.expect_silence(SILENCE_WINDOW).await?;
    Ok(())
}

#[tokio::test]
async fn test_interest_lifecycle_with_simulated_loss() -> Result<()> {
    let server = TestServer::bind().await?;
    let channel = create_channel_with_config(server.uri(), &fast_config())?;

    let mut conn = server.accept().await?;
    handshake(&mut conn).await?;

    let session = channel.session("svc")?;
    let _login = conn.recv_packet().await?;

    let (tx_any, mut all_events) = unbounded_channel();
    session.add_interest_handler(move |interest| {
        let _ = tx_any.send((interest.status, interest.topic.clone()));
    });
    let (tx_lost, mut lost_events) = unbounded_channel();
    session.add_interest_handler_filtered(InterestStatus::NO_INTEREST, move |interest| {
        let _ = tx_lost.send(interest.topic.clone());
    });

    conn.send(&DownstreamPacket::Interest {
        status: InterestStatus::INTEREST,
        postref: 9,
        name: Bytes::from_static(b"svc"),
        topic: Bytes::from_static(b"topic"),
    })
    .await?;

    let (status, topic) = expect_event(&mut all_events).await?;
    assert_eq!(status, InterestStatus::INTEREST);
    assert_eq!(topic, "topic");
    // the filtered handler must not see a live interest
    expect_no_event(&mut lost_events, SILENCE_WINDOW).await?;

    // losing the link synthesizes a no-interest for every held topic
    drop(conn);

    let (status, topic) = expect_event(&mut all_events).await?;
    assert_eq!(status, InterestStatus::NO_INTEREST);
    assert_eq!(topic, "topic");
    assert_eq!(expect_event(&mut lost_events).await?, "topic");

    // after the reconnect the login is replayed, and the interest set
    // starts out empty: a fresh loss synthesizes nothing
    let mut conn = server.accept().await?;
    conn.send_welcome().await?;
    let _login = conn.recv_packet().await?;

    drop(conn);
    expect_no_event(&mut all_events, SILENCE_WINDOW).await?;
    Ok(())
}

#[tokio::test]
async fn test_post_while_interest_is_live() -> Result<()> {
    let server = TestServer::bind().await?;
    let channel = create_channel_with_config(server.uri(), &fast_config())?;

    let mut conn = server.accept().await?;
    handshake(&mut conn).await?;

    let session = channel.session("svc")?;
    let _login = conn.recv_packet().await?;

    session.add_interest_handler(|interest| {
        if interest.status == InterestStatus::INTEREST {
            if let Err(err) = interest.post("value") {
                panic!("post failed: {err}");
            }
        } else {
            // posting on a lost interest must be refused
            let refused = interest
                .post("late")
                .map(|post| post.is_none())
                .unwrap_or(true);
            assert!(refused);
        }
    });

    conn.send(&DownstreamPacket::Interest {
        status: InterestStatus::INTEREST,
        postref: 9,
        name: Bytes::from_static(b"svc"),
        topic: Bytes::from_static(b"topic"),
    })
    .await?;

    let packet = conn.recv_packet().await?;
    assert_eq!(
        packet,
        UpstreamPacket::Post {
            postref: 9,
            payload: Bytes::from_static(b"value"),
        }
    );

    conn.send(&DownstreamPacket::Interest {
        status: InterestStatus::NO_INTEREST,
        postref: 9,
        name: Bytes::from_static(b"svc"),
        topic: Bytes::from_static(b"topic"),
    })
    .await?;

    conn.expect_silence(SILENCE_WINDOW).await?;
    Ok(())
}
