// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use nxtcp_client_rs::proto::{DecodeError, Decoder, DownstreamPacket};

use crate::unit_tests::frame;

fn ping() -> Vec<u8> {
    frame(0x80, b"")
}

fn welcome() -> Vec<u8> {
    hex::decode("00000008820000000100000001").expect("valid hex fixture")
}

#[test]
fn test_empty_decoder_has_nothing() -> Result<()> {
    let mut decoder = Decoder::new();
    assert_eq!(decoder.try_decode()?, None);
    Ok(())
}

#[test]
fn test_byte_at_a_time_feeding() -> Result<()> {
    let encoded = welcome();
    let mut decoder = Decoder::new();

    for (i, byte) in encoded.iter().enumerate() {
        assert_eq!(decoder.try_decode()?, None, "decoded early at byte {i}");
        decoder.push(&[*byte]);
    }

    assert_eq!(
        decoder.try_decode()?,
        Some(DownstreamPacket::Welcome {
            server_version: 1,
            protocol_version: 1,
        })
    );
    assert_eq!(decoder.try_decode()?, None);
    Ok(())
}

#[test]
fn test_multiple_packets_in_one_chunk() -> Result<()> {
    let mut chunk = welcome();
    chunk.extend_from_slice(&ping());
    chunk.extend_from_slice(&frame(0x83, b""));

    let mut decoder = Decoder::new();
    decoder.push(&chunk);

    assert!(matches!(
        decoder.try_decode()?,
        Some(DownstreamPacket::Welcome { .. })
    ));
    assert_eq!(decoder.try_decode()?, Some(DownstreamPacket::Ping));
    assert_eq!(decoder.try_decode()?, Some(DownstreamPacket::ByeBye));
    assert_eq!(decoder.try_decode()?, None);
    Ok(())
}

#[test]
fn test_packet_split_across_chunks() -> Result<()> {
    let encoded = welcome();
    let (left, right) = encoded.split_at(7);

    let mut decoder = Decoder::new();
    decoder.push(left);
    assert_eq!(decoder.try_decode()?, None);
    decoder.push(right);
    assert!(matches!(
        decoder.try_decode()?,
        Some(DownstreamPacket::Welcome { .. })
    ));
    Ok(())
}

#[test]
fn test_unknown_type_is_an_error_not_a_skip() -> Result<()> {
    let mut decoder = Decoder::new();
    decoder.push(&frame(0x7f, b"junk"));
    decoder.push(&ping());

    assert_eq!(decoder.try_decode(), Err(DecodeError::UnknownType(0x7f)));

    // the bad frame is consumed; the stream stays aligned
    assert_eq!(decoder.try_decode()?, Some(DownstreamPacket::Ping));
    Ok(())
}

#[test]
fn test_field_overrun_is_recoverable() -> Result<()> {
    // a SESSION frame whose name claims more bytes than the body holds
    let body = [2u8, 10, b'x'];
    let mut decoder = Decoder::new();
    decoder.push(&frame(0x02, &body));
    decoder.push(&ping());

    assert_eq!(
        decoder.try_decode(),
        Err(DecodeError::FieldOverrun {
            field: "name",
            length: 10,
            remaining: 1,
        })
    );
    assert_eq!(decoder.try_decode()?, Some(DownstreamPacket::Ping));
    Ok(())
}

#[test]
fn test_oversized_frame_is_fatal() {
    let mut header = Vec::new();
    header.extend_from_slice(&(1024u32 * 1024).to_be_bytes());
    header.push(0x07);

    let mut decoder = Decoder::new();
    decoder.push(&header);

    let err = decoder
        .try_decode()
        .expect_err("a megabyte frame must be rejected");
    assert_eq!(err, DecodeError::FrameTooLarge(1024 * 1024));
    assert!(err.is_fatal());
}

#[test]
fn test_recoverable_errors_are_not_fatal() {
    assert!(!DecodeError::UnknownType(0x7f).is_fatal());
    assert!(
        !DecodeError::FieldOverrun {
            field: "name",
            length: 1,
            remaining: 0,
        }
        .is_fatal()
    );
    assert!(
        !DecodeError::InvalidValue {
            field: "status",
            value: 9,
        }
        .is_fatal()
    );
}

#[test]
fn test_message_payload_survives_buffering() -> Result<()> {
    let packet = DownstreamPacket::Message {
        status: nxtcp_client_rs::verbs::MessageStatus::OK,
        messageref: 77,
        payload: Some(Bytes::from_static(b"the payload")),
    };

    let encoded = packet.encode();
    let mut decoder = Decoder::new();
    // drip-feed in uneven chunks
    for chunk in encoded.chunks(3) {
        decoder.push(chunk);
    }

    assert_eq!(decoder.try_decode()?, Some(packet));
    Ok(())
}
