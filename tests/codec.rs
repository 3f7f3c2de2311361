//! Wire codec tests: header fields, payload sections, signatures and TCP framing

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use peerwire::core::codec::{decode_message, encode_message, FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use peerwire::core::message::{commands, ContentType, Message, MessageType};
use peerwire::core::peer::{PeerAddress, PeerId, PeerSocketAddress};
use peerwire::core::signature::Ed25519SignatureFactory;
use peerwire::error::ProtocolError;
use std::net::{IpAddr, SocketAddr};
use tokio_util::codec::Framed;

const SENDER_SOCKET: &str = "192.168.1.20:4001";
const LOCAL_SOCKET: &str = "192.168.1.30:7700";

fn sock(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn relayed_sender() -> PeerAddress {
    PeerAddress::new(PeerId::from_u64(1), ip("192.168.1.20"), 4000, 4001)
        .with_relayed(true)
        .with_firewalled(true, false)
        .change_peer_socket_addresses(&[
            PeerSocketAddress::new(ip("10.0.0.1"), 5000, 5001),
            PeerSocketAddress::new(ip("2001:db8::1"), 6000, 6001),
        ])
}

fn decode(bytes: Bytes) -> Result<Message, ProtocolError> {
    decode_message(
        bytes,
        sock(SENDER_SOCKET),
        sock(LOCAL_SOCKET),
        true,
        &Ed25519SignatureFactory,
    )
}

#[test]
fn test_header_roundtrip() {
    let mut msg = Message::new();
    msg.set_message_id(0xDEAD_BEEF)
        .set_version(0x00AB_CDEF)
        .set_type(MessageType::Request3)
        .set_command(commands::NEIGHBOR)
        .set_sender(relayed_sender())
        .set_recipient(PeerAddress::new(PeerId::from_u64(2), ip("192.168.1.30"), 7700, 7700))
        .set_recipient_relay(PeerAddress::new(PeerId::from_u64(3), ip("10.9.9.9"), 1, 1))
        .set_keep_alive(true);

    let encoded = encode_message(&msg, &Ed25519SignatureFactory).unwrap();
    let decoded = decode(encoded.to_bytes()).unwrap();

    assert_eq!(decoded.message_id(), 0xDEAD_BEEF);
    assert_eq!(decoded.version(), 0x00AB_CDEF);
    assert_eq!(decoded.message_type(), MessageType::Request3);
    assert_eq!(decoded.command(), commands::NEIGHBOR);
    assert!(decoded.is_keep_alive());
    assert!(decoded.is_done());

    let sender = decoded.sender();
    assert_eq!(sender.peer_id(), PeerId::from_u64(1));
    assert_eq!(sender.tcp_port(), 4000);
    assert_eq!(sender.udp_port(), 4001);
    assert!(sender.is_relayed());
    assert!(sender.is_firewalled_udp());
    assert!(!sender.is_firewalled_tcp());
    assert_eq!(sender.relays(), relayed_sender().relays());
    // IPs are not on the wire; the sender's comes from the packet
    assert_eq!(sender.ip(), sock(SENDER_SOCKET).ip());

    assert_eq!(decoded.recipient().peer_id(), PeerId::from_u64(2));
    assert_eq!(decoded.recipient_relay().unwrap().peer_id(), PeerId::from_u64(3));
    assert_eq!(decoded.sender_socket(), Some(sock(SENDER_SOCKET)));
    assert!(decoded.is_udp());
}

#[test]
fn test_streaming_flag_roundtrip() {
    let mut msg = Message::new();
    msg.set_type(MessageType::PartiallyOk).set_streaming(true);

    let decoded = decode(encode_message(&msg, &Ed25519SignatureFactory).unwrap().to_bytes()).unwrap();
    assert!(!decoded.is_done());
    assert!(decoded.is_ok());
}

#[test]
fn test_payload_sections_roundtrip() {
    let neighbor = PeerAddress::new(PeerId::from_u64(9), ip("172.16.0.4"), 1200, 1201);
    let mut msg = Message::new();
    msg.set_key([7u8; 20]).unwrap();
    msg.set_integer(-42).unwrap();
    msg.set_long(i64::MAX).unwrap();
    msg.set_buffer(Bytes::from_static(b"zero copy")).unwrap();
    msg.set_neighbors(vec![neighbor.clone()]).unwrap();
    msg.set_peer_socket_addresses(vec![PeerSocketAddress::new(ip("10.1.1.1"), 1, 2)])
        .unwrap();
    msg.set_opaque(ContentType::BloomFilter, Bytes::from_static(&[1, 2, 3]))
        .unwrap();
    msg.set_empty().unwrap();

    let decoded = decode(encode_message(&msg, &Ed25519SignatureFactory).unwrap().to_bytes()).unwrap();

    assert_eq!(decoded.content_types(), msg.content_types());
    assert_eq!(decoded.keys(), &[[7u8; 20]]);
    assert_eq!(decoded.integers(), &[-42]);
    assert_eq!(decoded.longs(), &[i64::MAX]);
    assert_eq!(decoded.buffer(0).unwrap().as_ref(), b"zero copy");
    let neighbors = &decoded.neighbor_sets()[0];
    assert_eq!(neighbors[0], neighbor);
    assert_eq!(neighbors[0].ip(), ip("172.16.0.4"));
    assert_eq!(neighbors[0].udp_port(), 1201);
    assert_eq!(decoded.peer_socket_addresses()[0].tcp_port, 1);
    assert_eq!(decoded.opaque(ContentType::BloomFilter)[0].as_ref(), &[1, 2, 3]);
}

#[test]
fn test_signed_message_verifies() {
    let (public, secret) = Ed25519SignatureFactory::generate_key_pair();
    let mut msg = Message::new();
    msg.set_public_key_and_sign(public.clone(), secret).unwrap();
    msg.set_integer(5).unwrap();

    let decoded = decode(encode_message(&msg, &Ed25519SignatureFactory).unwrap().to_bytes()).unwrap();
    assert!(decoded.is_verified());
    assert_eq!(decoded.content_types()[0], ContentType::PublicKeySignature);
    assert_eq!(decoded.public_keys()[0], public);
    assert_eq!(decoded.integers(), &[5]);
}

#[test]
fn test_tampered_signed_message_rejected() {
    let (public, secret) = Ed25519SignatureFactory::generate_key_pair();
    let mut msg = Message::new();
    msg.set_command(commands::PUT);
    msg.set_public_key_and_sign(public, secret).unwrap();
    msg.set_long(99).unwrap();

    let mut raw = encode_message(&msg, &Ed25519SignatureFactory)
        .unwrap()
        .to_bytes()
        .to_vec();
    // command byte
    raw[8] ^= 0xFF;

    assert!(matches!(decode(Bytes::from(raw)), Err(ProtocolError::Signature(_))));
}

#[test]
fn test_unsigned_message_is_not_verified() {
    let decoded = decode(
        encode_message(&Message::new(), &Ed25519SignatureFactory)
            .unwrap()
            .to_bytes(),
    )
    .unwrap();
    assert!(!decoded.is_verified());
}

#[test]
fn test_truncated_packet_rejected() {
    let mut msg = Message::new();
    msg.set_buffer(Bytes::from(vec![1u8; 64])).unwrap();
    let raw = encode_message(&msg, &Ed25519SignatureFactory).unwrap().to_bytes();

    for cut in [0, 5, 20, raw.len() - 1] {
        assert!(
            matches!(decode(raw.slice(..cut)), Err(ProtocolError::Decode(_))),
            "cut at {cut} should fail"
        );
    }
}

#[test]
fn test_unknown_message_type_rejected() {
    let mut raw = encode_message(&Message::new(), &Ed25519SignatureFactory)
        .unwrap()
        .to_bytes()
        .to_vec();
    // type nibble lives in the upper half of byte 7
    raw[7] = (raw[7] & 0x0F) | 0xF0;
    assert!(matches!(decode(Bytes::from(raw)), Err(ProtocolError::Decode(_))));
}

#[tokio::test]
async fn test_framed_stream_carries_messages() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut client = Framed::new(client, FrameCodec::new(DEFAULT_MAX_FRAME_SIZE));
    let mut server = Framed::new(server, FrameCodec::new(DEFAULT_MAX_FRAME_SIZE));

    for id in 1..=3u32 {
        let mut msg = Message::new();
        msg.set_message_id(id);
        msg.set_buffer(Bytes::from(vec![id as u8; 1000 * id as usize]))
            .unwrap();
        client
            .send(encode_message(&msg, &Ed25519SignatureFactory).unwrap())
            .await
            .unwrap();
    }

    for id in 1..=3u32 {
        let frame = server.next().await.unwrap().unwrap();
        let decoded = decode_message(
            frame,
            sock(SENDER_SOCKET),
            sock(LOCAL_SOCKET),
            false,
            &Ed25519SignatureFactory,
        )
        .unwrap();
        assert_eq!(decoded.message_id(), id);
        assert_eq!(decoded.buffer(0).unwrap().len(), 1000 * id as usize);
        assert!(!decoded.is_udp());
    }
}

#[tokio::test]
async fn test_framed_stream_rejects_oversized_frame() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut client = Framed::new(client, FrameCodec::new(DEFAULT_MAX_FRAME_SIZE));
    let mut server = Framed::new(server, FrameCodec::new(1024));

    let mut msg = Message::new();
    msg.set_buffer(Bytes::from(vec![0u8; 4096])).unwrap();
    client
        .send(encode_message(&msg, &Ed25519SignatureFactory).unwrap())
        .await
        .unwrap();

    assert!(matches!(
        server.next().await,
        Some(Err(ProtocolError::OversizedPacket(_)))
    ));
}
