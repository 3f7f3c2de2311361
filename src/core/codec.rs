//! # Wire codec
//!
//! Bit-exact encoding of [`Message`]s and the length-delimited framing used on TCP.
//!
//! ## Message layout (big-endian)
//! ```text
//! [message id u32]
//! [version(24) | type(4) | options(4)] u32
//! [command u8]
//! [sender: peer id 20, flags u8, tcp u16, udp u16, relays if flagged]
//! [recipient peer id 20]
//! [content types u32, slot 0 in the top nibble]
//! [recipient relay peer id 20]        only with the relay-recipient option
//! [payload sections in slot order]
//! [signature]                         only if slot 0 is PublicKeySignature
//! ```
//!
//! ## TCP framing
//! ```text
//! [Length(4)] [Message(N)]
//! ```
//!
//! Buffers attached with `set_buffer` or as opaque sections are referenced by the
//! resulting [`CompositeBuffer`], never copied.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::composite::CompositeBuffer;
use crate::core::ensure_remaining;
use crate::core::message::{
    ContentType, Message, MessageType, CONTENT_TYPE_LENGTH, KEY_SIZE, MAX_VERSION,
    OPTION_KEEP_ALIVE, OPTION_RELAY_RECIPIENT, OPTION_STREAMING,
};
use crate::core::peer::{decode_ip, encode_ip, PeerAddress, PeerId, PeerSocketAddress};
use crate::core::signature::SignatureFactory;
use crate::error::{ProtocolError, Result};

/// Largest message that is sent as a single UDP datagram.
pub const MAX_UDP_PAYLOAD: usize = 1400;

/// Default upper bound of a TCP frame (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the fixed part of the header (without sender relays and recipient relay).
pub const HEADER_SIZE: usize = 4 + 4 + 1 + (20 + 1 + 2 + 2) + 20 + 4;

const FRAME_LENGTH_SIZE: usize = 4;

/// Packs the content-type vector into 8 nibbles, slot 0 first.
pub fn encode_content_types(types: &[ContentType; CONTENT_TYPE_LENGTH]) -> u32 {
    types.iter().enumerate().fold(0u32, |acc, (slot, ty)| {
        acc | (u32::from(ty.code()) << (28 - 4 * slot))
    })
}

pub fn decode_content_types(packed: u32) -> Result<[ContentType; CONTENT_TYPE_LENGTH]> {
    let mut types = [ContentType::Undefined; CONTENT_TYPE_LENGTH];
    for (slot, ty) in types.iter_mut().enumerate() {
        *ty = ContentType::from_code(((packed >> (28 - 4 * slot)) & 0x0F) as u8)?;
    }
    Ok(types)
}

/// Encodes `message` into a composite buffer.
///
/// # Errors
/// `Encode` if the version does not fit 24 bits or a content slot has no value, and
/// `Signature` if signing fails.
pub fn encode_message(message: &Message, signatures: &dyn SignatureFactory) -> Result<CompositeBuffer> {
    if message.version() > MAX_VERSION {
        return Err(ProtocolError::Encode(format!(
            "version {} does not fit 24 bits",
            message.version()
        )));
    }

    let mut out = CompositeBuffer::default();
    let mut current = BytesMut::with_capacity(HEADER_SIZE + 64);

    current.put_u32(message.message_id());
    current.put_u32(
        (message.version() << 8)
            | (u32::from(message.message_type().code()) << 4)
            | u32::from(message.options() & 0x0F),
    );
    current.put_u8(message.command());
    message.sender().encode(&mut current);
    message.recipient().peer_id().encode(&mut current);
    current.put_u32(encode_content_types(message.content_types()));
    if let Some(relay) = message.recipient_relay() {
        relay.peer_id().encode(&mut current);
    }

    for reference in message.content_references() {
        let missing = || {
            ProtocolError::Encode(format!(
                "no value for {:?} #{}",
                reference.content_type, reference.index
            ))
        };
        match reference.content_type {
            ContentType::Undefined | ContentType::Empty => {}
            ContentType::Key => {
                current.put_slice(message.key(reference.index).ok_or_else(missing)?);
            }
            ContentType::Integer => {
                current.put_i32(*message.integers().get(reference.index).ok_or_else(missing)?);
            }
            ContentType::Long => {
                current.put_i64(*message.longs().get(reference.index).ok_or_else(missing)?);
            }
            ContentType::ByteBuffer => {
                let buf = message.buffer(reference.index).ok_or_else(missing)?;
                current.put_u32(buf.len() as u32);
                out.add_component(current.split().freeze());
                out.add_component(buf.clone());
            }
            ContentType::SetNeighbors => {
                let set = message
                    .neighbor_sets()
                    .get(reference.index)
                    .ok_or_else(missing)?;
                if set.len() > u8::MAX as usize {
                    return Err(ProtocolError::Encode(format!(
                        "neighbor set too large: {}",
                        set.len()
                    )));
                }
                current.put_u8(set.len() as u8);
                for neighbor in set {
                    encode_ip(&neighbor.ip(), &mut current);
                    neighbor.encode(&mut current);
                }
            }
            ContentType::SetPeerSocket => {
                let set = message
                    .peer_socket_sets()
                    .get(reference.index)
                    .ok_or_else(missing)?;
                if set.len() > u8::MAX as usize {
                    return Err(ProtocolError::Encode(format!(
                        "socket address set too large: {}",
                        set.len()
                    )));
                }
                current.put_u8(set.len() as u8);
                for addr in set {
                    addr.encode(&mut current);
                }
            }
            ContentType::PublicKey | ContentType::PublicKeySignature => {
                let key = message
                    .public_keys()
                    .get(reference.index)
                    .ok_or_else(missing)?;
                signatures.check_public_key(key)?;
                current.put_u16(key.len() as u16);
                current.put_slice(key);
            }
            opaque => {
                let data = message
                    .opaque(opaque)
                    .get(reference.index)
                    .ok_or_else(missing)?;
                current.put_u32(data.len() as u32);
                out.add_component(current.split().freeze());
                out.add_component(data.clone());
            }
        }
    }
    out.add_component(current.freeze());

    if message.content_types()[0] == ContentType::PublicKeySignature {
        let signing_key = message
            .signing_key()
            .ok_or_else(|| ProtocolError::Signature("no signing key attached".into()))?;
        let signature = signatures.sign(signing_key, &out.to_bytes())?;
        out.add_component(signature);
    }

    Ok(out)
}

/// Decodes one complete message.
///
/// `sender` and `recipient` are the socket addresses of the packet; the sender's IP is
/// taken from `sender` since it is not part of the encoded peer address.
pub fn decode_message(
    packet: Bytes,
    sender: SocketAddr,
    recipient: SocketAddr,
    udp: bool,
    signatures: &dyn SignatureFactory,
) -> Result<Message> {
    let original = packet.clone();
    let mut buf = packet;
    let mut message = Message::new();

    ensure_remaining(&buf, 9)?;
    let message_id = buf.get_u32();
    let word = buf.get_u32();
    let command = buf.get_u8();
    let version = word >> 8;
    let message_type = MessageType::from_code(((word >> 4) & 0x0F) as u8)?;
    let options = (word & 0x0F) as u8;

    let sender_address = PeerAddress::decode(&mut buf, sender.ip())?;
    let recipient_id = PeerId::decode(&mut buf)?;
    ensure_remaining(&buf, 4)?;
    let content_types = decode_content_types(buf.get_u32())?;

    message
        .set_message_id(message_id)
        .set_version(version)
        .set_type(message_type)
        .set_command(command)
        .set_sender(sender_address)
        .set_recipient(PeerAddress::from_socket(recipient_id, recipient))
        .set_keep_alive(options & OPTION_KEEP_ALIVE != 0)
        .set_streaming(options & OPTION_STREAMING != 0)
        .set_transport(sender, recipient, udp);

    if options & OPTION_RELAY_RECIPIENT != 0 {
        let relay_id = PeerId::decode(&mut buf)?;
        message.set_recipient_relay(PeerAddress::from_socket(relay_id, recipient));
    }

    let mut seen_undefined = false;
    for ty in content_types {
        if ty == ContentType::Undefined {
            seen_undefined = true;
            continue;
        }
        if seen_undefined {
            return Err(ProtocolError::decode("content type after an undefined slot"));
        }
        decode_section(ty, &mut buf, &mut message, signatures)?;
    }

    if content_types[0] == ContentType::PublicKeySignature {
        let signed_len = original.len() - buf.remaining();
        let size = signatures.signature_size();
        ensure_remaining(&buf, size)?;
        let signature = buf.split_to(size);
        let public_key = message.public_keys()[0].clone();
        if !signatures.verify(&public_key, &original[..signed_len], &signature)? {
            return Err(ProtocolError::Signature(format!(
                "signature mismatch for message {message_id}"
            )));
        }
        message.set_verified(true);
    }

    if buf.has_remaining() {
        return Err(ProtocolError::decode(format!(
            "{} trailing bytes after message",
            buf.remaining()
        )));
    }
    Ok(message)
}

fn decode_section(
    ty: ContentType,
    buf: &mut Bytes,
    message: &mut Message,
    signatures: &dyn SignatureFactory,
) -> Result<()> {
    match ty {
        ContentType::Undefined => {}
        ContentType::Empty => {
            message.set_empty()?;
        }
        ContentType::Key => {
            ensure_remaining(buf, KEY_SIZE)?;
            let mut key = [0u8; KEY_SIZE];
            buf.copy_to_slice(&mut key);
            message.set_key(key)?;
        }
        ContentType::Integer => {
            ensure_remaining(buf, 4)?;
            message.set_integer(buf.get_i32())?;
        }
        ContentType::Long => {
            ensure_remaining(buf, 8)?;
            message.set_long(buf.get_i64())?;
        }
        ContentType::ByteBuffer => {
            message.set_buffer(read_blob(buf)?)?;
        }
        ContentType::SetNeighbors => {
            ensure_remaining(buf, 1)?;
            let count = buf.get_u8() as usize;
            let mut neighbors = Vec::with_capacity(count);
            for _ in 0..count {
                let ip = decode_ip(buf)?;
                neighbors.push(PeerAddress::decode(buf, ip)?);
            }
            message.set_neighbors(neighbors)?;
        }
        ContentType::SetPeerSocket => {
            ensure_remaining(buf, 1)?;
            let count = buf.get_u8() as usize;
            let mut addresses = Vec::with_capacity(count);
            for _ in 0..count {
                addresses.push(PeerSocketAddress::decode(buf)?);
            }
            message.set_peer_socket_addresses(addresses)?;
        }
        ContentType::PublicKey | ContentType::PublicKeySignature => {
            ensure_remaining(buf, 2)?;
            let len = buf.get_u16() as usize;
            ensure_remaining(buf, len)?;
            let key = buf.split_to(len);
            signatures.check_public_key(&key)?;
            if ty == ContentType::PublicKey {
                message.set_public_key(key)?;
            } else {
                message.set_signed_public_key(key)?;
            }
        }
        opaque => {
            message.set_opaque(opaque, read_blob(buf)?)?;
        }
    }
    Ok(())
}

fn read_blob(buf: &mut Bytes) -> Result<Bytes> {
    ensure_remaining(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure_remaining(buf, len)?;
    Ok(buf.split_to(len))
}

/// Length-delimited framing of encoded messages on a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < FRAME_LENGTH_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        if src.len() < FRAME_LENGTH_SIZE + len {
            src.reserve(FRAME_LENGTH_SIZE + len - src.len());
            return Ok(None);
        }
        src.advance(FRAME_LENGTH_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<CompositeBuffer> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: CompositeBuffer, dst: &mut BytesMut) -> Result<()> {
        let len = item.capacity();
        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        dst.reserve(FRAME_LENGTH_SIZE + len);
        dst.put_u32(len as u32);
        for component in item.components() {
            dst.put_slice(component);
        }
        Ok(())
    }
}
