//! # Message Model
//!
//! The wire-level request/response entity exchanged between peers.
//!
//! A [`Message`] is a header (id, version, type, command, sender, recipient) followed by up
//! to eight typed payload sections. The kinds of the sections are announced by the
//! content-type vector, which is filled append-only through [`Message::set_content_type`]
//! or through one of the typed payload setters (`set_key`, `set_integer`, ...).
//!
//! ## Content references
//! Several slots may carry the same content type (two key sets, for example). Every
//! assignment records a [`ContentReference`] whose `index` says which occurrence of that
//! type the slot holds, so the codec can pick the right value out of the payload lists.
//! `PublicKey` and `PublicKeySignature` share one list and count as one family.

use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;

use crate::core::peer::{PeerAddress, PeerSocketAddress};
use crate::error::{constants, ProtocolError, Result};

/// Number of content-type slots in a message.
pub const CONTENT_TYPE_LENGTH: usize = 8;

/// Largest version that fits the 24-bit header field.
pub const MAX_VERSION: u32 = 0x00FF_FFFF;

/// Size of a key section.
pub const KEY_SIZE: usize = 20;

pub(crate) const OPTION_KEEP_ALIVE: u8 = 0x01;
pub(crate) const OPTION_STREAMING: u8 = 0x02;
pub(crate) const OPTION_RELAY_RECIPIENT: u8 = 0x04;

/// Well-known command codes. The core only carries them; their meaning belongs to the
/// RPC layer.
pub mod commands {
    pub const PING: u8 = 0;
    pub const PUT: u8 = 1;
    pub const GET: u8 = 2;
    pub const ADD: u8 = 3;
    pub const REMOVE: u8 = 4;
    pub const NEIGHBOR: u8 = 5;
    pub const QUIT: u8 = 6;
    pub const DIRECT_DATA: u8 = 7;
    pub const TRACKER_ADD: u8 = 8;
    pub const TRACKER_GET: u8 = 9;
    pub const PEX: u8 = 10;
    pub const DIGEST: u8 = 11;
    pub const BROADCAST: u8 = 12;
    pub const PUT_META: u8 = 13;
    pub const DIGEST_BLOOMFILTER: u8 = 14;
    pub const RELAY: u8 = 15;
    pub const DIGEST_META_VALUES: u8 = 16;
    pub const SYNC: u8 = 17;
    pub const SYNC_INFO: u8 = 18;
    pub const PUT_CONFIRM: u8 = 19;
    pub const GET_LATEST: u8 = 20;
    /// Reverse connection setup through a relay. Replies to it legitimately change the
    /// relay flag mid-handshake.
    pub const RCON: u8 = 21;
}

/// Kind of a payload section, transmitted as a 4-bit tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum ContentType {
    #[default]
    Undefined = 0,
    Empty = 1,
    Key = 2,
    MapKey640Data = 3,
    MapKey640Keys = 4,
    SetKey640 = 5,
    SetNeighbors = 6,
    ByteBuffer = 7,
    Long = 8,
    Integer = 9,
    PublicKeySignature = 10,
    SetTrackerData = 11,
    BloomFilter = 12,
    MapKey640Byte = 13,
    PublicKey = 14,
    SetPeerSocket = 15,
}

impl ContentType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        let ty = match code {
            0 => ContentType::Undefined,
            1 => ContentType::Empty,
            2 => ContentType::Key,
            3 => ContentType::MapKey640Data,
            4 => ContentType::MapKey640Keys,
            5 => ContentType::SetKey640,
            6 => ContentType::SetNeighbors,
            7 => ContentType::ByteBuffer,
            8 => ContentType::Long,
            9 => ContentType::Integer,
            10 => ContentType::PublicKeySignature,
            11 => ContentType::SetTrackerData,
            12 => ContentType::BloomFilter,
            13 => ContentType::MapKey640Byte,
            14 => ContentType::PublicKey,
            15 => ContentType::SetPeerSocket,
            _ => {
                return Err(ProtocolError::decode(format!(
                    "{}: {code}",
                    constants::ERR_UNKNOWN_CONTENT_TYPE
                )))
            }
        };
        Ok(ty)
    }

    fn is_public_key_family(self) -> bool {
        matches!(
            self,
            ContentType::PublicKey | ContentType::PublicKeySignature
        )
    }

    /// Content types whose schema is owned by higher layers; the core carries them as
    /// length-prefixed blobs.
    pub fn is_opaque(self) -> bool {
        matches!(
            self,
            ContentType::MapKey640Data
                | ContentType::MapKey640Keys
                | ContentType::SetKey640
                | ContentType::SetTrackerData
                | ContentType::BloomFilter
                | ContentType::MapKey640Byte
        )
    }
}

/// Request kind or reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageType {
    #[default]
    Request1 = 0,
    Request2 = 1,
    Request3 = 2,
    Request4 = 3,
    RequestFf1 = 4,
    RequestFf2 = 5,
    Ok = 6,
    PartiallyOk = 7,
    NotFound = 8,
    Denied = 9,
    UnknownId = 10,
    Exception = 11,
    Cancel = 12,
    User1 = 13,
    User2 = 14,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        let ty = match code {
            0 => MessageType::Request1,
            1 => MessageType::Request2,
            2 => MessageType::Request3,
            3 => MessageType::Request4,
            4 => MessageType::RequestFf1,
            5 => MessageType::RequestFf2,
            6 => MessageType::Ok,
            7 => MessageType::PartiallyOk,
            8 => MessageType::NotFound,
            9 => MessageType::Denied,
            10 => MessageType::UnknownId,
            11 => MessageType::Exception,
            12 => MessageType::Cancel,
            13 => MessageType::User1,
            14 => MessageType::User2,
            _ => {
                return Err(ProtocolError::decode(format!(
                    "{}: {code}",
                    constants::ERR_UNKNOWN_MESSAGE_TYPE
                )))
            }
        };
        Ok(ty)
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::Request1
                | MessageType::Request2
                | MessageType::Request3
                | MessageType::Request4
                | MessageType::RequestFf1
                | MessageType::RequestFf2
        )
    }

    pub fn is_fire_and_forget(self) -> bool {
        matches!(self, MessageType::RequestFf1 | MessageType::RequestFf2)
    }
}

/// Locates the `index`-th occurrence of `content_type` among the slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentReference {
    pub index: usize,
    pub content_type: ContentType,
}

/// Correlation key of a request and its reply.
///
/// `peer` is the identity of the node that issued the request: the sender of a request,
/// the recipient of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub id: u32,
    pub peer: crate::core::peer::PeerId,
}

impl From<&Message> for MessageId {
    fn from(message: &Message) -> Self {
        let peer = if message.is_request() {
            message.sender().peer_id()
        } else {
            message.recipient().peer_id()
        };
        Self {
            id: message.message_id(),
            peer,
        }
    }
}

/// A request or reply with header and payload.
#[derive(Clone)]
pub struct Message {
    // header
    message_id: u32,
    version: u32,
    message_type: MessageType,
    command: u8,
    sender: PeerAddress,
    recipient: PeerAddress,
    recipient_relay: Option<PeerAddress>,
    keep_alive: bool,
    streaming: bool,

    // payload layout
    content_types: [ContentType; CONTENT_TYPE_LENGTH],
    content_references: VecDeque<ContentReference>,

    // payload values
    keys: Vec<[u8; KEY_SIZE]>,
    integers: Vec<i32>,
    longs: Vec<i64>,
    buffers: Vec<Bytes>,
    neighbor_sets: Vec<Vec<PeerAddress>>,
    peer_socket_sets: Vec<Vec<PeerSocketAddress>>,
    public_keys: Vec<Bytes>,
    opaque: BTreeMap<ContentType, Vec<Bytes>>,

    // signing
    signing_key: Option<Bytes>,
    verified: bool,

    // transport facts, never serialized
    sender_socket: Option<SocketAddr>,
    recipient_socket: Option<SocketAddr>,
    udp: bool,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// Creates an empty message with id 0. Request ids are issued by the
    /// [`MessageIdSource`](crate::protocol::sender::MessageIdSource) of the component that
    /// sends the request.
    pub fn new() -> Self {
        Self {
            message_id: 0,
            version: 0,
            message_type: MessageType::Request1,
            command: 0,
            sender: PeerAddress::unknown(),
            recipient: PeerAddress::unknown(),
            recipient_relay: None,
            keep_alive: false,
            streaming: false,
            content_types: [ContentType::Undefined; CONTENT_TYPE_LENGTH],
            content_references: VecDeque::new(),
            keys: Vec::new(),
            integers: Vec::new(),
            longs: Vec::new(),
            buffers: Vec::new(),
            neighbor_sets: Vec::new(),
            peer_socket_sets: Vec::new(),
            public_keys: Vec::new(),
            opaque: BTreeMap::new(),
            signing_key: None,
            verified: false,
            sender_socket: None,
            recipient_socket: None,
            udp: false,
        }
    }

    /// Builds the reply envelope for `request`: same id, version and command, sent by
    /// `local` back to the requester.
    pub fn response_to(request: &Message, local: &PeerAddress, message_type: MessageType) -> Self {
        let mut reply = Message::new();
        reply
            .set_message_id(request.message_id)
            .set_version(request.version)
            .set_command(request.command)
            .set_type(message_type)
            .set_sender(local.clone())
            .set_recipient(request.sender.clone())
            .set_keep_alive(request.keep_alive);
        reply.udp = request.udp;
        reply.recipient_socket = request.sender_socket;
        reply
    }

    // *** header setters ***

    pub fn set_message_id(&mut self, message_id: u32) -> &mut Self {
        self.message_id = message_id;
        self
    }

    /// Sets the 24-bit version. Larger values are rejected when the message is encoded.
    pub fn set_version(&mut self, version: u32) -> &mut Self {
        self.version = version;
        self
    }

    pub fn set_type(&mut self, message_type: MessageType) -> &mut Self {
        self.message_type = message_type;
        self
    }

    pub fn set_command(&mut self, command: u8) -> &mut Self {
        self.command = command;
        self
    }

    pub fn set_sender(&mut self, sender: PeerAddress) -> &mut Self {
        self.sender = sender;
        self
    }

    pub fn set_recipient(&mut self, recipient: PeerAddress) -> &mut Self {
        self.recipient = recipient;
        self
    }

    pub fn set_recipient_relay(&mut self, relay: PeerAddress) -> &mut Self {
        self.recipient_relay = Some(relay);
        self
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Marks this reply as one part of a streamed result; more replies follow.
    pub fn set_streaming(&mut self, streaming: bool) -> &mut Self {
        self.streaming = streaming;
        self
    }

    pub(crate) fn set_transport(
        &mut self,
        sender_socket: SocketAddr,
        recipient_socket: SocketAddr,
        udp: bool,
    ) -> &mut Self {
        self.sender_socket = Some(sender_socket);
        self.recipient_socket = Some(recipient_socket);
        self.udp = udp;
        self
    }

    pub(crate) fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }

    // *** content types ***

    /// Appends `content_type` to the first free slot.
    ///
    /// # Errors
    /// `ProtocolError::State` if all eight slots are used, if `PublicKeySignature` would
    /// not land in slot 0, or if `content_type` is `Undefined`.
    pub fn set_content_type(&mut self, content_type: ContentType) -> Result<&mut Self> {
        if content_type == ContentType::Undefined {
            return Err(ProtocolError::state(constants::ERR_UNDEFINED_CONTENT));
        }
        let mut reference = 0;
        for slot in 0..CONTENT_TYPE_LENGTH {
            let current = self.content_types[slot];
            if current == ContentType::Undefined {
                if content_type == ContentType::PublicKeySignature && slot != 0 {
                    return Err(ProtocolError::state(constants::ERR_SIGNATURE_SLOT));
                }
                self.content_types[slot] = content_type;
                self.content_references.push_back(ContentReference {
                    index: reference,
                    content_type,
                });
                return Ok(self);
            }
            if current == content_type
                || (current.is_public_key_family() && content_type.is_public_key_family())
            {
                reference += 1;
            }
        }
        Err(ProtocolError::state(constants::ERR_CONTENT_TYPES_FULL))
    }

    pub fn content_types(&self) -> &[ContentType; CONTENT_TYPE_LENGTH] {
        &self.content_types
    }

    pub fn content_references(&self) -> &VecDeque<ContentReference> {
        &self.content_references
    }

    /// Number of used slots.
    pub fn content_count(&self) -> usize {
        self.content_types
            .iter()
            .take_while(|ty| **ty != ContentType::Undefined)
            .count()
    }

    pub fn has_content(&self) -> bool {
        self.content_types[0] != ContentType::Undefined
    }

    // *** payload setters ***

    pub fn set_empty(&mut self) -> Result<&mut Self> {
        self.set_content_type(ContentType::Empty)
    }

    pub fn set_key(&mut self, key: [u8; KEY_SIZE]) -> Result<&mut Self> {
        self.set_content_type(ContentType::Key)?;
        self.keys.push(key);
        Ok(self)
    }

    pub fn set_integer(&mut self, value: i32) -> Result<&mut Self> {
        self.set_content_type(ContentType::Integer)?;
        self.integers.push(value);
        Ok(self)
    }

    pub fn set_long(&mut self, value: i64) -> Result<&mut Self> {
        self.set_content_type(ContentType::Long)?;
        self.longs.push(value);
        Ok(self)
    }

    /// Attaches a buffer without copying it.
    pub fn set_buffer(&mut self, buffer: Bytes) -> Result<&mut Self> {
        self.set_content_type(ContentType::ByteBuffer)?;
        self.buffers.push(buffer);
        Ok(self)
    }

    pub fn set_neighbors(&mut self, neighbors: Vec<PeerAddress>) -> Result<&mut Self> {
        self.set_content_type(ContentType::SetNeighbors)?;
        self.neighbor_sets.push(neighbors);
        Ok(self)
    }

    /// Attaches socket addresses, typically the up-to-date relays of the sender.
    pub fn set_peer_socket_addresses(
        &mut self,
        addresses: Vec<PeerSocketAddress>,
    ) -> Result<&mut Self> {
        self.set_content_type(ContentType::SetPeerSocket)?;
        self.peer_socket_sets.push(addresses);
        Ok(self)
    }

    pub fn set_public_key(&mut self, public_key: Bytes) -> Result<&mut Self> {
        self.set_content_type(ContentType::PublicKey)?;
        self.public_keys.push(public_key);
        Ok(self)
    }

    /// Attaches `public_key` in slot 0 and asks the encoder to sign the message with
    /// `signing_key`.
    pub fn set_public_key_and_sign(
        &mut self,
        public_key: Bytes,
        signing_key: Bytes,
    ) -> Result<&mut Self> {
        self.set_content_type(ContentType::PublicKeySignature)?;
        self.public_keys.push(public_key);
        self.signing_key = Some(signing_key);
        Ok(self)
    }

    /// Decoder counterpart of [`set_public_key_and_sign`](Self::set_public_key_and_sign):
    /// the received message carries the key but no signing key.
    pub(crate) fn set_signed_public_key(&mut self, public_key: Bytes) -> Result<&mut Self> {
        self.set_content_type(ContentType::PublicKeySignature)?;
        self.public_keys.push(public_key);
        Ok(self)
    }

    /// Attaches a section whose schema belongs to a higher layer.
    pub fn set_opaque(&mut self, content_type: ContentType, data: Bytes) -> Result<&mut Self> {
        if !content_type.is_opaque() {
            return Err(ProtocolError::state(format!(
                "{content_type:?} is not an opaque content type"
            )));
        }
        self.set_content_type(content_type)?;
        self.opaque.entry(content_type).or_default().push(data);
        Ok(self)
    }

    // *** header getters ***

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn sender(&self) -> &PeerAddress {
        &self.sender
    }

    pub fn recipient(&self) -> &PeerAddress {
        &self.recipient
    }

    pub fn recipient_relay(&self) -> Option<&PeerAddress> {
        self.recipient_relay.as_ref()
    }

    pub fn sender_socket(&self) -> Option<SocketAddr> {
        self.sender_socket
    }

    pub fn recipient_socket(&self) -> Option<SocketAddr> {
        self.recipient_socket
    }

    pub fn is_udp(&self) -> bool {
        self.udp
    }

    pub fn is_request(&self) -> bool {
        self.message_type.is_request()
    }

    pub fn is_fire_and_forget(&self) -> bool {
        self.message_type.is_fire_and_forget()
    }

    /// Ok or PartiallyOk.
    pub fn is_ok(&self) -> bool {
        matches!(self.message_type, MessageType::Ok | MessageType::PartiallyOk)
    }

    /// NotFound or Denied: a well-formed answer that did not succeed.
    pub fn is_not_ok(&self) -> bool {
        matches!(self.message_type, MessageType::NotFound | MessageType::Denied)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// `false` while this is one part of a streamed result.
    pub fn is_done(&self) -> bool {
        !self.streaming
    }

    /// Whether the signature of a received message was checked successfully.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub(crate) fn signing_key(&self) -> Option<&Bytes> {
        self.signing_key.as_ref()
    }

    pub(crate) fn options(&self) -> u8 {
        let mut options = 0;
        if self.keep_alive {
            options |= OPTION_KEEP_ALIVE;
        }
        if self.streaming {
            options |= OPTION_STREAMING;
        }
        if self.recipient_relay.is_some() {
            options |= OPTION_RELAY_RECIPIENT;
        }
        options
    }

    // *** payload getters ***

    pub fn keys(&self) -> &[[u8; KEY_SIZE]] {
        &self.keys
    }

    pub fn key(&self, index: usize) -> Option<&[u8; KEY_SIZE]> {
        self.keys.get(index)
    }

    pub fn integers(&self) -> &[i32] {
        &self.integers
    }

    pub fn longs(&self) -> &[i64] {
        &self.longs
    }

    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }

    pub fn buffer(&self, index: usize) -> Option<&Bytes> {
        self.buffers.get(index)
    }

    pub fn neighbor_sets(&self) -> &[Vec<PeerAddress>] {
        &self.neighbor_sets
    }

    /// Socket addresses of the first `SetPeerSocket` section, empty if there is none.
    pub fn peer_socket_addresses(&self) -> &[PeerSocketAddress] {
        self.peer_socket_sets
            .first()
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn peer_socket_sets(&self) -> &[Vec<PeerSocketAddress>] {
        &self.peer_socket_sets
    }

    pub fn public_keys(&self) -> &[Bytes] {
        &self.public_keys
    }

    pub fn opaque(&self, content_type: ContentType) -> &[Bytes] {
        self.opaque
            .get(&content_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.message_id)
            .field("version", &self.version)
            .field("type", &self.message_type)
            .field("command", &self.command)
            .field("sender", &self.sender.peer_id())
            .field("recipient", &self.recipient.peer_id())
            .field("content", &&self.content_types[..self.content_count()])
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "msg:nr={},t={:?},c={},{}->{}",
            self.message_id,
            self.message_type,
            self.command,
            self.sender.peer_id(),
            self.recipient.peer_id()
        )
    }
}
