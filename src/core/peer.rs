//! Peer identities.
//!
//! A [`PeerAddress`] is the logical identity of a node: its 160-bit [`PeerId`], the ports it
//! listens on, some reachability flags and, for relayed peers, the socket addresses of its
//! relays. The IP of a peer is never put on the wire as part of its own address; it is taken
//! from the packet that carried the message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::core::ensure_remaining;
use crate::error::{ProtocolError, Result};

/// Size of a peer id on the wire.
pub const PEER_ID_SIZE: usize = 20;

/// Maximum number of relay addresses a peer address may carry.
pub const MAX_RELAYS: usize = 5;

const FLAG_RELAYED: u8 = 0x01;
const FLAG_FIREWALLED_UDP: u8 = 0x02;
const FLAG_FIREWALLED_TCP: u8 = 0x04;

/// 160-bit peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    pub const ZERO: PeerId = PeerId([0u8; PEER_ID_SIZE]);

    pub fn new(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds an id whose low 64 bits are `value`.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; PEER_ID_SIZE];
        bytes[PEER_ID_SIZE - 8..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; PEER_ID_SIZE]
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self> {
        ensure_remaining(buf, PEER_ID_SIZE)?;
        let mut bytes = [0u8; PEER_ID_SIZE];
        buf.copy_to_slice(&mut bytes);
        Ok(Self(bytes))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Writes `[family u8: 4|6][octets]`.
pub(crate) fn encode_ip(ip: &IpAddr, buf: &mut BytesMut) {
    match ip {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.octets());
        }
    }
}

pub(crate) fn decode_ip(buf: &mut Bytes) -> Result<IpAddr> {
    ensure_remaining(buf, 1)?;
    match buf.get_u8() {
        4 => {
            ensure_remaining(buf, 4)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 => {
            ensure_remaining(buf, 16)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => Err(ProtocolError::decode(format!(
            "Unknown address family marker {other}"
        ))),
    }
}

/// A reachable endpoint of a peer: one IP with its TCP and UDP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerSocketAddress {
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl PeerSocketAddress {
    pub fn new(ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            ip,
            tcp_port,
            udp_port,
        }
    }

    pub fn tcp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        encode_ip(&self.ip, buf);
        buf.put_u16(self.tcp_port);
        buf.put_u16(self.udp_port);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self> {
        let ip = decode_ip(buf)?;
        ensure_remaining(buf, 4)?;
        let tcp_port = buf.get_u16();
        let udp_port = buf.get_u16();
        Ok(Self::new(ip, tcp_port, udp_port))
    }
}

/// Logical identity of a node. Equality and hashing only consider the [`PeerId`].
#[derive(Debug, Clone)]
pub struct PeerAddress {
    peer_id: PeerId,
    ip: IpAddr,
    tcp_port: u16,
    udp_port: u16,
    relayed: bool,
    firewalled_udp: bool,
    firewalled_tcp: bool,
    relays: Vec<PeerSocketAddress>,
}

impl PeerAddress {
    pub fn new(peer_id: PeerId, ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            peer_id,
            ip,
            tcp_port,
            udp_port,
            relayed: false,
            firewalled_udp: false,
            firewalled_tcp: false,
            relays: Vec::new(),
        }
    }

    /// A peer address bound to a single socket address for both transports.
    pub fn from_socket(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self::new(peer_id, addr.ip(), addr.port(), addr.port())
    }

    /// Placeholder used before the real identity is known.
    pub fn unknown() -> Self {
        Self::new(PeerId::ZERO, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn tcp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn is_relayed(&self) -> bool {
        self.relayed
    }

    pub fn is_firewalled_udp(&self) -> bool {
        self.firewalled_udp
    }

    pub fn is_firewalled_tcp(&self) -> bool {
        self.firewalled_tcp
    }

    pub fn relays(&self) -> &[PeerSocketAddress] {
        &self.relays
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    pub fn with_relayed(mut self, relayed: bool) -> Self {
        self.relayed = relayed;
        self
    }

    pub fn with_firewalled(mut self, udp: bool, tcp: bool) -> Self {
        self.firewalled_udp = udp;
        self.firewalled_tcp = tcp;
        self
    }

    /// Returns a copy with the relay socket addresses replaced. At most [`MAX_RELAYS`]
    /// addresses are kept.
    pub fn change_peer_socket_addresses(&self, relays: &[PeerSocketAddress]) -> Self {
        let mut copy = self.clone();
        copy.relays = relays.iter().take(MAX_RELAYS).copied().collect();
        copy
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.relayed {
            flags |= FLAG_RELAYED;
        }
        if self.firewalled_udp {
            flags |= FLAG_FIREWALLED_UDP;
        }
        if self.firewalled_tcp {
            flags |= FLAG_FIREWALLED_TCP;
        }
        flags
    }

    /// Writes the address without its IP.
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        self.peer_id.encode(buf);
        buf.put_u8(self.flags());
        buf.put_u16(self.tcp_port);
        buf.put_u16(self.udp_port);
        if self.relayed {
            let relays = &self.relays[..self.relays.len().min(MAX_RELAYS)];
            buf.put_u8(relays.len() as u8);
            for relay in relays {
                relay.encode(buf);
            }
        }
    }

    /// Reads an address written by [`encode`](Self::encode); the IP comes from `ip`.
    pub(crate) fn decode(buf: &mut Bytes, ip: IpAddr) -> Result<Self> {
        let peer_id = PeerId::decode(buf)?;
        ensure_remaining(buf, 5)?;
        let flags = buf.get_u8();
        let tcp_port = buf.get_u16();
        let udp_port = buf.get_u16();
        let mut address = PeerAddress::new(peer_id, ip, tcp_port, udp_port)
            .with_relayed(flags & FLAG_RELAYED != 0)
            .with_firewalled(flags & FLAG_FIREWALLED_UDP != 0, flags & FLAG_FIREWALLED_TCP != 0);
        if address.relayed {
            ensure_remaining(buf, 1)?;
            let count = buf.get_u8() as usize;
            if count > MAX_RELAYS {
                return Err(ProtocolError::decode(format!("Too many relays: {count}")));
            }
            for _ in 0..count {
                address.relays.push(PeerSocketAddress::decode(buf)?);
            }
        }
        Ok(address)
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer_id.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} (tcp {}, udp {}{})",
            self.peer_id,
            self.ip,
            self.tcp_port,
            self.udp_port,
            if self.relayed { ", relayed" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_ports() {
        let id = PeerId::from_u64(0x1234);
        let a = PeerAddress::new(id, "10.0.0.1".parse().unwrap(), 1, 2);
        let b = PeerAddress::new(id, "10.0.0.2".parse().unwrap(), 3, 4).with_relayed(true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_relay_addresses_survive_encoding() {
        let relay = PeerSocketAddress::new("2001:db8::1".parse().unwrap(), 4000, 4001);
        let addr = PeerAddress::new(PeerId::from_u64(7), "1.2.3.4".parse().unwrap(), 10, 11)
            .with_relayed(true)
            .with_firewalled(true, false)
            .change_peer_socket_addresses(&[relay]);

        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        let mut bytes = buf.freeze();
        let decoded = PeerAddress::decode(&mut bytes, "9.9.9.9".parse().unwrap()).unwrap();

        assert_eq!(decoded.peer_id(), addr.peer_id());
        assert_eq!(decoded.ip(), "9.9.9.9".parse::<IpAddr>().unwrap());
        assert!(decoded.is_relayed());
        assert!(decoded.is_firewalled_udp());
        assert!(!decoded.is_firewalled_tcp());
        assert_eq!(decoded.relays(), &[relay]);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_truncated_address_rejected() {
        let mut bytes = Bytes::from_static(&[0u8; 10]);
        assert!(PeerAddress::decode(&mut bytes, "1.1.1.1".parse().unwrap()).is_err());
    }
}
