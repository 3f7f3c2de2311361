//! # Peer Admission
//!
//! Predicates the peer table consults before accepting a peer address.
//!
//! [`PeerIpFilter`] rejects a candidate that shares a subnet with an already known peer,
//! which keeps a single network from filling the table. Masking works on integer keys:
//!
//! ```text
//! IPv4: u32 & (0xFFFF_FFFF << (32 - prefix))
//! IPv6: (high u64, low u64)
//!       prefix 128 -> unchanged
//!       prefix >= 64 -> high kept, low masked with (prefix - 64)
//!       prefix < 64 -> high masked with prefix, low zeroed
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::core::peer::{PeerAddress, PeerId};
use crate::error::{ProtocolError, Result};

pub trait PeerFilter: Send + Sync {
    /// True if `candidate` must not be added, given the peers in `all` that are closest
    /// to `target`.
    fn reject(&self, candidate: &PeerAddress, all: &[PeerAddress], target: &PeerId) -> bool;
}

/// Rejects peers whose address falls in the subnet of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIpFilter {
    mask4: u8,
    mask6: u8,
}

impl PeerIpFilter {
    /// # Errors
    /// `ConfigError` if `mask4 > 32` or `mask6 > 128`.
    pub fn new(mask4: u8, mask6: u8) -> Result<Self> {
        if mask4 > 32 {
            return Err(ProtocolError::ConfigError(format!(
                "IPv4 prefix length {mask4} exceeds 32"
            )));
        }
        if mask6 > 128 {
            return Err(ProtocolError::ConfigError(format!(
                "IPv6 prefix length {mask6} exceeds 128"
            )));
        }
        Ok(Self { mask4, mask6 })
    }

    pub fn mask4(&self) -> u8 {
        self.mask4
    }

    pub fn mask6(&self) -> u8 {
        self.mask6
    }
}

/// Keeps the top `prefix` bits of a 32-bit value.
fn high_bits_u32(bits: u32, prefix: u8) -> u32 {
    match prefix {
        32 => bits,
        p => bits & u32::MAX.checked_shl(32 - u32::from(p)).unwrap_or(0),
    }
}

/// Keeps the top `prefix` bits of a 64-bit value.
fn high_bits_u64(bits: u64, prefix: u8) -> u64 {
    match prefix {
        64 => bits,
        p => bits & u64::MAX.checked_shl(64 - u32::from(p)).unwrap_or(0),
    }
}

pub fn mask_ipv4(ip: Ipv4Addr, prefix: u8) -> u32 {
    high_bits_u32(u32::from(ip), prefix)
}

pub fn mask_ipv6(ip: Ipv6Addr, prefix: u8) -> (u64, u64) {
    let bits = u128::from(ip);
    let high = (bits >> 64) as u64;
    let low = bits as u64;
    match prefix {
        128 => (high, low),
        p if p >= 64 => (high, high_bits_u64(low, p - 64)),
        p => (high_bits_u64(high, p), 0),
    }
}

impl PeerFilter for PeerIpFilter {
    fn reject(&self, candidate: &PeerAddress, all: &[PeerAddress], _target: &PeerId) -> bool {
        match candidate.ip() {
            IpAddr::V4(ip) => {
                let key = mask_ipv4(ip, self.mask4);
                all.iter().any(|known| match known.ip() {
                    IpAddr::V4(other) => mask_ipv4(other, self.mask4) == key,
                    IpAddr::V6(_) => false,
                })
            }
            IpAddr::V6(ip) => {
                let key = mask_ipv6(ip, self.mask6);
                all.iter().any(|known| match known.ip() {
                    IpAddr::V6(other) => mask_ipv6(other, self.mask6) == key,
                    IpAddr::V4(_) => false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_masks() {
        let ip: Ipv4Addr = "10.1.2.3".parse().unwrap();
        assert_eq!(mask_ipv4(ip, 32), 0x0A01_0203);
        assert_eq!(mask_ipv4(ip, 24), 0x0A01_0200);
        assert_eq!(mask_ipv4(ip, 0), 0);
    }

    #[test]
    fn test_ipv6_halves() {
        let ip: Ipv6Addr = "2001:db8:1:2:3:4:5:6".parse().unwrap();
        let (high, low) = mask_ipv6(ip, 128);
        assert_eq!(mask_ipv6(ip, 64), (high, 0));
        assert_eq!(mask_ipv6(ip, 80), (high, low & 0xFFFF_0000_0000_0000));
        assert_eq!(mask_ipv6(ip, 32), (high & 0xFFFF_FFFF_0000_0000, 0));
    }

    #[test]
    fn test_rejects_bad_prefix() {
        assert!(PeerIpFilter::new(33, 64).is_err());
        assert!(PeerIpFilter::new(24, 129).is_err());
    }
}
