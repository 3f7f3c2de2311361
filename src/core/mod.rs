//! # Core Protocol Components
//!
//! Peer identities, the message model and its bit-exact wire codec.
//!
//! ## Components
//! - **Peer**: `PeerId`, `PeerAddress` and relay socket addresses
//! - **Message**: header, content-type slots and payload sections
//! - **Composite**: zero-copy gather buffer used while encoding
//! - **Signature**: pluggable message signing
//! - **Codec**: message encoding/decoding and TCP framing
//!
//! ## Security
//! - Every length is checked before a read or allocation
//! - TCP frames above the configured maximum are rejected
//! - Undefined content slots may only trail the used ones

use bytes::Buf;

use crate::error::{constants, ProtocolError, Result};

pub mod codec;
pub mod composite;
pub mod message;
pub mod peer;
pub mod signature;

/// Fails with a decode error unless `buf` holds at least `n` more bytes.
pub(crate) fn ensure_remaining(buf: &impl Buf, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(ProtocolError::Decode(format!(
            "{}: need {n} bytes, {} left",
            constants::ERR_TRUNCATED,
            buf.remaining()
        )));
    }
    Ok(())
}
