//! # Error Types
//!
//! Error handling for the transport and protocol core.
//!
//! This module defines all error variants that can occur while moving messages between
//! peers, from low-level I/O errors to protocol violations reported by the correlator.
//!
//! ## Error Categories
//! - **Bind failures**: a listener could not be bound (reported as a `false` startup)
//! - **Decode errors**: incomplete or malformed packets (logged, packet dropped)
//! - **Peer failures**: protocol violations and remote errors, classified by [`AbortCause`]
//! - **State errors**: programming errors such as content-type overflow or duplicate
//!   handler names
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use peerwire::error::{AbortCause, PeerException, ProtocolError};
//!
//! let err = ProtocolError::from(PeerException::new(AbortCause::PeerAbort, "unknown id"));
//! assert_eq!(err.abort_cause(), Some(AbortCause::PeerAbort));
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Pipeline errors
    pub const ERR_DUPLICATE_HANDLER: &str = "Duplicate handler name";
    pub const ERR_HANDLER_NOT_FOUND: &str = "The requested base handler does not exist in this pipeline";
    pub const ERR_NOT_ENCODED: &str = "Outbound chain did not produce an encoded buffer";

    /// Message model errors
    pub const ERR_CONTENT_TYPES_FULL: &str = "Already set 8 content types";
    pub const ERR_SIGNATURE_SLOT: &str = "The public key signature needs to be the first content type";
    pub const ERR_UNDEFINED_CONTENT: &str = "Undefined is not a settable content type";

    /// Decoding errors
    pub const ERR_TRUNCATED: &str = "Packet ended before all announced sections were read";
    pub const ERR_UNKNOWN_MESSAGE_TYPE: &str = "Unknown message type code";
    pub const ERR_UNKNOWN_CONTENT_TYPE: &str = "Unknown content type code";

    /// Correlation errors
    pub const ERR_UNKNOWN_ID: &str =
        "Message was not delivered successfully. Unknown ID (peer may be offline or unknown RPC handler)";
    pub const ERR_REMOTE_EXCEPTION: &str = "Message caused an exception on the other side";
    pub const ERR_ID_MISMATCH: &str = "Response message is not the one we expect";
    pub const ERR_RELAY_MISMATCH: &str = "Response message has a different relay flag than the request";
    pub const ERR_CHANNEL_SHUTDOWN: &str = "Channel creator shut down";
    pub const ERR_CANCELLED: &str = "Request cancelled";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_TIMEOUT: &str = "Operation timed out";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// Classification of a failed request.
///
/// Only causes other than [`AbortCause::UserAbort`] are reported to peer-status listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortCause {
    /// Protocol violation or remote-side error.
    PeerAbort,
    /// Transport failure while talking to the peer.
    PeerError,
    /// The peer did not answer in time.
    Timeout,
    /// Local cancellation or shutdown.
    UserAbort,
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortCause::PeerAbort => "peer abort",
            AbortCause::PeerError => "peer error",
            AbortCause::Timeout => "timeout",
            AbortCause::UserAbort => "user abort",
        };
        f.write_str(s)
    }
}

/// A classified request failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{cause}: {message}")]
pub struct PeerException {
    pub cause: AbortCause,
    pub message: String,
}

impl PeerException {
    pub fn new(cause: AbortCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }

    pub fn user_abort(message: impl Into<String>) -> Self {
        Self::new(AbortCause::UserAbort, message)
    }

    pub fn peer_abort(message: impl Into<String>) -> Self {
        Self::new(AbortCause::PeerAbort, message)
    }

    pub fn is_user_abort(&self) -> bool {
        self.cause == AbortCause::UserAbort
    }
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot bind {addr}: {reason}")]
    BindFailure {
        addr: std::net::SocketAddr,
        reason: String,
    },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Illegal state: {0}")]
    State(String),

    #[error("Index {index} out of bounds (capacity {capacity})")]
    IndexOutOfBounds { index: usize, capacity: usize },

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error(transparent)]
    Peer(#[from] PeerException),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    pub(crate) fn state(msg: impl Into<String>) -> Self {
        ProtocolError::State(msg.into())
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        ProtocolError::Decode(msg.into())
    }

    /// The abort classification, if this error is a request failure.
    pub fn abort_cause(&self) -> Option<AbortCause> {
        match self {
            ProtocolError::Peer(pe) => Some(pe.cause),
            _ => None,
        }
    }

    /// Whether the failure arose on this side before anything reached the peer.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ProtocolError::BindFailure { .. }
                | ProtocolError::Encode(_)
                | ProtocolError::State(_)
                | ProtocolError::IndexOutOfBounds { .. }
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::Signature(_)
                | ProtocolError::ConfigError(_)
        )
    }

    /// Classifies this error as a request failure. Local failures become user aborts so
    /// liveness listeners never blame the remote peer for them.
    pub fn to_peer_exception(&self) -> PeerException {
        match self {
            ProtocolError::Peer(pe) => pe.clone(),
            ProtocolError::Timeout => PeerException::new(AbortCause::Timeout, constants::ERR_TIMEOUT),
            local if local.is_local() => PeerException::user_abort(local.to_string()),
            other => PeerException::new(AbortCause::PeerError, other.to_string()),
        }
    }

    /// Converts an arbitrary error into a classified request failure.
    pub fn into_peer_exception(self) -> PeerException {
        match self {
            ProtocolError::Peer(pe) => pe,
            other => other.to_peer_exception(),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
