//! # peerwire
//!
//! Transport and protocol core for peer-to-peer nodes.
//!
//! Moves typed, binary-framed messages between peers over UDP and TCP, correlates
//! requests with their replies, detects idle links and filters which addresses may join
//! the peer table.
//!
//! ## Layout
//! - [`core`]: peer identities, the message model and its wire codec
//! - [`pipeline`]: per-channel handler chains, including idle detection
//! - [`protocol`]: dispatching, correlation and sending of requests
//! - [`transport`]: the channel server and its UDP/TCP loops
//! - [`peers`]: admission filters
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use peerwire::config::NetworkConfig;
//! use peerwire::core::message::{commands, MessageType};
//! use peerwire::core::peer::{PeerAddress, PeerId};
//! use peerwire::core::signature::Ed25519SignatureFactory;
//! use peerwire::protocol::dispatcher::Dispatcher;
//! use peerwire::protocol::request::PeerBean;
//! use peerwire::protocol::sender::ChannelCreator;
//! use peerwire::transport::ChannelServer;
//!
//! # async fn run() -> peerwire::error::Result<()> {
//! let config = NetworkConfig::default();
//! let local = PeerAddress::from_socket(PeerId::random(), "127.0.0.1:7700".parse().unwrap());
//! let signatures = Arc::new(Ed25519SignatureFactory);
//!
//! let dispatcher = Dispatcher::new(local.clone(), config.connection.version);
//! dispatcher.register(commands::PING, |_request, reply| Ok(reply))?;
//!
//! let mut server = ChannelServer::new(config.clone(), Arc::new(dispatcher), signatures.clone());
//! assert!(server.startup().await);
//!
//! let creator = ChannelCreator::new(config.connection, Arc::new(PeerBean::new(local.clone())), signatures);
//! let ping = creator.new_request(local, commands::PING, MessageType::Request1);
//! let reply = creator.send_udp(ping).await_response().await;
//! assert!(reply.is_ok());
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod core;
pub mod error;
pub mod peers;
pub mod pipeline;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::core::message::{Message, MessageType};
pub use crate::core::peer::{PeerAddress, PeerId};
pub use crate::error::{ProtocolError, Result};
