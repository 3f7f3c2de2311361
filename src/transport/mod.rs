//! # Transport Layer
//!
//! Socket plumbing for UDP datagrams and length-framed TCP streams.
//!
//! ## Components
//! - **Server**: binds the peer's endpoints and runs the service loops
//! - **UDP**: receive loop, one pipeline per socket
//! - **TCP**: service loops, one pipeline per connection

pub mod server;
pub mod tcp;
pub mod udp;

pub use server::ChannelServer;
