//! # Protocol Layer
//!
//! Request dispatch on the serving side, request/response correlation and sending on the
//! requesting side.
//!
//! ## Components
//! - **Dispatcher**: routes requests by command byte and builds replies
//! - **Future**: completion cell of one outstanding request
//! - **Request**: correlation checks and peer-status notification
//! - **Sender**: UDP/TCP request channels and message ids

pub mod dispatcher;
pub mod future;
pub mod request;
pub mod sender;
