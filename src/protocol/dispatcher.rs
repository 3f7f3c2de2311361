//! Server-side routing of requests to command handlers.
//!
//! The [`Dispatcher`] maps a command byte to a handler closure. A handler receives the
//! request together with a prepared `Ok` reply envelope and returns the reply to send.
//! Unregistered commands are answered with `UnknownId`, failing handlers and requests
//! from a different version with `Exception`. Fire-and-forget requests never get a reply.

use crate::core::message::{Message, MessageType};
use crate::core::peer::PeerAddress;
use crate::error::{constants, ProtocolError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Produces the reply for an incoming request.
pub trait RequestDispatcher: Send + Sync {
    /// `None` means no reply is sent.
    fn request_received(&self, request: &Message) -> Option<Message>;
}

type HandlerFn = dyn Fn(&Message, Message) -> Result<Message> + Send + Sync + 'static;

pub struct Dispatcher {
    local: PeerAddress,
    version: u32,
    handlers: Arc<RwLock<HashMap<u8, Box<HandlerFn>>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let commands: Vec<u8> = self
            .handlers
            .read()
            .map(|h| h.keys().copied().collect())
            .unwrap_or_default();
        f.debug_struct("Dispatcher")
            .field("local", &self.local)
            .field("version", &self.version)
            .field("commands", &commands)
            .finish()
    }
}

impl Dispatcher {
    /// A dispatcher answering as `local` for requests of `version`.
    pub fn new(local: PeerAddress, version: u32) -> Self {
        Self {
            local,
            version,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    /// Registers `handler` for `command`, replacing any previous one.
    pub fn register<F>(&self, command: u8, handler: F) -> Result<()>
    where
        F: Fn(&Message, Message) -> Result<Message> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::state(constants::ERR_LOCK_POISONED))?;

        handlers.insert(command, Box::new(handler));
        Ok(())
    }

    pub fn unregister(&self, command: u8) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::state(constants::ERR_LOCK_POISONED))?;
        Ok(handlers.remove(&command).is_some())
    }

    /// Runs the handler for `request` and returns its reply, `Ok(None)` if no handler is
    /// registered for the command.
    ///
    /// # Errors
    /// The handler's error, or `State` if the handler table is poisoned.
    pub fn dispatch(&self, request: &Message) -> Result<Option<Message>> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::state(constants::ERR_LOCK_POISONED))?;

        match handlers.get(&request.command()) {
            Some(handler) => {
                let reply = Message::response_to(request, &self.local, MessageType::Ok);
                handler(request, reply).map(Some)
            }
            None => Ok(None),
        }
    }

    fn reply(&self, request: &Message, message_type: MessageType) -> Option<Message> {
        if request.is_fire_and_forget() {
            None
        } else {
            Some(Message::response_to(request, &self.local, message_type))
        }
    }
}

impl RequestDispatcher for Dispatcher {
    fn request_received(&self, request: &Message) -> Option<Message> {
        if request.version() != self.version {
            warn!(
                expected = self.version,
                got = request.version(),
                sender = %request.sender(),
                "Request with wrong version"
            );
            return self.reply(request, MessageType::Exception);
        }

        match self.dispatch(request) {
            Ok(Some(reply)) => {
                if request.is_fire_and_forget() {
                    None
                } else {
                    Some(reply)
                }
            }
            Ok(None) => {
                debug!(command = request.command(), sender = %request.sender(), "No handler for command");
                self.reply(request, MessageType::UnknownId)
            }
            Err(error) => {
                warn!(command = request.command(), %error, "Request handler failed");
                self.reply(request, MessageType::Exception)
            }
        }
    }
}
