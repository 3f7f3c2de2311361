//! # Request/Response Correlation
//!
//! A [`RequestHandler`] owns one outstanding request and its [`FutureResponse`]. Every
//! message that arrives on the request's channel is run through a fixed sequence of sanity
//! checks before it may resolve the future:
//!
//! 1. no message (fire-and-forget): resolve empty
//! 2. `UnknownId` reply: fail as peer abort
//! 3. `Exception` reply: fail as peer abort
//! 4. a request: not ours, leave the future alone
//! 5. different [`MessageId`]: fail as peer abort
//! 6. relay flag differs from the request's recipient (except `RCON`): fail as peer abort
//! 7. otherwise: good answers mark the sender alive; a streaming reply keeps the future
//!    pending, the final one resolves it
//!
//! Failures reach the peer-status listeners unless they are user aborts. All listener
//! notifications happen under the single listener lock of the [`PeerBean`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::core::message::{commands, Message, MessageId};
use crate::core::peer::PeerAddress;
use crate::error::{constants, AbortCause, PeerException, ProtocolError, Result};
use crate::pipeline::{ChannelEvent, ChannelHandler, Frame, HandlerContext, InboundHandler};
use crate::protocol::future::FutureResponse;
use crate::utils::metrics::global_metrics;

/// Observes peer liveness as seen by the request layer.
pub trait PeerStatusListener: Send + Sync {
    /// `remote` answered a request.
    fn peer_found(&self, remote: &PeerAddress);

    /// A request to `remote` failed for a reason other than a local abort.
    fn peer_failed(&self, remote: &PeerAddress, exception: &PeerException);
}

/// State shared by everything that talks on behalf of the local peer.
pub struct PeerBean {
    local: PeerAddress,
    listeners: Mutex<Vec<Arc<dyn PeerStatusListener>>>,
}

impl fmt::Debug for PeerBean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerBean")
            .field("local", &self.local)
            .field("listeners", &self.lock_listeners().len())
            .finish()
    }
}

impl PeerBean {
    pub fn new(local: PeerAddress) -> Self {
        Self {
            local,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<Arc<dyn PeerStatusListener>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_listener(&self, listener: Arc<dyn PeerStatusListener>) {
        self.lock_listeners().push(listener);
    }

    /// Removes `listener` (compared by identity). Returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn PeerStatusListener>) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }
}

/// What a received message did to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// The future is resolved or failed.
    Completed,
    /// A streamed part arrived; more replies follow.
    AwaitMore,
    /// Not a reply to this request; the future is untouched.
    NotForThisRequest,
}

#[derive(Clone)]
pub struct RequestHandler {
    future: FutureResponse,
    peer_bean: Arc<PeerBean>,
    send_message_id: MessageId,
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("message_id", &self.send_message_id)
            .field("completed", &self.future.is_completed())
            .finish()
    }
}

impl RequestHandler {
    pub fn new(future: FutureResponse, peer_bean: Arc<PeerBean>) -> Self {
        let send_message_id = MessageId::from(future.request());
        Self {
            future,
            peer_bean,
            send_message_id,
        }
    }

    pub fn future(&self) -> &FutureResponse {
        &self.future
    }

    fn request(&self) -> &Message {
        self.future.request()
    }

    /// Applies the correlation checks to `response`.
    pub fn response_message_received(&self, response: Option<Message>) -> ResponseDisposition {
        let Some(mut response) = response else {
            if self.future.complete(None) {
                global_metrics().request_completed();
            }
            return ResponseDisposition::Completed;
        };

        let request = self.request();
        if response.message_type() == crate::core::message::MessageType::UnknownId {
            self.exception_caught(PeerException::peer_abort(format!(
                "{}: {request}",
                constants::ERR_UNKNOWN_ID
            )));
            return ResponseDisposition::Completed;
        }
        if response.message_type() == crate::core::message::MessageType::Exception {
            self.exception_caught(PeerException::peer_abort(format!(
                "{}. Handle as peer abort: {request}",
                constants::ERR_REMOTE_EXCEPTION
            )));
            return ResponseDisposition::Completed;
        }
        if response.is_request() {
            return ResponseDisposition::NotForThisRequest;
        }
        if MessageId::from(&response) != self.send_message_id {
            self.exception_caught(PeerException::peer_abort(format!(
                "{}: got [{response}], sent [{request}]",
                constants::ERR_ID_MISMATCH
            )));
            return ResponseDisposition::Completed;
        }
        if response.command() != commands::RCON
            && request.recipient().is_relayed() != response.sender().is_relayed()
        {
            self.exception_caught(PeerException::peer_abort(format!(
                "{}: got [{response}], sent [{request}], recipient relayed {}, sender relayed {}",
                constants::ERR_RELAY_MISMATCH,
                request.recipient().is_relayed(),
                response.sender().is_relayed()
            )));
            return ResponseDisposition::Completed;
        }

        if response.is_ok() || response.is_not_ok() {
            let listeners = self.peer_bean.lock_listeners();
            if response.sender().is_relayed() && !response.peer_socket_addresses().is_empty() {
                let refreshed = response
                    .sender()
                    .change_peer_socket_addresses(response.peer_socket_addresses());
                response.set_sender(refreshed);
            }
            for listener in listeners.iter() {
                listener.peer_found(response.sender());
            }
        }

        if !response.is_done() {
            debug!(response = %response, "Good message is streaming");
            return ResponseDisposition::AwaitMore;
        }

        debug!(response = %response, keep_alive = request.is_keep_alive(), "Good message");
        if self.future.complete(Some(response)) {
            global_metrics().request_completed();
        }
        ResponseDisposition::Completed
    }

    /// Fails the request with `exception` unless it already completed.
    pub fn exception_caught(&self, exception: PeerException) {
        debug!(request = %self.request(), %exception, "Error originating from request");
        if self.future.is_completed() {
            warn!(%exception, "Got exception, but ignored it (request already completed)");
            return;
        }
        if exception.cause != AbortCause::UserAbort {
            let listeners = self.peer_bean.lock_listeners();
            for listener in listeners.iter() {
                listener.peer_failed(self.request().recipient(), &exception);
            }
        } else {
            debug!(%exception, "Request aborted locally");
        }
        let cause = exception.cause;
        if self.future.fail(exception) {
            global_metrics().request_failed(cause);
        }
    }
}

impl ChannelHandler for RequestHandler {
    fn exception_caught(&mut self, _ctx: &mut HandlerContext<'_>, error: &ProtocolError) {
        if !self.future.is_completed() {
            RequestHandler::exception_caught(self, error.to_peer_exception());
        }
    }

    fn channel_inactive(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        if !self.future.is_completed() {
            RequestHandler::exception_caught(
                self,
                PeerException::new(AbortCause::PeerError, constants::ERR_CONNECTION_CLOSED),
            );
        }
        Ok(())
    }

    fn create_new_instance(&self) -> Box<dyn ChannelHandler> {
        Box::new(self.clone())
    }

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        Some(self)
    }
}

impl InboundHandler for RequestHandler {
    fn read(&mut self, ctx: &mut HandlerContext<'_>, frame: Frame) -> Result<Option<Frame>> {
        let message = match frame {
            Frame::Message(message) if !message.is_request() => message,
            Frame::Message(message) => {
                debug!(request = %message, "Request received on a request channel, passed on");
                return Ok(Some(Frame::Message(message)));
            }
            other => return Ok(Some(other)),
        };
        match self.response_message_received(Some(*message)) {
            ResponseDisposition::Completed => {
                if !self.request().is_keep_alive() {
                    ctx.close();
                }
            }
            ResponseDisposition::AwaitMore | ResponseDisposition::NotForThisRequest => {}
        }
        Ok(None)
    }

    fn user_event_triggered(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        event: &ChannelEvent,
    ) -> Result<()> {
        if *event == ChannelEvent::AllIdle {
            RequestHandler::exception_caught(
                self,
                PeerException::new(AbortCause::Timeout, "channel idle, no reply in time"),
            );
            ctx.close();
        }
        Ok(())
    }
}
