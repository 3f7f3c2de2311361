//! Standard handlers: wire decoding, wire encoding and request dispatch.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::core::codec::{decode_message, encode_message, MAX_UDP_PAYLOAD};
use crate::core::signature::SignatureFactory;
use crate::error::{ProtocolError, Result};
use crate::pipeline::{
    ChannelEvent, ChannelHandler, Frame, HandlerContext, InboundHandler, OutboundHandler,
};
use crate::protocol::dispatcher::RequestDispatcher;
use crate::utils::metrics::global_metrics;

/// Turns raw packets into messages. Packets that do not decode are logged and dropped.
#[derive(Debug, Clone)]
pub struct DecoderHandler {
    signatures: Arc<dyn SignatureFactory>,
}

impl DecoderHandler {
    pub fn new(signatures: Arc<dyn SignatureFactory>) -> Self {
        Self { signatures }
    }
}

impl ChannelHandler for DecoderHandler {
    fn create_new_instance(&self) -> Box<dyn ChannelHandler> {
        Box::new(self.clone())
    }

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        Some(self)
    }
}

impl InboundHandler for DecoderHandler {
    fn read(&mut self, _ctx: &mut HandlerContext<'_>, frame: Frame) -> Result<Option<Frame>> {
        let Frame::Packet {
            bytes,
            sender,
            recipient,
            udp,
        } = frame
        else {
            return Ok(Some(frame));
        };
        let len = bytes.len();
        match decode_message(bytes, sender, recipient, udp, self.signatures.as_ref()) {
            Ok(message) => {
                trace!(%sender, len, message = %message, "Decoded");
                global_metrics().message_received();
                Ok(Some(Frame::message(message)))
            }
            Err(error) => {
                warn!(%sender, len, %error, "Dropping undecodable packet");
                global_metrics().decode_error();
                Ok(None)
            }
        }
    }
}

/// Turns messages into encoded buffers. On UDP channels a message must fit one datagram.
#[derive(Debug, Clone)]
pub struct EncoderHandler {
    signatures: Arc<dyn SignatureFactory>,
}

impl EncoderHandler {
    pub fn new(signatures: Arc<dyn SignatureFactory>) -> Self {
        Self { signatures }
    }
}

impl ChannelHandler for EncoderHandler {
    fn create_new_instance(&self) -> Box<dyn ChannelHandler> {
        Box::new(self.clone())
    }

    fn as_outbound(&mut self) -> Option<&mut dyn OutboundHandler> {
        Some(self)
    }
}

impl OutboundHandler for EncoderHandler {
    fn write(&mut self, ctx: &mut HandlerContext<'_>, frame: Frame) -> Result<Frame> {
        let Frame::Message(message) = frame else {
            return Ok(frame);
        };
        let encoded = encode_message(&message, self.signatures.as_ref())?;
        if ctx.channel().udp && encoded.capacity() > MAX_UDP_PAYLOAD {
            return Err(ProtocolError::OversizedPacket(encoded.capacity()));
        }
        global_metrics().message_sent();
        Ok(Frame::Encoded(encoded))
    }
}

/// Hands requests to a [`RequestDispatcher`] and writes its reply.
///
/// On TCP the channel is closed after the reply unless the request asked for keep-alive,
/// and whenever the channel goes idle.
#[derive(Clone)]
pub struct DispatchHandler {
    dispatcher: Arc<dyn RequestDispatcher>,
}

impl std::fmt::Debug for DispatchHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandler").finish_non_exhaustive()
    }
}

impl DispatchHandler {
    pub fn new(dispatcher: Arc<dyn RequestDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl ChannelHandler for DispatchHandler {
    fn exception_caught(&mut self, ctx: &mut HandlerContext<'_>, error: &ProtocolError) {
        debug!(remote = ?ctx.channel().remote, %error, "Error on server channel");
        if !ctx.channel().udp {
            ctx.close();
        }
    }

    fn create_new_instance(&self) -> Box<dyn ChannelHandler> {
        Box::new(self.clone())
    }

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        Some(self)
    }
}

impl InboundHandler for DispatchHandler {
    fn read(&mut self, ctx: &mut HandlerContext<'_>, frame: Frame) -> Result<Option<Frame>> {
        let Frame::Message(request) = frame else {
            return Ok(Some(frame));
        };
        if !request.is_request() {
            return Ok(Some(Frame::Message(request)));
        }
        match self.dispatcher.request_received(&request) {
            Some(reply) => {
                trace!(reply = %reply, "Replying");
                ctx.write(reply);
            }
            None => trace!(request = %request, "No reply"),
        }
        if !ctx.channel().udp && !request.is_keep_alive() {
            ctx.close();
        }
        Ok(None)
    }

    fn user_event_triggered(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        event: &ChannelEvent,
    ) -> Result<()> {
        if *event == ChannelEvent::AllIdle {
            debug!(remote = ?ctx.channel().remote, "Closing idle channel");
            ctx.close();
        }
        Ok(())
    }
}
