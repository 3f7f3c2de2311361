//! # Handler Pipeline
//!
//! A per-connection ordered chain of named handlers. Inbound events (`read`, user events,
//! lifecycle changes) walk the chain from the head; outbound writes walk the outbound
//! handlers from the first as well, each transforming the frame until it is an encoded
//! buffer ready for the socket.
//!
//! ## Handler roles
//! - **Inbound**: implements [`InboundHandler`], sees reads and user events
//! - **Outbound**: implements [`OutboundHandler`], sees writes
//! - **Duplex**: both (the idle detector is one)
//!
//! Handlers never talk to the socket. They leave requests on their [`HandlerContext`]
//! (write a message, close the channel, raise a user event) which the pipeline processes
//! once the current event has finished. The transport then drains the encoded buffers with
//! [`Pipeline::take_outbound`].
//!
//! ## Per-connection instances
//! Pipelines are assembled by a [`PipelineFactory`] from handler prototypes; every build
//! asks each prototype for a fresh instance so no handler state is shared between
//! connections.
//!
//! ## Errors
//! An error returned by a handler is routed to `exception_caught` of that handler and of
//! every handler after it. Errors never escape an inbound event.

pub mod handlers;
pub mod idle;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::core::composite::CompositeBuffer;
use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};

/// What travels through the pipeline.
#[derive(Debug)]
pub enum Frame {
    /// Raw bytes as they came off the socket.
    Packet {
        bytes: Bytes,
        sender: SocketAddr,
        recipient: SocketAddr,
        udp: bool,
    },
    Message(Box<Message>),
    /// Encoded bytes ready for the socket.
    Encoded(CompositeBuffer),
}

impl Frame {
    pub fn message(message: Message) -> Self {
        Frame::Message(Box::new(message))
    }
}

/// Events raised by handlers and delivered to later inbound handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Neither reads nor writes happened within the idle window.
    AllIdle,
    User(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Inbound,
    Outbound,
    Duplex,
    /// Lifecycle hooks only.
    Passive,
}

/// Identifies a handler instance within one pipeline. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Facts about the channel a pipeline serves.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
    pub udp: bool,
    active: bool,
}

impl ChannelInfo {
    pub fn new(local: SocketAddr, remote: Option<SocketAddr>, udp: bool) -> Self {
        Self {
            local,
            remote,
            udp,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Delivers timer expiries back to the pipeline's owner.
#[derive(Debug, Clone)]
pub struct TimerSink {
    tx: mpsc::UnboundedSender<HandlerId>,
    id: HandlerId,
}

impl TimerSink {
    /// Signals that the timer of the owning handler expired.
    pub fn fire(&self) {
        // the receiver is gone once the channel closed
        let _ = self.tx.send(self.id);
    }
}

/// An encoded buffer waiting for the socket.
#[derive(Debug)]
pub struct Outbound {
    pub buffer: CompositeBuffer,
    /// Destination for unconnected (UDP) channels.
    pub remote: Option<SocketAddr>,
}

enum Effect {
    Write(Frame),
    Event { origin: usize, event: ChannelEvent },
}

/// The view a handler gets of its pipeline while handling an event.
pub struct HandlerContext<'a> {
    id: HandlerId,
    index: usize,
    name: &'a str,
    channel: &'a ChannelInfo,
    effects: &'a mut VecDeque<Effect>,
    close_requested: &'a mut bool,
    timer_tx: Option<&'a mpsc::UnboundedSender<HandlerId>>,
}

impl<'a> HandlerContext<'a> {
    pub fn handler_id(&self) -> HandlerId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn channel(&self) -> &ChannelInfo {
        self.channel
    }

    /// Queues `message` to be written once the current event is done.
    pub fn write(&mut self, message: Message) {
        self.effects.push_back(Effect::Write(Frame::message(message)));
    }

    pub fn write_frame(&mut self, frame: Frame) {
        self.effects.push_back(Effect::Write(frame));
    }

    /// Asks the transport to close the channel.
    pub fn close(&mut self) {
        *self.close_requested = true;
    }

    /// Raises `event` for every inbound handler after this one.
    pub fn fire_user_event(&mut self, event: ChannelEvent) {
        self.effects.push_back(Effect::Event {
            origin: self.index,
            event,
        });
    }

    /// A sink that reports timer expiry for this handler, if the channel supports timers.
    pub fn timer_sink(&self) -> Option<TimerSink> {
        self.timer_tx.map(|tx| TimerSink {
            tx: tx.clone(),
            id: self.id,
        })
    }
}

/// Common handler behavior. All hooks default to doing nothing.
pub trait ChannelHandler: Send + Sync {
    fn channel_active(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }

    fn channel_inactive(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }

    fn handler_added(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }

    fn handler_removed(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }

    fn exception_caught(&mut self, ctx: &mut HandlerContext<'_>, error: &ProtocolError) {
        trace!(handler = ctx.name(), %error, "Exception passed through handler");
    }

    /// Called when a timer armed through [`HandlerContext::timer_sink`] expires.
    fn on_timer(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }

    /// A fresh instance for a new channel.
    fn create_new_instance(&self) -> Box<dyn ChannelHandler>;

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        None
    }

    fn as_outbound(&mut self) -> Option<&mut dyn OutboundHandler> {
        None
    }

    fn kind(&mut self) -> HandlerKind {
        match (self.as_inbound().is_some(), self.as_outbound().is_some()) {
            (true, true) => HandlerKind::Duplex,
            (true, false) => HandlerKind::Inbound,
            (false, true) => HandlerKind::Outbound,
            (false, false) => HandlerKind::Passive,
        }
    }
}

pub trait InboundHandler {
    /// Handles an inbound frame. `Ok(None)` consumes it; `Ok(Some(frame))` passes a frame
    /// to the next inbound handler.
    fn read(&mut self, ctx: &mut HandlerContext<'_>, frame: Frame) -> Result<Option<Frame>>;

    fn user_event_triggered(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        _event: &ChannelEvent,
    ) -> Result<()> {
        Ok(())
    }
}

pub trait OutboundHandler {
    fn write(&mut self, ctx: &mut HandlerContext<'_>, frame: Frame) -> Result<Frame>;
}

struct Entry {
    id: HandlerId,
    name: String,
    handler: Box<dyn ChannelHandler>,
}

type OutboundListener = Box<dyn FnMut(&CompositeBuffer) + Send + Sync>;

pub struct Pipeline {
    entries: Vec<Entry>,
    next_id: u64,
    channel: ChannelInfo,
    effects: VecDeque<Effect>,
    outbound: VecDeque<Outbound>,
    unhandled: Vec<Frame>,
    close_requested: bool,
    timer_tx: Option<mpsc::UnboundedSender<HandlerId>>,
    outbound_finished: Option<OutboundListener>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.names())
            .field("channel", &self.channel)
            .field("pending_outbound", &self.outbound.len())
            .finish()
    }
}

/// Borrows one entry plus the shared pipeline state as a handler context.
macro_rules! with_ctx {
    ($self:ident, $index:expr, |$handler:ident, $ctx:ident| $body:expr) => {{
        let Pipeline {
            entries,
            channel,
            effects,
            close_requested,
            timer_tx,
            ..
        } = &mut *$self;
        let entry = &mut entries[$index];
        let $handler = &mut entry.handler;
        let mut $ctx = HandlerContext {
            id: entry.id,
            index: $index,
            name: &entry.name,
            channel,
            effects,
            close_requested,
            timer_tx: timer_tx.as_ref(),
        };
        $body
    }};
}

impl Pipeline {
    pub fn new(channel: ChannelInfo) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            channel,
            effects: VecDeque::new(),
            outbound: VecDeque::new(),
            unhandled: Vec::new(),
            close_requested: false,
            timer_tx: None,
            outbound_finished: None,
        }
    }

    /// Enables timers: expiries are sent as handler ids on `tx`, to be passed back to
    /// [`Pipeline::fire_timer`].
    pub fn set_timer_sink(&mut self, tx: mpsc::UnboundedSender<HandlerId>) {
        self.timer_tx = Some(tx);
    }

    /// Called with every buffer that completed the outbound chain.
    pub fn set_outbound_finished<F>(&mut self, listener: F)
    where
        F: FnMut(&CompositeBuffer) + Send + Sync + 'static,
    {
        self.outbound_finished = Some(Box::new(listener));
    }

    pub fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    // *** structure ***

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&dyn ChannelHandler> {
        let index = self.position(name)?;
        Some(self.entries[index].handler.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut dyn ChannelHandler> {
        let index = self.position(name)?;
        Some(self.entries[index].handler.as_mut())
    }

    pub fn handler_id(&self, name: &str) -> Option<HandlerId> {
        self.position(name).map(|i| self.entries[i].id)
    }

    pub fn kind(&mut self, name: &str) -> Option<HandlerKind> {
        let index = self.position(name)?;
        Some(self.entries[index].handler.kind())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    fn anchor(&self, name: &str) -> Result<usize> {
        self.position(name).ok_or_else(|| {
            ProtocolError::state(format!("{}: {name}", constants::ERR_HANDLER_NOT_FOUND))
        })
    }

    fn check_unique(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            return Err(ProtocolError::state(format!(
                "{}: {name}",
                constants::ERR_DUPLICATE_HANDLER
            )));
        }
        Ok(())
    }

    fn insert(&mut self, index: usize, name: &str, handler: Box<dyn ChannelHandler>) {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            index,
            Entry {
                id,
                name: name.to_string(),
                handler,
            },
        );
        debug!(handler = name, position = index, "Handler added");
        let result = with_ctx!(self, index, |h, ctx| h.handler_added(&mut ctx));
        self.settle(index, result);
    }

    pub fn add_first(&mut self, name: &str, handler: Box<dyn ChannelHandler>) -> Result<&mut Self> {
        self.check_unique(name)?;
        self.insert(0, name, handler);
        Ok(self)
    }

    pub fn add_last(&mut self, name: &str, handler: Box<dyn ChannelHandler>) -> Result<&mut Self> {
        self.check_unique(name)?;
        self.insert(self.entries.len(), name, handler);
        Ok(self)
    }

    pub fn add_before(
        &mut self,
        base: &str,
        name: &str,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<&mut Self> {
        let index = self.anchor(base)?;
        self.check_unique(name)?;
        self.insert(index, name, handler);
        Ok(self)
    }

    pub fn add_after(
        &mut self,
        base: &str,
        name: &str,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<&mut Self> {
        let index = self.anchor(base)?;
        self.check_unique(name)?;
        self.insert(index + 1, name, handler);
        Ok(self)
    }

    /// Replaces the handler named `old` in place. `new_name` may equal `old`.
    pub fn replace(
        &mut self,
        old: &str,
        new_name: &str,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<Box<dyn ChannelHandler>> {
        let index = self.anchor(old)?;
        if new_name != old {
            self.check_unique(new_name)?;
        }
        let removed = self.remove_at(index);
        self.insert(index, new_name, handler);
        Ok(removed)
    }

    pub fn remove(&mut self, name: &str) -> Result<Box<dyn ChannelHandler>> {
        let index = self.anchor(name)?;
        Ok(self.remove_at(index))
    }

    fn remove_at(&mut self, index: usize) -> Box<dyn ChannelHandler> {
        let result = with_ctx!(self, index, |h, ctx| h.handler_removed(&mut ctx));
        if let Err(error) = result {
            debug!(%error, "Error while removing handler");
        }
        let entry = self.entries.remove(index);
        debug!(handler = %entry.name, "Handler removed");
        self.drain_effects();
        entry.handler
    }

    // *** inbound events ***

    pub fn fire_channel_active(&mut self) {
        self.channel.active = true;
        for index in 0..self.entries.len() {
            let result = with_ctx!(self, index, |h, ctx| h.channel_active(&mut ctx));
            if let Err(error) = result {
                self.route_exception(index, &error);
            }
        }
        self.drain_effects();
    }

    pub fn fire_channel_inactive(&mut self) {
        self.channel.active = false;
        for index in 0..self.entries.len() {
            let result = with_ctx!(self, index, |h, ctx| h.channel_inactive(&mut ctx));
            if let Err(error) = result {
                self.route_exception(index, &error);
            }
        }
        self.drain_effects();
    }

    /// Passes `frame` through the inbound handlers from the head.
    pub fn fire_read(&mut self, frame: Frame) {
        self.read_from(0, frame);
        self.drain_effects();
    }

    fn read_from(&mut self, start: usize, frame: Frame) {
        let mut current = frame;
        for index in start..self.entries.len() {
            let result = with_ctx!(self, index, |h, ctx| match h.as_inbound() {
                Some(inbound) => inbound.read(&mut ctx, current),
                None => Ok(Some(current)),
            });
            match result {
                Ok(Some(next)) => current = next,
                Ok(None) => return,
                Err(error) => {
                    self.route_exception(index, &error);
                    return;
                }
            }
        }
        trace!("Frame reached the end of the pipeline");
        self.unhandled.push(current);
    }

    /// Delivers `event` to every inbound handler from the head.
    pub fn fire_user_event(&mut self, event: ChannelEvent) {
        self.event_from(0, &event);
        self.drain_effects();
    }

    fn event_from(&mut self, start: usize, event: &ChannelEvent) {
        for index in start..self.entries.len() {
            let result = with_ctx!(self, index, |h, ctx| match h.as_inbound() {
                Some(inbound) => inbound.user_event_triggered(&mut ctx, event),
                None => Ok(()),
            });
            if let Err(error) = result {
                self.route_exception(index, &error);
            }
        }
    }

    /// Invokes `on_timer` of the handler with `id`; nothing happens if it was removed.
    pub fn fire_timer(&mut self, id: HandlerId) {
        let Some(index) = self.entries.iter().position(|e| e.id == id) else {
            trace!(?id, "Timer for removed handler ignored");
            return;
        };
        let result = with_ctx!(self, index, |h, ctx| h.on_timer(&mut ctx));
        self.settle(index, result);
    }

    fn settle(&mut self, index: usize, result: Result<()>) {
        if let Err(error) = result {
            self.route_exception(index, &error);
        }
        self.drain_effects();
    }

    fn route_exception(&mut self, from: usize, error: &ProtocolError) {
        debug!(%error, "Routing handler error");
        for index in from..self.entries.len() {
            with_ctx!(self, index, |h, ctx| h.exception_caught(&mut ctx, error));
        }
    }

    // *** outbound ***

    /// Passes `frame` through the outbound handlers and queues the encoded result.
    ///
    /// # Errors
    /// The first handler error (after it was routed to `exception_caught`), or `State` if
    /// the chain did not end with an encoded buffer.
    pub fn write(&mut self, frame: Frame) -> Result<()> {
        let result = self.write_inner(frame);
        self.drain_effects();
        result
    }

    fn write_inner(&mut self, frame: Frame) -> Result<()> {
        let remote = match &frame {
            Frame::Message(m) => m.recipient_socket(),
            _ => None,
        };
        let mut current = frame;
        for index in 0..self.entries.len() {
            let result = with_ctx!(self, index, |h, ctx| match h.as_outbound() {
                Some(outbound) => outbound.write(&mut ctx, current),
                None => Ok(current),
            });
            match result {
                Ok(next) => current = next,
                Err(error) => {
                    self.route_exception(index, &error);
                    return Err(error);
                }
            }
        }
        match current {
            Frame::Encoded(buffer) => {
                if let Some(listener) = self.outbound_finished.as_mut() {
                    listener(&buffer);
                }
                self.outbound.push_back(Outbound { buffer, remote });
                Ok(())
            }
            _ => Err(ProtocolError::state(constants::ERR_NOT_ENCODED)),
        }
    }

    fn drain_effects(&mut self) {
        while let Some(effect) = self.effects.pop_front() {
            match effect {
                Effect::Write(frame) => {
                    if let Err(error) = self.write_inner(frame) {
                        debug!(%error, "Handler write failed");
                    }
                }
                Effect::Event { origin, event } => self.event_from(origin + 1, &event),
            }
        }
    }

    /// Encoded buffers ready for the socket, oldest first.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        self.outbound.drain(..).collect()
    }

    /// Frames no inbound handler consumed.
    pub fn take_unhandled(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.unhandled)
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested
    }
}

/// Named handler prototypes from which per-channel pipelines are built.
#[derive(Default)]
pub struct PipelineFactory {
    prototypes: Vec<(String, Box<dyn ChannelHandler>)>,
}

impl fmt::Debug for PipelineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.prototypes.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("PipelineFactory").field("handlers", &names).finish()
    }
}

impl PipelineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, prototype: Box<dyn ChannelHandler>) -> Self {
        self.prototypes.push((name.to_string(), prototype));
        self
    }

    /// Builds a pipeline with a fresh instance of every prototype, in order.
    pub fn build(&self, channel: ChannelInfo) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new(channel);
        for (name, prototype) in &self.prototypes {
            pipeline.add_last(name, prototype.create_new_instance())?;
        }
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        tag: &'static str,
        log: Log,
        consume: bool,
    }

    impl Recorder {
        fn boxed(tag: &'static str, log: &Log) -> Box<dyn ChannelHandler> {
            Box::new(Recorder {
                tag,
                log: log.clone(),
                consume: false,
            })
        }
    }

    impl ChannelHandler for Recorder {
        fn handler_added(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:added", self.tag));
            Ok(())
        }

        fn exception_caught(&mut self, _ctx: &mut HandlerContext<'_>, _error: &ProtocolError) {
            self.log.lock().unwrap().push(format!("{}:exception", self.tag));
        }

        fn create_new_instance(&self) -> Box<dyn ChannelHandler> {
            Box::new(Recorder {
                tag: self.tag,
                log: self.log.clone(),
                consume: self.consume,
            })
        }

        fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
            Some(self)
        }
    }

    impl InboundHandler for Recorder {
        fn read(&mut self, _ctx: &mut HandlerContext<'_>, frame: Frame) -> Result<Option<Frame>> {
            self.log.lock().unwrap().push(format!("{}:read", self.tag));
            Ok(if self.consume { None } else { Some(frame) })
        }
    }

    fn channel() -> ChannelInfo {
        ChannelInfo::new("127.0.0.1:7700".parse().unwrap(), None, true)
    }

    #[test]
    fn test_ordering_operations() {
        let log = Log::default();
        let mut p = Pipeline::new(channel());
        p.add_last("b", Recorder::boxed("b", &log)).unwrap();
        p.add_first("a", Recorder::boxed("a", &log)).unwrap();
        p.add_after("b", "d", Recorder::boxed("d", &log)).unwrap();
        p.add_before("d", "c", Recorder::boxed("c", &log)).unwrap();
        assert_eq!(p.names(), vec!["a", "b", "c", "d"]);
        assert!(p.get("c").is_some());
        assert!(p.get("e").is_none());

        p.replace("c", "c", Recorder::boxed("c2", &log)).unwrap();
        assert_eq!(p.names(), vec!["a", "b", "c", "d"]);
        p.remove("a").unwrap();
        assert_eq!(p.names(), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_duplicate_and_missing_names() {
        let log = Log::default();
        let mut p = Pipeline::new(channel());
        p.add_last("x", Recorder::boxed("x", &log)).unwrap();
        assert!(matches!(
            p.add_last("x", Recorder::boxed("x", &log)),
            Err(ProtocolError::State(_))
        ));
        assert!(matches!(
            p.add_before("nope", "y", Recorder::boxed("y", &log)),
            Err(ProtocolError::State(_))
        ));
        assert!(p.remove("nope").is_err());
    }

    #[test]
    fn test_read_walks_inbound_in_order_and_tail_keeps_frame() {
        let log = Log::default();
        let mut p = Pipeline::new(channel());
        p.add_last("a", Recorder::boxed("a", &log)).unwrap();
        p.add_last("b", Recorder::boxed("b", &log)).unwrap();
        log.lock().unwrap().clear();

        p.fire_read(Frame::message(Message::new()));
        assert_eq!(*log.lock().unwrap(), vec!["a:read", "b:read"]);
        assert_eq!(p.take_unhandled().len(), 1);
    }

    #[test]
    fn test_ids_are_not_reused() {
        let log = Log::default();
        let mut p = Pipeline::new(channel());
        p.add_last("a", Recorder::boxed("a", &log)).unwrap();
        let first = p.handler_id("a").unwrap();
        p.remove("a").unwrap();
        p.add_last("a", Recorder::boxed("a", &log)).unwrap();
        assert_ne!(p.handler_id("a").unwrap(), first);
        // a stale timer is a no-op
        p.fire_timer(first);
    }

    #[test]
    fn test_write_without_encoder_is_state_error() {
        let mut p = Pipeline::new(channel());
        assert!(matches!(
            p.write(Frame::message(Message::new())),
            Err(ProtocolError::State(_))
        ));
    }

    #[test]
    fn test_factory_builds_fresh_instances() {
        let log = Log::default();
        let factory = PipelineFactory::new()
            .with("a", Recorder::boxed("a", &log))
            .with("b", Recorder::boxed("b", &log));
        let p1 = factory.build(channel()).unwrap();
        let p2 = factory.build(channel()).unwrap();
        assert_eq!(p1.names(), p2.names());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:added", "b:added", "a:added", "b:added"]
        );
    }
}
