//! # Request Sending
//!
//! [`ChannelCreator`] opens a short-lived channel per request, runs it through a client
//! pipeline ending in the request's [`RequestHandler`] and hands the caller a
//! [`FutureResponse`] straight away. The I/O runs on the tokio worker pool.
//!
//! ## Transports
//! - **UDP**: an ephemeral socket connected to the recipient; every reply datagram is
//!   awaited for at most `idle_udp`.
//! - **TCP**: connect within `connection_timeout_tcp`, then an idle detector with window
//!   `idle_tcp` guards the exchange.
//!
//! Running out of time fails the request with the `Timeout` cause. [`ChannelCreator::shutdown`]
//! aborts every outstanding request as a user abort and refuses new ones.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::ConnectionConfig;
use crate::core::codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use crate::core::message::{Message, MessageType};
use crate::core::peer::PeerAddress;
use crate::core::signature::SignatureFactory;
use crate::error::{constants, PeerException, ProtocolError, Result};
use crate::pipeline::handlers::{DecoderHandler, EncoderHandler};
use crate::pipeline::idle::IdleStateHandler;
use crate::pipeline::{ChannelInfo, Frame, Pipeline, PipelineFactory};
use crate::protocol::future::FutureResponse;
use crate::protocol::request::{PeerBean, RequestHandler};
use crate::transport::udp::MAX_DATAGRAM_SIZE;
use crate::transport::{tcp, udp};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::{with_timeout, with_timeout_error};

/// Issues message ids for outgoing requests.
#[derive(Debug)]
pub struct MessageIdSource {
    rng: Mutex<StdRng>,
}

impl Default for MessageIdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdSource {
    /// A source seeded from the operating system.
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        let rng = match getrandom::fill(&mut seed) {
            Ok(()) => StdRng::from_seed(seed),
            Err(e) => {
                warn!(error = %e, "OS randomness unavailable, seeding from thread rng");
                StdRng::from_rng(&mut rand::rng())
            }
        };
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// A deterministic source.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .random()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Udp { fire_and_forget: bool },
    Tcp,
}

pub struct ChannelCreator {
    config: ConnectionConfig,
    max_frame_size: usize,
    peer_bean: Arc<PeerBean>,
    signatures: Arc<dyn SignatureFactory>,
    ids: MessageIdSource,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ChannelCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCreator")
            .field("config", &self.config)
            .field("peer_bean", &self.peer_bean)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ChannelCreator {
    pub fn new(
        config: ConnectionConfig,
        peer_bean: Arc<PeerBean>,
        signatures: Arc<dyn SignatureFactory>,
    ) -> Self {
        Self {
            config,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            peer_bean,
            signatures,
            ids: MessageIdSource::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_id_source(mut self, ids: MessageIdSource) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn peer_bean(&self) -> &Arc<PeerBean> {
        &self.peer_bean
    }

    /// A request envelope from the local peer to `recipient` with a fresh id.
    pub fn new_request(&self, recipient: PeerAddress, command: u8, message_type: MessageType) -> Message {
        let mut message = Message::new();
        message
            .set_message_id(self.ids.next_id())
            .set_version(self.config.version)
            .set_type(message_type)
            .set_command(command)
            .set_sender(self.peer_bean.local_address().clone())
            .set_recipient(recipient);
        message
    }

    /// Sends `message` over UDP and waits for the reply.
    pub fn send_udp(&self, message: Message) -> FutureResponse {
        self.send(message, Transport::Udp { fire_and_forget: false })
    }

    /// Sends `message` over UDP without waiting; the future resolves empty once sent.
    pub fn fire_and_forget_udp(&self, message: Message) -> FutureResponse {
        self.send(message, Transport::Udp { fire_and_forget: true })
    }

    /// Sends `message` over a new TCP connection and waits for the reply.
    pub fn send_tcp(&self, message: Message) -> FutureResponse {
        self.send(message, Transport::Tcp)
    }

    fn send(&self, message: Message, transport: Transport) -> FutureResponse {
        let future = FutureResponse::new(message);
        let handler = RequestHandler::new(future.clone(), self.peer_bean.clone());
        if self.shutdown.is_cancelled() {
            handler.exception_caught(PeerException::user_abort(constants::ERR_CHANNEL_SHUTDOWN));
            return future;
        }

        let exchange = Exchange {
            handler: handler.clone(),
            signatures: self.signatures.clone(),
            config: self.config.clone(),
            max_frame_size: self.max_frame_size,
        };
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => Err(ProtocolError::Peer(
                    PeerException::user_abort(constants::ERR_CHANNEL_SHUTDOWN),
                )),
                r = exchange.run(transport) => r,
            };
            if let Err(e) = result {
                if !handler.future().is_completed() {
                    handler.exception_caught(e.into_peer_exception());
                }
            }
        });
        future
    }

    /// Aborts every outstanding request as a user abort and refuses new ones.
    pub fn shutdown(&self) {
        debug!("Channel creator shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// One request's I/O.
struct Exchange {
    handler: RequestHandler,
    signatures: Arc<dyn SignatureFactory>,
    config: ConnectionConfig,
    max_frame_size: usize,
}

impl Exchange {
    async fn run(self, transport: Transport) -> Result<()> {
        match transport {
            Transport::Udp { fire_and_forget } => self.udp(fire_and_forget).await,
            Transport::Tcp => self.tcp().await,
        }
    }

    fn pipeline(&self, channel: ChannelInfo, idle: Option<std::time::Duration>) -> Result<Pipeline> {
        let mut factory = PipelineFactory::new();
        if let Some(window) = idle {
            factory = factory.with("idle", Box::new(IdleStateHandler::new(window)));
        }
        factory
            .with("decoder", Box::new(DecoderHandler::new(self.signatures.clone())))
            .with("encoder", Box::new(EncoderHandler::new(self.signatures.clone())))
            .with("request", Box::new(self.handler.clone()))
            .build(channel)
    }

    #[instrument(skip(self), fields(id = self.handler.future().request().message_id()))]
    async fn udp(self, fire_and_forget: bool) -> Result<()> {
        let request = self.handler.future().request().clone();
        let remote = request.recipient().udp_socket();
        let socket = UdpSocket::bind(unspecified_for(remote)).await?;
        socket.connect(remote).await?;
        let local = socket.local_addr()?;

        let mut pipeline = self.pipeline(ChannelInfo::new(local, Some(remote), true), None)?;
        pipeline.fire_channel_active();
        pipeline.write(Frame::message(request))?;
        udp::flush(&mut pipeline, &socket, remote).await;

        if fire_and_forget {
            self.handler.response_message_received(None);
            return Ok(());
        }

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while !self.handler.future().is_completed() {
            let len = with_timeout_error(
                async { socket.recv(&mut buf).await.map_err(ProtocolError::from) },
                self.config.idle_udp,
            )
            .await?;
            global_metrics().datagram_received(len as u64);
            pipeline.fire_read(Frame::Packet {
                bytes: Bytes::copy_from_slice(&buf[..len]),
                sender: remote,
                recipient: local,
                udp: true,
            });
            udp::discard_unhandled(&mut pipeline);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(id = self.handler.future().request().message_id()))]
    async fn tcp(self) -> Result<()> {
        let request = self.handler.future().request().clone();
        let remote = request.recipient().tcp_socket();
        let stream = with_timeout_error(
            async { TcpStream::connect(remote).await.map_err(ProtocolError::from) },
            self.config.connection_timeout_tcp,
        )
        .await?;
        let _connection = global_metrics().track_connection();
        let local = stream.local_addr()?;

        let mut framed = Framed::new(stream, FrameCodec::new(self.max_frame_size));
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let mut pipeline = self.pipeline(
            ChannelInfo::new(local, Some(remote), false),
            Some(self.config.idle_tcp),
        )?;
        pipeline.set_timer_sink(timer_tx);
        pipeline.fire_channel_active();
        pipeline.write(Frame::message(request))?;

        let result = loop {
            if let Err(e) = tcp::flush(&mut pipeline, &mut framed).await {
                break Err(e);
            }
            if self.handler.future().is_completed() || pipeline.is_close_requested() {
                break Ok(());
            }
            tokio::select! {
                Some(id) = timer_rx.recv() => pipeline.fire_timer(id),
                next = framed.next() => match next {
                    Some(Ok(bytes)) => {
                        global_metrics().frame_received(bytes.len() as u64 + 4);
                        pipeline.fire_read(Frame::Packet {
                            bytes,
                            sender: remote,
                            recipient: local,
                            udp: false,
                        });
                        udp::discard_unhandled(&mut pipeline);
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(ProtocolError::ConnectionClosed),
                },
            }
        };

        pipeline.fire_channel_inactive();
        result
    }
}

fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    let ip = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

/// Waits for a reply, bounded by `timeout` (zero waits forever).
pub async fn await_with_timeout(
    future: &FutureResponse,
    timeout: std::time::Duration,
) -> std::result::Result<Option<Message>, PeerException> {
    match with_timeout(future.await_response(), timeout).await {
        Ok(outcome) => outcome,
        Err(e) => Err(e.into_peer_exception()),
    }
}
