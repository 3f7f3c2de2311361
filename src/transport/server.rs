//! # Channel Server
//!
//! Binds the peer's TCP and UDP endpoints and serves incoming requests.
//!
//! ## Lifecycle
//! - [`ChannelServer::startup`] binds TCP then UDP for the wildcard address or for every
//!   configured interface. The first bind failure is logged and reported as `false`;
//!   endpoints bound before it stay up until shutdown.
//! - Each UDP socket gets one receive loop with its own pipeline.
//! - Each TCP listener gets `max_tcp_clients` service loops; every accepted connection
//!   gets a fresh pipeline.
//! - [`ChannelServer::shutdown`] cancels every loop and drops open connections without
//!   draining them.
//!
//! ## Pipelines
//! ```text
//! UDP: decoder -> encoder -> dispatcher
//! TCP: idle -> decoder -> encoder -> dispatcher
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::config::NetworkConfig;
use crate::core::signature::SignatureFactory;
use crate::error::ProtocolError;
use crate::pipeline::handlers::{DecoderHandler, DispatchHandler, EncoderHandler};
use crate::pipeline::idle::IdleStateHandler;
use crate::pipeline::PipelineFactory;
use crate::protocol::dispatcher::RequestDispatcher;
use crate::transport::{tcp, udp};
use crate::utils::metrics::{global_metrics, Timer};

pub const HANDLER_IDLE: &str = "idle";
pub const HANDLER_DECODER: &str = "decoder";
pub const HANDLER_ENCODER: &str = "encoder";
pub const HANDLER_DISPATCHER: &str = "dispatcher";

pub struct ChannelServer {
    config: NetworkConfig,
    udp_factory: Arc<PipelineFactory>,
    tcp_factory: Arc<PipelineFactory>,
    shutdown: CancellationToken,
    udp_addrs: Vec<SocketAddr>,
    tcp_addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ChannelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelServer")
            .field("udp", &self.udp_addrs)
            .field("tcp", &self.tcp_addrs)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl ChannelServer {
    pub fn new(
        config: NetworkConfig,
        dispatcher: Arc<dyn RequestDispatcher>,
        signatures: Arc<dyn SignatureFactory>,
    ) -> Self {
        let udp_factory = PipelineFactory::new()
            .with(HANDLER_DECODER, Box::new(DecoderHandler::new(signatures.clone())))
            .with(HANDLER_ENCODER, Box::new(EncoderHandler::new(signatures.clone())))
            .with(HANDLER_DISPATCHER, Box::new(DispatchHandler::new(dispatcher.clone())));
        let tcp_factory = PipelineFactory::new()
            .with(
                HANDLER_IDLE,
                Box::new(IdleStateHandler::new(config.connection.idle_tcp)),
            )
            .with(HANDLER_DECODER, Box::new(DecoderHandler::new(signatures.clone())))
            .with(HANDLER_ENCODER, Box::new(EncoderHandler::new(signatures)))
            .with(HANDLER_DISPATCHER, Box::new(DispatchHandler::new(dispatcher)));
        Self {
            config,
            udp_factory: Arc::new(udp_factory),
            tcp_factory: Arc::new(tcp_factory),
            shutdown: CancellationToken::new(),
            udp_addrs: Vec::new(),
            tcp_addrs: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Binds and starts serving. Returns false on the first bind failure.
    #[instrument(skip(self))]
    pub async fn startup(&mut self) -> bool {
        if self.config.server.disable_bind {
            info!("Binding disabled, not listening");
            return true;
        }
        let _timer = Timer::start("channel_server_startup");
        let addresses = self.config.server.bind_addresses();
        if addresses.is_empty() {
            error!(
                configured = ?self.config.server.addresses,
                "No address to bind: listen_any is off and no listen address parses"
            );
            return false;
        }
        for (tcp_addr, udp_addr) in addresses {
            if let Err(e) = self.start_tcp(tcp_addr).await {
                error!(addr = %tcp_addr, error = %e, "Cannot bind TCP");
                return false;
            }
            if let Err(e) = self.start_udp(udp_addr).await {
                error!(addr = %udp_addr, error = %e, "Cannot bind UDP");
                return false;
            }
        }
        true
    }

    async fn start_tcp(&mut self, addr: SocketAddr) -> Result<(), ProtocolError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProtocolError::BindFailure {
                addr,
                reason: e.to_string(),
            })?;
        let local = listener.local_addr()?;
        let listener = Arc::new(listener);
        let loops = self.config.server.max_tcp_clients.max(1);
        for id in 0..loops {
            self.tasks.push(tokio::spawn(tcp::service_loop(
                id,
                local,
                listener.clone(),
                self.tcp_factory.clone(),
                self.config.server.max_frame_size,
                self.shutdown.clone(),
            )));
        }
        info!(addr = %local, loops, "Listening on TCP");
        self.tcp_addrs.push(local);
        Ok(())
    }

    async fn start_udp(&mut self, addr: SocketAddr) -> Result<(), ProtocolError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ProtocolError::BindFailure {
                addr,
                reason: e.to_string(),
            })?;
        let local = socket.local_addr()?;
        self.tasks.push(tokio::spawn(udp::receive_loop(
            local,
            Arc::new(socket),
            self.udp_factory.clone(),
            self.shutdown.clone(),
        )));
        info!(addr = %local, "Listening on UDP");
        self.udp_addrs.push(local);
        Ok(())
    }

    pub fn tcp_local_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    pub fn udp_local_addrs(&self) -> &[SocketAddr] {
        &self.udp_addrs
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty() && !self.shutdown.is_cancelled()
    }

    /// Stops every loop and waits for them to exit. Open connections are dropped.
    #[instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Channel server stopped");
        global_metrics().log_metrics();
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
