//! UDP receive loop: one pipeline per bound socket, one message per datagram.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::pipeline::{ChannelInfo, Frame, Pipeline, PipelineFactory};
use crate::utils::metrics::global_metrics;

/// Largest datagram accepted from the socket.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Sends every queued buffer, to its own destination or back to `default_remote`.
pub(crate) async fn flush(pipeline: &mut Pipeline, socket: &UdpSocket, default_remote: SocketAddr) {
    for outbound in pipeline.take_outbound() {
        let remote = outbound.remote.unwrap_or(default_remote);
        let datagram = outbound.buffer.to_bytes();
        match socket.send_to(&datagram, remote).await {
            Ok(sent) => global_metrics().datagram_sent(sent as u64),
            Err(e) => warn!(%remote, error = %e, "Failed to send datagram"),
        }
    }
}

/// Drops frames no handler consumed, such as stray replies reaching a server channel.
pub(crate) fn discard_unhandled(pipeline: &mut Pipeline) {
    for frame in pipeline.take_unhandled() {
        trace!(?frame, "Discarding unhandled frame");
    }
}

#[instrument(skip_all, fields(addr = %local))]
pub(crate) async fn receive_loop(
    local: SocketAddr,
    socket: Arc<UdpSocket>,
    factory: Arc<PipelineFactory>,
    shutdown: CancellationToken,
) {
    let mut pipeline = match factory.build(ChannelInfo::new(local, None, true)) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "Cannot build UDP pipeline");
            return;
        }
    };
    pipeline.fire_channel_active();

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("UDP receive loop stopped");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, sender)) => {
                        trace!(%sender, len, "Datagram received");
                        global_metrics().datagram_received(len as u64);
                        pipeline.fire_read(Frame::Packet {
                            bytes: Bytes::copy_from_slice(&buf[..len]),
                            sender,
                            recipient: local,
                            udp: true,
                        });
                        discard_unhandled(&mut pipeline);
                        flush(&mut pipeline, &socket, sender).await;
                    }
                    Err(e) => {
                        // ICMP port unreachable shows up here on some platforms
                        debug!(error = %e, "UDP receive error");
                    }
                }
            }
        }
    }
    pipeline.fire_channel_inactive();
}
