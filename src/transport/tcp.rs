//! TCP service loops.
//!
//! Each listener is served by a fixed number of loops. A loop accepts one connection,
//! serves it to the end with a fresh pipeline and only then accepts the next, so the loop
//! count bounds the number of connections served at once.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::codec::FrameCodec;
use crate::error::Result;
use crate::pipeline::{ChannelInfo, Frame, Pipeline, PipelineFactory};
use crate::transport::udp;
use crate::utils::metrics::global_metrics;

/// Writes every buffer the pipeline has queued.
pub(crate) async fn flush(
    pipeline: &mut Pipeline,
    framed: &mut Framed<TcpStream, FrameCodec>,
) -> Result<()> {
    for outbound in pipeline.take_outbound() {
        let len = outbound.buffer.capacity();
        framed.send(outbound.buffer).await?;
        global_metrics().frame_sent(len as u64 + 4);
    }
    Ok(())
}

#[instrument(skip_all, fields(addr = %local, loop_id = id))]
pub(crate) async fn service_loop(
    id: usize,
    local: SocketAddr,
    listener: Arc<TcpListener>,
    factory: Arc<PipelineFactory>,
    max_frame_size: usize,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("TCP service loop stopped");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let _connection = global_metrics().track_connection();
                        if let Err(e) = serve_connection(stream, peer, &factory, max_frame_size, &shutdown).await {
                            warn!(%peer, error = %e, "Connection ended with error");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
}

#[instrument(skip_all, fields(peer = %peer))]
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    factory: &PipelineFactory,
    max_frame_size: usize,
    shutdown: &CancellationToken,
) -> Result<()> {
    let local = stream.local_addr()?;
    info!("Connection established");

    let mut framed = Framed::new(stream, FrameCodec::new(max_frame_size));
    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
    let mut pipeline = factory.build(ChannelInfo::new(local, Some(peer), false))?;
    pipeline.set_timer_sink(timer_tx);
    pipeline.fire_channel_active();

    let result = loop {
        if let Err(e) = flush(&mut pipeline, &mut framed).await {
            break Err(e);
        }
        if pipeline.is_close_requested() {
            break Ok(());
        }
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            Some(id) = timer_rx.recv() => pipeline.fire_timer(id),
            next = framed.next() => match next {
                Some(Ok(bytes)) => {
                    global_metrics().frame_received(bytes.len() as u64 + 4);
                    pipeline.fire_read(Frame::Packet {
                        bytes,
                        sender: peer,
                        recipient: local,
                        udp: false,
                    });
                    udp::discard_unhandled(&mut pipeline);
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            },
        }
    };

    pipeline.fire_channel_inactive();
    info!("Connection closed");
    result
}
