//! Route connection task
//!
//! Drives one server-to-server connection: Info exchange, duplicate
//! arbitration, then the steady state with a reader loop in this task and a
//! writer task draining the route's outbound queue.
//!
//! The side with the higher server identity arbitrates. It registers the
//! route and answers `Accept`, or answers `Reject` when it already has a
//! route to the peer. The lower side only registers once it sees `Accept`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::dialer::{RouteState, Solicited};
use super::table::{PendingRoute, RouteHandle};
use super::{ClusterCoordinator, RouteError, RouteSettings, DUPLICATE_ROUTE};
use crate::protocol::route::{write_frame, write_frame_within, FrameDecoder, RouteFrame};
use crate::protocol::ProtocolError;

/// Initial read buffer capacity
const READ_BUF_SIZE: usize = 16 * 1024;

/// Flush threshold for the writer
const MAX_BATCH_BYTES: usize = 64 * 1024;

/// Idle time before TCP keepalive probes start
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// A route that completed the handshake and is in the table
struct Established {
    handle: Arc<RouteHandle>,
    rx: mpsc::UnboundedReceiver<RouteFrame>,
    /// Frames queued before the route became visible
    preamble_len: usize,
}

fn configure_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// Run a route over `stream` until it closes.
///
/// Returns `Ok(())` if the route was established at some point, otherwise
/// the reason the handshake failed.
pub(crate) async fn run_route(
    coord: Arc<ClusterCoordinator>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    solicited: Option<Solicited>,
) -> Result<(), RouteError> {
    configure_stream(&stream);
    let settings = coord.settings();
    let (mut reader, mut writer) = stream.into_split();
    let decoder = FrameDecoder::new(settings.max_frame);
    let mut read_buf = BytesMut::with_capacity(READ_BUF_SIZE);

    let parent = match solicited {
        Some(ref s) => s.token.clone(),
        None => coord.shutdown_token().clone(),
    };
    let close = parent.child_token();

    let handshake = tokio::time::timeout(
        settings.handshake_timeout,
        handshake(
            &coord,
            &mut reader,
            &mut writer,
            &mut read_buf,
            &decoder,
            remote_addr,
            solicited.as_ref(),
            &close,
        ),
    );
    let established = tokio::select! {
        _ = close.cancelled() => return Err(RouteError::Closed),
        result = handshake => match result {
            Ok(established) => established?,
            Err(_) => return Err(RouteError::HandshakeTimeout),
        },
    };

    let Established {
        handle,
        rx,
        preamble_len,
    } = established;
    if let Some(ref s) = solicited {
        s.set_state(RouteState::Established);
    }
    info!(
        "Route[{}/{}]: established with '{}' at {} ({})",
        handle.id(),
        handle.peer(),
        handle.peer_name(),
        remote_addr,
        if handle.is_solicited() { "solicited" } else { "accepted" }
    );

    let writer_handle = handle.clone();
    let max_frame = settings.max_frame;
    tokio::spawn(async move {
        if let Err(e) = write_loop(rx, writer, &writer_handle, preamble_len, max_frame).await {
            debug!(
                "Route[{}/{}]: write failed: {}",
                writer_handle.id(),
                writer_handle.peer(),
                e
            );
        }
        writer_handle.close();
    });

    let result = read_loop(&coord, &handle, &mut reader, &mut read_buf, &decoder, &settings).await;
    coord.route_closed(&handle);

    match result {
        Ok(()) => info!("Route[{}/{}]: closed", handle.id(), handle.peer()),
        Err(RouteError::Closed) => info!("Route[{}/{}]: closed by peer", handle.id(), handle.peer()),
        Err(e) => warn!("Route[{}/{}]: closed: {}", handle.id(), handle.peer(), e),
    }
    Ok(())
}

/// Read one complete frame, pulling more bytes as needed
async fn read_frame(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    decoder: &FrameDecoder,
) -> Result<RouteFrame, RouteError> {
    loop {
        if let Some(frame) = decoder.decode(buf)? {
            return Ok(frame);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(RouteError::Closed);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handshake(
    coord: &ClusterCoordinator,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    buf: &mut BytesMut,
    decoder: &FrameDecoder,
    remote_addr: SocketAddr,
    solicited: Option<&Solicited>,
    close: &tokio_util::sync::CancellationToken,
) -> Result<Established, RouteError> {
    let mut out = BytesMut::new();
    write_frame(&RouteFrame::Info(coord.local_info()), &mut out)?;
    writer.write_all(&out).await?;

    let info = match read_frame(reader, buf, decoder).await? {
        RouteFrame::Info(info) => info,
        other => {
            return Err(RouteError::Protocol(format!(
                "expected Info, got {}",
                other.type_name()
            )))
        }
    };
    let peer = coord.check_peer(&info)?;
    debug!("Route[{}]: Info from {} ('{}')", remote_addr, peer, info.name);

    let (tx, rx) = mpsc::unbounded_channel();
    let pending = PendingRoute {
        peer: peer.clone(),
        peer_name: info.name,
        url: solicited.map(|s| s.url.clone()),
        remote_addr,
        tx,
        close: close.clone(),
    };

    if *coord.server_id() > peer {
        match coord.establish(pending, true) {
            Ok((handle, preamble_len)) => Ok(Established {
                handle,
                rx,
                preamble_len,
            }),
            Err(RouteError::DuplicateRoute(peer)) => {
                debug!("Route[{}]: rejecting duplicate route to {}", remote_addr, peer);
                out.clear();
                write_frame(
                    &RouteFrame::Reject {
                        reason: DUPLICATE_ROUTE.to_string(),
                    },
                    &mut out,
                )?;
                let _ = writer.write_all(&out).await;
                Err(RouteError::DuplicateRoute(peer))
            }
            Err(e) => Err(e),
        }
    } else {
        match read_frame(reader, buf, decoder).await? {
            RouteFrame::Accept => {
                let (handle, preamble_len) = coord.establish(pending, false)?;
                Ok(Established {
                    handle,
                    rx,
                    preamble_len,
                })
            }
            RouteFrame::Reject { reason } if reason == DUPLICATE_ROUTE => {
                Err(RouteError::DuplicateRoute(peer))
            }
            RouteFrame::Reject { reason } => Err(RouteError::HandshakeMismatch(reason)),
            other => Err(RouteError::Protocol(format!(
                "expected Accept, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Append `frame` to the batch, dropping it if the peer could not accept it.
///
/// An oversized frame costs one message, never the route.
fn append_frame(
    frame: &RouteFrame,
    buf: &mut BytesMut,
    max_frame: usize,
    handle: &RouteHandle,
) -> Result<(), RouteError> {
    match write_frame_within(frame, buf, max_frame) {
        Err(ProtocolError::FrameTooLarge { size, max }) => {
            warn!(
                "Route[{}/{}]: dropping {} of {} bytes, limit is {}",
                handle.id(),
                handle.peer(),
                frame.type_name(),
                size,
                max
            );
            Ok(())
        }
        other => Ok(other?),
    }
}

/// Drain the outbound queue, batching whatever is ready into one write
async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<RouteFrame>,
    mut writer: OwnedWriteHalf,
    handle: &RouteHandle,
    preamble_len: usize,
    max_frame: usize,
) -> Result<(), RouteError> {
    let close = handle.close_token().clone();
    let mut buf = BytesMut::with_capacity(MAX_BATCH_BYTES);
    let mut written = 0usize;
    if preamble_len == 0 {
        handle.mark_synced();
    }

    loop {
        let first = tokio::select! {
            frame = rx.recv() => frame,
            _ = close.cancelled() => break,
        };
        let Some(first) = first else { break };

        append_frame(&first, &mut buf, max_frame, handle)?;
        let mut batch = 1;
        while buf.len() < MAX_BATCH_BYTES {
            match rx.try_recv() {
                Ok(frame) => {
                    append_frame(&frame, &mut buf, max_frame, handle)?;
                    batch += 1;
                }
                Err(_) => break,
            }
        }

        if !buf.is_empty() {
            tokio::select! {
                result = writer.write_all(&buf) => result?,
                _ = close.cancelled() => break,
            }
            buf.clear();
        }

        if !handle.is_synced() {
            written += batch;
            if written >= preamble_len {
                handle.mark_synced();
                debug!("Route[{}/{}]: interest dump sent", handle.id(), handle.peer());
            }
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

async fn read_loop(
    coord: &ClusterCoordinator,
    handle: &RouteHandle,
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    decoder: &FrameDecoder,
    settings: &RouteSettings,
) -> Result<(), RouteError> {
    let close = handle.close_token().clone();
    let mut ping_timer = tokio::time::interval(settings.ping_interval);
    ping_timer.reset();
    let mut pings_out = 0u32;

    loop {
        // Frames may already be buffered from the handshake
        while let Some(frame) = decoder.decode(buf)? {
            match frame {
                RouteFrame::Ping => {
                    handle.send(RouteFrame::Pong);
                }
                RouteFrame::Pong => pings_out = 0,
                frame => {
                    debug!(
                        "Route[{}/{}]: received {}",
                        handle.id(),
                        handle.peer(),
                        frame.type_name()
                    );
                    coord.on_route_frame(handle.id(), frame)?;
                }
            }
        }

        tokio::select! {
            _ = close.cancelled() => return Ok(()),
            result = reader.read_buf(buf) => {
                if result? == 0 {
                    return Err(RouteError::Closed);
                }
            }
            _ = ping_timer.tick() => {
                if pings_out >= settings.max_pings_out {
                    return Err(RouteError::StalePeer);
                }
                pings_out += 1;
                handle.send(RouteFrame::Ping);
            }
        }
    }
}
