//! Steady-state forwarding between a peer link and the route table.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Level, debug, trace, warn};

use super::PeerId;
use super::protocol::{
    LinkReader, LinkWriter, PING_FRAME, ProtocolError, Result, frame_header, parse_frame_header,
};
use crate::packet::{
    ETHERNET_HEADER_SIZE, MAX_PACKET_SIZE, PacketBuffer, PacketPool, PacketQueue, QueueReceiver,
    TAP_QUEUE_SIZE, packet_queue,
};
use crate::reconnect::AbortSignal;
use crate::route::{Ipv4Route, RouteGuard, RouteTable};
use crate::task::TaskGuard;

const PING_INTERVAL: Duration = Duration::from_secs(60);

pub type DeliverFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Destination for packets read off a peer link.
///
/// An error ends the connection the packet arrived on.
pub trait InboundHandler: Send + Sync + 'static {
    fn deliver(&self, packet: PacketBuffer) -> DeliverFuture<'_>;
}

impl InboundHandler for RouteTable {
    fn deliver(&self, packet: PacketBuffer) -> DeliverFuture<'_> {
        Box::pin(async move {
            self.route_packet(packet).await;
            Ok(())
        })
    }
}

/// Packet pump for one peer.
///
/// A relay owns the buffers its reader draws from and the output queue its
/// route points at. A client reuses the same relay across reconnects, so
/// packets still queued when a link drops go out on the next one.
pub struct Relay {
    id: PeerId,
    routes: Arc<RouteTable>,
    handler: Option<Arc<dyn InboundHandler>>,
    mtu: usize,

    free: Arc<PacketPool>,
    out: PacketQueue,
    out_rx: tokio::sync::Mutex<QueueReceiver>,

    stop: watch::Sender<bool>,
}

impl Relay {
    pub fn new(
        routes: Arc<RouteTable>,
        handler: Option<Arc<dyn InboundHandler>>,
        mtu: usize,
    ) -> Self {
        let free = PacketPool::new(TAP_QUEUE_SIZE, ETHERNET_HEADER_SIZE + mtu);
        let (out, out_rx) = packet_queue(TAP_QUEUE_SIZE);
        Self {
            id: PeerId::new(),
            routes,
            handler,
            mtu,
            free,
            out,
            out_rx: tokio::sync::Mutex::new(out_rx),
            stop: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// End the current forward, and any later one.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn free_pool(&self) -> &Arc<PacketPool> {
        &self.free
    }

    /// Route `remote` through this relay and pump frames until the link
    /// fails, `abort` fires or the relay is stopped. The route is removed
    /// on every exit path.
    pub async fn forward(
        &self,
        remote: Ipv4Route,
        reader: LinkReader,
        mut writer: LinkWriter,
        abort: Option<AbortSignal>,
    ) -> Result<()> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow_and_update() {
            return Ok(());
        }

        let _route = RouteGuard::install(&self.routes, remote, self.out.clone());
        let mut out = self.out_rx.lock().await;

        let mut read_task = TaskGuard(tokio::spawn(read_frames(
            reader,
            Arc::clone(&self.free),
            self.mtu,
            self.handler.clone(),
        )));

        let result = tokio::select! {
            result = &mut read_task.0 => match result {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Link reader failed");
                    Ok(())
                }
            },
            result = write_frames(&mut writer, &mut out) => result,
            _ = wait_abort(abort) => Ok(()),
            _ = stop.wait_for(|s| *s) => Ok(()),
        };

        debug!(subnet = %remote, "Forwarding ended");
        result
    }
}

async fn wait_abort(abort: Option<AbortSignal>) {
    match abort {
        Some(mut abort) => {
            // a dropped sender counts as abort
            let _ = abort.wait_for(|a| *a).await;
        }
        None => std::future::pending().await,
    }
}

async fn read_frames(
    mut reader: LinkReader,
    free: Arc<PacketPool>,
    mtu: usize,
    handler: Option<Arc<dyn InboundHandler>>,
) -> Result<()> {
    let tracing = tracing::enabled!(Level::TRACE);
    let mut header = [0u8; 2];

    loop {
        let mut packet = free.acquire().await;

        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let (control, len) = parse_frame_header(header);
        if len > mtu || ETHERNET_HEADER_SIZE + len > packet.capacity() {
            warn!(len, mtu, "Incoming message is too large");
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let end = ETHERNET_HEADER_SIZE + len;
        reader
            .read_exact(&mut packet.data_mut()[ETHERNET_HEADER_SIZE..end])
            .await?;

        if control {
            if tracing {
                trace!("Received control message");
            }
            continue;
        }
        if tracing {
            trace!(len, "Read inbound message");
        }

        packet.set_len(end);
        packet[12] = 0x08;
        packet[13] = 0x00;
        if let Some(handler) = &handler {
            handler.deliver(packet).await?;
        }
    }
}

async fn write_frames(writer: &mut LinkWriter, out: &mut QueueReceiver) -> Result<()> {
    let tracing = tracing::enabled!(Level::TRACE);
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                writer.write_all(&PING_FRAME).await?;
                writer.flush().await?;
                if tracing {
                    trace!("Sent ping control message");
                }
            }
            packet = out.recv() => {
                let Some(packet) = packet else {
                    return Ok(());
                };
                if packet.len() < ETHERNET_HEADER_SIZE {
                    continue;
                }
                let payload = &packet[ETHERNET_HEADER_SIZE..];
                if payload.len() > MAX_PACKET_SIZE {
                    warn!(len = payload.len(), "Dropping oversized outbound packet");
                    continue;
                }
                writer.write_all(&frame_header(payload.len(), false)).await?;
                writer.write_all(payload).await?;
                writer.flush().await?;
                if tracing {
                    trace!(len = payload.len(), "Sent outbound packet message");
                }
            }
        }
    }
}
