//! Layer 3 tun services: one per attached container plus the host's own.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::device::FrameDevice;
use super::provider::InterfaceProvider;
use super::{IfaceError, TUN_NAME_TEMPLATE};
use crate::packet::{
    ETHERNET_HEADER_SIZE, PacketPool, PacketQueue, QueueReceiver, TAP_QUEUE_SIZE, packet_queue,
};
use crate::route::{Ipv4Route, RouteGuard, RouteTable};
use crate::task::TaskGuard;

const CONTAINER_RETRY: Duration = Duration::from_secs(1);
const HOST_RETRY: Duration = Duration::from_secs(5);

/// Why a forwarding session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardExit {
    Stopped,
    DeviceLost,
}

/// Pump packets between a tun device and the route table until the device
/// fails or `stop` is set. `route` points at `out` for the duration.
pub async fn forward_tun(
    device: &Arc<dyn FrameDevice>,
    route: Ipv4Route,
    routes: &Arc<RouteTable>,
    free: &Arc<PacketPool>,
    out: &PacketQueue,
    out_rx: &mut QueueReceiver,
    stop: &mut watch::Receiver<bool>,
) -> ForwardExit {
    if *stop.borrow_and_update() {
        return ForwardExit::Stopped;
    }

    let _route = RouteGuard::install(routes, route, out.clone());
    let mut reader = TaskGuard(tokio::spawn(read_packets(
        Arc::clone(device),
        Arc::clone(free),
        Arc::clone(routes),
    )));

    tokio::select! {
        _ = stop.wait_for(|&stopped| stopped) => ForwardExit::Stopped,
        _ = &mut reader.0 => ForwardExit::DeviceLost,
        result = write_packets(device.as_ref(), out_rx) => {
            if let Err(e) = result {
                warn!(device = %device.name(), error = %e, "Failed to write to tun");
            }
            ForwardExit::DeviceLost
        }
    }
}

async fn read_packets(device: Arc<dyn FrameDevice>, free: Arc<PacketPool>, routes: Arc<RouteTable>) {
    loop {
        let mut packet = free.acquire().await;
        let n = match device
            .read(&mut packet.data_mut()[ETHERNET_HEADER_SIZE..])
            .await
        {
            Ok(0) => {
                debug!(device = %device.name(), "Tun closed");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(device = %device.name(), error = %e, "Failed to read from tun");
                return;
            }
        };
        packet.set_len(ETHERNET_HEADER_SIZE + n);

        let data = packet.data_mut();
        data[12] = 0x08;
        data[13] = 0x00;
        routes.route_packet(packet).await;
    }
}

async fn write_packets(device: &dyn FrameDevice, out: &mut QueueReceiver) -> std::io::Result<()> {
    while let Some(packet) = out.recv().await {
        if packet.len() <= ETHERNET_HEADER_SIZE {
            continue;
        }
        device.write(&packet[ETHERNET_HEADER_SIZE..]).await?;
    }
    Ok(())
}

enum Placement {
    Container(String),
    Host(Vec<String>),
}

/// A tun carrying one IP address, recreated while it keeps failing.
pub struct L3Tun {
    placement: Placement,
    ip: Ipv4Addr,
    ip_with_mask: String,
    retry: Duration,

    routes: Arc<RouteTable>,
    provider: Arc<dyn InterfaceProvider>,

    free: Arc<PacketPool>,
    out: PacketQueue,
    out_rx: Mutex<Option<QueueReceiver>>,
    iface: Mutex<Option<String>>,

    stop: watch::Sender<bool>,
}

impl L3Tun {
    /// Tun injected into `container` as its overlay interface.
    pub fn new(
        container: &str,
        ip: Ipv4Addr,
        ip_with_mask: String,
        routes: Arc<RouteTable>,
        provider: Arc<dyn InterfaceProvider>,
        mtu: usize,
    ) -> Arc<Self> {
        Self::build(
            Placement::Container(container.to_string()),
            ip,
            ip_with_mask,
            CONTAINER_RETRY,
            routes,
            provider,
            mtu,
        )
    }

    fn build(
        placement: Placement,
        ip: Ipv4Addr,
        ip_with_mask: String,
        retry: Duration,
        routes: Arc<RouteTable>,
        provider: Arc<dyn InterfaceProvider>,
        mtu: usize,
    ) -> Arc<Self> {
        let (out, out_rx) = packet_queue(TAP_QUEUE_SIZE);
        Arc::new(Self {
            placement,
            ip,
            ip_with_mask,
            retry,
            routes,
            provider,
            free: PacketPool::new(TAP_QUEUE_SIZE, ETHERNET_HEADER_SIZE + mtu),
            out,
            out_rx: Mutex::new(Some(out_rx)),
            iface: Mutex::new(None),
            stop: watch::channel(false).0,
        })
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn local_route(&self) -> Ipv4Route {
        Ipv4Route::host(self.ip)
    }

    /// Name of the tun currently in service, if one has been created.
    pub fn interface(&self) -> Option<String> {
        self.iface
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Create the first tun and start servicing it. Failing to create the
    /// first tun is reported; later failures are retried.
    pub async fn start(self: &Arc<Self>) -> Result<(), IfaceError> {
        let Some(out_rx) = self
            .out_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let device = match self.create().await {
            Ok(device) => device,
            Err(e) => {
                *self.out_rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(out_rx);
                return Err(e);
            }
        };

        let this = Arc::clone(self);
        tokio::spawn(async move { this.service(device, out_rx).await });
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    async fn create(&self) -> Result<Arc<dyn FrameDevice>, IfaceError> {
        let device = self.provider.create_tun(TUN_NAME_TEMPLATE).await?;
        let name = device.name().to_string();
        info!(device = %name, "Created layer 3 tun");

        match &self.placement {
            Placement::Container(container) => {
                self.provider
                    .inject(container, &name, &self.ip_with_mask)
                    .await?
            }
            Placement::Host(alternates) => {
                self.provider
                    .init_host(&name, &self.ip_with_mask, alternates)
                    .await?
            }
        }

        *self.iface.lock().unwrap_or_else(PoisonError::into_inner) = Some(name);
        Ok(device)
    }

    async fn service(self: Arc<Self>, mut device: Arc<dyn FrameDevice>, mut out_rx: QueueReceiver) {
        let mut stop = self.stop.subscribe();
        let route = self.local_route();
        loop {
            let exit = forward_tun(
                &device,
                route,
                &self.routes,
                &self.free,
                &self.out,
                &mut out_rx,
                &mut stop,
            )
            .await;
            if exit == ForwardExit::Stopped {
                debug!(ip = %self.ip, "Tun service stopped");
                return;
            }

            device = loop {
                tokio::select! {
                    _ = stop.wait_for(|&stopped| stopped) => return,
                    _ = tokio::time::sleep(self.retry) => {}
                }
                match self.create().await {
                    Ok(device) => break device,
                    Err(e) => warn!(ip = %self.ip, error = %e, "Failed to create tun"),
                }
            };
        }
    }
}

/// The host's own interface into the overlay, carrying the gateway address.
pub struct HostTun {
    tun: Arc<L3Tun>,
}

impl HostTun {
    pub fn new(
        ip: Ipv4Addr,
        ip_with_mask: String,
        alternate_networks: Vec<String>,
        routes: Arc<RouteTable>,
        provider: Arc<dyn InterfaceProvider>,
        mtu: usize,
    ) -> Self {
        Self {
            tun: L3Tun::build(
                Placement::Host(alternate_networks),
                ip,
                ip_with_mask,
                HOST_RETRY,
                routes,
                provider,
                mtu,
            ),
        }
    }

    pub async fn start(&self) -> Result<(), IfaceError> {
        self.tun.start().await
    }

    pub fn stop(&self) {
        self.tun.stop();
    }

    pub fn local_route(&self) -> Ipv4Route {
        self.tun.local_route()
    }

    pub fn interface(&self) -> Option<String> {
        self.tun.interface()
    }
}
