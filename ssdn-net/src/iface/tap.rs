//! Virtual gateway on a bridge: answers ARP for the gateway address and
//! moves IPv4 frames between the bridge and the route table.
//!
//! Only seeded addresses (containers attached to the bridge) are routed to
//! the tap, one host route each, so container tuns in the same subnet keep
//! their own routes.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{IfaceError, TAP_NAME_TEMPLATE};
use super::device::FrameDevice;
use super::provider::InterfaceProvider;
use super::tun::ForwardExit;
use crate::arp::{
    self, ArpError, ArpListenerId, ArpOutcome, ArpTable, ArpTracker, MacAddr, format_mac,
    random_mac,
};
use crate::packet::{
    ETHERNET_HEADER_SIZE, PacketPool, PacketQueue, QueueReceiver, TAP_QUEUE_SIZE, packet_queue,
};
use crate::route::{Ipv4Route, RouteGuard, RouteTable};
use crate::task::TaskGuard;

const TAP_RETRY: Duration = Duration::from_secs(5);

struct Outputs {
    frames: QueueReceiver,
    packets: QueueReceiver,
}

pub struct L3Tap {
    gateway_ip: Ipv4Addr,
    gateway_mac: MacAddr,
    bridge: String,

    routes: Arc<RouteTable>,
    provider: Arc<dyn InterfaceProvider>,
    tracker: Arc<ArpTracker>,

    free: Arc<PacketPool>,
    /// Raw frames (ARP), written as they are.
    frames: PacketQueue,
    /// Routed packets, addressed from the ARP table before writing.
    packets: PacketQueue,
    outputs: Mutex<Option<Outputs>>,

    seeds: Mutex<BTreeMap<Ipv4Addr, MacAddr>>,
    seeds_changed: watch::Sender<()>,

    stop: watch::Sender<bool>,
}

impl L3Tap {
    pub fn new(
        gateway_ip: Ipv4Addr,
        bridge: &str,
        routes: Arc<RouteTable>,
        provider: Arc<dyn InterfaceProvider>,
        mtu: usize,
    ) -> Arc<Self> {
        let gateway_mac = random_mac();
        info!(ip = %gateway_ip, mac = %format_mac(&gateway_mac), "Virtual gateway");

        let (frames, frames_rx) = packet_queue(TAP_QUEUE_SIZE);
        let (packets, packets_rx) = packet_queue(TAP_QUEUE_SIZE);
        Arc::new(Self {
            gateway_ip,
            gateway_mac,
            bridge: bridge.to_string(),
            routes,
            provider,
            tracker: ArpTracker::new(gateway_ip, gateway_mac),
            free: PacketPool::new(TAP_QUEUE_SIZE, ETHERNET_HEADER_SIZE + mtu),
            frames,
            packets,
            outputs: Mutex::new(Some(Outputs {
                frames: frames_rx,
                packets: packets_rx,
            })),
            seeds: Mutex::new(BTreeMap::new()),
            seeds_changed: watch::channel(()).0,
            stop: watch::channel(false).0,
        })
    }

    pub fn gateway_ip(&self) -> Ipv4Addr {
        self.gateway_ip
    }

    pub fn gateway_mac(&self) -> MacAddr {
        self.gateway_mac
    }

    /// Name of the bridge the tap is linked to.
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Create the bridge and the first tap, then service the tap.
    pub async fn start(self: &Arc<Self>) -> Result<(), IfaceError> {
        let Some(outputs) = self
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let device = match self.create().await {
            Ok(device) => device,
            Err(e) => {
                *self.outputs.lock().unwrap_or_else(PoisonError::into_inner) = Some(outputs);
                return Err(e);
            }
        };

        self.tracker.start();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.service(device, outputs).await });
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
        self.tracker.stop();
    }

    pub async fn arp_table(&self) -> Result<ArpTable, ArpError> {
        self.tracker.snapshot().await
    }

    /// Ask the bridge who has `ip`.
    pub async fn resolve(&self, ip: Ipv4Addr) -> Result<MacAddr, ArpError> {
        arp::resolve(&self.tracker, &self.free, &self.frames, ip).await
    }

    /// Register a container on the bridge: `ip` is routed to the tap and
    /// addressed to `mac`.
    pub fn seed(&self, ip: Ipv4Addr, mac: MacAddr) {
        self.tracker.seed(ip, mac);
        self.lock_seeds().insert(ip, mac);
        self.seeds_changed.send_replace(());
    }

    pub fn unseed(&self, ip: Ipv4Addr) {
        self.tracker.unseed(ip);
        if self.lock_seeds().remove(&ip).is_some() {
            self.seeds_changed.send_replace(());
        }
    }

    pub fn seeded(&self) -> BTreeMap<Ipv4Addr, MacAddr> {
        self.lock_seeds().clone()
    }

    fn lock_seeds(&self) -> MutexGuard<'_, BTreeMap<Ipv4Addr, MacAddr>> {
        self.seeds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn create(&self) -> Result<Arc<dyn FrameDevice>, IfaceError> {
        self.provider.create_bridge(&self.bridge).await?;
        let device = self.provider.create_tap(TAP_NAME_TEMPLATE).await?;
        info!(device = %device.name(), bridge = %self.bridge, "Created layer 3 tap");
        self.provider
            .link_to_bridge(&self.bridge, device.name())
            .await?;
        Ok(device)
    }

    async fn service(self: Arc<Self>, mut device: Arc<dyn FrameDevice>, mut outputs: Outputs) {
        let mut stop = self.stop.subscribe();
        loop {
            if self.forward(&device, &mut outputs, &mut stop).await == ForwardExit::Stopped {
                debug!(bridge = %self.bridge, "Tap service stopped");
                return;
            }
            info!(device = %device.name(), "Closed tap");

            device = loop {
                tokio::select! {
                    _ = stop.wait_for(|&stopped| stopped) => return,
                    _ = tokio::time::sleep(TAP_RETRY) => {}
                }
                match self.create().await {
                    Ok(device) => break device,
                    Err(e) => warn!(bridge = %self.bridge, error = %e, "Failed to create tap"),
                }
            };
        }
    }

    async fn forward(
        &self,
        device: &Arc<dyn FrameDevice>,
        outputs: &mut Outputs,
        stop: &mut watch::Receiver<bool>,
    ) -> ForwardExit {
        if *stop.borrow_and_update() {
            return ForwardExit::Stopped;
        }

        let mut reader = TaskGuard(tokio::spawn(read_frames(
            Arc::clone(device),
            Arc::clone(&self.tracker),
            Arc::clone(&self.free),
            self.frames.clone(),
            Arc::clone(&self.routes),
        )));

        tokio::select! {
            _ = stop.wait_for(|&stopped| stopped) => ForwardExit::Stopped,
            _ = self.route_seeds() => ForwardExit::Stopped,
            _ = &mut reader.0 => ForwardExit::DeviceLost,
            result = self.write_frames(device.as_ref(), outputs) => {
                if let Err(e) = result {
                    warn!(device = %device.name(), error = %e, "Failed to write to tap");
                }
                ForwardExit::DeviceLost
            }
        }
    }

    /// Keep one host route per seeded address while the tap is up. The
    /// routes go away when this future is dropped.
    async fn route_seeds(&self) {
        let mut changed = self.seeds_changed.subscribe();
        let mut installed: HashMap<Ipv4Addr, RouteGuard> = HashMap::new();
        loop {
            let wanted = self.seeded();
            installed.retain(|ip, _| wanted.contains_key(ip));
            for ip in wanted.keys() {
                installed.entry(*ip).or_insert_with(|| {
                    RouteGuard::install(&self.routes, Ipv4Route::host(*ip), self.packets.clone())
                });
            }
            if changed.changed().await.is_err() {
                return;
            }
        }
    }

    async fn write_frames(
        &self,
        device: &dyn FrameDevice,
        outputs: &mut Outputs,
    ) -> std::io::Result<()> {
        let (tx, mut changes) = mpsc::unbounded_channel();
        let _listener = ListenerGuard {
            tracker: &self.tracker,
            id: self.tracker.add_listener(tx),
        };
        let mut table: Option<ArpTable> = None;

        loop {
            tokio::select! {
                biased;
                Some(update) = changes.recv() => table = Some(update),
                Some(mut packet) = outputs.packets.recv() => {
                    let addressed = table
                        .as_ref()
                        .is_some_and(|t| t.set_destination_mac(&mut packet, self.gateway_mac));
                    if !addressed {
                        debug!(len = packet.len(), "Dropping packet for unknown destination");
                        continue;
                    }
                    device.write(&packet).await?;
                }
                Some(frame) = outputs.frames.recv() => {
                    device.write(&frame).await?;
                }
                else => return Ok(()),
            }
        }
    }
}

struct ListenerGuard<'a> {
    tracker: &'a ArpTracker,
    id: ArpListenerId,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.tracker.remove_listener(self.id);
    }
}

async fn read_frames(
    device: Arc<dyn FrameDevice>,
    tracker: Arc<ArpTracker>,
    free: Arc<PacketPool>,
    frames: PacketQueue,
    routes: Arc<RouteTable>,
) {
    loop {
        let mut packet = free.acquire().await;
        let n = match device.read(packet.data_mut()).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                warn!(device = %device.name(), error = %e, "Failed to read from tap");
                return;
            }
        };
        packet.set_len(n);

        match tracker.process(packet) {
            ArpOutcome::Reply(reply) => {
                frames.send(reply).await;
            }
            ArpOutcome::Processing | ArpOutcome::Unsupported(_) => {}
            ArpOutcome::NotArp(packet) => {
                if packet.len() > ETHERNET_HEADER_SIZE && packet[12] == 0x08 && packet[13] == 0x00
                {
                    routes.route_packet(packet).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::memory::{DeviceEnd, MemoryProvider};
    use tokio::time::timeout;

    const GW_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 254);
    const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 7);
    const HOST_MAC: MacAddr = [0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0x07];

    fn arp_frame(
        op: u16,
        eth_dst: MacAddr,
        sha: MacAddr,
        spa: Ipv4Addr,
        tha: MacAddr,
        tpa: Ipv4Addr,
    ) -> Vec<u8> {
        let mut frame = Vec::with_capacity(42);
        frame.extend_from_slice(&eth_dst);
        frame.extend_from_slice(&sha);
        frame.extend_from_slice(&[0x08, 0x06, 0x00, 0x01, 0x08, 0x00, 6, 4]);
        frame.extend_from_slice(&op.to_be_bytes());
        frame.extend_from_slice(&sha);
        frame.extend_from_slice(&spa.octets());
        frame.extend_from_slice(&tha);
        frame.extend_from_slice(&tpa.octets());
        frame
    }

    async fn started_tap() -> (Arc<L3Tap>, Arc<RouteTable>, Arc<MemoryProvider>, DeviceEnd) {
        let routes = Arc::new(RouteTable::new());
        let provider = MemoryProvider::new();
        let tap = L3Tap::new(
            GW_IP,
            "br0",
            Arc::clone(&routes),
            provider.clone(),
            1500,
        );
        tap.start().await.unwrap();
        let end = provider.take_end().unwrap();
        (tap, routes, provider, end)
    }

    async fn next_written(end: &mut DeviceEnd) -> Vec<u8> {
        timeout(Duration::from_secs(5), end.written.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_for_routes(routes: &RouteTable, expected: &[&str]) {
        timeout(Duration::from_secs(5), async {
            while routes.describe() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_links_tap_to_bridge() {
        let (tap, _routes, provider, _end) = started_tap().await;
        assert_eq!(provider.calls(), vec!["create br0", "link br0 sl3.tap0"]);
        let mac = tap.gateway_mac();
        assert_eq!(mac[0] & 0x01, 0);
        assert_eq!(mac[0] & 0x02, 0x02);
        tap.stop();
    }

    #[tokio::test]
    async fn test_routes_follow_seeds() {
        let (tap, routes, _provider, _end) = started_tap().await;
        assert!(routes.describe().is_empty());

        tap.seed(HOST_IP, HOST_MAC);
        wait_for_routes(&routes, &["10.0.1.7/32"]).await;

        tap.seed(Ipv4Addr::new(10, 0, 1, 8), HOST_MAC);
        wait_for_routes(&routes, &["10.0.1.7/32", "10.0.1.8/32"]).await;

        tap.unseed(HOST_IP);
        wait_for_routes(&routes, &["10.0.1.8/32"]).await;

        tap.stop();
        wait_for_routes(&routes, &[]).await;
    }

    #[tokio::test]
    async fn test_answers_who_has_gateway() {
        let (tap, _routes, _provider, mut end) = started_tap().await;

        let request = arp_frame(1, [0xFF; 6], HOST_MAC, HOST_IP, [0; 6], GW_IP);
        end.inject.send(request).unwrap();

        let reply = next_written(&mut end).await;
        assert_eq!(reply.len(), 42);
        assert_eq!(&reply[0..6], &HOST_MAC);
        assert_eq!(&reply[6..12], &tap.gateway_mac());
        assert_eq!(&reply[20..22], &[0x00, 0x02]);
        assert_eq!(&reply[22..28], &tap.gateway_mac());
        assert_eq!(&reply[28..32], &GW_IP.octets());
        assert_eq!(&reply[32..38], &HOST_MAC);
        assert_eq!(&reply[38..42], &HOST_IP.octets());
        tap.stop();
    }

    #[tokio::test]
    async fn test_resolve_over_bridge() {
        let (tap, _routes, _provider, mut end) = started_tap().await;

        let resolver = {
            let tap = Arc::clone(&tap);
            tokio::spawn(async move { tap.resolve(HOST_IP).await })
        };

        let query = next_written(&mut end).await;
        assert_eq!(&query[0..6], &[0xFF; 6]);
        assert_eq!(&query[38..42], &HOST_IP.octets());

        let reply = arp_frame(2, tap.gateway_mac(), HOST_MAC, HOST_IP, tap.gateway_mac(), GW_IP);
        end.inject.send(reply).unwrap();

        let mac = timeout(Duration::from_secs(5), resolver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(mac, HOST_MAC);

        let table = tap.arp_table().await.unwrap();
        assert_eq!(table.get(HOST_IP), Some(HOST_MAC));
        tap.stop();
    }

    #[tokio::test]
    async fn test_routed_packets_addressed_from_table() {
        let (tap, routes, _provider, mut end) = started_tap().await;
        let pool = PacketPool::new(2, 1514);

        let packet_to = |ip: Ipv4Addr| {
            let mut packet = pool.try_acquire().unwrap();
            let data = packet.data_mut();
            data[..64].fill(0);
            data[12] = 0x08;
            data[13] = 0x00;
            data[14] = 0x45;
            data[30..34].copy_from_slice(&ip.octets());
            packet.set_len(64);
            packet
        };

        tap.seed(HOST_IP, HOST_MAC);
        wait_for_routes(&routes, &["10.0.1.7/32"]).await;
        timeout(Duration::from_secs(5), async {
            while tap.arp_table().await.unwrap().get(HOST_IP).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        routes.route_packet(packet_to(HOST_IP)).await;
        let frame = next_written(&mut end).await;
        assert_eq!(frame.len(), 64);
        assert_eq!(&frame[0..6], &HOST_MAC);
        assert_eq!(&frame[6..12], &tap.gateway_mac());
        assert_eq!(&frame[30..34], &HOST_IP.octets());
        tap.stop();
    }

    #[tokio::test]
    async fn test_ipv4_from_bridge_is_routed() {
        let (tap, routes, _provider, end) = started_tap().await;
        let (remote, mut remote_rx) = packet_queue(4);
        routes.add_route("10.0.2.0/24".parse().unwrap(), remote);

        let mut frame = vec![0u8; 60];
        frame[0..6].copy_from_slice(&tap.gateway_mac());
        frame[6..12].copy_from_slice(&HOST_MAC);
        frame[12] = 0x08;
        frame[14] = 0x45;
        frame[30..34].copy_from_slice(&[10, 0, 2, 3]);
        end.inject.send(frame.clone()).unwrap();

        let packet = timeout(Duration::from_secs(5), remote_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&packet[..], &frame[..]);
        tap.stop();
    }
}
