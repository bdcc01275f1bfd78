//! Overlay route table.
//!
//! This module provides:
//! - `Ipv4Route`: a (network, mask) pair, also the subnet descriptor sent on
//!   the wire during peer info exchange
//! - `RouteTable`: copy-on-write list of routes to output queues, with
//!   push notification of every new snapshot to registered listeners
//!
//! Routes are matched first-to-last in insertion order; there is no
//! longest-prefix ordering.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use crate::packet::{ETHERNET_HEADER_SIZE, PacketBuffer, PacketQueue};

/// Offset of the IPv4 destination address within an Ethernet frame.
const DEST_IP_OFFSET: usize = ETHERNET_HEADER_SIZE + 16;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid IPv4 network: {0}")]
    InvalidNetwork(String),
}

/// A reachable IPv4 subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Route {
    pub network: u32,
    pub mask: u32,
}

impl Ipv4Route {
    pub fn new(network: u32, mask: u32) -> Self {
        Self { network, mask }
    }

    /// Host route (/32) for a single address.
    pub fn host(ip: Ipv4Addr) -> Self {
        Self::new(u32::from(ip), u32::MAX)
    }

    pub fn contains(&self, ip: u32) -> bool {
        ip & self.mask == self.network
    }

    pub fn prefix_len(&self) -> u32 {
        self.mask.leading_ones()
    }

    pub fn network_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn mask_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask)
    }

    /// Wire encoding: 4-byte network followed by 4-byte mask, big-endian.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.network.to_be_bytes());
        out[4..].copy_from_slice(&self.mask.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        let network = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mask = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self { network, mask }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.to_bytes()).await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Self> {
        let mut bytes = [0u8; 8];
        r.read_exact(&mut bytes).await?;
        Ok(Self::from_bytes(bytes))
    }
}

impl From<Ipv4Net> for Ipv4Route {
    fn from(net: Ipv4Net) -> Self {
        Self {
            network: u32::from(net.network()),
            mask: u32::from(net.netmask()),
        }
    }
}

impl FromStr for Ipv4Route {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Net>()
            .map(Ipv4Route::from)
            .map_err(|_| RouteError::InvalidNetwork(s.to_string()))
    }
}

impl fmt::Display for Ipv4Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_addr(), self.prefix_len())
    }
}

/// One installed route and the queue that services it.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub route: Ipv4Route,
    pub queue: PacketQueue,
    id: u64,
}

impl RouteEntry {
    pub fn handle(&self) -> RouteHandle {
        RouteHandle(self.id)
    }
}

/// Identifies exactly one installed route entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteHandle(u64);

/// Identifies a registered route listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Immutable route snapshot.
pub type RouteList = Arc<Vec<RouteEntry>>;

/// Receives every published route snapshot.
pub type RouteListener = UnboundedSender<RouteList>;

/// Copy-on-write route table.
///
/// Readers load the current snapshot without locking. Writers serialize on
/// a mutex, build a new list and publish it wholesale, so a reader always
/// sees one complete list.
pub struct RouteTable {
    routes: ArcSwap<Vec<RouteEntry>>,
    listeners: ArcSwap<Vec<(ListenerId, RouteListener)>>,
    write_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Vec::new()),
            listeners: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Current route snapshot.
    pub fn routes(&self) -> RouteList {
        self.routes.load_full()
    }

    /// Route strings for operators, in match order.
    pub fn describe(&self) -> Vec<String> {
        self.routes().iter().map(|e| e.route.to_string()).collect()
    }

    pub fn add_route(&self, route: Ipv4Route, queue: PacketQueue) -> RouteHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut routes = (**self.routes.load()).clone();
            routes.push(RouteEntry { route, queue, id });
            self.publish(Arc::new(routes));
        }
        debug!(route = %route, "Added route");
        RouteHandle(id)
    }

    /// Remove a previously added route.
    ///
    /// Removing a route that is not installed is a no-op and publishes
    /// nothing.
    pub fn remove_route(&self, handle: RouteHandle) -> Option<Ipv4Route> {
        let removed = {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.routes.load();
            let pos = current.iter().position(|e| e.id == handle.0)?;
            let mut routes = (**current).clone();
            let removed = routes.remove(pos);
            self.publish(Arc::new(routes));
            removed
        };
        debug!(route = %removed.route, "Removed route");
        Some(removed.route)
    }

    /// Register a listener; it is immediately sent the current snapshot.
    pub fn add_listener(&self, listener: RouteListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let snapshot = {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut listeners = (**self.listeners.load()).clone();
            listeners.push((id, listener.clone()));
            self.listeners.store(Arc::new(listeners));
            self.routes.load_full()
        };
        let _ = listener.send(snapshot);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut listeners = (**self.listeners.load()).clone();
        listeners.retain(|(lid, _)| *lid != id);
        self.listeners.store(Arc::new(listeners));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load().len()
    }

    /// Store a new snapshot and send it to every listener.
    ///
    /// Must be called with `write_lock` held, so listeners see snapshots in
    /// the order they were stored. Closed listeners are dropped.
    fn publish(&self, snapshot: RouteList) {
        self.routes.store(Arc::clone(&snapshot));

        let listeners = self.listeners.load();
        let live: Vec<(ListenerId, RouteListener)> = listeners
            .iter()
            .filter(|(_, tx)| tx.send(Arc::clone(&snapshot)).is_ok())
            .cloned()
            .collect();
        if live.len() != listeners.len() {
            debug!(
                closed = listeners.len() - live.len(),
                "Removing closed route listeners"
            );
            self.listeners.store(Arc::new(live));
        }
    }

    /// Forward a packet to the first route matching its destination.
    ///
    /// Packets without a matching route are dropped, which returns them to
    /// their pool.
    pub async fn route_packet(&self, packet: PacketBuffer) {
        if packet.len() < DEST_IP_OFFSET + 4 {
            trace!(len = packet.len(), "Dropping runt packet");
            return;
        }
        let dest = u32::from_be_bytes([
            packet[DEST_IP_OFFSET],
            packet[DEST_IP_OFFSET + 1],
            packet[DEST_IP_OFFSET + 2],
            packet[DEST_IP_OFFSET + 3],
        ]);

        let queue = {
            let routes = self.routes.load();
            match routes.iter().find(|e| e.route.contains(dest)) {
                Some(entry) => entry.queue.clone(),
                None => {
                    trace!(dest = %Ipv4Addr::from(dest), "No route for packet");
                    return;
                }
            }
        };
        queue.send(packet).await;
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its route from the table when dropped.
pub struct RouteGuard {
    table: Arc<RouteTable>,
    handle: RouteHandle,
}

impl RouteGuard {
    pub fn install(table: &Arc<RouteTable>, route: Ipv4Route, queue: PacketQueue) -> Self {
        let handle = table.add_route(route, queue);
        Self {
            table: Arc::clone(table),
            handle,
        }
    }

    pub fn handle(&self) -> RouteHandle {
        self.handle
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.table.remove_route(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketPool, packet_queue};
    use tokio::sync::mpsc;

    fn ipv4_frame(pool: &Arc<PacketPool>, dest: Ipv4Addr) -> PacketBuffer {
        let mut buf = pool.try_acquire().unwrap();
        buf.set_len(ETHERNET_HEADER_SIZE + 20);
        buf[12] = 0x08;
        buf[13] = 0x00;
        buf[DEST_IP_OFFSET..DEST_IP_OFFSET + 4].copy_from_slice(&dest.octets());
        buf
    }

    #[test]
    fn test_route_parse_and_display() {
        let route: Ipv4Route = "10.0.2.0/24".parse().unwrap();
        assert_eq!(route.network, 0x0A00_0200);
        assert_eq!(route.mask, 0xFFFF_FF00);
        assert_eq!(route.to_string(), "10.0.2.0/24");
        assert!("10.0.2.0/33".parse::<Ipv4Route>().is_err());
    }

    #[test]
    fn test_route_contains() {
        let route: Ipv4Route = "10.0.1.0/24".parse().unwrap();
        assert!(route.contains(u32::from(Ipv4Addr::new(10, 0, 1, 77))));
        assert!(!route.contains(u32::from(Ipv4Addr::new(10, 0, 2, 1))));
        let host = Ipv4Route::host(Ipv4Addr::new(10, 0, 1, 5));
        assert_eq!(host.to_string(), "10.0.1.5/32");
    }

    #[test]
    fn test_route_wire_bytes() {
        let route: Ipv4Route = "192.168.4.0/22".parse().unwrap();
        let bytes = route.to_bytes();
        assert_eq!(bytes, [192, 168, 4, 0, 255, 255, 252, 0]);
        assert_eq!(Ipv4Route::from_bytes(bytes), route);
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let table = RouteTable::new();
        let pool = PacketPool::new(4, 64);
        let (wide, mut wide_rx) = packet_queue(4);
        let (narrow, mut narrow_rx) = packet_queue(4);

        table.add_route("10.0.0.0/16".parse().unwrap(), wide);
        table.add_route("10.0.1.0/24".parse().unwrap(), narrow);

        table
            .route_packet(ipv4_frame(&pool, Ipv4Addr::new(10, 0, 1, 9)))
            .await;
        assert_eq!(wide_rx.len(), 1);
        assert!(narrow_rx.try_recv().is_none());
        drop(wide_rx.try_recv());
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn test_unrouted_packet_returned_to_pool() {
        let table = RouteTable::new();
        let pool = PacketPool::new(2, 64);
        let (queue, rx) = packet_queue(4);
        table.add_route("10.0.1.0/24".parse().unwrap(), queue);

        table
            .route_packet(ipv4_frame(&pool, Ipv4Addr::new(172, 16, 0, 1)))
            .await;
        assert!(rx.is_empty());
        assert_eq!(pool.available(), 2);

        let mut runt = pool.try_acquire().unwrap();
        runt.set_len(20);
        table.route_packet(runt).await;
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_remove_route_by_handle() {
        let table = RouteTable::new();
        let (q1, _rx1) = packet_queue(1);
        let (q2, _rx2) = packet_queue(1);
        let route: Ipv4Route = "10.0.1.0/24".parse().unwrap();

        let h1 = table.add_route(route, q1);
        let h2 = table.add_route(route, q2);
        assert_eq!(table.routes().len(), 2);

        assert_eq!(table.remove_route(h1), Some(route));
        let remaining = table.routes();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].handle(), h2);

        assert_eq!(table.remove_route(h1), None);
        assert_eq!(table.routes().len(), 1);
    }

    #[test]
    fn test_old_snapshot_unchanged() {
        let table = RouteTable::new();
        let (q, _rx) = packet_queue(1);
        let before = table.routes();
        table.add_route("10.0.1.0/24".parse().unwrap(), q);
        assert!(before.is_empty());
        assert_eq!(table.routes().len(), 1);
    }

    #[test]
    fn test_listener_gets_current_snapshot() {
        let table = RouteTable::new();
        let (q, _rx) = packet_queue(1);
        table.add_route("10.0.1.0/24".parse().unwrap(), q);

        let (tx, mut rx) = mpsc::unbounded_channel();
        table.add_listener(tx);
        let first = rx.try_recv().unwrap();
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn test_listener_notified_on_changes() {
        let table = RouteTable::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.add_listener(tx);
        assert!(rx.try_recv().unwrap().is_empty());

        let (q, _qrx) = packet_queue(1);
        let handle = table.add_route("10.0.2.0/24".parse().unwrap(), q);
        assert_eq!(rx.try_recv().unwrap().len(), 1);

        table.remove_route(handle);
        assert!(rx.try_recv().unwrap().is_empty());

        // no-op removal publishes nothing
        table.remove_route(handle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_listener_pruned() {
        let table = RouteTable::new();
        let (tx, rx) = mpsc::unbounded_channel();
        table.add_listener(tx);
        assert_eq!(table.listener_count(), 1);
        drop(rx);

        let (q, _qrx) = packet_queue(1);
        table.add_route("10.0.3.0/24".parse().unwrap(), q);
        assert_eq!(table.listener_count(), 0);
    }

    #[test]
    fn test_remove_listener() {
        let table = RouteTable::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = table.add_listener(tx);
        let _ = rx.try_recv();
        table.remove_listener(id);

        let (q, _qrx) = packet_queue(1);
        table.add_route("10.0.3.0/24".parse().unwrap(), q);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_updates_reach_listener_in_order() {
        let table = Arc::new(RouteTable::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.add_listener(tx);

        let writers: Vec<_> = (0..4u32)
            .map(|n| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for i in 0..50u32 {
                        let (q, _rx) = packet_queue(1);
                        let network = 0x0A00_0000 | (n << 16) | (i << 8);
                        let route = Ipv4Route::new(network, 0xFFFF_FF00);
                        let handle = table.add_route(route, q);
                        if i % 2 == 0 {
                            table.remove_route(handle);
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        // every snapshot differs from the previous one by a single entry
        let mut last = rx.try_recv().unwrap();
        assert!(last.is_empty());
        while let Ok(next) = rx.try_recv() {
            assert_eq!(next.len().abs_diff(last.len()), 1);
            last = next;
        }
        assert_eq!(last.len(), 100);
        assert_eq!(last.len(), table.routes().len());
        let final_ids: Vec<_> = table.routes().iter().map(|e| e.handle()).collect();
        let seen_ids: Vec<_> = last.iter().map(|e| e.handle()).collect();
        assert_eq!(final_ids, seen_ids);
    }

    #[test]
    fn test_route_guard_removes_on_drop() {
        let table = Arc::new(RouteTable::new());
        let (q, _rx) = packet_queue(1);
        {
            let _guard = RouteGuard::install(&table, "10.0.1.0/24".parse().unwrap(), q);
            assert_eq!(table.describe(), vec!["10.0.1.0/24".to_string()]);
        }
        assert!(table.routes().is_empty());
    }
}
