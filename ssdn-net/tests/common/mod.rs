//! Shared helpers for loopback integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ssdn_net::address::Address;
use ssdn_net::packet::{ETHERNET_HEADER_SIZE, PacketBuffer, PacketPool};
use ssdn_net::peer::{InboundHandler, Listener, Peers};
use ssdn_net::route::{Ipv4Route, RouteTable};
use ssdn_net::tls::TlsConfig;
use ssdn_net::transport::TransportListener;
use tokio::task::JoinHandle;

pub const MTU: usize = 1500;

/// One overlay node listening on loopback.
pub struct TestNode {
    pub url: String,
    pub port: u16,
    pub subnet: Ipv4Route,
    pub routes: Arc<RouteTable>,
    pub peers: Arc<Peers>,
    listener: JoinHandle<()>,
}

impl TestNode {
    pub async fn spawn(subnet: &str) -> Self {
        Self::spawn_advertising(subnet, None).await
    }

    /// Spawn a node that advertises `public` instead of the loopback address.
    pub async fn spawn_advertising(subnet: &str, public: Option<Ipv4Addr>) -> Self {
        let bind = Address::parse("tcp://127.0.0.1:0").unwrap();
        let listener = TransportListener::bind(&bind, None).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut address = Address::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, false);
        if let Some(public) = public {
            address = address.with_public(IpAddr::V4(public));
        }
        let url = address.public_url();

        let subnet: Ipv4Route = subnet.parse().unwrap();
        let routes = Arc::new(RouteTable::new());
        let handler: Arc<dyn InboundHandler> = routes.clone();
        let peers = Peers::new(
            url.clone(),
            subnet,
            Arc::clone(&routes),
            TlsConfig::default(),
            MTU,
            Some(handler),
        );
        let listener = Listener::new(Arc::clone(&peers), listener).start();

        Self {
            url,
            port,
            subnet,
            routes,
            peers,
            listener,
        }
    }

    /// URL that reaches this node's listener.
    pub fn dial_url(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    pub fn stop(&self) {
        self.listener.abort();
        self.peers.stop_all();
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll `condition` every 10ms, failing the test after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn has_route(routes: &RouteTable, route: &str) -> bool {
    routes.describe().iter().any(|r| r == route)
}

/// An Ethernet-framed IPv4 packet addressed to `dst` with `payload_len`
/// bytes after the IP header's destination field.
pub async fn ip_packet(pool: &Arc<PacketPool>, dst: Ipv4Addr, fill: u8) -> PacketBuffer {
    let len = ETHERNET_HEADER_SIZE + 64;
    let mut packet = pool.acquire().await;
    let data = packet.data_mut();
    data[..len].fill(fill);
    data[12] = 0x08;
    data[13] = 0x00;
    data[14] = 0x45;
    data[30..34].copy_from_slice(&dst.octets());
    packet.set_len(len);
    packet
}
