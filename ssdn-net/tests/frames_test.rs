//! Link framing integration tests over loopback TCP.

mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use common::{MTU, TestNode, has_route, ip_packet, wait_until};
use ssdn_net::address::Address;
use ssdn_net::packet::{ETHERNET_HEADER_SIZE, PacketPool, packet_queue};
use ssdn_net::peer::protocol::{
    L3_HELLO, frame_header, handshake, read_peer_info, write_peer_info,
};
use ssdn_net::route::Ipv4Route;
use ssdn_net::transport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

/// A frame longer than the MTU tears the link down and withdraws the
/// sender's route.
#[tokio::test]
async fn test_oversize_frame_closes_link() {
    let _ = tracing_subscriber::fmt::try_init();

    let a = TestNode::spawn("10.0.1.0/24").await;

    let address = Address::parse(&a.dial_url()).unwrap();
    let stream = transport::dial(&address, None).await.unwrap();
    let (mut reader, mut writer) = handshake(stream, L3_HELLO).await.unwrap();

    let (url, subnet) = read_peer_info(&mut reader).await.unwrap();
    assert_eq!(url, a.url);
    assert_eq!(subnet, a.subnet);

    let remote: Ipv4Route = "10.0.9.0/24".parse().unwrap();
    write_peer_info(&mut writer, "tcp://127.0.0.1:1", &remote)
        .await
        .unwrap();
    wait_until("A to learn the raw peer's subnet", || {
        has_route(&a.routes, "10.0.9.0/24")
    })
    .await;
    assert!(a.peers.contains("tcp://127.0.0.1:1"));

    writer.write_all(&frame_header(MTU + 1, false)).await.unwrap();
    writer.write_all(&vec![0u8; MTU + 1]).await.unwrap();
    writer.flush().await.unwrap();

    wait_until("A to drop the raw peer", || {
        !has_route(&a.routes, "10.0.9.0/24") && !a.peers.contains("tcp://127.0.0.1:1")
    })
    .await;

    // A has closed its end; reads drain to EOF.
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), reader.read_to_end(&mut rest))
        .await
        .unwrap()
        .ok();
}

/// Every buffer handed to the mesh comes back to its pool, so a small pool
/// can carry many more packets than it holds.
#[tokio::test]
async fn test_buffers_are_conserved() {
    let _ = tracing_subscriber::fmt::try_init();

    let a = TestNode::spawn("10.0.1.0/24").await;
    let b = TestNode::spawn("10.0.2.0/24").await;
    a.peers.add_peer(&b.url).unwrap();
    wait_until("A to learn B's subnet", || has_route(&a.routes, "10.0.2.0/24")).await;

    let (container, mut container_rx) = packet_queue(8);
    b.routes.add_route("10.0.2.7/32".parse().unwrap(), container);

    const PACKETS: usize = 200;
    let pool = PacketPool::new(8, ETHERNET_HEADER_SIZE + MTU);

    let sender = {
        let pool = pool.clone();
        let routes = a.routes.clone();
        tokio::spawn(async move {
            for i in 0..PACKETS {
                let packet = ip_packet(&pool, Ipv4Addr::new(10, 0, 2, 7), i as u8).await;
                routes.route_packet(packet).await;
            }
        })
    };

    for i in 0..PACKETS {
        let packet = timeout(Duration::from_secs(5), container_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet[ETHERNET_HEADER_SIZE + 1], i as u8);
    }
    timeout(Duration::from_secs(5), sender).await.unwrap().unwrap();

    wait_until("all buffers to return", || pool.available() == pool.capacity()).await;
}
