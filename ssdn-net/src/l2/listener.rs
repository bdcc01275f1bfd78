use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{L2Bridge, forward_frames};
use crate::peer::protocol::{L2_HELLO, Result, handshake};
use crate::transport::TransportListener;

/// Accepts inbound layer 2 links, each onto its own tap.
pub struct L2Listener {
    bridge: Arc<L2Bridge>,
    listener: TransportListener,
    /// Remote address to tap name.
    clients: Mutex<BTreeMap<SocketAddr, String>>,
}

impl L2Listener {
    pub fn new(bridge: Arc<L2Bridge>, listener: TransportListener) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            listener,
            clients: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Connected clients and the tap serving each.
    pub fn clients(&self) -> BTreeMap<String, String> {
        self.lock()
            .iter()
            .map(|(addr, tap)| (addr.to_string(), tap.clone()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SocketAddr, String>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).accept_loop())
    }

    async fn accept_loop(self: Arc<Self>) {
        match self.listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Listening for layer 2 clients"),
            Err(e) => warn!(error = %e, "Listening for layer 2 clients on unknown address"),
        }

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept incoming connection");
                    return;
                }
            };

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                info!(remote = %remote, "Inbound connection");
                if let Err(e) = this.serve(stream, remote).await {
                    warn!(remote = %remote, error = %e, "Failed to serve inbound connection");
                }
                this.lock().remove(&remote);
                info!(remote = %remote, "Client disconnected");
            });
        }
    }

    async fn serve(&self, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let stream = self.listener.upgrade(stream).await?;
        let (reader, writer) = handshake(stream, L2_HELLO).await?;
        let device = self.bridge.open_tap().await.map_err(io::Error::other)?;

        self.lock().insert(remote, device.name().to_string());
        forward_frames(device, reader, writer, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::iface::memory::{DeviceEnd, MemoryProvider};
    use crate::l2::L2Uplinks;
    use crate::tls::TlsConfig;
    use crate::types::PeerState;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn wait_for_end(provider: &MemoryProvider) -> DeviceEnd {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(end) = provider.take_end() {
                    return end;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    async fn next_frame(end: &mut DeviceEnd) -> Vec<u8> {
        timeout(Duration::from_secs(5), end.written.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_uplink_to_listener_bridges_frames() {
        let server_provider = MemoryProvider::new();
        let server_bridge = L2Bridge::new("acme", server_provider.clone());
        let bind = Address::parse("tcp://127.0.0.1:0").unwrap();
        let listener = L2Listener::new(
            Arc::clone(&server_bridge),
            TransportListener::bind(&bind, None).await.unwrap(),
        );
        let port = listener.local_addr().unwrap().port();
        let accept = listener.start();

        let client_provider = MemoryProvider::new();
        let uplinks = L2Uplinks::new(
            L2Bridge::new("acme", client_provider.clone()),
            TlsConfig::default(),
        );
        let url = format!("tcp://127.0.0.1:{port}");
        uplinks.add_uplink(&url).unwrap();

        let mut server_end = wait_for_end(&server_provider).await;
        let mut client_end = wait_for_end(&client_provider).await;
        let frame: Vec<u8> = (0..60).collect();
        client_end.inject.send(frame.clone()).unwrap();
        assert_eq!(next_frame(&mut server_end).await, frame);

        let reply: Vec<u8> = (0..60).rev().collect();
        server_end.inject.send(reply.clone()).unwrap();
        assert_eq!(next_frame(&mut client_end).await, reply);

        assert_eq!(server_provider.calls(), vec!["link acme sf2.tap0"]);
        assert_eq!(client_provider.calls(), vec!["link acme sf2.tap0"]);

        let listed = uplinks.list_uplinks();
        assert_eq!(listed[&url].state, PeerState::Connected);
        assert_eq!(listed[&url].interface.as_deref(), Some("sf2.tap0"));
        let clients = listener.clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients.values().next().map(String::as_str), Some("sf2.tap0"));

        uplinks.stop_all();
        timeout(Duration::from_secs(5), async {
            while !listener.clients().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        accept.abort();
    }
}
