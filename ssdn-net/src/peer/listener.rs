use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::Peers;
use super::protocol::{L3_HELLO, Result, handshake, read_peer_info, write_peer_info};
use crate::transport::TransportListener;

/// Accepts inbound peer links.
pub struct Listener {
    peers: Arc<Peers>,
    listener: Arc<TransportListener>,
}

impl Listener {
    pub fn new(peers: Arc<Peers>, listener: TransportListener) -> Self {
        Self {
            peers,
            listener: Arc::new(listener),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept loop. Each connection is served on its own task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop())
    }

    async fn accept_loop(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Listening for peers"),
            Err(e) => warn!(error = %e, "Listening for peers on unknown address"),
        }

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept incoming connection");
                    return;
                }
            };

            let peers = Arc::clone(&self.peers);
            let listener = Arc::clone(&self.listener);
            tokio::spawn(async move {
                if let Err(e) = serve(&peers, &listener, stream, remote).await {
                    warn!(remote = %remote, error = %e, "Failed to serve inbound connection");
                }
                info!(remote = %remote, "Peer disconnected");
            });
        }
    }
}

async fn serve(
    peers: &Peers,
    listener: &TransportListener,
    stream: TcpStream,
    remote: SocketAddr,
) -> Result<()> {
    let stream = listener.upgrade(stream).await?;

    let (mut reader, mut writer) = handshake(stream, L3_HELLO).await?;
    write_peer_info(&mut writer, peers.local_url(), &peers.subnet()).await?;
    let (remote_url, remote_subnet) = read_peer_info(&mut reader).await?;
    info!(
        remote = %remote,
        peer = %remote_url,
        subnet = %remote_subnet,
        "Inbound connection"
    );

    let relay = Arc::new(peers.new_relay());
    if !peers.register_inbound(&remote_url, Arc::clone(&relay)) {
        return Ok(());
    }

    let result = relay.forward(remote_subnet, reader, writer, None).await;
    peers.drop_peer(&remote_url, relay.id());
    result
}
