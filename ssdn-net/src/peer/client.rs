use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{info, warn};

use super::protocol::{L3_HELLO, Result, handshake, read_peer_info, write_peer_info};
use super::{PeerId, Peers, Relay};
use crate::address::Address;
use crate::reconnect::{AbortSignal, ConnectionHandler, HandlerFuture, ReconnectClient};
use crate::transport::BoxedStream;

/// Outbound link to a configured peer URL.
///
/// The configured URL is replaced by the one the remote reports about
/// itself once the first connection is up.
pub struct PeerClient {
    relay: Relay,
    remote_url: Mutex<String>,
    client: ReconnectClient,
    peers: Weak<Peers>,
}

struct ClientHandler {
    client: Weak<PeerClient>,
}

impl ConnectionHandler for ClientHandler {
    fn handle(&self, stream: BoxedStream, abort: AbortSignal) -> HandlerFuture {
        let client = self.client.upgrade();
        Box::pin(async move {
            match client {
                Some(client) => client.run(stream, abort).await,
                None => Ok(()),
            }
        })
    }
}

impl PeerClient {
    pub(super) fn new(peers: &Arc<Peers>, url: &str, address: Address) -> Arc<Self> {
        let tls = if address.tls() {
            peers.tls().connector().cloned()
        } else {
            None
        };
        Arc::new_cyclic(|this: &Weak<PeerClient>| {
            let handler = Arc::new(ClientHandler {
                client: this.clone(),
            });
            Self {
                relay: peers.new_relay(),
                remote_url: Mutex::new(url.to_string()),
                client: ReconnectClient::new(address, tls, handler),
                peers: Arc::downgrade(peers),
            }
        })
    }

    pub fn id(&self) -> PeerId {
        self.relay.id()
    }

    pub fn start(&self) {
        self.client.start();
    }

    pub fn stop(&self) {
        self.client.stop();
    }

    pub fn connected(&self) -> bool {
        self.client.connected()
    }

    /// The URL this client is currently registered under.
    pub fn remote_url(&self) -> String {
        self.remote_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run(self: Arc<Self>, stream: BoxedStream, abort: AbortSignal) -> Result<()> {
        let Some(peers) = self.peers.upgrade() else {
            return Ok(());
        };

        let (mut reader, mut writer) = handshake(stream, L3_HELLO).await?;
        let (remote_url, remote_subnet) = read_peer_info(&mut reader).await?;
        info!(peer = %remote_url, subnet = %remote_subnet, "Connected to peer");

        let configured = self.remote_url();
        if remote_url == peers.local_url() {
            warn!(peer = %configured, "Dropping redundant connection to self");
            if let Err(e) = peers.remove_peer(&configured, Some(self.id())) {
                warn!(error = %e, "Failed to prune connection to self");
            }
            self.stop();
            return Ok(());
        }

        if configured != remote_url {
            info!(configured = %configured, actual = %remote_url, "Peer reported a different address");
            if let Err(e) = peers.update_peer(&configured, &remote_url, self.id()) {
                warn!(error = %e, "Failed to update connection URL");
                self.stop();
                return Ok(());
            }
            *self.remote_url.lock().unwrap_or_else(PoisonError::into_inner) = remote_url;
        }

        write_peer_info(&mut writer, peers.local_url(), &peers.subnet()).await?;

        self.relay
            .forward(remote_subnet, reader, writer, Some(abort))
            .await
    }
}
