use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{InboundHandler, Peer, PeerClient, PeerId, Relay};
use crate::address::{Address, AddressError};
use crate::route::{Ipv4Route, RouteTable};
use crate::tls::TlsConfig;
use crate::types::PeerDetails;

const PEER_TYPE: &str = "l3";

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("peer {0} requires TLS configuration")]
    TlsRequired(String),

    #[error("already connected to peer {0}")]
    AlreadyConnected(String),

    #[error("no such peer {0}")]
    NoSuchPeer(String),

    #[error("peer at {0} has been replaced")]
    Replaced(String),
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Registry of peer links keyed by peer URL.
///
/// Each URL maps to at most one entry. Entries are re-keyed in place when a
/// peer turns out to live at a different URL than it was configured with.
pub struct Peers {
    local_url: String,
    subnet: Ipv4Route,
    routes: Arc<RouteTable>,
    tls: TlsConfig,
    mtu: usize,
    handler: Option<Arc<dyn InboundHandler>>,

    peers: Mutex<HashMap<String, Peer>>,
    this: Weak<Peers>,
}

impl Peers {
    pub fn new(
        local_url: impl Into<String>,
        subnet: Ipv4Route,
        routes: Arc<RouteTable>,
        tls: TlsConfig,
        mtu: usize,
        handler: Option<Arc<dyn InboundHandler>>,
    ) -> Arc<Self> {
        let local_url = local_url.into();
        Arc::new_cyclic(|this| Self {
            local_url,
            subnet,
            routes,
            tls,
            mtu,
            handler,
            peers: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn local_url(&self) -> &str {
        &self.local_url
    }

    pub fn subnet(&self) -> Ipv4Route {
        self.subnet
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub(super) fn new_relay(&self) -> Relay {
        Relay::new(Arc::clone(&self.routes), self.handler.clone(), self.mtu)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start dialing the peer at `url`.
    pub fn add_peer(&self, url: &str) -> Result<()> {
        let address = Address::parse(url)?;
        if address.tls() && self.tls.connector().is_none() {
            return Err(PeerError::TlsRequired(url.to_string()));
        }

        // cheap duplicate check before building the client
        if self.lock().contains_key(url) {
            return Err(PeerError::AlreadyConnected(url.to_string()));
        }
        let Some(this) = self.this.upgrade() else {
            return Err(PeerError::NoSuchPeer(url.to_string()));
        };

        let client = PeerClient::new(&this, url, address);
        {
            let mut peers = self.lock();
            if peers.contains_key(url) {
                return Err(PeerError::AlreadyConnected(url.to_string()));
            }
            peers.insert(url.to_string(), Peer::Client(Arc::clone(&client)));
        }

        client.start();
        info!(peer = %url, "Added peer");
        Ok(())
    }

    /// Remove the peer at `url` and shut it down.
    pub fn delete_peer(&self, url: &str) -> Result<()> {
        let peer = self.remove_peer(url, None)?;
        peer.stop();
        info!(peer = %url, "Deleted peer");
        Ok(())
    }

    /// Remove the entry at `url`. With `expected` set, only that exact entry
    /// is removed.
    pub fn remove_peer(&self, url: &str, expected: Option<PeerId>) -> Result<Peer> {
        let mut peers = self.lock();
        let current = peers
            .get(url)
            .ok_or_else(|| PeerError::NoSuchPeer(url.to_string()))?;
        if expected.is_some_and(|id| current.id() != id) {
            return Err(PeerError::Replaced(url.to_string()));
        }
        peers
            .remove(url)
            .ok_or_else(|| PeerError::NoSuchPeer(url.to_string()))
    }

    /// Move the entry `id` from `old_url` to `new_url`.
    ///
    /// Nothing changes unless the move succeeds.
    pub fn update_peer(&self, old_url: &str, new_url: &str, id: PeerId) -> Result<()> {
        let mut peers = self.lock();
        let current = peers
            .get(old_url)
            .ok_or_else(|| PeerError::NoSuchPeer(old_url.to_string()))?;
        if current.id() != id {
            return Err(PeerError::Replaced(old_url.to_string()));
        }
        if peers.contains_key(new_url) {
            return Err(PeerError::AlreadyConnected(new_url.to_string()));
        }
        if let Some(peer) = peers.remove(old_url) {
            peers.insert(new_url.to_string(), peer);
        }
        debug!(old = %old_url, new = %new_url, "Re-keyed peer");
        Ok(())
    }

    /// Register an accepted link from the peer at `url`.
    ///
    /// When both nodes dial each other, the node with the lower URL keeps its
    /// outbound client and refuses the inbound link; the other node drops
    /// its client in favor of the inbound one. Returns false if the link was
    /// refused.
    pub fn register_inbound(&self, url: &str, relay: Arc<Relay>) -> bool {
        if url == self.local_url {
            warn!("Refusing inbound connection from self");
            return false;
        }

        let replaced = {
            let mut peers = self.lock();
            let has_client = peers.get(url).is_some_and(Peer::is_client);
            if has_client && self.local_url.as_str() < url {
                info!(peer = %url, "Keeping outbound connection; refusing inbound");
                return false;
            }
            peers.insert(url.to_string(), Peer::Inbound(relay))
        };

        if let Some(replaced) = replaced {
            warn!(peer = %url, "Inbound peer replaced existing peer");
            replaced.stop();
        }
        true
    }

    /// Remove an inbound entry once its link has ended. Leaves the key alone
    /// if it now belongs to a different entry.
    pub fn drop_peer(&self, url: &str, id: PeerId) {
        let mut peers = self.lock();
        if peers.get(url).is_some_and(|p| p.id() == id) {
            peers.remove(url);
            debug!(peer = %url, "Dropped peer");
        }
    }

    pub fn list_peers(&self) -> BTreeMap<String, PeerDetails> {
        self.lock()
            .iter()
            .map(|(url, peer)| {
                (
                    url.clone(),
                    PeerDetails {
                        kind: PEER_TYPE.to_string(),
                        state: peer.state(),
                        interface: None,
                    },
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.lock().contains_key(url)
    }

    /// Reconcile outbound peers with a discovered set of URLs.
    ///
    /// Inbound links are left alone; their lifetime follows the connection.
    pub fn update_peers(&self, urls: &HashSet<String>) {
        for url in urls {
            if url == &self.local_url || self.contains(url) {
                continue;
            }
            if let Err(e) = self.add_peer(url) {
                warn!(peer = %url, error = %e, "Failed to add peer");
            }
        }

        let stale: Vec<(String, PeerId)> = self
            .lock()
            .iter()
            .filter(|(url, peer)| peer.is_client() && !urls.contains(*url))
            .map(|(url, peer)| (url.clone(), peer.id()))
            .collect();
        for (url, id) in stale {
            match self.remove_peer(&url, Some(id)) {
                Ok(peer) => {
                    peer.stop();
                    info!(peer = %url, "Removed peer no longer in registry");
                }
                Err(e) => warn!(peer = %url, error = %e, "Failed to remove peer"),
            }
        }
    }

    /// Stop every peer and empty the registry.
    pub fn stop_all(&self) {
        let peers: Vec<(String, Peer)> = self.lock().drain().collect();
        for (url, peer) in peers {
            debug!(peer = %url, "Stopping peer");
            peer.stop();
        }
    }
}
