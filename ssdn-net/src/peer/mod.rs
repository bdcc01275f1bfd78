//! Layer 3 peer mesh.
//!
//! Every node listens for peer links and dials the peers it is told about.
//! Both directions speak the same protocol (see [`protocol`]) and end in a
//! [`Relay`] that routes the remote's subnet over the link.

mod client;
mod listener;
pub mod protocol;
mod registry;
mod relay;

pub use client::PeerClient;
pub use listener::Listener;
pub use registry::{PeerError, Peers};
pub use relay::{DeliverFuture, InboundHandler, Relay};

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::types::PeerState;

/// Identity of a registry entry. Used to detect that an entry was replaced
/// between two operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A registry entry: an outbound client or an accepted inbound link.
#[derive(Clone)]
pub enum Peer {
    Client(Arc<PeerClient>),
    Inbound(Arc<Relay>),
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Client(client) => f.debug_tuple("Client").field(&client.id()).finish(),
            Peer::Inbound(relay) => f.debug_tuple("Inbound").field(&relay.id()).finish(),
        }
    }
}

impl Peer {
    pub fn id(&self) -> PeerId {
        match self {
            Peer::Client(client) => client.id(),
            Peer::Inbound(relay) => relay.id(),
        }
    }

    pub fn stop(&self) {
        match self {
            Peer::Client(client) => client.stop(),
            Peer::Inbound(relay) => relay.stop(),
        }
    }

    pub fn state(&self) -> PeerState {
        match self {
            Peer::Client(client) if client.connected() => PeerState::Connected,
            Peer::Client(_) => PeerState::Connecting,
            Peer::Inbound(_) => PeerState::Inbound,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Peer::Client(_))
    }
}
