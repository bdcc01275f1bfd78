//! Overlay network node.
//!
//! In layer 3 mode nodes exchange IPv4 packets over persistent TCP (or TLS)
//! links. Each node owns one subnet of the overlay network and advertises
//! it to its peers; packets are routed to whichever link announced the
//! destination's subnet. In layer 2 mode whole Ethernet frames are carried
//! between taps on each node's tenant bridge.

pub mod address;
pub mod arp;
pub mod config;
pub mod control;
pub mod iface;
pub mod ippool;
pub mod l2;
pub mod packet;
pub mod peer;
pub mod reconnect;
pub mod route;
pub mod state;
mod task;
pub mod tls;
pub mod transport;
pub mod types;
