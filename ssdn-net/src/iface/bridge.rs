//! Container attachments through the gateway's bridge.
//!
//! Each container gets a port on the bridge with its own overlay address
//! and a generated MAC. The gateway tap is seeded with that pair, so
//! packets for the container are routed to the tap and addressed without
//! an ARP round trip.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ipnet::Ipv4Net;
use tracing::{info, warn};

use super::provider::{BridgePort, InterfaceProvider, PortAddress};
use super::{AttachError, L3_PORT_PREFIX, L3Tap, port_name};
use crate::arp::{MacAddr, format_mac, parse_mac, random_mac};
use crate::ippool::AddressPool;
use crate::state::{Snapshot, State};
use crate::types::ConnectionDetails;

pub type Result<T> = std::result::Result<T, AttachError>;

struct Port {
    local_iface: String,
    ip: Ipv4Addr,
    mac: MacAddr,
}

#[derive(Default)]
struct Ports {
    attached: HashMap<String, Port>,
    /// Containers with an attach in flight.
    attaching: HashSet<String>,
    next_index: usize,
}

pub struct L3Bridge {
    tap: Arc<L3Tap>,
    provider: Arc<dyn InterfaceProvider>,
    pool: Arc<AddressPool>,
    network: Ipv4Net,
    state: Arc<State>,
    ports: Mutex<Ports>,
}

impl L3Bridge {
    pub fn new(
        tap: Arc<L3Tap>,
        provider: Arc<dyn InterfaceProvider>,
        pool: Arc<AddressPool>,
        network: Ipv4Net,
        state: Arc<State>,
    ) -> Self {
        Self {
            tap,
            provider,
            pool,
            network,
            state,
            ports: Mutex::new(Ports::default()),
        }
    }

    fn ports(&self) -> MutexGuard<'_, Ports> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give `container` a port on the bridge, at `ip` or the next free
    /// address.
    pub async fn attach(&self, container: &str, ip: Option<&str>) -> Result<()> {
        self.attach_with(container, ip, None).await
    }

    async fn attach_with(
        &self,
        container: &str,
        ip: Option<&str>,
        mac: Option<MacAddr>,
    ) -> Result<()> {
        let local_iface = {
            let mut ports = self.ports();
            let busy = ports.attached.contains_key(container)
                || !ports.attaching.insert(container.to_string());
            if busy {
                return Err(AttachError::AlreadyAttached(container.to_string()));
            }
            let index = ports.next_index;
            ports.next_index += 1;
            port_name(L3_PORT_PREFIX, self.tap.bridge(), index)
        };

        let result = self.add_port(container, local_iface, ip, mac).await;

        let mut ports = self.ports();
        ports.attaching.remove(container);
        let port = result?;
        info!(
            container = %container,
            iface = %port.local_iface,
            ip = %port.ip,
            mac = %format_mac(&port.mac),
            "Attached container to bridge"
        );
        ports.attached.insert(container.to_string(), port);
        self.state.update(snapshot(&ports.attached));
        Ok(())
    }

    async fn add_port(
        &self,
        container: &str,
        local_iface: String,
        ip: Option<&str>,
        mac: Option<MacAddr>,
    ) -> Result<Port> {
        let ip = match ip.filter(|ip| !ip.is_empty()) {
            Some(ip) => self.pool.acquire_from_str(ip)?,
            None => self.pool.next()?,
        };
        let addr = Ipv4Addr::from(ip);
        let mac = mac.unwrap_or_else(random_mac);

        let port = BridgePort {
            bridge: self.tap.bridge().to_string(),
            container: container.to_string(),
            local_iface,
            address: Some(PortAddress {
                ip_with_mask: format!("{}/{}", addr, self.network.prefix_len()),
                mac: format_mac(&mac),
                network: self.network.to_string(),
                gateway: self.tap.gateway_ip().to_string(),
            }),
        };
        if let Err(e) = self.provider.attach_port(&port).await {
            self.pool.release(ip);
            return Err(e.into());
        }

        self.tap.seed(addr, mac);
        Ok(Port {
            local_iface: port.local_iface,
            ip: addr,
            mac,
        })
    }

    /// Remove the container's port. The address and the gateway's entry
    /// for it are released even when the port cannot be removed.
    pub async fn detach(&self, container: &str) -> Result<()> {
        let port = {
            let mut ports = self.ports();
            let port = ports
                .attached
                .remove(container)
                .ok_or_else(|| AttachError::NotAttached(container.to_string()))?;
            self.state.update(snapshot(&ports.attached));
            port
        };

        let result = self
            .provider
            .detach_port(&BridgePort {
                bridge: self.tap.bridge().to_string(),
                container: container.to_string(),
                local_iface: port.local_iface,
                address: None,
            })
            .await;

        self.tap.unseed(port.ip);
        self.pool.release(u32::from(port.ip));
        result?;
        info!(container = %container, "Detached container from bridge");
        Ok(())
    }

    /// Re-attach the containers recorded in the state file, keeping their
    /// addresses and MACs.
    pub async fn restore(&self) -> Result<()> {
        let Some(saved) = self.state.load().await? else {
            return Ok(());
        };
        for (container, details) in saved.connections {
            let mac = details.mac.as_deref().and_then(parse_mac);
            match self.attach_with(&container, details.ip.as_deref(), mac).await {
                Ok(()) => info!(container = %container, "Reattached container"),
                Err(e) => warn!(container = %container, error = %e, "Failed to reattach"),
            }
        }
        Ok(())
    }

    pub fn list_connections(&self) -> BTreeMap<String, ConnectionDetails> {
        self.ports()
            .attached
            .iter()
            .map(|(container, port)| {
                (
                    container.clone(),
                    ConnectionDetails {
                        interface: Some(port.local_iface.clone()),
                        ip: Some(port.ip.to_string()),
                        mac: Some(format_mac(&port.mac)),
                    },
                )
            })
            .collect()
    }
}

fn snapshot(attached: &HashMap<String, Port>) -> Snapshot {
    Snapshot {
        connections: attached
            .iter()
            .map(|(container, port)| {
                (
                    container.clone(),
                    ConnectionDetails {
                        interface: None,
                        ip: Some(port.ip.to_string()),
                        mac: Some(format_mac(&port.mac)),
                    },
                )
            })
            .collect(),
    }
}
