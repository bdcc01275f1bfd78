//! Container attachments: one tun per container, each with its own address.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ipnet::Ipv4Net;
use tracing::{info, warn};

use super::AttachError;
use super::provider::InterfaceProvider;
use super::tun::L3Tun;
use crate::ippool::AddressPool;
use crate::route::RouteTable;
use crate::state::{Snapshot, State};
use crate::types::ConnectionDetails;

pub type Result<T> = std::result::Result<T, AttachError>;

pub struct L3Tuns {
    routes: Arc<RouteTable>,
    provider: Arc<dyn InterfaceProvider>,
    pool: Arc<AddressPool>,
    /// Containers see the whole overlay network on their interface.
    network: Ipv4Net,
    mtu: usize,
    state: Arc<State>,
    connections: Mutex<HashMap<String, Arc<L3Tun>>>,
}

impl L3Tuns {
    pub fn new(
        routes: Arc<RouteTable>,
        provider: Arc<dyn InterfaceProvider>,
        pool: Arc<AddressPool>,
        network: Ipv4Net,
        mtu: usize,
        state: Arc<State>,
    ) -> Self {
        Self {
            routes,
            provider,
            pool,
            network,
            mtu,
            state,
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<String, Arc<L3Tun>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Give `container` an overlay interface, at `ip` or the next free
    /// address.
    pub async fn attach(&self, container: &str, ip: Option<&str>) -> Result<()> {
        if self.connections().contains_key(container) {
            return Err(AttachError::AlreadyAttached(container.to_string()));
        }

        let ip = match ip.filter(|ip| !ip.is_empty()) {
            Some(ip) => self.pool.acquire_from_str(ip)?,
            None => self.pool.next()?,
        };
        let addr = Ipv4Addr::from(ip);
        let ip_with_mask = format!("{}/{}", addr, self.network.prefix_len());

        let tun = L3Tun::new(
            container,
            addr,
            ip_with_mask,
            Arc::clone(&self.routes),
            Arc::clone(&self.provider),
            self.mtu,
        );
        if let Err(e) = tun.start().await {
            self.pool.release(ip);
            return Err(e.into());
        }

        let mut connections = self.connections();
        if connections.contains_key(container) {
            drop(connections);
            tun.stop();
            self.pool.release(ip);
            return Err(AttachError::AlreadyAttached(container.to_string()));
        }
        connections.insert(container.to_string(), tun);
        self.state.update(snapshot(&connections));
        info!(container = %container, ip = %addr, "Attached container");
        Ok(())
    }

    pub fn detach(&self, container: &str) -> Result<()> {
        let tun = {
            let mut connections = self.connections();
            let tun = connections
                .remove(container)
                .ok_or_else(|| AttachError::NotAttached(container.to_string()))?;
            self.state.update(snapshot(&connections));
            tun
        };

        tun.stop();
        self.pool.release(u32::from(tun.ip()));
        info!(container = %container, "Detached container");
        Ok(())
    }

    /// Converge on `wanted` (container to requested IP). Failures are logged
    /// per container.
    pub async fn update_connections(&self, wanted: &HashMap<String, Option<String>>) {
        let (removed, added): (Vec<String>, Vec<(String, Option<String>)>) = {
            let connections = self.connections();
            let removed = connections
                .keys()
                .filter(|c| !wanted.contains_key(*c))
                .cloned()
                .collect();
            let added = wanted
                .iter()
                .filter(|(c, _)| !connections.contains_key(*c))
                .map(|(c, ip)| (c.clone(), ip.clone()))
                .collect();
            (removed, added)
        };

        for container in removed {
            info!(container = %container, "Removing obsolete container");
            if let Err(e) = self.detach(&container) {
                warn!(container = %container, error = %e, "Failed to detach from container");
            }
        }

        for (container, ip) in added {
            info!(container = %container, "Discovered container");
            if let Err(e) = self.attach(&container, ip.as_deref()).await {
                warn!(container = %container, error = %e, "Failed to attach to container");
            }
        }
    }

    /// Re-attach the containers recorded in the state file.
    pub async fn restore(&self) -> Result<()> {
        let Some(saved) = self.state.load().await? else {
            return Ok(());
        };
        for (container, details) in saved.connections {
            match self.attach(&container, details.ip.as_deref()).await {
                Ok(()) => info!(container = %container, "Reattached container"),
                Err(e) => warn!(container = %container, error = %e, "Failed to reattach"),
            }
        }
        Ok(())
    }

    pub fn list_connections(&self) -> BTreeMap<String, ConnectionDetails> {
        self.connections()
            .iter()
            .map(|(container, tun)| {
                (
                    container.clone(),
                    ConnectionDetails {
                        interface: tun.interface(),
                        ip: Some(tun.ip().to_string()),
                        mac: None,
                    },
                )
            })
            .collect()
    }

    pub fn stop_all(&self) {
        for tun in self.connections().values() {
            tun.stop();
        }
    }
}

/// The persisted form records the address only; interface names change
/// across restarts.
fn snapshot(connections: &HashMap<String, Arc<L3Tun>>) -> Snapshot {
    Snapshot {
        connections: connections
            .iter()
            .map(|(container, tun)| {
                (
                    container.clone(),
                    ConnectionDetails {
                        ip: Some(tun.ip().to_string()),
                        ..Default::default()
                    },
                )
            })
            .collect(),
    }
}
