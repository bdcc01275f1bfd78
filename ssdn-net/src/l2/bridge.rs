use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use super::{L2_PORT_PREFIX, L2_TAP_TEMPLATE};
use crate::iface::{AttachError, BridgePort, FrameDevice, IfaceError, InterfaceProvider, port_name};
use crate::types::ConnectionDetails;

pub type Result<T> = std::result::Result<T, AttachError>;

#[derive(Default)]
struct Ports {
    /// Container to host-side port.
    attached: HashMap<String, String>,
    attaching: HashSet<String>,
    next_index: usize,
}

/// The tenant bridge: container ports plus one tap per link.
pub struct L2Bridge {
    name: String,
    provider: Arc<dyn InterfaceProvider>,
    ports: Mutex<Ports>,
}

impl L2Bridge {
    pub fn new(name: &str, provider: Arc<dyn InterfaceProvider>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            provider,
            ports: Mutex::new(Ports::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn start(&self) -> std::result::Result<(), IfaceError> {
        self.provider.create_bridge(&self.name).await?;
        info!(bridge = %self.name, "Created bridge");
        Ok(())
    }

    fn ports(&self) -> MutexGuard<'_, Ports> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a tap for a link and plug it into the bridge. The tap goes
    /// away when the returned device is dropped.
    pub async fn open_tap(&self) -> std::result::Result<Arc<dyn FrameDevice>, IfaceError> {
        let device = self.provider.create_tap(L2_TAP_TEMPLATE).await?;
        info!(device = %device.name(), bridge = %self.name, "Created layer 2 tap");
        self.provider
            .link_to_bridge(&self.name, device.name())
            .await?;
        Ok(device)
    }

    pub async fn attach(&self, container: &str) -> Result<()> {
        let local_iface = {
            let mut ports = self.ports();
            let busy = ports.attached.contains_key(container)
                || !ports.attaching.insert(container.to_string());
            if busy {
                return Err(AttachError::AlreadyAttached(container.to_string()));
            }
            let index = ports.next_index;
            ports.next_index += 1;
            port_name(L2_PORT_PREFIX, &self.name, index)
        };

        let port = BridgePort {
            bridge: self.name.clone(),
            container: container.to_string(),
            local_iface,
            address: None,
        };
        let result = self.provider.attach_port(&port).await;

        let mut ports = self.ports();
        ports.attaching.remove(container);
        result?;
        info!(container = %container, iface = %port.local_iface, "Attached container to bridge");
        ports.attached.insert(container.to_string(), port.local_iface);
        Ok(())
    }

    pub async fn detach(&self, container: &str) -> Result<()> {
        let local_iface = self
            .ports()
            .attached
            .remove(container)
            .ok_or_else(|| AttachError::NotAttached(container.to_string()))?;

        self.provider
            .detach_port(&BridgePort {
                bridge: self.name.clone(),
                container: container.to_string(),
                local_iface,
                address: None,
            })
            .await?;
        info!(container = %container, "Detached container from bridge");
        Ok(())
    }

    pub fn list_connections(&self) -> BTreeMap<String, ConnectionDetails> {
        self.ports()
            .attached
            .iter()
            .map(|(container, iface)| {
                (
                    container.clone(),
                    ConnectionDetails {
                        interface: Some(iface.clone()),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }
}
