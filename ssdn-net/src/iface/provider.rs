use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use super::device::{DeviceKind, FrameDevice, TunTapDevice};
use super::invoker::ActionInvoker;
use super::{CONTAINER_IFACE, IfaceError};

pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, IfaceError>> + Send + 'a>>;

/// Addressing a routed bridge hands to a container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAddress {
    pub ip_with_mask: String,
    pub mac: String,
    pub network: String,
    pub gateway: String,
}

/// A container's port on a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePort {
    pub bridge: String,
    pub container: String,
    /// Host side of the container's link.
    pub local_iface: String,
    /// Layer 2 ports carry no addressing.
    pub address: Option<PortAddress>,
}

/// Creates virtual interfaces and wires them into the host.
///
/// Device name templates end in `%d`, which the kernel replaces with the
/// first free index.
pub trait InterfaceProvider: Send + Sync + 'static {
    fn create_tap<'a>(&'a self, template: &'a str) -> ProviderFuture<'a, Arc<dyn FrameDevice>>;
    fn create_tun<'a>(&'a self, template: &'a str) -> ProviderFuture<'a, Arc<dyn FrameDevice>>;
    fn create_bridge<'a>(&'a self, bridge: &'a str) -> ProviderFuture<'a, ()>;
    fn link_to_bridge<'a>(&'a self, bridge: &'a str, tap: &'a str) -> ProviderFuture<'a, ()>;

    /// Give a container a port on a bridge.
    fn attach_port<'a>(&'a self, port: &'a BridgePort) -> ProviderFuture<'a, ()>;
    fn detach_port<'a>(&'a self, port: &'a BridgePort) -> ProviderFuture<'a, ()>;

    /// Move `iface` into the container's namespace as the overlay interface.
    fn inject<'a>(
        &'a self,
        container: &'a str,
        iface: &'a str,
        ip_with_mask: &'a str,
    ) -> ProviderFuture<'a, ()>;

    /// Configure `iface` as the host's own overlay interface.
    fn init_host<'a>(
        &'a self,
        iface: &'a str,
        ip_with_mask: &'a str,
        alternate_networks: &'a [String],
    ) -> ProviderFuture<'a, ()>;
}

/// Kernel devices configured through action scripts.
pub struct OsInterfaces {
    invoker: ActionInvoker,
    mtu: String,
}

impl OsInterfaces {
    pub fn new(actions_dir: impl Into<PathBuf>, mtu: usize) -> Self {
        Self {
            invoker: ActionInvoker::new(actions_dir),
            mtu: mtu.to_string(),
        }
    }

    fn open(kind: DeviceKind, template: &str) -> Result<Arc<dyn FrameDevice>, IfaceError> {
        Ok(Arc::new(TunTapDevice::open(kind, template)?))
    }
}

impl InterfaceProvider for OsInterfaces {
    fn create_tap<'a>(&'a self, template: &'a str) -> ProviderFuture<'a, Arc<dyn FrameDevice>> {
        Box::pin(async move { Self::open(DeviceKind::Tap, template) })
    }

    fn create_tun<'a>(&'a self, template: &'a str) -> ProviderFuture<'a, Arc<dyn FrameDevice>> {
        Box::pin(async move { Self::open(DeviceKind::Tun, template) })
    }

    fn create_bridge<'a>(&'a self, bridge: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoker.execute("create", &[bridge]).await?;
            Ok(())
        })
    }

    fn link_to_bridge<'a>(&'a self, bridge: &'a str, tap: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoker
                .execute("link", &[bridge, self.mtu.as_str(), tap])
                .await?;
            Ok(())
        })
    }

    fn attach_port<'a>(&'a self, port: &'a BridgePort) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut args = vec![
                port.bridge.as_str(),
                self.mtu.as_str(),
                port.container.as_str(),
                port.local_iface.as_str(),
                CONTAINER_IFACE,
            ];
            if let Some(address) = &port.address {
                args.extend([
                    address.ip_with_mask.as_str(),
                    address.mac.as_str(),
                    address.network.as_str(),
                    address.gateway.as_str(),
                ]);
            }
            self.invoker.execute("attach", &args).await?;
            Ok(())
        })
    }

    fn detach_port<'a>(&'a self, port: &'a BridgePort) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoker
                .execute("detach", &[port.bridge.as_str(), port.local_iface.as_str()])
                .await?;
            Ok(())
        })
    }

    fn inject<'a>(
        &'a self,
        container: &'a str,
        iface: &'a str,
        ip_with_mask: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoker
                .execute(
                    "inject",
                    &[
                        self.mtu.as_str(),
                        container,
                        iface,
                        CONTAINER_IFACE,
                        ip_with_mask,
                    ],
                )
                .await?;
            Ok(())
        })
    }

    fn init_host<'a>(
        &'a self,
        iface: &'a str,
        ip_with_mask: &'a str,
        alternate_networks: &'a [String],
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let alternates = alternate_networks.join(" ");
            self.invoker
                .execute(
                    "init",
                    &[self.mtu.as_str(), iface, ip_with_mask, alternates.as_str()],
                )
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn recording_actions(dir: &std::path::Path) {
        for action in ["create", "link", "attach", "detach", "inject", "init"] {
            let path = dir.join(action);
            let log = dir.join("calls.log");
            fs::write(
                &path,
                format!("#!/bin/sh\necho \"{action} $*\" >> {}\n", log.display()),
            )
            .unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_action_arguments() {
        let dir = tempfile::tempdir().unwrap();
        recording_actions(dir.path());
        let os = OsInterfaces::new(dir.path(), 1500);

        os.create_bridge("br0").await.unwrap();
        os.link_to_bridge("br0", "sl3.tap0").await.unwrap();
        os.inject("web", "sl3.tun0", "10.0.1.5/24").await.unwrap();
        os.init_host(
            "sl3.tun1",
            "10.0.1.254/24",
            &["10.0.0.0/16".to_string(), "10.1.0.0/16".to_string()],
        )
        .await
        .unwrap();

        let routed = BridgePort {
            bridge: "acme".to_string(),
            container: "web".to_string(),
            local_iface: "sf3.acme.0".to_string(),
            address: Some(PortAddress {
                ip_with_mask: "10.0.1.5/16".to_string(),
                mac: "02:00:00:00:00:05".to_string(),
                network: "10.0.0.0/16".to_string(),
                gateway: "10.0.1.254".to_string(),
            }),
        };
        os.attach_port(&routed).await.unwrap();
        os.detach_port(&routed).await.unwrap();
        let bridged = BridgePort {
            local_iface: "sf2.acme.0".to_string(),
            address: None,
            ..routed
        };
        os.attach_port(&bridged).await.unwrap();

        let calls = fs::read_to_string(dir.path().join("calls.log")).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            vec![
                "create br0",
                "link br0 1500 sl3.tap0",
                "inject 1500 web sl3.tun0 eth1 10.0.1.5/24",
                "init 1500 sl3.tun1 10.0.1.254/24 10.0.0.0/16 10.1.0.0/16",
                "attach acme 1500 web sf3.acme.0 eth1 10.0.1.5/16 02:00:00:00:00:05 10.0.0.0/16 10.0.1.254",
                "detach acme sf3.acme.0",
                "attach acme 1500 web sf2.acme.0 eth1",
            ]
        );
    }
}
