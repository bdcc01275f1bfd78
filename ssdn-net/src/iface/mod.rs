//! Virtual interfaces that connect local endpoints to the overlay.

mod bridge;
mod device;
mod invoker;
#[cfg(test)]
pub(crate) mod memory;
mod provider;
mod tap;
mod tun;
mod tuns;

use std::io;

use thiserror::Error;

use crate::ippool::PoolError;
use crate::state::StateError;

pub use device::{DeviceFuture, DeviceKind, FrameDevice, TunTapDevice};
pub use invoker::{ActionInvoker, InvokeError};
pub use bridge::L3Bridge;
pub use provider::{BridgePort, InterfaceProvider, OsInterfaces, PortAddress, ProviderFuture};
pub use tap::L3Tap;
pub use tun::{ForwardExit, HostTun, L3Tun, forward_tun};
pub use tuns::L3Tuns;

pub const TUN_NAME_TEMPLATE: &str = "sl3.tun%d";
pub const TAP_NAME_TEMPLATE: &str = "sl3.tap%d";

/// Host side of a routed bridge port: bridge name, then port index.
pub const L3_PORT_PREFIX: &str = "sf3";

/// Name of the overlay interface inside a container.
pub const CONTAINER_IFACE: &str = "eth1";

#[derive(Debug, Error)]
pub enum IfaceError {
    #[error("device error: {0}")]
    Device(#[from] io::Error),

    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

/// Failure to attach a container to, or detach it from, the overlay.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("already attached to container {0}")]
    AlreadyAttached(String),

    #[error("not attached to container {0}")]
    NotAttached(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Interface(#[from] IfaceError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Host-side port name for the `index`th container on `bridge`.
pub fn port_name(prefix: &str, bridge: &str, index: usize) -> String {
    format!("{prefix}.{bridge}.{index}")
}
