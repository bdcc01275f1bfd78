//! Layer 2 links: whole Ethernet frames bridged between nodes.
//!
//! Every link gets its own tap on the tenant bridge, and the kernel bridge
//! does the switching. Links use the same framing as layer 3 links with
//! the [`L2_HELLO`](crate::peer::protocol::L2_HELLO) hello line, but carry
//! frames as they are and skip the peer info exchange.

mod bridge;
mod listener;
mod tap;
mod uplink;
mod uplinks;

pub use bridge::L2Bridge;
pub use listener::L2Listener;
pub use tap::forward_frames;
pub use uplink::L2Uplink;
pub use uplinks::{L2Uplinks, UplinkError};

pub const L2_TAP_TEMPLATE: &str = "sf2.tap%d";

/// Host side of a bridged container port: bridge name, then port index.
pub const L2_PORT_PREFIX: &str = "sf2";

/// Registry key suffix under which layer 2 nodes advertise themselves.
pub const L2_REGISTRY_SUFFIX: &str = ".l2";
