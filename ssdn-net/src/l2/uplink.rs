use std::io;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio_rustls::TlsConnector;
use tracing::info;

use super::{L2Bridge, forward_frames};
use crate::address::Address;
use crate::peer::protocol::{L2_HELLO, Result, handshake};
use crate::reconnect::{AbortSignal, ConnectionHandler, HandlerFuture, ReconnectClient};
use crate::transport::BoxedStream;

/// Outbound layer 2 link. Each connection gets a fresh tap on the bridge.
pub struct L2Uplink {
    bridge: Arc<L2Bridge>,
    client: ReconnectClient,
    /// Tap of the live connection.
    interface: Mutex<Option<String>>,
}

struct UplinkHandler {
    uplink: Weak<L2Uplink>,
}

impl ConnectionHandler for UplinkHandler {
    fn handle(&self, stream: BoxedStream, abort: AbortSignal) -> HandlerFuture {
        let uplink = self.uplink.upgrade();
        Box::pin(async move {
            match uplink {
                Some(uplink) => uplink.run(stream, abort).await,
                None => Ok(()),
            }
        })
    }
}

impl L2Uplink {
    pub fn new(bridge: Arc<L2Bridge>, address: Address, tls: Option<TlsConnector>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<L2Uplink>| {
            let handler = Arc::new(UplinkHandler {
                uplink: this.clone(),
            });
            Self {
                bridge,
                client: ReconnectClient::new(address, tls, handler),
                interface: Mutex::new(None),
            }
        })
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

    pub fn interface(&self) -> Option<String> {
        self.interface
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_interface(&self, name: Option<String>) {
        *self.interface.lock().unwrap_or_else(PoisonError::into_inner) = name;
    }

    async fn run(self: Arc<Self>, stream: BoxedStream, abort: AbortSignal) -> Result<()> {
        let (reader, writer) = handshake(stream, L2_HELLO).await?;
        let device = self.bridge.open_tap().await.map_err(io::Error::other)?;
        let name = device.name().to_string();

        self.set_interface(Some(name.clone()));
        let result = forward_frames(device, reader, writer, Some(abort)).await;
        self.set_interface(None);
        info!(device = %name, "Closed uplink tap");
        result
    }
}
