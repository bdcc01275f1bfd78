use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{info, warn};

use super::{L2Bridge, L2Uplink};
use crate::address::{Address, AddressError};
use crate::tls::TlsConfig;
use crate::types::{PeerDetails, PeerState};

const UPLINK_TYPE: &str = "l2";

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("uplink {0} requires TLS configuration")]
    TlsRequired(String),

    #[error("already connected to uplink {0}")]
    AlreadyConnected(String),

    #[error("no such uplink {0}")]
    NoSuchUplink(String),
}

pub type Result<T> = std::result::Result<T, UplinkError>;

/// Outbound layer 2 links keyed by URL.
pub struct L2Uplinks {
    bridge: Arc<L2Bridge>,
    tls: TlsConfig,
    uplinks: Mutex<HashMap<String, Arc<L2Uplink>>>,
}

impl L2Uplinks {
    pub fn new(bridge: Arc<L2Bridge>, tls: TlsConfig) -> Self {
        Self {
            bridge,
            tls,
            uplinks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<L2Uplink>>> {
        self.uplinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_uplink(&self, url: &str) -> Result<()> {
        let address = Address::parse(url)?;
        let tls = if address.tls() {
            let connector = self
                .tls
                .connector()
                .ok_or_else(|| UplinkError::TlsRequired(url.to_string()))?;
            Some(connector.clone())
        } else {
            None
        };

        let uplink = {
            let mut uplinks = self.lock();
            if uplinks.contains_key(url) {
                return Err(UplinkError::AlreadyConnected(url.to_string()));
            }
            let uplink = L2Uplink::new(Arc::clone(&self.bridge), address, tls);
            uplinks.insert(url.to_string(), Arc::clone(&uplink));
            uplink
        };

        uplink.start();
        info!(uplink = %url, "Added uplink");
        Ok(())
    }

    pub fn delete_uplink(&self, url: &str) -> Result<()> {
        let uplink = self
            .lock()
            .remove(url)
            .ok_or_else(|| UplinkError::NoSuchUplink(url.to_string()))?;
        uplink.stop();
        info!(uplink = %url, "Deleted uplink");
        Ok(())
    }

    pub fn list_uplinks(&self) -> BTreeMap<String, PeerDetails> {
        self.lock()
            .iter()
            .map(|(url, uplink)| {
                let state = if uplink.connected() {
                    PeerState::Connected
                } else {
                    PeerState::Connecting
                };
                (
                    url.clone(),
                    PeerDetails {
                        kind: UPLINK_TYPE.to_string(),
                        state,
                        interface: uplink.interface(),
                    },
                )
            })
            .collect()
    }

    /// Converge on the discovered set of uplink URLs.
    pub fn update_peers(&self, urls: &HashSet<String>) {
        let (removed, added): (Vec<(String, Arc<L2Uplink>)>, Vec<String>) = {
            let mut uplinks = self.lock();
            let stale: Vec<String> = uplinks
                .keys()
                .filter(|url| !urls.contains(*url))
                .cloned()
                .collect();
            let removed = stale
                .into_iter()
                .filter_map(|url| uplinks.remove(&url).map(|uplink| (url, uplink)))
                .collect();
            let added = urls
                .iter()
                .filter(|url| !uplinks.contains_key(*url))
                .cloned()
                .collect();
            (removed, added)
        };

        for (url, uplink) in removed {
            uplink.stop();
            info!(uplink = %url, "Removed obsolete uplink");
        }
        for url in added {
            info!(uplink = %url, "Discovered uplink");
            if let Err(e) = self.add_uplink(&url) {
                warn!(uplink = %url, error = %e, "Failed to add uplink");
            }
        }
    }

    pub fn stop_all(&self) {
        let uplinks: Vec<Arc<L2Uplink>> = self.lock().drain().map(|(_, u)| u).collect();
        for uplink in uplinks {
            uplink.stop();
        }
    }
}
