//! Operations exposed to whatever drives a node, and the registry poll loop
//! that keeps its peer set current.

use std::collections::{BTreeMap, HashSet};
use std::error::Error;
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::arp::{ArpError, MacAddr};
use crate::iface::{AttachError, L3Bridge, L3Tap, L3Tuns};
use crate::l2::{L2Bridge, L2Uplinks, UplinkError};
use crate::peer::{PeerError, Peers};
use crate::types::{ConnectionDetails, PeerDetails};

pub type ControlFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type DirectoryError = Box<dyn Error + Send + Sync>;

/// Registry polling interval.
pub const REGISTRY_POLL: Duration = Duration::from_secs(30);

const REGISTRY_RETRY: Duration = Duration::from_secs(5);

pub trait PeerManager: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    fn add_peer(&self, url: &str) -> Result<(), Self::Error>;
    fn delete_peer(&self, url: &str) -> Result<(), Self::Error>;
    fn list_peers(&self) -> BTreeMap<String, PeerDetails>;
}

impl PeerManager for Peers {
    type Error = PeerError;

    fn add_peer(&self, url: &str) -> Result<(), PeerError> {
        Peers::add_peer(self, url)
    }

    fn delete_peer(&self, url: &str) -> Result<(), PeerError> {
        Peers::delete_peer(self, url)
    }

    fn list_peers(&self) -> BTreeMap<String, PeerDetails> {
        Peers::list_peers(self)
    }
}

impl PeerManager for L2Uplinks {
    type Error = UplinkError;

    fn add_peer(&self, url: &str) -> Result<(), UplinkError> {
        self.add_uplink(url)
    }

    fn delete_peer(&self, url: &str) -> Result<(), UplinkError> {
        self.delete_uplink(url)
    }

    fn list_peers(&self) -> BTreeMap<String, PeerDetails> {
        self.list_uplinks()
    }
}

/// Attaches containers to the overlay.
pub trait Connector: Send + Sync {
    fn attach<'a>(
        &'a self,
        container: &'a str,
        ip: Option<&'a str>,
    ) -> ControlFuture<'a, Result<(), AttachError>>;
    fn detach<'a>(&'a self, container: &'a str) -> ControlFuture<'a, Result<(), AttachError>>;
    fn list_connections(&self) -> BTreeMap<String, ConnectionDetails>;
}

impl Connector for L3Tuns {
    fn attach<'a>(
        &'a self,
        container: &'a str,
        ip: Option<&'a str>,
    ) -> ControlFuture<'a, Result<(), AttachError>> {
        Box::pin(L3Tuns::attach(self, container, ip))
    }

    fn detach<'a>(&'a self, container: &'a str) -> ControlFuture<'a, Result<(), AttachError>> {
        Box::pin(async move { L3Tuns::detach(self, container) })
    }

    fn list_connections(&self) -> BTreeMap<String, ConnectionDetails> {
        L3Tuns::list_connections(self)
    }
}

impl Connector for L3Bridge {
    fn attach<'a>(
        &'a self,
        container: &'a str,
        ip: Option<&'a str>,
    ) -> ControlFuture<'a, Result<(), AttachError>> {
        Box::pin(L3Bridge::attach(self, container, ip))
    }

    fn detach<'a>(&'a self, container: &'a str) -> ControlFuture<'a, Result<(), AttachError>> {
        Box::pin(L3Bridge::detach(self, container))
    }

    fn list_connections(&self) -> BTreeMap<String, ConnectionDetails> {
        L3Bridge::list_connections(self)
    }
}

/// Layer 2 ports carry no addressing; a requested IP is ignored.
impl Connector for L2Bridge {
    fn attach<'a>(
        &'a self,
        container: &'a str,
        _ip: Option<&'a str>,
    ) -> ControlFuture<'a, Result<(), AttachError>> {
        Box::pin(L2Bridge::attach(self, container))
    }

    fn detach<'a>(&'a self, container: &'a str) -> ControlFuture<'a, Result<(), AttachError>> {
        Box::pin(L2Bridge::detach(self, container))
    }

    fn list_connections(&self) -> BTreeMap<String, ConnectionDetails> {
        L2Bridge::list_connections(self)
    }
}

/// ARP view of a gateway.
pub trait Resolver: Send + Sync {
    fn arp_table(&self) -> ControlFuture<'_, Result<BTreeMap<String, String>, ArpError>>;
    fn resolve(&self, ip: Ipv4Addr) -> ControlFuture<'_, Result<MacAddr, ArpError>>;
}

impl Resolver for L3Tap {
    fn arp_table(&self) -> ControlFuture<'_, Result<BTreeMap<String, String>, ArpError>> {
        Box::pin(async move { Ok(L3Tap::arp_table(self).await?.string_map()) })
    }

    fn resolve(&self, ip: Ipv4Addr) -> ControlFuture<'_, Result<MacAddr, ArpError>> {
        Box::pin(L3Tap::resolve(self, ip))
    }
}

/// Receives the full peer set whenever it changes.
pub trait RegistryConsumer: Send + Sync {
    fn update_peers(&self, urls: &HashSet<String>);
}

impl RegistryConsumer for Peers {
    fn update_peers(&self, urls: &HashSet<String>) {
        Peers::update_peers(self, urls)
    }
}

impl RegistryConsumer for L2Uplinks {
    fn update_peers(&self, urls: &HashSet<String>) {
        L2Uplinks::update_peers(self, urls)
    }
}

/// Source of the peer URLs registered under a key.
pub trait PeerDirectory: Send + Sync {
    fn lookup<'a>(&'a self, key: &'a str) -> ControlFuture<'a, Result<HashSet<String>, DirectoryError>>;
}

/// Directory kept as plain files: `<dir>/<key>` holds one URL per line.
pub struct FileDirectory {
    dir: PathBuf,
}

impl FileDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PeerDirectory for FileDirectory {
    fn lookup<'a>(&'a self, key: &'a str) -> ControlFuture<'a, Result<HashSet<String>, DirectoryError>> {
        Box::pin(async move {
            let contents = match tokio::fs::read_to_string(self.dir.join(key)).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e.into()),
            };
            Ok(contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect())
        })
    }
}

/// Poll `directory` for the peers under `key` and hand every changed set,
/// minus our own `advertise_url`, to `consumer`. Runs until `stop` is set.
pub async fn watch_registry(
    directory: Arc<dyn PeerDirectory>,
    key: String,
    advertise_url: String,
    consumer: Arc<dyn RegistryConsumer>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut current: Option<HashSet<String>> = None;
    info!(key = %key, "Watching peer registry");
    loop {
        let delay = match directory.lookup(&key).await {
            Ok(mut urls) => {
                urls.remove(&advertise_url);
                if current.as_ref() != Some(&urls) {
                    debug!(key = %key, peers = urls.len(), "Peer registry changed");
                    consumer.update_peers(&urls);
                    current = Some(urls);
                }
                interval
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to query peer registry");
                REGISTRY_RETRY.min(interval)
            }
        };

        tokio::select! {
            _ = stop.wait_for(|&stopped| stopped) => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};
    use tokio::time::timeout;

    #[derive(Default)]
    struct ScriptedDirectory {
        answers: Mutex<Vec<Result<Vec<&'static str>, &'static str>>>,
        lookups: AtomicUsize,
    }

    impl PeerDirectory for ScriptedDirectory {
        fn lookup<'a>(
            &'a self,
            key: &'a str,
        ) -> ControlFuture<'a, Result<HashSet<String>, DirectoryError>> {
            assert_eq!(key, "acme");
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap_or_else(PoisonError::into_inner);
            let answer = if answers.len() > 1 {
                answers.remove(0)
            } else {
                answers[0].clone()
            };
            Box::pin(async move {
                answer
                    .map(|urls| urls.into_iter().map(str::to_string).collect())
                    .map_err(DirectoryError::from)
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<Vec<String>>>,
    }

    impl Recorder {
        fn updates(&self) -> Vec<Vec<String>> {
            self.updates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl RegistryConsumer for Recorder {
        fn update_peers(&self, urls: &HashSet<String>) {
            let mut urls: Vec<String> = urls.iter().cloned().collect();
            urls.sort();
            self.updates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(urls);
        }
    }

    #[tokio::test]
    async fn test_watch_registry_reports_changes_only() {
        let directory = Arc::new(ScriptedDirectory::default());
        *directory.answers.lock().unwrap() = vec![
            Ok(vec!["tcp://10.1.0.1:7000", "tcp://10.1.0.9:7000"]),
            Ok(vec!["tcp://10.1.0.9:7000", "tcp://10.1.0.1:7000"]),
            Err("registry unavailable"),
            Ok(vec!["tcp://10.1.0.2:7000", "tcp://10.1.0.9:7000"]),
        ];
        let recorder = Arc::new(Recorder::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(watch_registry(
            directory.clone(),
            "acme".to_string(),
            "tcp://10.1.0.9:7000".to_string(),
            recorder.clone(),
            Duration::from_millis(10),
            stop_rx,
        ));

        timeout(Duration::from_secs(5), async {
            while directory.lookups.load(Ordering::SeqCst) < 6 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        stop_tx.send_replace(true);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(
            recorder.updates(),
            vec![
                vec!["tcp://10.1.0.1:7000".to_string()],
                vec!["tcp://10.1.0.2:7000".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_file_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("acme"),
            "# peers\ntcp://10.1.0.1:7000\n\n  tcps://10.1.0.2:7000  \n",
        )
        .unwrap();

        let directory = FileDirectory::new(dir.path());
        let urls = directory.lookup("acme").await.unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls.contains("tcp://10.1.0.1:7000"));
        assert!(urls.contains("tcps://10.1.0.2:7000"));

        assert!(directory.lookup("other").await.unwrap().is_empty());
    }
}
