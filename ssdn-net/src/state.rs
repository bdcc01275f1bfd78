//! Persisted container connections, restored on restart.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::ConnectionDetails;

pub const STATE_FILE: &str = "overlay.json";

const SAVE_RETRY: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid state file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionDetails>,
}

/// The snapshot file for one tenant.
///
/// Updates are written by a background task; a failed write is retried
/// until it succeeds or a newer snapshot replaces it. [`State::flush`]
/// writes whatever is still queued and ends the task.
pub struct State {
    path: PathBuf,
    updates: watch::Sender<Option<Snapshot>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl State {
    pub fn new(run_dir: impl AsRef<Path>, tenant: &str) -> Self {
        Self {
            path: run_dir.as_ref().join(tenant).join(STATE_FILE),
            updates: watch::channel(None).0,
            stop: watch::channel(false).0,
            task: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spawn the task that persists updates.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(persist(
            self.path.clone(),
            self.updates.subscribe(),
            self.stop.subscribe(),
        )));
    }

    /// Queue a snapshot for writing. Only the latest queued snapshot is kept.
    pub fn update(&self, snapshot: Snapshot) {
        self.updates.send_replace(Some(snapshot));
    }

    /// Write the last queued snapshot and stop the background task.
    pub async fn flush(&self) {
        self.stop.send_replace(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "State task failed");
            }
        }
    }

    /// Read the last saved snapshot, if there is one.
    pub async fn load(&self) -> Result<Option<Snapshot>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| StateError::Json {
                path: self.path.clone(),
                source,
            })
    }

    /// Write `snapshot` next to the state file, then rename it into place.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        save_to(&self.path, snapshot).await
    }
}

async fn save_to(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };

    let data = serde_json::to_vec(snapshot).map_err(|source| StateError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await.map_err(io_err)?;
    }

    let mut staged = path.as_os_str().to_owned();
    staged.push(".new");
    let staged = PathBuf::from(staged);
    fs::write(&staged, data).await.map_err(io_err)?;
    fs::rename(&staged, path).await.map_err(io_err)?;
    debug!(path = %path.display(), "Saved state");
    Ok(())
}

async fn persist(
    path: PathBuf,
    mut updates: watch::Receiver<Option<Snapshot>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut pending: Option<Snapshot> = None;
    loop {
        let stopped = tokio::select! {
            _ = stop.wait_for(|&stopped| stopped) => true,
            changed = updates.changed() => changed.is_err(),
            _ = tokio::time::sleep(SAVE_RETRY), if pending.is_some() => false,
        };

        if let Some(latest) = updates.borrow_and_update().clone() {
            pending = Some(latest);
        }
        if let Some(snapshot) = &pending {
            match save_to(&path, snapshot).await {
                Ok(()) => pending = None,
                Err(e) => warn!(error = %e, "Failed to save state"),
            }
        }
        if stopped {
            if pending.is_some() {
                warn!(path = %path.display(), "Stopping with unsaved state");
            } else {
                info!(path = %path.display(), "State flushed");
            }
            return;
        }
    }
}
