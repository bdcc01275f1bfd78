//! Runs the external action scripts that configure interfaces.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("command {command} could not be started: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("command {command} failed ({status}): {output}")]
    Failed {
        command: String,
        status: ExitStatus,
        output: String,
    },
}

/// Executes `<dir>/<action> args...`, one action at a time.
pub struct ActionInvoker {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl ActionInvoker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run an action and return its combined stdout and stderr.
    pub async fn execute(&self, action: &str, args: &[&str]) -> Result<String, InvokeError> {
        let target = self.dir.join(action);
        let command = format!("{} {}", target.display(), args.join(" "));

        let _serial = self.lock.lock().await;
        debug!(command = %command, "Executing action");
        let result = Command::new(&target)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| InvokeError::Spawn {
                command: command.clone(),
                source,
            })?;

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));

        if !result.status.success() {
            return Err(InvokeError::Failed {
                command,
                status: result.status,
                output,
            });
        }
        Ok(output)
    }
}
