pub mod error;
pub mod event;
pub mod launcher;
pub mod relay;
pub mod request;
pub mod supervisor;
pub mod teardown;
pub mod validator;
pub mod workspace;

use std::path::PathBuf;

use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::process::Child;
use tokio::time::Instant;

pub use error::{ErrorKind, ExecError};
pub use event::OutputEvent;
pub use request::{ExecutionRequest, UploadedFile};
pub use supervisor::{ExecutionLimits, ExecutionStream, ExecutionSupervisor};

const SANDBOX_ID_PREFIX: &str = "forge-";
const SANDBOX_ID_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct SandboxLaunchConfig {
    pub docker_bin: String,
    pub image: String,
}

impl Default for SandboxLaunchConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_owned(),
            image: launcher::DEFAULT_IMAGE.to_owned(),
        }
    }
}

/// One running (or about to run) container. The id is both the container name
/// and the correlation id in logs.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub id: String,
    pub workspace_dir: PathBuf,
    pub script_path: PathBuf,
    pub started_at: Instant,
}

impl SandboxHandle {
    pub fn new(workspace_dir: PathBuf, script_path: PathBuf) -> Self {
        Self {
            id: new_sandbox_id(),
            workspace_dir,
            script_path,
            started_at: Instant::now(),
        }
    }
}

pub fn new_sandbox_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SANDBOX_ID_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("{SANDBOX_ID_PREFIX}{suffix}")
}

/// Container engine seam. `launch` writes the script for `command` to
/// `handle.script_path` and starts the sandbox with stdout and stderr piped.
/// `kill` and `remove` must tolerate a container that is already gone.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn launch(&self, handle: &SandboxHandle, command: &str) -> Result<Child, ExecError>;
    async fn kill(&self, handle: &SandboxHandle) -> Result<(), ExecError>;
    async fn remove(&self, handle: &SandboxHandle) -> Result<(), ExecError>;
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn sandbox_ids_are_short_and_distinct() {
        let ids: HashSet<String> = (0..1000).map(|_| new_sandbox_id()).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert!(id.starts_with(SANDBOX_ID_PREFIX));
            assert_eq!(id.len(), SANDBOX_ID_PREFIX.len() + SANDBOX_ID_LEN);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
        }
    }
}
