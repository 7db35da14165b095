use std::io;
use std::sync::Arc;

use tracing::{info, warn};

use crate::workspace::Workspace;
use crate::{ExecError, SandboxHandle, SandboxLauncher};

/// Owns everything a request allocated. `release` tears it down; if the guard
/// is dropped unreleased (panic, abandoned task) the same cleanup is spawned
/// from `Drop`. Either way it happens once.
pub struct TeardownGuard {
    launcher: Arc<dyn SandboxLauncher>,
    handle: SandboxHandle,
    workspace: Option<Workspace>,
}

impl TeardownGuard {
    pub fn new(
        launcher: Arc<dyn SandboxLauncher>,
        handle: SandboxHandle,
        workspace: Workspace,
    ) -> Self {
        Self {
            launcher,
            handle,
            workspace: Some(workspace),
        }
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// Restarts the handle's clock once the sandbox process exists.
    pub fn mark_launched(&mut self) {
        self.handle.started_at = tokio::time::Instant::now();
    }

    pub async fn release(mut self) {
        if let Some(workspace) = self.workspace.take() {
            cleanup(self.launcher.as_ref(), &self.handle, workspace).await;
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(workspace) = self.workspace.take() else {
            return;
        };
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let launcher = self.launcher.clone();
                runtime.spawn(async move {
                    cleanup(launcher.as_ref(), &handle, workspace).await;
                });
            }
            Err(_) => {
                warn!(sandbox = %handle.id, "no runtime for container removal; removing files only");
                if let Err(err) = workspace.close() {
                    warn!(sandbox = %handle.id, error = %err, "workspace removal failed");
                }
            }
        }
    }
}

/// Forced container removal plus script removal. Safe to call repeatedly.
pub async fn teardown_sandbox(
    launcher: &dyn SandboxLauncher,
    handle: &SandboxHandle,
) -> Result<(), ExecError> {
    launcher.remove(handle).await?;
    match tokio::fs::remove_file(&handle.script_path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn cleanup(launcher: &dyn SandboxLauncher, handle: &SandboxHandle, workspace: Workspace) {
    if let Err(err) = teardown_sandbox(launcher, handle).await {
        warn!(sandbox = %handle.id, error = %err, "sandbox teardown failed");
    }
    if let Err(err) = workspace.close() {
        warn!(sandbox = %handle.id, error = %err, "workspace removal failed");
    }
    info!(
        sandbox = %handle.id,
        elapsed_ms = handle.started_at.elapsed().as_millis() as u64,
        "sandbox torn down"
    );
}
