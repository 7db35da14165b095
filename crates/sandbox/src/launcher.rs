use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{ExecError, SandboxHandle, SandboxLaunchConfig, SandboxLauncher};

pub const DEFAULT_IMAGE: &str = "nikolaik/python-nodejs:python3.12-nodejs22-slim";

// Fixed isolation contract for every sandbox.
const CPUS: &str = "0.25";
const MEMORY: &str = "1g";
const MEMORY_SWAP: &str = "1g";
const TMPFS: &str = "/tmp:rw,noexec,nosuid,size=64m";
const MOUNT_POINT: &str = "/workspace";
const SCRIPT_MOUNT: &str = "/run.sh";
/// Longest wait on a `docker kill` / `docker rm` call.
const ENGINE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn build_launcher(config: SandboxLaunchConfig) -> Arc<dyn SandboxLauncher> {
    Arc::new(DockerLauncher { config })
}

/// Shell script run inside the sandbox. Going through `sh` keeps pipes,
/// redirects and `;` meaning what the caller wrote; `exec 2>&1` folds stderr
/// into the single output stream.
pub fn render_script(workdir: &Path, command: &str) -> String {
    format!(
        "#!/bin/sh\ncd '{}' || exit 1\nexec 2>&1\n{}\n",
        workdir.display(),
        command.trim()
    )
}

struct DockerLauncher {
    config: SandboxLaunchConfig,
}

impl DockerLauncher {
    async fn engine(&self, args: &[&str]) -> Result<Output, ExecError> {
        let mut command = Command::new(&self.config.docker_bin);
        command.args(args);
        run_engine(command, ENGINE_TIMEOUT).await.inspect_err(|err| {
            warn!(?args, error = %err, "container engine call failed");
        })
    }
}

async fn run_engine(mut command: Command, limit: Duration) -> Result<Output, ExecError> {
    command.stdin(Stdio::null()).kill_on_drop(true);
    match tokio::time::timeout(limit, command.output()).await {
        Ok(output) => output
            .map_err(|err| ExecError::Internal(format!("failed to invoke container engine: {err}"))),
        Err(_) => Err(ExecError::Internal(format!(
            "container engine did not answer within {limit:?}"
        ))),
    }
}

#[async_trait]
impl SandboxLauncher for DockerLauncher {
    async fn launch(&self, handle: &SandboxHandle, command: &str) -> Result<Child, ExecError> {
        tokio::fs::write(&handle.script_path, render_script(Path::new(MOUNT_POINT), command))
            .await?;
        let args = docker_run_args(handle, &self.config.image);
        debug!(sandbox = %handle.id, ?args, "starting container");
        let child = Command::new(&self.config.docker_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ExecError::Launch(format!("failed to spawn sandbox container: {err}")))?;
        info!(sandbox = %handle.id, image = %self.config.image, "sandbox started");
        Ok(child)
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), ExecError> {
        let output = self.engine(&["kill", &handle.id]).await?;
        if !output.status.success() {
            debug!(
                sandbox = %handle.id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "kill found no running container"
            );
        }
        Ok(())
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), ExecError> {
        let output = self.engine(&["rm", "-f", &handle.id]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_already_gone(&stderr) {
            return Ok(());
        }
        warn!(sandbox = %handle.id, stderr = %stderr.trim(), "container removal failed");
        Err(ExecError::Internal(format!(
            "failed to remove container {}",
            handle.id
        )))
    }
}

fn is_already_gone(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("is already in progress")
}

pub fn docker_run_args(handle: &SandboxHandle, image: &str) -> Vec<String> {
    vec![
        "run".to_owned(),
        "--rm".to_owned(),
        "--name".to_owned(),
        handle.id.clone(),
        "--network".to_owned(),
        "none".to_owned(),
        "--read-only".to_owned(),
        "--tmpfs".to_owned(),
        TMPFS.to_owned(),
        "--cpus".to_owned(),
        CPUS.to_owned(),
        "--memory".to_owned(),
        MEMORY.to_owned(),
        "--memory-swap".to_owned(),
        MEMORY_SWAP.to_owned(),
        "-v".to_owned(),
        format!("{}:{MOUNT_POINT}:rw", handle.workspace_dir.display()),
        "-v".to_owned(),
        format!("{}:{SCRIPT_MOUNT}:ro", handle.script_path.display()),
        "-w".to_owned(),
        MOUNT_POINT.to_owned(),
        image.to_owned(),
        "sh".to_owned(),
        SCRIPT_MOUNT.to_owned(),
    ]
}
