use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::launcher::render_script;
use sandbox::{ExecError, SandboxHandle, SandboxLauncher};
use tokio::process::{Child, Command};

/// Runs the generated script with the host shell instead of a container and
/// records every engine call, so tests can check what was launched and what
/// was left behind.
#[derive(Default)]
pub struct RecordingLauncher {
    pub fail_launch: bool,
    /// Spent inside `launch` before the process is spawned.
    pub launch_delay: Duration,
    /// Run this shell snippet instead of the generated script.
    pub script_override: Option<String>,
    launches: AtomicUsize,
    kills: AtomicUsize,
    names: Mutex<Vec<String>>,
    roots: Mutex<Vec<PathBuf>>,
    live: Mutex<HashSet<String>>,
}

impl RecordingLauncher {
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::default()
        }
    }

    pub fn slow(launch_delay: Duration) -> Self {
        Self {
            launch_delay,
            ..Self::default()
        }
    }

    pub fn running(script: &str) -> Self {
        Self {
            script_override: Some(script.to_owned()),
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().unwrap().clone()
    }

    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Temp roots of every workspace that still exists on disk.
    pub fn leftover_roots(&self) -> Vec<PathBuf> {
        self.roots
            .lock()
            .unwrap()
            .iter()
            .filter(|root| root.exists())
            .cloned()
            .collect()
    }

    pub async fn wait_until_clean(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.live() == 0 && self.leftover_roots().is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

#[async_trait]
impl SandboxLauncher for RecordingLauncher {
    async fn launch(&self, handle: &SandboxHandle, command: &str) -> Result<Child, ExecError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.names.lock().unwrap().push(handle.id.clone());
        if let Some(root) = handle.workspace_dir.parent() {
            self.roots.lock().unwrap().push(root.to_path_buf());
        }
        if self.fail_launch {
            return Err(ExecError::Launch("engine unavailable".to_owned()));
        }
        tokio::time::sleep(self.launch_delay).await;
        tokio::fs::write(&handle.script_path, render_script(&handle.workspace_dir, command))
            .await?;
        let mut shell = Command::new("sh");
        match &self.script_override {
            Some(script) => shell.arg("-c").arg(script),
            None => shell.arg(&handle.script_path),
        };
        let child = shell
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ExecError::Launch(err.to_string()))?;
        self.live.lock().unwrap().insert(handle.id.clone());
        Ok(child)
    }

    async fn kill(&self, _handle: &SandboxHandle) -> Result<(), ExecError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), ExecError> {
        self.live.lock().unwrap().remove(&handle.id);
        Ok(())
    }
}
