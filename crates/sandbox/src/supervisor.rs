use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::event::OutputEvent;
use crate::relay::{OutputRelay, Relayed};
use crate::request::ExecutionRequest;
use crate::teardown::TeardownGuard;
use crate::validator::validate_command;
use crate::workspace::stage_workspace;
use crate::{ExecError, SandboxHandle, SandboxLauncher};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_BUFFER: usize = 64;
/// How long a terminal event may wait on a slow caller before it is dropped.
const TERMINAL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    /// Wall-clock budget measured from launch.
    pub deadline: Duration,
    /// Longest single wait for output before the deadline is rechecked.
    pub poll_interval: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Receiving end of one execution. Dropping it cancels the sandbox.
#[derive(Debug)]
pub struct ExecutionStream {
    sandbox_id: String,
    events: mpsc::Receiver<OutputEvent>,
}

impl ExecutionStream {
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub async fn next(&mut self) -> Option<OutputEvent> {
        self.events.recv().await
    }

    pub fn into_receiver(self) -> mpsc::Receiver<OutputEvent> {
        self.events
    }
}

#[derive(Debug)]
enum Phase {
    Running,
    Draining,
    TimedOut,
    Failed(String),
    Abandoned,
    Closed,
}

#[derive(Clone)]
pub struct ExecutionSupervisor {
    launcher: Arc<dyn SandboxLauncher>,
    limits: ExecutionLimits,
}

impl ExecutionSupervisor {
    pub fn new(launcher: Arc<dyn SandboxLauncher>, limits: ExecutionLimits) -> Self {
        Self { launcher, limits }
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// Validates, stages and launches `request`. Errors returned here happen
    /// before any output exists; everything after launch arrives as events.
    pub async fn start(&self, request: ExecutionRequest) -> Result<ExecutionStream, ExecError> {
        validate_command(&request.command)?;
        let workspace = stage_workspace(&request.files).await?;
        let handle = SandboxHandle::new(
            workspace.dir().to_path_buf(),
            workspace.script_path().to_path_buf(),
        );
        let mut guard = TeardownGuard::new(self.launcher.clone(), handle, workspace);

        let mut child = match self.launcher.launch(guard.handle(), &request.command).await {
            Ok(child) => child,
            Err(err) => {
                warn!(sandbox = %guard.handle().id, error = %err, "sandbox launch failed");
                guard.release().await;
                return Err(err);
            }
        };
        guard.mark_launched();
        let relay = match OutputRelay::attach(&mut child) {
            Ok(relay) => relay,
            Err(err) => {
                let _ = child.start_kill();
                guard.release().await;
                return Err(err);
            }
        };

        let sandbox_id = guard.handle().id.clone();
        info!(sandbox = %sandbox_id, files = request.files.len(), "execution started");
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(supervise(
            self.launcher.clone(),
            self.limits,
            guard,
            child,
            relay,
            events,
        ));
        Ok(ExecutionStream {
            sandbox_id,
            events: receiver,
        })
    }

    /// Runs `request` and collects every event.
    pub async fn run_to_end(
        &self,
        request: ExecutionRequest,
    ) -> Result<Vec<OutputEvent>, ExecError> {
        let mut stream = self.start(request).await?;
        let mut collected = Vec::new();
        while let Some(event) = stream.next().await {
            collected.push(event);
        }
        Ok(collected)
    }
}

async fn supervise(
    launcher: Arc<dyn SandboxLauncher>,
    limits: ExecutionLimits,
    guard: TeardownGuard,
    mut child: Child,
    mut relay: OutputRelay,
    events: mpsc::Sender<OutputEvent>,
) {
    let handle = guard.handle().clone();
    let deadline = handle.started_at + limits.deadline;
    let mut phase = Phase::Running;

    loop {
        phase = match phase {
            Phase::Running => {
                let next = read_next(&mut relay, &events, deadline, limits.poll_interval).await;
                if !matches!(next, Phase::Running) {
                    debug!(sandbox = %handle.id, phase = ?next, "leaving running");
                }
                next
            }
            Phase::Draining => match timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(sandbox = %handle.id, code = ?status.code(), "sandbox exited");
                    let terminal = match status.code() {
                        Some(0) => None,
                        Some(code) => Some(OutputEvent::ExitCode(code)),
                        None => Some(OutputEvent::internal("sandbox terminated by signal")),
                    };
                    if let Some(event) = terminal {
                        emit_terminal(&events, event).await;
                    }
                    Phase::Closed
                }
                Ok(Err(err)) => Phase::Failed(format!("failed to collect exit status: {err}")),
                Err(_) => Phase::TimedOut,
            },
            Phase::TimedOut => {
                warn!(sandbox = %handle.id, deadline = ?limits.deadline, "execution timed out");
                let _ = child.start_kill();
                emit_terminal(&events, OutputEvent::Timeout(limits.deadline)).await;
                force_kill(launcher.as_ref(), &handle).await;
                Phase::Closed
            }
            Phase::Failed(message) => {
                warn!(sandbox = %handle.id, error = %message, "execution failed");
                let _ = child.start_kill();
                emit_terminal(&events, OutputEvent::internal(message)).await;
                force_kill(launcher.as_ref(), &handle).await;
                Phase::Closed
            }
            Phase::Abandoned => {
                info!(sandbox = %handle.id, "caller disconnected; stopping sandbox");
                let _ = child.start_kill();
                force_kill(launcher.as_ref(), &handle).await;
                Phase::Closed
            }
            Phase::Closed => break,
        };
    }

    // The stream ends only after teardown, so a closed stream means no leftovers.
    guard.release().await;
    drop(events);
}

async fn read_next(
    relay: &mut OutputRelay,
    events: &mpsc::Sender<OutputEvent>,
    deadline: Instant,
    poll_interval: Duration,
) -> Phase {
    let now = Instant::now();
    if now >= deadline {
        return Phase::TimedOut;
    }
    let wait = poll_interval.min(deadline - now);
    match relay.next_within(wait).await {
        Relayed::Line(line) => {
            match timeout_at(deadline, events.send(OutputEvent::Line(line))).await {
                Ok(Ok(())) => Phase::Running,
                Ok(Err(_)) => Phase::Abandoned,
                Err(_) => Phase::TimedOut,
            }
        }
        Relayed::Idle if events.is_closed() => Phase::Abandoned,
        Relayed::Idle => Phase::Running,
        Relayed::Closed => Phase::Draining,
        Relayed::Failed(err) => Phase::Failed(format!("output read failed: {err}")),
    }
}

async fn emit_terminal(events: &mpsc::Sender<OutputEvent>, event: OutputEvent) {
    let _ = tokio::time::timeout(TERMINAL_GRACE, events.send(event)).await;
}

async fn force_kill(launcher: &dyn SandboxLauncher, handle: &SandboxHandle) {
    if let Err(err) = launcher.kill(handle).await {
        warn!(sandbox = %handle.id, error = %err, "forced kill failed");
    }
}
