//! Dev-server supervision.
//!
//! The gateway owns at most one dev-server child process, launched inside
//! the workspace root and bound to a fixed loopback port.  A monitor task
//! owns the [`Child`]; the supervisor talks to it through a kill channel
//! and learns about exits through the shared state it clears.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::config::PreviewConfig;

/// How long `stop` waits for the child to be reaped.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How long the process group gets after SIGTERM before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

const NOT_READY_ERROR: &str = "Vite dev server did not become ready in time";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewStatus {
    NotRunning,
    Starting,
    Running,
    Stopped,
    Error,
}

/// Result of [`PreviewSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewStartResult {
    pub status: PreviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSnapshot {
    pub status: PreviewStatus,
    pub pid: Option<u32>,
    pub port: u16,
    pub last_error: Option<String>,
}

struct ActiveProcess {
    pid: Option<u32>,
    generation: u64,
    kill: Option<oneshot::Sender<()>>,
    exited: Option<oneshot::Receiver<()>>,
}

#[derive(Default)]
struct SupervisorState {
    active: Option<ActiveProcess>,
    status: Option<PreviewStatus>,
    last_error: Option<String>,
    last_exit: Option<String>,
    generation: u64,
}

impl SupervisorState {
    fn is_current(&self, generation: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.generation == generation)
    }

    /// Whether a readiness failure of `generation` should be recorded:
    /// it is still running, or it exited by itself and nothing newer or
    /// an explicit stop has happened since.
    fn owns_failure(&self, generation: u64) -> bool {
        self.is_current(generation)
            || (self.active.is_none()
                && self.generation == generation
                && self.status != Some(PreviewStatus::Stopped))
    }
}

pub struct PreviewSupervisor {
    config: PreviewConfig,
    workdir: PathBuf,
    state: Arc<Mutex<SupervisorState>>,
    spawn_count: AtomicUsize,
    probe: reqwest::Client,
}

impl PreviewSupervisor {
    pub fn new(config: PreviewConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            workdir: workdir.into(),
            state: Arc::new(Mutex::new(SupervisorState::default())),
            spawn_count: AtomicUsize::new(0),
            probe: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.config
    }

    /// Number of processes spawned over the supervisor's lifetime.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Start the dev server, or report `running` when it already is.
    ///
    /// The liveness check and the spawn happen under one lock, so
    /// concurrent callers never launch a second process.  The lock is
    /// released while polling for readiness.
    pub async fn start(&self) -> PreviewStartResult {
        let generation = {
            let mut state = self.state.lock().await;
            if state.active.is_some() {
                debug!("dev server already running");
                return PreviewStartResult {
                    status: PreviewStatus::Running,
                    error: None,
                };
            }
            match self.spawn_locked(&mut state).await {
                Ok(generation) => generation,
                Err(e) => {
                    let msg = format!("{e:#}");
                    warn!(error = %msg, "failed to launch dev server");
                    state.status = Some(PreviewStatus::Error);
                    state.last_error = Some(msg.clone());
                    return PreviewStartResult {
                        status: PreviewStatus::Error,
                        error: Some(msg),
                    };
                }
            }
        };

        match self.wait_until_ready(generation).await {
            Ok(elapsed) => {
                let mut state = self.state.lock().await;
                if state.is_current(generation) {
                    state.status = Some(PreviewStatus::Running);
                }
                info!(port = self.config.port, ?elapsed, "dev server ready");
                PreviewStartResult {
                    status: PreviewStatus::Starting,
                    error: None,
                }
            }
            Err(msg) => {
                warn!(error = %msg, "dev server failed to become ready");
                let exited = {
                    let mut state = self.state.lock().await;
                    if state.owns_failure(generation) {
                        state.status = Some(PreviewStatus::Error);
                        state.last_error = Some(msg.clone());
                    }
                    if state.is_current(generation) {
                        state.active.take()
                    } else {
                        None
                    }
                };
                if let Some(active) = exited {
                    terminate(active).await;
                }
                PreviewStartResult {
                    status: PreviewStatus::Error,
                    error: Some(msg),
                }
            }
        }
    }

    async fn spawn_locked(&self, state: &mut SupervisorState) -> anyhow::Result<u64> {
        tokio::fs::create_dir_all(&self.workdir)
            .await
            .with_context(|| format!("failed to create {}", self.workdir.display()))?;

        let args = self.config.render_args();
        info!(program = %self.config.program, ?args, cwd = %self.workdir.display(), "launching dev server");

        let mut command = Command::new(&self.config.program);
        command
            .args(&args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so `npm run dev` and the server it launches
        // can be signalled together.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.config.program))?;
        self.spawn_count.fetch_add(1, Ordering::SeqCst);

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        state.generation += 1;
        let generation = state.generation;
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        state.active = Some(ActiveProcess {
            pid: child.id(),
            generation,
            kill: Some(kill_tx),
            exited: Some(exited_rx),
        });
        state.status = Some(PreviewStatus::Starting);
        state.last_error = None;
        state.last_exit = None;

        tokio::spawn(monitor(child, kill_rx, exited_tx, self.state.clone(), generation));
        Ok(generation)
    }

    /// Poll the dev server until it answers, the process goes away, or
    /// the deadline passes.
    async fn wait_until_ready(&self, generation: u64) -> Result<Duration, String> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.ready_timeout_ms);
        let url = format!("{}{}", self.config.origin(), self.config.base_path);
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            {
                let state = self.state.lock().await;
                if !state.is_current(generation) {
                    return Err(match &state.last_exit {
                        Some(exit) => format!("Dev server exited before becoming ready ({exit})"),
                        None => "Dev server stopped before becoming ready".to_string(),
                    });
                }
            }

            match self.probe.head(&url).timeout(probe_timeout).send().await {
                Ok(_) => return Ok(started.elapsed()),
                Err(e) => trace!(error = %e, "dev server not ready yet"),
            }

            if Instant::now() >= deadline {
                return Err(NOT_READY_ERROR.to_string());
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Kill the dev server.  Returns `stopped` or `not_running`.
    pub async fn stop(&self) -> PreviewStatus {
        let active = {
            let mut state = self.state.lock().await;
            match state.active.take() {
                Some(active) => {
                    state.status = Some(PreviewStatus::Stopped);
                    active
                }
                None => return PreviewStatus::NotRunning,
            }
        };
        info!(pid = ?active.pid, "stopping dev server");
        terminate(active).await;
        PreviewStatus::Stopped
    }

    /// Stop the process, if any, at gateway shutdown.
    pub async fn shutdown(&self) {
        if self.stop().await == PreviewStatus::Stopped {
            debug!("dev server stopped on shutdown");
        }
    }

    pub async fn status(&self) -> PreviewSnapshot {
        let state = self.state.lock().await;
        let status = match (&state.active, state.status) {
            (Some(_), Some(s)) => s,
            (Some(_), None) => PreviewStatus::Starting,
            (None, Some(PreviewStatus::Stopped)) => PreviewStatus::Stopped,
            (None, Some(PreviewStatus::Error)) => PreviewStatus::Error,
            (None, _) => PreviewStatus::NotRunning,
        };
        PreviewSnapshot {
            status,
            pid: state.active.as_ref().and_then(|a| a.pid),
            port: self.config.port,
            last_error: state.last_error.clone(),
        }
    }
}

/// Signal the monitor to kill the child and wait (bounded) for the reap.
async fn terminate(mut active: ActiveProcess) {
    if let Some(kill) = active.kill.take() {
        let _ = kill.send(());
    }
    if let Some(exited) = active.exited.take() {
        if tokio::time::timeout(STOP_GRACE, exited).await.is_err() {
            warn!(pid = ?active.pid, "dev server did not exit within grace period");
        }
    }
}

/// Own the child until it exits or is told to die, then clear the
/// supervisor's handle if it still refers to this process.
async fn monitor(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exited_tx: oneshot::Sender<()>,
    state: Arc<Mutex<SupervisorState>>,
    generation: u64,
) {
    let pid = child.id();
    let exit = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            request_exit(&mut child, pid);
            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(?pid, "dev server ignored termination, killing");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill dev server");
                    }
                    child.wait().await
                }
            }
        }
    };
    // Sweep anything the child left behind in its group.
    kill_group(pid);

    let description = match &exit {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };
    info!(exit = %description, "dev server exited");

    {
        let mut state = state.lock().await;
        if state.is_current(generation) {
            state.active = None;
            state.status = Some(PreviewStatus::NotRunning);
            state.last_exit = Some(description);
        }
    }
    let _ = exited_tx.send(());
}

/// Ask the dev server to exit: SIGTERM to its process group on unix,
/// a plain kill elsewhere.
#[cfg(unix)]
fn request_exit(_child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child, _pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill dev server");
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// The child was spawned with `process_group(0)`, so its pid is the
/// group id.  ESRCH just means the group is already gone.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) only delivers a signal; a negative pid targets the group.
    if unsafe { libc::kill(-pgid, signal) } != 0 {
        trace!(pgid, signal, "process group signal not delivered");
    }
}

fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "preview", stream, "{line}");
        }
    });
}
