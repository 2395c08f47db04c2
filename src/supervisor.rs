//! Lifecycle supervision for the out-of-process formatting worker.
//!
//! One [`WorkerSupervisor`] exclusively owns one worker process and its RPC
//! channel. It implements the lifecycle state machine
//!
//! ```text
//! Stopped ──start()──► Starting ──didStart──► Ready ──stop()──► Stopping ──► Stopped
//!                          ▲                    │
//!                          └──── crash-restart ─┘   (at most once per 5 s window)
//! ```
//!
//! with crash detection, bounded automatic restart, and graceful stop with
//! forced termination on timeout. Callers never see raw process signals:
//! `request()` either returns a result or a [`WorkerError`].
//!
//! # Process Cleanup Safety
//!
//! The spawned child is created with `kill_on_drop`, and the supervisor's
//! graceful stop closes the worker's stdin (a stdio worker exits on EOF)
//! before racing a 5 s timeout against the exit notification; losing the
//! race forces a kill. A start issued while a stop is in flight waits for
//! the stop, so two live processes can never coexist.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::rpc::{RpcChannel, RpcError, RpcHandle};

/// How long a graceful stop waits before forcing termination.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A second unexpected exit within this window stops the restart loop.
pub const CRASH_WINDOW: Duration = Duration::from_secs(5);

/// Lifecycle notifications emitted by the worker (no response expected).
pub mod notifications {
    /// The worker finished initializing and can serve requests.
    pub const DID_START: &str = "didStart";
    /// The worker failed to initialize; params carry `{name,message,stack}`.
    pub const START_DID_FAIL: &str = "startDidFail";
    /// The worker hit an unrecoverable error; an exit follows.
    pub const DID_CRASH: &str = "didCrash";
}

/// Worker lifecycle states. Exactly one supervisor owns this state and all
/// transitions are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Ready,
    Stopping,
}

/// Supervision errors surfaced to callers.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker process could not be spawned (e.g., missing runtime).
    #[error("Failed to spawn formatting worker: {0}")]
    Spawn(String),

    /// The worker is not running and will not be restarted automatically.
    #[error("Formatting worker is not running: {reason}")]
    NotRunning {
        /// Why the worker is down (crash loop, failed start, stopped).
        reason: String,
    },

    /// The underlying RPC call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Process exit code, when one was observed.
    pub code: Option<i32>,
}

/// Everything the supervisor needs from one spawned worker.
///
/// Produced by a [`WorkerLauncher`]; the reader/writer pair carries the
/// framed protocol, `exit` resolves when the process ends, and `kill`
/// requests forced termination.
pub struct LaunchedWorker {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub exit: oneshot::Receiver<WorkerExit>,
    pub kill: Box<dyn Fn() + Send + Sync>,
}

/// Spawning seam for the worker process.
///
/// The production implementation is [`ProcessLauncher`]; tests inject fakes
/// to drive crash and timeout scenarios without real processes.
pub trait WorkerLauncher: Send + Sync {
    /// Spawn a worker bound to the given resolved module reference.
    fn launch(&self, module: &Path) -> Result<LaunchedWorker, WorkerError>;
}

/// Spawns the real worker process: `<runtime> <module>` with piped stdio.
///
/// Standard error is drained to the log for diagnostics; it carries no
/// protocol traffic.
pub struct ProcessLauncher {
    runtime: PathBuf,
    working_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(runtime: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            working_dir: working_dir.into(),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, module: &Path) -> Result<LaunchedWorker, WorkerError> {
        info!(
            "spawning formatting worker: {} {}",
            self.runtime.display(),
            module.display()
        );

        let mut child = Command::new(&self.runtime)
            .arg(module)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Spawn(format!("{}: {}", self.runtime.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("no stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("no stdout handle".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("worker stderr: {}", line);
                }
            });
        }

        // A small owner task holds the Child so `kill` and `wait` don't
        // fight over the handle.
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(async move {
            let mut kill_requested = false;
            loop {
                if kill_requested {
                    if let Err(e) = child.kill().await {
                        warn!("failed to kill worker: {}", e);
                    }
                    let status = child.wait().await.ok();
                    let _ = exit_tx.send(WorkerExit {
                        code: status.and_then(|s| s.code()),
                    });
                    return;
                }
                tokio::select! {
                    status = child.wait() => {
                        let _ = exit_tx.send(WorkerExit {
                            code: status.ok().and_then(|s| s.code()),
                        });
                        return;
                    }
                    _ = kill_rx.recv() => {
                        kill_requested = true;
                    }
                }
            }
        });

        Ok(LaunchedWorker {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            exit: exit_rx,
            kill: Box::new(move || {
                let _ = kill_tx.send(());
            }),
        })
    }
}

/// Lifecycle signals forwarded from the worker's notifications.
#[derive(Debug)]
enum Lifecycle {
    DidStart,
    StartFailed(String),
    Crashed(String),
}

struct Inner {
    channel: Option<RpcChannel>,
    handle: Option<RpcHandle>,
    kill: Option<Box<dyn Fn() + Send + Sync>>,
    module: Option<PathBuf>,
    /// Timestamp of the most recent unexpected exit; compared against the
    /// current time on each exit event (no ambient timers).
    last_crash: Option<Instant>,
    /// Why the worker is down for good, when it is.
    fatal: Option<String>,
    /// Incremented per spawn; guards against events from superseded workers.
    generation: u64,
}

struct Core {
    launcher: Box<dyn WorkerLauncher>,
    state_tx: watch::Sender<WorkerState>,
    inner: Mutex<Inner>,
}

/// Owns one formatting worker process and its RPC channel.
pub struct WorkerSupervisor {
    core: Arc<Core>,
}

impl WorkerSupervisor {
    /// Create a supervisor in the `Stopped` state.
    pub fn new(launcher: impl WorkerLauncher + 'static) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Stopped);
        Self {
            core: Arc::new(Core {
                launcher: Box::new(launcher),
                state_tx,
                inner: Mutex::new(Inner {
                    channel: None,
                    handle: None,
                    kill: None,
                    module: None,
                    last_crash: None,
                    fatal: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.core.state_tx.borrow()
    }

    /// Start the worker bound to `module`.
    ///
    /// No-op when already Starting or Ready. A start issued while a stop is
    /// in flight waits for the stop to complete first. Returns once the
    /// worker is spawned and `Starting`; await [`ready`](Self::ready) before
    /// issuing requests.
    pub async fn start(&self, module: impl Into<PathBuf>) -> Result<(), WorkerError> {
        let module = module.into();
        loop {
            let mut inner = self.core.inner.lock().await;
            // Copy the state out: the watch ref is a read guard, and the
            // arms below write the same channel.
            let state = *self.core.state_tx.borrow();
            match state {
                WorkerState::Starting | WorkerState::Ready => return Ok(()),
                WorkerState::Stopped => {
                    inner.last_crash = None;
                    return self.core.spawn_worker(&mut inner, module);
                }
                WorkerState::Stopping => {
                    drop(inner);
                    self.wait_for_stopped().await;
                }
            }
        }
    }

    /// Stop the worker gracefully, forcing termination after 5 s.
    ///
    /// No-op unless Ready or Starting. Concurrent `stop()` calls join the
    /// same shutdown; the process is terminated exactly once.
    pub async fn stop(&self) {
        {
            let mut inner = self.core.inner.lock().await;
            let state = *self.core.state_tx.borrow();
            match state {
                WorkerState::Stopped => return,
                WorkerState::Stopping => {
                    drop(inner);
                    self.wait_for_stopped().await;
                    return;
                }
                WorkerState::Starting | WorkerState::Ready => {
                    info!("stopping formatting worker");
                    // New calls must fail from this point on.
                    self.core.state_tx.send_replace(WorkerState::Stopping);
                    if let Some(handle) = inner.handle.take() {
                        // Fail pending calls, then close stdin: a stdio
                        // worker exits on EOF.
                        handle.close();
                        handle.shutdown_writer().await;
                    }
                }
            }
        }

        if timeout(STOP_TIMEOUT, self.wait_for_stopped()).await.is_err() {
            warn!(
                "worker did not exit within {:?}, forcing termination",
                STOP_TIMEOUT
            );
            {
                let inner = self.core.inner.lock().await;
                if let Some(kill) = &inner.kill {
                    kill();
                }
            }
            self.wait_for_stopped().await;
        }
    }

    /// Resolves when the worker is Ready, or fails when it is down.
    ///
    /// Callers must await this before issuing any request.
    pub async fn ready(&self) -> Result<(), WorkerError> {
        let mut rx = self.core.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                WorkerState::Ready => return Ok(()),
                WorkerState::Stopped | WorkerState::Stopping => {
                    return Err(self.not_running().await);
                }
                WorkerState::Starting => {
                    if rx.changed().await.is_err() {
                        return Err(self.not_running().await);
                    }
                }
            }
        }
    }

    /// Issue a request to the worker, awaiting readiness first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, WorkerError> {
        self.ready().await?;
        let handle = self.current_handle().await?;
        Ok(handle.request(method, params).await?)
    }

    /// Send a notification to the worker (no reply expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), WorkerError> {
        self.ready().await?;
        let handle = self.current_handle().await?;
        Ok(handle.notify(method, params).await?)
    }

    async fn current_handle(&self) -> Result<RpcHandle, WorkerError> {
        self.core
            .inner
            .lock()
            .await
            .handle
            .clone()
            .ok_or(WorkerError::NotRunning {
                reason: "worker stopped".to_string(),
            })
    }

    async fn not_running(&self) -> WorkerError {
        let inner = self.core.inner.lock().await;
        WorkerError::NotRunning {
            reason: inner
                .fatal
                .clone()
                .unwrap_or_else(|| "worker stopped".to_string()),
        }
    }

    async fn wait_for_stopped(&self) {
        let mut rx = self.core.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == WorkerState::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Core {
    /// Spawn a worker and wire its channel, lifecycle notifications, and
    /// exit monitor. Caller holds the inner lock.
    fn spawn_worker(self: &Arc<Self>, inner: &mut Inner, module: PathBuf) -> Result<(), WorkerError> {
        let launched = self.launcher.launch(&module)?;

        let channel = RpcChannel::new(launched.reader, launched.writer);
        let handle = channel.handle();

        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let tx = lifecycle_tx.clone();
        handle.on_request(notifications::DID_START, move |_params| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Lifecycle::DidStart);
                Ok(Value::Null)
            }
        });
        let tx = lifecycle_tx.clone();
        handle.on_request(notifications::START_DID_FAIL, move |params| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Lifecycle::StartFailed(error_message(&params)));
                Ok(Value::Null)
            }
        });
        let tx = lifecycle_tx;
        handle.on_request(notifications::DID_CRASH, move |params| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Lifecycle::Crashed(error_message(&params)));
                Ok(Value::Null)
            }
        });

        inner.generation += 1;
        inner.channel = Some(channel);
        inner.handle = Some(handle.clone());
        inner.kill = Some(launched.kill);
        inner.module = Some(module);
        inner.fatal = None;
        self.state_tx.send_replace(WorkerState::Starting);

        tokio::spawn(monitor(
            Arc::clone(self),
            inner.generation,
            launched.exit,
            lifecycle_rx,
            handle,
        ));
        Ok(())
    }

    async fn on_did_start(&self, generation: u64) {
        let inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        let state = *self.state_tx.borrow();
        if state == WorkerState::Starting {
            info!("formatting worker ready");
            self.state_tx.send_replace(WorkerState::Ready);
        }
    }

    async fn on_start_failed(&self, generation: u64, message: String) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        error!("formatting worker failed to start: {}", message);
        inner.fatal = Some(message);
        // The worker normally exits on its own after startDidFail; the kill
        // covers the ones that hang instead.
        if let Some(kill) = &inner.kill {
            kill();
        }
        self.teardown(&mut inner);
    }

    async fn on_exit(self: &Arc<Self>, generation: u64, exit: WorkerExit) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        let state = *self.state_tx.borrow();
        match state {
            WorkerState::Stopped => {}
            WorkerState::Stopping => {
                debug!("worker exited after stop request (code {:?})", exit.code);
                self.teardown(&mut inner);
            }
            WorkerState::Starting | WorkerState::Ready => {
                warn!("worker exited unexpectedly (code {:?})", exit.code);
                self.teardown(&mut inner);

                let now = Instant::now();
                let recent_crash = inner
                    .last_crash
                    .is_some_and(|at| now.duration_since(at) < CRASH_WINDOW);
                if recent_crash {
                    // Two crashes inside the window: a systematically broken
                    // worker. Stay down and surface the condition.
                    error!(
                        "worker crashed twice within {:?}, not restarting",
                        CRASH_WINDOW
                    );
                    inner.fatal = Some(format!(
                        "worker crashed twice within {} seconds (last exit code {:?})",
                        CRASH_WINDOW.as_secs(),
                        exit.code
                    ));
                    return;
                }

                inner.last_crash = Some(now);
                let module = match inner.module.clone() {
                    Some(module) => module,
                    None => return,
                };
                info!("restarting formatting worker after crash");
                if let Err(e) = self.spawn_worker(&mut inner, module) {
                    error!("worker restart failed: {}", e);
                    inner.fatal = Some(e.to_string());
                    self.state_tx.send_replace(WorkerState::Stopped);
                }
            }
        }
    }

    /// The RPC stream died (EOF or a fatal framing error) while the process
    /// may still be running. A worker without its channel cannot serve
    /// anything, so terminate it; the exit event then drives the normal
    /// crash handling in [`on_exit`](Self::on_exit).
    async fn on_channel_closed(&self, generation: u64) {
        let inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        let state = *self.state_tx.borrow();
        if matches!(state, WorkerState::Starting | WorkerState::Ready) {
            warn!("worker channel closed unexpectedly, terminating process");
            if let Some(kill) = &inner.kill {
                kill();
            }
        }
    }

    /// Close the channel and drop the worker wiring. Caller holds the lock.
    fn teardown(&self, inner: &mut Inner) {
        if let Some(channel) = inner.channel.take() {
            channel.close();
        }
        inner.handle = None;
        inner.kill = None;
        self.state_tx.send_replace(WorkerState::Stopped);
    }
}

/// Per-worker monitor: forwards lifecycle notifications, channel death, and
/// the exit event into the supervisor's state machine.
async fn monitor(
    core: Arc<Core>,
    generation: u64,
    mut exit: oneshot::Receiver<WorkerExit>,
    mut lifecycle_rx: mpsc::UnboundedReceiver<Lifecycle>,
    handle: RpcHandle,
) {
    let mut channel_dead = false;
    loop {
        tokio::select! {
            event = lifecycle_rx.recv() => match event {
                Some(Lifecycle::DidStart) => core.on_did_start(generation).await,
                Some(Lifecycle::StartFailed(message)) => {
                    core.on_start_failed(generation, message).await;
                }
                Some(Lifecycle::Crashed(message)) => {
                    // Informational; the exit event drives the restart.
                    warn!("worker reported crash: {}", message);
                }
                None => {
                    // Channel gone; keep waiting for the exit event.
                    let exit_info = (&mut exit).await.unwrap_or(WorkerExit { code: None });
                    core.on_exit(generation, exit_info).await;
                    return;
                }
            },
            // A dead transport with a live process: the worker is unusable,
            // so treat it as crashed. Fires at most once per worker; the
            // expected closure during stop() is a no-op inside.
            _ = handle.closed(), if !channel_dead => {
                channel_dead = true;
                core.on_channel_closed(generation).await;
            }
            exit_info = &mut exit => {
                let exit_info = exit_info.unwrap_or(WorkerExit { code: None });
                core.on_exit(generation, exit_info).await;
                return;
            }
        }
    }
}

/// Pull a human-readable message out of `{name, message, stack}` params.
fn error_message(params: &Value) -> String {
    params
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown worker error")
        .to_string()
}
