//! Integration tests for worker lifecycle supervision.
//!
//! A fake [`WorkerLauncher`] stands in for the real process: each "worker"
//! is an in-memory RPC peer over `tokio::io::duplex`, with an exit event and
//! kill counter the test controls. Timers run under a paused clock, so the
//! crash window and stop timeout are exercised deterministically.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{duplex, split};
use tokio::sync::oneshot;
use tokio::time::timeout;

use fmtbridge::rpc::{RpcChannel, RpcHandle};
use fmtbridge::supervisor::{
    LaunchedWorker, WorkerError, WorkerExit, WorkerLauncher, WorkerState, WorkerSupervisor,
};

/// Generous guard; the paused clock advances past it only if a test hangs.
const TEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One fake worker: the peer endpoint of a launched channel.
struct FakeWorker {
    /// Worker-side channel and handle; [`sever`](Self::sever) drops both to
    /// simulate the stream dying while the process lives on.
    connection: StdMutex<Option<(RpcChannel, RpcHandle)>>,
    /// Exit sender, shared with the kill closure (a kill resolves the exit
    /// the way SIGKILL ends a real process).
    exit: Arc<StdMutex<Option<oneshot::Sender<WorkerExit>>>>,
    kills: Arc<AtomicUsize>,
}

impl FakeWorker {
    /// RPC handle on the worker's side of the pipe.
    fn handle(&self) -> RpcHandle {
        self.connection
            .lock()
            .unwrap()
            .as_ref()
            .expect("connection severed")
            .1
            .clone()
    }

    /// Drop the worker's channel endpoint without ending the process.
    fn sever(&self) {
        self.connection.lock().unwrap().take();
    }

    /// Report successful initialization.
    async fn announce_ready(&self) {
        self.handle()
            .notify("didStart", Value::Null)
            .await
            .expect("didStart failed");
    }

    /// Report failed initialization.
    async fn announce_start_failed(&self, message: &str) {
        self.handle()
            .notify(
                "startDidFail",
                json!({"name": "Error", "message": message, "stack": null}),
            )
            .await
            .expect("startDidFail failed");
    }

    /// Simulate the process ending with `code`.
    fn exit(&self, code: i32) {
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(WorkerExit { code: Some(code) });
        }
    }

    fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

type Workers = Arc<StdMutex<Vec<Arc<FakeWorker>>>>;

struct FakeLauncher {
    workers: Workers,
    fail_spawn: bool,
}

impl FakeLauncher {
    /// Returns the launcher and a shared log of every worker it spawns.
    fn new() -> (Self, Workers) {
        init_tracing();
        let workers: Workers = Arc::new(StdMutex::new(Vec::new()));
        (
            Self {
                workers: workers.clone(),
                fail_spawn: false,
            },
            workers,
        )
    }

    fn failing() -> Self {
        init_tracing();
        Self {
            workers: Arc::new(StdMutex::new(Vec::new())),
            fail_spawn: true,
        }
    }
}

/// Opt-in log output for debugging (`RUST_LOG=debug cargo test ...`).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&self, _module: &Path) -> Result<LaunchedWorker, WorkerError> {
        if self.fail_spawn {
            return Err(WorkerError::Spawn("runtime not found".to_string()));
        }

        let (supervisor_side, worker_side) = duplex(64 * 1024);
        let (s_read, s_write) = split(supervisor_side);
        let (w_read, w_write) = split(worker_side);

        let channel = RpcChannel::new(w_read, w_write);
        let handle = channel.handle();

        let (exit_tx, exit_rx) = oneshot::channel();
        let exit = Arc::new(StdMutex::new(Some(exit_tx)));
        let kills = Arc::new(AtomicUsize::new(0));

        let exit_for_kill = exit.clone();
        let kills_for_kill = kills.clone();
        let kill = Box::new(move || {
            kills_for_kill.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = exit_for_kill.lock().unwrap().take() {
                let _ = tx.send(WorkerExit { code: None });
            }
        });

        self.workers.lock().unwrap().push(Arc::new(FakeWorker {
            connection: StdMutex::new(Some((channel, handle))),
            exit,
            kills,
        }));

        Ok(LaunchedWorker {
            reader: Box::new(s_read),
            writer: Box::new(s_write),
            exit: exit_rx,
            kill,
        })
    }
}

/// Wait (under the paused clock) until the `n`-th worker has been spawned.
async fn nth_worker(workers: &Workers, n: usize) -> Arc<FakeWorker> {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(worker) = workers.lock().unwrap().get(n).cloned() {
                return worker;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker was never spawned")
}

async fn wait_for_state(supervisor: &WorkerSupervisor, state: WorkerState) {
    timeout(TEST_TIMEOUT, async {
        while supervisor.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "never reached {:?}, stuck at {:?}",
            state,
            supervisor.state()
        )
    });
}

#[tokio::test(start_paused = true)]
async fn test_start_becomes_ready_on_did_start() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);
    assert_eq!(supervisor.state(), WorkerState::Stopped);

    // The timeout also guards against start() never returning.
    timeout(TEST_TIMEOUT, supervisor.start("worker.js"))
        .await
        .expect("start did not return")
        .expect("start failed");
    assert_eq!(supervisor.state(), WorkerState::Starting);

    let worker = nth_worker(&workers, 0).await;
    worker.announce_ready().await;

    timeout(TEST_TIMEOUT, supervisor.ready())
        .await
        .expect("Test timed out")
        .expect("ready failed");
    assert_eq!(supervisor.state(), WorkerState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    supervisor.start("worker.js").await.expect("start failed");
    supervisor.start("worker.js").await.expect("start failed");
    nth_worker(&workers, 0).await;
    assert_eq!(workers.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_failure_surfaces() {
    let supervisor = WorkerSupervisor::new(FakeLauncher::failing());

    let err = supervisor.start("worker.js").await.expect_err("expected spawn failure");
    assert!(matches!(err, WorkerError::Spawn(_)));
    assert_eq!(supervisor.state(), WorkerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_request_roundtrip_through_supervisor() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    supervisor.start("worker.js").await.expect("start failed");
    let worker = nth_worker(&workers, 0).await;
    worker
        .handle()
        .on_request("format", |params| async move {
            Ok(json!({"formatted": params["original"]}))
        });
    worker.announce_ready().await;

    let result = timeout(
        TEST_TIMEOUT,
        supervisor.request("format", json!({"original": "x"})),
    )
    .await
    .expect("Test timed out")
    .expect("request failed");
    assert_eq!(result["formatted"], "x");
}

#[tokio::test(start_paused = true)]
async fn test_request_while_stopped_fails() {
    let (launcher, _workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    let err = supervisor
        .request("format", Value::Null)
        .await
        .expect_err("expected not-running error");
    assert!(matches!(err, WorkerError::NotRunning { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_crash_triggers_one_restart() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    supervisor.start("worker.js").await.expect("start failed");
    let first = nth_worker(&workers, 0).await;
    first.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    first.exit(1);

    // A replacement is spawned automatically and becomes ready.
    let second = nth_worker(&workers, 1).await;
    second.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;
    assert_eq!(first.kill_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_crash_within_window_stays_down() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    supervisor.start("worker.js").await.expect("start failed");
    let first = nth_worker(&workers, 0).await;
    first.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    first.exit(1);
    let second = nth_worker(&workers, 1).await;
    second.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    // Less than 5 s after the first crash: give up instead of looping.
    tokio::time::sleep(Duration::from_secs(2)).await;
    second.exit(1);
    wait_for_state(&supervisor, WorkerState::Stopped).await;

    assert_eq!(workers.lock().unwrap().len(), 2);
    let err = supervisor
        .request("format", Value::Null)
        .await
        .expect_err("expected not-running error");
    match err {
        WorkerError::NotRunning { reason } => assert!(reason.contains("crashed twice")),
        other => panic!("expected NotRunning, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_crashes_outside_window_keep_restarting() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    supervisor.start("worker.js").await.expect("start failed");
    let first = nth_worker(&workers, 0).await;
    first.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    first.exit(1);
    let second = nth_worker(&workers, 1).await;
    second.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    // More than 5 s later the crash counter has effectively reset.
    tokio::time::sleep(Duration::from_secs(6)).await;
    second.exit(1);
    let third = nth_worker(&workers, 2).await;
    third.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;
    assert_eq!(workers.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_restart_resets_crash_window() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    supervisor.start("worker.js").await.expect("start failed");
    let first = nth_worker(&workers, 0).await;
    first.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    // Crash once, then stop and start manually within the window.
    first.exit(1);
    let second = nth_worker(&workers, 1).await;
    second.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    let handle = second.handle();
    let eof_exit = second.clone();
    tokio::spawn(async move {
        handle.closed().await;
        eof_exit.exit(0);
    });
    supervisor.stop().await;

    supervisor.start("worker.js").await.expect("restart failed");
    let third = nth_worker(&workers, 2).await;
    third.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    // This crash is the first one of the new run, so it restarts even
    // though the previous crash was recent in wall-clock terms.
    third.exit(1);
    let fourth = nth_worker(&workers, 3).await;
    fourth.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;
}

#[tokio::test(start_paused = true)]
async fn test_channel_death_kills_and_restarts() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    supervisor.start("worker.js").await.expect("start failed");
    let first = nth_worker(&workers, 0).await;
    first.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    // The stream dies while the process keeps running: the supervisor must
    // terminate the orphaned process and restart through the crash path
    // instead of staying Ready on a dead channel.
    first.sever();

    let second = nth_worker(&workers, 1).await;
    assert_eq!(first.kill_count(), 1);
    second.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_stop_on_eof() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    supervisor.start("worker.js").await.expect("start failed");
    let worker = nth_worker(&workers, 0).await;
    worker.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    // A well-behaved worker exits when its stdin closes.
    let handle = worker.handle();
    let on_eof = worker.clone();
    tokio::spawn(async move {
        handle.closed().await;
        on_eof.exit(0);
    });

    timeout(TEST_TIMEOUT, supervisor.stop())
        .await
        .expect("Test timed out");
    assert_eq!(supervisor.state(), WorkerState::Stopped);
    assert_eq!(worker.kill_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_timeout_forces_kill() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    supervisor.start("worker.js").await.expect("start failed");
    let worker = nth_worker(&workers, 0).await;
    worker.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    // The worker ignores EOF; the 5 s grace period elapses on the paused
    // clock and the supervisor kills it.
    timeout(TEST_TIMEOUT, supervisor.stop())
        .await
        .expect("Test timed out");
    assert_eq!(supervisor.state(), WorkerState::Stopped);
    assert_eq!(worker.kill_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_stops_join_and_kill_once() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = Arc::new(WorkerSupervisor::new(launcher));

    supervisor.start("worker.js").await.expect("start failed");
    let worker = nth_worker(&workers, 0).await;
    worker.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    let a = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.stop().await })
    };
    let b = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.stop().await })
    };
    timeout(TEST_TIMEOUT, async {
        a.await.expect("stop task panicked");
        b.await.expect("stop task panicked");
    })
    .await
    .expect("Test timed out");

    assert_eq!(supervisor.state(), WorkerState::Stopped);
    assert_eq!(worker.kill_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_stopping_waits_then_spawns() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = Arc::new(WorkerSupervisor::new(launcher));

    supervisor.start("worker.js").await.expect("start failed");
    let worker = nth_worker(&workers, 0).await;
    worker.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;

    // The worker ignores EOF, so the stop takes the full 5 s.
    let stop = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.stop().await })
    };
    wait_for_state(&supervisor, WorkerState::Stopping).await;

    supervisor.start("worker.js").await.expect("restart failed");
    stop.await.expect("stop task panicked");

    let second = nth_worker(&workers, 1).await;
    second.announce_ready().await;
    wait_for_state(&supervisor, WorkerState::Ready).await;
    assert_eq!(workers.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_did_fail_stays_down_with_reason() {
    let (launcher, workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);

    supervisor.start("worker.js").await.expect("start failed");
    let worker = nth_worker(&workers, 0).await;
    worker.announce_start_failed("Cannot find module 'prettier'").await;

    wait_for_state(&supervisor, WorkerState::Stopped).await;
    let err = timeout(TEST_TIMEOUT, supervisor.ready())
        .await
        .expect("Test timed out")
        .expect_err("expected not-running error");
    match err {
        WorkerError::NotRunning { reason } => {
            assert!(reason.contains("Cannot find module"));
        }
        other => panic!("expected NotRunning, got {:?}", other),
    }
    // No replacement is spawned after a failed start.
    assert_eq!(workers.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_stopped_is_a_no_op() {
    let (launcher, _workers) = FakeLauncher::new();
    let supervisor = WorkerSupervisor::new(launcher);
    supervisor.stop().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
}
