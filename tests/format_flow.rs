//! End-to-end tests: supervisor, RPC channel, formatting call, and edit
//! reconciliation working together against an in-memory worker.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{duplex, split};
use tokio::sync::oneshot;
use tokio::time::timeout;

use fmtbridge::format::{FormatError, FormatParams, FormattingService, MAX_DOCUMENT_SIZE};
use fmtbridge::reconcile::{ApplyOutcome, EditorBuffer, InMemoryBuffer, Selection};
use fmtbridge::rpc::{RpcChannel, RpcHandle};
use fmtbridge::supervisor::{
    LaunchedWorker, WorkerError, WorkerExit, WorkerLauncher, WorkerSupervisor,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Opt-in log output for debugging (`RUST_LOG=debug cargo test ...`).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Launcher whose "process" is an in-memory RPC peer; the provided closure
/// registers that peer's method handlers.
struct InlineLauncher {
    setup: Box<dyn Fn(&RpcHandle) + Send + Sync>,
    // Held so the worker-side channel and exit sender outlive the test body.
    workers: Arc<StdMutex<Vec<(RpcChannel, oneshot::Sender<WorkerExit>)>>>,
}

impl InlineLauncher {
    fn new(setup: impl Fn(&RpcHandle) + Send + Sync + 'static) -> Self {
        Self {
            setup: Box::new(setup),
            workers: Arc::new(StdMutex::new(Vec::new())),
        }
    }
}

impl WorkerLauncher for InlineLauncher {
    fn launch(&self, _module: &Path) -> Result<LaunchedWorker, WorkerError> {
        let (supervisor_side, worker_side) = duplex(64 * 1024);
        let (s_read, s_write) = split(supervisor_side);
        let (w_read, w_write) = split(worker_side);

        let channel = RpcChannel::new(w_read, w_write);
        let handle = channel.handle();
        (self.setup)(&handle);

        // The worker announces readiness immediately, like a real engine
        // that finished loading.
        tokio::spawn(async move {
            let _ = handle.notify("didStart", Value::Null).await;
        });

        // Exit never resolves; these tests end before any stop completes.
        let (exit_tx, exit_rx) = oneshot::channel();
        self.workers.lock().unwrap().push((channel, exit_tx));
        Ok(LaunchedWorker {
            reader: Box::new(s_read),
            writer: Box::new(s_write),
            exit: exit_rx,
            kill: Box::new(|| {}),
        })
    }
}

async fn service_with_worker(
    setup: impl Fn(&RpcHandle) + Send + Sync + 'static,
) -> FormattingService {
    init_tracing();
    let supervisor = WorkerSupervisor::new(InlineLauncher::new(setup));
    supervisor.start("worker.js").await.expect("start failed");
    let service = FormattingService::new(supervisor);
    timeout(TEST_TIMEOUT, service.supervisor().ready())
        .await
        .expect("Test timed out")
        .expect("worker never became ready");
    service
}

fn params(original: &str) -> FormatParams {
    let mut options = BTreeMap::new();
    options.insert("parser".to_string(), json!("typescript"));
    FormatParams {
        original: original.to_string(),
        path_for_config: "/project/src/main.ts".to_string(),
        ignore_path: None,
        options,
        with_cursor: None,
    }
}

#[tokio::test]
async fn test_format_and_apply_preserves_selection() {
    // The "engine" doubles every space, shifting later text right.
    let service = service_with_worker(|handle| {
        handle.on_request("format", |params| async move {
            let original = params["original"].as_str().unwrap_or_default();
            Ok(json!({"formatted": original.replace(' ', "  ")}))
        });
    })
    .await;

    let mut buffer = InMemoryBuffer::new("a b c");
    let outcome = timeout(
        TEST_TIMEOUT,
        service.format_and_apply(&mut buffer, params("a b c"), &[Selection::new(2, 3)]),
    )
    .await
    .expect("Test timed out")
    .expect("format failed");

    assert_eq!(outcome, ApplyOutcome::Applied);
    assert_eq!(buffer.text(), "a  b  c");
    assert_eq!(buffer.selections(), &[Selection::new(3, 4)]);
}

#[tokio::test]
async fn test_identical_output_leaves_buffer_alone() {
    let service = service_with_worker(|handle| {
        handle.on_request("format", |params| async move {
            Ok(json!({"formatted": params["original"]}))
        });
    })
    .await;

    let mut buffer = InMemoryBuffer::new("already formatted\n");
    let outcome = service
        .format_and_apply(&mut buffer, params("already formatted\n"), &[])
        .await
        .expect("format failed");

    assert_eq!(outcome, ApplyOutcome::Unchanged);
    assert_eq!(buffer.text(), "already formatted\n");
}

#[tokio::test]
async fn test_concurrent_edit_discards_result() {
    let service = service_with_worker(|handle| {
        handle.on_request("format", |_params| async move {
            Ok(json!({"formatted": "formatted\n"}))
        });
    })
    .await;

    // The buffer moved on while the request was in flight.
    let mut buffer = InMemoryBuffer::new("edited since the snapshot");
    let outcome = service
        .format_and_apply(&mut buffer, params("the snapshot"), &[])
        .await
        .expect("format failed");

    assert_eq!(outcome, ApplyOutcome::Drifted);
    assert_eq!(buffer.text(), "edited since the snapshot");
}

#[tokio::test]
async fn test_ignored_document_is_a_quiet_no_op() {
    let service = service_with_worker(|handle| {
        handle.on_request("format", |_params| async move {
            Ok(json!({"ignored": true}))
        });
    })
    .await;

    let mut buffer = InMemoryBuffer::new("raw");
    let outcome = service
        .format_and_apply(&mut buffer, params("raw"), &[])
        .await
        .expect("format failed");
    assert_eq!(outcome, ApplyOutcome::Unchanged);
    assert_eq!(buffer.text(), "raw");
}

#[tokio::test]
async fn test_false_ignored_flag_is_malformed() {
    let service = service_with_worker(|handle| {
        handle.on_request("format", |_params| async move {
            Ok(json!({"ignored": false}))
        });
    })
    .await;

    let mut buffer = InMemoryBuffer::new("raw");
    let err = service
        .format_and_apply(&mut buffer, params("raw"), &[])
        .await
        .expect_err("a false ignored flag is not a valid reply");
    assert!(matches!(err, FormatError::MalformedResponse(_)));
    assert_eq!(buffer.text(), "raw");
}

#[tokio::test]
async fn test_missing_parser_is_an_error() {
    let service = service_with_worker(|handle| {
        handle.on_request("format", |_params| async move {
            Ok(json!({"missingParser": true}))
        });
    })
    .await;

    let mut buffer = InMemoryBuffer::new("binary blob");
    let err = service
        .format_and_apply(&mut buffer, params("binary blob"), &[])
        .await
        .expect_err("expected missing-parser error");
    assert!(matches!(err, FormatError::MissingParser));
}

#[tokio::test]
async fn test_engine_error_carries_details() {
    let service = service_with_worker(|handle| {
        handle.on_request("format", |_params| async move {
            Ok(json!({"error": {
                "name": "SyntaxError",
                "message": "Unexpected token (3:7)",
                "stack": "SyntaxError: Unexpected token",
            }}))
        });
    })
    .await;

    let mut buffer = InMemoryBuffer::new("let let");
    let err = service
        .format_and_apply(&mut buffer, params("let let"), &[])
        .await
        .expect_err("expected engine error");
    match err {
        FormatError::Engine { name, message, .. } => {
            assert_eq!(name, "SyntaxError");
            assert!(message.contains("3:7"));
        }
        other => panic!("expected engine error, got {:?}", other),
    }
    assert_eq!(buffer.text(), "let let");
}

#[tokio::test]
async fn test_oversized_document_rejected_without_rpc() {
    let service = service_with_worker(|handle| {
        // If the ceiling check were skipped this reply would make the call
        // succeed, failing the assertion below.
        handle.on_request("format", |_params| async move {
            Ok(json!({"formatted": "should never be produced"}))
        });
    })
    .await;

    let huge = "x".repeat(MAX_DOCUMENT_SIZE + 1);
    let err = service
        .format(params(&huge))
        .await
        .expect_err("expected size rejection");
    assert!(matches!(err, FormatError::DocumentTooLarge { .. }));
}

#[tokio::test]
async fn test_has_config() {
    let service = service_with_worker(|handle| {
        handle.on_request("hasConfig", |params| async move {
            Ok(json!(params["pathForConfig"]
                .as_str()
                .is_some_and(|p| p.starts_with("/project"))))
        });
    })
    .await;

    assert!(service.has_config("/project/a.ts").await.expect("call failed"));
    assert!(!service.has_config("/tmp/a.ts").await.expect("call failed"));
}
