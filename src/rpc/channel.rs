//! The RPC channel: a Frame Codec bound to a reader/writer pair, JSON-RPC
//! dispatch, and a pending-call table for outbound requests.
//!
//! One [`RpcChannel`] owns the read loop for a byte-stream pair. Cloneable
//! [`RpcHandle`]s expose the two roles:
//!
//! - **server**: [`RpcHandle::on_request`] registers async handlers looked
//!   up dynamically by method name; inbound requests, notifications, and
//!   batches are validated and dispatched per JSON-RPC 2.0.
//! - **client**: [`RpcHandle::request`] / [`RpcHandle::notify`] issue
//!   outbound calls; each in-flight request is correlated to its response by
//!   a monotonically increasing numeric id.
//!
//! Transport and protocol errors never escape to callers of `request()`;
//! they are answered on the wire or logged. A pending call fails only when
//! the peer returns an error response or the channel is torn down — it can
//! never hang silently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, warn};

use crate::codec::{write_frame, Decoded, FrameDecoder};
use crate::rpc::message::{
    error_response, success_response, validate_call, ErrorObject, Validated, PROTOCOL_VERSION,
};

/// Boxed future returned by a request handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// A registered request handler: an async `params -> result` callable.
///
/// Returning an [`ErrorObject`] (through `anyhow`) passes the protocol error
/// through unchanged; any other failure becomes an Internal-Error response.
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Channel-level errors surfaced to callers of `request`/`notify`.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The channel was disposed (or the transport died) with the call
    /// outstanding.
    #[error("RPC channel closed")]
    ChannelClosed,

    /// The peer answered with an error response.
    #[error("Worker error {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
        /// Optional auxiliary data.
        data: Option<Value>,
    },

    /// Writing to the outbound stream failed.
    #[error("Transport error: {0}")]
    Transport(String),
}

type PendingTable = HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>;

struct ChannelInner {
    /// Outbound stream. The async mutex serializes whole-frame writes so two
    /// payloads never interleave; `write_all` inside awaits backpressure.
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Method name -> handler. Mutable at any time; registering overwrites.
    handlers: StdMutex<HashMap<String, Handler>>,
    /// In-flight outbound calls. `None` once the channel is closed.
    pending: StdMutex<Option<PendingTable>>,
    next_id: AtomicU64,
    closed_tx: watch::Sender<bool>,
    read_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Owns the read loop for one framed byte-stream pair.
///
/// Dropping the channel closes it: the read loop is aborted and every
/// pending call fails with [`RpcError::ChannelClosed`].
pub struct RpcChannel {
    handle: RpcHandle,
}

impl RpcChannel {
    /// Bind a channel to a reader/writer pair and start its read loop.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed_tx, _) = watch::channel(false);
        let handle = RpcHandle {
            inner: Arc::new(ChannelInner {
                writer: Mutex::new(Box::new(writer)),
                handlers: StdMutex::new(HashMap::new()),
                pending: StdMutex::new(Some(HashMap::new())),
                next_id: AtomicU64::new(1),
                closed_tx,
                read_task: StdMutex::new(None),
            }),
        };

        let task = tokio::spawn(read_loop(handle.clone(), Box::new(reader)));
        *handle.inner.read_task.lock().expect("read_task lock") = Some(task);
        Self { handle }
    }

    /// Get a cloneable handle for issuing calls and registering handlers.
    pub fn handle(&self) -> RpcHandle {
        self.handle.clone()
    }

    /// Tear the channel down, failing every pending call.
    pub fn close(&self) {
        self.handle.close();
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.handle.close();
    }
}

/// Cloneable capability for one RPC channel.
#[derive(Clone)]
pub struct RpcHandle {
    inner: Arc<ChannelInner>,
}

/// Unsubscribe token returned by [`RpcHandle::on_request`].
pub struct Registration {
    handle: RpcHandle,
    method: String,
}

impl Registration {
    /// Remove the registered handler. Idempotent: removing a method that was
    /// already removed (or overwritten and removed) is a no-op.
    pub fn unsubscribe(self) {
        self.handle
            .inner
            .handlers
            .lock()
            .expect("handlers lock")
            .remove(&self.method);
    }
}

impl RpcHandle {
    /// Register an async handler for `method`, overwriting any previous one.
    ///
    /// Returns a [`Registration`] whose `unsubscribe()` removes the entry.
    pub fn on_request<F, Fut>(&self, method: &str, handler: F) -> Registration
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |params| Box::pin(handler(params)));
        self.inner
            .handlers
            .lock()
            .expect("handlers lock")
            .insert(method.to_string(), boxed);
        Registration {
            handle: self.clone(),
            method: method.to_string(),
        }
    }

    /// Issue a request and await the matching response.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Server`] when the peer answers with an error response
    /// - [`RpcError::ChannelClosed`] when the channel dies mid-flight
    /// - [`RpcError::Transport`] when the request cannot be written
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            match pending.as_mut() {
                Some(table) => {
                    table.insert(id, tx);
                }
                None => return Err(RpcError::ChannelClosed),
            }
        }

        let msg = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "method": method,
            "params": params,
            "id": id,
        });
        if let Err(e) = self.write_value(&msg).await {
            if let Some(table) = self.inner.pending.lock().expect("pending lock").as_mut() {
                table.remove(&id);
            }
            return Err(e);
        }

        // The sender side is dropped only by fail_pending(), which sends an
        // explicit error first, so a bare RecvError also means closure.
        rx.await.unwrap_or(Err(RpcError::ChannelClosed))
    }

    /// Send a notification (no `id`, no reply). Returns once written.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let msg = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "method": method,
            "params": params,
        });
        self.write_value(&msg).await
    }

    /// Tear the channel down: abort the read loop and fail every pending
    /// call with [`RpcError::ChannelClosed`].
    pub fn close(&self) {
        if let Some(task) = self.inner.read_task.lock().expect("read_task lock").take() {
            task.abort();
        }
        self.fail_pending();
        self.mark_closed();
    }

    /// Shut down the outbound stream, signalling EOF to the peer.
    ///
    /// Used for graceful worker shutdown: a stdio worker exits when its
    /// stdin closes. Call [`close`](Self::close) first so no writer is
    /// mid-frame.
    pub async fn shutdown_writer(&self) {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("outbound stream shutdown failed: {}", e);
        }
    }

    /// Resolves once the channel has closed (either side).
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().expect("pending lock").is_none()
    }

    async fn write_value(&self, value: &Value) -> Result<(), RpcError> {
        let mut writer = self.inner.writer.lock().await;
        write_frame(&mut *writer, value)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }

    fn fail_pending(&self) {
        let table = self.inner.pending.lock().expect("pending lock").take();
        if let Some(table) = table {
            for (id, tx) in table {
                debug!("failing pending call {} on channel close", id);
                let _ = tx.send(Err(RpcError::ChannelClosed));
            }
        }
    }

    fn mark_closed(&self) {
        self.inner.closed_tx.send_replace(true);
    }

    /// Dispatch one inbound message body (single object or batch).
    async fn dispatch(&self, body: Value) {
        match body {
            Value::Array(items) => {
                if items.is_empty() {
                    // An empty batch is itself an Invalid Request.
                    let resp = error_response(Value::Null, ErrorObject::invalid_request());
                    let _ = self.write_value(&resp).await;
                    return;
                }
                // Batch elements run concurrently with no completion-order
                // guarantee among them; each response frame is written
                // individually as it becomes available.
                for item in items {
                    let handle = self.clone();
                    tokio::spawn(async move { handle.dispatch_single(item).await });
                }
            }
            other => self.dispatch_single(other).await,
        }
    }

    async fn dispatch_single(&self, item: Value) {
        let is_response = item
            .as_object()
            .map(|o| {
                !o.contains_key("method")
                    && o.contains_key("id")
                    && (o.contains_key("result") || o.contains_key("error"))
            })
            .unwrap_or(false);

        if is_response {
            self.complete_pending(&item);
        } else if let Some(response) = self.handle_call(&item).await {
            let _ = self.write_value(&response).await;
        }
    }

    /// Resolve the pending call matching an inbound response frame.
    fn complete_pending(&self, response: &Value) {
        let id = match response.get("id").and_then(Value::as_u64) {
            Some(id) => id,
            None => {
                warn!("discarding response with unusable id: {}", response);
                return;
            }
        };

        let sender = self
            .inner
            .pending
            .lock()
            .expect("pending lock")
            .as_mut()
            .and_then(|table| table.remove(&id));
        let Some(tx) = sender else {
            warn!("response for unknown request id {}", id);
            return;
        };

        let outcome = match response.get("error") {
            Some(err) => {
                let obj: ErrorObject = serde_json::from_value(err.clone()).unwrap_or_else(|_| {
                    ErrorObject::new(
                        crate::rpc::message::INTERNAL_ERROR,
                        "malformed error object in response",
                    )
                });
                Err(RpcError::Server {
                    code: obj.code,
                    message: obj.message,
                    data: obj.data,
                })
            }
            None => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }

    /// Validate and execute one inbound call. Returns the response to write,
    /// or `None` for notifications (which never get a response, even when
    /// their handler fails).
    async fn handle_call(&self, value: &Value) -> Option<Value> {
        match validate_call(value) {
            Validated::Invalid { id } => Some(error_response(id, ErrorObject::invalid_request())),

            Validated::Notification { method, params } => {
                let handler = self
                    .inner
                    .handlers
                    .lock()
                    .expect("handlers lock")
                    .get(&method)
                    .cloned();
                match handler {
                    Some(handler) => {
                        if let Err(e) = handler(params).await {
                            // Swallowed locally: notifications elicit no
                            // response of any kind.
                            warn!("notification handler '{}' failed: {:#}", method, e);
                        }
                    }
                    None => debug!("unhandled notification: {}", method),
                }
                None
            }

            Validated::Request { method, params, id } => {
                let handler = self
                    .inner
                    .handlers
                    .lock()
                    .expect("handlers lock")
                    .get(&method)
                    .cloned();
                let Some(handler) = handler else {
                    return Some(error_response(id, ErrorObject::method_not_found(&method)));
                };

                match handler(params).await {
                    Ok(result) => Some(success_response(id, result)),
                    Err(e) => {
                        let obj = match e.downcast::<ErrorObject>() {
                            // A handler that produced a well-formed protocol
                            // error passes through unchanged.
                            Ok(obj) => obj,
                            Err(e) => {
                                ErrorObject::internal(e.to_string(), Some(format!("{:?}", e)))
                            }
                        };
                        Some(error_response(id, obj))
                    }
                }
            }
        }
    }
}

/// The channel's read loop: pull bytes, decode frames, dispatch.
async fn read_loop(handle: RpcHandle, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];

    'outer: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("RPC peer closed the stream");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("RPC read failed: {}", e);
                break;
            }
        };
        decoder.push(&buf[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(Decoded::Frame(frame))) => handle.dispatch(frame.body).await,
                Ok(Some(Decoded::ParseError(msg))) => {
                    // Recoverable: answer Parse-Error with a null id and
                    // keep reading at the next frame boundary.
                    let resp = error_response(Value::Null, ErrorObject::parse_error(msg));
                    let _ = handle.write_value(&resp).await;
                }
                Ok(None) => break,
                Err(fatal) => {
                    // Framing is undecidable past this point; the stream is
                    // done and the owner must treat the peer as dead.
                    error!("fatal framing error, closing channel: {}", fatal);
                    break 'outer;
                }
            }
        }
    }

    handle.fail_pending();
    handle.mark_closed();
}
