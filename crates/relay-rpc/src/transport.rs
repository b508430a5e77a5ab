// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Newline-delimited JSON-RPC 2.0 framing over the subprocess's stdio.
//!
//! One JSON object per line, newline-terminated.  Outbound requests carry a
//! monotonic integer `id`; responses are correlated back to the waiting
//! caller through a pending map.  Inbound messages that carry a `method` are
//! dispatched to the notification channel handed out at construction time.
//!
//! # Parsing contract
//!
//! Lines are parsed leniently: a missing `jsonrpc` field is accepted (the
//! subprocess occasionally omits it); a present-but-wrong version is
//! rejected.  A message with `id` and `result`/`error` is a response; a
//! message with `method` is a notification (a server-initiated request keeps
//! its `id` attached so higher layers can echo it).  Unparseable lines are
//! dropped with a warning — the transport never crashes on malformed input.
//!
//! # Shutdown
//!
//! When the reader hits EOF (subprocess died) every pending request is
//! rejected with [`RpcError::Closed`].  [`JsonRpcTransport::stop`] rejects
//! pending requests with [`RpcError::Stopped`] and makes all subsequent
//! `request` calls fail immediately.  A supervisor is expected to restart
//! the subprocess and build a fresh transport.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::types::RpcError;

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An inbound message that carried a `method`.
///
/// Server-initiated requests (method **and** id) are delivered here too,
/// with the id preserved, because the subprocess expects them to be answered
/// via a follow-up RPC rather than a JSON-RPC response frame.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Value,
    pub id: Option<Value>,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>;

struct Inner {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    stopped: AtomicBool,
    timeout: Duration,
}

/// JSON-RPC 2.0 over a byte stream pair, one object per line.
#[derive(Clone)]
pub struct JsonRpcTransport {
    inner: Arc<Inner>,
}

impl JsonRpcTransport {
    /// Build a transport over the given reader/writer pair and return it
    /// together with the notification receiver.
    ///
    /// Spawns the reader task immediately.
    pub fn new<R, W>(reader: R, writer: W, timeout: Duration) -> (Self, mpsc::Receiver<Notification>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (notify_tx, notify_rx) = mpsc::channel(1024);
        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            timeout,
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        Self::dispatch_line(&reader_inner, &line, &notify_tx).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("rpc read error: {e}");
                        break;
                    }
                }
            }
            debug!("rpc reader finished, rejecting in-flight requests");
            reject_all(&reader_inner.pending, || RpcError::Closed);
            reader_inner.stopped.store(true, Ordering::SeqCst);
        });

        (Self { inner }, notify_rx)
    }

    async fn dispatch_line(inner: &Arc<Inner>, line: &str, notify_tx: &mpsc::Sender<Notification>) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("dropping unparseable rpc line: {e}");
                return;
            }
        };
        let Some(obj) = value.as_object() else {
            warn!("dropping non-object rpc message");
            return;
        };

        // Lenient version check: absent is normalised to 2.0, wrong is fatal
        // for the message only.
        if let Some(version) = obj.get("jsonrpc").and_then(Value::as_str) {
            if version != "2.0" {
                warn!(version, "dropping message with unsupported jsonrpc version");
                return;
            }
        }

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let note = Notification {
                method: method.to_string(),
                params: obj.get("params").cloned().unwrap_or(Value::Null),
                id: obj.get("id").cloned(),
            };
            if notify_tx.send(note).await.is_err() {
                debug!("notification receiver dropped");
            }
            return;
        }

        if obj.contains_key("result") || obj.contains_key("error") {
            let Some(id) = obj.get("id").and_then(Value::as_u64) else {
                warn!("dropping response without integer id");
                return;
            };
            let entry = inner.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
            let Some(tx) = entry else {
                debug!(id, "response for unknown or timed-out request");
                return;
            };
            let outcome = if let Some(err) = obj.get("error") {
                Err(RpcError::Rpc {
                    code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                    data: err.get("data").cloned(),
                })
            } else {
                Ok(obj.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = tx.send(outcome);
            return;
        }

        warn!("dropping message that is neither response nor notification");
    }

    /// Issue a request and wait for the matching response or the deadline.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(RpcError::Stopped);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, tx);

        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if let Err(e) = self.write_frame(&frame).await {
            self.evict(id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a value: the transport was torn down.
            Ok(Err(_)) => Err(RpcError::Stopped),
            Err(_) => {
                self.evict(id);
                Err(RpcError::Timeout(self.inner.timeout))
            }
        }
    }

    /// Write a request with no `id` (fire-and-forget).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(RpcError::Stopped);
        }
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.write_frame(&frame).await
    }

    /// Reject every pending request and fail all future ones.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        reject_all(&self.inner.pending, || RpcError::Stopped);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn evict(&self, id: u64) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
    }

    async fn write_frame(&self, frame: &Value) -> Result<(), RpcError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn reject_all(pending: &PendingMap, err: impl Fn() -> RpcError) {
    let entries: Vec<_> = pending
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .drain()
        .collect();
    for (_, tx) in entries {
        let _ = tx.send(Err(err()));
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
