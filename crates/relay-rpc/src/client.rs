// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Typed facade over the JSON-RPC transport.
//!
//! Translates the subprocess's heterogeneous notification vocabulary into
//! the small stable [`AgentEvent`] set and exposes the RPC surface as typed
//! methods.  Consumers subscribe via [`AgentClient::subscribe`]; events fan
//! out on a broadcast channel the same way gateway operators receive control
//! events.
//!
//! # Deduplication
//!
//! The subprocess habitually emits the same delta under two method names
//! within the same tick.  Delta-bearing events are keyed by their first 100
//! characters and dropped when an identical key was seen within the last
//! 100 ms — the first one wins.  `turn/completed` and the legacy
//! `codex/event/task_complete` can both arrive for one turn; only the first
//! is surfaced.  `context:turnId` is emitted once per (thread, turn) pair.

use std::{
    collections::HashSet,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use lru::LruCache;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::{
    events::{self, AgentEvent},
    transport::{JsonRpcTransport, Notification},
    types::{ApprovalDecision, RpcError, ThreadInfo, TurnStatus},
};

/// Identity window for duplicate deltas.
pub const DELTA_DEDUP_TTL: Duration = Duration::from_millis(100);
/// First N characters of a delta determine its identity.
const DELTA_KEY_CHARS: usize = 100;

// ── Delta dedup ───────────────────────────────────────────────────────────────

/// LRU of recently seen delta prefixes with a TTL; first sighting wins.
pub(crate) struct DeltaDedup {
    cache: LruCache<String, Instant>,
    ttl: Duration,
}

impl DeltaDedup {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(256).unwrap_or(NonZeroUsize::MIN)),
            ttl,
        }
    }

    /// Returns true when the content should be propagated.
    pub(crate) fn admit_at(&mut self, content: &str, now: Instant) -> bool {
        // Evict expired entries from the cold end.
        while self
            .cache
            .peek_lru()
            .map(|(_, seen)| now.duration_since(*seen) >= self.ttl)
            .unwrap_or(false)
        {
            self.cache.pop_lru();
        }

        let key: String = content.chars().take(DELTA_KEY_CHARS).collect();
        if let Some(seen) = self.cache.peek(&key) {
            if now.duration_since(*seen) < self.ttl {
                return false;
            }
        }
        self.cache.put(key, now);
        true
    }

    fn admit(&mut self, content: &str) -> bool {
        self.admit_at(content, Instant::now())
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Typed client for the coding subprocess.
pub struct AgentClient {
    transport: JsonRpcTransport,
    event_tx: broadcast::Sender<AgentEvent>,
    dedup: Mutex<DeltaDedup>,
    seen_context: Mutex<HashSet<(String, String)>>,
    completed_turns: Mutex<HashSet<(String, String)>>,
}

impl AgentClient {
    /// Wrap a transport and start the notification pump.
    pub fn new(
        transport: JsonRpcTransport,
        mut notifications: mpsc::Receiver<Notification>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(1024);
        let client = Arc::new(Self {
            transport,
            event_tx,
            dedup: Mutex::new(DeltaDedup::new(DELTA_DEDUP_TTL)),
            seen_context: Mutex::new(HashSet::new()),
            completed_turns: Mutex::new(HashSet::new()),
        });

        let pump = client.clone();
        tokio::spawn(async move {
            while let Some(note) = notifications.recv().await {
                pump.handle_notification(note);
            }
            debug!("notification pump finished");
        });

        client
    }

    /// Subscribe to the normalised event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the underlying transport, failing all in-flight requests.
    pub fn stop(&self) {
        self.transport.stop();
    }

    fn emit(&self, ev: AgentEvent) {
        // No subscribers is fine (startup, shutdown).
        let _ = self.event_tx.send(ev);
    }

    // ── Notification pump ─────────────────────────────────────────────────────

    fn handle_notification(&self, note: Notification) {
        let method = note.method.as_str();
        let params = &note.params;

        self.maybe_emit_context(params);

        match method {
            "turn/started" | "codex/event/task_started" => {
                self.emit(AgentEvent::TurnStarted {
                    thread_id: events::thread_id(params).unwrap_or_default(),
                    turn_id: events::turn_id(params).unwrap_or_default(),
                });
            }
            "turn/completed" | "codex/event/task_complete" => {
                let thread = events::thread_id(params).unwrap_or_default();
                let turn = events::turn_id(params).unwrap_or_default();
                let first = self
                    .completed_turns
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert((thread.clone(), turn.clone()));
                if first {
                    self.emit(AgentEvent::TurnCompleted {
                        thread_id: thread,
                        turn_id: turn,
                        status: events::turn_status(params),
                    });
                } else {
                    debug!(%turn, "suppressing duplicate turn completion");
                }
            }
            "codex/event/token_count" | "thread/tokenUsage/updated" => {
                self.emit(AgentEvent::TokensUpdated {
                    thread_id: events::thread_id(params).unwrap_or_default(),
                    usage: events::parse_usage(params),
                });
            }
            "item/commandExecution/requestApproval"
            | "item/fileChange/requestApproval"
            | "codex/event/exec_approval_request"
            | "codex/event/apply_patch_approval_request" => {
                self.emit(AgentEvent::ApprovalRequested(events::parse_approval(
                    method,
                    params,
                    note.id.as_ref(),
                )));
            }
            "codex/event/exec_command_begin" => {
                self.emit(AgentEvent::ExecBegin {
                    thread_id: events::thread_id(params).unwrap_or_default(),
                    item_id: events::item_id(params).unwrap_or_default(),
                    command: exec_command(params),
                });
            }
            "codex/event/exec_command_output_delta" => {
                if let Some(chunk) = self.admitted_delta(params) {
                    self.emit(AgentEvent::ExecOutput {
                        thread_id: events::thread_id(params).unwrap_or_default(),
                        item_id: events::item_id(params).unwrap_or_default(),
                        chunk,
                    });
                }
            }
            "codex/event/exec_command_end" => {
                self.emit(AgentEvent::ExecEnd {
                    thread_id: events::thread_id(params).unwrap_or_default(),
                    item_id: events::item_id(params).unwrap_or_default(),
                    exit_code: events::exit_code(params),
                });
            }
            "codex/event/web_search_begin" => {
                self.emit(AgentEvent::WebSearchStarted {
                    thread_id: events::thread_id(params).unwrap_or_default(),
                    item_id: events::item_id(params).unwrap_or_default(),
                    query: search_query(params),
                });
            }
            "codex/event/web_search_end" => {
                self.emit(AgentEvent::WebSearchCompleted {
                    thread_id: events::thread_id(params).unwrap_or_default(),
                    item_id: events::item_id(params).unwrap_or_default(),
                    query: search_query(params),
                });
            }
            "item/started" => self.handle_item_started(params),
            "item/completed" => self.handle_item_completed(params),
            m if is_item_delta(m) => self.handle_item_delta(m, params),
            _ => {
                // Fallback: output-bearing notifications that fit no event.
                if let Some(chunk) = self.admitted_delta(params) {
                    self.emit(AgentEvent::CommandOutput {
                        thread_id: events::thread_id(params).unwrap_or_default(),
                        item_id: events::item_id(params).unwrap_or_default(),
                        chunk,
                    });
                } else {
                    debug!(method, "ignoring unrecognised notification");
                }
            }
        }
    }

    fn handle_item_started(&self, params: &Value) {
        let thread_id = events::thread_id(params).unwrap_or_default();
        let item_id = events::item_id(params).unwrap_or_default();
        let item_type = events::item_type(params);
        match classify_item(&item_type) {
            ItemClass::Thinking => self.emit(AgentEvent::ThinkingStarted { thread_id, item_id }),
            ItemClass::Tool => self.emit(AgentEvent::ToolStart {
                thread_id,
                item_id,
                tool: tool_display_name(params, &item_type),
                input: events::tool_input(params),
            }),
            ItemClass::Plain => self.emit(AgentEvent::ItemStarted {
                thread_id,
                item_id,
                item_type,
            }),
        }
    }

    fn handle_item_completed(&self, params: &Value) {
        let thread_id = events::thread_id(params).unwrap_or_default();
        let item_id = events::item_id(params).unwrap_or_default();
        let item_type = events::item_type(params);
        match classify_item(&item_type) {
            ItemClass::Thinking => self.emit(AgentEvent::ThinkingComplete {
                thread_id,
                item_id,
                duration_ms: events::duration_ms(params),
            }),
            ItemClass::Tool => {
                let error_message = params
                    .get("error")
                    .and_then(|e| e.as_str().map(str::to_string).or_else(|| {
                        e.get("message").and_then(Value::as_str).map(str::to_string)
                    }));
                let is_error = params
                    .get("isError")
                    .or_else(|| params.get("is_error"))
                    .and_then(Value::as_bool)
                    .unwrap_or(error_message.is_some());
                self.emit(AgentEvent::ToolComplete {
                    thread_id,
                    item_id,
                    tool: tool_display_name(params, &item_type),
                    duration_ms: events::duration_ms(params),
                    output: tool_output(params),
                    is_error,
                    error_message,
                    metrics: events::tool_metrics(params),
                });
            }
            ItemClass::Plain => self.emit(AgentEvent::ItemCompleted {
                thread_id,
                item_id,
                item_type,
                text: events::delta_text(params),
            }),
        }
    }

    fn handle_item_delta(&self, method: &str, params: &Value) {
        let Some(text) = self.admitted_delta(params) else {
            return;
        };
        let thread_id = events::thread_id(params).unwrap_or_default();
        let item_id = events::item_id(params).unwrap_or_default();
        let segment = method.split('/').nth(1).unwrap_or_default();
        match classify_item(segment) {
            ItemClass::Thinking => self.emit(AgentEvent::ThinkingDelta {
                thread_id,
                item_id,
                text,
            }),
            ItemClass::Tool => {
                if segment.eq_ignore_ascii_case("fileChange")
                    || segment.eq_ignore_ascii_case("file_change")
                {
                    self.emit(AgentEvent::FileChangeDelta {
                        thread_id,
                        item_id,
                        text,
                    });
                } else {
                    self.emit(AgentEvent::ExecOutput {
                        thread_id,
                        item_id,
                        chunk: text,
                    });
                }
            }
            ItemClass::Plain => self.emit(AgentEvent::ItemDelta {
                thread_id,
                item_id,
                text,
            }),
        }
    }

    /// Extract a delta and run it through the dedup window.
    fn admitted_delta(&self, params: &Value) -> Option<String> {
        let text = events::delta_text(params)?;
        let admitted = self
            .dedup
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .admit(&text);
        if admitted {
            Some(text)
        } else {
            debug!("suppressing duplicate delta");
            None
        }
    }

    /// Emit `context:turnId` once per (thread, turn); empty fields never emit.
    fn maybe_emit_context(&self, params: &Value) {
        let (Some(thread), Some(turn)) = (events::thread_id(params), events::turn_id(params))
        else {
            return;
        };
        if thread.is_empty() || turn.is_empty() {
            return;
        }
        let first = self
            .seen_context
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((thread.clone(), turn.clone()));
        if first {
            self.emit(AgentEvent::ContextTurnId {
                thread_id: thread,
                turn_id: turn,
            });
        }
    }

    // ── Typed RPC surface ─────────────────────────────────────────────────────

    pub async fn initialize(&self) -> Result<(), RpcError> {
        self.transport
            .request(
                "initialize",
                json!({"clientInfo": {"name": "relay", "version": env!("CARGO_PKG_VERSION")}}),
            )
            .await?;
        Ok(())
    }

    pub async fn thread_start(&self, working_directory: &str) -> Result<ThreadInfo, RpcError> {
        let result = self
            .transport
            .request("thread/start", json!({"workingDirectory": working_directory}))
            .await?;
        ThreadInfo::from_result(&result)
    }

    pub async fn thread_resume(&self, thread_id: &str) -> Result<ThreadInfo, RpcError> {
        let result = self
            .transport
            .request("thread/resume", json!({"threadId": thread_id}))
            .await?;
        ThreadInfo::from_result(&result)
    }

    /// Read a thread; with `include_turns` the ordered turn-id list comes back.
    pub async fn thread_read(
        &self,
        thread_id: &str,
        include_turns: bool,
    ) -> Result<(ThreadInfo, Vec<String>), RpcError> {
        let result = self
            .transport
            .request(
                "thread/read",
                json!({"threadId": thread_id, "includeTurns": include_turns}),
            )
            .await?;
        let info = ThreadInfo::from_result(&result)?;
        let turns = result
            .get("turns")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| {
                        t.get("id")
                            .and_then(Value::as_str)
                            .or_else(|| t.as_str())
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok((info, turns))
    }

    /// Full-copy fork with no turn selection.
    pub async fn thread_fork(&self, thread_id: &str) -> Result<ThreadInfo, RpcError> {
        let result = self
            .transport
            .request("thread/fork", json!({"threadId": thread_id}))
            .await?;
        ThreadInfo::from_result(&result)
    }

    /// Drop the last `num_turns` turns. `num_turns = 0` is refused locally.
    pub async fn thread_rollback(
        &self,
        thread_id: &str,
        num_turns: usize,
    ) -> Result<ThreadInfo, RpcError> {
        if num_turns < 1 {
            return Err(RpcError::InvalidParams(
                "rollback requires numTurns >= 1".to_string(),
            ));
        }
        let result = self
            .transport
            .request(
                "thread/rollback",
                json!({"threadId": thread_id, "numTurns": num_turns}),
            )
            .await?;
        ThreadInfo::from_result(&result)
    }

    pub async fn turn_start(&self, params: TurnStartParams) -> Result<(), RpcError> {
        let mut body = serde_json::Map::new();
        body.insert("threadId".to_string(), json!(params.thread_id));
        body.insert(
            "input".to_string(),
            json!([{"type": "text", "text": params.text}]),
        );
        if let Some(model) = params.model {
            body.insert("model".to_string(), json!(model));
        }
        if let Some(effort) = params.reasoning_effort {
            body.insert("reasoningEffort".to_string(), json!(effort));
        }
        if let Some(policy) = params.approval_policy {
            body.insert("approvalPolicy".to_string(), json!(policy));
        }
        self.transport
            .request("turn/start", Value::Object(body))
            .await?;
        Ok(())
    }

    /// Fire-and-forget interrupt. An empty `turn_id` is refused locally —
    /// no RPC is emitted.
    pub async fn turn_interrupt(&self, thread_id: &str, turn_id: &str) -> Result<(), RpcError> {
        if turn_id.trim().is_empty() {
            return Err(RpcError::InvalidParams(
                "turn_interrupt requires a non-empty turnId".to_string(),
            ));
        }
        self.transport
            .notify(
                "turn/interrupt",
                json!({"threadId": thread_id, "turnId": turn_id}),
            )
            .await
    }

    pub async fn approval_respond(
        &self,
        request_id: &Value,
        decision: ApprovalDecision,
    ) -> Result<(), RpcError> {
        self.transport
            .request(
                "approval/respond",
                json!({"id": request_id, "decision": decision.as_str()}),
            )
            .await?;
        Ok(())
    }

    // ── Fork algebra ──────────────────────────────────────────────────────────

    /// Fork `thread_id` at `turn_index`, keeping turns `0..=turn_index`.
    ///
    /// The subprocess is the source of truth for the turn count; the bridge
    /// never trusts its own cache here.  Forking at the last turn skips the
    /// rollback entirely.
    pub async fn fork_at_turn(
        &self,
        thread_id: &str,
        turn_index: usize,
    ) -> Result<ThreadInfo, RpcError> {
        let (_, turns) = self.thread_read(thread_id, true).await?;
        let total = turns.len();
        if turn_index >= total {
            return Err(RpcError::InvalidParams(format!(
                "turn index {turn_index} out of range (thread has {total} turns)"
            )));
        }
        let forked = self.thread_fork(thread_id).await?;
        let rollback = total - (turn_index + 1);
        if rollback > 0 {
            self.thread_rollback(&forked.id, rollback).await?;
        }
        Ok(forked)
    }

    /// Locate a turn id in a thread dump, trying the notification vocabulary
    /// (`"n"`) against the read vocabulary (`"turn-<n+1>"`) when the direct
    /// comparison misses.
    pub async fn find_turn_index(
        &self,
        thread_id: &str,
        turn_id: &str,
    ) -> Result<Option<usize>, RpcError> {
        let (_, turns) = self.thread_read(thread_id, true).await?;
        if let Some(i) = turns.iter().position(|t| t == turn_id) {
            return Ok(Some(i));
        }
        if let Ok(n) = turn_id.parse::<usize>() {
            let alt = format!("turn-{}", n + 1);
            if let Some(i) = turns.iter().position(|t| t == &alt) {
                return Ok(Some(i));
            }
        }
        warn!(%thread_id, %turn_id, "turn id not found in thread dump");
        Ok(None)
    }
}

/// Parameters for `turn/start`.
#[derive(Debug, Clone, Default)]
pub struct TurnStartParams {
    pub thread_id: String,
    pub text: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub approval_policy: Option<String>,
}

// ── Classification helpers ────────────────────────────────────────────────────

enum ItemClass {
    Thinking,
    Tool,
    Plain,
}

fn classify_item(item_type: &str) -> ItemClass {
    let norm: String = item_type
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .collect::<String>()
        .to_ascii_lowercase();
    match norm.as_str() {
        "reasoning" | "thinking" => ItemClass::Thinking,
        "commandexecution" | "localshellcall" | "mcptoolcall" | "toolcall" | "tooluse"
        | "websearch" | "websearchcall" | "filechange" | "patchapply" => ItemClass::Tool,
        _ => ItemClass::Plain,
    }
}

fn is_item_delta(method: &str) -> bool {
    method.starts_with("item/")
        && (method.ends_with("/delta")
            || method.ends_with("/outputDelta")
            || method.ends_with("/output_delta"))
}

fn tool_display_name(params: &Value, item_type: &str) -> String {
    params
        .get("tool")
        .or_else(|| params.get("toolName"))
        .or_else(|| params.get("tool_name"))
        .or_else(|| params.get("item").and_then(|i| i.get("tool")))
        .and_then(Value::as_str)
        .unwrap_or(item_type)
        .to_string()
}

fn tool_output(params: &Value) -> Option<String> {
    events::delta_text(params).or_else(|| {
        params
            .get("result")
            .or_else(|| params.get("aggregatedOutput"))
            .or_else(|| params.get("aggregated_output"))
            .or_else(|| params.get("item").and_then(|i| i.get("output")))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

fn exec_command(params: &Value) -> Option<String> {
    match params
        .get("command")
        .or_else(|| params.get("msg").and_then(|m| m.get("command")))
    {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

fn search_query(params: &Value) -> Option<String> {
    params
        .get("query")
        .or_else(|| params.get("msg").and_then(|m| m.get("query")))
        .and_then(Value::as_str)
        .map(str::to_string)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DEFAULT_REQUEST_TIMEOUT;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Spawn an in-memory peer that answers RPCs via `respond` and records
    /// every (method, params) it sees.
    fn scripted_client(
        respond: impl Fn(&str, &Value) -> Option<Value> + Send + 'static,
    ) -> (Arc<AgentClient>, Arc<Mutex<Vec<(String, Value)>>>) {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        let (transport, notify_rx) =
            JsonRpcTransport::new(our_read, our_write, DEFAULT_REQUEST_TIMEOUT);
        let client = AgentClient::new(transport, notify_rx);

        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(their_read);
            let mut writer = their_write;
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let Ok(req) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                let method = req["method"].as_str().unwrap_or_default().to_string();
                let params = req.get("params").cloned().unwrap_or(Value::Null);
                log2.lock().unwrap().push((method.clone(), params.clone()));
                if let Some(id) = req.get("id") {
                    if let Some(result) = respond(&method, &params) {
                        let resp = json!({"jsonrpc": "2.0", "id": id, "result": result});
                        let _ = writer.write_all(format!("{resp}\n").as_bytes()).await;
                    }
                }
            }
        });

        (client, log)
    }

    /// Client whose peer can also inject notifications.
    fn client_with_injector() -> (
        Arc<AgentClient>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (_their_read, their_write) = tokio::io::split(theirs);
        let (transport, notify_rx) =
            JsonRpcTransport::new(our_read, our_write, DEFAULT_REQUEST_TIMEOUT);
        (AgentClient::new(transport, notify_rx), their_write)
    }

    async fn inject(
        writer: &mut tokio::io::WriteHalf<tokio::io::DuplexStream>,
        frame: Value,
    ) {
        writer
            .write_all(format!("{frame}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn next_event(rx: &mut broadcast::Receiver<AgentEvent>) -> AgentEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no event within 1s")
            .expect("event channel closed")
    }

    // ── Dedup window ──────────────────────────────────────────────────────────

    #[test]
    fn duplicate_delta_within_ttl_is_rejected() {
        let mut d = DeltaDedup::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(d.admit_at("hello world", t0));
        assert!(!d.admit_at("hello world", t0 + Duration::from_millis(50)));
    }

    #[test]
    fn delta_readmitted_after_ttl() {
        let mut d = DeltaDedup::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(d.admit_at("hello", t0));
        assert!(d.admit_at("hello", t0 + Duration::from_millis(150)));
    }

    #[test]
    fn dedup_identity_is_first_hundred_chars() {
        let mut d = DeltaDedup::new(Duration::from_millis(100));
        let t0 = Instant::now();
        let a = format!("{}tail-one", "x".repeat(100));
        let b = format!("{}tail-two", "x".repeat(100));
        assert!(d.admit_at(&a, t0));
        // Same first 100 chars → same identity, rejected.
        assert!(!d.admit_at(&b, t0 + Duration::from_millis(10)));
    }

    #[test]
    fn distinct_deltas_both_admitted() {
        let mut d = DeltaDedup::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(d.admit_at("alpha", t0));
        assert!(d.admit_at("beta", t0));
    }

    // ── Notification pump ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn turn_started_emits_context_then_event() {
        let (client, mut injector) = client_with_injector();
        let mut rx = client.subscribe();
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "turn/started",
                    "params": {"threadId": "t-1", "turnId": "0"}}),
        )
        .await;

        match next_event(&mut rx).await {
            AgentEvent::ContextTurnId { thread_id, turn_id } => {
                assert_eq!(thread_id, "t-1");
                assert_eq!(turn_id, "0");
            }
            other => panic!("expected ContextTurnId, got {other:?}"),
        }
        match next_event(&mut rx).await {
            AgentEvent::TurnStarted { thread_id, turn_id } => {
                assert_eq!(thread_id, "t-1");
                assert_eq!(turn_id, "0");
            }
            other => panic!("expected TurnStarted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn context_turn_id_is_first_writer_wins() {
        let (client, mut injector) = client_with_injector();
        let mut rx = client.subscribe();
        for _ in 0..2 {
            inject(
                &mut injector,
                json!({"jsonrpc": "2.0", "method": "turn/started",
                        "params": {"threadId": "t-1", "turnId": "0"}}),
            )
            .await;
        }
        let mut contexts = 0;
        let mut starts = 0;
        for _ in 0..3 {
            match next_event(&mut rx).await {
                AgentEvent::ContextTurnId { .. } => contexts += 1,
                AgentEvent::TurnStarted { .. } => starts += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(contexts, 1, "context must be emitted exactly once per pair");
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn empty_turn_id_never_emits_context() {
        let (client, mut injector) = client_with_injector();
        let mut rx = client.subscribe();
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "turn/started",
                    "params": {"threadId": "t-1", "turnId": ""}}),
        )
        .await;
        match next_event(&mut rx).await {
            AgentEvent::TurnStarted { .. } => {}
            other => panic!("expected TurnStarted only, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_turn_completed_is_suppressed() {
        let (client, mut injector) = client_with_injector();
        let mut rx = client.subscribe();
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "codex/event/task_complete",
                    "params": {"msg": {"thread_id": "t-1", "turn_id": "0"}}}),
        )
        .await;
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "turn/completed",
                    "params": {"threadId": "t-1", "turnId": "0", "status": "completed"}}),
        )
        .await;
        // ContextTurnId, then exactly one TurnCompleted.
        let mut completions = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(AgentEvent::TurnCompleted { .. })) => completions += 1,
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn same_delta_under_two_methods_propagates_once() {
        let (client, mut injector) = client_with_injector();
        let mut rx = client.subscribe();
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "item/agentMessage/delta",
                    "params": {"itemId": "i1", "delta": "the same text"}}),
        )
        .await;
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "codex/event/agent_message_delta",
                    "params": {"msg": {"call_id": "i1", "delta": "the same text"}}}),
        )
        .await;
        let mut deltas = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(AgentEvent::ItemDelta { .. } | AgentEvent::CommandOutput { .. })) => {
                    deltas += 1
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert_eq!(deltas, 1, "identical delta within 100ms must collapse");
    }

    #[tokio::test]
    async fn reasoning_item_maps_to_thinking_events() {
        let (client, mut injector) = client_with_injector();
        let mut rx = client.subscribe();
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "item/started",
                    "params": {"item": {"id": "r1", "item_type": "reasoning"}}}),
        )
        .await;
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "item/reasoning/delta",
                    "params": {"itemId": "r1", "delta": "pondering"}}),
        )
        .await;
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "item/completed",
                    "params": {"item": {"id": "r1", "item_type": "reasoning"}, "durationMs": 900}}),
        )
        .await;

        assert!(matches!(
            next_event(&mut rx).await,
            AgentEvent::ThinkingStarted { ref item_id, .. } if item_id == "r1"
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            AgentEvent::ThinkingDelta { ref text, .. } if text == "pondering"
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            AgentEvent::ThinkingComplete { duration_ms: Some(900), .. }
        ));
    }

    #[tokio::test]
    async fn command_execution_item_maps_to_tool_events() {
        let (client, mut injector) = client_with_injector();
        let mut rx = client.subscribe();
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "item/started",
                    "params": {"itemId": "c1", "itemType": "commandExecution",
                               "input": {"command": "ls"}}}),
        )
        .await;
        inject(
            &mut injector,
            json!({"jsonrpc": "2.0", "method": "item/completed",
                    "params": {"itemId": "c1", "itemType": "commandExecution",
                               "durationMs": 1500, "output": "a.txt", "matchCount": 42}}),
        )
        .await;

        match next_event(&mut rx).await {
            AgentEvent::ToolStart {
                item_id, tool, input, ..
            } => {
                assert_eq!(item_id, "c1");
                assert_eq!(tool, "commandExecution");
                assert_eq!(input.unwrap()["command"], "ls");
            }
            other => panic!("expected ToolStart, got {other:?}"),
        }
        match next_event(&mut rx).await {
            AgentEvent::ToolComplete {
                duration_ms,
                output,
                is_error,
                metrics,
                ..
            } => {
                assert_eq!(duration_ms, Some(1500));
                assert_eq!(output.as_deref(), Some("a.txt"));
                assert!(!is_error);
                assert_eq!(metrics.match_count, Some(42));
            }
            other => panic!("expected ToolComplete, got {other:?}"),
        }
    }

    // ── Local refusals ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn rollback_zero_is_refused_before_any_rpc() {
        let (client, log) = scripted_client(|_, _| Some(json!({})));
        let err = client.thread_rollback("t-1", 0).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty(), "no RPC may be emitted");
    }

    #[tokio::test]
    async fn interrupt_with_empty_turn_id_emits_no_rpc() {
        let (client, log) = scripted_client(|_, _| Some(json!({})));
        let err = client.turn_interrupt("t-1", "").await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));
        let err = client.turn_interrupt("t-1", "   ").await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty(), "no RPC may be emitted");
    }

    #[tokio::test]
    async fn interrupt_with_turn_id_sends_notification() {
        let (client, log) = scripted_client(|_, _| Some(json!({})));
        client.turn_interrupt("t-1", "0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "turn/interrupt");
        assert_eq!(log[0].1["turnId"], "0");
    }

    // ── Fork algebra ──────────────────────────────────────────────────────────

    fn three_turn_server(method: &str, params: &Value) -> Option<Value> {
        match method {
            "thread/read" => Some(json!({
                "thread": {"id": params["threadId"]},
                "turns": [{"id": "turn-1"}, {"id": "turn-2"}, {"id": "turn-3"}],
            })),
            "thread/fork" => Some(json!({"thread": {"id": "forked-1"}})),
            "thread/rollback" => Some(json!({"thread": {"id": params["threadId"]}})),
            _ => Some(json!({})),
        }
    }

    #[tokio::test]
    async fn fork_at_middle_turn_rolls_back_one() {
        let (client, log) = scripted_client(three_turn_server);
        let forked = client.fork_at_turn("src", 1).await.unwrap();
        assert_eq!(forked.id, "forked-1");
        let log = log.lock().unwrap();
        let methods: Vec<&str> = log.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(methods, vec!["thread/read", "thread/fork", "thread/rollback"]);
        assert_eq!(log[2].1["numTurns"], 1);
        assert_eq!(log[2].1["threadId"], "forked-1");
    }

    #[tokio::test]
    async fn fork_at_first_turn_of_three_rolls_back_two() {
        let (client, log) = scripted_client(three_turn_server);
        client.fork_at_turn("src", 0).await.unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.last().unwrap().1["numTurns"], 2);
    }

    #[tokio::test]
    async fn fork_at_last_turn_skips_rollback() {
        let (client, log) = scripted_client(three_turn_server);
        client.fork_at_turn("src", 2).await.unwrap();
        let log = log.lock().unwrap();
        let methods: Vec<&str> = log.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(methods, vec!["thread/read", "thread/fork"]);
    }

    #[tokio::test]
    async fn fork_out_of_range_is_refused_before_forking() {
        let (client, log) = scripted_client(three_turn_server);
        let err = client.fork_at_turn("src", 3).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));
        let log = log.lock().unwrap();
        let methods: Vec<&str> = log.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(methods, vec!["thread/read"], "fork must not run");
    }

    #[tokio::test]
    async fn find_turn_index_uses_vocabulary_fallback() {
        let (client, _log) = scripted_client(three_turn_server);
        // Notification vocabulary "1" matches read vocabulary "turn-2".
        assert_eq!(client.find_turn_index("src", "1").await.unwrap(), Some(1));
        // Direct match also works.
        assert_eq!(
            client.find_turn_index("src", "turn-3").await.unwrap(),
            Some(2)
        );
        // A turn that genuinely does not exist resolves to None — if this
        // starts failing for real turns the subprocess vocabulary changed.
        assert_eq!(client.find_turn_index("src", "9").await.unwrap(), None);
    }
}
