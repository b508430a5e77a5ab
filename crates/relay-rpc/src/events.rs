// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Event normalisation for the subprocess's heterogeneous notifications.
//!
//! The subprocess emits the same information under camelCase and snake_case
//! names, sometimes flat and sometimes nested under `msg` — occasionally in
//! the same session.  Everything inbound goes through the accessors below,
//! which try each spelling in a fixed priority order, so raw maps never leak
//! into core logic.

use serde_json::Value;

use crate::types::{ApprovalKind, ApprovalRequest, FileChange, TokenUsage, TurnStatus};

/// The stable event set emitted to bridge consumers.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    TurnStarted {
        thread_id: String,
        turn_id: String,
    },
    TurnCompleted {
        thread_id: String,
        turn_id: String,
        status: TurnStatus,
    },
    ItemStarted {
        thread_id: String,
        item_id: String,
        item_type: String,
    },
    ItemDelta {
        thread_id: String,
        item_id: String,
        text: String,
    },
    ItemCompleted {
        thread_id: String,
        item_id: String,
        item_type: String,
        text: Option<String>,
    },
    ToolStart {
        thread_id: String,
        item_id: String,
        tool: String,
        input: Option<Value>,
    },
    ToolComplete {
        thread_id: String,
        item_id: String,
        tool: String,
        duration_ms: Option<u64>,
        output: Option<String>,
        is_error: bool,
        error_message: Option<String>,
        metrics: ToolMetrics,
    },
    ThinkingStarted {
        thread_id: String,
        item_id: String,
    },
    ThinkingDelta {
        thread_id: String,
        item_id: String,
        text: String,
    },
    ThinkingComplete {
        thread_id: String,
        item_id: String,
        duration_ms: Option<u64>,
    },
    ExecBegin {
        thread_id: String,
        item_id: String,
        command: Option<String>,
    },
    ExecOutput {
        thread_id: String,
        item_id: String,
        chunk: String,
    },
    ExecEnd {
        thread_id: String,
        item_id: String,
        exit_code: Option<i64>,
    },
    WebSearchStarted {
        thread_id: String,
        item_id: String,
        query: Option<String>,
    },
    WebSearchCompleted {
        thread_id: String,
        item_id: String,
        query: Option<String>,
    },
    FileChangeDelta {
        thread_id: String,
        item_id: String,
        text: String,
    },
    TokensUpdated {
        thread_id: String,
        usage: TokenUsage,
    },
    ApprovalRequested(ApprovalRequest),
    /// First sighting of a (thread, turn) pair on any notification.
    ContextTurnId {
        thread_id: String,
        turn_id: String,
    },
    /// Fallback for output-bearing notifications that fit no other event.
    CommandOutput {
        thread_id: String,
        item_id: String,
        chunk: String,
    },
}

/// Per-tool counters surfaced in tool-complete payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolMetrics {
    pub line_count: Option<u64>,
    pub match_count: Option<u64>,
    pub lines_added: Option<u64>,
    pub lines_removed: Option<u64>,
}

// ── Field accessors (priority order is load-bearing) ─────────────────────────

fn str_at<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str()
}

fn value_at<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = v;
    for key in path {
        cur = cur.get(key)?;
    }
    Some(cur)
}

/// `msg.call_id ∨ itemId ∨ item_id ∨ id ∨ item.id`
pub fn item_id(v: &Value) -> Option<String> {
    str_at(v, &["msg", "call_id"])
        .or_else(|| str_at(v, &["itemId"]))
        .or_else(|| str_at(v, &["item_id"]))
        .or_else(|| str_at(v, &["id"]))
        .or_else(|| str_at(v, &["item", "id"]))
        .map(str::to_string)
}

/// `conversationId ∨ threadId ∨ thread_id ∨ msg.thread_id`
pub fn thread_id(v: &Value) -> Option<String> {
    str_at(v, &["conversationId"])
        .or_else(|| str_at(v, &["threadId"]))
        .or_else(|| str_at(v, &["thread_id"]))
        .or_else(|| str_at(v, &["msg", "thread_id"]))
        .map(str::to_string)
}

/// `msg.turn_id ∨ turnId ∨ turn_id ∨ turn.id`
pub fn turn_id(v: &Value) -> Option<String> {
    str_at(v, &["msg", "turn_id"])
        .or_else(|| str_at(v, &["turnId"]))
        .or_else(|| str_at(v, &["turn_id"]))
        .or_else(|| str_at(v, &["turn", "id"]))
        .map(str::to_string)
}

/// `itemType ∨ item_type ∨ type ∨ toolName ∨ tool_name ∨ name ∨ item.* ∨ "unknown"`
pub fn item_type(v: &Value) -> String {
    str_at(v, &["itemType"])
        .or_else(|| str_at(v, &["item_type"]))
        .or_else(|| str_at(v, &["type"]))
        .or_else(|| str_at(v, &["toolName"]))
        .or_else(|| str_at(v, &["tool_name"]))
        .or_else(|| str_at(v, &["name"]))
        .or_else(|| str_at(v, &["item", "itemType"]))
        .or_else(|| str_at(v, &["item", "item_type"]))
        .or_else(|| str_at(v, &["item", "type"]))
        .unwrap_or("unknown")
        .to_string()
}

/// `msg.exit_code ∨ exitCode ∨ exit_code ∨ code`
pub fn exit_code(v: &Value) -> Option<i64> {
    value_at(v, &["msg", "exit_code"])
        .or_else(|| value_at(v, &["exitCode"]))
        .or_else(|| value_at(v, &["exit_code"]))
        .or_else(|| value_at(v, &["code"]))
        .and_then(Value::as_i64)
}

/// Any text-bearing delta:
/// `delta ∨ content ∨ output ∨ msg.delta ∨ msg.content ∨ msg.output`
pub fn delta_text(v: &Value) -> Option<String> {
    for path in [
        ["delta"].as_slice(),
        &["content"],
        &["output"],
        &["msg", "delta"],
        &["msg", "content"],
        &["msg", "output"],
    ] {
        if let Some(node) = value_at(v, path) {
            if let Some(s) = node.as_str() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn u64_any(v: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| v.get(k).and_then(Value::as_u64))
}

/// Tool input payload: `input ∨ arguments ∨ args ∨ item.input`.
pub fn tool_input(v: &Value) -> Option<Value> {
    value_at(v, &["input"])
        .or_else(|| value_at(v, &["arguments"]))
        .or_else(|| value_at(v, &["args"]))
        .or_else(|| value_at(v, &["item", "input"]))
        .cloned()
}

/// `durationMs ∨ duration_ms ∨ msg.duration_ms`
pub fn duration_ms(v: &Value) -> Option<u64> {
    u64_any(v, &["durationMs", "duration_ms"])
        .or_else(|| value_at(v, &["msg", "duration_ms"]).and_then(Value::as_u64))
}

/// Turn status string: `status ∨ msg.status ∨ turn.status`.
pub fn turn_status(v: &Value) -> TurnStatus {
    let s = str_at(v, &["status"])
        .or_else(|| str_at(v, &["msg", "status"]))
        .or_else(|| str_at(v, &["turn", "status"]));
    TurnStatus::parse(s)
}

/// Extract the tool metrics a tool-complete payload may carry.
pub fn tool_metrics(v: &Value) -> ToolMetrics {
    ToolMetrics {
        line_count: u64_any(v, &["lineCount", "line_count"]),
        match_count: u64_any(v, &["matchCount", "match_count"]),
        lines_added: u64_any(v, &["linesAdded", "lines_added"]),
        lines_removed: u64_any(v, &["linesRemoved", "lines_removed"]),
    }
}

// ── Composite parsers ─────────────────────────────────────────────────────────

/// Parse a token-usage notification.
///
/// Per-thread displays use `last_token_usage`; `total_token_usage` is only
/// consulted for the `total_tokens` figure when the last-usage node lacks one.
pub fn parse_usage(v: &Value) -> TokenUsage {
    let last = value_at(v, &["msg", "info", "last_token_usage"])
        .or_else(|| value_at(v, &["msg", "last_token_usage"]))
        .or_else(|| value_at(v, &["info", "last_token_usage"]))
        .or_else(|| value_at(v, &["last_token_usage"]))
        .or_else(|| value_at(v, &["lastTokenUsage"]))
        .or_else(|| value_at(v, &["usage"]))
        .unwrap_or(v);

    let total_node = value_at(v, &["msg", "info", "total_token_usage"])
        .or_else(|| value_at(v, &["total_token_usage"]))
        .or_else(|| value_at(v, &["totalTokenUsage"]));

    let total_tokens = u64_any(last, &["totalTokens", "total_tokens"])
        .or_else(|| total_node.and_then(|t| u64_any(t, &["totalTokens", "total_tokens"])));

    let context_window = value_at(v, &["msg", "info", "model_context_window"])
        .or_else(|| value_at(v, &["info", "model_context_window"]))
        .or_else(|| value_at(v, &["contextWindow"]))
        .or_else(|| value_at(v, &["context_window"]))
        .or_else(|| value_at(v, &["modelContextWindow"]))
        .and_then(Value::as_u64);

    TokenUsage {
        input_tokens: u64_any(last, &["inputTokens", "input_tokens"]).unwrap_or(0),
        output_tokens: u64_any(last, &["outputTokens", "output_tokens"]).unwrap_or(0),
        cache_read_input_tokens: u64_any(
            last,
            &[
                "cacheReadInputTokens",
                "cache_read_input_tokens",
                "cachedInputTokens",
                "cached_input_tokens",
            ],
        )
        .unwrap_or(0),
        cache_creation_input_tokens: u64_any(
            last,
            &["cacheCreationInputTokens", "cache_creation_input_tokens"],
        )
        .unwrap_or(0),
        total_tokens,
        context_window,
        model: str_at(v, &["model"])
            .or_else(|| str_at(v, &["msg", "info", "model"]))
            .map(str::to_string),
        max_output_tokens: u64_any(v, &["maxOutputTokens", "max_output_tokens"]),
    }
}

/// Parse an approval request from either wire spelling.
///
/// `notification_id` is the JSON-RPC id when the subprocess sent the request
/// as a server-initiated request; it takes priority as the id echoed back in
/// `approval/respond`.
pub fn parse_approval(
    method: &str,
    params: &Value,
    notification_id: Option<&Value>,
) -> ApprovalRequest {
    let kind = if method.to_ascii_lowercase().contains("filechange")
        || method.contains("file_change")
    {
        ApprovalKind::FileChange
    } else {
        ApprovalKind::CommandExecution
    };

    let request_id = notification_id
        .cloned()
        .or_else(|| params.get("requestId").cloned())
        .or_else(|| params.get("request_id").cloned())
        .or_else(|| params.get("id").cloned())
        .unwrap_or(Value::Null);

    let command = match value_at(params, &["command"]).or_else(|| value_at(params, &["msg", "command"])) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    };

    let changes = value_at(params, &["changes"])
        .or_else(|| value_at(params, &["files"]))
        .or_else(|| value_at(params, &["msg", "changes"]))
        .map(parse_changes)
        .unwrap_or_default();

    ApprovalRequest {
        request_id,
        kind,
        thread_id: thread_id(params).unwrap_or_default(),
        turn_id: turn_id(params).unwrap_or_default(),
        item_id: item_id(params).unwrap_or_default(),
        command,
        cwd: str_at(params, &["cwd"])
            .or_else(|| str_at(params, &["msg", "cwd"]))
            .map(str::to_string),
        reason: str_at(params, &["reason"])
            .or_else(|| str_at(params, &["msg", "reason"]))
            .map(str::to_string),
        changes,
    }
}

fn parse_changes(v: &Value) -> Vec<FileChange> {
    match v {
        // [{"path": "...", "kind": "edit"}, ...]
        Value::Array(items) => items
            .iter()
            .filter_map(|c| {
                let path = c
                    .get("path")
                    .and_then(Value::as_str)
                    .or_else(|| c.as_str())?;
                Some(FileChange {
                    path: path.to_string(),
                    kind: c.get("kind").and_then(Value::as_str).map(str::to_string),
                })
            })
            .collect(),
        // {"/path/to/file": {"kind": "edit"}, ...}
        Value::Object(map) => map
            .iter()
            .map(|(path, meta)| FileChange {
                path: path.clone(),
                kind: meta
                    .get("kind")
                    .or_else(|| meta.get("type"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect(),
        _ => Vec::new(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
