// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors produced by the transport and the typed client.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// `stop()` was called; all pending and future requests fail with this.
    #[error("client stopped")]
    Stopped,

    /// The subprocess's stdout closed while requests were in flight.
    #[error("subprocess connection closed")]
    Closed,

    /// A JSON-RPC error response from the subprocess.
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// A call refused locally before any RPC was emitted.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A response arrived but did not have the documented shape.
    #[error("unexpected response shape: {0}")]
    Shape(String),

    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-side thread descriptor, as returned by `thread/start` and friends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ThreadInfo {
    pub id: String,
    pub working_directory: Option<String>,
    pub created_at: Option<String>,
}

impl ThreadInfo {
    /// Parse from an RPC result, accepting both `{thread: {...}}` and a bare
    /// thread object, with id under `id` or `threadId`/`thread_id`.
    pub fn from_result(v: &Value) -> Result<Self, RpcError> {
        let obj = v.get("thread").unwrap_or(v);
        let id = obj
            .get("id")
            .or_else(|| obj.get("threadId"))
            .or_else(|| obj.get("thread_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Shape(format!("thread result without id: {obj}")))?
            .to_string();
        let working_directory = obj
            .get("workingDirectory")
            .or_else(|| obj.get("working_directory"))
            .or_else(|| obj.get("cwd"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let created_at = obj
            .get("createdAt")
            .or_else(|| obj.get("created_at"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            id,
            working_directory,
            created_at,
        })
    }
}

/// Terminal status of a turn, as reported by `turn/completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Failed,
    Interrupted,
    Other(String),
}

impl TurnStatus {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            // Legacy task_complete events carry no status field.
            None | Some("completed") | Some("complete") => TurnStatus::Completed,
            Some("failed") | Some("error") => TurnStatus::Failed,
            Some("interrupted") | Some("aborted") | Some("cancelled") => TurnStatus::Interrupted,
            Some(other) => TurnStatus::Other(other.to_string()),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TurnStatus::Completed)
    }
}

/// Token accounting snapshot from `codex/event/token_count` /
/// `thread/tokenUsage/updated`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens served from the provider prompt cache. A subset of
    /// `input_tokens`, never additional context.
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub total_tokens: Option<u64>,
    pub context_window: Option<u64>,
    pub model: Option<String>,
    pub max_output_tokens: Option<u64>,
}

/// Which kind of approval the subprocess is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalKind {
    CommandExecution,
    FileChange,
}

/// One file touched by a pending file-change approval.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChange {
    pub path: String,
    pub kind: Option<String>,
}

/// An inbound approval request, normalised from either wire spelling.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// The subprocess-side id echoed back in `approval/respond`.
    pub request_id: Value,
    pub kind: ApprovalKind,
    pub thread_id: String,
    pub turn_id: String,
    pub item_id: String,
    pub command: Option<String>,
    pub cwd: Option<String>,
    pub reason: Option<String>,
    pub changes: Vec<FileChange>,
}

/// User decision forwarded to the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Accept,
    Decline,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Accept => "accept",
            ApprovalDecision::Decline => "decline",
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
