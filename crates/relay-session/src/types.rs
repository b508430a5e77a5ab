// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use relay_config::{ApprovalPolicy, ReasoningEffort};
use serde::{Deserialize, Serialize};

/// The whole persisted document (`sessions.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionFile {
    #[serde(default)]
    pub channels: HashMap<String, ChannelSession>,
}

/// Token accounting as persisted per channel/thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LastUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
}

/// One completed turn in a channel-scope conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub turn_id: String,
    pub turn_index: usize,
    pub slack_ts: String,
}

/// Channel-scope session record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSession {
    pub thread_id: Option<String>,
    /// Former thread ids kept for manual resume after `/clear`.
    pub previous_thread_ids: Vec<String>,
    pub working_dir: String,
    pub configured_path: Option<String>,
    /// Once true, the working directory is locked and `configured_path` is
    /// immutable.
    pub path_configured: bool,
    pub configured_by: Option<String>,
    pub configured_at: Option<i64>,
    pub approval_policy: ApprovalPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_rate_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_char_limit: Option<u32>,
    /// Set when this channel was created by forking another conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_at_turn_index: Option<usize>,
    pub created_at: i64,
    pub last_active_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_usage: Option<LastUsage>,
    pub turns: Vec<TurnRecord>,
    pub threads: HashMap<String, ThreadSession>,
}

impl Default for ChannelSession {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ChannelSession {
    pub fn new(now: i64) -> Self {
        Self {
            thread_id: None,
            previous_thread_ids: Vec::new(),
            working_dir: String::new(),
            configured_path: None,
            path_configured: false,
            configured_by: None,
            configured_at: None,
            approval_policy: ApprovalPolicy::default(),
            model: None,
            reasoning_effort: None,
            update_rate_seconds: None,
            thread_char_limit: None,
            forked_from: None,
            forked_at_turn_index: None,
            created_at: now,
            last_active_at: now,
            last_usage: None,
            turns: Vec::new(),
            threads: HashMap::new(),
        }
    }

    /// The directory new threads start in: the locked path when configured,
    /// otherwise the plain working dir.
    pub fn effective_working_dir(&self) -> Option<&str> {
        if self.path_configured {
            self.configured_path.as_deref()
        } else if self.working_dir.is_empty() {
            None
        } else {
            Some(&self.working_dir)
        }
    }
}

/// Thread-scope session record nested under a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadSession {
    pub thread_id: Option<String>,
    pub previous_thread_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<ApprovalPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_rate_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_char_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_at_turn_index: Option<usize>,
    pub created_at: i64,
    pub last_active_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_usage: Option<LastUsage>,
    pub turn_counter: u32,
    /// Slack message ts → subprocess turn id.
    pub message_turn_map: HashMap<String, String>,
    /// Slack message ts → tool use id.
    pub message_tool_map: HashMap<String, String>,
}

impl Default for ThreadSession {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ThreadSession {
    pub fn new(now: i64) -> Self {
        Self {
            thread_id: None,
            previous_thread_ids: Vec::new(),
            working_dir: None,
            approval_policy: None,
            model: None,
            reasoning_effort: None,
            update_rate_seconds: None,
            thread_char_limit: None,
            forked_from: None,
            forked_at_turn_index: None,
            created_at: now,
            last_active_at: now,
            last_usage: None,
            turn_counter: 0,
            message_turn_map: HashMap::new(),
            message_tool_map: HashMap::new(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
