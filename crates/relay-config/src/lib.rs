// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Bridge configuration loaded from YAML.
//!
//! Configuration is YAML (never TOML).  Layers are **deep-merged** — you can
//! override only the fields you care about in each file.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/relay/relay.yaml`
//! 2. `~/.config/relay/relay.yaml`
//! 3. `.relay/relay.yaml` (workspace-local)
//! 4. Path given to [`load`] explicitly.
//!
//! **All defaults are production-safe.** Running `load(None)` with no config
//! file gives you a bridge that talks to `codex app-server` in the current
//! directory, asks for approval on request, and updates the activity panel
//! twice a second.
//!
//! # Example full config
//! ```yaml
//! slack:
//!   app_token: "xapp-..."
//!   bot_token: "xoxb-..."
//!
//! subprocess:
//!   command: "codex"
//!   args: ["app-server"]
//!   request_timeout_secs: 30
//!
//! defaults:
//!   approval_policy: on-request
//!   update_rate_ms: 500
//!   thread_char_limit: 500
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ── Shared enums ──────────────────────────────────────────────────────────────

/// When the subprocess must ask before running a sandboxed command or edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Never,
    #[default]
    OnRequest,
    OnFailure,
    Untrusted,
}

impl ApprovalPolicy {
    /// Wire string as sent in `turn/start` params.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalPolicy::Never => "never",
            ApprovalPolicy::OnRequest => "on-request",
            ApprovalPolicy::OnFailure => "on-failure",
            ApprovalPolicy::Untrusted => "untrusted",
        }
    }
}

/// Reasoning effort forwarded to the subprocess on `turn/start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Xhigh => "xhigh",
        }
    }
}

// ── Bounded settings ──────────────────────────────────────────────────────────

/// Clamp a user-supplied activity update rate to the allowed 1–10 s range.
pub fn clamp_update_rate_seconds(v: u32) -> u32 {
    v.clamp(1, 10)
}

/// Clamp a user-supplied per-message character limit to 100–36000.
pub fn clamp_thread_char_limit(v: u32) -> u32 {
    v.clamp(100, 36_000)
}

// ── Config schema ─────────────────────────────────────────────────────────────

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub subprocess: SubprocessConfig,
    #[serde(default)]
    pub defaults: TurnDefaults,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    /// Path of the persisted channel→thread mapping file.
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slack: SlackConfig::default(),
            subprocess: SubprocessConfig::default(),
            defaults: TurnDefaults::default(),
            activity: ActivityConfig::default(),
            approvals: ApprovalConfig::default(),
            session_file: default_session_file(),
        }
    }
}

fn default_session_file() -> PathBuf {
    PathBuf::from("sessions.json")
}

/// Slack credentials and reaction names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    /// Slack App-level token (`xapp-…`). Required for Socket Mode.
    pub app_token: Option<String>,
    /// Slack Bot token (`xoxb-…`).
    pub bot_token: Option<String>,
    /// Reaction placed on the user's message while a turn is running.
    #[serde(default = "default_processing_reaction")]
    pub processing_reaction: String,
    /// Reaction swapped in when a turn is aborted.
    #[serde(default = "default_aborted_reaction")]
    pub aborted_reaction: String,
    /// Reaction swapped in when a turn fails.
    #[serde(default = "default_error_reaction")]
    pub error_reaction: String,
}

fn default_processing_reaction() -> String {
    "hourglass_flowing_sand".to_string()
}
fn default_aborted_reaction() -> String {
    "octagonal_sign".to_string()
}
fn default_error_reaction() -> String {
    "x".to_string()
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            app_token: None,
            bot_token: None,
            processing_reaction: default_processing_reaction(),
            aborted_reaction: default_aborted_reaction(),
            error_reaction: default_error_reaction(),
        }
    }
}

/// How to spawn and talk to the coding subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessConfig {
    /// Executable name or path. Default: `codex`.
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments. Default: `["app-server"]`.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Working directory for the subprocess itself (not for threads).
    pub working_dir: Option<PathBuf>,
    /// Per-RPC deadline in seconds. Default: 30.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Pause before restarting an unexpectedly exited subprocess.
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_secs: u64,
}

fn default_command() -> String {
    "codex".to_string()
}
fn default_args() -> Vec<String> {
    vec!["app-server".to_string()]
}
fn default_request_timeout() -> u64 {
    30
}
fn default_restart_backoff() -> u64 {
    5
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            working_dir: None,
            request_timeout_secs: default_request_timeout(),
            restart_backoff_secs: default_restart_backoff(),
        }
    }
}

/// Per-conversation settings used when the session store has no override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDefaults {
    #[serde(default)]
    pub approval_policy: ApprovalPolicy,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Activity-panel refresh cadence in milliseconds. Default: 500.
    /// User overrides are whole seconds clamped to 1–10.
    #[serde(default = "default_update_rate_ms")]
    pub update_rate_ms: u64,
    /// Inline message budget before content is split into an attachment.
    #[serde(default = "default_thread_char_limit")]
    pub thread_char_limit: u32,
}

fn default_update_rate_ms() -> u64 {
    500
}
fn default_thread_char_limit() -> u32 {
    500
}

impl Default for TurnDefaults {
    fn default() -> Self {
        Self {
            approval_policy: ApprovalPolicy::default(),
            model: None,
            reasoning_effort: None,
            update_rate_ms: default_update_rate_ms(),
            thread_char_limit: default_thread_char_limit(),
        }
    }
}

/// Activity-thread emission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Minimum gap between non-forced child-message posts, seconds.
    #[serde(default = "default_min_post_gap")]
    pub min_post_gap_secs: u64,
    /// Rolling window: most recent entries shown in the panel.
    #[serde(default = "default_window_entries")]
    pub window_entries: usize,
    /// Rolling window: character budget of the rendered panel section.
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,
}

fn default_min_post_gap() -> u64 {
    2
}
fn default_window_entries() -> usize {
    20
}
fn default_window_chars() -> usize {
    1000
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            min_post_gap_secs: default_min_post_gap(),
            window_entries: default_window_entries(),
            window_chars: default_window_chars(),
        }
    }
}

/// Approval reminder/expiry cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_reminder_secs")]
    pub reminder_secs: u64,
    /// Pending approvals auto-decline after this many seconds.
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    /// Per-(user, conversation) DM notification debounce.
    #[serde(default = "default_dm_debounce_secs")]
    pub dm_debounce_secs: u64,
}

fn default_reminder_secs() -> u64 {
    60
}
fn default_expiry_secs() -> u64 {
    300
}
fn default_dm_debounce_secs() -> u64 {
    15
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            reminder_secs: default_reminder_secs(),
            expiry_secs: default_expiry_secs(),
            dm_debounce_secs: default_dm_debounce_secs(),
        }
    }
}

// ── Loader ────────────────────────────────────────────────────────────────────

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/relay/relay.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/relay/relay.yaml"));
    }
    paths.push(PathBuf::from(".relay/relay.yaml"));
    paths
}

pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: Config = if matches!(&merged, serde_yaml::Value::Mapping(m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
