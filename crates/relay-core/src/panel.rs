// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Activity-panel rendering: the single chat message that is repeatedly
//! edited to reflect the in-progress turn.
//!
//! The panel carries a status header (model, reasoning, tool summary), the
//! rolling activity window, a token/context line once token accounting is
//! available, and — only while running — an Abort button whose `action_id`
//! encodes the conversation key.

use serde_json::{json, Value};

use relay_chat::MessagePayload;

use crate::key::ConversationKey;
use crate::streaming::StreamStatus;

/// `action_id` prefix of the abort button.
pub const ABORT_ACTION_PREFIX: &str = "relay_abort";

/// Everything the renderer needs for one panel edit.
pub struct PanelView {
    pub status: StreamStatus,
    pub model: Option<String>,
    pub reasoning: Option<String>,
    /// Names of tools currently in flight.
    pub active_tools: Vec<String>,
    /// Tools finished so far this turn.
    pub tools_run: usize,
    /// Rendered rolling window of activity entries.
    pub window: String,
    /// "N tokens · x% of window" once computable.
    pub context_line: Option<String>,
    pub key: ConversationKey,
}

fn status_header(view: &PanelView) -> String {
    let status = match view.status {
        StreamStatus::Running => ":hourglass_flowing_sand: *Working…*",
        StreamStatus::Completed => ":white_check_mark: *Completed*",
        StreamStatus::Interrupted => ":octagonal_sign: *Aborted*",
        StreamStatus::Failed => ":warning: *Failed*",
    };
    let mut header = status.to_string();

    let mut meta = Vec::new();
    if let Some(model) = &view.model {
        meta.push(model.clone());
    }
    if let Some(reasoning) = &view.reasoning {
        meta.push(reasoning.clone());
    }
    if !meta.is_empty() {
        header.push_str(&format!("  ·  {}", meta.join(" / ")));
    }

    let mut tools = Vec::new();
    if view.tools_run > 0 {
        tools.push(format!("{} tools run", view.tools_run));
    }
    if !view.active_tools.is_empty() {
        tools.push(format!("running: {}", view.active_tools.join(", ")));
    }
    if !tools.is_empty() {
        header.push_str(&format!("\n_{}_", tools.join(" · ")));
    }
    header
}

/// Build the panel message (text + blocks).
pub fn render_panel(view: &PanelView) -> MessagePayload {
    let mut text = status_header(view);
    if !view.window.is_empty() {
        text.push_str("\n\n");
        text.push_str(&view.window);
    }
    if let Some(line) = &view.context_line {
        text.push_str(&format!("\n\n_{line}_"));
    }

    let mut blocks = vec![json!({
        "type": "section",
        "text": {"type": "mrkdwn", "text": text},
    })];

    if view.status == StreamStatus::Running {
        blocks.push(json!({
            "type": "actions",
            "elements": [{
                "type": "button",
                "style": "danger",
                "text": {"type": "plain_text", "text": "Abort"},
                "action_id": format!("{ABORT_ACTION_PREFIX}:{}", view.key),
            }],
        }));
    }

    MessagePayload::with_blocks(text, Value::Array(blocks))
}

/// Error block used when the subprocess refuses to start a turn: replaces
/// the whole panel, no Abort button.
pub fn render_turn_start_failure(reason: &str) -> MessagePayload {
    let text = format!(":warning: *Could not start the turn*\n{reason}");
    let blocks = json!([{
        "type": "section",
        "text": {"type": "mrkdwn", "text": text},
    }]);
    MessagePayload::with_blocks(text, blocks)
}

/// Parse an abort button `action_id` back into its conversation key.
pub fn parse_abort_action(action_id: &str) -> Option<ConversationKey> {
    let rest = action_id.strip_prefix(ABORT_ACTION_PREFIX)?.strip_prefix(':')?;
    Some(ConversationKey::parse(rest))
}

// ── Fork button ───────────────────────────────────────────────────────────────

/// `action_id` of the fork-to-channel button.
pub const FORK_ACTION_ID: &str = "relay_fork";

/// Payload of a fork button click.
///
/// The button value carries the turn ID and the source conversation, NEVER
/// the turn index — the index is computed live against the subprocess when
/// the fork executes.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkRequest {
    pub turn_id: String,
    pub slack_ts: String,
    pub conversation_key: String,
}

/// Blocks for a response message with a fork-to-channel button attached.
pub fn fork_button_blocks(
    response_text: &str,
    turn_id: &str,
    slack_ts: &str,
    key: &ConversationKey,
) -> Value {
    let value = json!({
        "turnId": turn_id,
        "slackTs": slack_ts,
        "conversationKey": key.to_string(),
    });
    json!([
        {
            "type": "section",
            "text": {"type": "mrkdwn", "text": response_text},
        },
        {
            "type": "actions",
            "elements": [{
                "type": "button",
                "text": {"type": "plain_text", "text": "Fork to channel"},
                "action_id": FORK_ACTION_ID,
                "value": value.to_string(),
            }],
        },
    ])
}

/// Decode a fork button click value.
pub fn parse_fork_value(value: &str) -> Option<ForkRequest> {
    let v: Value = serde_json::from_str(value).ok()?;
    Some(ForkRequest {
        turn_id: v.get("turnId")?.as_str()?.to_string(),
        slack_ts: v.get("slackTs")?.as_str()?.to_string(),
        conversation_key: v.get("conversationKey")?.as_str()?.to_string(),
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────
