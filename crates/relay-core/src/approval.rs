// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Approval handler.
//!
//! Each inbound approval request gets a bridge-assigned monotonic id, an
//! interactive Accept/Decline message, a periodic reminder, and an expiry
//! deadline that auto-declines.  The decision round-trip is idempotent: the
//! subprocess sees at most one `approval/respond` per request, and a click
//! that arrives after expiry is ignored.
//!
//! If the approval UI cannot be posted, no pending record is stored and no
//! response is sent — the subprocess's own timeout provides progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_chat::{ChatClient, MessagePayload};
use relay_rpc::{AgentClient, ApprovalDecision, ApprovalKind, ApprovalRequest};

use crate::key::ConversationKey;

/// `action_id` prefixes of the approval buttons.
pub const APPROVE_ACTION_PREFIX: &str = "relay_approve";
pub const DECLINE_ACTION_PREFIX: &str = "relay_decline";

/// Reminder/expiry cadence.
#[derive(Debug, Clone)]
pub struct ApprovalTimers {
    pub reminder: Duration,
    pub expiry: Duration,
    pub dm_debounce: Duration,
}

impl Default for ApprovalTimers {
    fn default() -> Self {
        Self {
            reminder: Duration::from_secs(60),
            expiry: Duration::from_secs(300),
            dm_debounce: Duration::from_secs(15),
        }
    }
}

struct PendingRecord {
    request: ApprovalRequest,
    channel: String,
    message_ts: String,
    created_at: Instant,
    reminder_task: JoinHandle<()>,
    expiry_task: JoinHandle<()>,
}

/// Registry of pending approvals keyed by bridge-assigned id.
pub struct ApprovalHandler {
    chat: Arc<dyn ChatClient>,
    client: Arc<AgentClient>,
    timers: ApprovalTimers,
    pending: Mutex<HashMap<u64, PendingRecord>>,
    next_id: AtomicU64,
    dm_sent: std::sync::Mutex<HashMap<(String, String), Instant>>,
}

impl ApprovalHandler {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        client: Arc<AgentClient>,
        timers: ApprovalTimers,
    ) -> Arc<Self> {
        Arc::new(Self {
            chat,
            client,
            timers,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dm_sent: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Post the approval UI and register the pending record.
    ///
    /// Returns the bridge-assigned id, or `None` when the UI could not be
    /// posted (in which case the subprocess receives no response at all).
    pub async fn handle_request(
        self: &Arc<Self>,
        request: ApprovalRequest,
        channel: &str,
        thread_ts: Option<&str>,
        user_id: Option<&str>,
    ) -> Option<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = approval_message(&request, id);

        let message_ts = match self.chat.post_message(channel, thread_ts, &payload).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(bridge_request_id = id, "approval UI post failed: {e}");
                return None;
            }
        };

        // Reminder loop: nudge the conversation while the approval hangs.
        let reminder_handler = Arc::downgrade(self);
        let reminder_channel = channel.to_string();
        let reminder_thread = thread_ts.map(str::to_string);
        let reminder_interval = self.timers.reminder;
        let reminder_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(reminder_interval).await;
                let Some(handler) = reminder_handler.upgrade() else {
                    return;
                };
                if !handler.pending.lock().await.contains_key(&id) {
                    return;
                }
                let nudge = MessagePayload::text(
                    ":bell: An approval request is still waiting for a decision.",
                );
                if let Err(e) = handler
                    .chat
                    .post_message(&reminder_channel, reminder_thread.as_deref(), &nudge)
                    .await
                {
                    debug!("approval reminder failed: {e}");
                }
            }
        });

        // Expiry: exactly one auto-decline.
        let expiry_handler = Arc::downgrade(self);
        let expiry = self.timers.expiry;
        let expiry_task = tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            if let Some(handler) = expiry_handler.upgrade() {
                handler.expire(id).await;
            }
        });

        self.pending.lock().await.insert(
            id,
            PendingRecord {
                request,
                channel: channel.to_string(),
                message_ts,
                created_at: Instant::now(),
                reminder_task,
                expiry_task,
            },
        );
        info!(bridge_request_id = id, channel, "approval pending");

        // DM nudge, debounced per (user, conversation).
        if let Some(user) = user_id {
            let key = ConversationKey::new(channel, thread_ts.map(str::to_string));
            if self.dm_debounce_ok(user, &key) {
                if let Ok(dm) = self.chat.open_dm(user).await {
                    let note = MessagePayload::text(format!(
                        ":bell: A command in <#{channel}> needs your approval."
                    ));
                    if let Err(e) = self.chat.post_message(&dm, None, &note).await {
                        debug!("approval DM failed: {e}");
                    }
                }
            }
        }

        Some(id)
    }

    fn dm_debounce_ok(&self, user: &str, key: &ConversationKey) -> bool {
        let mut sent = self.dm_sent.lock().unwrap_or_else(|p| p.into_inner());
        let map_key = (user.to_string(), key.to_string());
        match sent.get(&map_key) {
            Some(last) if last.elapsed() < self.timers.dm_debounce => false,
            _ => {
                sent.insert(map_key, Instant::now());
                true
            }
        }
    }

    /// Apply a user decision. Idempotent: only the first call for an id
    /// reaches the subprocess; later calls (or clicks after expiry) return
    /// false and have no effect.
    pub async fn handle_decision(&self, id: u64, decision: ApprovalDecision) -> bool {
        let Some(record) = self.pending.lock().await.remove(&id) else {
            debug!(bridge_request_id = id, "decision for unknown or settled approval");
            return false;
        };
        record.reminder_task.abort();
        record.expiry_task.abort();

        if let Err(e) = self
            .client
            .approval_respond(&record.request.request_id, decision)
            .await
        {
            warn!(bridge_request_id = id, "approval response failed: {e}");
        }

        let outcome = match decision {
            ApprovalDecision::Accept => ":white_check_mark: Approved",
            ApprovalDecision::Decline => ":no_entry: Denied",
        };
        self.settle_ui(&record, outcome).await;
        info!(bridge_request_id = id, ?decision, "approval settled");
        true
    }

    /// Deadline hit: auto-decline exactly once and mark the UI expired.
    async fn expire(&self, id: u64) {
        let Some(record) = self.pending.lock().await.remove(&id) else {
            return;
        };
        record.reminder_task.abort();

        if let Err(e) = self
            .client
            .approval_respond(&record.request.request_id, ApprovalDecision::Decline)
            .await
        {
            warn!(bridge_request_id = id, "expiry decline failed: {e}");
        }
        self.settle_ui(&record, ":hourglass: Expired").await;
        info!(bridge_request_id = id, "approval expired");
    }

    /// Drop approvals that have been pending longer than `timeout`.
    pub async fn cleanup_stale_approvals(&self, timeout: Duration) {
        let stale: Vec<u64> = {
            let pending = self.pending.lock().await;
            pending
                .iter()
                .filter(|(_, r)| r.created_at.elapsed() >= timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stale {
            self.expire(id).await;
        }
    }

    async fn settle_ui(&self, record: &PendingRecord, outcome: &str) {
        let summary = request_summary(&record.request);
        let text = format!("{outcome} — {summary}");
        let blocks = json!([{
            "type": "section",
            "text": {"type": "mrkdwn", "text": text},
        }]);
        if let Err(e) = self
            .chat
            .update_message(
                &record.channel,
                &record.message_ts,
                &MessagePayload::with_blocks(text.clone(), blocks),
            )
            .await
        {
            warn!("approval UI settle failed: {e}");
        }
    }
}

fn request_summary(request: &ApprovalRequest) -> String {
    match request.kind {
        ApprovalKind::CommandExecution => {
            let command = request.command.as_deref().unwrap_or("(unknown command)");
            format!("`{command}`")
        }
        ApprovalKind::FileChange => {
            let count = request.changes.len();
            if count == 1 {
                format!("edit to `{}`", request.changes[0].path)
            } else {
                format!("{count} file changes")
            }
        }
    }
}

/// Build the interactive approval message (command or file-change variant).
pub fn approval_message(request: &ApprovalRequest, bridge_id: u64) -> MessagePayload {
    let mut lines = Vec::new();
    match request.kind {
        ApprovalKind::CommandExecution => {
            lines.push(":shield: *The agent wants to run a command*".to_string());
            if let Some(command) = &request.command {
                lines.push(format!("```\n{command}\n```"));
            }
            if let Some(cwd) = &request.cwd {
                lines.push(format!("in `{cwd}`"));
            }
        }
        ApprovalKind::FileChange => {
            lines.push(":shield: *The agent wants to edit files*".to_string());
            for change in request.changes.iter().take(10) {
                let kind = change.kind.as_deref().unwrap_or("edit");
                lines.push(format!("• `{}` ({kind})", change.path));
            }
            if request.changes.len() > 10 {
                lines.push(format!("… and {} more", request.changes.len() - 10));
            }
        }
    }
    if let Some(reason) = &request.reason {
        lines.push(format!("_{reason}_"));
    }
    let text = lines.join("\n");

    let blocks = json!([
        {
            "type": "section",
            "text": {"type": "mrkdwn", "text": text},
        },
        {
            "type": "actions",
            "elements": [
                {
                    "type": "button",
                    "style": "primary",
                    "text": {"type": "plain_text", "text": "Accept"},
                    "action_id": format!("{APPROVE_ACTION_PREFIX}:{bridge_id}"),
                },
                {
                    "type": "button",
                    "style": "danger",
                    "text": {"type": "plain_text", "text": "Decline"},
                    "action_id": format!("{DECLINE_ACTION_PREFIX}:{bridge_id}"),
                },
            ],
        },
    ]);
    MessagePayload::with_blocks(text, blocks)
}

/// Parse an approval button `action_id` into (bridge id, decision).
pub fn parse_approval_action(action_id: &str) -> Option<(u64, ApprovalDecision)> {
    if let Some(rest) = action_id
        .strip_prefix(APPROVE_ACTION_PREFIX)
        .and_then(|r| r.strip_prefix(':'))
    {
        return rest.parse().ok().map(|id| (id, ApprovalDecision::Accept));
    }
    if let Some(rest) = action_id
        .strip_prefix(DECLINE_ACTION_PREFIX)
        .and_then(|r| r.strip_prefix(':'))
    {
        return rest.parse().ok().map(|id| (id, ApprovalDecision::Decline));
    }
    None
}

// ── Unit tests ────────────────────────────────────────────────────────────────
