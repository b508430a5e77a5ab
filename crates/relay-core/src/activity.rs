// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Activity thread manager.
//!
//! Owns the ordered batch of [`ActivityEntry`] per conversation and turns it
//! into child replies under the user's message.  Two constraints drive the
//! flush algorithm:
//!
//! 1. Each new entry becomes a new reply UNLESS it completes an
//!    already-posted tool start or thinking segment — those are edited in
//!    place by their tracked message timestamp.  If a tool's start and
//!    completion are both unposted when the flush runs, the start is
//!    skipped and only the completion is posted: one message per tool id.
//! 2. Emissions are rate-limited: no post/update within `min_gap` of the
//!    previous one unless the flush is forced (terminal tick).  The very
//!    first post is exempt.
//!
//! Content longer than the conversation's character limit is truncated for
//! the chat text (with code fences closed) and uploaded in full as a `.md`
//! attachment, optionally with a rendered image.  The platform shares files
//! asynchronously, so the share timestamp is polled in the background.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use relay_chat::{ChatClient, ChatError, MarkdownRenderer, MessagePayload};
use relay_rpc::ToolMetrics;

use crate::format;
use crate::key::ConversationKey;

/// Default minimum gap between non-forced emissions.
pub const DEFAULT_MIN_GAP: Duration = Duration::from_secs(2);
/// Cadence of the share-timestamp poll after an upload.
const SHARE_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Number of share-timestamp probes before giving up (≈ 5 s).
const SHARE_POLL_ATTEMPTS: u32 = 25;

// ── Entry model ───────────────────────────────────────────────────────────────

/// What an activity entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Starting,
    Thinking,
    ToolStart,
    ToolComplete,
    Generating,
    Error,
    Aborted,
}

/// Tool input as received: free text or a structured payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInputValue {
    Text(String),
    Json(Value),
}

impl ToolInputValue {
    pub fn text(s: impl Into<String>) -> Self {
        ToolInputValue::Text(s.into())
    }

    /// One-line display form.
    pub fn display(&self) -> String {
        match self {
            ToolInputValue::Text(s) => s.clone(),
            ToolInputValue::Json(Value::String(s)) => s.clone(),
            ToolInputValue::Json(v) => {
                // Prefer the obvious scalar fields over raw JSON.
                for key in ["command", "pattern", "path", "query", "file_path"] {
                    if let Some(s) = v.get(key).and_then(Value::as_str) {
                        return s.to_string();
                    }
                }
                v.to_string()
            }
        }
    }
}

/// One line-item destined to become (or update) a child reply.
#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub kind: EntryKind,
    pub timestamp: DateTime<Utc>,
    pub tool: Option<String>,
    pub tool_input: Option<ToolInputValue>,
    pub tool_use_id: Option<String>,
    pub thinking_segment_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub char_count: Option<usize>,
    pub thinking_in_progress: bool,
    pub metrics: ToolMetrics,
    pub tool_output_preview: Option<String>,
    pub tool_is_error: bool,
    pub tool_error_message: Option<String>,
    pub message: Option<String>,
}

impl ActivityEntry {
    fn blank(kind: EntryKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            tool: None,
            tool_input: None,
            tool_use_id: None,
            thinking_segment_id: None,
            duration_ms: None,
            char_count: None,
            thinking_in_progress: false,
            metrics: ToolMetrics::default(),
            tool_output_preview: None,
            tool_is_error: false,
            tool_error_message: None,
            message: None,
        }
    }

    pub fn starting() -> Self {
        Self::blank(EntryKind::Starting)
    }

    pub fn generating() -> Self {
        Self::blank(EntryKind::Generating)
    }

    pub fn aborted() -> Self {
        Self::blank(EntryKind::Aborted)
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut e = Self::blank(EntryKind::Error);
        e.message = Some(message.into());
        e
    }

    pub fn thinking(segment_id: impl Into<String>) -> Self {
        let mut e = Self::blank(EntryKind::Thinking);
        e.thinking_segment_id = Some(segment_id.into());
        e.thinking_in_progress = true;
        e.char_count = Some(0);
        e
    }

    pub fn tool_start(
        tool_use_id: impl Into<String>,
        tool: impl Into<String>,
        input: Option<ToolInputValue>,
    ) -> Self {
        let mut e = Self::blank(EntryKind::ToolStart);
        e.tool_use_id = Some(tool_use_id.into());
        e.tool = Some(tool.into());
        e.tool_input = input;
        e
    }

    pub fn tool_complete(
        tool_use_id: impl Into<String>,
        tool: impl Into<String>,
        input: Option<ToolInputValue>,
    ) -> Self {
        let mut e = Self::blank(EntryKind::ToolComplete);
        e.tool_use_id = Some(tool_use_id.into());
        e.tool = Some(tool.into());
        e.tool_input = input;
        e
    }
}

// ── Batch ─────────────────────────────────────────────────────────────────────

/// Per-conversation emission state.
#[derive(Default)]
pub struct ActivityBatch {
    pub entries: Vec<ActivityEntry>,
    /// Entries `[0..posted_count)` have been emitted (as new messages or as
    /// updates to existing ones).
    pub posted_count: usize,
    pub posted_tool_use_ids: HashSet<String>,
    pub tool_id_to_posted_ts: HashMap<String, String>,
    pub thinking_id_to_posted_ts: HashMap<String, String>,
    /// Thinking segments mutated since their message was posted.
    dirty_thinking: HashSet<String>,
    pub last_post_time: Option<Instant>,
}

type BatchHandle = Arc<Mutex<ActivityBatch>>;

/// Optional hook adding interactive components to a freshly posted entry.
pub type ActionBuilder = dyn Fn(&ActivityEntry, &str) -> Option<Value> + Send + Sync;

/// Ordered, batched, rate-limited child-message emission.
pub struct ActivityThreadManager {
    chat: Arc<dyn ChatClient>,
    renderer: Arc<dyn MarkdownRenderer>,
    batches: Mutex<HashMap<ConversationKey, BatchHandle>>,
    min_gap: Duration,
    actions: Option<Box<ActionBuilder>>,
}

impl ActivityThreadManager {
    pub fn new(chat: Arc<dyn ChatClient>, renderer: Arc<dyn MarkdownRenderer>) -> Self {
        Self {
            chat,
            renderer,
            batches: Mutex::new(HashMap::new()),
            min_gap: DEFAULT_MIN_GAP,
            actions: None,
        }
    }

    pub fn with_min_gap(mut self, min_gap: Duration) -> Self {
        self.min_gap = min_gap;
        self
    }

    pub fn with_actions(mut self, actions: Box<ActionBuilder>) -> Self {
        self.actions = Some(actions);
        self
    }

    async fn batch(&self, key: &ConversationKey) -> BatchHandle {
        self.batches
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Append an entry; never blocks on the chat surface.
    pub async fn add_entry(&self, key: &ConversationKey, entry: ActivityEntry) {
        let handle = self.batch(key).await;
        let mut batch = handle.lock().await;
        batch.entries.push(entry);
    }

    /// Mutate the thinking entry for `segment_id`, marking it for a
    /// re-edit when its message was already posted.
    pub async fn update_thinking(
        &self,
        key: &ConversationKey,
        segment_id: &str,
        f: impl FnOnce(&mut ActivityEntry),
    ) {
        let handle = self.batch(key).await;
        let mut batch = handle.lock().await;
        let Some(entry) = batch
            .entries
            .iter_mut()
            .find(|e| e.thinking_segment_id.as_deref() == Some(segment_id))
        else {
            return;
        };
        f(entry);
        if batch.thinking_id_to_posted_ts.contains_key(segment_id) {
            batch.dirty_thinking.insert(segment_id.to_string());
        }
    }

    pub async fn get_entries(&self, key: &ConversationKey) -> Vec<ActivityEntry> {
        let handle = self.batch(key).await;
        let batch = handle.lock().await;
        batch.entries.clone()
    }

    pub async fn clear_entries(&self, key: &ConversationKey) {
        self.batches.lock().await.remove(key);
    }

    /// True when a thinking segment's message has been emitted.
    pub async fn thinking_posted(&self, key: &ConversationKey, segment_id: &str) -> bool {
        let handle = self.batch(key).await;
        let batch = handle.lock().await;
        batch.thinking_id_to_posted_ts.contains_key(segment_id)
    }

    /// Emit pending entries into the conversation.
    pub async fn flush(
        &self,
        key: &ConversationKey,
        channel: &str,
        thread_ts: Option<&str>,
        char_limit: usize,
        force: bool,
    ) {
        let handle = self.batch(key).await;
        let mut batch = handle.lock().await;

        if !force {
            if let Some(last) = batch.last_post_time {
                if last.elapsed() < self.min_gap {
                    return;
                }
            }
        }

        // Re-edit thinking messages whose content moved on since posting.
        let dirty: Vec<String> = batch.dirty_thinking.drain().collect();
        for segment_id in dirty {
            let Some(ts) = batch.thinking_id_to_posted_ts.get(&segment_id).cloned() else {
                continue;
            };
            if let Some(entry) = batch
                .entries
                .iter()
                .find(|e| e.thinking_segment_id.as_deref() == Some(&segment_id))
            {
                let text = format::format_entry(entry);
                if let Err(e) = self
                    .chat
                    .update_message(channel, &ts, &MessagePayload::text(text))
                    .await
                {
                    warn!(%key, "thinking update failed: {e}");
                }
            }
        }

        // Tool ids whose completion is already waiting in the pending range:
        // their start entry must never become its own message.
        let completed_pending: HashSet<String> = batch.entries[batch.posted_count..]
            .iter()
            .filter(|e| e.kind == EntryKind::ToolComplete)
            .filter_map(|e| e.tool_use_id.clone())
            .collect();

        while batch.posted_count < batch.entries.len() {
            let entry = batch.entries[batch.posted_count].clone();
            batch.posted_count += 1;

            // Superseded tool start: its completion will be the one message.
            if entry.kind == EntryKind::ToolStart {
                if let Some(id) = &entry.tool_use_id {
                    if completed_pending.contains(id)
                        && !batch.tool_id_to_posted_ts.contains_key(id)
                    {
                        debug!(%key, tool_use_id = %id, "skipping superseded tool start");
                        continue;
                    }
                }
            }

            // Completion of an already-posted start: edit in place.
            if entry.kind == EntryKind::ToolComplete {
                if let Some(ts) = entry
                    .tool_use_id
                    .as_ref()
                    .and_then(|id| batch.tool_id_to_posted_ts.get(id))
                    .cloned()
                {
                    let text = format::format_entry(&entry);
                    if let Err(e) = self
                        .chat
                        .update_message(channel, &ts, &MessagePayload::text(text))
                        .await
                    {
                        warn!(%key, "tool completion update failed: {e}");
                    }
                    batch.last_post_time = Some(Instant::now());
                    continue;
                }
            }

            // Progress update for an already-posted thinking segment.
            if entry.kind == EntryKind::Thinking {
                if let Some(ts) = entry
                    .thinking_segment_id
                    .as_ref()
                    .and_then(|id| batch.thinking_id_to_posted_ts.get(id))
                    .cloned()
                {
                    let text = format::format_entry(&entry);
                    if let Err(e) = self
                        .chat
                        .update_message(channel, &ts, &MessagePayload::text(text))
                        .await
                    {
                        warn!(%key, "thinking update failed: {e}");
                    }
                    batch.last_post_time = Some(Instant::now());
                    continue;
                }
            }

            // A brand-new child message.
            let text = format::format_entry(&entry);
            let posted = if text.chars().count() > char_limit {
                self.post_long(channel, thread_ts, &text, char_limit, "activity.md")
                    .await
            } else {
                self.chat
                    .post_message(channel, thread_ts, &MessagePayload::text(text))
                    .await
            };

            let ts = match posted {
                Ok(ts) => ts,
                Err(e) => {
                    warn!(%key, "activity post failed: {e}");
                    batch.last_post_time = Some(Instant::now());
                    continue;
                }
            };

            if let Some(id) = &entry.tool_use_id {
                batch.posted_tool_use_ids.insert(id.clone());
                batch.tool_id_to_posted_ts.insert(id.clone(), ts.clone());
            }
            if let Some(id) = &entry.thinking_segment_id {
                batch.thinking_id_to_posted_ts.insert(id.clone(), ts.clone());
            }

            // Attach interactive components when the embedder wants them.
            if let Some(build) = &self.actions {
                if let Some(blocks) = build(&entry, &ts) {
                    let payload =
                        MessagePayload::with_blocks(format::format_entry(&entry), blocks);
                    if let Err(e) = self.chat.update_message(channel, &ts, &payload).await {
                        warn!(%key, "action attach failed: {e}");
                    }
                }
            }

            batch.last_post_time = Some(Instant::now());
        }
    }

    /// Post truncated text and upload the full content as attachments.
    async fn post_long(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        full_text: &str,
        char_limit: usize,
        basename: &str,
    ) -> Result<String, ChatError> {
        post_long_content(
            &self.chat,
            &self.renderer,
            channel,
            thread_ts,
            full_text,
            char_limit,
            basename,
        )
        .await
    }
}

/// Shared long-content path: truncated chat text + `.md` upload + optional
/// rendered image.  Returns the ts of the text message.
pub async fn post_long_content(
    chat: &Arc<dyn ChatClient>,
    renderer: &Arc<dyn MarkdownRenderer>,
    channel: &str,
    thread_ts: Option<&str>,
    full_text: &str,
    char_limit: usize,
    basename: &str,
) -> Result<String, ChatError> {
    let preview = format::truncate_closed(full_text, char_limit);
    let ts = chat
        .post_message(channel, thread_ts, &MessagePayload::text(preview))
        .await?;

    let file_id = chat
        .upload_file(
            channel,
            thread_ts,
            basename,
            full_text.as_bytes().to_vec(),
            None,
        )
        .await?;
    spawn_share_poll(chat.clone(), file_id, channel.to_string());

    // Image rendering is best-effort; failure degrades to text-only.
    if let Some(png) = renderer.render_png(full_text) {
        let image_name = format!("{}.png", basename.trim_end_matches(".md"));
        match chat
            .upload_file(channel, thread_ts, &image_name, png, None)
            .await
        {
            Ok(file_id) => spawn_share_poll(chat.clone(), file_id, channel.to_string()),
            Err(e) => debug!("image upload skipped: {e}"),
        }
    }

    Ok(ts)
}

fn spawn_share_poll(chat: Arc<dyn ChatClient>, file_id: String, channel: String) {
    tokio::spawn(async move {
        if poll_share_ts(&chat, &file_id, &channel).await.is_none() {
            warn!(file_id, channel, "file share ts not visible after polling");
        }
    });
}

/// Poll `files.info` for the channel share ts: 200 ms cadence, 25 attempts.
pub async fn poll_share_ts(
    chat: &Arc<dyn ChatClient>,
    file_id: &str,
    channel: &str,
) -> Option<String> {
    for _ in 0..SHARE_POLL_ATTEMPTS {
        match chat.file_share_ts(file_id, channel).await {
            Ok(Some(ts)) => return Some(ts),
            Ok(None) => {}
            Err(e) => {
                debug!(file_id, "files.info probe failed: {e}");
            }
        }
        tokio::time::sleep(SHARE_POLL_INTERVAL).await;
    }
    None
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_chat::mock::{MockCall, MockChatClient};
    use relay_chat::NoImageRenderer;

    fn manager() -> (Arc<MockChatClient>, ActivityThreadManager) {
        let mock = Arc::new(MockChatClient::new());
        let mgr = ActivityThreadManager::new(mock.clone(), Arc::new(NoImageRenderer));
        (mock, mgr)
    }

    fn key() -> ConversationKey {
        ConversationKey::thread("C1", "1.1")
    }

    // ── Tool update-in-place ──────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_start_then_complete_edits_the_same_message() {
        let (mock, mgr) = manager();
        let key = key();

        mgr.add_entry(
            &key,
            ActivityEntry::tool_start("T1", "Grep", Some(ToolInputValue::text("search"))),
        )
        .await;
        mgr.flush(&key, "C1", Some("1.1"), 500, true).await;

        let posts = mock.posts();
        assert_eq!(posts.len(), 1);
        let MockCall::Post { text, ts, .. } = &posts[0] else {
            unreachable!()
        };
        assert!(text.contains("[in progress]"));
        let start_ts = ts.clone();

        let mut complete =
            ActivityEntry::tool_complete("T1", "Grep", Some(ToolInputValue::text("search")));
        complete.duration_ms = Some(1500);
        complete.metrics.match_count = Some(42);
        mgr.add_entry(&key, complete).await;
        mgr.flush(&key, "C1", Some("1.1"), 500, true).await;

        assert_eq!(mock.posts().len(), 1, "no second post for the same tool id");
        let updates = mock.updates();
        assert_eq!(updates.len(), 1);
        let MockCall::Update { ts, text, .. } = &updates[0] else {
            unreachable!()
        };
        assert_eq!(ts, &start_ts, "must edit the original message");
        assert!(!text.contains("[in progress]"));
        assert!(text.contains("Grep"));
        assert!(text.contains("42 matches"));
    }

    #[tokio::test]
    async fn concurrent_start_and_complete_yield_single_message() {
        let (mock, mgr) = manager();
        let key = key();

        mgr.add_entry(&key, ActivityEntry::tool_start("T1", "Grep", None))
            .await;
        let mut complete = ActivityEntry::tool_complete("T1", "Grep", None);
        complete.duration_ms = Some(100);
        mgr.add_entry(&key, complete).await;

        mgr.flush(&key, "C1", Some("1.1"), 500, true).await;

        let posts = mock.posts();
        assert_eq!(posts.len(), 1, "exactly one message per tool use id");
        let MockCall::Post { text, .. } = &posts[0] else {
            unreachable!()
        };
        assert!(
            !text.contains("[in progress]"),
            "the completion is the one message: {text}"
        );
        assert!(mock.updates().is_empty());
    }

    // ── Thinking ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn thinking_updates_edit_in_place() {
        let (mock, mgr) = manager();
        let key = key();

        mgr.add_entry(&key, ActivityEntry::thinking("r1")).await;
        mgr.flush(&key, "C1", Some("1.1"), 500, true).await;
        assert_eq!(mock.posts().len(), 1);

        mgr.update_thinking(&key, "r1", |e| {
            e.char_count = Some(240);
        })
        .await;
        mgr.flush(&key, "C1", Some("1.1"), 500, true).await;

        assert_eq!(mock.posts().len(), 1);
        let updates = mock.updates();
        assert_eq!(updates.len(), 1);
        let MockCall::Update { text, .. } = &updates[0] else {
            unreachable!()
        };
        assert!(text.contains("240 chars"), "{text}");
    }

    #[tokio::test]
    async fn thinking_chronology_keeps_early_timestamp() {
        // The thinking entry keeps the started-at timestamp even though
        // content arrives after a tool entry.
        let (_mock, mgr) = manager();
        let key = key();

        let thinking = ActivityEntry::thinking("r1");
        let t0 = thinking.timestamp;
        mgr.add_entry(&key, thinking).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.add_entry(&key, ActivityEntry::tool_start("T1", "Grep", None))
            .await;
        mgr.update_thinking(&key, "r1", |e| {
            e.char_count = Some(3);
        })
        .await;

        let entries = mgr.get_entries(&key).await;
        assert_eq!(entries.len(), 2);
        let thinking_entries: Vec<_> = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Thinking)
            .collect();
        assert_eq!(thinking_entries.len(), 1, "exactly one thinking entry");
        assert_eq!(thinking_entries[0].timestamp, t0);
        assert!(entries[1].timestamp > t0);
        assert_eq!(thinking_entries[0].char_count, Some(3));
        assert!(thinking_entries[0].thinking_in_progress);

        mgr.update_thinking(&key, "r1", |e| {
            e.thinking_in_progress = false;
            e.duration_ms = Some(900);
        })
        .await;
        let entries = mgr.get_entries(&key).await;
        assert!(!entries[0].thinking_in_progress);
        assert_eq!(entries[0].duration_ms, Some(900));
    }

    // ── Rate limiting ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unforced_flush_respects_min_gap() {
        let (mock, mgr) = manager();
        let key = key();

        mgr.add_entry(&key, ActivityEntry::tool_start("T1", "Grep", None))
            .await;
        // First post is exempt from the gap.
        mgr.flush(&key, "C1", Some("1.1"), 500, false).await;
        assert_eq!(mock.posts().len(), 1);

        mgr.add_entry(&key, ActivityEntry::tool_start("T2", "Read", None))
            .await;
        mgr.flush(&key, "C1", Some("1.1"), 500, false).await;
        assert_eq!(mock.posts().len(), 1, "second flush inside min gap is a no-op");

        // A forced flush bypasses the gap.
        mgr.flush(&key, "C1", Some("1.1"), 500, true).await;
        assert_eq!(mock.posts().len(), 2);
    }

    // ── Long content ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn long_entry_is_truncated_and_uploaded() {
        let (mock, mgr) = manager();
        let key = key();

        let mut entry = ActivityEntry::tool_complete("T1", "Bash", None);
        entry.tool_output_preview = Some("z".repeat(40));
        // Force length over the limit with a big input payload.
        entry.tool_input = Some(ToolInputValue::text("y".repeat(60)));
        mgr.add_entry(&key, entry).await;
        mgr.flush(&key, "C1", Some("1.1"), 100, true).await;

        assert_eq!(mock.posts().len(), 1);
        let MockCall::Post { text, .. } = &mock.posts()[0] else {
            unreachable!()
        };
        assert!(text.chars().count() <= 105, "truncated: {}", text.len());
        let uploads = mock.uploads();
        assert_eq!(uploads.len(), 1);
        let MockCall::Upload { filename, .. } = &uploads[0] else {
            unreachable!()
        };
        assert_eq!(filename, "activity.md");
    }

    #[tokio::test(start_paused = true)]
    async fn share_ts_poll_stops_when_visible() {
        let mock = Arc::new(MockChatClient::new());
        mock.delay_share_ts(3);
        let chat: Arc<dyn ChatClient> = mock.clone();
        let ts = poll_share_ts(&chat, "F1", "C1").await;
        assert!(ts.is_some());
        let probes = mock
            .calls()
            .iter()
            .filter(|c| matches!(c, MockCall::FileInfo { .. }))
            .count();
        assert_eq!(probes, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn share_ts_poll_gives_up_after_budget() {
        let mock = Arc::new(MockChatClient::new());
        mock.delay_share_ts(1000);
        let chat: Arc<dyn ChatClient> = mock.clone();
        assert!(poll_share_ts(&chat, "F1", "C1").await.is_none());
        let probes = mock
            .calls()
            .iter()
            .filter(|c| matches!(c, MockCall::FileInfo { .. }))
            .count();
        assert_eq!(probes, 25);
    }

    // ── Failure tolerance ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn failed_post_does_not_wedge_the_batch() {
        let (mock, mgr) = manager();
        let key = key();

        mock.fail_next_post();
        mgr.add_entry(&key, ActivityEntry::tool_start("T1", "Grep", None))
            .await;
        mgr.flush(&key, "C1", Some("1.1"), 500, true).await;
        assert_eq!(mock.posts().len(), 0);

        mgr.add_entry(&key, ActivityEntry::tool_start("T2", "Read", None))
            .await;
        mgr.flush(&key, "C1", Some("1.1"), 500, true).await;
        assert_eq!(mock.posts().len(), 1, "later entries still flow");
    }
}
