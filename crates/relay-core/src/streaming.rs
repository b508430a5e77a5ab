// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-conversation streaming state machine.
//!
//! One [`StreamingState`] exists per in-flight turn, keyed by
//! [`ConversationKey`].  Work inside a conversation is serialised by that
//! state's async mutex; conversations make progress in parallel.  A periodic
//! task re-renders the activity panel at the conversation's update rate and
//! drives the batched child-message flush; terminal events force a final
//! render, post the response, settle the reaction, and tear the state down.
//!
//! # State machine
//!
//! ```text
//!            ┌────────── abort() ───────────┐
//!            ▼                              │
//! running ── turn:completed{completed} ──► completed
//!    │                                      (abort flag wins: interrupted)
//!    ├────── turn:completed{≠completed} ──► failed
//!    └────── fail_turn_start() ───────────► (destroyed, error panel)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_chat::{ChatClient, MarkdownRenderer, MessagePayload};
use relay_rpc::{AgentClient, AgentEvent, TokenUsage, ToolMetrics, TurnStatus};
use relay_session::{LastUsage, SessionStore};

use crate::abort::AbortRegistry;
use crate::activity::{
    post_long_content, ActivityEntry, ActivityThreadManager, ToolInputValue,
};
use crate::format;
use crate::key::ConversationKey;
use crate::panel::{render_panel, render_turn_start_failure, PanelView};
use crate::reactions::EmojiReactionManager;

/// How long an abort waits for the subprocess before forcing the turn down.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to stream one turn into a conversation.
#[derive(Debug, Clone)]
pub struct StreamingContext {
    pub key: ConversationKey,
    pub channel: String,
    pub thread_ts: Option<String>,
    /// The user's message carrying the processing reaction.
    pub original_ts: String,
    /// Who sent the originating message (DM nudges for approvals).
    pub user: Option<String>,
    /// Subprocess thread this turn runs on.
    pub thread_id: String,
    /// Filled by the first `turn:started` / `context:turnId` sighting.
    pub turn_id: Option<String>,
    pub model: Option<String>,
    pub reasoning: Option<String>,
    pub update_rate: Duration,
    pub char_limit: usize,
    /// Cap of the rolling activity window in entries.
    pub window_entries: usize,
    /// Cap of the rolling activity window in characters.
    pub window_chars: usize,
}

/// Turn lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

struct ThinkingRecord {
    item_id: String,
    content: String,
    started: Instant,
    complete: bool,
}

struct ActiveTool {
    tool: String,
    input: Option<ToolInputValue>,
    started: Instant,
    output: String,
}

/// Per-turn token accounting.
///
/// The baseline is captured on the first update carrying non-zero input OR
/// output tokens; a total-only update adjusts the total baseline but never
/// enables the context display on its own.
#[derive(Default)]
pub struct TokenAccounting {
    current: Option<TokenUsage>,
    base_input: Option<u64>,
    base_output: Option<u64>,
    base_cache_read: u64,
    base_cache_creation: u64,
    base_total: Option<u64>,
    context_window: Option<u64>,
    max_output_tokens: Option<u64>,
    model: Option<String>,
}

impl TokenAccounting {
    pub fn apply(&mut self, usage: &TokenUsage) {
        if usage.context_window.is_some() {
            self.context_window = usage.context_window;
        }
        if usage.max_output_tokens.is_some() {
            self.max_output_tokens = usage.max_output_tokens;
        }
        if usage.model.is_some() {
            self.model = usage.model.clone();
        }

        if usage.input_tokens > 0 || usage.output_tokens > 0 {
            if self.base_input.is_none() {
                self.base_input = Some(usage.input_tokens);
                self.base_output = Some(usage.output_tokens);
                self.base_cache_read = usage.cache_read_input_tokens;
                self.base_cache_creation = usage.cache_creation_input_tokens;
                if self.base_total.is_none() {
                    self.base_total = usage.total_tokens;
                }
            }
            self.current = Some(usage.clone());
        } else if let Some(total) = usage.total_tokens {
            match &mut self.current {
                Some(current) if self.base_input.is_some() => {
                    current.total_tokens = Some(total);
                }
                _ => {
                    // No real baseline yet: remember the total only.
                    self.base_total = Some(total);
                }
            }
        }
    }

    /// Context usage line, once a real baseline exists.
    pub fn context_line(&self) -> Option<String> {
        let current = self.current.as_ref()?;
        let base_input = self.base_input?;
        let base_output = self.base_output?;

        let d_input = current.input_tokens.saturating_sub(base_input);
        let d_output = current.output_tokens.saturating_sub(base_output);
        let d_cache = current
            .cache_read_input_tokens
            .saturating_sub(self.base_cache_read)
            + current
                .cache_creation_input_tokens
                .saturating_sub(self.base_cache_creation);

        let mut context_tokens = d_input + d_output + d_cache;
        if context_tokens == 0 {
            if let (Some(total), Some(base_total)) = (current.total_tokens, self.base_total) {
                context_tokens = total.saturating_sub(base_total);
            }
        }

        match self.context_window {
            Some(window) if window > 0 => {
                let percent = 100.0 * context_tokens as f64 / window as f64;
                Some(format!(
                    "{context_tokens} tokens · {percent:.1}% of {window} context"
                ))
            }
            _ => Some(format!("{context_tokens} tokens")),
        }
    }

    /// Snapshot for persistence at end of turn.
    pub fn to_last_usage(&self) -> Option<LastUsage> {
        let current = self.current.as_ref()?;
        Some(LastUsage {
            input_tokens: current.input_tokens,
            output_tokens: current.output_tokens,
            cache_read_input_tokens: current.cache_read_input_tokens,
            cache_creation_input_tokens: Some(current.cache_creation_input_tokens),
            total_tokens: current.total_tokens,
            context_window: self.context_window,
            model: self.model.clone(),
            max_output_tokens: self.max_output_tokens,
        })
    }
}

/// In-memory state of one in-flight turn.
pub struct StreamingState {
    ctx: StreamingContext,
    text: String,
    status: StreamStatus,
    thinking: Option<ThinkingRecord>,
    active_tools: HashMap<String, ActiveTool>,
    tools_run: usize,
    generating_noted: bool,
    activity_message_ts: Option<String>,
    tokens: TokenAccounting,
    pending_abort: bool,
}

struct ConvHandle {
    state: Arc<Mutex<StreamingState>>,
    timer: JoinHandle<()>,
    thread_id: String,
    turn_id: std::sync::Mutex<Option<String>>,
}

/// Owns the lifecycle of one in-flight turn per conversation.
pub struct StreamingManager {
    chat: Arc<dyn ChatClient>,
    renderer: Arc<dyn MarkdownRenderer>,
    client: Arc<AgentClient>,
    activity: Arc<ActivityThreadManager>,
    reactions: Arc<EmojiReactionManager>,
    aborts: Arc<AbortRegistry>,
    store: Arc<SessionStore>,
    states: Mutex<HashMap<ConversationKey, Arc<ConvHandle>>>,
}

impl StreamingManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat: Arc<dyn ChatClient>,
        renderer: Arc<dyn MarkdownRenderer>,
        client: Arc<AgentClient>,
        activity: Arc<ActivityThreadManager>,
        reactions: Arc<EmojiReactionManager>,
        aborts: Arc<AbortRegistry>,
        store: Arc<SessionStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            chat,
            renderer,
            client,
            activity,
            reactions,
            aborts,
            store,
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Where activity children and the final response are threaded.
    fn reply_root(ctx: &StreamingContext) -> String {
        ctx.thread_ts
            .clone()
            .unwrap_or_else(|| ctx.original_ts.clone())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Begin streaming a turn.  Any prior state on the same key has its
    /// timer cleared and its processing reaction removed first.
    pub async fn start_streaming(self: &Arc<Self>, ctx: StreamingContext) {
        let key = ctx.key.clone();

        if let Some(old) = self.states.lock().await.remove(&key) {
            old.timer.abort();
            let old_state = old.state.lock().await;
            warn!(%key, "replacing existing streaming state");
            self.reactions
                .forget(&old_state.ctx.channel, &old_state.ctx.original_ts)
                .await;
        }
        self.activity.clear_entries(&key).await;

        self.reactions
            .start_processing(&ctx.channel, &ctx.original_ts)
            .await;
        self.activity
            .add_entry(&key, ActivityEntry::starting())
            .await;

        let reply_root = Self::reply_root(&ctx);
        let initial = render_panel(&PanelView {
            status: StreamStatus::Running,
            model: ctx.model.clone(),
            reasoning: ctx.reasoning.clone(),
            active_tools: Vec::new(),
            tools_run: 0,
            window: format::render_window(
                &self.activity.get_entries(&key).await,
                ctx.window_entries,
                ctx.window_chars,
            ),
            context_line: None,
            key: key.clone(),
        });
        let activity_message_ts = match self
            .chat
            .post_message(&ctx.channel, Some(&reply_root), &initial)
            .await
        {
            Ok(ts) => Some(ts),
            Err(e) => {
                warn!(%key, "could not post activity panel: {e}");
                None
            }
        };

        let state = Arc::new(Mutex::new(StreamingState {
            ctx: ctx.clone(),
            text: String::new(),
            status: StreamStatus::Running,
            thinking: None,
            active_tools: HashMap::new(),
            tools_run: 0,
            generating_noted: false,
            activity_message_ts,
            tokens: TokenAccounting::default(),
            pending_abort: false,
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer_key = key.clone();
        let update_rate = ctx.update_rate;
        let timer = tokio::spawn(async move {
            loop {
                tokio::time::sleep(update_rate).await;
                let Some(manager) = weak.upgrade() else { break };
                if !manager.tick(&timer_key, false).await {
                    break;
                }
            }
        });

        let handle = Arc::new(ConvHandle {
            state,
            timer,
            thread_id: ctx.thread_id.clone(),
            turn_id: std::sync::Mutex::new(ctx.turn_id.clone()),
        });
        self.states.lock().await.insert(key.clone(), handle);
        info!(%key, thread_id = %ctx.thread_id, "streaming started");
    }

    /// First-writer-wins turn-id registration.
    pub async fn register_turn_id(&self, key: &ConversationKey, turn_id: &str) {
        if turn_id.is_empty() {
            return;
        }
        let Some(handle) = self.handle(key).await else {
            return;
        };
        {
            let mut slot = handle.turn_id.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return;
            }
            *slot = Some(turn_id.to_string());
        }
        let mut state = handle.state.lock().await;
        if state.ctx.turn_id.is_none() {
            state.ctx.turn_id = Some(turn_id.to_string());
        }
    }

    pub async fn find_key_by_thread_id(&self, thread_id: &str) -> Option<ConversationKey> {
        let states = self.states.lock().await;
        states
            .iter()
            .find(|(_, h)| h.thread_id == thread_id)
            .map(|(k, _)| k.clone())
    }

    pub async fn find_key_by_turn_id(&self, turn_id: &str) -> Option<ConversationKey> {
        let states = self.states.lock().await;
        states
            .iter()
            .find(|(_, h)| {
                h.turn_id
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .as_deref()
                    == Some(turn_id)
            })
            .map(|(k, _)| k.clone())
    }

    /// Route an event: by thread id when present, otherwise to the single
    /// active conversation.
    async fn route(&self, thread_id: &str) -> Option<ConversationKey> {
        if !thread_id.is_empty() {
            return self.find_key_by_thread_id(thread_id).await;
        }
        let states = self.states.lock().await;
        if states.len() == 1 {
            states.keys().next().cloned()
        } else {
            None
        }
    }

    async fn handle(&self, key: &ConversationKey) -> Option<Arc<ConvHandle>> {
        self.states.lock().await.get(key).cloned()
    }

    /// Channel, reply-thread root, and originating user of an active
    /// conversation, for callers (approvals) that post their own messages
    /// into it.
    pub async fn conversation_anchor(
        &self,
        key: &ConversationKey,
    ) -> Option<(String, String, Option<String>)> {
        let handle = self.handle(key).await?;
        let state = handle.state.lock().await;
        Some((
            state.ctx.channel.clone(),
            Self::reply_root(&state.ctx),
            state.ctx.user.clone(),
        ))
    }

    /// Remove state and cancel its timer.  Safe to call repeatedly.
    pub async fn stop_streaming(&self, key: &ConversationKey) {
        if let Some(handle) = self.states.lock().await.remove(key) {
            handle.timer.abort();
            debug!(%key, "streaming stopped");
        }
    }

    /// Shutdown path: stop every conversation.
    pub async fn stop_all_streaming(&self) {
        let keys: Vec<ConversationKey> = self.states.lock().await.keys().cloned().collect();
        for key in keys {
            self.stop_streaming(&key).await;
        }
    }

    /// The subprocess refused to start the turn: replace the panel with an
    /// error block (no Abort button), settle the reaction, drop all state.
    pub async fn fail_turn_start(&self, key: &ConversationKey, reason: &str) {
        let Some(handle) = self.handle(key).await else {
            return;
        };
        {
            let state = handle.state.lock().await;
            let payload = render_turn_start_failure(reason);
            if let Some(ts) = &state.activity_message_ts {
                if let Err(e) = self
                    .chat
                    .update_message(&state.ctx.channel, ts, &payload)
                    .await
                {
                    warn!(%key, "failed to render turn-start failure: {e}");
                }
            }
            self.reactions
                .error(&state.ctx.channel, &state.ctx.original_ts)
                .await;
        }
        self.aborts.clear(key);
        self.activity.clear_entries(key).await;
        self.stop_streaming(key).await;
    }

    // ── Abort ─────────────────────────────────────────────────────────────────

    /// User clicked Abort.
    pub async fn abort(self: &Arc<Self>, key: &ConversationKey) {
        let Some(handle) = self.handle(key).await else {
            return;
        };
        self.aborts.mark_aborted(key);

        let turn = {
            let mut state = handle.state.lock().await;
            state.pending_abort = true;
            state
                .ctx
                .turn_id
                .clone()
                .map(|turn_id| (state.ctx.thread_id.clone(), turn_id))
        };

        // Never send an interrupt without a turn id.
        match turn {
            Some((thread_id, turn_id)) if !turn_id.trim().is_empty() => {
                let client = self.client.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.turn_interrupt(&thread_id, &turn_id).await {
                        debug!("turn interrupt not delivered: {e}");
                    }
                });
            }
            _ => debug!(%key, "abort without turn id, skipping interrupt RPC"),
        }

        // Grace period: if the subprocess never reports completion, force
        // the turn down as interrupted.
        let weak: Weak<Self> = Arc::downgrade(self);
        let grace_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ABORT_GRACE).await;
            let Some(manager) = weak.upgrade() else { return };
            let still_pending = match manager.handle(&grace_key).await {
                Some(handle) => handle.state.lock().await.pending_abort,
                None => false,
            };
            if still_pending {
                info!(key = %grace_key, "abort grace elapsed, forcing interruption");
                manager
                    .finish_turn(&grace_key, TurnStatus::Interrupted)
                    .await;
            }
        });
    }

    // ── Event application ─────────────────────────────────────────────────────

    /// Apply one normalised subprocess event.  Approval requests are NOT
    /// handled here — route them to the approval handler.
    pub async fn handle_event(self: &Arc<Self>, ev: AgentEvent) {
        match ev {
            AgentEvent::TurnStarted { thread_id, turn_id }
            | AgentEvent::ContextTurnId { thread_id, turn_id } => {
                if let Some(key) = self.route(&thread_id).await {
                    self.register_turn_id(&key, &turn_id).await;
                }
            }
            AgentEvent::TurnCompleted {
                thread_id, status, ..
            } => {
                if let Some(key) = self.route(&thread_id).await {
                    self.finish_turn(&key, status).await;
                }
            }
            AgentEvent::ItemDelta {
                thread_id, text, ..
            } => {
                if let Some(handle) = self.routed_handle(&thread_id).await {
                    handle.state.lock().await.text.push_str(&text);
                }
            }
            AgentEvent::ItemStarted {
                thread_id,
                item_id,
                item_type,
            } => {
                let Some(key) = self.route(&thread_id).await else {
                    return;
                };
                let norm: String = item_type
                    .chars()
                    .filter(|c| !matches!(c, '-' | '_' | ' '))
                    .collect::<String>()
                    .to_ascii_lowercase();
                if norm == "agentmessage" || norm == "assistantmessage" {
                    let Some(handle) = self.handle(&key).await else {
                        return;
                    };
                    let mut state = handle.state.lock().await;
                    if !state.generating_noted {
                        state.generating_noted = true;
                        drop(state);
                        self.activity
                            .add_entry(&key, ActivityEntry::generating())
                            .await;
                    }
                } else if !format::is_excluded_item_type(&item_type) {
                    // Unknown item types are kept (safe default).
                    self.tool_started(&key, &item_id, &item_type, None).await;
                }
            }
            AgentEvent::ItemCompleted {
                thread_id,
                item_type,
                text,
                ..
            } => {
                let Some(handle) = self.routed_handle(&thread_id).await else {
                    return;
                };
                let norm: String = item_type
                    .chars()
                    .filter(|c| !matches!(c, '-' | '_' | ' '))
                    .collect::<String>()
                    .to_ascii_lowercase();
                if norm == "agentmessage" || norm == "assistantmessage" {
                    let mut state = handle.state.lock().await;
                    if state.text.is_empty() {
                        if let Some(text) = text {
                            state.text = text;
                        }
                    }
                }
            }
            AgentEvent::ToolStart {
                thread_id,
                item_id,
                tool,
                input,
            } => {
                if let Some(key) = self.route(&thread_id).await {
                    let input = input.map(ToolInputValue::Json);
                    self.tool_started(&key, &item_id, &tool, input).await;
                }
            }
            AgentEvent::ToolComplete {
                thread_id,
                item_id,
                tool,
                duration_ms,
                output,
                is_error,
                error_message,
                metrics,
            } => {
                if let Some(key) = self.route(&thread_id).await {
                    self.tool_completed(
                        &key,
                        &item_id,
                        &tool,
                        duration_ms,
                        output,
                        is_error,
                        error_message,
                        metrics,
                    )
                    .await;
                }
            }
            AgentEvent::ThinkingStarted {
                thread_id, item_id, ..
            } => {
                if let Some(key) = self.route(&thread_id).await {
                    self.thinking_started(&key, &item_id).await;
                }
            }
            AgentEvent::ThinkingDelta {
                thread_id,
                item_id,
                text,
            } => {
                if let Some(key) = self.route(&thread_id).await {
                    self.thinking_delta(&key, &item_id, &text).await;
                }
            }
            AgentEvent::ThinkingComplete {
                thread_id,
                item_id,
                duration_ms,
            } => {
                if let Some(key) = self.route(&thread_id).await {
                    self.thinking_complete(&key, &item_id, duration_ms).await;
                }
            }
            AgentEvent::ExecBegin {
                thread_id,
                item_id,
                command,
            } => {
                if let Some(key) = self.route(&thread_id).await {
                    let input = command.map(ToolInputValue::Text);
                    self.tool_started(&key, &item_id, "shell", input).await;
                }
            }
            AgentEvent::ExecOutput {
                thread_id,
                item_id,
                chunk,
            }
            | AgentEvent::CommandOutput {
                thread_id,
                item_id,
                chunk,
            } => {
                if let Some(handle) = self.routed_handle(&thread_id).await {
                    let mut state = handle.state.lock().await;
                    if let Some(tool) = state.active_tools.get_mut(&item_id) {
                        tool.output.push_str(&chunk);
                    }
                }
            }
            AgentEvent::ExecEnd {
                thread_id,
                item_id,
                exit_code,
            } => {
                if let Some(key) = self.route(&thread_id).await {
                    let is_error = matches!(exit_code, Some(code) if code != 0);
                    let error_message = exit_code
                        .filter(|code| *code != 0)
                        .map(|code| format!("exit {code}"));
                    self.tool_completed(
                        &key,
                        &item_id,
                        "shell",
                        None,
                        None,
                        is_error,
                        error_message,
                        ToolMetrics::default(),
                    )
                    .await;
                }
            }
            AgentEvent::WebSearchStarted {
                thread_id,
                item_id,
                query,
            } => {
                if let Some(key) = self.route(&thread_id).await {
                    let input = query.map(ToolInputValue::Text);
                    self.tool_started(&key, &item_id, "webSearch", input).await;
                }
            }
            AgentEvent::WebSearchCompleted {
                thread_id,
                item_id,
                query: _,
            } => {
                if let Some(key) = self.route(&thread_id).await {
                    self.tool_completed(
                        &key,
                        &item_id,
                        "webSearch",
                        None,
                        None,
                        false,
                        None,
                        ToolMetrics::default(),
                    )
                    .await;
                }
            }
            AgentEvent::FileChangeDelta {
                thread_id,
                item_id,
                text,
            } => {
                let Some(key) = self.route(&thread_id).await else {
                    return;
                };
                let Some(handle) = self.handle(&key).await else {
                    return;
                };
                let needs_entry = {
                    let mut state = handle.state.lock().await;
                    match state.active_tools.get_mut(&item_id) {
                        Some(tool) => {
                            tool.output.push_str(&text);
                            false
                        }
                        None => true,
                    }
                };
                if needs_entry {
                    self.tool_started(&key, &item_id, "fileChange", None).await;
                    if let Some(handle) = self.handle(&key).await {
                        let mut state = handle.state.lock().await;
                        if let Some(tool) = state.active_tools.get_mut(&item_id) {
                            tool.output.push_str(&text);
                        }
                    }
                }
            }
            AgentEvent::TokensUpdated { thread_id, usage } => {
                if let Some(handle) = self.routed_handle(&thread_id).await {
                    handle.state.lock().await.tokens.apply(&usage);
                }
            }
            AgentEvent::ApprovalRequested(_) => {
                debug!("approval request routed past the streaming manager");
            }
        }
    }

    async fn routed_handle(&self, thread_id: &str) -> Option<Arc<ConvHandle>> {
        let key = self.route(thread_id).await?;
        self.handle(&key).await
    }

    async fn tool_started(
        &self,
        key: &ConversationKey,
        item_id: &str,
        tool: &str,
        input: Option<ToolInputValue>,
    ) {
        let Some(handle) = self.handle(key).await else {
            return;
        };
        {
            let mut state = handle.state.lock().await;
            state.active_tools.insert(
                item_id.to_string(),
                ActiveTool {
                    tool: tool.to_string(),
                    input: input.clone(),
                    started: Instant::now(),
                    output: String::new(),
                },
            );
        }
        self.activity
            .add_entry(key, ActivityEntry::tool_start(item_id, tool, input))
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn tool_completed(
        &self,
        key: &ConversationKey,
        item_id: &str,
        tool: &str,
        duration_ms: Option<u64>,
        output: Option<String>,
        is_error: bool,
        error_message: Option<String>,
        metrics: ToolMetrics,
    ) {
        let Some(handle) = self.handle(key).await else {
            return;
        };
        let (tool_name, input, duration, buffered) = {
            let mut state = handle.state.lock().await;
            state.tools_run += 1;
            match state.active_tools.remove(item_id) {
                Some(active) => {
                    let elapsed = active.started.elapsed().as_millis() as u64;
                    (
                        active.tool,
                        active.input,
                        duration_ms.or(Some(elapsed)),
                        Some(active.output).filter(|o| !o.is_empty()),
                    )
                }
                None => (tool.to_string(), None, duration_ms, None),
            }
        };

        let mut entry = ActivityEntry::tool_complete(item_id, tool_name, input);
        entry.duration_ms = duration;
        entry.metrics = metrics;
        entry.tool_is_error = is_error;
        entry.tool_error_message = error_message;
        entry.tool_output_preview = output.or(buffered);
        self.activity.add_entry(key, entry).await;
    }

    async fn thinking_started(&self, key: &ConversationKey, item_id: &str) {
        let Some(handle) = self.handle(key).await else {
            return;
        };
        let fresh = {
            let mut state = handle.state.lock().await;
            let fresh = state
                .thinking
                .as_ref()
                .map(|t| t.item_id != item_id)
                .unwrap_or(true);
            if fresh {
                state.thinking = Some(ThinkingRecord {
                    item_id: item_id.to_string(),
                    content: String::new(),
                    started: Instant::now(),
                    complete: false,
                });
            }
            fresh
        };
        if fresh {
            self.activity
                .add_entry(key, ActivityEntry::thinking(item_id))
                .await;
        }
    }

    async fn thinking_delta(&self, key: &ConversationKey, item_id: &str, text: &str) {
        // A delta may arrive before the started event; either order is safe:
        // the started event is authoritative for the timestamp, the deltas
        // for the content length.
        self.thinking_started(key, item_id).await;
        let Some(handle) = self.handle(key).await else {
            return;
        };
        let count = {
            let mut state = handle.state.lock().await;
            let Some(record) = state.thinking.as_mut().filter(|t| t.item_id == item_id)
            else {
                return;
            };
            record.content.push_str(text);
            record.content.chars().count()
        };
        self.activity
            .update_thinking(key, item_id, |e| e.char_count = Some(count))
            .await;
    }

    async fn thinking_complete(
        &self,
        key: &ConversationKey,
        item_id: &str,
        duration_ms: Option<u64>,
    ) {
        let Some(handle) = self.handle(key).await else {
            return;
        };
        let duration = {
            let mut state = handle.state.lock().await;
            let Some(record) = state.thinking.as_mut().filter(|t| t.item_id == item_id)
            else {
                return;
            };
            record.complete = true;
            duration_ms.unwrap_or(record.started.elapsed().as_millis() as u64)
        };
        self.activity
            .update_thinking(key, item_id, |e| {
                e.thinking_in_progress = false;
                e.duration_ms = Some(duration);
            })
            .await;
    }

    // ── Rendering ─────────────────────────────────────────────────────────────

    /// One panel render + child flush.  Returns false when the conversation
    /// is gone (timer should stop).
    async fn tick(&self, key: &ConversationKey, terminal: bool) -> bool {
        let Some(handle) = self.handle(key).await else {
            return false;
        };
        let state = handle.state.lock().await;
        let entries = self.activity.get_entries(key).await;
        let view = PanelView {
            status: state.status,
            model: state.ctx.model.clone(),
            reasoning: state.ctx.reasoning.clone(),
            active_tools: state
                .active_tools
                .values()
                .map(|t| t.tool.clone())
                .collect(),
            tools_run: state.tools_run,
            window: format::render_window(
                &entries,
                state.ctx.window_entries,
                state.ctx.window_chars,
            ),
            context_line: state.tokens.context_line(),
            key: key.clone(),
        };
        if let Some(ts) = &state.activity_message_ts {
            if let Err(e) = self
                .chat
                .update_message(&state.ctx.channel, ts, &render_panel(&view))
                .await
            {
                debug!(%key, "panel update failed: {e}");
            }
        }
        let channel = state.ctx.channel.clone();
        let reply_root = Self::reply_root(&state.ctx);
        let char_limit = state.ctx.char_limit;
        drop(state);

        self.activity
            .flush(key, &channel, Some(&reply_root), char_limit, terminal)
            .await;
        true
    }

    // ── Completion ────────────────────────────────────────────────────────────

    /// Drive the turn to its terminal state and tear everything down.
    pub async fn finish_turn(&self, key: &ConversationKey, reported: TurnStatus) {
        let Some(handle) = self.states.lock().await.remove(key) else {
            return;
        };
        handle.timer.abort();

        // Abort overrides any reported status.
        let final_status = if self.aborts.is_aborted(key) {
            StreamStatus::Interrupted
        } else {
            match reported {
                TurnStatus::Completed => StreamStatus::Completed,
                TurnStatus::Interrupted => StreamStatus::Interrupted,
                TurnStatus::Failed | TurnStatus::Other(_) => StreamStatus::Failed,
            }
        };

        let mut state = handle.state.lock().await;
        state.status = final_status;

        // A thinking segment that never made it out as a child message gets
        // its chance on the final flush.
        if let Some(record) = &state.thinking {
            if !record.complete {
                let item_id = record.item_id.clone();
                let elapsed = record.started.elapsed().as_millis() as u64;
                self.activity
                    .update_thinking(key, &item_id, |e| {
                        e.thinking_in_progress = false;
                        e.duration_ms = Some(elapsed);
                    })
                    .await;
            }
        }
        match final_status {
            StreamStatus::Interrupted => {
                self.activity.add_entry(key, ActivityEntry::aborted()).await;
            }
            StreamStatus::Failed => {
                self.activity
                    .add_entry(key, ActivityEntry::error("The turn did not complete"))
                    .await;
            }
            _ => {}
        }

        // Final panel render (terminal header, no Abort button).
        let entries = self.activity.get_entries(key).await;
        let view = PanelView {
            status: final_status,
            model: state.ctx.model.clone(),
            reasoning: state.ctx.reasoning.clone(),
            active_tools: Vec::new(),
            tools_run: state.tools_run,
            window: format::render_window(
                &entries,
                state.ctx.window_entries,
                state.ctx.window_chars,
            ),
            context_line: state.tokens.context_line(),
            key: key.clone(),
        };
        if let Some(ts) = &state.activity_message_ts {
            if let Err(e) = self
                .chat
                .update_message(&state.ctx.channel, ts, &render_panel(&view))
                .await
            {
                warn!(%key, "final panel render failed: {e}");
            }
        }

        let channel = state.ctx.channel.clone();
        let reply_root = Self::reply_root(&state.ctx);
        let char_limit = state.ctx.char_limit;
        let original_ts = state.ctx.original_ts.clone();
        let response = state.text.clone();
        let turn_id = state.ctx.turn_id.clone();
        let usage = state.tokens.to_last_usage();
        let ctx_key = state.ctx.key.clone();
        drop(state);

        self.activity
            .flush(key, &channel, Some(&reply_root), char_limit, true)
            .await;

        // The final response: short inline, long as markdown + attachment.
        if !response.is_empty() && final_status != StreamStatus::Failed {
            let posted = if response.chars().count() > char_limit {
                post_long_content(
                    &self.chat,
                    &self.renderer,
                    &channel,
                    Some(&reply_root),
                    &response,
                    char_limit,
                    "response.md",
                )
                .await
            } else {
                self.chat
                    .post_message(
                        &channel,
                        Some(&reply_root),
                        &MessagePayload::text(response.clone()),
                    )
                    .await
            };
            match posted {
                Ok(response_ts) => {
                    // Completed channel-scope turns get a fork button so the
                    // conversation can branch into its own channel.
                    if final_status == StreamStatus::Completed && ctx_key.thread_ts.is_none() {
                        if let Some(turn_id) = &turn_id {
                            let shown = format::truncate_closed(&response, char_limit);
                            let blocks = crate::panel::fork_button_blocks(
                                &shown,
                                turn_id,
                                &original_ts,
                                &ctx_key,
                            );
                            let payload = MessagePayload::with_blocks(shown, blocks);
                            if let Err(e) = self
                                .chat
                                .update_message(&channel, &response_ts, &payload)
                                .await
                            {
                                debug!(%key, "fork button attach failed: {e}");
                            }
                        }
                    }
                }
                Err(e) => warn!(%key, "could not post final response: {e}"),
            }
        }

        match final_status {
            StreamStatus::Completed => self.reactions.complete(&channel, &original_ts).await,
            StreamStatus::Interrupted => self.reactions.abort(&channel, &original_ts).await,
            StreamStatus::Failed => self.reactions.error(&channel, &original_ts).await,
            StreamStatus::Running => unreachable!("terminal status"),
        }

        if let Some(usage) = usage {
            if let Err(e) = self
                .store
                .record_last_usage(&channel, ctx_key.thread_ts.as_deref(), usage)
                .await
            {
                warn!(%key, "could not persist usage: {e}");
            }
        }
        if ctx_key.thread_ts.is_none() {
            if let Some(turn_id) = &turn_id {
                if let Err(e) = self.store.record_turn(&channel, turn_id, &original_ts).await {
                    warn!(%key, "could not record turn: {e}");
                }
            }
        }

        self.aborts.clear(key);
        self.activity.clear_entries(key).await;
        info!(%key, ?final_status, "turn finished");
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_chat::mock::{MockCall, MockChatClient};
    use relay_chat::NoImageRenderer;
    use relay_rpc::JsonRpcTransport;

    use crate::reactions::ReactionNames;

    struct Fixture {
        mock: Arc<MockChatClient>,
        manager: Arc<StreamingManager>,
        store: Arc<SessionStore>,
        aborts: Arc<AbortRegistry>,
        _dir: tempfile::TempDir,
        _peer: tokio::io::DuplexStream,
    }

    fn fixture() -> Fixture {
        let (ours, peer) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(ours);
        let (transport, notify_rx) =
            JsonRpcTransport::new(read, write, Duration::from_secs(5));
        let client = AgentClient::new(transport, notify_rx);

        let mock = Arc::new(MockChatClient::new());
        let chat: Arc<dyn ChatClient> = mock.clone();
        let renderer: Arc<dyn MarkdownRenderer> = Arc::new(NoImageRenderer);
        let activity = Arc::new(ActivityThreadManager::new(chat.clone(), renderer.clone()));
        let reactions = Arc::new(EmojiReactionManager::new(
            chat.clone(),
            ReactionNames::default(),
        ));
        let aborts = Arc::new(AbortRegistry::new());
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("sessions.json")));

        let manager = StreamingManager::new(
            chat,
            renderer,
            client,
            activity,
            reactions,
            aborts.clone(),
            store.clone(),
        );
        Fixture {
            mock,
            manager,
            store,
            aborts,
            _dir: dir,
            _peer: peer,
        }
    }

    fn ctx(original_ts: &str) -> StreamingContext {
        StreamingContext {
            key: ConversationKey::channel("C1"),
            channel: "C1".to_string(),
            thread_ts: None,
            original_ts: original_ts.to_string(),
            user: Some("U1".to_string()),
            thread_id: "t-1".to_string(),
            turn_id: None,
            model: Some("gpt-5".to_string()),
            reasoning: Some("medium".to_string()),
            // Long enough that the periodic timer never fires mid-test.
            update_rate: Duration::from_secs(3600),
            char_limit: 500,
            window_entries: 20,
            window_chars: 1000,
        }
    }

    #[tokio::test]
    async fn restart_clears_old_timer_and_processing_reaction() {
        let f = fixture();
        f.manager.start_streaming(ctx("10.1")).await;
        assert_eq!(
            f.mock.reactions_on("C1", "10.1"),
            vec!["hourglass_flowing_sand".to_string()]
        );

        f.manager.start_streaming(ctx("10.2")).await;
        assert!(
            f.mock.reactions_on("C1", "10.1").is_empty(),
            "old processing reaction must be removed before overwrite"
        );
        assert_eq!(
            f.mock.reactions_on("C1", "10.2"),
            vec!["hourglass_flowing_sand".to_string()]
        );
    }

    #[tokio::test]
    async fn abort_overrides_reported_completion() {
        let f = fixture();
        let key = ConversationKey::channel("C1");
        f.manager.start_streaming(ctx("10.1")).await;
        f.manager.register_turn_id(&key, "0").await;

        f.manager.abort(&key).await;
        assert!(f.aborts.is_aborted(&key));

        f.manager
            .handle_event(AgentEvent::TurnCompleted {
                thread_id: "t-1".to_string(),
                turn_id: "0".to_string(),
                status: TurnStatus::Completed,
            })
            .await;

        // Abort wins over the reported "completed" status.
        assert_eq!(
            f.mock.reactions_on("C1", "10.1"),
            vec!["octagonal_sign".to_string()]
        );
        // The flag never leaks into the next turn.
        assert!(!f.aborts.is_aborted(&key));
        assert!(f.manager.find_key_by_thread_id("t-1").await.is_none());
    }

    #[tokio::test]
    async fn completed_turn_posts_response_and_records_turn() {
        let f = fixture();
        let key = ConversationKey::channel("C1");
        f.manager.start_streaming(ctx("10.1")).await;
        f.manager.register_turn_id(&key, "0").await;

        f.manager
            .handle_event(AgentEvent::ItemDelta {
                thread_id: "t-1".to_string(),
                item_id: "i1".to_string(),
                text: "Hello from the agent".to_string(),
            })
            .await;
        f.manager
            .handle_event(AgentEvent::TurnCompleted {
                thread_id: "t-1".to_string(),
                turn_id: "0".to_string(),
                status: TurnStatus::Completed,
            })
            .await;

        let posts = f.mock.posts();
        let response = posts.iter().rev().find_map(|c| match c {
            MockCall::Post { text, .. } if text.contains("Hello from the agent") => Some(text),
            _ => None,
        });
        assert!(response.is_some(), "final response must be posted");
        assert!(f.mock.reactions_on("C1", "10.1").is_empty());

        let session = f.store.get_session("C1").expect("session persisted");
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.turns[0].turn_id, "0");
        assert_eq!(session.turns[0].slack_ts, "10.1");
    }

    #[tokio::test]
    async fn failed_turn_sets_error_reaction_and_suppresses_response() {
        let f = fixture();
        let key = ConversationKey::channel("C1");
        f.manager.start_streaming(ctx("10.1")).await;
        f.manager.register_turn_id(&key, "0").await;

        f.manager
            .handle_event(AgentEvent::ItemDelta {
                thread_id: "t-1".to_string(),
                item_id: "i1".to_string(),
                text: "partial".to_string(),
            })
            .await;
        f.manager
            .handle_event(AgentEvent::TurnCompleted {
                thread_id: "t-1".to_string(),
                turn_id: "0".to_string(),
                status: TurnStatus::Failed,
            })
            .await;

        assert_eq!(f.mock.reactions_on("C1", "10.1"), vec!["x".to_string()]);
        assert!(
            !f.mock
                .posts()
                .iter()
                .any(|c| matches!(c, MockCall::Post { text, .. } if text == "partial")),
            "failed turns do not post the partial text as a response"
        );
    }

    #[tokio::test]
    async fn stop_streaming_is_idempotent() {
        let f = fixture();
        let key = ConversationKey::channel("C1");
        f.manager.start_streaming(ctx("10.1")).await;
        for _ in 0..3 {
            f.manager.stop_streaming(&key).await;
        }
        assert!(f.manager.find_key_by_thread_id("t-1").await.is_none());
    }

    #[tokio::test]
    async fn stop_all_streaming_drains_every_conversation() {
        let f = fixture();
        let mut second = ctx("20.1");
        second.key = ConversationKey::channel("C2");
        second.channel = "C2".to_string();
        second.thread_id = "t-2".to_string();

        f.manager.start_streaming(ctx("10.1")).await;
        f.manager.start_streaming(second).await;
        f.manager.stop_all_streaming().await;

        assert!(f.manager.find_key_by_thread_id("t-1").await.is_none());
        assert!(f.manager.find_key_by_thread_id("t-2").await.is_none());
    }

    #[tokio::test]
    async fn fail_turn_start_replaces_panel_and_drops_state() {
        let f = fixture();
        let key = ConversationKey::channel("C1");
        f.manager.start_streaming(ctx("10.1")).await;

        f.manager.fail_turn_start(&key, "subprocess refused").await;

        let updates = f.mock.updates();
        let error_update = updates.iter().find_map(|c| match c {
            MockCall::Update { text, .. } if text.contains("Could not start") => Some(text),
            _ => None,
        });
        assert!(error_update.is_some(), "panel replaced with error block");
        assert_eq!(f.mock.reactions_on("C1", "10.1"), vec!["x".to_string()]);
        assert!(f.manager.find_key_by_thread_id("t-1").await.is_none());

        // Calling again on dead state is a no-op.
        f.manager.fail_turn_start(&key, "again").await;
    }

    #[tokio::test]
    async fn turn_id_registration_is_first_writer_wins() {
        let f = fixture();
        let key = ConversationKey::channel("C1");
        f.manager.start_streaming(ctx("10.1")).await;
        f.manager.register_turn_id(&key, "0").await;
        f.manager.register_turn_id(&key, "9").await;
        assert_eq!(
            f.manager.find_key_by_turn_id("0").await,
            Some(key.clone())
        );
        assert_eq!(f.manager.find_key_by_turn_id("9").await, None);
    }

    // ── Token accounting ──────────────────────────────────────────────────────

    fn usage(input: u64, output: u64, cache: u64, total: Option<u64>) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            cache_read_input_tokens: cache,
            cache_creation_input_tokens: 0,
            total_tokens: total,
            context_window: Some(200_000),
            model: None,
            max_output_tokens: None,
        }
    }

    #[test]
    fn total_only_update_does_not_enable_display() {
        let mut t = TokenAccounting::default();
        t.apply(&usage(0, 0, 0, Some(5000)));
        assert!(t.context_line().is_none());
    }

    #[test]
    fn baseline_captured_on_first_nonzero_update() {
        let mut t = TokenAccounting::default();
        t.apply(&usage(0, 0, 0, Some(5000)));
        t.apply(&usage(1000, 50, 400, Some(6000)));
        // At capture time the deltas are zero, but the display is live and
        // falls back to the total delta.
        let line = t.context_line().expect("display enabled");
        assert!(line.contains("1000 tokens"), "{line}");

        t.apply(&usage(1600, 250, 700, Some(7000)));
        let line = t.context_line().unwrap();
        // Δinput 600 + Δoutput 200 + Δcache 300 = 1100.
        assert!(line.contains("1100 tokens"), "{line}");
        assert!(line.contains("% of 200000"), "{line}");
    }

    #[test]
    fn cache_counts_as_subset_not_additional() {
        let mut t = TokenAccounting::default();
        t.apply(&usage(1000, 0, 600, None));
        t.apply(&usage(1000, 100, 600, None));
        let line = t.context_line().unwrap();
        // Only the output delta moved; the unchanged cache adds nothing.
        assert!(line.contains("100 tokens"), "{line}");
    }

    #[test]
    fn last_usage_snapshot_round_trips() {
        let mut t = TokenAccounting::default();
        t.apply(&usage(1000, 50, 400, Some(6000)));
        let last = t.to_last_usage().unwrap();
        assert_eq!(last.input_tokens, 1000);
        assert_eq!(last.output_tokens, 50);
        assert_eq!(last.cache_read_input_tokens, 400);
        assert_eq!(last.context_window, Some(200_000));
    }
}
