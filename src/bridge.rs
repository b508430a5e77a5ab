// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Bridge assembly — wires Slack intake, the subprocess client, and the
//! core managers together and runs the main dispatch loop.
//!
//! # Structure
//!
//! ```text
//! Slack Socket Mode ──► mpsc<SlackInbound> ──┐
//!                                            ├──► dispatch loop
//! AgentClient events ──► broadcast ──────────┘        │
//!                                                     ├─► StreamingManager
//!                                                     ├─► ApprovalHandler
//!                                                     └─► SessionStore
//! ```
//!
//! The subprocess is supervised in generations: when it dies unexpectedly,
//! all in-flight turns are torn down, the transport is rebuilt over fresh
//! stdio, and the persisted channel→thread mapping carries the
//! conversations across the restart.  During shutdown the restart policy is
//! suppressed and teardown escalates through the supervisor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use relay_chat::slack::SlackClient;
use relay_chat::socket::{run_socket_mode, SlackInbound};
use relay_chat::{ChatClient, MarkdownRenderer, MessagePayload, NoImageRenderer};
use relay_config::Config;
use relay_core::{
    panel, suggest_fork_name, AbortRegistry, ActivityThreadManager, ApprovalHandler,
    ApprovalTimers, ConversationKey, EmojiReactionManager, ReactionNames, StreamingContext,
    StreamingManager,
};
use relay_process::{spawn_exit_watchdog, Supervisor, SupervisorConfig};
use relay_rpc::{AgentClient, AgentEvent, JsonRpcTransport, TurnStartParams};
use relay_session::SessionStore;

/// Hard-exit deadline for a hanging graceful shutdown.
const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(6);

/// Run the bridge until shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let bot_token = config
        .slack
        .bot_token
        .clone()
        .context("slack.bot_token is required (xoxb-…)")?;
    let app_token = config
        .slack
        .app_token
        .clone()
        .context("slack.app_token is required for Socket Mode (xapp-…)")?;

    let chat: Arc<dyn ChatClient> = Arc::new(SlackClient::new(bot_token));
    let renderer: Arc<dyn MarkdownRenderer> = Arc::new(NoImageRenderer);
    let store = Arc::new(SessionStore::new(&config.session_file));

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<SlackInbound>(256);
    tokio::spawn(run_socket_mode(app_token, inbound_tx));

    let supervisor = Arc::new(Supervisor::new(SupervisorConfig {
        command: config.subprocess.command.clone(),
        args: config.subprocess.args.clone(),
        working_dir: config.subprocess.working_dir.clone(),
        restart_backoff: Duration::from_secs(config.subprocess.restart_backoff_secs),
        ..SupervisorConfig::default()
    }));

    // Generation loop: one iteration per subprocess lifetime.
    loop {
        if supervisor.is_shutting_down() {
            return Ok(());
        }

        let mut agent = match supervisor.spawn() {
            Ok(agent) => agent,
            Err(e) => {
                error!("could not spawn subprocess: {e}");
                supervisor.backoff().await;
                continue;
            }
        };
        let (stdin, stdout) = agent.take_stdio()?;
        let (transport, notify_rx) = JsonRpcTransport::new(
            stdout,
            stdin,
            Duration::from_secs(config.subprocess.request_timeout_secs),
        );
        let client = AgentClient::new(transport, notify_rx);

        if let Err(e) = client.initialize().await {
            error!("subprocess initialize failed: {e}");
            client.stop();
            supervisor.shutdown(&mut agent).await;
            supervisor.backoff().await;
            continue;
        }

        let generation = Generation::new(&config, chat.clone(), renderer.clone(), store.clone(), client.clone());

        let mut events = client.subscribe();
        info!("bridge ready");

        // Dispatch until the subprocess dies or we are told to stop.
        let mut shutdown = false;
        let mut respawn = false;
        while !shutdown && !respawn {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    shutdown = true;
                }
                exit = agent.child.wait() => {
                    warn!(?exit, "subprocess exited");
                    respawn = true;
                }
                event = events.recv() => match event {
                    Ok(ev) => generation.dispatch_event(ev).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        respawn = true;
                    }
                },
                inbound = inbound_rx.recv() => match inbound {
                    Some(msg) => generation.dispatch_inbound(msg).await,
                    None => {
                        warn!("Slack intake closed");
                        shutdown = true;
                    }
                },
            }
        }

        generation.streaming.stop_all_streaming().await;
        client.stop();

        if shutdown || supervisor.is_shutting_down() {
            supervisor.begin_shutdown();
            let watchdog = spawn_exit_watchdog(SHUTDOWN_WATCHDOG);
            supervisor.shutdown(&mut agent).await;
            watchdog.abort();
            return Ok(());
        }

        supervisor.backoff().await;
    }
}

/// Everything that lives for one subprocess generation.
struct Generation {
    config: Config,
    chat: Arc<dyn ChatClient>,
    store: Arc<SessionStore>,
    client: Arc<AgentClient>,
    streaming: Arc<StreamingManager>,
    approvals: Arc<ApprovalHandler>,
    /// Threads already resumed on this subprocess instance.
    resumed: Arc<Mutex<HashSet<String>>>,
}

impl Generation {
    fn new(
        config: &Config,
        chat: Arc<dyn ChatClient>,
        renderer: Arc<dyn MarkdownRenderer>,
        store: Arc<SessionStore>,
        client: Arc<AgentClient>,
    ) -> Arc<Self> {
        let aborts = Arc::new(AbortRegistry::new());
        let reactions = Arc::new(EmojiReactionManager::new(
            chat.clone(),
            ReactionNames {
                processing: config.slack.processing_reaction.clone(),
                aborted: config.slack.aborted_reaction.clone(),
                error: config.slack.error_reaction.clone(),
            },
        ));
        let activity = Arc::new(
            ActivityThreadManager::new(chat.clone(), renderer.clone())
                .with_min_gap(Duration::from_secs(config.activity.min_post_gap_secs)),
        );
        let streaming = StreamingManager::new(
            chat.clone(),
            renderer,
            client.clone(),
            activity,
            reactions,
            aborts,
            store.clone(),
        );
        let approvals = ApprovalHandler::new(
            chat.clone(),
            client.clone(),
            ApprovalTimers {
                reminder: Duration::from_secs(config.approvals.reminder_secs),
                expiry: Duration::from_secs(config.approvals.expiry_secs),
                dm_debounce: Duration::from_secs(config.approvals.dm_debounce_secs),
            },
        );
        Arc::new(Self {
            config: config.clone(),
            chat,
            store,
            client,
            streaming,
            approvals,
            resumed: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    // ── Subprocess events ─────────────────────────────────────────────────────

    async fn dispatch_event(self: &Arc<Self>, ev: AgentEvent) {
        match ev {
            AgentEvent::ApprovalRequested(request) => {
                let key = if !request.thread_id.is_empty() {
                    self.streaming.find_key_by_thread_id(&request.thread_id).await
                } else {
                    self.streaming.find_key_by_turn_id(&request.turn_id).await
                };
                let Some(key) = key else {
                    warn!("approval request for unknown conversation, ignoring");
                    return;
                };
                let Some((channel, reply_root, user)) =
                    self.streaming.conversation_anchor(&key).await
                else {
                    return;
                };
                let this = self.clone();
                tokio::spawn(async move {
                    this.approvals
                        .handle_request(request, &channel, Some(&reply_root), user.as_deref())
                        .await;
                });
            }
            other => self.streaming.handle_event(other).await,
        }
    }

    // ── Slack inbound ─────────────────────────────────────────────────────────

    async fn dispatch_inbound(self: &Arc<Self>, inbound: SlackInbound) {
        match inbound {
            SlackInbound::Message {
                channel,
                thread_ts,
                user,
                ts,
                text,
            } => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.handle_message(channel, thread_ts, user, ts, text).await;
                });
            }
            SlackInbound::BlockAction {
                action_id,
                value,
                channel,
                message_ts,
                thread_ts,
                user,
            } => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.handle_block_action(action_id, value, channel, message_ts, thread_ts, user)
                        .await;
                });
            }
            SlackInbound::ChannelDeleted { channel } => {
                if let Err(e) = self.store.delete_channel_session(&channel).await {
                    warn!(channel, "could not delete channel session: {e}");
                }
            }
        }
    }

    async fn handle_message(
        &self,
        channel: String,
        thread_ts: Option<String>,
        user: String,
        ts: String,
        text: String,
    ) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }

        // Minimal conversation commands; everything else becomes a turn.
        if let Some(rest) = text.strip_prefix("/clear") {
            if rest.trim().is_empty() {
                self.handle_clear(&channel, thread_ts.as_deref(), &user).await;
                return;
            }
        }
        if let Some(path) = text.strip_prefix("/cd ") {
            self.handle_cd(&channel, path.trim(), &user).await;
            return;
        }

        let key = ConversationKey::new(&channel, thread_ts.clone());
        let thread_id = match self
            .resolve_thread(&channel, thread_ts.as_deref())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(%key, "could not resolve subprocess thread: {e}");
                let note =
                    MessagePayload::text(format!(":warning: Could not reach the agent: {e}"));
                let _ = self
                    .chat
                    .post_message(&channel, thread_ts.as_deref().or(Some(ts.as_str())), &note)
                    .await;
                return;
            }
        };

        let session = self.store.get_session(&channel);
        let thread_session = thread_ts
            .as_deref()
            .and_then(|ts| self.store.get_thread_session(&channel, ts));

        let model = thread_session
            .as_ref()
            .and_then(|t| t.model.clone())
            .or_else(|| session.as_ref().and_then(|s| s.model.clone()))
            .or_else(|| self.config.defaults.model.clone());
        let reasoning = thread_session
            .as_ref()
            .and_then(|t| t.reasoning_effort)
            .or_else(|| session.as_ref().and_then(|s| s.reasoning_effort))
            .or(self.config.defaults.reasoning_effort);
        let policy = self
            .store
            .get_effective_approval_policy(&channel, thread_ts.as_deref())
            .unwrap_or(self.config.defaults.approval_policy);
        let update_rate = self
            .store
            .get_effective_update_rate(&channel, thread_ts.as_deref())
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(Duration::from_millis(self.config.defaults.update_rate_ms));
        let char_limit = self
            .store
            .get_effective_char_limit(&channel, thread_ts.as_deref())
            .unwrap_or(self.config.defaults.thread_char_limit) as usize;

        let ctx = StreamingContext {
            key: key.clone(),
            channel: channel.clone(),
            thread_ts: thread_ts.clone(),
            original_ts: ts,
            user: Some(user.clone()).filter(|u| !u.is_empty()),
            thread_id: thread_id.clone(),
            turn_id: None,
            model: model.clone(),
            reasoning: reasoning.map(|r| r.as_str().to_string()),
            update_rate,
            char_limit,
            window_entries: self.config.activity.window_entries,
            window_chars: self.config.activity.window_chars,
        };
        self.streaming.start_streaming(ctx).await;

        let params = TurnStartParams {
            thread_id,
            text,
            model,
            reasoning_effort: reasoning.map(|r| r.as_str().to_string()),
            approval_policy: Some(policy.as_str().to_string()),
        };
        if let Err(e) = self.client.turn_start(params).await {
            self.streaming
                .fail_turn_start(&key, &format!("the agent refused the turn: {e}"))
                .await;
        }
    }

    /// Existing subprocess thread (resumed once per generation) or a new one.
    async fn resolve_thread(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
    ) -> Result<String, relay_rpc::RpcError> {
        if let Some(existing) = self.store.get_effective_thread_id(channel, thread_ts) {
            let mut resumed = self.resumed.lock().await;
            if resumed.contains(&existing) {
                return Ok(existing);
            }
            match self.client.thread_resume(&existing).await {
                Ok(info) => {
                    resumed.insert(info.id.clone());
                    return Ok(info.id);
                }
                Err(e) => {
                    warn!(thread_id = %existing, "resume failed, starting fresh: {e}");
                }
            }
        }

        let working_dir = self
            .store
            .get_effective_working_dir(channel, thread_ts)
            .or_else(|| {
                self.config
                    .subprocess
                    .working_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
            })
            .unwrap_or_else(|| ".".to_string());

        let info = self.client.thread_start(&working_dir).await?;
        if let Err(e) = self
            .store
            .record_thread_id(channel, thread_ts, &info.id)
            .await
        {
            warn!("could not persist thread id: {e}");
        }
        if let Err(e) = self
            .store
            .save_session(channel, |c| {
                if c.working_dir.is_empty() {
                    c.working_dir = working_dir.clone();
                }
            })
            .await
        {
            warn!("could not persist working dir: {e}");
        }
        self.resumed.lock().await.insert(info.id.clone());
        Ok(info.id)
    }

    async fn handle_clear(&self, channel: &str, thread_ts: Option<&str>, user: &str) {
        if let Err(e) = self.store.clear_session(channel, thread_ts, Some(user)).await {
            warn!(channel, "clear failed: {e}");
            return;
        }
        let note = MessagePayload::text(
            ":broom: Conversation cleared. The next message starts a fresh agent thread; \
             the previous one stays resumable by id.",
        );
        let _ = self.chat.post_message(channel, thread_ts, &note).await;
    }

    async fn handle_cd(&self, channel: &str, path: &str, user: &str) {
        let locked = self
            .store
            .get_session(channel)
            .map(|s| s.path_configured)
            .unwrap_or(false);
        if locked {
            let note = MessagePayload::text(
                ":lock: The working directory is locked for this channel and cannot be changed.",
            );
            let _ = self.chat.post_message(channel, None, &note).await;
            return;
        }
        let path = path.to_string();
        let user = user.to_string();
        let result = self
            .store
            .save_session(channel, move |c| {
                c.working_dir = path.clone();
                c.configured_by = Some(user.clone());
            })
            .await;
        let note = match result {
            Ok(()) => MessagePayload::text(":file_folder: Working directory updated."),
            Err(e) => {
                warn!(channel, "cd failed: {e}");
                MessagePayload::text(":warning: Could not update the working directory.")
            }
        };
        let _ = self.chat.post_message(channel, None, &note).await;
    }

    // ── Interactive components ────────────────────────────────────────────────

    async fn handle_block_action(
        self: &Arc<Self>,
        action_id: String,
        value: Option<String>,
        channel: String,
        _message_ts: String,
        thread_ts: Option<String>,
        _user: String,
    ) {
        if let Some(key) = panel::parse_abort_action(&action_id) {
            self.streaming.abort(&key).await;
            return;
        }
        if let Some((id, decision)) = relay_core::parse_approval_action(&action_id) {
            self.approvals.handle_decision(id, decision).await;
            return;
        }
        if action_id == panel::FORK_ACTION_ID {
            let Some(fork) = value.as_deref().and_then(panel::parse_fork_value) else {
                warn!("fork action without a usable value");
                return;
            };
            if let Err(e) = self.execute_fork(&fork).await {
                warn!("fork failed: {e}");
                let note =
                    MessagePayload::text(format!(":warning: Could not fork the thread: {e}"));
                let _ = self
                    .chat
                    .post_message(&channel, thread_ts.as_deref(), &note)
                    .await;
            }
            return;
        }
        warn!(action_id, "unhandled block action");
    }

    /// Fork the source thread at the clicked turn into a fresh channel.
    ///
    /// The turn index is computed live against the subprocess — the button
    /// value only carries the turn id.
    async fn execute_fork(&self, fork: &panel::ForkRequest) -> anyhow::Result<()> {
        let src_key = ConversationKey::parse(&fork.conversation_key);
        let src_thread = self
            .store
            .get_effective_thread_id(&src_key.channel, src_key.thread_ts.as_deref())
            .context("source conversation has no agent thread")?;

        let index = self
            .client
            .find_turn_index(&src_thread, &fork.turn_id)
            .await?
            .context("turn not found in the agent thread")?;
        let forked = self.client.fork_at_turn(&src_thread, index).await?;

        // Name the new channel after the source, walking the -fork-<k>
        // sequence over name collisions.
        let base = self
            .chat
            .channel_name(&src_key.channel)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| src_key.channel.to_ascii_lowercase());
        let mut taken = HashSet::new();
        let new_channel = loop {
            let candidate = suggest_fork_name(&base, &taken);
            match self.chat.create_channel(&candidate).await {
                Ok(id) => break id,
                Err(e) if e.code() == Some("name_taken") => {
                    taken.insert(candidate);
                }
                Err(e) => return Err(e.into()),
            }
        };

        let working_dir = self
            .store
            .get_effective_working_dir(&src_key.channel, src_key.thread_ts.as_deref());
        let forked_id = forked.id.clone();
        let src_thread_for_store = src_thread.clone();
        self.store
            .save_session(&new_channel, move |c| {
                c.thread_id = Some(forked_id);
                c.forked_from = Some(src_thread_for_store);
                c.forked_at_turn_index = Some(index);
                if let Some(dir) = working_dir {
                    c.working_dir = dir;
                }
            })
            .await?;
        self.resumed.lock().await.insert(forked.id.clone());

        let note = MessagePayload::text(format!(
            ":twisted_rightwards_arrows: Forked from <#{}> at turn {} — continue here.",
            src_key.channel,
            index + 1
        ));
        let _ = self.chat.post_message(&new_channel, None, &note).await;
        info!(
            source = %src_key,
            new_channel,
            forked_thread = %forked.id,
            "fork completed"
        );
        Ok(())
    }
}
