// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Durable per-channel (and per-thread-within-channel) configuration and
//! subprocess-thread mapping.
//!
//! The whole store is one JSON document on disk.  Every mutating call runs
//! under a process-wide write mutex and rewrites the file via a temp-file
//! rename, so the document on disk is always valid JSON.  Readers tolerate
//! a missing or malformed file by returning an empty store and logging the
//! error — they never fail the caller.
//!
//! # Fallback resolution
//!
//! Thread-scoped settings shadow channel-scoped ones:
//! `get_effective_thread_id` first consults the thread entry and falls back
//! to the channel entry, and the same applies to the working directory and
//! the approval policy.

use std::path::{Path, PathBuf};

use chrono::Utc;
use relay_config::{
    clamp_thread_char_limit, clamp_update_rate_seconds, ApprovalPolicy, ReasoningEffort,
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

mod types;

pub use types::{ChannelSession, LastUsage, SessionFile, ThreadSession, TurnRecord};

/// Store-level failures (only writes can fail; reads degrade to empty).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable session mapping with a process-wide write mutex.
pub struct SessionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current document.  Missing or corrupt files yield an empty
    /// store; the error is logged, never thrown.
    pub fn load(&self) -> SessionFile {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(file) => file,
                Err(e) => {
                    error!(path = %self.path.display(), "corrupt session file, starting empty: {e}");
                    SessionFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionFile::default(),
            Err(e) => {
                error!(path = %self.path.display(), "unreadable session file, starting empty: {e}");
                SessionFile::default()
            }
        }
    }

    /// Run a mutation under the write mutex and persist the result.
    ///
    /// The only suspension inside the lock is the final disk write.
    async fn mutate<R>(&self, f: impl FnOnce(&mut SessionFile) -> R) -> Result<R, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load();
        let result = f(&mut file);
        let bytes = serde_json::to_vec_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(result)
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    pub fn get_session(&self, channel_id: &str) -> Option<ChannelSession> {
        self.load().channels.get(channel_id).cloned()
    }

    pub fn get_thread_session(&self, channel_id: &str, thread_ts: &str) -> Option<ThreadSession> {
        self.load()
            .channels
            .get(channel_id)?
            .threads
            .get(thread_ts)
            .cloned()
    }

    /// Thread-scoped working dir, falling back to the channel scope.
    pub fn get_effective_working_dir(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
    ) -> Option<String> {
        let file = self.load();
        let channel = file.channels.get(channel_id)?;
        if let Some(ts) = thread_ts {
            if let Some(dir) = channel.threads.get(ts).and_then(|t| t.working_dir.clone()) {
                return Some(dir);
            }
        }
        channel.effective_working_dir().map(str::to_string)
    }

    /// Thread-scoped approval policy, falling back to the channel scope.
    pub fn get_effective_approval_policy(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
    ) -> Option<ApprovalPolicy> {
        let file = self.load();
        let channel = file.channels.get(channel_id)?;
        if let Some(ts) = thread_ts {
            if let Some(policy) = channel.threads.get(ts).and_then(|t| t.approval_policy) {
                return Some(policy);
            }
        }
        Some(channel.approval_policy)
    }

    /// Thread-scoped subprocess thread id, falling back to the channel scope.
    pub fn get_effective_thread_id(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
    ) -> Option<String> {
        let file = self.load();
        let channel = file.channels.get(channel_id)?;
        if let Some(ts) = thread_ts {
            if let Some(id) = channel.threads.get(ts).and_then(|t| t.thread_id.clone()) {
                return Some(id);
            }
        }
        channel.thread_id.clone()
    }

    /// Effective per-message character limit (thread → channel → None).
    pub fn get_effective_char_limit(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
    ) -> Option<u32> {
        let file = self.load();
        let channel = file.channels.get(channel_id)?;
        if let Some(ts) = thread_ts {
            if let Some(v) = channel.threads.get(ts).and_then(|t| t.thread_char_limit) {
                return Some(v);
            }
        }
        channel.thread_char_limit
    }

    /// Effective update rate in seconds (thread → channel → None).
    pub fn get_effective_update_rate(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
    ) -> Option<u32> {
        let file = self.load();
        let channel = file.channels.get(channel_id)?;
        if let Some(ts) = thread_ts {
            if let Some(v) = channel.threads.get(ts).and_then(|t| t.update_rate_seconds) {
                return Some(v);
            }
        }
        channel.update_rate_seconds
    }

    // ── Writes ────────────────────────────────────────────────────────────────

    /// Apply a closure to the channel session (created on demand).
    pub async fn save_session(
        &self,
        channel_id: &str,
        f: impl FnOnce(&mut ChannelSession),
    ) -> Result<(), StoreError> {
        let now = now_millis();
        self.mutate(|file| {
            let session = file
                .channels
                .entry(channel_id.to_string())
                .or_insert_with(|| ChannelSession::new(now));
            f(session);
            session.last_active_at = now;
        })
        .await
    }

    /// Apply a closure to a thread session (channel and thread created on
    /// demand — a thread session never exists without its channel ancestor).
    pub async fn save_thread_session(
        &self,
        channel_id: &str,
        thread_ts: &str,
        f: impl FnOnce(&mut ThreadSession),
    ) -> Result<(), StoreError> {
        let now = now_millis();
        self.mutate(|file| {
            let channel = file
                .channels
                .entry(channel_id.to_string())
                .or_insert_with(|| ChannelSession::new(now));
            channel.last_active_at = now;
            let thread = channel
                .threads
                .entry(thread_ts.to_string())
                .or_insert_with(|| ThreadSession::new(now));
            f(thread);
            thread.last_active_at = now;
        })
        .await
    }

    /// Record the subprocess thread id after a successful start/resume.
    pub async fn record_thread_id(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        thread_id: &str,
    ) -> Result<(), StoreError> {
        let id = thread_id.to_string();
        match thread_ts {
            Some(ts) => {
                self.save_thread_session(channel_id, ts, |t| t.thread_id = Some(id))
                    .await
            }
            None => {
                self.save_session(channel_id, |c| c.thread_id = Some(id))
                    .await
            }
        }
    }

    pub async fn save_approval_policy(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        policy: ApprovalPolicy,
    ) -> Result<(), StoreError> {
        match thread_ts {
            Some(ts) => {
                self.save_thread_session(channel_id, ts, |t| t.approval_policy = Some(policy))
                    .await
            }
            None => {
                self.save_session(channel_id, |c| c.approval_policy = policy)
                    .await
            }
        }
    }

    pub async fn save_model_settings(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        model: Option<String>,
        effort: Option<ReasoningEffort>,
    ) -> Result<(), StoreError> {
        match thread_ts {
            Some(ts) => {
                self.save_thread_session(channel_id, ts, |t| {
                    t.model = model;
                    t.reasoning_effort = effort;
                })
                .await
            }
            None => {
                self.save_session(channel_id, |c| {
                    c.model = model;
                    c.reasoning_effort = effort;
                })
                .await
            }
        }
    }

    /// Save a per-message character limit, clamped to the documented range.
    pub async fn save_thread_char_limit(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        limit: u32,
    ) -> Result<u32, StoreError> {
        let clamped = clamp_thread_char_limit(limit);
        match thread_ts {
            Some(ts) => {
                self.save_thread_session(channel_id, ts, |t| t.thread_char_limit = Some(clamped))
                    .await?
            }
            None => {
                self.save_session(channel_id, |c| c.thread_char_limit = Some(clamped))
                    .await?
            }
        }
        Ok(clamped)
    }

    /// Save the activity update rate, clamped to 1–10 s.
    pub async fn save_update_rate(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        seconds: u32,
    ) -> Result<u32, StoreError> {
        let clamped = clamp_update_rate_seconds(seconds);
        match thread_ts {
            Some(ts) => {
                self.save_thread_session(channel_id, ts, |t| {
                    t.update_rate_seconds = Some(clamped)
                })
                .await?
            }
            None => {
                self.save_session(channel_id, |c| c.update_rate_seconds = Some(clamped))
                    .await?
            }
        }
        Ok(clamped)
    }

    /// Append a completed turn to the channel-scope turn log.
    pub async fn record_turn(
        &self,
        channel_id: &str,
        turn_id: &str,
        slack_ts: &str,
    ) -> Result<(), StoreError> {
        let turn_id = turn_id.to_string();
        let slack_ts = slack_ts.to_string();
        self.save_session(channel_id, move |c| {
            let turn_index = c.turns.len();
            c.turns.push(TurnRecord {
                turn_id,
                turn_index,
                slack_ts,
            });
        })
        .await
    }

    /// Persist the final token usage of a turn.
    pub async fn record_last_usage(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        usage: LastUsage,
    ) -> Result<(), StoreError> {
        match thread_ts {
            Some(ts) => {
                self.save_thread_session(channel_id, ts, |t| t.last_usage = Some(usage))
                    .await
            }
            None => {
                self.save_session(channel_id, |c| c.last_usage = Some(usage))
                    .await
            }
        }
    }

    /// Detach the current subprocess thread.
    ///
    /// The old id is appended to `previous_thread_ids` for manual resume,
    /// the usage and (channel scope) turn log are cleared, and — when the
    /// working directory was not yet locked — the pre-clear effective path
    /// becomes the locked path, attributed to `user_id`.
    pub async fn clear_session(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = now_millis();
        let user = user_id.map(str::to_string);
        self.mutate(|file| {
            let Some(channel) = file.channels.get_mut(channel_id) else {
                info!(channel_id, "clear: no session to clear");
                return;
            };
            // Capture the effective path before mutating anything.
            let pre_clear_path = channel.effective_working_dir().map(str::to_string);

            match thread_ts {
                Some(ts) => {
                    if let Some(thread) = channel.threads.get_mut(ts) {
                        if let Some(old) = thread.thread_id.take() {
                            thread.previous_thread_ids.push(old);
                        }
                        thread.last_usage = None;
                    }
                }
                None => {
                    if let Some(old) = channel.thread_id.take() {
                        channel.previous_thread_ids.push(old);
                    }
                    channel.last_usage = None;
                    channel.turns.clear();
                }
            }

            // "/clear implies /set-current-path": lock the directory the
            // conversation was effectively using, unless already locked.
            if !channel.path_configured {
                if let Some(path) = pre_clear_path {
                    channel.configured_path = Some(path);
                    channel.path_configured = true;
                    channel.configured_by = user;
                    channel.configured_at = Some(now);
                }
            }
            channel.last_active_at = now;
        })
        .await
    }

    /// Drop the whole channel entry (platform `channel_deleted`).
    ///
    /// Subprocess-side threads are NOT deleted — users holding the ids can
    /// still resume them from elsewhere — so every orphaned id is logged.
    /// Returns false (and logs) when the channel had no entry.
    pub async fn delete_channel_session(&self, channel_id: &str) -> Result<bool, StoreError> {
        self.mutate(|file| match file.channels.remove(channel_id) {
            Some(session) => {
                let mut orphans: Vec<String> = Vec::new();
                orphans.extend(session.thread_id.clone());
                orphans.extend(session.previous_thread_ids.iter().cloned());
                for thread in session.threads.values() {
                    orphans.extend(thread.thread_id.clone());
                    orphans.extend(thread.previous_thread_ids.iter().cloned());
                }
                for id in &orphans {
                    info!(channel_id, thread_id = %id, "channel deleted, orphaning subprocess thread");
                }
                true
            }
            None => {
                warn!(channel_id, "delete: channel session does not exist");
                false
            }
        })
        .await
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
