// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Monotonic per-message reaction state machine.
//!
//! Only the "processing" reaction is added when a turn starts; on completion
//! it is removed, on abort it is swapped for the abort marker, on error for
//! the error marker.  All operations are idempotent and tolerate the
//! platform's "already reacted" / "no reaction" answers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use relay_chat::{ChatClient, ChatError};

/// Reaction names used on user messages.
#[derive(Debug, Clone)]
pub struct ReactionNames {
    pub processing: String,
    pub aborted: String,
    pub error: String,
}

impl Default for ReactionNames {
    fn default() -> Self {
        Self {
            processing: "hourglass_flowing_sand".to_string(),
            aborted: "octagonal_sign".to_string(),
            error: "x".to_string(),
        }
    }
}

/// Where a message sits in the reaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReactionState {
    Processing,
    Cleared,
    Aborted,
    Errored,
}

impl ReactionState {
    fn is_terminal(&self) -> bool {
        !matches!(self, ReactionState::Processing)
    }
}

/// Per-message reaction bookkeeping on top of a [`ChatClient`].
pub struct EmojiReactionManager {
    chat: Arc<dyn ChatClient>,
    names: ReactionNames,
    states: Mutex<HashMap<(String, String), ReactionState>>,
}

impl EmojiReactionManager {
    pub fn new(chat: Arc<dyn ChatClient>, names: ReactionNames) -> Self {
        Self {
            chat,
            names,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a message as processing. Idempotent.
    pub async fn start_processing(&self, channel: &str, ts: &str) {
        let key = (channel.to_string(), ts.to_string());
        {
            let mut states = self.states.lock().await;
            if states.get(&key) == Some(&ReactionState::Processing) {
                return;
            }
            states.insert(key, ReactionState::Processing);
        }
        tolerate(
            self.chat
                .add_reaction(channel, ts, &self.names.processing)
                .await,
        );
    }

    /// Remove the processing reaction (successful completion).
    pub async fn complete(&self, channel: &str, ts: &str) {
        self.transition(channel, ts, ReactionState::Cleared, None)
            .await;
    }

    /// Swap processing for the abort marker.
    pub async fn abort(&self, channel: &str, ts: &str) {
        let marker = self.names.aborted.clone();
        self.transition(channel, ts, ReactionState::Aborted, Some(marker))
            .await;
    }

    /// Swap processing for the error marker.
    pub async fn error(&self, channel: &str, ts: &str) {
        let marker = self.names.error.clone();
        self.transition(channel, ts, ReactionState::Errored, Some(marker))
            .await;
    }

    /// Forget a message entirely (old state being replaced mid-stream).
    /// The processing reaction is removed regardless of recorded state.
    pub async fn forget(&self, channel: &str, ts: &str) {
        let key = (channel.to_string(), ts.to_string());
        self.states.lock().await.remove(&key);
        tolerate(
            self.chat
                .remove_reaction(channel, ts, &self.names.processing)
                .await,
        );
    }

    async fn transition(
        &self,
        channel: &str,
        ts: &str,
        next: ReactionState,
        add_marker: Option<String>,
    ) {
        let key = (channel.to_string(), ts.to_string());
        {
            let mut states = self.states.lock().await;
            match states.get(&key) {
                // Terminal states are sticky: a late transition is ignored.
                Some(state) if state.is_terminal() => {
                    debug!(channel, ts, ?state, "reaction already terminal");
                    return;
                }
                _ => {}
            }
            states.insert(key, next);
        }
        tolerate(
            self.chat
                .remove_reaction(channel, ts, &self.names.processing)
                .await,
        );
        if let Some(name) = add_marker {
            tolerate(self.chat.add_reaction(channel, ts, &name).await);
        }
    }
}

/// Treat already/no-reaction answers as success.
fn tolerate(result: Result<(), ChatError>) {
    if let Err(e) = result {
        match e.code() {
            Some("already_reacted") | Some("no_reaction") => {}
            _ => debug!("reaction call failed: {e}"),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_chat::mock::MockChatClient;

    fn manager() -> (Arc<MockChatClient>, EmojiReactionManager) {
        let mock = Arc::new(MockChatClient::new());
        let mgr = EmojiReactionManager::new(mock.clone(), ReactionNames::default());
        (mock, mgr)
    }

    #[tokio::test]
    async fn processing_then_complete_leaves_no_reaction() {
        let (mock, mgr) = manager();
        mgr.start_processing("C1", "1.1").await;
        assert_eq!(
            mock.reactions_on("C1", "1.1"),
            vec!["hourglass_flowing_sand".to_string()]
        );
        mgr.complete("C1", "1.1").await;
        assert!(mock.reactions_on("C1", "1.1").is_empty());
    }

    #[tokio::test]
    async fn abort_swaps_processing_for_marker() {
        let (mock, mgr) = manager();
        mgr.start_processing("C1", "1.1").await;
        mgr.abort("C1", "1.1").await;
        assert_eq!(
            mock.reactions_on("C1", "1.1"),
            vec!["octagonal_sign".to_string()]
        );
    }

    #[tokio::test]
    async fn error_swaps_processing_for_marker() {
        let (mock, mgr) = manager();
        mgr.start_processing("C1", "1.1").await;
        mgr.error("C1", "1.1").await;
        assert_eq!(mock.reactions_on("C1", "1.1"), vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn terminal_state_is_sticky() {
        let (mock, mgr) = manager();
        mgr.start_processing("C1", "1.1").await;
        mgr.abort("C1", "1.1").await;
        // A late completion must not remove the abort marker.
        mgr.complete("C1", "1.1").await;
        assert_eq!(
            mock.reactions_on("C1", "1.1"),
            vec!["octagonal_sign".to_string()]
        );
    }

    #[tokio::test]
    async fn operations_are_idempotent() {
        let (mock, mgr) = manager();
        mgr.start_processing("C1", "1.1").await;
        mgr.start_processing("C1", "1.1").await;
        mgr.complete("C1", "1.1").await;
        mgr.complete("C1", "1.1").await;
        assert!(mock.reactions_on("C1", "1.1").is_empty());
    }

    #[tokio::test]
    async fn complete_without_processing_is_tolerated() {
        let (mock, mgr) = manager();
        // remove_reaction will answer no_reaction; nothing blows up.
        mgr.complete("C1", "9.9").await;
        assert!(mock.reactions_on("C1", "9.9").is_empty());
    }
}
