// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Recording mock [`ChatClient`] for tests.
//!
//! Records every call, mints monotonically increasing message timestamps,
//! and supports targeted failure injection (fail the next post, pretend a
//! reaction already exists, make channel names collide).

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{ChatClient, ChatError, MessagePayload};

/// One recorded call against the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Post {
        channel: String,
        thread_ts: Option<String>,
        text: String,
        has_blocks: bool,
        ts: String,
    },
    Update {
        channel: String,
        ts: String,
        text: String,
        has_blocks: bool,
    },
    Delete {
        channel: String,
        ts: String,
    },
    AddReaction {
        channel: String,
        ts: String,
        name: String,
    },
    RemoveReaction {
        channel: String,
        ts: String,
        name: String,
    },
    Upload {
        channel: String,
        filename: String,
        bytes: usize,
        file_id: String,
    },
    FileInfo {
        file_id: String,
    },
    OpenDm {
        user: String,
    },
    CreateChannel {
        name: String,
        id: String,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    next_ts: u64,
    next_file: u64,
    fail_next_post: bool,
    /// Reactions currently present, for already/no-reaction simulation.
    reactions: HashSet<(String, String, String)>,
    /// Channel names that collide with `name_taken`.
    taken_channel_names: HashSet<String>,
    /// files.info returns the share ts only after this many probes.
    share_ts_after_probes: u32,
    probes_seen: u32,
}

/// In-memory [`ChatClient`] that records everything.
#[derive(Default)]
pub struct MockChatClient {
    state: Mutex<MockState>,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn posts(&self) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::Post { .. }))
            .collect()
    }

    pub fn updates(&self) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::Update { .. }))
            .collect()
    }

    pub fn uploads(&self) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::Upload { .. }))
            .collect()
    }

    /// Reactions currently on a message.
    pub fn reactions_on(&self, channel: &str, ts: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .reactions
            .iter()
            .filter(|(c, t, _)| c == channel && t == ts)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    pub fn fail_next_post(&self) {
        self.state.lock().unwrap().fail_next_post = true;
    }

    pub fn mark_channel_name_taken(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .taken_channel_names
            .insert(name.to_string());
    }

    /// Delay `file_share_ts` visibility for the given number of probes.
    pub fn delay_share_ts(&self, probes: u32) {
        self.state.lock().unwrap().share_ts_after_probes = probes;
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        msg: &MessagePayload,
    ) -> Result<String, ChatError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_post {
            state.fail_next_post = false;
            return Err(ChatError::api("fatal_error"));
        }
        state.next_ts += 1;
        let ts = format!("1700000000.{:06}", state.next_ts);
        state.calls.push(MockCall::Post {
            channel: channel.to_string(),
            thread_ts: thread_ts.map(str::to_string),
            text: msg.text.clone(),
            has_blocks: msg.blocks.is_some(),
            ts: ts.clone(),
        });
        Ok(ts)
    }

    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        msg: &MessagePayload,
    ) -> Result<(), ChatError> {
        self.state.lock().unwrap().calls.push(MockCall::Update {
            channel: channel.to_string(),
            ts: ts.to_string(),
            text: msg.text.clone(),
            has_blocks: msg.blocks.is_some(),
        });
        Ok(())
    }

    async fn delete_message(&self, channel: &str, ts: &str) -> Result<(), ChatError> {
        self.state.lock().unwrap().calls.push(MockCall::Delete {
            channel: channel.to_string(),
            ts: ts.to_string(),
        });
        Ok(())
    }

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        let mut state = self.state.lock().unwrap();
        let key = (channel.to_string(), ts.to_string(), name.to_string());
        if !state.reactions.insert(key) {
            return Err(ChatError::api("already_reacted"));
        }
        state.calls.push(MockCall::AddReaction {
            channel: channel.to_string(),
            ts: ts.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn remove_reaction(
        &self,
        channel: &str,
        ts: &str,
        name: &str,
    ) -> Result<(), ChatError> {
        let mut state = self.state.lock().unwrap();
        let key = (channel.to_string(), ts.to_string(), name.to_string());
        if !state.reactions.remove(&key) {
            return Err(ChatError::api("no_reaction"));
        }
        state.calls.push(MockCall::RemoveReaction {
            channel: channel.to_string(),
            ts: ts.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn upload_file(
        &self,
        channel: &str,
        _thread_ts: Option<&str>,
        filename: &str,
        content: Vec<u8>,
        _initial_comment: Option<&str>,
    ) -> Result<String, ChatError> {
        let mut state = self.state.lock().unwrap();
        state.next_file += 1;
        let file_id = format!("F{:06}", state.next_file);
        state.calls.push(MockCall::Upload {
            channel: channel.to_string(),
            filename: filename.to_string(),
            bytes: content.len(),
            file_id: file_id.clone(),
        });
        Ok(file_id)
    }

    async fn file_share_ts(
        &self,
        file_id: &str,
        _channel: &str,
    ) -> Result<Option<String>, ChatError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::FileInfo {
            file_id: file_id.to_string(),
        });
        state.probes_seen += 1;
        if state.probes_seen > state.share_ts_after_probes {
            Ok(Some(format!("1700000000.9{:05}", state.probes_seen)))
        } else {
            Ok(None)
        }
    }

    async fn open_dm(&self, user_id: &str) -> Result<String, ChatError> {
        self.state.lock().unwrap().calls.push(MockCall::OpenDm {
            user: user_id.to_string(),
        });
        Ok(format!("D-{user_id}"))
    }

    async fn create_channel(&self, name: &str) -> Result<String, ChatError> {
        let mut state = self.state.lock().unwrap();
        if state.taken_channel_names.contains(name) {
            return Err(ChatError::api("name_taken"));
        }
        state.taken_channel_names.insert(name.to_string());
        let id = format!("C-{name}");
        state.calls.push(MockCall::CreateChannel {
            name: name.to_string(),
            id: id.clone(),
        });
        Ok(id)
    }

    async fn channel_name(&self, channel_id: &str) -> Result<Option<String>, ChatError> {
        // Mock channels are named after their id, lowercased.
        Ok(Some(channel_id.to_ascii_lowercase()))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
