// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chat platform capability.
//!
//! The bridge core talks to the chat platform exclusively through the
//! [`ChatClient`] trait so the streaming machinery can be exercised against
//! the recording [`mock::MockChatClient`] in tests.  The production
//! implementation is [`slack::SlackClient`] (Web API over reqwest) plus the
//! Socket Mode intake in [`socket`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

pub mod mock;
pub mod slack;
pub mod socket;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors surfaced by chat operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    /// The platform answered `ok: false` with an error code.
    #[error("chat api error: {code}")]
    Api { code: String },

    /// Non-200 HTTP status.
    #[error("chat http status {status}")]
    Http {
        status: u16,
        /// Seconds from a `Retry-After` header, when present.
        retry_after: Option<u64>,
    },

    /// Connection-level failure (DNS, TLS, socket).
    #[error("chat transport: {0}")]
    Transport(String),
}

impl ChatError {
    pub fn api(code: impl Into<String>) -> Self {
        ChatError::Api { code: code.into() }
    }

    /// The platform error code, when there is one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ChatError::Api { code } => Some(code),
            _ => None,
        }
    }

    /// Transient errors worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Api { code } => matches!(
                code.as_str(),
                "ratelimited" | "timeout" | "request_timeout" | "service_unavailable"
            ),
            ChatError::Http { status, .. } => *status == 429,
            ChatError::Transport(_) => false,
        }
    }
}

/// Maximum attempts for retryable chat calls.
pub const MAX_CHAT_ATTEMPTS: u32 = 3;

/// Shared retry helper: up to [`MAX_CHAT_ATTEMPTS`] attempts with backoff on
/// retryable errors, honouring `Retry-After` on HTTP 429.
pub async fn with_retry<T, Fut, F>(op: &str, mut f: F) -> Result<T, ChatError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChatError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < MAX_CHAT_ATTEMPTS => {
                attempt += 1;
                let delay = match &e {
                    ChatError::Http {
                        retry_after: Some(secs),
                        ..
                    } => Duration::from_secs(*secs),
                    _ => Duration::from_millis(500 * 2u64.pow(attempt)),
                };
                warn!(op, attempt, ?delay, "retrying chat call: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Message payload ───────────────────────────────────────────────────────────

/// Outbound message body: plain text with optional Block Kit blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePayload {
    pub text: String,
    pub blocks: Option<Value>,
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            blocks: None,
        }
    }

    pub fn with_blocks(text: impl Into<String>, blocks: Value) -> Self {
        Self {
            text: text.into(),
            blocks: Some(blocks),
        }
    }
}

// ── Capability trait ──────────────────────────────────────────────────────────

/// Everything the bridge core needs from the chat platform.
///
/// All methods are best-effort: callers decide whether a failure is fatal
/// for the turn or merely logged.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Post a message (optionally inside a thread); returns its timestamp.
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        msg: &MessagePayload,
    ) -> Result<String, ChatError>;

    /// Edit a previously posted message in place.
    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        msg: &MessagePayload,
    ) -> Result<(), ChatError>;

    async fn delete_message(&self, channel: &str, ts: &str) -> Result<(), ChatError>;

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError>;

    async fn remove_reaction(&self, channel: &str, ts: &str, name: &str)
        -> Result<(), ChatError>;

    /// Upload a file into the conversation; returns the platform file id.
    /// The share timestamp becomes visible asynchronously — poll
    /// [`ChatClient::file_share_ts`] for it.
    async fn upload_file(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        filename: &str,
        content: Vec<u8>,
        initial_comment: Option<&str>,
    ) -> Result<String, ChatError>;

    /// One `files.info` probe for the channel share timestamp of a file.
    async fn file_share_ts(
        &self,
        file_id: &str,
        channel: &str,
    ) -> Result<Option<String>, ChatError>;

    /// Open (or reuse) a direct-message conversation with a user.
    async fn open_dm(&self, user_id: &str) -> Result<String, ChatError>;

    /// Create a public channel; returns its id.
    async fn create_channel(&self, name: &str) -> Result<String, ChatError>;

    /// Display name of a channel, when the platform exposes it.
    async fn channel_name(&self, channel_id: &str) -> Result<Option<String>, ChatError>;
}

/// Renders markdown to an image for upload alongside `.md` attachments.
///
/// The default implementation renders nothing; failure to produce an image
/// is never an error.
pub trait MarkdownRenderer: Send + Sync {
    fn render_png(&self, _markdown: &str) -> Option<Vec<u8>> {
        None
    }
}

/// The no-op renderer used unless the embedder provides a real one.
pub struct NoImageRenderer;

impl MarkdownRenderer for NoImageRenderer {}

// ── Unit tests ────────────────────────────────────────────────────────────────
