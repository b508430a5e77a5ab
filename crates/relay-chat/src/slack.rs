// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Slack Web API implementation of [`ChatClient`].
//!
//! Every call goes through the shared retry helper, which backs off on
//! `ratelimited` / transient-timeout codes and HTTP 429 (honouring
//! `Retry-After`).  Uploads use the external-upload flow
//! (`files.getUploadURLExternal` → raw POST → `files.completeUploadExternal`);
//! the resulting share timestamp is only visible later via `files.info`,
//! which callers poll through [`ChatClient::file_share_ts`].

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{with_retry, ChatClient, ChatError, MessagePayload};

const SLACK_API: &str = "https://slack.com/api";

/// Slack Web API client, keyed by a bot token (`xoxb-…`).
pub struct SlackClient {
    http: reqwest::Client,
    bot_token: String,
}

impl SlackClient {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token: bot_token.into(),
        }
    }

    /// POST a JSON body to a Web API method and decode the `ok`/`error`
    /// envelope.
    async fn api_call(&self, method: &str, body: Value) -> Result<Value, ChatError> {
        let url = format!("{SLACK_API}/{method}");
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ChatError::Http {
                status,
                retry_after,
            });
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        if value.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(value)
        } else {
            let code = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
                .to_string();
            Err(ChatError::Api { code })
        }
    }

    fn message_body(channel: &str, thread_ts: Option<&str>, msg: &MessagePayload) -> Value {
        let mut body = json!({"channel": channel, "text": msg.text});
        if let Some(ts) = thread_ts {
            body["thread_ts"] = json!(ts);
        }
        if let Some(blocks) = &msg.blocks {
            body["blocks"] = blocks.clone();
        }
        body
    }
}

#[async_trait]
impl ChatClient for SlackClient {
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        msg: &MessagePayload,
    ) -> Result<String, ChatError> {
        let body = Self::message_body(channel, thread_ts, msg);
        let resp = with_retry("chat.postMessage", || {
            self.api_call("chat.postMessage", body.clone())
        })
        .await?;
        resp.get("ts")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChatError::Transport("chat.postMessage returned no ts".to_string()))
    }

    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        msg: &MessagePayload,
    ) -> Result<(), ChatError> {
        let mut body = Self::message_body(channel, None, msg);
        body["ts"] = json!(ts);
        // chat.update with no blocks must clear previous blocks explicitly.
        if msg.blocks.is_none() {
            body["blocks"] = json!([]);
        }
        with_retry("chat.update", || self.api_call("chat.update", body.clone())).await?;
        Ok(())
    }

    async fn delete_message(&self, channel: &str, ts: &str) -> Result<(), ChatError> {
        let body = json!({"channel": channel, "ts": ts});
        with_retry("chat.delete", || self.api_call("chat.delete", body.clone())).await?;
        Ok(())
    }

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        let body = json!({"channel": channel, "timestamp": ts, "name": name});
        with_retry("reactions.add", || {
            self.api_call("reactions.add", body.clone())
        })
        .await?;
        Ok(())
    }

    async fn remove_reaction(
        &self,
        channel: &str,
        ts: &str,
        name: &str,
    ) -> Result<(), ChatError> {
        let body = json!({"channel": channel, "timestamp": ts, "name": name});
        with_retry("reactions.remove", || {
            self.api_call("reactions.remove", body.clone())
        })
        .await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        filename: &str,
        content: Vec<u8>,
        initial_comment: Option<&str>,
    ) -> Result<String, ChatError> {
        // Step 1: reserve an upload URL.
        let reserve = with_retry("files.getUploadURLExternal", || {
            self.api_call(
                "files.getUploadURLExternal",
                json!({"filename": filename, "length": content.len()}),
            )
        })
        .await?;
        let upload_url = reserve
            .get("upload_url")
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::Transport("missing upload_url".to_string()))?
            .to_string();
        let file_id = reserve
            .get("file_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::Transport("missing file_id".to_string()))?
            .to_string();

        // Step 2: push the bytes to the reserved URL.
        let resp = self
            .http
            .post(&upload_url)
            .body(content)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ChatError::Http {
                status: resp.status().as_u16(),
                retry_after: None,
            });
        }

        // Step 3: finish and share into the conversation.
        let mut complete = json!({
            "files": [{"id": file_id, "title": filename}],
            "channel_id": channel,
        });
        if let Some(ts) = thread_ts {
            complete["thread_ts"] = json!(ts);
        }
        if let Some(comment) = initial_comment {
            complete["initial_comment"] = json!(comment);
        }
        with_retry("files.completeUploadExternal", || {
            self.api_call("files.completeUploadExternal", complete.clone())
        })
        .await?;

        debug!(file_id, filename, "file upload completed");
        Ok(file_id)
    }

    async fn file_share_ts(
        &self,
        file_id: &str,
        channel: &str,
    ) -> Result<Option<String>, ChatError> {
        let resp = with_retry("files.info", || {
            self.api_call("files.info", json!({"file": file_id}))
        })
        .await?;
        Ok(extract_share_ts(&resp, channel))
    }

    async fn open_dm(&self, user_id: &str) -> Result<String, ChatError> {
        let resp = with_retry("conversations.open", || {
            self.api_call("conversations.open", json!({"users": user_id}))
        })
        .await?;
        resp.get("channel")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChatError::Transport("conversations.open returned no id".to_string()))
    }

    async fn create_channel(&self, name: &str) -> Result<String, ChatError> {
        // Not retried on name_taken — the caller walks the name sequence.
        let resp = with_retry("conversations.create", || {
            self.api_call("conversations.create", json!({"name": name}))
        })
        .await?;
        resp.get("channel")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ChatError::Transport("conversations.create returned no id".to_string())
            })
    }

    async fn channel_name(&self, channel_id: &str) -> Result<Option<String>, ChatError> {
        let resp = with_retry("conversations.info", || {
            self.api_call("conversations.info", json!({"channel": channel_id}))
        })
        .await?;
        Ok(resp
            .get("channel")
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

/// Pull the channel's share timestamp out of a `files.info` response.
///
/// Shares appear under `file.shares.public` or `file.shares.private`, keyed
/// by channel id, each holding a list of `{ts}` entries.
fn extract_share_ts(resp: &Value, channel: &str) -> Option<String> {
    let shares = resp.get("file")?.get("shares")?;
    for visibility in ["public", "private"] {
        if let Some(entries) = shares.get(visibility).and_then(|v| v.get(channel)) {
            if let Some(ts) = entries
                .as_array()
                .and_then(|a| a.first())
                .and_then(|e| e.get("ts"))
                .and_then(Value::as_str)
            {
                return Some(ts.to_string());
            }
        }
    }
    None
}

// ── Unit tests ────────────────────────────────────────────────────────────────
