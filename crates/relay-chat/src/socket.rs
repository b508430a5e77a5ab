// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Slack Socket Mode intake.
//!
//! Socket Mode uses an outbound WebSocket from the bridge to Slack's
//! servers. No inbound port is required — only the `app_token` (`xapp-…`)
//! needs to be configured.  Every envelope is acknowledged immediately and
//! the decoded event is forwarded to the bridge loop over an mpsc channel.
//! The connection reconnects automatically on disconnect.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A decoded inbound Slack event relevant to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum SlackInbound {
    /// A user message (channel or thread).
    Message {
        channel: String,
        thread_ts: Option<String>,
        user: String,
        ts: String,
        text: String,
    },
    /// A button click (abort, approval accept/decline, fork).
    BlockAction {
        action_id: String,
        value: Option<String>,
        channel: String,
        message_ts: String,
        thread_ts: Option<String>,
        user: String,
    },
    /// The channel was deleted; its session mapping should be dropped.
    ChannelDeleted { channel: String },
}

/// Run the Socket Mode connection until the receiver side is dropped.
///
/// Reconnects forever: clean close → 5 s pause, error → 10 s pause.
pub async fn run_socket_mode(app_token: String, tx: mpsc::Sender<SlackInbound>) {
    info!("Slack Socket Mode: connecting");
    loop {
        match connect_once(&app_token, &tx).await {
            Ok(()) => {
                if tx.is_closed() {
                    return;
                }
                info!("Slack Socket Mode: connection closed, reconnecting in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
            Err(e) => {
                if tx.is_closed() {
                    return;
                }
                error!("Slack Socket Mode error: {e}, reconnecting in 10s");
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            }
        }
    }
}

async fn connect_once(
    app_token: &str,
    tx: &mpsc::Sender<SlackInbound>,
) -> anyhow::Result<()> {
    let wss_url = fetch_socket_mode_url(app_token).await?;
    debug!(url = %wss_url, "Slack Socket Mode: got WebSocket URL");

    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;

    let (ws_stream, _) = connect_async(&wss_url)
        .await
        .map_err(|e| anyhow::anyhow!("WebSocket connect: {e}"))?;
    let (mut sink, mut stream) = ws_stream.split();

    while let Some(msg) = stream.next().await {
        match msg? {
            tokio_tungstenite::tungstenite::Message::Text(text) => {
                let Ok(envelope) = serde_json::from_str::<Value>(&text) else {
                    warn!("Slack Socket Mode: unparseable frame");
                    continue;
                };

                // Acknowledge first — Slack retries unacked envelopes.
                if let Some(envelope_id) = envelope.get("envelope_id").and_then(Value::as_str) {
                    let ack = json!({"envelope_id": envelope_id});
                    let _ = sink
                        .send(tokio_tungstenite::tungstenite::Message::Text(
                            ack.to_string(),
                        ))
                        .await;
                }

                match envelope.get("type").and_then(Value::as_str) {
                    Some("disconnect") => {
                        info!("Slack Socket Mode: server requested reconnect");
                        break;
                    }
                    Some("hello") => {
                        debug!("Slack Socket Mode: hello");
                    }
                    _ => {
                        if let Some(inbound) = parse_envelope(&envelope) {
                            if tx.send(inbound).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
            tokio_tungstenite::tungstenite::Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}

async fn fetch_socket_mode_url(app_token: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::new();
    let resp = client
        .post("https://slack.com/api/apps.connections.open")
        .bearer_auth(app_token)
        .send()
        .await?
        .json::<Value>()
        .await?;

    resp.get("url")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("apps.connections.open returned no url: {resp}"))
}

/// Decode a Socket Mode envelope into a bridge event, or `None` for event
/// types the bridge does not consume.
pub fn parse_envelope(envelope: &Value) -> Option<SlackInbound> {
    match envelope.get("type").and_then(Value::as_str)? {
        "events_api" => parse_event(envelope.get("payload")?.get("event")?),
        "interactive" => parse_interactive(envelope.get("payload")?),
        _ => None,
    }
}

fn parse_event(event: &Value) -> Option<SlackInbound> {
    match event.get("type").and_then(Value::as_str)? {
        "message" | "app_mention" => {
            // Ignore our own and other bots' messages, and message edits.
            if event.get("bot_id").is_some() {
                return None;
            }
            if let Some(subtype) = event.get("subtype").and_then(Value::as_str) {
                if subtype != "file_share" {
                    return None;
                }
            }
            Some(SlackInbound::Message {
                channel: event.get("channel")?.as_str()?.to_string(),
                thread_ts: event
                    .get("thread_ts")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                user: event
                    .get("user")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                ts: event.get("ts")?.as_str()?.to_string(),
                text: event
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        }
        "channel_deleted" => Some(SlackInbound::ChannelDeleted {
            channel: event.get("channel")?.as_str()?.to_string(),
        }),
        other => {
            debug!(event_type = other, "unhandled Slack event type");
            None
        }
    }
}

fn parse_interactive(payload: &Value) -> Option<SlackInbound> {
    if payload.get("type").and_then(Value::as_str)? != "block_actions" {
        return None;
    }
    let action = payload.get("actions")?.as_array()?.first()?;
    Some(SlackInbound::BlockAction {
        action_id: action.get("action_id")?.as_str()?.to_string(),
        value: action
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string),
        channel: payload
            .get("channel")?
            .get("id")?
            .as_str()?
            .to_string(),
        message_ts: payload
            .get("container")
            .and_then(|c| c.get("message_ts"))
            .or_else(|| payload.get("message").and_then(|m| m.get("ts")))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        thread_ts: payload
            .get("message")
            .and_then(|m| m.get("thread_ts"))
            .and_then(Value::as_str)
            .map(str::to_string),
        user: payload
            .get("user")
            .and_then(|u| u.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_event_is_decoded() {
        let envelope = json!({"type": "events_api", "envelope_id": "e1", "payload": {"event": {
            "type": "message", "channel": "C1", "user": "U1", "ts": "1.1", "text": "hello"
        }}});
        let inbound = parse_envelope(&envelope).unwrap();
        assert_eq!(
            inbound,
            SlackInbound::Message {
                channel: "C1".to_string(),
                thread_ts: None,
                user: "U1".to_string(),
                ts: "1.1".to_string(),
                text: "hello".to_string(),
            }
        );
    }

    #[test]
    fn threaded_message_keeps_thread_ts() {
        let envelope = json!({"type": "events_api", "payload": {"event": {
            "type": "message", "channel": "C1", "user": "U1", "ts": "1.2",
            "thread_ts": "1.1", "text": "reply"
        }}});
        match parse_envelope(&envelope).unwrap() {
            SlackInbound::Message { thread_ts, .. } => {
                assert_eq!(thread_ts.as_deref(), Some("1.1"));
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn bot_messages_are_ignored() {
        let envelope = json!({"type": "events_api", "payload": {"event": {
            "type": "message", "channel": "C1", "bot_id": "B1", "ts": "1.1", "text": "from bot"
        }}});
        assert_eq!(parse_envelope(&envelope), None);
    }

    #[test]
    fn message_edits_are_ignored_but_file_shares_kept() {
        let edited = json!({"type": "events_api", "payload": {"event": {
            "type": "message", "subtype": "message_changed", "channel": "C1", "ts": "1.1"
        }}});
        assert_eq!(parse_envelope(&edited), None);

        let file_share = json!({"type": "events_api", "payload": {"event": {
            "type": "message", "subtype": "file_share", "channel": "C1",
            "user": "U1", "ts": "1.1", "text": "see attachment"
        }}});
        assert!(parse_envelope(&file_share).is_some());
    }

    #[test]
    fn channel_deleted_is_decoded() {
        let envelope = json!({"type": "events_api", "payload": {"event": {
            "type": "channel_deleted", "channel": "C9"
        }}});
        assert_eq!(
            parse_envelope(&envelope),
            Some(SlackInbound::ChannelDeleted {
                channel: "C9".to_string()
            })
        );
    }

    #[test]
    fn block_action_is_decoded() {
        let envelope = json!({"type": "interactive", "payload": {
            "type": "block_actions",
            "user": {"id": "U1"},
            "channel": {"id": "C1"},
            "container": {"message_ts": "2.2"},
            "message": {"ts": "2.2", "thread_ts": "1.1"},
            "actions": [{"action_id": "abort:C1:1.1", "value": "v"}]
        }});
        match parse_envelope(&envelope).unwrap() {
            SlackInbound::BlockAction {
                action_id,
                value,
                channel,
                message_ts,
                thread_ts,
                user,
            } => {
                assert_eq!(action_id, "abort:C1:1.1");
                assert_eq!(value.as_deref(), Some("v"));
                assert_eq!(channel, "C1");
                assert_eq!(message_ts, "2.2");
                assert_eq!(thread_ts.as_deref(), Some("1.1"));
                assert_eq!(user, "U1");
            }
            other => panic!("expected BlockAction, got {other:?}"),
        }
    }

    #[test]
    fn unknown_envelope_types_are_skipped() {
        assert_eq!(parse_envelope(&json!({"type": "hello"})), None);
        assert_eq!(parse_envelope(&json!({"nonsense": true})), None);
    }
}
