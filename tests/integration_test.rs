// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! End-to-end bridge scenarios: a scripted subprocess on the far side of an
//! in-memory duplex transport, the recording mock chat client on the Slack
//! side, and the real client/streaming/session machinery in between.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use relay_chat::mock::{MockCall, MockChatClient};
use relay_chat::{ChatClient, MarkdownRenderer, NoImageRenderer};
use relay_core::{
    AbortRegistry, ActivityThreadManager, ConversationKey, EmojiReactionManager, ReactionNames,
    StreamingContext, StreamingManager,
};
use relay_rpc::{AgentClient, AgentEvent, JsonRpcTransport, TurnStartParams};
use relay_session::SessionStore;

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    mock: Arc<MockChatClient>,
    client: Arc<AgentClient>,
    streaming: Arc<StreamingManager>,
    store: Arc<SessionStore>,
    inject: mpsc::Sender<Value>,
    rpc_log: Arc<Mutex<Vec<(String, Value)>>>,
    _dir: tempfile::TempDir,
}

/// Build the full stack against a scripted subprocess.
///
/// `respond` answers every RPC; notifications are injected through the
/// returned channel as raw JSON-RPC frames.
fn harness(respond: impl Fn(&str, &Value) -> Value + Send + 'static) -> Harness {
    let (ours, theirs) = duplex(256 * 1024);
    let (our_read, our_write) = tokio::io::split(ours);
    let (their_read, their_write) = tokio::io::split(theirs);
    let (transport, notify_rx) =
        JsonRpcTransport::new(our_read, our_write, Duration::from_secs(5));
    let client = AgentClient::new(transport, notify_rx);

    // Scripted peer: one task answers RPCs, one writes injected
    // notifications; both share the write half.
    let writer = Arc::new(tokio::sync::Mutex::new(their_write));
    let (inject_tx, mut inject_rx) = mpsc::channel::<Value>(64);
    let rpc_log: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));

    let log = rpc_log.clone();
    let responder_writer = writer.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(their_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(req) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let method = req["method"].as_str().unwrap_or_default().to_string();
            let params = req.get("params").cloned().unwrap_or(Value::Null);
            log.lock().unwrap().push((method.clone(), params.clone()));
            if let Some(id) = req.get("id") {
                let resp = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": respond(&method, &params),
                });
                let _ = responder_writer
                    .lock()
                    .await
                    .write_all(format!("{resp}\n").as_bytes())
                    .await;
            }
        }
    });

    let injector_writer = writer.clone();
    tokio::spawn(async move {
        while let Some(frame) = inject_rx.recv().await {
            let _ = injector_writer
                .lock()
                .await
                .write_all(format!("{frame}\n").as_bytes())
                .await;
        }
    });

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

    let streaming = StreamingManager::new(
        chat,
        renderer,
        client.clone(),
        activity,
        reactions,
        aborts,
        store.clone(),
    );

    // The bridge's dispatch loop: subprocess events → streaming manager.
    let mut events = client.subscribe();
    let pump_streaming = streaming.clone();
    tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            match ev {
                AgentEvent::ApprovalRequested(_) => {}
                other => pump_streaming.handle_event(other).await,
            }
        }
    });

    Harness {
        mock,
        client,
        streaming,
        store,
        inject: inject_tx,
        rpc_log,
        _dir: dir,
    }
}

fn basic_responder(method: &str, params: &Value) -> Value {
    match method {
        "initialize" => json!({}),
        "thread/start" => json!({"thread": {"id": "thread-A", "workingDirectory": "/work"}}),
        "thread/resume" => json!({"thread": {"id": params["threadId"]}}),
        "thread/read" => json!({
            "thread": {"id": params["threadId"]},
            "turns": [{"id": "turn-1"}, {"id": "turn-2"}, {"id": "turn-3"}],
        }),
        "thread/fork" => json!({"thread": {"id": "thread-FORK"}}),
        "thread/rollback" => json!({"thread": {"id": params["threadId"]}}),
        _ => json!({}),
    }
}

async fn notify(h: &Harness, method: &str, params: Value) {
    h.inject
        .send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
        .await
        .unwrap();
}

/// Wait for a condition on the mock call log.
async fn wait_for(mock: &Arc<MockChatClient>, what: &str, pred: impl Fn(&[MockCall]) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if pred(&mock.calls()) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}\ncalls: {:#?}", mock.calls());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn ctx(channel: &str, thread_id: &str, original_ts: &str) -> StreamingContext {
    StreamingContext {
        key: ConversationKey::channel(channel),
        channel: channel.to_string(),
        thread_ts: None,
        original_ts: original_ts.to_string(),
        user: Some("U1".to_string()),
        thread_id: thread_id.to_string(),
        turn_id: None,
        model: Some("gpt-5-codex".to_string()),
        reasoning: Some("medium".to_string()),
        update_rate: Duration::from_millis(100),
        char_limit: 500,
        window_entries: 20,
        window_chars: 1000,
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_turn_streams_into_chat_and_persists() {
    let h = harness(basic_responder);
    h.client.initialize().await.unwrap();

    // Resolve a thread and persist the mapping, as the bridge would.
    let info = h.client.thread_start("/work").await.unwrap();
    assert_eq!(info.id, "thread-A");
    h.store
        .record_thread_id("C1", None, &info.id)
        .await
        .unwrap();

    h.streaming.start_streaming(ctx("C1", "thread-A", "100.1")).await;
    h.client
        .turn_start(TurnStartParams {
            thread_id: "thread-A".to_string(),
            text: "add a test for the parser".to_string(),
            model: None,
            reasoning_effort: Some("medium".to_string()),
            approval_policy: Some("on-request".to_string()),
        })
        .await
        .unwrap();

    // The user's message is marked as processing and the panel exists.
    assert_eq!(
        h.mock.reactions_on("C1", "100.1"),
        vec!["hourglass_flowing_sand".to_string()]
    );

    // Subprocess streams a turn: started → thinking → tool → text → tokens
    // → completed.
    notify(&h, "turn/started", json!({"threadId": "thread-A", "turnId": "0"})).await;
    notify(
        &h,
        "item/started",
        json!({"threadId": "thread-A", "item": {"id": "r1", "item_type": "reasoning"}}),
    )
    .await;
    notify(
        &h,
        "item/reasoning/delta",
        json!({"threadId": "thread-A", "itemId": "r1", "delta": "planning the test"}),
    )
    .await;
    notify(
        &h,
        "item/started",
        json!({"threadId": "thread-A", "itemId": "tool1", "itemType": "commandExecution",
               "input": {"command": "cargo metadata"}}),
    )
    .await;
    notify(
        &h,
        "item/completed",
        json!({"threadId": "thread-A", "itemId": "tool1", "itemType": "commandExecution",
               "durationMs": 1200, "output": "ok"}),
    )
    .await;
    notify(
        &h,
        "item/agentMessage/delta",
        json!({"threadId": "thread-A", "itemId": "m1", "delta": "Added the parser test."}),
    )
    .await;
    notify(
        &h,
        "codex/event/token_count",
        json!({"threadId": "thread-A", "msg": {"info": {
            "last_token_usage": {"input_tokens": 900, "output_tokens": 80,
                                 "cached_input_tokens": 500},
            "model_context_window": 200000
        }}}),
    )
    .await;
    notify(
        &h,
        "turn/completed",
        json!({"threadId": "thread-A", "turnId": "0", "status": "completed"}),
    )
    .await;

    // Final response reaches the channel.
    wait_for(&h.mock, "final response", |calls| {
        calls.iter().any(|c| {
            matches!(c, MockCall::Post { text, .. } if text.contains("Added the parser test."))
        })
    })
    .await;
    // Processing reaction settled.
    wait_for(&h.mock, "reaction cleared", |_| {
        h.mock.reactions_on("C1", "100.1").is_empty()
    })
    .await;

    // The tool ran through the activity thread exactly once.
    let tool_posts = h
        .mock
        .posts()
        .iter()
        .filter(|c| matches!(c, MockCall::Post { text, .. } if text.contains("commandExecution")))
        .count();
    assert_eq!(tool_posts, 1, "one message per tool use id");

    // Session store remembers the turn and the usage.
    let session = h.store.get_session("C1").unwrap();
    assert_eq!(session.thread_id.as_deref(), Some("thread-A"));
    assert_eq!(session.turns.len(), 1);
    assert_eq!(session.turns[0].turn_id, "0");
    let usage = session.last_usage.expect("usage persisted");
    assert_eq!(usage.input_tokens, 900);
    assert_eq!(usage.cache_read_input_tokens, 500);
    assert!(usage.cache_read_input_tokens <= usage.input_tokens);
}

#[tokio::test]
async fn duplicate_completion_and_deltas_are_collapsed() {
    let h = harness(basic_responder);
    h.streaming.start_streaming(ctx("C1", "thread-A", "100.1")).await;

    notify(&h, "turn/started", json!({"threadId": "thread-A", "turnId": "0"})).await;
    // The same delta under both vocabularies within the dedup window.
    notify(
        &h,
        "item/agentMessage/delta",
        json!({"threadId": "thread-A", "itemId": "m1", "delta": "Hello."}),
    )
    .await;
    notify(
        &h,
        "codex/event/agent_message_delta",
        json!({"msg": {"thread_id": "thread-A", "call_id": "m1", "delta": "Hello."}}),
    )
    .await;
    // Completion under both vocabularies.
    notify(
        &h,
        "codex/event/task_complete",
        json!({"msg": {"thread_id": "thread-A", "turn_id": "0"}}),
    )
    .await;
    notify(
        &h,
        "turn/completed",
        json!({"threadId": "thread-A", "turnId": "0", "status": "completed"}),
    )
    .await;

    wait_for(&h.mock, "final response", |calls| {
        calls
            .iter()
            .any(|c| matches!(c, MockCall::Post { text, .. } if text.contains("Hello.")))
    })
    .await;

    // The duplicated delta was not doubled into the response.
    let response = h
        .mock
        .posts()
        .iter()
        .find_map(|c| match c {
            MockCall::Post { text, .. } if text.contains("Hello.") => Some(text.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(response.matches("Hello.").count(), 1, "{response}");
}

#[tokio::test]
async fn abort_button_interrupts_and_marks_the_message() {
    let h = harness(basic_responder);
    let key = ConversationKey::channel("C1");
    h.streaming.start_streaming(ctx("C1", "thread-A", "100.1")).await;
    notify(&h, "turn/started", json!({"threadId": "thread-A", "turnId": "0"})).await;

    // Wait until the turn id is registered before clicking abort.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.streaming.find_key_by_turn_id("0").await.is_none() {
        assert!(tokio::time::Instant::now() < deadline, "turn id never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.streaming.abort(&key).await;

    // The interrupt RPC went out with the registered turn id.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let interrupted = h
            .rpc_log
            .lock()
            .unwrap()
            .iter()
            .any(|(m, p)| m == "turn/interrupt" && p["turnId"] == "0");
        if interrupted {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no interrupt RPC");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The subprocess acknowledges by completing the turn; abort wins.
    notify(
        &h,
        "turn/completed",
        json!({"threadId": "thread-A", "turnId": "0", "status": "completed"}),
    )
    .await;
    wait_for(&h.mock, "abort reaction", |_| {
        h.mock.reactions_on("C1", "100.1") == vec!["octagonal_sign".to_string()]
    })
    .await;
}

#[tokio::test]
async fn fork_at_turn_against_live_turn_count() {
    let h = harness(basic_responder);

    // Notifications said "1", the read vocabulary says "turn-2"; the
    // bridge resolves the index live and rolls back one turn.
    let index = h
        .client
        .find_turn_index("thread-A", "1")
        .await
        .unwrap()
        .expect("the turn exists under the fallback vocabulary");
    assert_eq!(index, 1);

    let forked = h.client.fork_at_turn("thread-A", index).await.unwrap();
    assert_eq!(forked.id, "thread-FORK");

    let log = h.rpc_log.lock().unwrap();
    let rollback = log
        .iter()
        .find(|(m, _)| m == "thread/rollback")
        .expect("rollback issued");
    assert_eq!(rollback.1["numTurns"], 1);
    assert_eq!(rollback.1["threadId"], "thread-FORK");
}

#[tokio::test]
async fn fork_channel_names_fill_gaps_on_collision() {
    let h = harness(basic_responder);
    h.mock.mark_channel_name_taken("proj-fork");
    h.mock.mark_channel_name_taken("proj-fork-2");

    // Walk the suggestion sequence the way the fork executor does.
    let mut taken = std::collections::HashSet::new();
    let channel = loop {
        let candidate = relay_core::suggest_fork_name("proj", &taken);
        match h.mock.create_channel(&candidate).await {
            Ok(id) => break id,
            Err(e) if e.code() == Some("name_taken") => {
                taken.insert(candidate);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    };
    assert_eq!(channel, "C-proj-fork-1", "the gap at -1 must be filled");
}
