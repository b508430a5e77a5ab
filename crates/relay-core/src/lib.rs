// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The concurrent runtime at the heart of the relay bridge: per-conversation
//! streaming state machines, the ordered activity-thread emitter, approval
//! round-trips, reaction bookkeeping, and the conversation-key / fork-name
//! algebra.
//!
//! The chat platform is reached only through the `relay-chat` capability
//! trait and the subprocess only through the `relay-rpc` client, so the
//! whole module tree is exercisable against in-memory doubles.

pub mod abort;
pub mod activity;
pub mod approval;
pub mod format;
pub mod key;
pub mod panel;
pub mod reactions;
pub mod streaming;

pub use abort::AbortRegistry;
pub use activity::{
    post_long_content, ActivityBatch, ActivityEntry, ActivityThreadManager, EntryKind,
    ToolInputValue, DEFAULT_MIN_GAP,
};
pub use approval::{
    approval_message, parse_approval_action, ApprovalHandler, ApprovalTimers,
    APPROVE_ACTION_PREFIX, DECLINE_ACTION_PREFIX,
};
pub use key::{normalize_channel_name, rollback_turns, suggest_fork_name, ConversationKey};
pub use panel::{parse_abort_action, render_panel, PanelView, ABORT_ACTION_PREFIX};
pub use reactions::{EmojiReactionManager, ReactionNames};
pub use streaming::{StreamStatus, StreamingContext, StreamingManager};
