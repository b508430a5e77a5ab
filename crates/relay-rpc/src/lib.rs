// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! JSON-RPC stdio plumbing for the coding subprocess.
//!
//! [`transport::JsonRpcTransport`] frames newline-delimited JSON-RPC 2.0 on
//! any reader/writer pair and correlates responses; [`client::AgentClient`]
//! layers the typed RPC surface and the normalised [`events::AgentEvent`]
//! stream on top.

pub mod client;
pub mod events;
pub mod transport;
pub mod types;

pub use client::{AgentClient, TurnStartParams, DELTA_DEDUP_TTL};
pub use events::{AgentEvent, ToolMetrics};
pub use transport::{JsonRpcTransport, Notification, DEFAULT_REQUEST_TIMEOUT};
pub use types::{
    ApprovalDecision, ApprovalKind, ApprovalRequest, FileChange, RpcError, ThreadInfo, TokenUsage,
    TurnStatus,
};
