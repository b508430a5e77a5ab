// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-conversation abort flags.
//!
//! The flag outlives the interrupt RPC: `turn:completed` consults it to
//! decide between `completed` and `interrupted`, and it MUST be cleared at
//! the end of every turn so the next turn does not inherit it.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::key::ConversationKey;

/// Tiny map `ConversationKey → bool`, true while an abort is in flight.
#[derive(Default)]
pub struct AbortRegistry {
    aborted: Mutex<HashSet<ConversationKey>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_aborted(&self, key: &ConversationKey) {
        self.aborted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.clone());
    }

    pub fn is_aborted(&self, key: &ConversationKey) -> bool {
        self.aborted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(key)
    }

    pub fn clear(&self, key: &ConversationKey) {
        self.aborted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
