// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Conversation keys, channel-name normalisation, and the fork-name
//! suggestion algebra.  Pure functions and a small value type — no IO.

use std::collections::HashSet;
use std::fmt;

/// Identifies a logical chat conversation: a channel, or a thread within it.
///
/// The string form is `channelId[":"+threadTs]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub channel: String,
    pub thread_ts: Option<String>,
}

impl ConversationKey {
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread_ts: None,
        }
    }

    pub fn thread(channel: impl Into<String>, thread_ts: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread_ts: Some(thread_ts.into()),
        }
    }

    pub fn new(channel: impl Into<String>, thread_ts: Option<String>) -> Self {
        Self {
            channel: channel.into(),
            thread_ts,
        }
    }

    /// Parse the `channel[:threadTs]` string form.
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((channel, ts)) if !ts.is_empty() => Self::thread(channel, ts),
            _ => Self::channel(s),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread_ts {
            Some(ts) => write!(f, "{}:{}", self.channel, ts),
            None => write!(f, "{}", self.channel),
        }
    }
}

/// How many turns to drop so a forked thread ends at `turn_index`.
///
/// Returns `None` when the index is out of range.  A result of zero means
/// the rollback RPC must be skipped entirely.
pub fn rollback_turns(total_turns: usize, turn_index: usize) -> Option<usize> {
    if turn_index >= total_turns {
        return None;
    }
    Some(total_turns - (turn_index + 1))
}

/// Normalise a display name into a valid channel name: lowercase, non
/// `[a-z0-9-]` become `-`, runs collapse, leading/trailing `-` trimmed.
pub fn normalize_channel_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_dash = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            prev_dash = false;
        } else if !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Suggest a name for a channel forked from `source_name`.
///
/// `<name>-fork` when free, otherwise the first free `-<k>` suffix
/// (k = 1, 2, …) — gaps in the sequence are filled.
pub fn suggest_fork_name(source_name: &str, taken: &HashSet<String>) -> String {
    let base = format!("{}-fork", normalize_channel_name(source_name));
    if !taken.contains(&base) {
        return base;
    }
    for k in 1.. {
        let candidate = format!("{base}-{k}");
        if !taken.contains(&candidate) {
            return candidate;
        }
    }
    unreachable!("the natural numbers do not run out")
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── ConversationKey ───────────────────────────────────────────────────────

    #[test]
    fn key_round_trips_through_string_form() {
        let channel = ConversationKey::channel("C123");
        assert_eq!(channel.to_string(), "C123");
        assert_eq!(ConversationKey::parse("C123"), channel);

        let thread = ConversationKey::thread("C123", "1700.0001");
        assert_eq!(thread.to_string(), "C123:1700.0001");
        assert_eq!(ConversationKey::parse("C123:1700.0001"), thread);
    }

    #[test]
    fn channel_and_thread_keys_are_distinct() {
        assert_ne!(
            ConversationKey::channel("C1"),
            ConversationKey::thread("C1", "1.1")
        );
    }

    // ── Rollback arithmetic ───────────────────────────────────────────────────

    #[test]
    fn rollback_at_last_turn_is_zero() {
        assert_eq!(rollback_turns(3, 2), Some(0));
    }

    #[test]
    fn rollback_at_first_of_three_is_two() {
        assert_eq!(rollback_turns(3, 0), Some(2));
    }

    #[test]
    fn rollback_out_of_range_is_none() {
        assert_eq!(rollback_turns(3, 3), None);
        assert_eq!(rollback_turns(0, 0), None);
    }

    // ── Channel name normalisation ────────────────────────────────────────────

    #[test]
    fn normalize_lowercases_and_replaces() {
        assert_eq!(normalize_channel_name("My Project!"), "my-project");
    }

    #[test]
    fn normalize_collapses_runs_and_trims() {
        assert_eq!(normalize_channel_name("--a///b--"), "a-b");
        assert_eq!(normalize_channel_name("  spaced  out  "), "spaced-out");
    }

    #[test]
    fn normalize_keeps_digits_and_dashes() {
        assert_eq!(normalize_channel_name("team-42"), "team-42");
    }

    // ── Fork name suggestion ──────────────────────────────────────────────────

    #[test]
    fn fork_name_base_when_free() {
        let taken = HashSet::new();
        assert_eq!(suggest_fork_name("proj", &taken), "proj-fork");
    }

    #[test]
    fn fork_name_increments_when_taken() {
        let taken: HashSet<String> = ["proj-fork".to_string()].into();
        assert_eq!(suggest_fork_name("proj", &taken), "proj-fork-1");
    }

    #[test]
    fn fork_name_fills_gaps() {
        let taken: HashSet<String> = [
            "proj-fork".to_string(),
            "proj-fork-2".to_string(),
            "proj-fork-3".to_string(),
        ]
        .into();
        assert_eq!(suggest_fork_name("proj", &taken), "proj-fork-1");
    }

    #[test]
    fn fork_name_normalises_the_source() {
        let taken = HashSet::new();
        assert_eq!(suggest_fork_name("My Proj", &taken), "my-proj-fork");
    }
}
