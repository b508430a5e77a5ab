// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Pure formatting helpers for activity entries and the activity panel.
//!
//! These are stateless functions at the seam between the streaming state
//! and the chat surface, so both the panel renderer and the child-message
//! emitter share one formatting vocabulary.

use crate::activity::{ActivityEntry, EntryKind, ToolInputValue};

/// Characters of tool output shown in the one-line preview suffix.
const PREVIEW_CHARS: usize = 50;

/// Emoji for a tool name; unknown tools get the generic gear.
pub fn tool_emoji(tool: &str) -> &'static str {
    let norm: String = tool
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .collect::<String>()
        .to_ascii_lowercase();
    match norm.as_str() {
        "read" | "readfile" => ":open_book:",
        "write" | "writefile" | "edit" | "filechange" | "patchapply" => ":memo:",
        "grep" | "search" => ":mag:",
        "glob" | "find" => ":mag_right:",
        "bash" | "shell" | "exec" | "commandexecution" | "localshellcall" => ":computer:",
        "websearch" | "websearchcall" | "webfetch" => ":globe_with_meridians:",
        "mcptoolcall" | "toolcall" | "tooluse" => ":wrench:",
        _ => ":gear:",
    }
}

/// Items that never become activity entries: the user's own message, the
/// assistant response (it has its own surface), and raw reasoning items.
/// Unknown types are kept — dropping them silently would hide new tools.
pub fn is_excluded_item_type(item_type: &str) -> bool {
    let norm: String = item_type
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .collect::<String>()
        .to_ascii_lowercase();
    matches!(
        norm.as_str(),
        "usermessage" | "agentmessage" | "assistantmessage" | "reasoning"
    )
}

/// Escape chat-markdown special characters inside previews.
pub fn escape_preview(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '`' | '*' | '_' | '~' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// Close an unterminated triple-backtick fence.
pub fn close_fences(text: &str) -> String {
    if text.matches("```").count() % 2 == 1 {
        let mut closed = text.to_string();
        closed.push_str("\n```");
        closed
    } else {
        text.to_string()
    }
}

/// Truncate to `limit` characters (never mid-code-fence) with an ellipsis,
/// keeping the markdown well formed.
pub fn truncate_closed(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit.saturating_sub(1)).collect();
    close_fences(&format!("{cut}…"))
}

/// Human duration: "320ms", "1.5s", "2m 10s".
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

fn tool_input_fragment(input: &Option<ToolInputValue>) -> String {
    match input {
        Some(v) => {
            let display = v.display();
            if display.is_empty() {
                String::new()
            } else {
                let short: String = display.chars().take(80).collect();
                format!(" `{}`", escape_preview(&short))
            }
        }
        None => String::new(),
    }
}

fn metrics_fragment(entry: &ActivityEntry) -> String {
    let mut parts = Vec::new();
    if let Some(n) = entry.metrics.match_count {
        parts.push(format!("{n} matches"));
    }
    if let Some(n) = entry.metrics.line_count {
        parts.push(format!("{n} lines"));
    }
    match (entry.metrics.lines_added, entry.metrics.lines_removed) {
        (Some(a), Some(r)) => parts.push(format!("+{a} −{r}")),
        (Some(a), None) => parts.push(format!("+{a}")),
        (None, Some(r)) => parts.push(format!("−{r}")),
        (None, None) => {}
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(", {}", parts.join(", "))
    }
}

/// Render one activity entry as chat text.
pub fn format_entry(entry: &ActivityEntry) -> String {
    match entry.kind {
        EntryKind::Starting => "_Starting…_".to_string(),
        EntryKind::Generating => "_Generating response…_".to_string(),
        EntryKind::Aborted => ":octagonal_sign: Aborted".to_string(),
        EntryKind::Error => format!(
            ":warning: {}",
            entry.message.as_deref().unwrap_or("Something went wrong")
        ),
        EntryKind::Thinking => {
            let chars = entry.char_count.unwrap_or(0);
            if entry.thinking_in_progress {
                format!(":brain: *Thinking…* ({chars} chars)")
            } else {
                match entry.duration_ms {
                    Some(ms) => format!(
                        ":brain: *Thought for {}* ({chars} chars)",
                        format_duration_ms(ms)
                    ),
                    None => format!(":brain: *Thought* ({chars} chars)"),
                }
            }
        }
        EntryKind::ToolStart => {
            let tool = entry.tool.as_deref().unwrap_or("tool");
            format!(
                "{} *{}*{} [in progress]",
                tool_emoji(tool),
                tool,
                tool_input_fragment(&entry.tool_input),
            )
        }
        EntryKind::ToolComplete => {
            let tool = entry.tool.as_deref().unwrap_or("tool");
            if entry.tool_is_error {
                let detail = entry
                    .tool_error_message
                    .as_deref()
                    .map(|m| format!(": {}", escape_preview(m)))
                    .unwrap_or_default();
                return format!(":warning: *{tool}* failed{detail}");
            }
            let mut line = format!(
                "{} *{}*{}",
                tool_emoji(tool),
                tool,
                tool_input_fragment(&entry.tool_input),
            );
            if let Some(ms) = entry.duration_ms {
                line.push_str(&format!(" — {}", format_duration_ms(ms)));
            }
            line.push_str(&metrics_fragment(entry));
            if let Some(preview) = &entry.tool_output_preview {
                let short: String = preview.chars().take(PREVIEW_CHARS).collect();
                let ellipsis = if preview.chars().count() > PREVIEW_CHARS {
                    "…"
                } else {
                    ""
                };
                line.push_str(&format!("\n→ `{}{}`", escape_preview(&short), ellipsis));
            }
            line
        }
    }
}

/// Render the rolling activity window for the panel.
///
/// Shows the most recent `max_entries` entries; when the rendered text would
/// exceed `max_chars`, whole entries are dropped from the front and a
/// "… K earlier entries …" marker is prepended.
pub fn render_window(entries: &[ActivityEntry], max_entries: usize, max_chars: usize) -> String {
    let window_start = entries.len().saturating_sub(max_entries);
    let mut lines: Vec<String> = entries[window_start..].iter().map(format_entry).collect();
    let mut dropped = window_start;

    let total_len = |lines: &[String]| -> usize {
        lines.iter().map(|l| l.chars().count() + 1).sum::<usize>()
    };
    while lines.len() > 1 && total_len(&lines) > max_chars {
        lines.remove(0);
        dropped += 1;
    }

    let mut out = String::new();
    if dropped > 0 {
        out.push_str(&format!("_… {dropped} earlier entries …_\n"));
    }
    out.push_str(&lines.join("\n"));
    out
}

// ── Unit tests ────────────────────────────────────────────────────────────────
