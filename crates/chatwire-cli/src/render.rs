//! Plain-text rendering of slot updates, connection events and chat lists.
//!
//! Answer snapshots replace each other rather than append, so the transcript keeps
//! track of how much of each run's thinking text was already printed and only writes
//! the new tail.

use std::collections::HashMap;
use std::fmt::Write as _;

use chatwire_core::RunId;
use chatwire_transport::{AnswerSlot, ChatGroups, ConnectionEvent, SlotUpdate};

/// Per-run print state.
#[derive(Debug, Default)]
pub struct Transcript {
    printed: HashMap<RunId, usize>,
}

impl Transcript {
    /// Create an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to print for `update`, if any.
    pub fn render(&mut self, update: &SlotUpdate) -> Option<String> {
        match update {
            SlotUpdate::Created(slot) => {
                self.printed.insert(slot.run_id.clone(), 0);
                Some(format!("[{}] asking: {}", short(&slot.run_id), slot.query))
            }
            SlotUpdate::Updated(slot) => self.thinking_tail(slot),
            SlotUpdate::Completed(slot) => {
                let mut out = self.thinking_tail(slot).unwrap_or_default();
                self.printed.remove(&slot.run_id);
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&render_answer(slot));
                Some(out)
            }
            SlotUpdate::SendFailed { run_id, error } => {
                Some(format!("[{}] send failed: {error}", short(run_id)))
            }
            SlotUpdate::Replaced { chat_id } => Some(format!("history loaded for chat {chat_id}")),
        }
    }

    fn thinking_tail(&mut self, slot: &AnswerSlot) -> Option<String> {
        let printed = self.printed.entry(slot.run_id.clone()).or_default();
        let message = slot.message.as_str();

        let tail = if *printed <= message.len() && message.is_char_boundary(*printed) {
            &message[*printed..]
        } else {
            // The snapshot no longer extends what was shown; start over.
            message
        };
        *printed = message.len();

        if tail.is_empty() {
            None
        } else {
            Some(format!("[{}] … {tail}", short(&slot.run_id)))
        }
    }
}

/// Final answer block of a completed slot.
pub fn render_answer(slot: &AnswerSlot) -> String {
    let mut out = String::new();
    let status = if slot.is_paused { "stopped" } else { "done" };
    let _ = write!(out, "[{}] {status}", short(&slot.run_id));
    if slot.message_time_long > 0 {
        let _ = write!(out, " in {} ms", slot.message_time_long);
    }

    if !slot.response.is_empty() {
        let _ = write!(out, "\n{}", slot.response);
    }
    for step in &slot.steps {
        let mark = if step.finished { "x" } else { " " };
        let _ = write!(out, "\n  [{mark}] {}: {}", step.node, step.message);
    }
    for series in &slot.stock_data {
        let _ = write!(
            out,
            "\n  chart {} ({}, {} points)",
            series.metadata.symbol.join(", "),
            series.metadata.time_granularity_label,
            series.data.len()
        );
    }
    for reference in &slot.references {
        let _ = write!(out, "\n  source: {} <{}>", reference.name, reference.url);
    }
    if !slot.labels.is_empty() {
        let _ = write!(out, "\n  labels: {}", slot.labels.join(", "));
    }
    out
}

/// One line per connection event.
pub fn render_event(event: &ConnectionEvent) -> String {
    match event {
        ConnectionEvent::Opened => "connected".to_string(),
        ConnectionEvent::Closed => "disconnected".to_string(),
        ConnectionEvent::Error(e) => format!("connection error: {e}"),
        ConnectionEvent::HeartbeatTimeout => "server stopped answering heartbeats".to_string(),
        ConnectionEvent::Reconnecting => "reconnecting...".to_string(),
    }
}

/// Chat list, bucketed by recency.
pub fn render_groups(groups: &ChatGroups) -> String {
    if groups.is_empty() {
        return "no chats".to_string();
    }

    let mut out = String::new();
    for (title, chats) in [
        ("Today", &groups.today),
        ("This week", &groups.this_week),
        ("This month", &groups.this_month),
        ("Earlier", &groups.furthermore),
    ] {
        if chats.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(title);
        for chat in chats {
            let _ = write!(out, "\n  {}  {}", chat.chat_id, chat.title);
        }
    }
    out
}

fn short(run_id: &RunId) -> &str {
    let id = run_id.as_str();
    id.get(..8).unwrap_or(id)
}
