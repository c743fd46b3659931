//! Bodies for the comments the bot posts and updates.

use crate::transport_helpers::truncate_for_error;

pub const EVENT_KEY_MARKER_PREFIX: &str = "<!-- bonk:event-key:";
pub const EVENT_KEY_MARKER_SUFFIX: &str = " -->";
const ERROR_MAX_CHARS: usize = 600;

fn event_key_marker(event_key: &str) -> String {
    format!("{EVENT_KEY_MARKER_PREFIX}{event_key}{EVENT_KEY_MARKER_SUFFIX}")
}

pub fn render_placeholder_comment(event_key: &str, actor: &str) -> String {
    format!(
        "Working on it, @{actor}. This comment will be updated when I'm done.\n\n{}",
        event_key_marker(event_key)
    )
}

pub fn render_result_comment(event_key: &str, summary: &str, attempts: usize) -> String {
    let mut content = summary.trim().to_string();
    if content.is_empty() {
        content = "The agent finished without producing a summary.".to_string();
    }
    format!(
        "{content}\n\n---\n{}\n_bonk | status `completed` | attempts `{attempts}`_",
        event_key_marker(event_key)
    )
}

pub fn render_failure_comment(event_key: &str, error_message: &str, attempts: usize) -> String {
    format!(
        "I couldn't finish this request.\n\nError: `{}`\n\n---\n{}\n_bonk | status `failed` | attempts `{attempts}`_",
        truncate_for_error(error_message.trim(), ERROR_MAX_CHARS),
        event_key_marker(event_key)
    )
}

/// Appends the opened pull request link to an already rendered result body.
pub fn append_pull_request_link(body: &str, pull_url: &str) -> String {
    format!("{body}\n\nOpened pull request: {pull_url}")
}

/// Body for a terminal workflow-run notification.
pub fn render_run_notification(message: &str, run_url: &str) -> String {
    if run_url.trim().is_empty() {
        return format!("Bonk {message}.");
    }
    format!("Bonk {message}. [View run]({run_url})")
}

/// Pulls the event key back out of a rendered body.
pub fn extract_event_key(body: &str) -> Option<&str> {
    let start = body.find(EVENT_KEY_MARKER_PREFIX)? + EVENT_KEY_MARKER_PREFIX.len();
    let rest = &body[start..];
    let end = rest.find(EVENT_KEY_MARKER_SUFFIX)?;
    let key = rest[..end].trim();
    (!key.is_empty()).then_some(key)
}
