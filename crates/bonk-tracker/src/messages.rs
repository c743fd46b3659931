//! Conclusion to terminal-state and notification text mapping.

use crate::state::RunState;

/// Conclusion recorded when the tracker's own wall-clock ceiling is hit.
pub const TRACKER_TIMEOUT_CONCLUSION: &str = "timeout";

fn normalize(conclusion: Option<&str>) -> Option<String> {
    conclusion
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
}

pub fn terminal_state_for_conclusion(conclusion: Option<&str>) -> RunState {
    match normalize(conclusion).as_deref() {
        Some("success") => RunState::Succeeded,
        Some("failure") => RunState::Failed,
        Some("cancelled" | "canceled") => RunState::Cancelled,
        Some("timeout" | "timed_out") => RunState::TimedOut,
        _ => RunState::Unknown,
    }
}

/// Message posted for a non-success terminal conclusion.
pub fn notification_message(conclusion: Option<&str>) -> String {
    match normalize(conclusion).as_deref() {
        Some("timeout" | "timed_out") => "workflow timed out".to_string(),
        Some("failure") => "workflow failed, check logs".to_string(),
        Some("cancelled" | "canceled") => "workflow was cancelled".to_string(),
        _ => format!(
            "workflow finished with status: {}",
            conclusion
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or("unknown")
        ),
    }
}
