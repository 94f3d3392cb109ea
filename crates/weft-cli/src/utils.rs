//! Shared utilities

use weft_engine::StopReason;

/// Truncate a string to `max` characters, appending "..." if truncated.
/// Operates on Unicode char boundaries, not bytes.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Format a stop reason for display.
pub fn stop_reason_str(reason: StopReason) -> &'static str {
    match reason {
        StopReason::GraceExhausted => "finished",
        StopReason::FinalAccepted => "answered",
        StopReason::MaxPolls => "poll limit reached",
        StopReason::Cancelled => "stopped",
        StopReason::Superseded => "superseded by a newer query",
    }
}
