//! Plain-text rendering of transcript entries and session events

use weft_api::TaskStatus;
use weft_engine::{ProcessKind, SessionEvent, TranscriptEntry};

use crate::utils::{stop_reason_str, truncate_chars};

/// Longest task result shown inline; the final answer is never truncated
const TASK_PREVIEW_CHARS: usize = 400;

/// Render one transcript entry
pub fn render_entry(entry: &TranscriptEntry) -> String {
    match entry {
        TranscriptEntry::User { content, .. } => format!("> {}", content),
        TranscriptEntry::SystemProcess {
            kind: ProcessKind::TaskSplit,
            content,
            ..
        } => format!("[plan] {}", content.replace('\n', "\n       ")),
        TranscriptEntry::SystemProcess {
            kind: ProcessKind::AgentProcessing,
            content,
            ..
        } => format!("[working] {}", content),
        TranscriptEntry::SystemProcess {
            kind: ProcessKind::AgentResult,
            role,
            status,
            content,
            ..
        } => {
            let label = match status {
                Some(TaskStatus::Failed) => "failed",
                _ => "done",
            };
            let who = role.as_deref().unwrap_or("agent");
            format!(
                "[{}] {}: {}",
                label,
                who,
                truncate_chars(content, TASK_PREVIEW_CHARS)
            )
        }
        TranscriptEntry::AssistantFinal { content, .. } => format!("\n{}\n", content),
    }
}

/// Render an engine event, or `None` if it is not shown
pub fn render_event(event: &SessionEvent, verbose: bool) -> Option<String> {
    match event {
        SessionEvent::EntryAppended { entry } | SessionEvent::EntryUpdated { entry } => {
            Some(render_entry(entry))
        }
        SessionEvent::FetchFailed { message, .. } if verbose => {
            Some(format!("[poll failed: {}]", message))
        }
        SessionEvent::Polled { status, poll, .. } if verbose => {
            Some(format!("[poll {}: {}]", poll, status.as_str()))
        }
        SessionEvent::SessionStopped {
            conversation_id,
            reason,
        } if verbose => Some(format!(
            "[{} {}]",
            truncate_chars(conversation_id, 12),
            stop_reason_str(*reason)
        )),
        _ => None,
    }
}
