//! Ledger and session event types

use serde::{Deserialize, Serialize};
use weft_api::ConversationStatus;

use crate::ledger::TaskGroup;
use crate::transcript::TranscriptEntry;

/// Identity of the task an event is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: String,
    pub role: Option<String>,
    pub description: Option<String>,
    /// Reported index, or the position in the snapshot's task list
    pub index: usize,
}

/// A task lifecycle transition detected by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskStateChange {
    /// The query was split into tasks (emitted once per conversation)
    TaskSplit { summary: String, task_count: usize },

    /// A task was first seen processing
    TaskEnteredProcessing {
        #[serde(flatten)]
        task: TaskRef,
    },

    /// A task completed with displayable output
    TaskCompleted {
        #[serde(flatten)]
        task: TaskRef,
        text: String,
    },

    /// A task failed
    TaskFailed {
        #[serde(flatten)]
        task: TaskRef,
        reason: String,
    },

    /// Task grouping changed
    TaskGroupComputed { groups: Vec<TaskGroup> },
}

impl TaskStateChange {
    /// The task id, for per-task events
    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskStateChange::TaskEnteredProcessing { task }
            | TaskStateChange::TaskCompleted { task, .. }
            | TaskStateChange::TaskFailed { task, .. } => Some(&task.task_id),
            _ => None,
        }
    }
}

/// Why a session stopped polling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Grace polls after the terminal status were used up
    GraceExhausted,
    /// A final answer was accepted and the policy stops on the first one
    FinalAccepted,
    /// The configured poll cap was reached
    MaxPolls,
    /// Stopped by the caller
    Cancelled,
    /// A newer query replaced this session
    Superseded,
}

/// Events emitted by the engine while sessions run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Polling started for a conversation
    SessionStarted { conversation_id: String },

    /// A status snapshot was received
    Polled {
        conversation_id: String,
        status: ConversationStatus,
        poll: u32,
    },

    /// A status fetch failed; polling continues
    FetchFailed {
        conversation_id: String,
        message: String,
        retryable: bool,
    },

    /// The ledger detected a task transition
    TaskChanged {
        conversation_id: String,
        change: TaskStateChange,
    },

    /// A transcript entry was appended
    EntryAppended { entry: TranscriptEntry },

    /// A transcript entry was upgraded in place
    EntryUpdated { entry: TranscriptEntry },

    /// The final answer was accepted
    FinalAnswer {
        conversation_id: String,
        content: String,
    },

    /// Polling stopped for a conversation
    SessionStopped {
        conversation_id: String,
        reason: StopReason,
    },
}

impl SessionEvent {
    /// The conversation the event belongs to
    pub fn conversation_id(&self) -> &str {
        match self {
            SessionEvent::SessionStarted { conversation_id }
            | SessionEvent::Polled {
                conversation_id, ..
            }
            | SessionEvent::FetchFailed {
                conversation_id, ..
            }
            | SessionEvent::TaskChanged {
                conversation_id, ..
            }
            | SessionEvent::FinalAnswer {
                conversation_id, ..
            }
            | SessionEvent::SessionStopped {
                conversation_id, ..
            } => conversation_id,
            SessionEvent::EntryAppended { entry } | SessionEvent::EntryUpdated { entry } => {
                entry.conversation_id()
            }
        }
    }

    /// Check if this is the last event of a session
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::SessionStopped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_change_serialization() {
        let change = TaskStateChange::TaskCompleted {
            task: TaskRef {
                task_id: "t1".into(),
                role: Some("analyst".into()),
                description: None,
                index: 0,
            },
            text: "done".into(),
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["type"], "task_completed");
        assert_eq!(value["task_id"], "t1");
        assert_eq!(value["text"], "done");
        assert_eq!(change.task_id(), Some("t1"));
    }

    #[test]
    fn test_session_event_terminal() {
        let stopped = SessionEvent::SessionStopped {
            conversation_id: "c".into(),
            reason: StopReason::GraceExhausted,
        };
        assert!(stopped.is_terminal());
        assert_eq!(stopped.conversation_id(), "c");
        assert!(!SessionEvent::SessionStarted {
            conversation_id: "c".into()
        }
        .is_terminal());
    }
}
