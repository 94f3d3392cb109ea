//! Transcript store and per-conversation builder
//!
//! The [`TranscriptStore`] is the single ordered sequence every session writes
//! into. It is append-only except for one operation: a task's processing
//! entry is upgraded in place once the task completes or fails. A keyed
//! position index makes that upgrade a lookup instead of a scan.
//!
//! A [`TranscriptBuilder`] owns one conversation's slice of the store and
//! enforces its phase machine:
//!
//! ```text
//! New -> AwaitingSplit -> SplitShown -> Finalized
//! ```
//!
//! Once finalized nothing more is written for that conversation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weft_api::{ConversationStatus, TaskStatus};

use crate::events::{TaskRef, TaskStateChange};
use crate::ledger::TaskGroup;

/// Kind of a system process entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    TaskSplit,
    AgentProcessing,
    AgentResult,
}

/// One displayed transcript item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEntry {
    /// The user's query
    User {
        id: Uuid,
        conversation_id: String,
        content: String,
        timestamp: i64,
    },

    /// Progress reported while the backend works
    SystemProcess {
        id: Uuid,
        conversation_id: String,
        kind: ProcessKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<TaskStatus>,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_description: Option<String>,
        timestamp: i64,
    },

    /// The conversation's answer
    AssistantFinal {
        id: Uuid,
        conversation_id: String,
        content: String,
        is_final: bool,
        timestamp: i64,
    },
}

impl TranscriptEntry {
    pub fn user(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        TranscriptEntry::User {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn assistant_final(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        TranscriptEntry::AssistantFinal {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            content: content.into(),
            is_final: true,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn process(
        conversation_id: &str,
        kind: ProcessKind,
        task: Option<&TaskRef>,
        status: Option<TaskStatus>,
        content: String,
    ) -> Self {
        TranscriptEntry::SystemProcess {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            kind,
            task_id: task.map(|t| t.task_id.clone()),
            role: task.and_then(|t| t.role.clone()),
            status,
            content,
            task_index: task.map(|t| t.index),
            task_description: task.and_then(|t| t.description.clone()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            TranscriptEntry::User { id, .. }
            | TranscriptEntry::SystemProcess { id, .. }
            | TranscriptEntry::AssistantFinal { id, .. } => *id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            TranscriptEntry::User {
                conversation_id, ..
            }
            | TranscriptEntry::SystemProcess {
                conversation_id, ..
            }
            | TranscriptEntry::AssistantFinal {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            TranscriptEntry::User { content, .. }
            | TranscriptEntry::SystemProcess { content, .. }
            | TranscriptEntry::AssistantFinal { content, .. } => content,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            TranscriptEntry::SystemProcess { task_id, .. } => task_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, TranscriptEntry::AssistantFinal { is_final: true, .. })
    }
}

/// What a write did to the store
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptUpdate {
    Appended(TranscriptEntry),
    Updated(TranscriptEntry),
}

impl TranscriptUpdate {
    pub fn entry(&self) -> &TranscriptEntry {
        match self {
            TranscriptUpdate::Appended(entry) | TranscriptUpdate::Updated(entry) => entry,
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: Vec<TranscriptEntry>,
    /// (conversation id, task id) -> position in `entries`
    task_positions: HashMap<(String, String), usize>,
    finalized: HashSet<String>,
    /// Task ids in display order, per conversation
    task_order: HashMap<String, Vec<String>>,
}

/// Process-wide transcript shared by all sessions
///
/// Cloning is cheap; clones share the same sequence. Every write takes the
/// lock once, so appends from different conversations never interleave.
#[derive(Debug, Clone, Default)]
pub struct TranscriptStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Task entries are indexed for later upgrades.
    pub fn append(&self, entry: TranscriptEntry) -> TranscriptEntry {
        let mut inner = self.inner.write();
        if let Some(task_id) = entry.task_id() {
            let key = (entry.conversation_id().to_string(), task_id.to_string());
            let position = inner.entries.len();
            inner.task_positions.insert(key, position);
        }
        inner.entries.push(entry.clone());
        entry
    }

    /// Record a task's terminal state: upgrade its entry in place, or append
    /// one if the task was never shown as processing. Entries that already
    /// hold a terminal status are left alone.
    fn settle_task(
        &self,
        conversation_id: &str,
        task: &TaskRef,
        status: TaskStatus,
        content: String,
    ) -> Option<TranscriptUpdate> {
        let mut inner = self.inner.write();
        let key = (conversation_id.to_string(), task.task_id.clone());

        if let Some(&position) = inner.task_positions.get(&key) {
            let entry = inner.entries.get_mut(position)?;
            if let TranscriptEntry::SystemProcess {
                kind,
                status: current,
                content: text,
                ..
            } = entry
            {
                if current.is_some_and(|s| s.is_terminal()) {
                    return None;
                }
                *kind = ProcessKind::AgentResult;
                *current = Some(status);
                *text = content;
            }
            return Some(TranscriptUpdate::Updated(entry.clone()));
        }

        let entry = TranscriptEntry::process(
            conversation_id,
            ProcessKind::AgentResult,
            Some(task),
            Some(status),
            content,
        );
        let position = inner.entries.len();
        inner.task_positions.insert(key, position);
        inner.entries.push(entry.clone());
        Some(TranscriptUpdate::Appended(entry))
    }

    /// Append the final answer unless the conversation already has one.
    /// The check and the append happen under one lock.
    pub fn append_final(
        &self,
        conversation_id: &str,
        content: impl Into<String>,
    ) -> Option<TranscriptEntry> {
        let mut inner = self.inner.write();
        if !inner.finalized.insert(conversation_id.to_string()) {
            return None;
        }
        let entry = TranscriptEntry::assistant_final(conversation_id, content);
        inner.entries.push(entry.clone());
        Some(entry)
    }

    pub fn has_final(&self, conversation_id: &str) -> bool {
        self.inner.read().finalized.contains(conversation_id)
    }

    fn set_task_order(&self, conversation_id: &str, groups: &[TaskGroup]) {
        let order = groups
            .iter()
            .flat_map(|g| g.task_ids.iter().cloned())
            .collect();
        self.inner
            .write()
            .task_order
            .insert(conversation_id.to_string(), order);
    }

    /// All entries in append order
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.inner.read().entries.clone()
    }

    /// One conversation's entries in append order
    pub fn for_conversation(&self, conversation_id: &str) -> Vec<TranscriptEntry> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|e| e.conversation_id() == conversation_id)
            .cloned()
            .collect()
    }

    /// One conversation's entries with task entries ordered by task group.
    /// Non-task entries keep their positions.
    pub fn display(&self, conversation_id: &str) -> Vec<TranscriptEntry> {
        let inner = self.inner.read();
        let mut entries: Vec<TranscriptEntry> = inner
            .entries
            .iter()
            .filter(|e| e.conversation_id() == conversation_id)
            .cloned()
            .collect();
        let Some(order) = inner.task_order.get(conversation_id) else {
            return entries;
        };

        let rank = |entry: &TranscriptEntry| {
            entry
                .task_id()
                .and_then(|id| order.iter().position(|o| o == id))
                .unwrap_or(usize::MAX)
        };
        let slots: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.task_id().is_some())
            .map(|(i, _)| i)
            .collect();
        let mut tasks: Vec<TranscriptEntry> = slots.iter().map(|&i| entries[i].clone()).collect();
        tasks.sort_by_key(|e| rank(e));
        for (slot, entry) in slots.into_iter().zip(tasks) {
            entries[slot] = entry;
        }
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

/// Display phase of one conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    AwaitingSplit,
    SplitShown,
    Finalized,
}

/// Merges ledger events and the final answer into one conversation's
/// transcript
#[derive(Debug)]
pub struct TranscriptBuilder {
    conversation_id: String,
    store: TranscriptStore,
    phase: Phase,
}

impl TranscriptBuilder {
    pub fn new(conversation_id: impl Into<String>, store: TranscriptStore) -> Self {
        let conversation_id = conversation_id.into();
        let phase = if store.has_final(&conversation_id) {
            Phase::Finalized
        } else {
            Phase::New
        };
        Self {
            conversation_id,
            store,
            phase,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finalized(&self) -> bool {
        self.phase == Phase::Finalized
    }

    /// Merge events (and optionally the user's message) and return this
    /// conversation's entries
    pub fn merge(
        &mut self,
        events: &[TaskStateChange],
        user_message: Option<&str>,
    ) -> Vec<TranscriptEntry> {
        self.apply(events, user_message);
        self.store.for_conversation(&self.conversation_id)
    }

    /// Merge events and report what changed in the store
    pub fn apply(
        &mut self,
        events: &[TaskStateChange],
        user_message: Option<&str>,
    ) -> Vec<TranscriptUpdate> {
        let mut updates = Vec::new();
        if self.is_finalized() {
            return updates;
        }

        if let Some(message) = user_message {
            let entry = self
                .store
                .append(TranscriptEntry::user(&self.conversation_id, message));
            updates.push(TranscriptUpdate::Appended(entry));
            if self.phase == Phase::New {
                self.phase = Phase::AwaitingSplit;
            }
        }

        for event in events {
            if let Some(update) = self.apply_event(event) {
                updates.push(update);
            }
        }
        updates
    }

    fn apply_event(&mut self, event: &TaskStateChange) -> Option<TranscriptUpdate> {
        match event {
            TaskStateChange::TaskSplit { summary, .. } => {
                if self.phase == Phase::SplitShown {
                    return None;
                }
                self.phase = Phase::SplitShown;
                let entry = TranscriptEntry::process(
                    &self.conversation_id,
                    ProcessKind::TaskSplit,
                    None,
                    None,
                    summary.clone(),
                );
                Some(TranscriptUpdate::Appended(self.store.append(entry)))
            }
            TaskStateChange::TaskEnteredProcessing { task } => {
                let entry = TranscriptEntry::process(
                    &self.conversation_id,
                    ProcessKind::AgentProcessing,
                    Some(task),
                    Some(TaskStatus::Processing),
                    processing_text(task),
                );
                Some(TranscriptUpdate::Appended(self.store.append(entry)))
            }
            TaskStateChange::TaskCompleted { task, text } => self.store.settle_task(
                &self.conversation_id,
                task,
                TaskStatus::Completed,
                text.clone(),
            ),
            TaskStateChange::TaskFailed { task, reason } => self.store.settle_task(
                &self.conversation_id,
                task,
                TaskStatus::Failed,
                format!("Failed: {}", reason),
            ),
            TaskStateChange::TaskGroupComputed { groups } => {
                self.store.set_task_order(&self.conversation_id, groups);
                None
            }
        }
    }

    /// Append the final answer. Requires a terminal status, non-empty
    /// content, and no earlier final entry for this conversation.
    pub fn finalize(
        &mut self,
        status: ConversationStatus,
        content: &str,
    ) -> Option<TranscriptEntry> {
        if self.is_finalized() || !status.is_terminal() || content.trim().is_empty() {
            return None;
        }
        let entry = self.store.append_final(&self.conversation_id, content);
        // Either way the conversation now has its final entry.
        self.phase = Phase::Finalized;
        entry
    }

    /// This conversation's entries in display order
    pub fn display(&self) -> Vec<TranscriptEntry> {
        self.store.display(&self.conversation_id)
    }
}

fn processing_text(task: &TaskRef) -> String {
    let who = task.role.as_deref().unwrap_or("Agent");
    match task.description.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(description) => format!("{} is working on: {}", who, description),
        None => format!("{} is working", who),
    }
}
