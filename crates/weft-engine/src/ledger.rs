//! Task ledger
//!
//! Keeps one [`TaskRecord`] per task id for a conversation and turns each
//! status snapshot into the lifecycle transitions it implies. Emission is
//! guarded by flags on the record, never by looking at what was displayed, so
//! applying the same snapshot twice is a no-op.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use weft_api::{ConversationSnapshot, TaskSnapshot, TaskStatus};

use crate::events::{TaskRef, TaskStateChange};
use crate::normalize;

/// Reason used when a failed task reports none
pub const DEFAULT_FAILURE_REASON: &str = "Task failed";

/// Last known state of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: String,
    pub role: Option<String>,
    pub description: Option<String>,
    pub index: usize,
    /// Highest-ranked status seen so far
    pub status: TaskStatus,
    pub processing_emitted: bool,
    pub result_emitted: bool,
    pub failure_emitted: bool,
    pub result_text: Option<String>,
}

impl TaskRecord {
    fn new(task_id: String, task: &TaskSnapshot, index: usize) -> Self {
        Self {
            task_id,
            role: task.role.clone(),
            description: task.description.clone(),
            index,
            status: TaskStatus::Pending,
            processing_emitted: false,
            result_emitted: false,
            failure_emitted: false,
            result_text: None,
        }
    }

    fn task_ref(&self) -> TaskRef {
        TaskRef {
            task_id: self.task_id.clone(),
            role: self.role.clone(),
            description: self.description.clone(),
            index: self.index,
        }
    }
}

/// Tasks sharing the same description and role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub description: Option<String>,
    pub role: Option<String>,
    pub task_ids: Vec<String>,
    pub min_index: usize,
}

/// Per-conversation record of task identities and lifecycle states
#[derive(Debug, Default)]
pub struct TaskLedger {
    records: HashMap<String, TaskRecord>,
    /// Task ids in first-seen order
    order: Vec<String>,
    groups: Vec<TaskGroup>,
    split_emitted: bool,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile a snapshot against the known records
    pub fn apply(&mut self, snapshot: &ConversationSnapshot) -> Vec<TaskStateChange> {
        let mut changes = Vec::new();
        if snapshot.tasks.is_empty() {
            return changes;
        }

        if !self.split_emitted {
            self.split_emitted = true;
            changes.push(TaskStateChange::TaskSplit {
                summary: split_summary(snapshot),
                task_count: snapshot.tasks.len(),
            });
        }

        for (position, task) in snapshot.tasks.iter().enumerate() {
            let task_id = task_key(task, position);
            let index = task.index.unwrap_or(position);
            if let Some(change) = self.apply_task(task_id, task, index) {
                changes.push(change);
            }
        }

        let groups = compute_groups(snapshot);
        if groups != self.groups {
            self.groups = groups.clone();
            changes.push(TaskStateChange::TaskGroupComputed { groups });
        }

        changes
    }

    fn apply_task(
        &mut self,
        task_id: String,
        task: &TaskSnapshot,
        index: usize,
    ) -> Option<TaskStateChange> {
        if !self.records.contains_key(&task_id) {
            self.order.push(task_id.clone());
        }
        let record = self
            .records
            .entry(task_id.clone())
            .or_insert_with(|| TaskRecord::new(task_id, task, index));

        if record.role.is_none() {
            record.role = task.role.clone();
        }
        if record.description.is_none() {
            record.description = task.description.clone();
        }

        if task.status.rank() < record.status.rank() {
            tracing::debug!(
                "Ignoring stale status {} for task {} (already {})",
                task.status.as_str(),
                record.task_id,
                record.status.as_str()
            );
            return None;
        }
        if task.status.rank() > record.status.rank() {
            record.status = task.status;
        }
        // The first terminal status sticks
        if record.status.is_terminal() && task.status != record.status {
            tracing::debug!(
                "Ignoring {} for task {} (already {})",
                task.status.as_str(),
                record.task_id,
                record.status.as_str()
            );
            return None;
        }

        match task.status {
            TaskStatus::Processing if !record.processing_emitted => {
                record.processing_emitted = true;
                Some(TaskStateChange::TaskEnteredProcessing {
                    task: record.task_ref(),
                })
            }
            TaskStatus::Completed if !record.result_emitted && task.has_result() => {
                // An empty extraction leaves the flag unset so a later poll
                // carrying content still emits.
                let text = task.result.as_ref().and_then(normalize::task_result_text)?;
                record.result_emitted = true;
                record.result_text = Some(text.clone());
                Some(TaskStateChange::TaskCompleted {
                    task: record.task_ref(),
                    text,
                })
            }
            TaskStatus::Failed if !record.failure_emitted => {
                record.failure_emitted = true;
                let reason = task
                    .error
                    .clone()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string());
                Some(TaskStateChange::TaskFailed {
                    task: record.task_ref(),
                    reason,
                })
            }
            _ => None,
        }
    }

    pub fn record(&self, task_id: &str) -> Option<&TaskRecord> {
        self.records.get(task_id)
    }

    /// Records in first-seen order
    pub fn records(&self) -> impl Iterator<Item = &TaskRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Latest grouping
    pub fn groups(&self) -> &[TaskGroup] {
        &self.groups
    }

    pub fn is_split(&self) -> bool {
        self.split_emitted
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop all records
    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
        self.groups.clear();
        self.split_emitted = false;
    }
}

/// Stable key for a task: its id, or `task-<position>` when it has none
pub fn task_key(task: &TaskSnapshot, position: usize) -> String {
    task.id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("task-{}", position))
}

/// Group tasks by `(description, role)` in snapshot order, then sort the
/// groups by their smallest member index.
pub fn compute_groups(snapshot: &ConversationSnapshot) -> Vec<TaskGroup> {
    let mut groups: Vec<TaskGroup> = Vec::new();
    for (position, task) in snapshot.tasks.iter().enumerate() {
        let task_id = task_key(task, position);
        let index = task.index.unwrap_or(position);
        match groups
            .iter_mut()
            .find(|g| g.description == task.description && g.role == task.role)
        {
            Some(group) => {
                group.task_ids.push(task_id);
                group.min_index = group.min_index.min(index);
            }
            None => groups.push(TaskGroup {
                description: task.description.clone(),
                role: task.role.clone(),
                task_ids: vec![task_id],
                min_index: index,
            }),
        }
    }
    groups.sort_by_key(|g| g.min_index);
    groups
}

/// One-line-per-stage summary of how the query was split
pub fn split_summary(snapshot: &ConversationSnapshot) -> String {
    if let Some(decomposition) = &snapshot.decomposition {
        if !decomposition.execution_levels.is_empty() {
            let labels: Vec<(usize, String)> = if decomposition.tasks.is_empty() {
                snapshot_labels(snapshot)
            } else {
                decomposition
                    .tasks
                    .iter()
                    .enumerate()
                    .map(|(position, task)| {
                        (
                            task.index.unwrap_or(position),
                            label(task.description.as_deref(), task.role.as_deref(), position),
                        )
                    })
                    .collect()
            };
            return format_levels(&decomposition.execution_levels, &labels);
        }
    }

    if let Some(levels) = snapshot.execution_levels.as_ref().filter(|l| !l.is_empty()) {
        return format_levels(levels, &snapshot_labels(snapshot));
    }

    let mut summary = format!("Split into {} tasks:", snapshot.tasks.len());
    for (position, (_, label)) in snapshot_labels(snapshot).iter().enumerate() {
        summary.push_str(&format!("\n{}. {}", position + 1, label));
    }
    summary
}

fn snapshot_labels(snapshot: &ConversationSnapshot) -> Vec<(usize, String)> {
    snapshot
        .tasks
        .iter()
        .enumerate()
        .map(|(position, task)| {
            (
                task.index.unwrap_or(position),
                label(task.description.as_deref(), task.role.as_deref(), position),
            )
        })
        .collect()
}

fn label(description: Option<&str>, role: Option<&str>, position: usize) -> String {
    let description = description
        .filter(|d| !d.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Task {}", position + 1));
    match role.filter(|r| !r.trim().is_empty()) {
        Some(role) => format!("{} ({})", description, role),
        None => description,
    }
}

fn format_levels(levels: &[Vec<usize>], labels: &[(usize, String)]) -> String {
    let lookup = |i: usize| {
        labels
            .iter()
            .find(|(index, _)| *index == i)
            .or_else(|| labels.get(i))
            .map(|(_, label)| label.clone())
            .unwrap_or_else(|| format!("Task {}", i + 1))
    };
    let task_count: usize = levels.iter().map(Vec::len).sum();
    let mut summary = format!(
        "Split into {} tasks across {} stages:",
        task_count,
        levels.len()
    );
    for (stage, level) in levels.iter().enumerate() {
        let names: Vec<String> = level.iter().map(|&i| lookup(i)).collect();
        summary.push_str(&format!("\nStage {}: {}", stage + 1, names.join(", ")));
    }
    summary
}
