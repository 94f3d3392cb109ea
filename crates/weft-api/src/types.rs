//! Core types for the conversation query/status contract

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::lenient;

/// Overall status of a conversation as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "Value")]
pub enum ConversationStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    PartiallyCompleted,
    Failed,
    /// A status string this client does not know; treated as non-terminal
    Unknown,
}

impl ConversationStatus {
    /// Parse a backend status string (case and separator insensitive)
    pub fn parse(s: &str) -> Self {
        match normalize_status(s).as_str() {
            "pending" | "queued" | "created" => Self::Pending,
            "processing" | "in_progress" | "running" => Self::Processing,
            "completed" | "complete" | "done" => Self::Completed,
            "partially_completed" | "partial" => Self::PartiallyCompleted,
            "failed" | "error" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Whether no further work is expected for the conversation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyCompleted | Self::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl From<Value> for ConversationStatus {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Pending,
            Value::String(s) => Self::parse(&s),
            _ => Self::Unknown,
        }
    }
}

/// Lifecycle status of a single sub-task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "Value")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Unknown,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Self {
        match normalize_status(s).as_str() {
            "pending" | "queued" | "created" => Self::Pending,
            "processing" | "in_progress" | "running" => Self::Processing,
            "completed" | "complete" | "done" => Self::Completed,
            "failed" | "error" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Position in the lifecycle. Displayed status only ever moves up.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending | Self::Unknown => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl From<Value> for TaskStatus {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Pending,
            Value::String(s) => Self::parse(&s),
            _ => Self::Unknown,
        }
    }
}

fn normalize_status(s: &str) -> String {
    s.trim().to_lowercase().replace(['-', ' '], "_")
}

/// One sub-task as reported by the backend at a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Stable identifier across polls (the natural key)
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub id: Option<String>,
    /// Role of the agent producing this task
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub role: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Opaque, heterogeneously shaped payload; present once completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Position in the decomposition; inferred from array position when absent
    #[serde(default, deserialize_with = "lenient::opt_index")]
    pub index: Option<usize>,
    /// Epoch seconds
    #[serde(default, alias = "createdAt", deserialize_with = "lenient::opt_epoch")]
    pub created_at: Option<f64>,
    /// Epoch seconds
    #[serde(default, alias = "completedAt", deserialize_with = "lenient::opt_epoch")]
    pub completed_at: Option<f64>,
    /// Failure reason reported for failed tasks
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub error: Option<String>,
}

impl TaskSnapshot {
    /// Create a task snapshot with an id and status (mostly for tests)
    pub fn new(id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: Some(id.into()),
            status,
            ..Default::default()
        }
    }

    /// Set the result payload
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Whether the result carries anything at all
    pub fn has_result(&self) -> bool {
        match &self.result {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
        }
    }
}

/// A task as planned by the decomposition step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub role: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_index")]
    pub index: Option<usize>,
}

/// How the backend split the query into tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDecomposition {
    #[serde(default, deserialize_with = "lenient::lossy_vec")]
    pub tasks: Vec<PlannedTask>,
    /// Groups of task indices that run concurrently, in execution order
    #[serde(
        default,
        alias = "executionLevels",
        deserialize_with = "lenient::lossy_vec"
    )]
    pub execution_levels: Vec<Vec<usize>>,
}

/// One point-in-time status read for a conversation
///
/// Parsed leniently: missing or oddly typed fields become absent rather than
/// failing the whole document. The raw document is kept alongside because the
/// final answer is extracted from whatever shape the backend produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    #[serde(
        default,
        alias = "conversationId",
        deserialize_with = "lenient::string_or_empty"
    )]
    pub conversation_id: String,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default, deserialize_with = "lenient::lossy_vec")]
    pub tasks: Vec<TaskSnapshot>,
    /// The backend's own message field (may hold a generic placeholder)
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub message: Option<String>,
    #[serde(
        default,
        alias = "finalMessage",
        deserialize_with = "lenient::opt_string"
    )]
    pub final_message: Option<String>,
    #[serde(default, deserialize_with = "lenient::or_none")]
    pub decomposition: Option<TaskDecomposition>,
    /// Execution levels reported outside of a decomposition object
    #[serde(
        default,
        alias = "executionLevels",
        deserialize_with = "lenient::or_none"
    )]
    pub execution_levels: Option<Vec<Vec<usize>>>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub error: Option<String>,
    #[serde(skip)]
    raw: Value,
}

impl ConversationSnapshot {
    /// Parse a status document, keeping the raw JSON for result extraction
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::UnexpectedResponse(format!(
                "status document is not an object: {}",
                truncate_json(&value)
            )));
        }
        let mut snapshot: Self = serde_json::from_value(value.clone())?;
        snapshot.raw = value;
        Ok(snapshot)
    }

    /// The document as received from the backend
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Whether the snapshot lists any tasks yet
    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }
}

/// Body of a query submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    /// Continue an existing conversation instead of starting a new one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            conversation_id: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Backend acknowledgement of a submitted query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAccepted {
    pub conversation_id: String,
    pub status: Option<ConversationStatus>,
    pub raw: Value,
}

impl QueryAccepted {
    /// Keys that may carry the conversation id, in order of preference
    const ID_KEYS: [&'static str; 3] = ["conversation_id", "conversationId", "id"];

    /// Extract the correlation fields from a submit response
    pub fn from_value(value: Value) -> Result<Self> {
        let conversation_id = Self::ID_KEYS
            .iter()
            .filter_map(|key| value.get(key))
            .filter_map(lenient::scalar_to_string)
            .map(|id| id.trim().to_string())
            .find(|id| !id.is_empty())
            .ok_or(Error::MissingConversationId)?;

        let status = value.get("status").cloned().map(ConversationStatus::from);

        Ok(Self {
            conversation_id,
            status,
            raw: value,
        })
    }
}

fn truncate_json(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 120 {
        format!("{}...", text.chars().take(120).collect::<String>())
    } else {
        text
    }
}
