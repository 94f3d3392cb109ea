//! Result normalization
//!
//! Turns the heterogeneous payloads the backend produces into one display
//! string. Rules are tried in a fixed order and the first one that yields
//! non-blank text wins. A payload can structurally satisfy several rules at
//! once (a string result that is also valid JSON, a message next to a nested
//! result), so the order itself is part of the contract.
//!
//! Everything here is pure and total: unknown shapes fall back to fenced JSON,
//! and a failed serialization falls back to a fixed string.

use serde_json::{Map, Value};
use weft_api::{ConversationSnapshot, TaskStatus};

/// Generic messages the backend sends when a run produced nothing.
/// These are treated as absent.
pub const BACKEND_PLACEHOLDERS: &[&str] = &[
    "처리가 완료되었으나 결과가 없습니다.",
    "processing completed, no result",
    "processing completed, but no result",
];

/// Shown when no rule yields anything
pub const NO_RESULT_AVAILABLE: &str = "Processing completed, no result available.";

/// Shown when even the JSON fallback cannot be produced
pub const UNDISPLAYABLE_RESULT: &str = "Unable to display result.";

/// Top-level keys checked for a ready-made message, in order
const MESSAGE_KEYS: [&str; 3] = ["message", "final_message", "finalMessage"];

/// Which rule produced an extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// The payload itself is a string
    Verbatim,
    /// `payload.message` (or a final-message field)
    Message,
    /// `payload.result.result.content|message`
    NestedResult,
    /// `payload.result.content|message`
    ResultField,
    /// `payload.result` is a string
    ResultString,
    /// Most recently completed entry of `payload.tasks`
    CompletedTask,
    /// Fenced JSON of `payload.result`
    ResultJson,
    /// Fenced JSON of the whole payload
    PayloadJson,
    /// Nothing to show
    NoResult,
    /// Serialization failed
    Undisplayable,
}

impl Rule {
    /// Whether the rule found real content, as opposed to a fallback rendering
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            Rule::Verbatim
                | Rule::Message
                | Rule::NestedResult
                | Rule::ResultField
                | Rule::ResultString
                | Rule::CompletedTask
        )
    }
}

/// Display text plus the rule that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    pub rule: Rule,
}

impl Extraction {
    fn new(text: impl Into<String>, rule: Rule) -> Self {
        Self {
            text: text.into(),
            rule,
        }
    }

    /// `false` means "no content yet": the text is only a fallback rendering
    pub fn is_content(&self) -> bool {
        self.rule.is_content()
    }
}

/// Extract the display string for a payload. Never empty.
pub fn extract(payload: &Value) -> String {
    classify(payload).text
}

/// Run the ordered rule list over a payload
pub fn classify(payload: &Value) -> Extraction {
    // 1. string payload
    if let Value::String(s) = payload {
        if !is_blank_str(s) {
            return Extraction::new(s.clone(), Rule::Verbatim);
        }
    }

    if let Value::Object(map) = payload {
        // 2. ready-made message, unless it is the backend's placeholder
        if let Some(text) = MESSAGE_KEYS
            .iter()
            .filter_map(|key| map.get(*key).and_then(Value::as_str))
            .find(|text| !is_blank_str(text) && !is_placeholder(text))
        {
            return Extraction::new(text, Rule::Message);
        }

        // 3-5. result field
        if let Some(result) = map.get("result") {
            if let Some((text, rule)) = result_field(result) {
                return Extraction::new(text, rule);
            }
        }

        // 6. most recently completed task
        if let Some(Value::Array(tasks)) = map.get("tasks") {
            if let Some(text) = last_completed_task_text(tasks) {
                return Extraction::new(text, Rule::CompletedTask);
            }
        }

        // 7. whatever the result is, rendered
        // null and blank strings have nothing to render; empty containers do
        if let Some(result) = map.get("result").filter(|r| !is_absent_result(r)) {
            return fenced_or_undisplayable(result, Rule::ResultJson);
        }
    }

    // 8. the whole payload, rendered
    if !is_blank(payload) && !payload.is_string() {
        return fenced_or_undisplayable(payload, Rule::PayloadJson);
    }

    // 9.
    Extraction::new(NO_RESULT_AVAILABLE, Rule::NoResult)
}

/// Extract the final answer from a conversation snapshot
pub fn final_answer(snapshot: &ConversationSnapshot) -> Extraction {
    classify(snapshot.raw())
}

/// Display text for one task's `result` field.
///
/// Returns `None` when the result carries no content: it is blank, or it only
/// declares blank `content`/`message` fields. Unknown shapes render as JSON.
pub fn task_result_text(result: &Value) -> Option<String> {
    if is_blank(result) {
        return None;
    }
    if let Some((text, _)) = result_field(result) {
        return Some(text);
    }
    if declares_blank_content(result) {
        return None;
    }
    fenced_json(result).or_else(|| Some(UNDISPLAYABLE_RESULT.to_string()))
}

/// Rules 3-5 applied to a `result` value
fn result_field(result: &Value) -> Option<(String, Rule)> {
    match result {
        Value::Object(map) => {
            if let Some(Value::Object(inner)) = map.get("result") {
                if let Some(text) = content_or_message(inner) {
                    return Some((text, Rule::NestedResult));
                }
            }
            content_or_message(map).map(|text| (text, Rule::ResultField))
        }
        Value::String(s) if !is_blank_str(s) => Some((s.clone(), Rule::ResultString)),
        _ => None,
    }
}

fn content_or_message(map: &Map<String, Value>) -> Option<String> {
    ["content", "message"]
        .iter()
        .filter_map(|key| map.get(*key))
        .filter_map(value_text)
        .find(|text| !is_blank_str(text))
}

/// Rules 3-5 applied to the last task whose status is completed. Earlier
/// completed tasks are never consulted.
fn last_completed_task_text(tasks: &[Value]) -> Option<String> {
    let task = tasks.iter().rev().find(|task| {
        task.get("status")
            .and_then(Value::as_str)
            .map(TaskStatus::parse)
            == Some(TaskStatus::Completed)
    })?;
    result_field(task.get("result")?).map(|(text, _)| text)
}

/// Text of a `content`/`message` value. Lists of strings or text blocks are
/// joined; anything else structured renders as JSON.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(block) => block.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect();
            if parts.is_empty() {
                fenced_json(value)
            } else {
                Some(parts.join("\n"))
            }
        }
        other => fenced_json(other),
    }
}

fn declares_blank_content(result: &Value) -> bool {
    let Value::Object(map) = result else {
        return false;
    };
    let declares = |m: &Map<String, Value>| {
        ["content", "message"]
            .iter()
            .any(|key| matches!(m.get(*key), Some(Value::String(s)) if is_blank_str(s)))
    };
    declares(map)
        || matches!(map.get("result"), Some(Value::Object(inner)) if declares(inner))
}

fn is_absent_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => is_blank_str(s),
        _ => false,
    }
}

fn fenced_json(value: &Value) -> Option<String> {
    serde_json::to_string_pretty(value)
        .ok()
        .map(|pretty| format!("```json\n{}\n```", pretty))
}

fn fenced_or_undisplayable(value: &Value, rule: Rule) -> Extraction {
    match fenced_json(value) {
        Some(text) => Extraction::new(text, rule),
        None => Extraction::new(UNDISPLAYABLE_RESULT, Rule::Undisplayable),
    }
}

/// Whether a message is one of the backend's "nothing to show" placeholders
pub fn is_placeholder(text: &str) -> bool {
    let normalized = text.trim().trim_end_matches('.').to_lowercase();
    BACKEND_PLACEHOLDERS
        .iter()
        .any(|p| p.trim_end_matches('.').to_lowercase() == normalized)
}

fn is_blank_str(s: &str) -> bool {
    s.trim().is_empty()
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => is_blank_str(s),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
