//! Task record shape
//!
//! A task is an arbitrary JSON object in the shared tree, decorated with
//! reserved bookkeeping fields the queue maintains through transactions.
//! User payload fields live alongside them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved field names on a task record
pub mod keys {
    /// Current lifecycle label; absent means unclaimed in the default start
    /// state
    pub const STATE: &str = "_state";
    /// Server-assigned timestamp of the last state transition (epoch ms)
    pub const STATE_CHANGED: &str = "_state_changed";
    /// Fencing token of the claiming worker, absent when unclaimed
    pub const OWNER: &str = "_owner";
    /// Progress percentage in [0, 100] while in progress
    pub const PROGRESS: &str = "_progress";
    /// Details of the last rejection
    pub const ERROR_DETAILS: &str = "_error_details";
    /// Resolve-time override for the next state, consumed before writing
    pub const NEW_STATE: &str = "_new_state";
    /// Task key injected into unsanitized payloads
    pub const ID: &str = "_id";

    /// Fields stripped from the payload when sanitizing
    pub const RESERVED: [&str; 5] = [STATE, STATE_CHANGED, OWNER, PROGRESS, ERROR_DETAILS];
}

/// Contents of a record's `_error_details` field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// The in-progress state the task was in when it was rejected. Attempts
    /// only accumulate while this matches the live spec's in-progress state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,

    /// Error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Stack trace, absent when stack suppression is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,

    /// Number of rejections in the current regime
    #[serde(default)]
    pub attempts: u32,

    /// Original value of a malformed record, preserved for inspection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_task: Option<Value>,
}

/// The record's `_state`, `None` when absent or null
pub fn state(task: &Value) -> Option<&str> {
    task.get(keys::STATE).and_then(Value::as_str)
}

/// The record's `_owner` fencing token, `None` when unclaimed
pub fn owner(task: &Value) -> Option<&str> {
    task.get(keys::OWNER).and_then(Value::as_str)
}

/// The record's `_state_changed` timestamp in epoch milliseconds
pub fn state_changed_ms(task: &Value) -> Option<i64> {
    task.get(keys::STATE_CHANGED).and_then(Value::as_i64)
}

/// Parse the record's `_error_details`, `None` when absent or unreadable
pub fn error_details(task: &Value) -> Option<ErrorDetails> {
    task.get(keys::ERROR_DETAILS)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

/// Strip the reserved bookkeeping fields from a payload
pub fn sanitize(data: &mut Value) {
    if let Some(map) = data.as_object_mut() {
        for key in keys::RESERVED {
            map.remove(key);
        }
    }
}

/// The payload as a JSON object, or an empty one when it is not an object
pub fn as_object(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
