//! Task specification
//!
//! A spec names the lifecycle states for one class of tasks plus its timeout
//! and retry budget. Specs live in the store as records of their own; the
//! queue watches the configured spec record and propagates every change to
//! its workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle label of the default error state
pub const DEFAULT_ERROR_STATE: &str = "error";

/// Retries granted when the spec does not say otherwise
pub const DEFAULT_RETRIES: u32 = 0;

/// Errors raised by spec parsing and validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    /// Spec record is not a JSON object
    #[error("task spec must be an object")]
    NotAnObject,

    /// `in_progress_state` missing or not a string
    #[error("in_progress_state is required and must be a string")]
    InvalidInProgressState,

    /// `start_state` has the wrong type or collides with `in_progress_state`
    #[error("start_state must be a string distinct from in_progress_state")]
    InvalidStartState,

    /// `finished_state` has the wrong type or collides with another state
    #[error("finished_state must be a string distinct from in_progress_state and start_state")]
    InvalidFinishedState,

    /// `error_state` has the wrong type or collides with `in_progress_state`
    #[error("error_state must be a string distinct from in_progress_state")]
    InvalidErrorState,

    /// `timeout` is not a positive integer of milliseconds
    #[error("timeout must be a positive integer of milliseconds")]
    InvalidTimeout,

    /// `retries` is not a non-negative integer
    #[error("retries must be a non-negative integer")]
    InvalidRetries,
}

/// Configuration of one class of tasks
///
/// # Example
///
/// ```
/// use arbor_queue::TaskSpec;
/// use std::time::Duration;
///
/// let spec = TaskSpec::new("in_progress")
///     .with_start_state("pending")
///     .with_finished_state("done")
///     .with_timeout(Duration::from_secs(300))
///     .with_retries(2);
///
/// assert!(spec.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// State a task must be in to be claimed; `None` means unclaimed records
    /// with no `_state` at all
    pub start_state: Option<String>,

    /// State stamped on a claimed task
    pub in_progress_state: String,

    /// State stamped on resolution; `None` deletes resolved tasks instead
    pub finished_state: Option<String>,

    /// State stamped once the retry budget is exhausted
    pub error_state: String,

    /// How long a task may sit in the in-progress state before any worker
    /// reclaims it; `None` disables reclamation
    #[serde(with = "duration_opt_millis")]
    pub timeout: Option<Duration>,

    /// How many rejections send a task back to its start state before it
    /// lands in the error state
    pub retries: u32,
}

impl TaskSpec {
    /// Create a spec with the given in-progress state and defaults everywhere
    /// else
    pub fn new(in_progress_state: impl Into<String>) -> Self {
        Self {
            start_state: None,
            in_progress_state: in_progress_state.into(),
            finished_state: None,
            error_state: DEFAULT_ERROR_STATE.to_string(),
            timeout: None,
            retries: DEFAULT_RETRIES,
        }
    }

    /// The fixed spec used when a queue has no spec id configured
    pub fn default_spec() -> Self {
        Self::new("in_progress").with_timeout(Duration::from_secs(300))
    }

    /// Set the start state
    pub fn with_start_state(mut self, state: impl Into<String>) -> Self {
        self.start_state = Some(state.into());
        self
    }

    /// Set the finished state
    pub fn with_finished_state(mut self, state: impl Into<String>) -> Self {
        self.finished_state = Some(state.into());
        self
    }

    /// Set the error state
    pub fn with_error_state(mut self, state: impl Into<String>) -> Self {
        self.error_state = state.into();
        self
    }

    /// Set the reclamation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Check the cross-field invariants.
    ///
    /// The in-progress state must differ from every other state, and the
    /// start and finished states must differ from each other when both are
    /// set. A worker handed a spec that fails validation stops listening for
    /// tasks rather than erroring.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.in_progress_state.is_empty() {
            return Err(SpecError::InvalidInProgressState);
        }
        if self.start_state.as_deref() == Some(self.in_progress_state.as_str()) {
            return Err(SpecError::InvalidStartState);
        }
        if let Some(finished) = self.finished_state.as_deref() {
            if finished == self.in_progress_state {
                return Err(SpecError::InvalidFinishedState);
            }
            if self.start_state.as_deref() == Some(finished) {
                return Err(SpecError::InvalidFinishedState);
            }
        }
        if self.error_state == self.in_progress_state {
            return Err(SpecError::InvalidErrorState);
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(SpecError::InvalidTimeout);
        }
        Ok(())
    }

    /// Parse a spec record from the store, defaulting absent fields.
    ///
    /// Field names follow the stored shape: `start_state`,
    /// `in_progress_state`, `finished_state`, `error_state`, `timeout`
    /// (milliseconds), `retries`.
    pub fn from_value(value: &Value) -> Result<Self, SpecError> {
        let map = value.as_object().ok_or(SpecError::NotAnObject)?;

        let in_progress_state = match map.get("in_progress_state") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(SpecError::InvalidInProgressState),
        };
        let start_state = match map.get("start_state") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            _ => return Err(SpecError::InvalidStartState),
        };
        let finished_state = match map.get("finished_state") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            _ => return Err(SpecError::InvalidFinishedState),
        };
        let error_state = match map.get("error_state") {
            None | Some(Value::Null) => DEFAULT_ERROR_STATE.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => return Err(SpecError::InvalidErrorState),
        };
        let timeout = match map.get("timeout") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(ms) if ms > 0 => Some(Duration::from_millis(ms)),
                _ => return Err(SpecError::InvalidTimeout),
            },
        };
        let retries = match map.get("retries") {
            None | Some(Value::Null) => DEFAULT_RETRIES,
            Some(v) => match v.as_u64() {
                Some(n) => n.try_into().map_err(|_| SpecError::InvalidRetries)?,
                None => return Err(SpecError::InvalidRetries),
            },
        };

        let spec = Self {
            start_state,
            in_progress_state,
            finished_state,
            error_state,
            timeout,
            retries,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Serde support for Option<Duration> as milliseconds
mod duration_opt_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
