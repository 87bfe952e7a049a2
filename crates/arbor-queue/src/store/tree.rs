//! TreeStore trait definition
//!
//! The queue coordinates exclusively through a shared hierarchical key-value
//! store with optimistic transactions and change notification. This module
//! defines the narrow interface the core consumes; production deployments
//! implement it against the real store client, tests use
//! [`InMemoryTreeStore`](super::InMemoryTreeStore).

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transaction lost a race against a concurrent writer and the client
    /// could not re-run it. Retried by the worker's bounded retry loop.
    #[error("transaction conflict at {0}")]
    Conflict(String),

    /// Transport-level failure talking to the store
    #[error("transport error: {0}")]
    Transport(String),

    /// Watch handle is not registered (already removed or never existed)
    #[error("unknown watch handle: {0}")]
    UnknownWatch(u64),

    /// Operation not supported for the given target
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// A slash-separated location in the tree.
///
/// Segments never contain `/`. The root path has no segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TreePath {
    segments: Vec<String>,
}

impl TreePath {
    /// The root of the tree
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a `a/b/c` style path, ignoring empty segments
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Append a child segment
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The final segment, if any
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// All segments, root first
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl std::fmt::Display for TreePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// An ordered, filtered view over the children of a path.
///
/// Children are matched on a single field compared for JSON equality; a
/// missing field compares equal to `null`, so a filter with
/// `equal_to: Value::Null` matches children that never set the field at all.
/// Matches are ordered by child key.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildQuery {
    /// Parent path whose children are queried
    pub path: TreePath,
    /// Field of each child used for comparison
    pub order_by: String,
    /// Value the field must equal
    pub equal_to: Value,
    /// Truncate the view to the first N matches (by key order)
    pub limit_to_first: Option<usize>,
}

impl ChildQuery {
    /// Query children of `path` whose `field` equals `value`
    pub fn equal_to(path: TreePath, field: impl Into<String>, value: Value) -> Self {
        Self {
            path,
            order_by: field.into(),
            equal_to: value,
            limit_to_first: None,
        }
    }

    /// Limit the view to the first N matches
    pub fn limit_to_first(mut self, limit: usize) -> Self {
        self.limit_to_first = Some(limit);
        self
    }
}

/// What a watch observes
#[derive(Debug, Clone)]
pub enum WatchTarget {
    /// The value at a single path
    Path(TreePath),
    /// A filtered child view
    Query(ChildQuery),
}

/// Watch event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The value at the target path changed. Fires once immediately with the
    /// current value on registration. Only valid for [`WatchTarget::Path`].
    Value,
    /// A child entered the view. Fires once per existing member on
    /// registration.
    ChildAdded,
    /// A child left the view. Carries the child's prior value.
    ChildRemoved,
    /// A member's value changed while staying in the view.
    ///
    /// Required store contract: at least one `ChildChanged` notification must
    /// be delivered per distinct prior value, even if a removal and re-add
    /// were coalesced server-side. The timeout supervisor relies on this to
    /// re-derive expiry timers across ownership handoffs.
    ChildChanged,
}

/// A single watch notification
#[derive(Debug, Clone)]
pub struct WatchNotice {
    /// Child key for child events, final path segment for value events
    pub key: String,
    /// Current value (`None` when absent); prior value for `ChildRemoved`
    pub value: Option<Value>,
}

/// Token identifying a registered watch, used to detach it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub u64);

/// A registered watch: the detach token plus the notification stream
pub struct Watch {
    pub handle: WatchHandle,
    pub notices: mpsc::UnboundedReceiver<WatchNotice>,
}

/// Decision returned by a transaction update function
#[derive(Debug, Clone)]
pub enum TxnDecision {
    /// Leave the record untouched; the transaction reports `committed: false`
    Abort,
    /// Replace the record with this value
    Set(Value),
    /// Delete the record
    Remove,
}

/// Result of a transaction
#[derive(Debug, Clone)]
pub struct TxnOutcome {
    /// Whether a write was applied
    pub committed: bool,
    /// The value at the path after the transaction (post-write on commit,
    /// the unmodified current value on abort)
    pub snapshot: Option<Value>,
}

impl TxnOutcome {
    /// Committed a write and the record still exists
    pub fn committed_existing(&self) -> bool {
        self.committed && self.snapshot.is_some()
    }
}

/// Update function passed to [`TreeStore::transaction`].
///
/// Receives the current value (`None` when the record is absent) and decides
/// what, if anything, to write. `&mut dyn` rather than a generic parameter so
/// the trait stays object-safe and closures can capture local flags.
pub type TxnUpdate<'a> = dyn FnMut(Option<&Value>) -> TxnDecision + Send + 'a;

/// Sentinel written in place of a timestamp, resolved to epoch milliseconds
/// by the store at commit time.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

/// Whether a value is the server-timestamp sentinel
pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.len() == 1 && m.get(".sv").and_then(Value::as_str) == Some("timestamp"))
}

/// Replace every server-timestamp sentinel in `value` with `now_ms`
pub fn resolve_server_timestamps(value: &mut Value, now_ms: i64) {
    if is_server_timestamp(value) {
        *value = Value::from(now_ms);
        return;
    }
    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                resolve_server_timestamps(v, now_ms);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                resolve_server_timestamps(v, now_ms);
            }
        }
        _ => {}
    }
}

/// Hierarchical store consumed by the queue core
///
/// Implementations must be thread-safe and deliver watch notifications in
/// the order the corresponding writes were applied. Writing `null` to a path
/// deletes it; reads never observe explicit nulls.
#[async_trait]
pub trait TreeStore: Send + Sync + 'static {
    /// Point read. `None` when the path holds no value.
    async fn get(&self, path: &TreePath) -> Result<Option<Value>, StoreError>;

    /// Unconditional write. `Value::Null` deletes the path.
    async fn set(&self, path: &TreePath, value: Value) -> Result<(), StoreError>;

    /// Append a child under `path` with a server-generated key that orders
    /// lexicographically after all previously generated keys. Returns the key.
    async fn push(&self, path: &TreePath, value: Value) -> Result<String, StoreError>;

    /// Optimistic read-modify-write on a single path.
    ///
    /// The update function observes the current value and returns a
    /// [`TxnDecision`]; `Abort` leaves the store untouched. Conflicts with
    /// concurrent writers surface as [`StoreError::Conflict`].
    async fn transaction(
        &self,
        path: &TreePath,
        update: &mut TxnUpdate<'_>,
    ) -> Result<TxnOutcome, StoreError>;

    /// Ordered snapshot of the children matching `query`
    async fn query_first(&self, query: &ChildQuery) -> Result<Vec<(String, Value)>, StoreError>;

    /// Register a persistent watch. See [`WatchEvent`] for the initial-event
    /// and delivery contracts.
    async fn watch(&self, target: WatchTarget, event: WatchEvent) -> Result<Watch, StoreError>;

    /// Detach a previously registered watch
    async fn unwatch(&self, handle: WatchHandle) -> Result<(), StoreError>;
}
