//! # Arbor Queue
//!
//! A leaderless task queue coordinated entirely through a shared hierarchical
//! key-value store with optimistic transactions and change watches.
//!
//! ## Features
//!
//! - **No coordinator**: any number of workers, in any number of processes,
//!   race on the same task collection; conditional transactions guarantee each
//!   task is processed by exactly one claimant
//! - **Configurable lifecycles**: per-spec start, in-progress, finished, and
//!   error states with a retry budget and a reclamation timeout
//! - **Fencing tokens**: stale resolve/reject/progress calls from superseded
//!   claims become silent no-ops instead of corrupting newer state
//! - **Timeout reclamation**: every worker polices all in-progress tasks and
//!   returns stuck ones to their start state, whoever claimed them
//! - **Live reconfiguration**: queues follow their spec record in the store
//!   and re-target every worker on change
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Queue                               │
//! │   (worker pool, watches the spec record, fans out changes)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueWorker                            │
//! │  (claims tasks via transactions, runs the processing fn,    │
//! │   supervises timeouts, hands out fenced TaskHandles)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TreeStore                             │
//! │  (shared hierarchical store: transactions, queries, watches)│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use arbor_queue::{
//!     processing_fn, InMemoryTreeStore, Queue, QueueOptions, QueueRefs, TreePath, TreeStore,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), arbor_queue::QueueError> {
//! let store = Arc::new(InMemoryTreeStore::new());
//! let queue = Queue::new(
//!     store.clone(),
//!     QueueRefs::rooted_at(TreePath::parse("queue")),
//!     QueueOptions::default().with_num_workers(4),
//!     processing_fn(|data, handle| async move {
//!         // ... do the work ...
//!         let _ = handle.resolve(Some(json!({ "processed": true }))).await;
//!     }),
//! )
//! .await?;
//!
//! store.push(&TreePath::parse("queue/tasks"), json!({ "file": "a.png" })).await?;
//! # queue.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod queue;
pub mod retry;
pub mod spec;
pub mod store;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::queue::{Queue, QueueError, QueueOptions, QueueRefs};
    pub use crate::retry::TxnRetry;
    pub use crate::spec::{SpecError, TaskSpec};
    pub use crate::store::{
        ChildQuery, InMemoryTreeStore, StoreError, TreePath, TreeStore, TxnDecision, TxnOutcome,
        WatchEvent, WatchTarget,
    };
    pub use crate::task::ErrorDetails;
    pub use crate::worker::{
        processing_fn, ProcessingFn, QueueWorker, TaskError, TaskHandle, WorkerError,
        WorkerOptions,
    };
}

// Re-export key types at crate root
pub use queue::{Queue, QueueError, QueueOptions, QueueRefs};
pub use retry::TxnRetry;
pub use spec::{SpecError, TaskSpec};
pub use store::{
    ChildQuery, InMemoryTreeStore, StoreError, TreePath, TreeStore, TxnDecision, TxnOutcome,
    WatchEvent, WatchTarget,
};
pub use task::ErrorDetails;
pub use worker::{
    processing_fn, ProcessingFn, QueueWorker, TaskError, TaskHandle, WorkerError, WorkerOptions,
};
