//! Queue facade
//!
//! A [`Queue`] owns a pool of workers over one task collection and keeps
//! every worker's spec in sync with the store. With a spec id configured, the
//! queue watches the spec record and propagates each change (including
//! deletions and invalid specs, which idle the workers); without one, the
//! workers run the fixed default spec.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use parking_lot::Mutex;

use crate::retry::TxnRetry;
use crate::spec::TaskSpec;
use crate::store::{StoreError, TreePath, TreeStore, WatchEvent, WatchHandle, WatchTarget};
use crate::worker::{ProcessingFn, QueueWorker, WorkerOptions};

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// `num_workers` must be at least one
    #[error("options.num_workers must be a positive integer")]
    InvalidNumWorkers,

    /// `spec_id`, when set, must be a non-empty key
    #[error("options.spec_id must be a non-empty string")]
    InvalidSpecId,

    /// Workers cannot be added once shutdown has begun
    #[error("cannot add worker while queue is shutting down")]
    ShuttingDown,

    /// The pool is already empty
    #[error("no workers to shutdown")]
    NoWorkers,

    /// Store error during queue setup
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a queue's records live in the tree
#[derive(Debug, Clone)]
pub struct QueueRefs {
    /// Parent of the task records
    pub tasks: TreePath,
    /// Parent of the spec records
    pub specs: TreePath,
}

impl QueueRefs {
    /// The conventional layout: `<root>/tasks` and `<root>/specs`
    pub fn rooted_at(root: TreePath) -> Self {
        Self {
            tasks: root.child("tasks"),
            specs: root.child("specs"),
        }
    }

    /// Explicit task and spec locations
    pub fn explicit(tasks: TreePath, specs: TreePath) -> Self {
        Self { tasks, specs }
    }
}

/// Queue construction options
///
/// # Example
///
/// ```
/// use arbor_queue::QueueOptions;
///
/// let options = QueueOptions::default()
///     .with_spec_id("resize_image")
///     .with_num_workers(4)
///     .with_sanitize(false);
///
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Key of the spec record to follow; `None` runs the fixed default spec
    pub spec_id: Option<String>,

    /// Size of the initial worker pool
    pub num_workers: usize,

    /// Strip reserved fields from payloads handed to the processing function
    pub sanitize: bool,

    /// Never write stack traces into `_error_details`
    pub suppress_stack: bool,

    /// Retry policy for every worker transaction
    pub backoff: TxnRetry,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            spec_id: None,
            num_workers: 1,
            sanitize: true,
            suppress_stack: false,
            backoff: TxnRetry::immediate(),
        }
    }
}

impl QueueOptions {
    /// Follow the spec record with this key
    pub fn with_spec_id(mut self, spec_id: impl Into<String>) -> Self {
        self.spec_id = Some(spec_id.into());
        self
    }

    /// Set the initial worker pool size
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set payload sanitization
    pub fn with_sanitize(mut self, sanitize: bool) -> Self {
        self.sanitize = sanitize;
        self
    }

    /// Set stack trace suppression
    pub fn with_suppress_stack(mut self, suppress_stack: bool) -> Self {
        self.suppress_stack = suppress_stack;
        self
    }

    /// Set the transaction retry policy
    pub fn with_backoff(mut self, backoff: TxnRetry) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check the option invariants
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.num_workers == 0 {
            return Err(QueueError::InvalidNumWorkers);
        }
        if self.spec_id.as_deref() == Some("") {
            return Err(QueueError::InvalidSpecId);
        }
        Ok(())
    }

    fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            sanitize: self.sanitize,
            suppress_stack: self.suppress_stack,
            backoff: self.backoff.clone(),
        }
    }
}

struct QueueState {
    workers: Vec<QueueWorker>,
    current_spec: Option<TaskSpec>,
    spec_watch: Option<(WatchHandle, JoinHandle<()>)>,
    shutting_down: bool,
    worker_serial: usize,
}

struct QueueInner {
    store: Arc<dyn TreeStore>,
    refs: QueueRefs,
    options: QueueOptions,
    processing: ProcessingFn,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn next_worker(&self, state: &mut QueueState) -> QueueWorker {
        let serial = state.worker_serial;
        state.worker_serial += 1;
        let queue_id = match &self.options.spec_id {
            Some(spec_id) => format!("{spec_id}:{serial}"),
            None => serial.to_string(),
        };
        QueueWorker::new(
            self.store.clone(),
            self.refs.tasks.clone(),
            &queue_id,
            self.options.worker_options(),
            self.processing.clone(),
        )
    }

    /// Propagate a spec record value to every worker.
    ///
    /// A missing or unparseable record idles the workers rather than erroring
    /// the queue; a later fix to the record brings them back.
    async fn apply_spec_value(&self, value: Option<Value>) {
        let spec = match value {
            Some(value) => match TaskSpec::from_value(&value) {
                Ok(spec) => Some(spec),
                Err(err) => {
                    debug!(error = %err, "invalid task spec record, workers idling");
                    None
                }
            },
            None => None,
        };

        let workers = {
            let mut state = self.state.lock();
            state.current_spec = spec.clone();
            state.workers.clone()
        };
        info!(
            workers = workers.len(),
            listening = spec.is_some(),
            "task spec updated"
        );
        for worker in workers {
            worker.set_task_spec(spec.clone()).await;
        }
    }
}

/// A worker pool bound to one task collection
///
/// # Example
///
/// ```no_run
/// use arbor_queue::{processing_fn, InMemoryTreeStore, Queue, QueueOptions, QueueRefs, TreePath};
/// use std::sync::Arc;
///
/// # async fn demo() -> Result<(), arbor_queue::QueueError> {
/// let store = Arc::new(InMemoryTreeStore::new());
/// let queue = Queue::new(
///     store,
///     QueueRefs::rooted_at(TreePath::parse("queue")),
///     QueueOptions::default(),
///     processing_fn(|data, handle| async move {
///         println!("processing {data}");
///         let _ = handle.resolve(None).await;
///     }),
/// )
/// .await?;
/// # queue.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    /// Create a queue and start its worker pool.
    ///
    /// Returns once the pool is created and, when a spec id is configured,
    /// the spec watch is registered; the spec itself arrives through the
    /// watch's immediate initial notification.
    pub async fn new(
        store: Arc<dyn TreeStore>,
        refs: QueueRefs,
        options: QueueOptions,
        processing: ProcessingFn,
    ) -> Result<Self, QueueError> {
        options.validate()?;

        let inner = Arc::new(QueueInner {
            store,
            refs,
            options,
            processing,
            state: Mutex::new(QueueState {
                workers: Vec::new(),
                current_spec: None,
                spec_watch: None,
                shutting_down: false,
                worker_serial: 0,
            }),
        });

        let created = {
            let mut state = inner.state.lock();
            let mut created = Vec::with_capacity(inner.options.num_workers);
            for _ in 0..inner.options.num_workers {
                let worker = inner.next_worker(&mut state);
                state.workers.push(worker.clone());
                created.push(worker);
            }
            created
        };

        match inner.options.spec_id.clone() {
            None => {
                let spec = TaskSpec::default_spec();
                inner.state.lock().current_spec = Some(spec.clone());
                for worker in &created {
                    worker.set_task_spec(Some(spec.clone())).await;
                }
            }
            Some(spec_id) => {
                let path = inner.refs.specs.child(spec_id);
                let mut watch = inner
                    .store
                    .watch(WatchTarget::Path(path), WatchEvent::Value)
                    .await?;
                let handle = watch.handle;
                let weak = Arc::downgrade(&inner);
                let dispatcher = tokio::spawn(async move {
                    while let Some(notice) = watch.notices.recv().await {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        inner.apply_spec_value(notice.value).await;
                    }
                });
                inner.state.lock().spec_watch = Some((handle, dispatcher));
            }
        }

        Ok(Self { inner })
    }

    /// Where this queue's task records live
    pub fn tasks_path(&self) -> &TreePath {
        &self.inner.refs.tasks
    }

    /// Current size of the worker pool
    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().workers.len()
    }

    /// Add one worker to the pool, running the queue's current spec.
    ///
    /// Returns the new worker's id.
    pub async fn add_worker(&self) -> Result<String, QueueError> {
        let (worker, spec) = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Err(QueueError::ShuttingDown);
            }
            let worker = self.inner.next_worker(&mut state);
            state.workers.push(worker.clone());
            (worker, state.current_spec.clone())
        };
        debug!(worker_id = worker.id(), "added worker");
        worker.set_task_spec(spec).await;
        Ok(worker.id().to_string())
    }

    /// Remove the most recently added worker, waiting for it to finish its
    /// in-flight task.
    ///
    /// Returns the removed worker's id.
    pub async fn shutdown_worker(&self) -> Result<String, QueueError> {
        let worker = self
            .inner
            .state
            .lock()
            .workers
            .pop()
            .ok_or(QueueError::NoWorkers)?;
        debug!(worker_id = worker.id(), "shutting down worker");
        worker.shutdown().await;
        Ok(worker.id().to_string())
    }

    /// Gracefully shut down the whole queue.
    ///
    /// Detaches the spec watch, then waits for every worker to finish its
    /// in-flight task. New workers can no longer be added.
    pub async fn shutdown(&self) {
        let (spec_watch, workers) = {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            (state.spec_watch.take(), std::mem::take(&mut state.workers))
        };
        if let Some((handle, _dispatcher)) = spec_watch {
            let _ = self.inner.store.unwatch(handle).await;
        }
        futures::future::join_all(workers.iter().map(|worker| worker.shutdown())).await;
        info!("queue shut down");
    }
}
