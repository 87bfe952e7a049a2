//! Queue worker
//!
//! Each worker owns at most one in-flight task and runs the
//! claim → process → resolve/reject state machine as a sequence of optimistic
//! transactions against the shared store. Arbitrarily many workers, in this
//! process or others, race on the same task collection; every mutating
//! transaction re-validates `_state` and `_owner` before writing, so a lost
//! race aborts with no effect.
//!
//! Cancellation is fencing-based: the worker's `task_number` increments on
//! every spec change and every successful claim, and the capabilities handed
//! to the processing function capture the number current at claim time. A
//! capability whose number no longer matches is a documented no-op.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::retry::TxnRetry;
use crate::spec::TaskSpec;
use crate::store::{
    server_timestamp, ChildQuery, StoreError, TreePath, TreeStore, TxnDecision, TxnOutcome,
    TxnUpdate, WatchEvent, WatchHandle, WatchTarget,
};
use crate::task::{self, keys, ErrorDetails};

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A transaction kept failing and its retry budget ran out. Fails this
    /// one operation only; the worker stays live for the next trigger.
    #[error("{operation} errored too many times, no longer retrying")]
    RetriesExhausted {
        /// Which operation exhausted its retries
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// Progress value outside [0, 100] or not finite
    #[error("invalid progress: must be a finite number between 0 and 100")]
    InvalidProgress,

    /// No task is currently being processed under the caller's fencing token
    #[error("no task currently being processed")]
    NoCurrentTask,

    /// The task is no longer owned by this worker
    #[error("current task no longer owned by this process")]
    OwnershipLost,

    /// Progress transaction failed at the store
    #[error("errored while attempting to update progress")]
    ProgressFailed(#[source] StoreError),

    /// The worker is shutting down and no longer claims tasks
    #[error("shutting down - can no longer process new tasks")]
    ShuttingDown,

    /// Store error outside a retried transaction
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Error payload passed to [`TaskHandle::reject`]
#[derive(Debug, Clone, Default)]
pub struct TaskError {
    /// Human-readable message stored in `_error_details.error`
    pub message: Option<String>,
    /// Stack trace stored in `_error_details.error_stack` unless the worker
    /// suppresses stacks
    pub stack: Option<String>,
}

impl TaskError {
    /// An error with just a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            stack: None,
        }
    }

    /// Attach a stack trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Capture the current backtrace as the stack trace
    pub fn with_captured_stack(self) -> Self {
        let stack = Backtrace::force_capture().to_string();
        self.with_stack(stack)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// User processing function invoked once per claimed task
pub type ProcessingFn = Arc<dyn Fn(Value, TaskHandle) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`ProcessingFn`]
pub fn processing_fn<F, Fut>(f: F) -> ProcessingFn
where
    F: Fn(Value, TaskHandle) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |data, handle| Box::pin(f(data, handle)))
}

/// Per-worker behavior options, shared by every worker of a queue
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Strip reserved bookkeeping fields from the payload handed to the
    /// processing function; when false, the task key is injected as `_id`
    /// instead
    pub sanitize: bool,

    /// Never write stack traces into `_error_details`
    pub suppress_stack: bool,

    /// Retry policy for every store transaction
    pub backoff: TxnRetry,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            sanitize: true,
            suppress_stack: false,
            backoff: TxnRetry::immediate(),
        }
    }
}

/// The three capabilities handed to the processing function.
///
/// All three are fencing-checked: once the worker's task number has moved on
/// (spec change, lost ownership, or a previous fulfillment), `resolve` and
/// `reject` become silent no-ops and `progress` fails descriptively. Cloning
/// is cheap; all clones share the same captured token.
#[derive(Clone)]
pub struct TaskHandle {
    worker: Arc<WorkerInner>,
    token: u64,
}

impl TaskHandle {
    /// Report progress in percent. Advisory: failures are not retried.
    pub async fn progress(&self, progress: f64) -> Result<(), WorkerError> {
        self.worker.update_progress(self.token, progress).await
    }

    /// Complete the task successfully, optionally replacing its payload.
    ///
    /// The output may carry a `_new_state` override: an explicit string wins;
    /// explicit `false` (or no finished state configured on the spec) deletes
    /// the record; any other non-string value falls back to the spec's
    /// finished state.
    pub async fn resolve(&self, output: Option<Value>) -> Result<(), WorkerError> {
        self.worker.resolve(self.token, output).await
    }

    /// Fail the task, recording error details and consuming one retry.
    pub async fn reject(&self, error: impl Into<TaskError>) -> Result<(), WorkerError> {
        self.worker.reject(self.token, error.into()).await
    }
}

struct WatchSub {
    handle: WatchHandle,
    // Dispatcher tasks end on their own once the watch is detached (the
    // sender side drops); the handle is kept so teardown can detach.
    _dispatcher: JoinHandle<()>,
}

struct CurrentTask {
    key: String,
    owner_sub: Option<WatchSub>,
}

struct TimeoutSupervision {
    subs: Vec<WatchSub>,
    timers: HashMap<String, JoinHandle<()>>,
    owners: HashMap<String, Option<String>>,
}

struct WorkerState {
    busy: bool,
    task_number: u64,
    spec: Option<TaskSpec>,
    current: Option<CurrentTask>,
    claim_sub: Option<WatchSub>,
    timeouts: Option<TimeoutSupervision>,
    shutdown: Option<(watch::Sender<bool>, watch::Receiver<bool>)>,
}

struct WorkerInner {
    weak: Weak<WorkerInner>,
    store: Arc<dyn TreeStore>,
    tasks_path: TreePath,
    worker_id: String,
    options: WorkerOptions,
    processing: ProcessingFn,
    state: Mutex<WorkerState>,
}

/// A single queue worker
///
/// Created by [`Queue`](crate::Queue); constructable directly for tests and
/// custom pool management. Cloning yields another reference to the same
/// worker.
#[derive(Clone)]
pub struct QueueWorker {
    inner: Arc<WorkerInner>,
}

impl QueueWorker {
    /// Create a worker for the task collection at `tasks_path`.
    ///
    /// The worker does nothing until [`set_task_spec`](Self::set_task_spec)
    /// hands it a valid spec.
    pub fn new(
        store: Arc<dyn TreeStore>,
        tasks_path: TreePath,
        queue_id: &str,
        options: WorkerOptions,
        processing: ProcessingFn,
    ) -> Self {
        let worker_id = format!("{}:{}", queue_id, Uuid::new_v4());
        let inner = Arc::new_cyclic(|weak| WorkerInner {
            weak: weak.clone(),
            store,
            tasks_path,
            worker_id,
            options,
            processing,
            state: Mutex::new(WorkerState {
                busy: false,
                task_number: 0,
                spec: None,
                current: None,
                claim_sub: None,
                timeouts: None,
                shutdown: None,
            }),
        });
        Self { inner }
    }

    /// This worker's unique id
    pub fn id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Apply a new task spec (or none), tearing down and rebuilding the
    /// worker's watches and timers.
    ///
    /// Always increments the fencing token, so capabilities handed out under
    /// the previous spec become no-ops. A spec that fails validation leaves
    /// the worker not listening for tasks.
    #[instrument(skip_all, fields(worker_id = %self.inner.worker_id))]
    pub async fn set_task_spec(&self, spec: Option<TaskSpec>) {
        self.inner.apply_task_spec(spec).await;
    }

    /// Attempt to claim and process the next matching task.
    ///
    /// Normally driven by the worker's own watch; exposed so callers can
    /// nudge an idle worker.
    pub async fn try_to_process(&self) -> Result<(), WorkerError> {
        self.inner.try_to_process().await
    }

    /// Gracefully shut down this worker.
    ///
    /// Completes immediately when idle. When busy, completes once the
    /// in-flight processing function fulfills its task. Repeated calls await
    /// the same completion.
    pub async fn shutdown(&self) {
        let created = {
            let mut state = self.inner.state.lock();
            if state.shutdown.is_some() {
                false
            } else {
                let (tx, rx) = watch::channel(false);
                state.shutdown = Some((tx, rx));
                true
            }
        };

        if created {
            debug!(worker_id = %self.inner.worker_id, "shutting down");
            let idle = !self.inner.state.lock().busy;
            if idle {
                self.inner.apply_task_spec(None).await;
                debug!(worker_id = %self.inner.worker_id, "finished shutdown");
                let tx = self
                    .inner
                    .state
                    .lock()
                    .shutdown
                    .as_ref()
                    .map(|(tx, _)| tx.clone());
                if let Some(tx) = tx {
                    let _ = tx.send(true);
                }
            }
        }

        let mut rx = match &self.inner.state.lock().shutdown {
            Some((_, rx)) => rx.clone(),
            None => return,
        };
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl WorkerInner {
    fn owner_token(&self, task_number: u64) -> String {
        format!("{}:{}", self.worker_id, task_number)
    }

    fn upgrade(weak: &Weak<WorkerInner>) -> Option<Arc<WorkerInner>> {
        weak.upgrade()
    }

    /// Run one transaction under the bounded retry policy.
    async fn run_txn(
        &self,
        path: &TreePath,
        operation: &'static str,
        update: &mut TxnUpdate<'_>,
    ) -> Result<TxnOutcome, WorkerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.transaction(path, update).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    if self.options.backoff.has_attempts_remaining(attempt) {
                        debug!(
                            worker_id = %self.worker_id,
                            operation,
                            error = %err,
                            "transaction errored, retrying"
                        );
                        let delay = self.options.backoff.delay_for_attempt(attempt);
                        if delay.is_zero() {
                            tokio::task::yield_now().await;
                        } else {
                            tokio::time::sleep(delay).await;
                        }
                    } else {
                        debug!(
                            worker_id = %self.worker_id,
                            operation,
                            error = %err,
                            "transaction errored too many times, no longer retrying"
                        );
                        return Err(WorkerError::RetriesExhausted {
                            operation,
                            source: err,
                        });
                    }
                }
            }
        }
    }

    fn spawn_try_to_process(&self) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            if let Some(inner) = Self::upgrade(&weak) {
                if let Err(err) = inner.try_to_process().await {
                    debug!(error = %err, "claim attempt did not complete");
                }
            }
        });
    }

    /// Return a task to its start state.
    ///
    /// `immediate` resets require only the in-progress state (used to give
    /// back a task this worker raced into); timeout resets additionally
    /// require the configured timeout to have elapsed since `_state_changed`.
    /// Neither checks `_owner`: reclamation polices all workers' claims.
    async fn reset_task(&self, key: &str, immediate: bool) -> Result<(), WorkerError> {
        let spec = self.state.lock().spec.clone();
        let Some(spec) = spec else {
            return Ok(());
        };
        self.reset_task_with(key, immediate, &spec).await
    }

    async fn reset_task_with(
        &self,
        key: &str,
        immediate: bool,
        spec: &TaskSpec,
    ) -> Result<(), WorkerError> {
        let path = self.tasks_path.child(key);
        let in_progress = spec.in_progress_state.clone();
        let start_state = spec.start_state.clone();
        let timeout_ms = spec.timeout.map(|t| t.as_millis() as i64);

        let outcome = self
            .run_txn(&path, "reset task", &mut |cur| {
                let Some(tsk) = cur else {
                    return TxnDecision::Abort;
                };
                if task::state(tsk) != Some(in_progress.as_str()) {
                    return TxnDecision::Abort;
                }
                let timed_out = immediate
                    || timeout_ms.is_some_and(|timeout| {
                        let since = Utc::now().timestamp_millis()
                            - task::state_changed_ms(tsk).unwrap_or(0);
                        since > timeout
                    });
                if !timed_out {
                    return TxnDecision::Abort;
                }

                let mut next = tsk.as_object().cloned().unwrap_or_default();
                next.insert(
                    keys::STATE.to_string(),
                    start_state.clone().map_or(Value::Null, Value::String),
                );
                next.insert(keys::STATE_CHANGED.to_string(), server_timestamp());
                next.insert(keys::OWNER.to_string(), Value::Null);
                next.insert(keys::PROGRESS.to_string(), Value::Null);
                next.insert(keys::ERROR_DETAILS.to_string(), Value::Null);
                TxnDecision::Set(Value::Object(next))
            })
            .await?;

        if outcome.committed_existing() {
            debug!(worker_id = %self.worker_id, key, "reset task");
        }
        Ok(())
    }

    /// Claim-loop entry point: triggered by the start-state watch and by
    /// every transition back to idle.
    async fn try_to_process(&self) -> Result<(), WorkerError> {
        enum Next {
            Idle,
            Shutdown(watch::Sender<bool>),
            Claim(TaskSpec),
        }

        let next = {
            let state = self.state.lock();
            if state.busy {
                Next::Idle
            } else if let Some((tx, _)) = &state.shutdown {
                Next::Shutdown(tx.clone())
            } else if let Some(spec) = &state.spec {
                Next::Claim(spec.clone())
            } else {
                Next::Idle
            }
        };

        match next {
            Next::Idle => Ok(()),
            Next::Shutdown(tx) => {
                self.apply_task_spec(None).await;
                debug!(worker_id = %self.worker_id, "finished shutdown");
                let _ = tx.send(true);
                Err(WorkerError::ShuttingDown)
            }
            Next::Claim(spec) => self.claim_next(&spec).await,
        }
    }

    async fn claim_next(&self, spec: &TaskSpec) -> Result<(), WorkerError> {
        let start_value = spec
            .start_state
            .clone()
            .map_or(Value::Null, Value::String);
        let query = ChildQuery::equal_to(self.tasks_path.clone(), keys::STATE, start_value.clone())
            .limit_to_first(1);

        let candidates = self.store.query_first(&query).await?;
        let Some((key, _)) = candidates.into_iter().next() else {
            return Ok(());
        };

        let path = self.tasks_path.child(&key);
        let claim_owner = {
            let state = self.state.lock();
            self.owner_token(state.task_number + 1)
        };

        let mut malformed = false;
        let in_progress = spec.in_progress_state.clone();
        let error_state = spec.error_state.clone();
        let suppress_stack = self.options.suppress_stack;

        let outcome = self
            .run_txn(&path, "claim task", &mut |cur| {
                let Some(tsk) = cur else {
                    return TxnDecision::Abort;
                };
                if !tsk.is_object() {
                    // Consume the malformed record out of the candidate pool
                    malformed = true;
                    let details = ErrorDetails {
                        error: Some("Task was malformed".to_string()),
                        error_stack: (!suppress_stack)
                            .then(|| Backtrace::force_capture().to_string()),
                        original_task: Some(tsk.clone()),
                        ..ErrorDetails::default()
                    };
                    let mut next = Map::new();
                    next.insert(keys::STATE.to_string(), Value::String(error_state.clone()));
                    next.insert(keys::STATE_CHANGED.to_string(), server_timestamp());
                    next.insert(
                        keys::ERROR_DETAILS.to_string(),
                        serde_json::to_value(details).unwrap_or(Value::Null),
                    );
                    return TxnDecision::Set(Value::Object(next));
                }
                // Strict JSON comparison: a non-string `_state` never matches,
                // even under a null start state
                if tsk.get(keys::STATE).unwrap_or(&Value::Null) != &start_value {
                    return TxnDecision::Abort;
                }
                let mut next = tsk.as_object().cloned().unwrap_or_default();
                next.insert(
                    keys::STATE.to_string(),
                    Value::String(in_progress.clone()),
                );
                next.insert(keys::STATE_CHANGED.to_string(), server_timestamp());
                next.insert(keys::OWNER.to_string(), Value::String(claim_owner.clone()));
                next.insert(keys::PROGRESS.to_string(), Value::from(0));
                TxnDecision::Set(Value::Object(next))
            })
            .await?;

        if !outcome.committed_existing() {
            debug!(
                worker_id = %self.worker_id,
                %key,
                "task no longer in expected start state"
            );
            return Ok(());
        }
        if malformed {
            debug!(worker_id = %self.worker_id, %key, "found malformed entry");
            return Ok(());
        }

        let won = {
            let mut state = self.state.lock();
            if state.busy {
                false
            } else {
                state.busy = true;
                state.task_number += 1;
                true
            }
        };
        if !won {
            // A parallel claim on this worker won while the transaction was
            // in flight; give the task back so another worker can take it.
            if let Err(err) = self.reset_task(&key, true).await {
                debug!(error = %err, %key, "failed to give back raced claim");
            }
            return Ok(());
        }

        debug!(worker_id = %self.worker_id, %key, "claimed task");
        self.attach_owner_watch(&key).await;

        let snapshot = outcome.snapshot.unwrap_or(Value::Null);
        let mut data = snapshot;
        if self.options.sanitize {
            task::sanitize(&mut data);
        } else if let Some(map) = data.as_object_mut() {
            map.insert(keys::ID.to_string(), Value::String(key.clone()));
        }

        let token = self.state.lock().task_number;
        let Some(worker) = self.weak.upgrade() else {
            return Ok(());
        };
        self.spawn_processing(data, TaskHandle { worker, token });
        Ok(())
    }

    /// Watch the claimed record's `_owner` so a concurrent loss of ownership
    /// drops our reference and fences the outstanding capabilities.
    async fn attach_owner_watch(&self, key: &str) {
        let path = self.tasks_path.child(key).child(keys::OWNER);
        let owner_sub = match self
            .store
            .watch(WatchTarget::Path(path), WatchEvent::Value)
            .await
        {
            Ok(mut watch) => {
                let handle = watch.handle;
                let weak = self.weak.clone();
                let dispatcher = tokio::spawn(async move {
                    while let Some(notice) = watch.notices.recv().await {
                        let Some(inner) = Self::upgrade(&weak) else {
                            break;
                        };
                        let lost = {
                            let mut state = inner.state.lock();
                            let expected = inner.owner_token(state.task_number);
                            let held = notice.value.as_ref().and_then(Value::as_str)
                                == Some(expected.as_str());
                            if held {
                                None
                            } else {
                                state.current.take()
                            }
                        };
                        if let Some(current) = lost {
                            debug!(
                                worker_id = %inner.worker_id,
                                key = %current.key,
                                "task no longer owned by this process"
                            );
                            if let Some(sub) = current.owner_sub {
                                let _ = inner.store.unwatch(sub.handle).await;
                            }
                            break;
                        }
                    }
                });
                Some(WatchSub {
                    handle,
                    _dispatcher: dispatcher,
                })
            }
            Err(err) => {
                debug!(worker_id = %self.worker_id, error = %err, "errored watching task owner");
                None
            }
        };

        let stale = {
            let mut state = self.state.lock();
            state.current.replace(CurrentTask {
                key: key.to_string(),
                owner_sub,
            })
        };
        if let Some(stale) = stale {
            if let Some(sub) = stale.owner_sub {
                let _ = self.store.unwatch(sub.handle).await;
            }
        }
    }

    fn spawn_processing(&self, data: Value, handle: TaskHandle) {
        let fut = (self.processing)(data, handle.clone());
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            if let Err(join_err) = tokio::spawn(fut).await {
                if join_err.is_panic() {
                    debug!(worker_id = %worker_id, "processing function panicked, rejecting task");
                    let _ = handle
                        .reject(TaskError::new("processing function panicked").with_captured_stack())
                        .await;
                }
            }
        });
    }

    async fn update_progress(&self, token: u64, progress: f64) -> Result<(), WorkerError> {
        if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
            return Err(WorkerError::InvalidProgress);
        }

        let ctx = {
            let state = self.state.lock();
            match (&state.current, &state.spec) {
                (Some(current), Some(spec)) if token == state.task_number => Some((
                    current.key.clone(),
                    spec.in_progress_state.clone(),
                    self.owner_token(state.task_number),
                )),
                _ => None,
            }
        };
        let Some((key, in_progress, id)) = ctx else {
            debug!(
                worker_id = %self.worker_id,
                "can't update progress - no task currently being processed"
            );
            return Err(WorkerError::NoCurrentTask);
        };

        let path = self.tasks_path.child(&key);
        let outcome = self
            .store
            .transaction(&path, &mut |cur| {
                let Some(tsk) = cur else {
                    return TxnDecision::Abort;
                };
                if task::state(tsk) == Some(in_progress.as_str())
                    && task::owner(tsk) == Some(id.as_str())
                {
                    let mut next = tsk.as_object().cloned().unwrap_or_default();
                    next.insert(keys::PROGRESS.to_string(), Value::from(progress));
                    TxnDecision::Set(Value::Object(next))
                } else {
                    TxnDecision::Abort
                }
            })
            .await
            .map_err(|err| {
                debug!(
                    worker_id = %self.worker_id,
                    error = %err,
                    "errored while attempting to update progress"
                );
                WorkerError::ProgressFailed(err)
            })?;

        if outcome.committed_existing() {
            Ok(())
        } else {
            debug!(
                worker_id = %self.worker_id,
                "can't update progress - current task no longer owned by this process"
            );
            Err(WorkerError::OwnershipLost)
        }
    }

    /// Fencing-checked staleness gate shared by resolve and reject.
    ///
    /// A stale call frees the worker and re-triggers claiming; the operation
    /// itself is a silent success.
    fn fulfillment_ctx(&self, token: u64, op: &str) -> Option<(String, TaskSpec)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let (Some(current), Some(spec)) = (&state.current, &state.spec) {
            if token == state.task_number {
                return Some((current.key.clone(), spec.clone()));
            }
        }
        if state.current.is_none() {
            debug!(
                worker_id = %self.worker_id,
                "can't {op} task - no task currently being processed"
            );
        } else {
            debug!(
                worker_id = %self.worker_id,
                "can't {op} task - no longer processing current task"
            );
        }
        state.busy = false;
        None
    }

    async fn resolve(&self, token: u64, output: Option<Value>) -> Result<(), WorkerError> {
        let Some((key, spec)) = self.fulfillment_ctx(token, "resolve") else {
            self.spawn_try_to_process();
            return Ok(());
        };

        let path = self.tasks_path.child(&key);
        let id = self.owner_token(token);
        let in_progress = spec.in_progress_state.clone();
        let finished = spec.finished_state.clone();
        let mut existed = false;

        let result = self
            .run_txn(&path, "resolve task", &mut |cur| {
                existed = cur.is_some();
                let Some(tsk) = cur else {
                    return TxnDecision::Abort;
                };
                if task::state(tsk) != Some(in_progress.as_str())
                    || task::owner(tsk) != Some(id.as_str())
                {
                    return TxnDecision::Abort;
                }

                let mut next = task::as_object(output.clone());
                let next_state = match next.remove(keys::NEW_STATE) {
                    Some(Value::String(s)) => Value::String(s),
                    Some(Value::Null) => Value::Null,
                    // Explicit false deletes even when a finished state exists
                    Some(Value::Bool(false)) => return TxnDecision::Remove,
                    _ => match &finished {
                        None => return TxnDecision::Remove,
                        Some(f) => Value::String(f.clone()),
                    },
                };
                next.insert(keys::STATE.to_string(), next_state);
                next.insert(keys::STATE_CHANGED.to_string(), server_timestamp());
                next.insert(keys::OWNER.to_string(), Value::Null);
                next.insert(keys::PROGRESS.to_string(), Value::from(100));
                next.insert(keys::ERROR_DETAILS.to_string(), Value::Null);
                TxnDecision::Set(Value::Object(next))
            })
            .await;

        let outcome = result?;
        if outcome.committed && existed {
            debug!(worker_id = %self.worker_id, %key, "completed task");
        } else {
            debug!(
                worker_id = %self.worker_id,
                %key,
                "can't resolve task - current task no longer owned by this process"
            );
        }

        self.state.lock().busy = false;
        self.spawn_try_to_process();
        Ok(())
    }

    async fn reject(&self, token: u64, error: TaskError) -> Result<(), WorkerError> {
        let Some((key, spec)) = self.fulfillment_ctx(token, "reject") else {
            self.spawn_try_to_process();
            return Ok(());
        };

        let path = self.tasks_path.child(&key);
        let id = self.owner_token(token);
        let in_progress = spec.in_progress_state.clone();
        let start_state = spec.start_state.clone();
        let error_state = spec.error_state.clone();
        let retries = spec.retries;
        let error_string = error.message.clone();
        let error_stack = if self.options.suppress_stack {
            None
        } else {
            error.stack.clone()
        };
        let mut existed = false;

        let result = self
            .run_txn(&path, "reject task", &mut |cur| {
                existed = cur.is_some();
                let Some(tsk) = cur else {
                    return TxnDecision::Abort;
                };
                if task::state(tsk) != Some(in_progress.as_str())
                    || task::owner(tsk) != Some(id.as_str())
                {
                    return TxnDecision::Abort;
                }

                // Prior attempts only count while they accumulated under the
                // same in-progress state; a spec change resets the counter.
                let details = task::error_details(tsk).unwrap_or_default();
                let attempts = if details.attempts > 0
                    && details.previous_state.as_deref() == Some(in_progress.as_str())
                {
                    details.attempts
                } else {
                    0
                };

                let next_state = if attempts >= retries {
                    Value::String(error_state.clone())
                } else {
                    start_state.clone().map_or(Value::Null, Value::String)
                };

                let next_details = ErrorDetails {
                    previous_state: Some(in_progress.clone()),
                    error: error_string.clone(),
                    error_stack: error_stack.clone(),
                    attempts: attempts + 1,
                    original_task: None,
                };

                let mut next = tsk.as_object().cloned().unwrap_or_default();
                next.insert(keys::STATE.to_string(), next_state);
                next.insert(keys::STATE_CHANGED.to_string(), server_timestamp());
                next.insert(keys::OWNER.to_string(), Value::Null);
                next.insert(
                    keys::ERROR_DETAILS.to_string(),
                    serde_json::to_value(next_details).unwrap_or(Value::Null),
                );
                TxnDecision::Set(Value::Object(next))
            })
            .await;

        let outcome = result?;
        if outcome.committed && existed {
            debug!(worker_id = %self.worker_id, %key, "recorded task rejection");
        } else {
            debug!(
                worker_id = %self.worker_id,
                %key,
                "can't reject task - current task no longer owned by this process"
            );
        }

        self.state.lock().busy = false;
        self.spawn_try_to_process();
        Ok(())
    }

    fn apply_task_spec(&self, spec: Option<TaskSpec>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
        let validated = spec.filter(|s| match s.validate() {
            Ok(()) => true,
            Err(err) => {
                debug!(
                    worker_id = %self.worker_id,
                    error = %err,
                    "invalid task spec, not listening for new tasks"
                );
                false
            }
        });

        // Fence outstanding capabilities and detach the previous watches
        let (claim_sub, current, old_spec) = {
            let mut state = self.state.lock();
            state.task_number += 1;
            (state.claim_sub.take(), state.current.take(), state.spec.clone())
        };
        if let Some(sub) = claim_sub {
            let _ = self.store.unwatch(sub.handle).await;
        }
        if let Some(current) = current {
            if let Some(sub) = current.owner_sub {
                let _ = self.store.unwatch(sub.handle).await;
            }
            if let Some(old_spec) = &old_spec {
                if let Err(err) = self.reset_task_with(&current.key, true, old_spec).await {
                    debug!(error = %err, key = %current.key, "failed to reset task on spec change");
                }
            }
        }

        self.state.lock().spec = validated.clone();

        if let Some(spec) = &validated {
            let start_value = spec
                .start_state
                .clone()
                .map_or(Value::Null, Value::String);
            let query = ChildQuery::equal_to(self.tasks_path.clone(), keys::STATE, start_value)
                .limit_to_first(1);
            match self
                .store
                .watch(WatchTarget::Query(query), WatchEvent::ChildAdded)
                .await
            {
                Ok(mut watch) => {
                    let handle = watch.handle;
                    let weak = self.weak.clone();
                    let dispatcher = tokio::spawn(async move {
                        while watch.notices.recv().await.is_some() {
                            let Some(inner) = Self::upgrade(&weak) else {
                                break;
                            };
                            if let Err(err) = inner.try_to_process().await {
                                debug!(error = %err, "claim attempt did not complete");
                            }
                        }
                    });
                    self.state.lock().claim_sub = Some(WatchSub {
                        handle,
                        _dispatcher: dispatcher,
                    });
                    debug!(worker_id = %self.worker_id, "listening for new tasks");
                }
                Err(err) => {
                    debug!(worker_id = %self.worker_id, error = %err, "errored listening to store");
                }
            }
        }

        self.setup_timeouts().await;
        })
    }

    /// Rebuild the timeout supervision for the current spec.
    ///
    /// When the spec defines a timeout, every worker polices all in-progress
    /// records for that spec, whoever owns them.
    async fn setup_timeouts(&self) {
        let old = self.state.lock().timeouts.take();
        if let Some(supervision) = old {
            for sub in supervision.subs {
                let _ = self.store.unwatch(sub.handle).await;
            }
            for (_, timer) in supervision.timers {
                timer.abort();
            }
        }

        let in_progress = {
            let state = self.state.lock();
            state
                .spec
                .as_ref()
                .filter(|s| s.timeout.is_some())
                .map(|s| s.in_progress_state.clone())
        };
        let Some(in_progress) = in_progress else {
            return;
        };

        let query = ChildQuery::equal_to(
            self.tasks_path.clone(),
            keys::STATE,
            Value::String(in_progress),
        );

        let added = self
            .store
            .watch(WatchTarget::Query(query.clone()), WatchEvent::ChildAdded)
            .await;
        let removed = self
            .store
            .watch(WatchTarget::Query(query.clone()), WatchEvent::ChildRemoved)
            .await;
        let changed = self
            .store
            .watch(WatchTarget::Query(query), WatchEvent::ChildChanged)
            .await;
        let (mut added, mut removed, mut changed) = match (added, removed, changed) {
            (Ok(a), Ok(r), Ok(c)) => (a, r, c),
            _ => {
                debug!(worker_id = %self.worker_id, "errored listening to store");
                return;
            }
        };
        let (added_handle, removed_handle, changed_handle) =
            (added.handle, removed.handle, changed.handle);

        let weak = self.weak.clone();
        let added_dispatcher = tokio::spawn(async move {
            while let Some(notice) = added.notices.recv().await {
                let Some(inner) = Self::upgrade(&weak) else {
                    break;
                };
                inner.schedule_expiry(&notice.key, notice.value.as_ref());
            }
        });

        let weak = self.weak.clone();
        let removed_dispatcher = tokio::spawn(async move {
            while let Some(notice) = removed.notices.recv().await {
                let Some(inner) = Self::upgrade(&weak) else {
                    break;
                };
                let mut state = inner.state.lock();
                if let Some(supervision) = state.timeouts.as_mut() {
                    if let Some(timer) = supervision.timers.remove(&notice.key) {
                        timer.abort();
                    }
                    supervision.owners.remove(&notice.key);
                }
            }
        });

        let weak = self.weak.clone();
        let changed_dispatcher = tokio::spawn(async move {
            while let Some(notice) = changed.notices.recv().await {
                let Some(inner) = Self::upgrade(&weak) else {
                    break;
                };
                // Catches server-coalesced remove+add sequences: an owner
                // handoff re-derives the timer exactly once.
                let owner_changed = {
                    let state = inner.state.lock();
                    let new_owner = notice
                        .value
                        .as_ref()
                        .and_then(task::owner)
                        .map(str::to_string);
                    state
                        .timeouts
                        .as_ref()
                        .is_some_and(|s| s.owners.get(&notice.key) != Some(&new_owner))
                };
                if owner_changed {
                    inner.schedule_expiry(&notice.key, notice.value.as_ref());
                }
            }
        });

        let supervision = TimeoutSupervision {
            subs: vec![
                WatchSub {
                    handle: added_handle,
                    _dispatcher: added_dispatcher,
                },
                WatchSub {
                    handle: removed_handle,
                    _dispatcher: removed_dispatcher,
                },
                WatchSub {
                    handle: changed_handle,
                    _dispatcher: changed_dispatcher,
                },
            ],
            timers: HashMap::new(),
            owners: HashMap::new(),
        };
        self.state.lock().timeouts = Some(supervision);
    }

    /// Arm (or re-arm) the expiry timer for one in-progress record.
    fn schedule_expiry(&self, key: &str, value: Option<&Value>) {
        let mut state = self.state.lock();
        let Some(timeout) = state.spec.as_ref().and_then(|s| s.timeout) else {
            return;
        };
        let Some(supervision) = state.timeouts.as_mut() else {
            return;
        };

        let now = Utc::now().timestamp_millis();
        let started = value.and_then(task::state_changed_ms).unwrap_or(now);
        let expires_in = (started + timeout.as_millis() as i64 - now).max(0) as u64;
        let owner = value.and_then(task::owner).map(str::to_string);
        supervision.owners.insert(key.to_string(), owner);

        let weak = self.weak.clone();
        let key_owned = key.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(expires_in)).await;
            if let Some(inner) = Self::upgrade(&weak) {
                if let Err(err) = inner.reset_task(&key_owned, false).await {
                    debug!(error = %err, key = %key_owned, "timeout reset did not complete");
                }
            }
        });
        if let Some(previous) = supervision.timers.insert(key.to_string(), timer) {
            previous.abort();
        }
    }
}
