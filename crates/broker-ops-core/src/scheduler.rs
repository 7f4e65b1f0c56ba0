// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission-controlled execution of operation actions.
//!
//! A [`Job`] binds an [`Operation`] to an [`Action`]. Submitting it:
//!
//! 1. waits at most `admission_timeout` for a worker slot in the pool of the
//!    operation's resource type, otherwise fails with [`SchedulerError::Overloaded`];
//! 2. moves the operation to IN_PROGRESS with a compare-and-set write;
//! 3. runs the action on a spawned task bounded by `action_timeout`, with
//!    panics caught at the task boundary;
//! 4. records SUCCEEDED or FAILED, again with a compare-and-set write, so a
//!    maintainer that already failed a stale record is never overwritten.
//!
//! | Outcome | Recorded as |
//! |---------|-------------|
//! | `Ok(object)` | SUCCEEDED, resource marked ready for create/update |
//! | `Err(ActionError)` | FAILED with the error's [`FailurePolicy`] |
//! | timeout | FAILED, [`FailurePolicy::for_timeout`] |
//! | panic | FAILED "job interrupted", [`FailurePolicy::Abandon`] |
//!
//! Compensating actions for orphan mitigation share the same pools through
//! [`Scheduler::spawn_compensation`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::config::OperationsConfig;
use crate::error::Error;
use crate::interceptable::InterceptableRepository;
use crate::interceptors::InterceptContext;
use crate::object::{ObjectType, Resource};
use crate::operation::{FailurePolicy, Operation, OperationError, OperationType};
use crate::persistence::Repository;

/// Result of an action: the created or updated resource, if any.
pub type ActionResult = Result<Option<Resource>, ActionError>;

/// Unit of work bound to an operation.
pub type Action = Box<dyn FnOnce(ActionContext) -> BoxFuture<'static, ActionResult> + Send>;

/// What an action gets to work with.
#[derive(Clone)]
pub struct ActionContext {
    operation: Operation,
    repository: InterceptableRepository,
}

impl ActionContext {
    /// Snapshot of the operation as it was moved to IN_PROGRESS.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Storage with the interceptor chain applied to every mutation.
    pub fn repository(&self) -> &InterceptableRepository {
        &self.repository
    }

    /// Hook context carrying the operation's identifiers.
    pub fn intercept_context(&self) -> InterceptContext {
        InterceptContext::for_operation(&self.operation)
    }
}

/// An action failure and how to handle it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ActionError {
    /// Machine-readable kind, stored as the operation error's `error`.
    pub kind: String,
    /// Description stored on the operation.
    pub message: String,
    /// How the maintainer treats the failed operation.
    pub policy: FailurePolicy,
}

impl ActionError {
    /// Partial work is safe to resume; the maintainer retries.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new("ActionFailed", message, FailurePolicy::Reschedule)
    }

    /// The remote side may hold a dangling resource that needs a compensating delete.
    pub fn orphaned(message: impl Into<String>) -> Self {
        Self::new("ActionFailed", message, FailurePolicy::Mitigate)
    }

    /// Clean failure, nothing to undo.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new("ActionFailed", message, FailurePolicy::Abandon)
    }

    /// Replace the machine-readable kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    fn new(kind: &str, message: impl Into<String>, policy: FailurePolicy) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            policy,
        }
    }
}

/// Errors from the interceptor chain or storage rolled back everything they touched.
impl From<Error> for ActionError {
    fn from(err: Error) -> Self {
        Self::new(err.error_code(), err.to_string(), FailurePolicy::Abandon)
    }
}

/// An operation together with the action that carries it out.
pub struct Job {
    operation: Operation,
    action: Action,
}

impl Job {
    /// Bind an action to an operation.
    ///
    /// The operation must already be stored, PENDING or a reschedulable failure.
    pub fn new<F, Fut>(operation: Operation, action: F) -> Self
    where
        F: FnOnce(ActionContext) -> Fut + Send + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        Self {
            operation,
            action: Box::new(move |ctx| action(ctx).boxed()),
        }
    }

    /// Bind an already boxed action.
    pub fn from_action(operation: Operation, action: Action) -> Self {
        Self { operation, action }
    }

    /// The bound operation.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

/// Submission errors. Everything that happens after admission is recorded on
/// the operation instead, except for reconciled submissions.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No worker slot freed up within the admission window.
    #[error("no worker available in pool '{pool}'")]
    Overloaded {
        /// Pool that rejected the job.
        pool: String,
    },

    /// Another operation for the resource is in progress.
    #[error("resource '{resource_id}' already has an operation in progress")]
    ResourceBusy {
        /// The busy resource.
        resource_id: String,
    },

    /// The stored operation no longer matches the submitted snapshot.
    #[error("operation '{operation_id}' was modified concurrently")]
    StaleOperation {
        /// The operation.
        operation_id: String,
    },

    /// A reconciled submission did not finish in time; the action keeps running.
    #[error("operation '{operation_id}' did not finish within the reconciliation timeout")]
    ReconciliationTimeout {
        /// The operation, to poll later.
        operation_id: String,
    },

    /// A reconciled submission finished with a failure.
    #[error("operation '{operation_id}' failed: {}", error.description)]
    ActionFailed {
        /// The operation.
        operation_id: String,
        /// The error recorded on it.
        error: OperationError,
    },

    /// The operation is not in a state that can be started.
    #[error("operation '{operation_id}' cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        /// The operation.
        operation_id: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Storage failed.
    #[error(transparent)]
    Storage(Error),
}

impl SchedulerError {
    /// HTTP-equivalent status for the protocol layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Overloaded { .. } => 503,
            Self::ResourceBusy { .. } => 422,
            Self::StaleOperation { .. } => 409,
            Self::ReconciliationTimeout { .. } => 422,
            Self::ActionFailed { .. } => 422,
            Self::InvalidTransition { .. } => 409,
            Self::Storage(_) => 500,
        }
    }
}

impl From<Error> for SchedulerError {
    fn from(err: Error) -> Self {
        match err {
            Error::ResourceBusy { resource_id } => Self::ResourceBusy { resource_id },
            Error::InvalidTransition {
                operation_id,
                from,
                to,
            } => Self::InvalidTransition {
                operation_id,
                from,
                to,
            },
            other => Self::Storage(other),
        }
    }
}

/// Load of one worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// `default` or the resource type served.
    pub name: String,
    /// Maximum concurrent actions.
    pub capacity: usize,
    /// Actions currently running.
    pub in_use: usize,
    /// Panics caught at the worker boundary since startup.
    pub panics_contained: u64,
    /// Every slot taken and none admitted or released for longer than
    /// `action_timeout`: workers are wedged past their own timeout.
    pub stalled: bool,
}

struct WorkerPool {
    name: String,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    panics_contained: AtomicU64,
    // Last admission or release
    last_progress: Mutex<Instant>,
}

impl WorkerPool {
    fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            panics_contained: AtomicU64::new(0),
            last_progress: Mutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        *self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        drop(permit);
        self.touch();
    }

    fn status(&self, stall_after: Duration) -> PoolStatus {
        let in_use = self
            .capacity
            .saturating_sub(self.semaphore.available_permits());
        let idle_for = self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();

        PoolStatus {
            name: self.name.clone(),
            capacity: self.capacity,
            in_use,
            panics_contained: self.panics_contained.load(Ordering::Relaxed),
            stalled: in_use >= self.capacity && idle_for > stall_after,
        }
    }
}

enum JobOutcome {
    Succeeded(Option<Resource>),
    Failed(OperationError),
    Superseded,
}

struct SchedulerInner {
    repository: Arc<dyn Repository>,
    interceptable: InterceptableRepository,
    config: OperationsConfig,
    default_pool: Arc<WorkerPool>,
    pools: HashMap<ObjectType, Arc<WorkerPool>>,
}

/// Runs operation actions on bounded worker pools.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler with one pool per entry of `config.pools` plus the default pool.
    pub fn new(interceptable: InterceptableRepository, config: OperationsConfig) -> Self {
        let pools = config
            .pools
            .iter()
            .map(|(object_type, size)| (*object_type, WorkerPool::new(object_type.as_str(), *size)))
            .collect();

        Self {
            inner: Arc::new(SchedulerInner {
                repository: interceptable.repository().clone(),
                default_pool: WorkerPool::new("default", config.default_pool_size),
                interceptable,
                config,
                pools,
            }),
        }
    }

    /// Engine settings in use.
    pub fn config(&self) -> &OperationsConfig {
        &self.inner.config
    }

    /// Submit a job and return once it is admitted.
    #[instrument(skip(self, job), fields(operation_id = %job.operation.id, resource_type = %job.operation.resource_type))]
    pub async fn schedule(&self, job: Job) -> Result<(), SchedulerError> {
        self.submit(job).await.map(|_| ())
    }

    /// Submit a job and wait up to `reconciliation_operation_timeout` for its result.
    ///
    /// On timeout the action keeps running and the operation can be polled.
    #[instrument(skip(self, job), fields(operation_id = %job.operation.id, resource_type = %job.operation.resource_type))]
    pub async fn schedule_reconciled(&self, job: Job) -> Result<Option<Resource>, SchedulerError> {
        let operation_id = job.operation.id.clone();
        let outcome = self.submit(job).await?;

        match tokio::time::timeout(self.inner.config.reconciliation_operation_timeout, outcome)
            .await
        {
            Ok(Ok(JobOutcome::Succeeded(object))) => Ok(object),
            Ok(Ok(JobOutcome::Failed(error))) => Err(SchedulerError::ActionFailed {
                operation_id,
                error,
            }),
            Ok(Ok(JobOutcome::Superseded)) => {
                Err(SchedulerError::StaleOperation { operation_id })
            }
            Ok(Err(_)) => Err(SchedulerError::Storage(Error::Other(format!(
                "worker for operation '{}' exited without reporting",
                operation_id
            )))),
            Err(_) => {
                info!("Reconciliation wait elapsed; operation continues in the background");
                Err(SchedulerError::ReconciliationTimeout { operation_id })
            }
        }
    }

    /// Load of every pool, default first.
    pub fn pool_status(&self) -> Vec<PoolStatus> {
        let stall_after = self.inner.config.action_timeout;
        let mut typed: Vec<PoolStatus> = self
            .inner
            .pools
            .values()
            .map(|p| p.status(stall_after))
            .collect();
        typed.sort_by(|a, b| a.name.cmp(&b.name));

        let mut status = Vec::with_capacity(typed.len() + 1);
        status.push(self.inner.default_pool.status(stall_after));
        status.extend(typed);
        status
    }

    fn pool_for(&self, object_type: ObjectType) -> Arc<WorkerPool> {
        self.inner
            .pools
            .get(&object_type)
            .unwrap_or(&self.inner.default_pool)
            .clone()
    }

    /// Run a compensating task for `operation` on its resource type's pool.
    ///
    /// Admission works as for jobs. The task does not move the operation
    /// through its states; it is cut off after `action_timeout` and a panic
    /// is contained and counted like an action's.
    pub async fn spawn_compensation<F>(
        &self,
        operation: &Operation,
        task: F,
    ) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pool = self.pool_for(operation.resource_type);
        let permit = admit(&pool, self.inner.config.admission_timeout).await?;
        let action_timeout = self.inner.config.action_timeout;

        let span = info_span!("compensation", operation_id = %operation.id);
        tokio::spawn(
            async move {
                let run = AssertUnwindSafe(task).catch_unwind();
                match tokio::time::timeout(action_timeout, run).await {
                    Ok(Ok(())) => {}
                    Ok(Err(payload)) => {
                        pool.panics_contained.fetch_add(1, Ordering::Relaxed);
                        error!(
                            panic = %panic_message(payload.as_ref()),
                            pool = %pool.name,
                            "Compensating action panicked"
                        );
                    }
                    Err(_) => {
                        warn!(timeout = ?action_timeout, "Compensating action timed out");
                    }
                }
                pool.release(permit);
            }
            .instrument(span),
        );

        Ok(())
    }

    async fn submit(&self, job: Job) -> Result<oneshot::Receiver<JobOutcome>, SchedulerError> {
        let Job { operation, action } = job;
        let pool = self.pool_for(operation.resource_type);
        let permit = admit(&pool, self.inner.config.admission_timeout).await?;

        let started = operation.start()?;
        if !self.inner.repository.transition(&operation, &started).await? {
            return Err(SchedulerError::StaleOperation {
                operation_id: operation.id,
            });
        }

        info!(
            pool = %pool.name,
            operation_type = %started.operation_type,
            resource_id = %started.resource_id,
            "Operation admitted"
        );

        let (reply, outcome) = oneshot::channel();
        let span = info_span!("operation", operation_id = %started.id);
        tokio::spawn(
            execute(self.inner.clone(), pool, started, action, permit, reply).instrument(span),
        );

        Ok(outcome)
    }
}

async fn admit(
    pool: &Arc<WorkerPool>,
    admission_timeout: Duration,
) -> Result<OwnedSemaphorePermit, SchedulerError> {
    match tokio::time::timeout(admission_timeout, pool.semaphore.clone().acquire_owned()).await {
        Ok(Ok(permit)) => {
            pool.touch();
            Ok(permit)
        }
        Ok(Err(_)) | Err(_) => {
            warn!(pool = %pool.name, capacity = pool.capacity, "Admission rejected, pool is full");
            Err(SchedulerError::Overloaded {
                pool: pool.name.clone(),
            })
        }
    }
}

async fn execute(
    inner: Arc<SchedulerInner>,
    pool: Arc<WorkerPool>,
    operation: Operation,
    action: Action,
    permit: OwnedSemaphorePermit,
    reply: oneshot::Sender<JobOutcome>,
) {
    let ctx = ActionContext {
        operation: operation.clone(),
        repository: inner.interceptable.clone(),
    };
    let run = AssertUnwindSafe(async move { action(ctx).await }).catch_unwind();
    let action_timeout = inner.config.action_timeout;

    let (next, outcome) = match tokio::time::timeout(action_timeout, run).await {
        Ok(Ok(Ok(object))) => {
            let ready = object.is_some() && operation.operation_type != OperationType::Delete;
            (operation.succeed(ready), JobOutcome::Succeeded(object))
        }
        Ok(Ok(Err(action_error))) => {
            warn!(
                error = %action_error,
                policy = ?action_error.policy,
                "Action failed"
            );
            let error = OperationError::new(&action_error.kind, &action_error.message);
            (
                operation.fail(error.clone(), action_error.policy),
                JobOutcome::Failed(error),
            )
        }
        Ok(Err(payload)) => {
            pool.panics_contained.fetch_add(1, Ordering::Relaxed);
            error!(panic = %panic_message(payload.as_ref()), pool = %pool.name, "Action panicked");
            let error = OperationError::new("JobInterrupted", "job interrupted: the action panicked");
            (
                operation.fail(error.clone(), FailurePolicy::Abandon),
                JobOutcome::Failed(error),
            )
        }
        Err(_) => {
            let policy = FailurePolicy::for_timeout(&operation);
            warn!(timeout = ?action_timeout, policy = ?policy, "Action timed out");
            let error = OperationError::new(
                "ActionTimeout",
                format!("action did not complete within {:?}", action_timeout),
            );
            (operation.fail(error.clone(), policy), JobOutcome::Failed(error))
        }
    };

    let outcome = match next {
        Ok(next) => finalize(&inner, &operation, &next, outcome).await,
        Err(e) => {
            error!(error = %e, "Cannot finalize operation");
            JobOutcome::Superseded
        }
    };

    pool.release(permit);
    // The submitter may have stopped waiting
    let _ = reply.send(outcome);
}

async fn finalize(
    inner: &SchedulerInner,
    operation: &Operation,
    next: &Operation,
    outcome: JobOutcome,
) -> JobOutcome {
    match inner.repository.transition(operation, next).await {
        Ok(true) => {
            debug!(state = %next.state, reschedule = next.reschedule, "Operation finalized");
        }
        Ok(false) => {
            warn!("Operation changed while its action was running; result discarded");
            return JobOutcome::Superseded;
        }
        Err(e) => {
            error!(error = %e, "Failed to record operation result");
            return JobOutcome::Superseded;
        }
    }

    if let JobOutcome::Succeeded(Some(object)) = &outcome
        && next.ready
    {
        match inner
            .repository
            .set_resource_ready(object.object_type, &object.id, true)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(resource_id = %object.id, "Resource vanished before it became ready"),
            Err(e) => error!(error = %e, resource_id = %object.id, "Failed to mark resource ready"),
        }
    }

    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
