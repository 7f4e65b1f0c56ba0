// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background reconciliation of operation records.
//!
//! Every `maintainer_retry_interval` the maintainer:
//! 1. fails IN_PROGRESS operations not touched for `action_timeout` (their worker is gone);
//! 2. gives up resuming reschedulable failures older than `rescheduling_timeout`;
//! 3. resubmits the remaining reschedulable failures to the scheduler;
//! 4. hands compensating actions for operations with `deletion_scheduled` set
//!    to the scheduler's pools.
//!
//! Resumption needs at least one registered resumer and mitigation a
//! mitigator for the resource type; without them those operations are left
//! as they are for a process that has them.
//!
//! Every `cleanup_interval` it deletes terminal operations older than
//! `lifespan`, batch by batch, keeping the latest operation of every resource
//! that still exists.
//!
//! All writes are compare-and-set against the snapshot that was read, so a
//! worker finishing concurrently always wins.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperationsConfig;
use crate::error::{Error, Result};
use crate::interceptable::InterceptableRepository;
use crate::interceptors::InterceptContext;
use crate::object::Criterion;
use crate::operation::{FailurePolicy, Operation, OperationError, OperationFilter, OperationState};
use crate::persistence::Repository;
use crate::recovery::{ActionRegistry, OrphanMitigator};
use crate::scheduler::{Job, Scheduler, SchedulerError};

/// Work done by one maintenance cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// IN_PROGRESS operations failed as stale.
    pub stale_failed: usize,
    /// Reschedulable failures that ran out of time.
    pub rescheduling_stopped: usize,
    /// Operations resubmitted to the scheduler.
    pub resumed: usize,
    /// Orphan mitigations handed to the scheduler.
    pub mitigated: usize,
}

impl CycleReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodic reconciliation loop over operation records.
pub struct Maintainer {
    repository: Arc<dyn Repository>,
    interceptable: InterceptableRepository,
    scheduler: Scheduler,
    actions: ActionRegistry,
    config: OperationsConfig,
    shutdown: Arc<Notify>,
    mitigating: Arc<Mutex<HashSet<String>>>,
}

impl Maintainer {
    /// Create a maintainer sharing the scheduler's settings.
    pub fn new(
        interceptable: InterceptableRepository,
        scheduler: Scheduler,
        actions: ActionRegistry,
    ) -> Self {
        Self {
            repository: interceptable.repository().clone(),
            config: scheduler.config().clone(),
            interceptable,
            scheduler,
            actions,
            shutdown: Arc::new(Notify::new()),
            mitigating: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Compensating actions currently running on the scheduler.
    pub fn mitigations_in_flight(&self) -> usize {
        self.mitigating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run both timers until shutdown is signalled.
    ///
    /// The first maintenance cycle runs immediately, picking up whatever a
    /// previous process left behind.
    pub async fn run(&self) {
        info!(
            retry_interval_secs = self.config.maintainer_retry_interval.as_secs(),
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            action_timeout_secs = self.config.action_timeout.as_secs(),
            lifespan_secs = self.config.lifespan.as_secs(),
            "Maintainer started"
        );
        if !self.actions.has_resumers() {
            info!("No resumers registered, reschedulable operations are left untouched");
        }

        let mut retry = tokio::time::interval(self.config.maintainer_retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Maintainer received shutdown signal");
                    break;
                }

                _ = retry.tick() => {
                    self.run_cycle().await;
                }

                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup_operations().await {
                        error!(error = %e, "Failed to clean up old operations");
                    }
                }
            }
        }

        info!("Maintainer stopped");
    }

    /// One pass of stale detection, rescheduling timeout, resumption and
    /// orphan mitigation. A failing step is logged and the next one still runs.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        let report = CycleReport {
            stale_failed: self
                .fail_stale_operations()
                .await
                .unwrap_or_else(|e| log_step_error("stale detection", e)),
            rescheduling_stopped: self
                .stop_expired_rescheduling()
                .await
                .unwrap_or_else(|e| log_step_error("rescheduling timeout", e)),
            resumed: self
                .resume_operations()
                .await
                .unwrap_or_else(|e| log_step_error("resumption", e)),
            mitigated: self
                .mitigate_orphans()
                .await
                .unwrap_or_else(|e| log_step_error("orphan mitigation", e)),
        };

        if report.is_empty() {
            debug!("Maintenance cycle completed, nothing to do");
        } else {
            info!(
                stale_failed = report.stale_failed,
                rescheduling_stopped = report.rescheduling_stopped,
                resumed = report.resumed,
                mitigated = report.mitigated,
                "Maintenance cycle completed"
            );
        }
        report
    }

    /// Fail IN_PROGRESS operations whose `updated_at` is older than `action_timeout`.
    ///
    /// Uses the timeout policy: resumable operations are rescheduled, the rest
    /// get orphan mitigation where their category allows it.
    pub async fn fail_stale_operations(&self) -> Result<usize> {
        let filter = OperationFilter {
            state: Some(OperationState::InProgress),
            updated_before: Some(ago(self.config.action_timeout)?),
            limit: Some(self.config.delete_operations_batch_size),
            ..Default::default()
        };

        let mut failed = 0;
        for operation in self.repository.list_operations(&filter).await? {
            let policy = FailurePolicy::for_timeout(&operation);
            let error = OperationError::new(
                "OperationStale",
                format!(
                    "operation did not finish within {:?}, its worker is gone",
                    self.config.action_timeout
                ),
            );
            let next = operation.fail(error, policy)?;

            if self.repository.transition(&operation, &next).await? {
                warn!(
                    operation_id = %operation.id,
                    resource_id = %operation.resource_id,
                    policy = ?policy,
                    "Failed stale operation"
                );
                failed += 1;
            } else {
                debug!(operation_id = %operation.id, "Stale operation finished concurrently");
            }
        }
        Ok(failed)
    }

    /// Stop resuming reschedulable failures created before `rescheduling_timeout`.
    pub async fn stop_expired_rescheduling(&self) -> Result<usize> {
        let filter = OperationFilter {
            created_before: Some(ago(self.config.rescheduling_timeout)?),
            ..reschedulable_filter(self.config.delete_operations_batch_size)
        };

        let mut stopped = 0;
        for operation in self.repository.list_operations(&filter).await? {
            let error = OperationError::new(
                "ReschedulingTimeout",
                format!(
                    "gave up resuming after {:?}{}",
                    self.config.rescheduling_timeout,
                    last_error_suffix(&operation)
                ),
            );
            if self.give_up(&operation, error).await? {
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    /// Resubmit reschedulable failures to the scheduler.
    ///
    /// Does nothing while no resumer is registered at all. Otherwise an
    /// operation without a resumer for its type is treated as not resumable.
    /// Stops early when the scheduler is overloaded.
    pub async fn resume_operations(&self) -> Result<usize> {
        if !self.actions.has_resumers() {
            return Ok(0);
        }
        let filter = reschedulable_filter(self.config.delete_operations_batch_size);

        let mut resumed = 0;
        for operation in self.repository.list_operations(&filter).await? {
            let Some(resumer) = self.actions.resumer(&operation) else {
                warn!(
                    operation_id = %operation.id,
                    resource_type = %operation.resource_type,
                    operation_type = %operation.operation_type,
                    "No resumer registered, operation is not resumable"
                );
                let error = OperationError::new(
                    "NotResumable",
                    format!(
                        "no resumer registered for {} {}{}",
                        operation.resource_type,
                        operation.operation_type,
                        last_error_suffix(&operation)
                    ),
                );
                self.give_up(&operation, error).await?;
                continue;
            };

            let job = Job::from_action(operation.clone(), resumer.resume(&operation));
            match self.scheduler.schedule(job).await {
                Ok(()) => {
                    info!(operation_id = %operation.id, "Resumed operation");
                    resumed += 1;
                }
                Err(SchedulerError::Overloaded { pool }) => {
                    debug!(pool = %pool, "Scheduler overloaded, resuming in the next cycle");
                    break;
                }
                Err(SchedulerError::Storage(e)) => return Err(e),
                Err(e) => {
                    debug!(operation_id = %operation.id, error = %e, "Operation not resumed");
                }
            }
        }
        Ok(resumed)
    }

    /// Start compensating actions for operations with `deletion_scheduled`
    /// set, on the pool of their resource type. Returns how many were started.
    ///
    /// Once the mitigator succeeds the orphaned resource record is deleted
    /// through the interceptor chain and the flag is cleared; the original
    /// error stays. Without a registered mitigator, or when the mitigator
    /// fails or times out, the flag stays for a later cycle. Operations whose
    /// mitigation is still running are skipped. Stops early when the
    /// scheduler is overloaded.
    pub async fn mitigate_orphans(&self) -> Result<usize> {
        let filter = OperationFilter {
            state: Some(OperationState::Failed),
            deletion_scheduled: Some(true),
            limit: Some(self.config.delete_operations_batch_size),
            ..Default::default()
        };

        let mut started = 0;
        for operation in self.repository.list_operations(&filter).await? {
            let Some(mitigator) = self.actions.mitigator(&operation).cloned() else {
                warn!(
                    operation_id = %operation.id,
                    resource_type = %operation.resource_type,
                    "No orphan mitigator registered, operation stays flagged"
                );
                continue;
            };
            let Some(claim) = MitigationClaim::acquire(&self.mitigating, &operation.id) else {
                debug!(operation_id = %operation.id, "Mitigation still running");
                continue;
            };

            let interceptable = self.interceptable.clone();
            let flagged = operation.clone();
            let task = async move {
                let _claim = claim;
                mitigate(&interceptable, mitigator.as_ref(), &flagged).await;
            };

            match self.scheduler.spawn_compensation(&operation, task).await {
                Ok(()) => {
                    debug!(operation_id = %operation.id, "Orphan mitigation started");
                    started += 1;
                }
                Err(SchedulerError::Overloaded { pool }) => {
                    debug!(pool = %pool, "Scheduler overloaded, mitigating in the next cycle");
                    break;
                }
                Err(SchedulerError::Storage(e)) => return Err(e),
                Err(e) => {
                    debug!(operation_id = %operation.id, error = %e, "Mitigation not started");
                }
            }
        }
        Ok(started)
    }

    /// Delete terminal operations older than `lifespan`, batch by batch.
    #[instrument(skip(self))]
    pub async fn cleanup_operations(&self) -> Result<u64> {
        let cutoff = ago(self.config.lifespan)?;
        let batch_size = self.config.delete_operations_batch_size;
        let mut total_deleted = 0u64;

        loop {
            let operation_ids = self
                .repository
                .find_expired_operations(cutoff, batch_size)
                .await?;

            if operation_ids.is_empty() {
                break;
            }

            let batch_len = operation_ids.len();
            let deleted = self.repository.delete_operations(&operation_ids).await?;
            total_deleted += deleted;

            debug!(
                batch_size = batch_len,
                deleted = deleted,
                total_deleted = total_deleted,
                "Cleaned up batch of operations"
            );

            // If we got fewer than batch_size, we're done
            if batch_len < batch_size as usize || deleted == 0 {
                break;
            }
        }

        if total_deleted > 0 {
            info!(
                total_deleted = total_deleted,
                cutoff = %cutoff,
                "Operation cleanup cycle completed"
            );
        } else {
            debug!("Operation cleanup cycle completed, no old operations found");
        }

        Ok(total_deleted)
    }

    async fn give_up(&self, operation: &Operation, error: OperationError) -> Result<bool> {
        let next = operation.stop_rescheduling(error)?;
        let applied = self.repository.transition(operation, &next).await?;
        if applied {
            info!(
                operation_id = %operation.id,
                deletion_scheduled = next.awaits_mitigation(),
                "Stopped rescheduling operation"
            );
        }
        Ok(applied)
    }
}

/// Marks an operation's mitigation as running until dropped.
struct MitigationClaim {
    running: Arc<Mutex<HashSet<String>>>,
    operation_id: String,
}

impl MitigationClaim {
    fn acquire(running: &Arc<Mutex<HashSet<String>>>, operation_id: &str) -> Option<Self> {
        let inserted = running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation_id.to_string());
        inserted.then(|| Self {
            running: running.clone(),
            operation_id: operation_id.to_string(),
        })
    }
}

impl Drop for MitigationClaim {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.operation_id);
    }
}

async fn mitigate(
    interceptable: &InterceptableRepository,
    mitigator: &dyn OrphanMitigator,
    operation: &Operation,
) {
    if let Err(e) = mitigator.mitigate(operation).await {
        warn!(
            operation_id = %operation.id,
            error = %e,
            "Orphan mitigation failed, retrying next cycle"
        );
        return;
    }

    if let Err(e) = complete_mitigation(interceptable, operation).await {
        error!(
            operation_id = %operation.id,
            error = %e,
            "Failed to record orphan mitigation, retrying next cycle"
        );
    }
}

/// Delete the orphaned record through the chain, then clear the flag.
async fn complete_mitigation(
    interceptable: &InterceptableRepository,
    operation: &Operation,
) -> Result<bool> {
    let ctx = InterceptContext::for_operation(operation);
    let criteria = vec![Criterion::field_equals("id", operation.resource_id.clone())];
    let removed = interceptable
        .delete(&ctx, operation.resource_type, criteria)
        .await?;

    let next = operation.mitigated()?;
    let applied = interceptable.repository().transition(operation, &next).await?;
    if applied {
        info!(
            operation_id = %operation.id,
            resource_id = %operation.resource_id,
            records_removed = removed.len(),
            "Orphan mitigation completed"
        );
    } else {
        debug!(operation_id = %operation.id, "Operation changed during mitigation");
    }
    Ok(applied)
}

fn reschedulable_filter(limit: i64) -> OperationFilter {
    OperationFilter {
        state: Some(OperationState::Failed),
        reschedule: Some(true),
        deletion_scheduled: Some(false),
        limit: Some(limit),
        ..Default::default()
    }
}

fn last_error_suffix(operation: &Operation) -> String {
    operation
        .error
        .as_ref()
        .map(|e| format!(" (last error: {})", e.description))
        .unwrap_or_default()
}

fn ago(duration: Duration) -> Result<DateTime<Utc>> {
    let duration = chrono::Duration::from_std(duration)
        .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
    Ok(crate::now() - duration)
}

fn log_step_error<T: Default>(step: &str, e: Error) -> T {
    error!(step = step, error = %e, "Maintenance step failed");
    T::default()
}
