// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation records and their state machine.
//!
//! # State Machine
//!
//! ```text
//!   PENDING ──(scheduler admits)──► IN_PROGRESS ──┬──► SUCCEEDED
//!                                       ▲         │
//!                                       │         └──► FAILED ─┬─ reschedule=true ──────┐
//!                                       │                      ├─ deletion_scheduled≠0 ─┼─► mitigated, FAILED
//!                                       │                      └─ neither: terminal     │
//!                                       └──────────(maintainer resumes)─────────────────┘
//! ```
//!
//! Every transition returns a new [`Operation`] value with a bumped `updated_at`;
//! storage writes it with a compare-and-set keyed on the previous state and
//! `updated_at`, so two writers racing on the same record cannot both win.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::{Labels, ObjectType};

/// Platform id marking operations that originate in this system rather than a platform.
pub const NATIVE_PLATFORM_ID: &str = "service-manager";

/// Category of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Resource creation.
    Create,
    /// Resource update.
    Update,
    /// Resource deletion.
    Delete,
}

impl OperationType {
    /// Returns the string representation of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parse a type from its storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Whether a failed action of this type may leave a dangling remote side effect.
    pub fn may_orphan(&self) -> bool {
        matches!(self, Self::Create | Self::Delete)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    /// Created, not yet admitted.
    #[serde(rename = "pending")]
    Pending,
    /// Admitted and running on a worker.
    #[serde(rename = "in progress")]
    InProgress,
    /// Finished successfully.
    #[serde(rename = "succeeded")]
    Succeeded,
    /// Finished with an error.
    #[serde(rename = "failed")]
    Failed,
}

impl OperationState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parse a state from its storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in progress" => Some(Self::InProgress),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure detail stored on a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// Machine-readable error kind (e.g. `ActionTimeout`).
    pub error: String,
    /// Human-readable description.
    pub description: String,
}

impl OperationError {
    /// Create a new error detail.
    pub fn new(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            description: description.into(),
        }
    }
}

/// How a failure should be handled after the operation is marked failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Partial work is safe to resume; the maintainer retries the action.
    Reschedule,
    /// The remote side may be left inconsistent; run orphan mitigation where the type allows it.
    Mitigate,
    /// Clean failure, nothing to undo, never retried.
    Abandon,
}

/// Flags written on a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposition {
    /// Value of `reschedule`.
    pub reschedule: bool,
    /// Whether `deletion_scheduled` gets set.
    pub schedule_deletion: bool,
}

impl FailurePolicy {
    /// Map the policy onto operation flags for the given operation type.
    ///
    /// Updates never schedule deletion: there is no mitigating delete for a failed update.
    pub fn disposition(self, operation_type: OperationType) -> Disposition {
        match self {
            Self::Reschedule => Disposition {
                reschedule: true,
                schedule_deletion: false,
            },
            Self::Mitigate => Disposition {
                reschedule: false,
                schedule_deletion: operation_type.may_orphan(),
            },
            Self::Abandon => Disposition {
                reschedule: false,
                schedule_deletion: false,
            },
        }
    }

    /// Policy applied when an action exceeds its timeout or its worker disappeared.
    ///
    /// The operation's `reschedule` flag records whether the action declared its
    /// partial work resumable.
    pub fn for_timeout(operation: &Operation) -> Self {
        if operation.reschedule {
            Self::Reschedule
        } else {
            Self::Mitigate
        }
    }
}

/// Durable record of one lifecycle action against a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique identifier.
    pub id: String,
    /// Resource the operation mutates.
    pub resource_id: String,
    /// Collection of the resource.
    pub resource_type: ObjectType,
    /// Mutation category.
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    /// Current state.
    pub state: OperationState,
    /// Origin of the request.
    pub platform_id: String,
    /// Correlation id propagated from the request.
    pub correlation_id: String,
    /// Whether the maintainer may resume this operation.
    pub reschedule: bool,
    /// Set while a compensating action must still run.
    pub deletion_scheduled: Option<DateTime<Utc>>,
    /// Whether the owning resource is externally visible.
    pub ready: bool,
    /// Labels of the operation record.
    pub labels: Labels,
    /// When the operation was created.
    pub created_at: DateTime<Utc>,
    /// Last write to the record.
    pub updated_at: DateTime<Utc>,
    /// Failure detail.
    pub error: Option<OperationError>,
    /// Free-form description.
    pub description: Option<String>,
}

impl Operation {
    /// Create a pending operation originating in this system.
    pub fn new(
        resource_type: ObjectType,
        resource_id: impl Into<String>,
        operation_type: OperationType,
    ) -> Self {
        let now = crate::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            resource_id: resource_id.into(),
            resource_type,
            operation_type,
            state: OperationState::Pending,
            platform_id: NATIVE_PLATFORM_ID.to_string(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            reschedule: false,
            deletion_scheduled: None,
            ready: false,
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
            error: None,
            description: None,
        }
    }

    /// Set the originating platform.
    pub fn with_platform(mut self, platform_id: impl Into<String>) -> Self {
        self.platform_id = platform_id.into();
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Declare whether the action's partial work is safely resumable.
    pub fn resumable(mut self, resumable: bool) -> Self {
        self.reschedule = resumable;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether the operation originates in this system.
    pub fn is_native(&self) -> bool {
        self.platform_id == NATIVE_PLATFORM_ID
    }

    /// Whether the maintainer may resume the operation.
    pub fn is_reschedulable(&self) -> bool {
        self.state == OperationState::Failed && self.reschedule && self.deletion_scheduled.is_none()
    }

    /// Whether a compensating action is still pending.
    pub fn awaits_mitigation(&self) -> bool {
        self.deletion_scheduled.is_some()
    }

    /// Whether the record will never change again except by deletion.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            OperationState::Succeeded => true,
            OperationState::Failed => !self.reschedule && self.deletion_scheduled.is_none(),
            OperationState::Pending | OperationState::InProgress => false,
        }
    }

    /// Move to IN_PROGRESS, from PENDING or from a reschedulable failure.
    pub fn start(&self) -> Result<Operation> {
        let allowed = self.state == OperationState::Pending || self.is_reschedulable();
        if !allowed {
            return Err(self.invalid(OperationState::InProgress));
        }
        let mut next = self.clone();
        next.state = OperationState::InProgress;
        next.error = None;
        next.touch();
        Ok(next)
    }

    /// Move to SUCCEEDED.
    pub fn succeed(&self, ready: bool) -> Result<Operation> {
        if self.state != OperationState::InProgress {
            return Err(self.invalid(OperationState::Succeeded));
        }
        let mut next = self.clone();
        next.state = OperationState::Succeeded;
        next.reschedule = false;
        next.deletion_scheduled = None;
        next.ready = ready;
        next.error = None;
        next.touch();
        Ok(next)
    }

    /// Move to FAILED, applying the policy's flags.
    pub fn fail(&self, error: OperationError, policy: FailurePolicy) -> Result<Operation> {
        if self.state != OperationState::InProgress {
            return Err(self.invalid(OperationState::Failed));
        }
        let mut next = self.clone();
        next.state = OperationState::Failed;
        next.error = Some(error);
        next.apply(policy);
        Ok(next)
    }

    /// Stop resuming a reschedulable failure and fall back to the non-resumable policy.
    pub fn stop_rescheduling(&self, error: OperationError) -> Result<Operation> {
        if !self.is_reschedulable() {
            return Err(self.invalid(OperationState::Failed));
        }
        let mut next = self.clone();
        next.error = Some(error);
        next.apply(FailurePolicy::Mitigate);
        Ok(next)
    }

    /// Record a successful compensating action. The original error is kept.
    pub fn mitigated(&self) -> Result<Operation> {
        if self.state != OperationState::Failed || self.deletion_scheduled.is_none() {
            return Err(self.invalid(OperationState::Failed));
        }
        let mut next = self.clone();
        next.deletion_scheduled = None;
        next.reschedule = false;
        next.ready = false;
        next.touch();
        Ok(next)
    }

    fn apply(&mut self, policy: FailurePolicy) {
        let disposition = policy.disposition(self.operation_type);
        self.touch();
        self.reschedule = disposition.reschedule;
        self.deletion_scheduled = disposition.schedule_deletion.then_some(self.updated_at);
    }

    /// Bump `updated_at`, strictly increasing even within one clock tick.
    fn touch(&mut self) {
        let now = crate::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
    }

    fn invalid(&self, to: OperationState) -> Error {
        Error::InvalidTransition {
            operation_id: self.id.clone(),
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}

/// Filter options for listing and counting operations.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    /// Filter by resource id.
    pub resource_id: Option<String>,
    /// Filter by resource collection.
    pub resource_type: Option<ObjectType>,
    /// Filter by origin platform.
    pub platform_id: Option<String>,
    /// Filter by state.
    pub state: Option<OperationState>,
    /// Filter by mutation category.
    pub operation_type: Option<OperationType>,
    /// Filter by the `reschedule` flag.
    pub reschedule: Option<bool>,
    /// `Some(true)`: only operations awaiting mitigation; `Some(false)`: only those that are not.
    pub deletion_scheduled: Option<bool>,
    /// Created at or after.
    pub created_after: Option<DateTime<Utc>>,
    /// Created before.
    pub created_before: Option<DateTime<Utc>>,
    /// Updated at or after.
    pub updated_after: Option<DateTime<Utc>>,
    /// Updated before.
    pub updated_before: Option<DateTime<Utc>>,
    /// Maximum rows returned by list queries.
    pub limit: Option<i64>,
}

impl OperationFilter {
    /// Operations of one resource.
    pub fn for_resource(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: Some(resource_id.into()),
            ..Default::default()
        }
    }

    /// Operations in one state.
    pub fn in_state(state: OperationState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }
}
