// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actions the maintainer uses to recover failed operations.
//!
//! A [`Resumer`] rebuilds the action of a reschedulable operation so it can be
//! resubmitted; an [`OrphanMitigator`] runs the compensating delete against
//! the remote system for an operation flagged with `deletion_scheduled`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::object::ObjectType;
use crate::operation::{Operation, OperationType};
use crate::scheduler::{Action, ActionError};

/// Rebuilds the action for a reschedulable operation.
pub trait Resumer: Send + Sync {
    /// Action that resumes `operation`. It must be safe to run again after a partial attempt.
    fn resume(&self, operation: &Operation) -> Action;
}

impl<F> Resumer for F
where
    F: Fn(&Operation) -> Action + Send + Sync,
{
    fn resume(&self, operation: &Operation) -> Action {
        self(operation)
    }
}

/// Compensating action for resources a failed operation may have left behind.
#[async_trait]
pub trait OrphanMitigator: Send + Sync {
    /// Undo the remote side effects of `operation`. An error keeps the
    /// operation flagged for the next maintainer cycle.
    async fn mitigate(&self, operation: &Operation) -> Result<(), ActionError>;
}

/// Resumers per (resource type, operation type) and mitigators per resource type.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    resumers: HashMap<(ObjectType, OperationType), Arc<dyn Resumer>>,
    mitigators: HashMap<ObjectType, Arc<dyn OrphanMitigator>>,
}

impl ActionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register how to resume `operation_type` operations on `object_type`.
    pub fn with_resumer(
        mut self,
        object_type: ObjectType,
        operation_type: OperationType,
        resumer: impl Resumer + 'static,
    ) -> Self {
        self.resumers
            .insert((object_type, operation_type), Arc::new(resumer));
        self
    }

    /// Register the compensating action for `object_type`.
    pub fn with_mitigator(
        mut self,
        object_type: ObjectType,
        mitigator: impl OrphanMitigator + 'static,
    ) -> Self {
        self.mitigators.insert(object_type, Arc::new(mitigator));
        self
    }

    /// Whether any resumer is registered.
    pub fn has_resumers(&self) -> bool {
        !self.resumers.is_empty()
    }

    /// Resumer for an operation, if one is registered.
    pub fn resumer(&self, operation: &Operation) -> Option<&Arc<dyn Resumer>> {
        self.resumers
            .get(&(operation.resource_type, operation.operation_type))
    }

    /// Mitigator for an operation's resource type, if one is registered.
    pub fn mitigator(&self, operation: &Operation) -> Option<&Arc<dyn OrphanMitigator>> {
        self.mitigators.get(&operation.resource_type)
    }
}
