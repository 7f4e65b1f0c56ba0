// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delete-phase hooks and their continuations.
//!
//! A delete targets every resource of one type matching a criteria list. Hooks
//! may append criteria to narrow the target set; the final list is what the
//! storage delete runs with.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::InterceptContext;
use crate::error::Result;
use crate::object::{Criterion, ObjectType, Resource};
use crate::persistence::{Repository, Transaction};

/// Extension hook observing resource deletion.
#[async_trait]
pub trait DeleteInterceptor: Send + Sync {
    /// Runs outside the transaction. Returns the deleted resources.
    async fn around_tx(
        &self,
        ctx: &InterceptContext,
        criteria: Vec<Criterion>,
        next: DeleteAroundTxNext<'_>,
    ) -> Result<Vec<Resource>> {
        next.run(ctx, criteria).await
    }

    /// Runs inside the transaction. `objects` are the records matched by the
    /// criteria the transaction was opened with.
    async fn on_tx(
        &self,
        ctx: &InterceptContext,
        tx: &mut dyn Transaction,
        objects: &[Resource],
        criteria: Vec<Criterion>,
        next: DeleteOnTxNext<'_>,
    ) -> Result<Vec<Resource>> {
        next.run(ctx, tx, objects, criteria).await
    }
}

/// Remainder of the around-layer; ends by running the transaction.
pub struct DeleteAroundTxNext<'a> {
    object_type: ObjectType,
    remaining: &'a [Arc<dyn DeleteInterceptor>],
    on_tx: &'a [Arc<dyn DeleteInterceptor>],
    repository: &'a dyn Repository,
}

impl<'a> DeleteAroundTxNext<'a> {
    pub(crate) fn new(
        object_type: ObjectType,
        around: &'a [Arc<dyn DeleteInterceptor>],
        on_tx: &'a [Arc<dyn DeleteInterceptor>],
        repository: &'a dyn Repository,
    ) -> Self {
        Self {
            object_type,
            remaining: around,
            on_tx,
            repository,
        }
    }

    /// Type of the resources being deleted.
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// Continue with the next around hook, or open the transaction once none are left.
    pub async fn run(
        self,
        ctx: &InterceptContext,
        criteria: Vec<Criterion>,
    ) -> Result<Vec<Resource>> {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                let next = Self {
                    remaining: rest,
                    ..self
                };
                head.around_tx(ctx, criteria, next).await
            }
            None => {
                let mut tx = self.repository.begin().await?;
                let outcome = match tx.list_resources(self.object_type, &criteria).await {
                    Ok(objects) => {
                        let next = DeleteOnTxNext {
                            object_type: self.object_type,
                            remaining: self.on_tx,
                        };
                        next.run(ctx, tx.as_mut(), &objects, criteria).await
                    }
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(deleted) => {
                        tx.commit().await?;
                        Ok(deleted)
                    }
                    Err(e) => {
                        if let Err(rollback) = tx.rollback().await {
                            warn!(error = %rollback, "Failed to roll back aborted delete");
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Remainder of the on-transaction layer; ends by deleting by the final criteria.
pub struct DeleteOnTxNext<'a> {
    object_type: ObjectType,
    remaining: &'a [Arc<dyn DeleteInterceptor>],
}

impl DeleteOnTxNext<'_> {
    /// Type of the resources being deleted.
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// Continue with the next on-transaction hook, or delete once none are left.
    pub async fn run(
        self,
        ctx: &InterceptContext,
        tx: &mut dyn Transaction,
        objects: &[Resource],
        criteria: Vec<Criterion>,
    ) -> Result<Vec<Resource>> {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                let next = DeleteOnTxNext {
                    object_type: self.object_type,
                    remaining: rest,
                };
                head.on_tx(ctx, tx, objects, criteria, next).await
            }
            None => {
                let deleted = tx.delete_resources(self.object_type, &criteria).await?;
                debug!(
                    object_type = %self.object_type,
                    matched = objects.len(),
                    deleted = deleted.len(),
                    "Deleted resources"
                );
                Ok(deleted)
            }
        }
    }
}
