// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Update-phase hooks and their continuations.
//!
//! Label changes travel through the chain as an ordered list. Hooks may push
//! further changes; the list is applied on top of the new object right before
//! it is written.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::InterceptContext;
use crate::error::{Error, Result};
use crate::object::{LabelChange, Resource, apply_label_changes};
use crate::persistence::{Repository, Transaction};

/// Extension hook observing resource updates.
#[async_trait]
pub trait UpdateInterceptor: Send + Sync {
    /// Runs outside the transaction.
    async fn around_tx(
        &self,
        ctx: &InterceptContext,
        object: Resource,
        changes: Vec<LabelChange>,
        next: UpdateAroundTxNext<'_>,
    ) -> Result<Resource> {
        next.run(ctx, object, changes).await
    }

    /// Runs inside the transaction, with the currently stored record as `old`.
    async fn on_tx(
        &self,
        ctx: &InterceptContext,
        tx: &mut dyn Transaction,
        old: &Resource,
        new: Resource,
        changes: Vec<LabelChange>,
        next: UpdateOnTxNext<'_>,
    ) -> Result<Resource> {
        next.run(ctx, tx, old, new, changes).await
    }
}

/// Remainder of the around-layer; ends by running the transaction.
pub struct UpdateAroundTxNext<'a> {
    remaining: &'a [Arc<dyn UpdateInterceptor>],
    on_tx: &'a [Arc<dyn UpdateInterceptor>],
    repository: &'a dyn Repository,
}

impl<'a> UpdateAroundTxNext<'a> {
    pub(crate) fn new(
        around: &'a [Arc<dyn UpdateInterceptor>],
        on_tx: &'a [Arc<dyn UpdateInterceptor>],
        repository: &'a dyn Repository,
    ) -> Self {
        Self {
            remaining: around,
            on_tx,
            repository,
        }
    }

    /// Continue with the next around hook, or open the transaction once none are left.
    pub async fn run(
        self,
        ctx: &InterceptContext,
        object: Resource,
        changes: Vec<LabelChange>,
    ) -> Result<Resource> {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                let next = Self {
                    remaining: rest,
                    ..self
                };
                head.around_tx(ctx, object, changes, next).await
            }
            None => {
                let mut tx = self.repository.begin().await?;
                let outcome = match tx.get_resource(object.object_type, &object.id).await {
                    Ok(Some(old)) => {
                        let next = UpdateOnTxNext {
                            remaining: self.on_tx,
                        };
                        next.run(ctx, tx.as_mut(), &old, object, changes).await
                    }
                    Ok(None) => Err(Error::NotFound {
                        object_type: object.object_type,
                        id: object.id,
                    }),
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(updated) => {
                        tx.commit().await?;
                        Ok(updated)
                    }
                    Err(e) => {
                        if let Err(rollback) = tx.rollback().await {
                            warn!(error = %rollback, "Failed to roll back aborted update");
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Remainder of the on-transaction layer; ends by applying label changes and writing.
pub struct UpdateOnTxNext<'a> {
    remaining: &'a [Arc<dyn UpdateInterceptor>],
}

impl UpdateOnTxNext<'_> {
    /// Continue with the next on-transaction hook, or write the object once none are left.
    pub async fn run(
        self,
        ctx: &InterceptContext,
        tx: &mut dyn Transaction,
        old: &Resource,
        mut new: Resource,
        changes: Vec<LabelChange>,
    ) -> Result<Resource> {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                head.on_tx(ctx, tx, old, new, changes, UpdateOnTxNext { remaining: rest })
                    .await
            }
            None => {
                apply_label_changes(&mut new.labels, &changes);
                debug!(
                    object_type = %new.object_type,
                    resource_id = %new.id,
                    label_changes = changes.len(),
                    "Updating resource"
                );
                tx.update_resource(new).await
            }
        }
    }
}
