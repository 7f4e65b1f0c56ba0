// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Create-phase hooks and their continuations.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::InterceptContext;
use crate::error::Result;
use crate::object::Resource;
use crate::persistence::{Repository, Transaction};

/// Extension hook observing resource creation.
///
/// Both hooks default to handing the object straight to `next`.
#[async_trait]
pub trait CreateInterceptor: Send + Sync {
    /// Runs outside the transaction. Code before `next.run` sees the object
    /// before it is written, code after sees it once committed.
    async fn around_tx(
        &self,
        ctx: &InterceptContext,
        object: Resource,
        next: CreateAroundTxNext<'_>,
    ) -> Result<Resource> {
        next.run(ctx, object).await
    }

    /// Runs inside the transaction that persists the object.
    async fn on_tx(
        &self,
        ctx: &InterceptContext,
        tx: &mut dyn Transaction,
        object: Resource,
        next: CreateOnTxNext<'_>,
    ) -> Result<Resource> {
        next.run(ctx, tx, object).await
    }
}

/// Remainder of the around-layer; ends by running the transaction.
pub struct CreateAroundTxNext<'a> {
    remaining: &'a [Arc<dyn CreateInterceptor>],
    on_tx: &'a [Arc<dyn CreateInterceptor>],
    repository: &'a dyn Repository,
}

impl<'a> CreateAroundTxNext<'a> {
    pub(crate) fn new(
        around: &'a [Arc<dyn CreateInterceptor>],
        on_tx: &'a [Arc<dyn CreateInterceptor>],
        repository: &'a dyn Repository,
    ) -> Self {
        Self {
            remaining: around,
            on_tx,
            repository,
        }
    }

    /// Continue with the next around hook, or open the transaction once none are left.
    pub async fn run(self, ctx: &InterceptContext, object: Resource) -> Result<Resource> {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                let next = Self {
                    remaining: rest,
                    ..self
                };
                head.around_tx(ctx, object, next).await
            }
            None => {
                let mut tx = self.repository.begin().await?;
                let next = CreateOnTxNext {
                    remaining: self.on_tx,
                };
                match next.run(ctx, tx.as_mut(), object).await {
                    Ok(created) => {
                        tx.commit().await?;
                        Ok(created)
                    }
                    Err(e) => {
                        if let Err(rollback) = tx.rollback().await {
                            warn!(error = %rollback, "Failed to roll back aborted create");
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Remainder of the on-transaction layer; ends by inserting the object.
pub struct CreateOnTxNext<'a> {
    remaining: &'a [Arc<dyn CreateInterceptor>],
}

impl CreateOnTxNext<'_> {
    /// Continue with the next on-transaction hook, or write the object once none are left.
    pub async fn run(
        self,
        ctx: &InterceptContext,
        tx: &mut dyn Transaction,
        object: Resource,
    ) -> Result<Resource> {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                head.on_tx(ctx, tx, object, CreateOnTxNext { remaining: rest })
                    .await
            }
            None => {
                debug!(
                    object_type = %object.object_type,
                    resource_id = %object.id,
                    "Creating resource"
                );
                tx.create_resource(object).await
            }
        }
    }
}
