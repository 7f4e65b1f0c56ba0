// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repository facade that runs every mutation through the interceptor chain.

use std::sync::Arc;

use crate::error::Result;
use crate::interceptors::{
    CreateAroundTxNext, DeleteAroundTxNext, InterceptContext, InterceptorRegistry,
    UpdateAroundTxNext,
};
use crate::object::{Criterion, LabelChange, ObjectType, Resource};
use crate::persistence::Repository;

/// Mutations go through the registered interceptors; reads go straight to storage.
#[derive(Clone)]
pub struct InterceptableRepository {
    repository: Arc<dyn Repository>,
    registry: Arc<InterceptorRegistry>,
}

impl InterceptableRepository {
    /// Wrap a repository with a finalized registry.
    pub fn new(repository: Arc<dyn Repository>, registry: Arc<InterceptorRegistry>) -> Self {
        Self {
            repository,
            registry,
        }
    }

    /// The wrapped repository.
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// The registry the chains are taken from.
    pub fn registry(&self) -> &InterceptorRegistry {
        &self.registry
    }

    /// Create a resource.
    pub async fn create(&self, ctx: &InterceptContext, object: Resource) -> Result<Resource> {
        let (around, on_tx) = self.registry.create_chain(object.object_type);
        CreateAroundTxNext::new(around, on_tx, self.repository.as_ref())
            .run(ctx, object)
            .await
    }

    /// Update a resource, applying `changes` to its labels.
    pub async fn update(
        &self,
        ctx: &InterceptContext,
        object: Resource,
        changes: Vec<LabelChange>,
    ) -> Result<Resource> {
        let (around, on_tx) = self.registry.update_chain(object.object_type);
        UpdateAroundTxNext::new(around, on_tx, self.repository.as_ref())
            .run(ctx, object, changes)
            .await
    }

    /// Delete every resource of `object_type` matching `criteria`.
    pub async fn delete(
        &self,
        ctx: &InterceptContext,
        object_type: ObjectType,
        criteria: Vec<Criterion>,
    ) -> Result<Vec<Resource>> {
        let (around, on_tx) = self.registry.delete_chain(object_type);
        DeleteAroundTxNext::new(object_type, around, on_tx, self.repository.as_ref())
            .run(ctx, criteria)
            .await
    }

    /// Fetch one resource.
    pub async fn get(&self, object_type: ObjectType, id: &str) -> Result<Option<Resource>> {
        self.repository.get_resource(object_type, id).await
    }

    /// List resources matching every criterion.
    pub async fn list(
        &self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Resource>> {
        self.repository.list_resources(object_type, criteria).await
    }
}
