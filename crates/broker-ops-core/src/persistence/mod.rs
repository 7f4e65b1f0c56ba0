// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for broker-ops-core.
//!
//! The engine only needs transactional CRUD over resources, filtered queries
//! over operations and a compare-and-set write for operation records. The
//! [`Repository`] trait captures that surface; [`SqliteRepository`] is the
//! bundled backend.

pub mod sqlite;

pub use self::sqlite::SqliteRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::object::{Criterion, ObjectType, Resource};
use crate::operation::{Operation, OperationFilter, OperationState};

/// A unit of work over resources, committed or rolled back as a whole.
///
/// The handle is owned by the current transaction and must not be retained
/// beyond it. Dropping it without calling [`commit`](Transaction::commit)
/// rolls everything back.
#[async_trait]
pub trait Transaction: Send {
    /// Fetch one resource.
    async fn get_resource(&mut self, object_type: ObjectType, id: &str)
    -> Result<Option<Resource>>;

    /// List resources of a type matching every criterion.
    async fn list_resources(
        &mut self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Resource>>;

    /// Insert a resource. Fails with `AlreadyExists` on a duplicate id.
    async fn create_resource(&mut self, resource: Resource) -> Result<Resource>;

    /// Overwrite a resource. Fails with `NotFound` when it does not exist.
    async fn update_resource(&mut self, resource: Resource) -> Result<Resource>;

    /// Delete resources of a type matching every criterion, returning what was removed.
    async fn delete_resources(
        &mut self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Resource>>;

    /// Make every write visible.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Storage used by the scheduler, the maintainer and the interceptor chain.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Fetch one resource outside a transaction.
    async fn get_resource(&self, object_type: ObjectType, id: &str) -> Result<Option<Resource>>;

    /// List resources outside a transaction.
    async fn list_resources(
        &self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Resource>>;

    /// Flip the visibility flag of a resource. Returns false if it does not exist.
    async fn set_resource_ready(&self, object_type: ObjectType, id: &str, ready: bool)
    -> Result<bool>;

    /// Insert a new operation.
    ///
    /// Rejected with `ResourceBusy` while another operation for the same
    /// resource is in progress.
    async fn create_operation(&self, operation: &Operation) -> Result<()>;

    /// Fetch one operation.
    async fn get_operation(&self, operation_id: &str) -> Result<Option<Operation>>;

    /// List operations matching the filter, oldest first.
    async fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>>;

    /// Count operations matching the filter (the limit is ignored).
    async fn count_operations(&self, filter: &OperationFilter) -> Result<i64>;

    /// Write `operation` only if the stored record is still in `expected_state`
    /// with `expected_updated_at`.
    ///
    /// Returns true if the update was applied, false if another writer got there
    /// first.
    async fn update_operation_if(
        &self,
        operation: &Operation,
        expected_state: OperationState,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Compare-and-set from a previously read snapshot to its successor.
    async fn transition(&self, previous: &Operation, next: &Operation) -> Result<bool> {
        self.update_operation_if(next, previous.state, previous.updated_at)
            .await
    }

    /// Ids of terminal operations last updated before `cutoff` that retention may delete.
    ///
    /// Excludes operations awaiting mitigation and the most recent operation of
    /// every resource that still exists.
    async fn find_expired_operations(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>>;

    /// Delete operations by id. Returns the number of rows removed.
    async fn delete_operations(&self, operation_ids: &[String]) -> Result<u64>;

    /// Check storage connectivity.
    async fn health_check(&self) -> Result<bool>;
}
