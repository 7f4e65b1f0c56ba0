// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed repository implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, Sqlite, SqlitePool};

use crate::error::{Error, Result};
use crate::object::{Criterion, ObjectType, Resource, matches_all};
use crate::operation::{
    Operation, OperationError, OperationFilter, OperationState, OperationType,
};

use super::{Repository, Transaction};

/// SQLite-backed repository.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Create a repository from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run all migrations.
    ///
    /// ```ignore
    /// let repository = SqliteRepository::from_path(".data/broker-ops.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Other(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Connect to a database URL and run all migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        crate::migrations::apply(&pool).await?;

        Ok(Self { pool })
    }

    /// Open a private in-memory database with migrations applied.
    ///
    /// The pool holds a single connection that is never recycled, so the data
    /// lives as long as the repository.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        crate::migrations::apply(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct ResourceRow {
    id: String,
    object_type: String,
    labels: String,
    ready: bool,
    payload: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ResourceRow> for Resource {
    type Error = Error;

    fn try_from(row: ResourceRow) -> Result<Self> {
        Ok(Resource {
            id: row.id,
            object_type: row.object_type.parse().map_err(Error::Other)?,
            labels: serde_json::from_str(&row.labels)?,
            ready: row.ready,
            payload: serde_json::from_str(&row.payload)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct OperationRow {
    id: String,
    resource_id: String,
    resource_type: String,
    #[sqlx(rename = "type")]
    operation_type: String,
    state: String,
    platform_id: String,
    correlation_id: String,
    reschedule: bool,
    deletion_scheduled: Option<DateTime<Utc>>,
    ready: bool,
    labels: String,
    error: Option<String>,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OperationRow> for Operation {
    type Error = Error;

    fn try_from(row: OperationRow) -> Result<Self> {
        let operation_type = OperationType::parse(&row.operation_type)
            .ok_or_else(|| Error::Other(format!("unknown operation type '{}'", row.operation_type)))?;
        let state = OperationState::parse(&row.state)
            .ok_or_else(|| Error::Other(format!("unknown operation state '{}'", row.state)))?;
        let error = row
            .error
            .as_deref()
            .map(serde_json::from_str::<OperationError>)
            .transpose()?;

        Ok(Operation {
            id: row.id,
            resource_id: row.resource_id,
            resource_type: row.resource_type.parse().map_err(Error::Other)?,
            operation_type,
            state,
            platform_id: row.platform_id,
            correlation_id: row.correlation_id,
            reschedule: row.reschedule,
            deletion_scheduled: row.deletion_scheduled,
            ready: row.ready,
            labels: serde_json::from_str(&row.labels)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            error,
            description: row.description,
        })
    }
}

const RESOURCE_COLUMNS: &str = "id, object_type, labels, ready, payload, created_at, updated_at";

const OPERATION_COLUMNS: &str = "id, resource_id, resource_type, type, state, platform_id, \
     correlation_id, reschedule, deletion_scheduled, ready, labels, error, description, \
     created_at, updated_at";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

async fn fetch_resource<'e, E>(
    executor: E,
    object_type: ObjectType,
    id: &str,
) -> Result<Option<Resource>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {} FROM resources WHERE id = ?1 AND object_type = ?2",
        RESOURCE_COLUMNS
    );
    let row = sqlx::query_as::<_, ResourceRow>(&sql)
        .bind(id)
        .bind(object_type.as_str())
        .fetch_optional(executor)
        .await?;

    row.map(Resource::try_from).transpose()
}

async fn fetch_resources<'e, E>(
    executor: E,
    object_type: ObjectType,
    criteria: &[Criterion],
) -> Result<Vec<Resource>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {} FROM resources WHERE object_type = ?1 ORDER BY created_at ASC, id ASC",
        RESOURCE_COLUMNS
    );
    let rows = sqlx::query_as::<_, ResourceRow>(&sql)
        .bind(object_type.as_str())
        .fetch_all(executor)
        .await?;

    let mut resources = Vec::with_capacity(rows.len());
    for row in rows {
        let resource = Resource::try_from(row)?;
        if matches_all(criteria, &resource) {
            resources.push(resource);
        }
    }
    Ok(resources)
}

async fn write_ready<'e, E>(executor: E, object_type: ObjectType, id: &str, ready: bool) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE resources
        SET ready = ?1, updated_at = ?2
        WHERE id = ?3 AND object_type = ?4
        "#,
    )
    .bind(ready)
    .bind(crate::now())
    .bind(id)
    .bind(object_type.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// An open SQLite transaction.
pub struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn get_resource(
        &mut self,
        object_type: ObjectType,
        id: &str,
    ) -> Result<Option<Resource>> {
        fetch_resource(&mut *self.tx, object_type, id).await
    }

    async fn list_resources(
        &mut self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Resource>> {
        fetch_resources(&mut *self.tx, object_type, criteria).await
    }

    async fn create_resource(&mut self, resource: Resource) -> Result<Resource> {
        let result = sqlx::query(
            r#"
            INSERT INTO resources (id, object_type, labels, ready, payload, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&resource.id)
        .bind(resource.object_type.as_str())
        .bind(serde_json::to_string(&resource.labels)?)
        .bind(resource.ready)
        .bind(serde_json::to_string(&resource.payload)?)
        .bind(resource.created_at)
        .bind(resource.updated_at)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(resource),
            Err(e) if is_unique_violation(&e) => Err(Error::AlreadyExists {
                object_type: resource.object_type,
                id: resource.id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_resource(&mut self, mut resource: Resource) -> Result<Resource> {
        resource.updated_at = crate::now();

        let result = sqlx::query(
            r#"
            UPDATE resources
            SET labels = ?1, ready = ?2, payload = ?3, updated_at = ?4
            WHERE id = ?5 AND object_type = ?6
            "#,
        )
        .bind(serde_json::to_string(&resource.labels)?)
        .bind(resource.ready)
        .bind(serde_json::to_string(&resource.payload)?)
        .bind(resource.updated_at)
        .bind(&resource.id)
        .bind(resource.object_type.as_str())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                object_type: resource.object_type,
                id: resource.id,
            });
        }
        Ok(resource)
    }

    async fn delete_resources(
        &mut self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Resource>> {
        let matched = fetch_resources(&mut *self.tx, object_type, criteria).await?;

        for resource in &matched {
            sqlx::query("DELETE FROM resources WHERE id = ?1 AND object_type = ?2")
                .bind(&resource.id)
                .bind(object_type.as_str())
                .execute(&mut *self.tx)
                .await?;
        }

        Ok(matched)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn get_resource(&self, object_type: ObjectType, id: &str) -> Result<Option<Resource>> {
        fetch_resource(&self.pool, object_type, id).await
    }

    async fn list_resources(
        &self,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Resource>> {
        fetch_resources(&self.pool, object_type, criteria).await
    }

    async fn set_resource_ready(
        &self,
        object_type: ObjectType,
        id: &str,
        ready: bool,
    ) -> Result<bool> {
        write_ready(&self.pool, object_type, id, ready).await
    }

    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        let (in_flight,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM operations WHERE resource_id = ?1 AND state = 'in progress'",
        )
        .bind(&operation.resource_id)
        .fetch_one(&self.pool)
        .await?;

        if in_flight > 0 {
            return Err(Error::ResourceBusy {
                resource_id: operation.resource_id.clone(),
            });
        }

        let error = operation
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO operations (
                id, resource_id, resource_type, type, state, platform_id, correlation_id,
                reschedule, deletion_scheduled, ready, labels, error, description,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&operation.id)
        .bind(&operation.resource_id)
        .bind(operation.resource_type.as_str())
        .bind(operation.operation_type.as_str())
        .bind(operation.state.as_str())
        .bind(&operation.platform_id)
        .bind(&operation.correlation_id)
        .bind(operation.reschedule)
        .bind(operation.deletion_scheduled)
        .bind(operation.ready)
        .bind(serde_json::to_string(&operation.labels)?)
        .bind(error)
        .bind(&operation.description)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                let exists = self.get_operation(&operation.id).await?.is_some();
                if exists {
                    Err(Error::OperationAlreadyExists {
                        operation_id: operation.id.clone(),
                    })
                } else {
                    Err(Error::ResourceBusy {
                        resource_id: operation.resource_id.clone(),
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Option<Operation>> {
        let sql = format!("SELECT {} FROM operations WHERE id = ?1", OPERATION_COLUMNS);
        let row = sqlx::query_as::<_, OperationRow>(&sql)
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Operation::try_from).transpose()
    }

    async fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM operations
            WHERE (?1 IS NULL OR resource_id = ?1)
              AND (?2 IS NULL OR resource_type = ?2)
              AND (?3 IS NULL OR platform_id = ?3)
              AND (?4 IS NULL OR state = ?4)
              AND (?5 IS NULL OR type = ?5)
              AND (?6 IS NULL OR reschedule = ?6)
              AND (?7 IS NULL
                   OR (?7 = 1 AND deletion_scheduled IS NOT NULL)
                   OR (?7 = 0 AND deletion_scheduled IS NULL))
              AND (?8 IS NULL OR created_at >= ?8)
              AND (?9 IS NULL OR created_at < ?9)
              AND (?10 IS NULL OR updated_at >= ?10)
              AND (?11 IS NULL OR updated_at < ?11)
            ORDER BY created_at ASC, id ASC
            LIMIT ?12
            "#,
            OPERATION_COLUMNS
        );

        let rows = sqlx::query_as::<_, OperationRow>(&sql)
            .bind(filter.resource_id.as_deref())
            .bind(filter.resource_type.map(|t| t.as_str()))
            .bind(filter.platform_id.as_deref())
            .bind(filter.state.map(|s| s.as_str()))
            .bind(filter.operation_type.map(|t| t.as_str()))
            .bind(filter.reschedule)
            .bind(filter.deletion_scheduled)
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(filter.updated_after)
            .bind(filter.updated_before)
            // Negative LIMIT means unbounded in SQLite
            .bind(filter.limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Operation::try_from).collect()
    }

    async fn count_operations(&self, filter: &OperationFilter) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM operations
            WHERE (?1 IS NULL OR resource_id = ?1)
              AND (?2 IS NULL OR resource_type = ?2)
              AND (?3 IS NULL OR platform_id = ?3)
              AND (?4 IS NULL OR state = ?4)
              AND (?5 IS NULL OR type = ?5)
              AND (?6 IS NULL OR reschedule = ?6)
              AND (?7 IS NULL
                   OR (?7 = 1 AND deletion_scheduled IS NOT NULL)
                   OR (?7 = 0 AND deletion_scheduled IS NULL))
              AND (?8 IS NULL OR created_at >= ?8)
              AND (?9 IS NULL OR created_at < ?9)
              AND (?10 IS NULL OR updated_at >= ?10)
              AND (?11 IS NULL OR updated_at < ?11)
            "#,
        )
        .bind(filter.resource_id.as_deref())
        .bind(filter.resource_type.map(|t| t.as_str()))
        .bind(filter.platform_id.as_deref())
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.operation_type.map(|t| t.as_str()))
        .bind(filter.reschedule)
        .bind(filter.deletion_scheduled)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(filter.updated_after)
        .bind(filter.updated_before)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn update_operation_if(
        &self,
        operation: &Operation,
        expected_state: OperationState,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let error = operation
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE operations
            SET state = ?1,
                reschedule = ?2,
                deletion_scheduled = ?3,
                ready = ?4,
                labels = ?5,
                error = ?6,
                description = ?7,
                updated_at = ?8
            WHERE id = ?9
              AND state = ?10
              AND updated_at = ?11
            "#,
        )
        .bind(operation.state.as_str())
        .bind(operation.reschedule)
        .bind(operation.deletion_scheduled)
        .bind(operation.ready)
        .bind(serde_json::to_string(&operation.labels)?)
        .bind(error)
        .bind(&operation.description)
        .bind(operation.updated_at)
        .bind(&operation.id)
        .bind(expected_state.as_str())
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Err(Error::ResourceBusy {
                resource_id: operation.resource_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_expired_operations(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        // Terminal and past the cutoff, and either the resource is gone or a
        // newer operation for it exists.
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT o.id
            FROM operations o
            WHERE o.updated_at < ?1
              AND (o.state = 'succeeded'
                   OR (o.state = 'failed' AND o.reschedule = 0 AND o.deletion_scheduled IS NULL))
              AND (
                  NOT EXISTS (SELECT 1 FROM resources r
                              WHERE r.object_type = o.resource_type AND r.id = o.resource_id)
                  OR EXISTS (
                      SELECT 1 FROM operations n
                      WHERE n.resource_id = o.resource_id
                        AND (n.created_at > o.created_at
                             OR (n.created_at = o.created_at AND n.id > o.id))
                  )
              )
            ORDER BY o.updated_at ASC
            LIMIT ?2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_operations(&self, operation_ids: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;

        for id in operation_ids {
            let result = sqlx::query("DELETE FROM operations WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn health_check(&self) -> Result<bool> {
        let result: std::result::Result<(i64,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
