// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema for the operation and resource tables.
//!
//! [`SqliteRepository`](crate::persistence::SqliteRepository) applies these on
//! connect. Products sharing a database with the engine can run them up front:
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:ops.db?mode=rwc").await?;
//! broker_ops_core::migrations::apply(&pool).await?;
//! ```

use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use tracing::debug;

use crate::error::Result;

/// Operation and resource schema.
pub static SCHEMA: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Bring the schema up to date. Already applied versions are skipped.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    SCHEMA.run(pool).await?;
    debug!(versions = SCHEMA.iter().count(), "Operation schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let pool = memory_pool().await;
        apply(&pool).await.unwrap();
        apply(&pool).await.unwrap();

        let (applied,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(applied as usize, SCHEMA.iter().count());
    }

    #[tokio::test]
    async fn test_single_in_progress_index() {
        let pool = memory_pool().await;
        apply(&pool).await.unwrap();

        let insert = "INSERT INTO operations (id, resource_id, resource_type, type, state, \
                      platform_id, correlation_id, created_at, updated_at) \
                      VALUES (?1, 'i-1', 'service_instance', 'update', 'in progress', \
                      'native', 'c', '2025-01-01', '2025-01-01')";
        sqlx::query(insert).bind("op-1").execute(&pool).await.unwrap();
        let err = sqlx::query(insert).bind("op-2").execute(&pool).await.unwrap_err();
        assert!(matches!(err, sqlx::Error::Database(ref db) if db.is_unique_violation()));
    }
}
