// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for broker-ops-core integration tests.
//!
//! Provides TestContext wiring an in-memory repository, interceptor registry,
//! scheduler and maintainer together.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker_ops_core::config::OperationsConfig;
use broker_ops_core::interceptable::InterceptableRepository;
use broker_ops_core::interceptors::InterceptorRegistry;
use broker_ops_core::maintainer::Maintainer;
use broker_ops_core::object::{ObjectType, Resource};
use broker_ops_core::operation::{Operation, OperationState, OperationType};
use broker_ops_core::persistence::{Repository, SqliteRepository};
use broker_ops_core::recovery::ActionRegistry;
use broker_ops_core::scheduler::Scheduler;

/// Test context holding every engine component over one in-memory database.
pub struct TestContext {
    pub sqlite: SqliteRepository,
    pub repository: Arc<dyn Repository>,
    pub interceptable: InterceptableRepository,
    pub scheduler: Scheduler,
}

impl TestContext {
    /// Create a context without interceptors.
    pub async fn new(config: OperationsConfig) -> Self {
        Self::with_registry(config, InterceptorRegistry::default()).await
    }

    /// Create a context with a finalized interceptor registry.
    pub async fn with_registry(config: OperationsConfig, registry: InterceptorRegistry) -> Self {
        let sqlite = SqliteRepository::connect_in_memory()
            .await
            .expect("Failed to open in-memory database");
        let repository: Arc<dyn Repository> = Arc::new(sqlite.clone());
        let interceptable = InterceptableRepository::new(repository.clone(), Arc::new(registry));
        let scheduler = Scheduler::new(interceptable.clone(), config);

        Self {
            sqlite,
            repository,
            interceptable,
            scheduler,
        }
    }

    /// Maintainer sharing this context's scheduler.
    pub fn maintainer(&self, actions: ActionRegistry) -> Maintainer {
        Maintainer::new(self.interceptable.clone(), self.scheduler.clone(), actions)
    }

    /// Store a new pending operation.
    pub async fn pending_operation(
        &self,
        object_type: ObjectType,
        resource_id: &str,
        operation_type: OperationType,
    ) -> Operation {
        let op = Operation::new(object_type, resource_id, operation_type);
        self.repository
            .create_operation(&op)
            .await
            .expect("Failed to create operation");
        op
    }

    /// Store an operation as it would look after a crash: `state` with
    /// timestamps `age` in the past.
    pub async fn backdated_operation(
        &self,
        op: Operation,
        state: OperationState,
        age: chrono::Duration,
    ) -> Operation {
        let mut op = op;
        op.state = state;
        op.created_at = broker_ops_core::now() - age;
        op.updated_at = op.created_at;
        self.repository
            .create_operation(&op)
            .await
            .expect("Failed to create operation");
        op
    }

    /// Insert a resource directly, bypassing interceptors.
    pub async fn insert_resource(&self, resource: Resource) {
        let mut tx = self.repository.begin().await.expect("begin");
        tx.create_resource(resource).await.expect("create resource");
        tx.commit().await.expect("commit");
    }

    /// Fetch an operation that must exist.
    pub async fn operation(&self, id: &str) -> Operation {
        self.repository
            .get_operation(id)
            .await
            .expect("Failed to load operation")
            .expect("Operation should exist")
    }

    /// Poll until the operation satisfies `predicate`, returning its final snapshot.
    pub async fn wait_for_operation(
        &self,
        id: &str,
        predicate: impl Fn(&Operation) -> bool,
    ) -> Operation {
        let repository = self.repository.clone();
        let predicate = &predicate;
        wait_for(Duration::from_secs(5), || {
            let repository = repository.clone();
            async move {
                repository
                    .get_operation(id)
                    .await
                    .ok()
                    .flatten()
                    .filter(|op| predicate(op))
            }
        })
        .await
        .unwrap_or_else(|| panic!("operation {} never reached the expected state", id))
    }

    /// Poll until the resource exists and is ready.
    pub async fn wait_for_resource_ready(&self, object_type: ObjectType, id: &str) -> Resource {
        let repository = self.repository.clone();
        wait_for(Duration::from_secs(5), || {
            let repository = repository.clone();
            async move {
                repository
                    .get_resource(object_type, id)
                    .await
                    .ok()
                    .flatten()
                    .filter(|r| r.ready)
            }
        })
        .await
        .unwrap_or_else(|| panic!("resource {} never became ready", id))
    }
}

/// Configuration with short timeouts for tests.
pub fn fast_config() -> OperationsConfig {
    OperationsConfig {
        action_timeout: Duration::from_secs(5),
        reconciliation_operation_timeout: Duration::from_secs(5),
        admission_timeout: Duration::from_millis(50),
        maintainer_retry_interval: Duration::from_millis(100),
        default_pool_size: 4,
        ..OperationsConfig::default()
    }
}

/// Poll `check` every 20ms until it yields `Some`, or give up after `timeout`.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Shared, ordered log of hook invocations.
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
