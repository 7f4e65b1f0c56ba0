// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for admission control, timeouts and failure containment.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use broker_ops_core::config::OperationsConfig;
use broker_ops_core::error::Error;
use broker_ops_core::object::{ObjectType, Resource};
use broker_ops_core::operation::{Operation, OperationState, OperationType};
use broker_ops_core::scheduler::{ActionContext, ActionError, ActionResult, Job, SchedulerError};
use common::*;
use tokio::sync::oneshot;

/// Action that creates the operation's resource through the interceptor chain.
async fn create_resource(ctx: ActionContext) -> ActionResult {
    let op = ctx.operation();
    let created = ctx
        .repository()
        .create(
            &ctx.intercept_context(),
            Resource::new(op.resource_type, op.resource_id.clone()),
        )
        .await?;
    Ok(Some(created))
}

/// Job whose action waits until the returned sender fires or is dropped.
fn gated_job(op: Operation) -> (Job, oneshot::Sender<()>) {
    let (release, gate) = oneshot::channel::<()>();
    let job = Job::new(op, move |_ctx| async move {
        let _ = gate.await;
        Ok(None)
    });
    (job, release)
}

fn sleeping_job(op: Operation, duration: Duration) -> Job {
    Job::new(op, move |_ctx| async move {
        tokio::time::sleep(duration).await;
        Ok(None)
    })
}

fn single_worker_config() -> OperationsConfig {
    OperationsConfig {
        pools: HashMap::from([(ObjectType::ServiceInstance, 1)]),
        ..fast_config()
    }
}

#[tokio::test]
async fn test_successful_create_marks_resource_ready() {
    let ctx = TestContext::new(fast_config()).await;
    let op = ctx
        .pending_operation(ObjectType::ServiceInstance, "i-1", OperationType::Create)
        .await;

    ctx.scheduler
        .schedule(Job::new(op.clone(), create_resource))
        .await
        .expect("job should be admitted");

    let done = ctx
        .wait_for_operation(&op.id, |o| o.state == OperationState::Succeeded)
        .await;
    assert!(done.ready);
    assert!(done.error.is_none());

    let resource = ctx
        .wait_for_resource_ready(ObjectType::ServiceInstance, "i-1")
        .await;
    assert!(resource.ready);
}

#[tokio::test]
async fn test_action_error_policies() {
    let ctx = TestContext::new(fast_config()).await;

    let cases = [
        ("i-1", OperationType::Create, ActionError::transient("503"), true, false),
        ("i-2", OperationType::Create, ActionError::orphaned("lost"), false, true),
        ("i-3", OperationType::Update, ActionError::orphaned("lost"), false, false),
        ("i-4", OperationType::Delete, ActionError::orphaned("lost"), false, true),
        ("i-5", OperationType::Delete, ActionError::terminal("400"), false, false),
    ];

    for (resource_id, operation_type, action_error, reschedule, mitigation) in cases {
        let op = ctx
            .pending_operation(ObjectType::ServiceInstance, resource_id, operation_type)
            .await;
        let error = action_error.clone();
        ctx.scheduler
            .schedule(Job::new(op.clone(), move |_ctx| async move { Err(error) }))
            .await
            .unwrap();

        let failed = ctx
            .wait_for_operation(&op.id, |o| o.state == OperationState::Failed)
            .await;
        assert_eq!(failed.reschedule, reschedule, "{} reschedule", resource_id);
        assert_eq!(
            failed.awaits_mitigation(),
            mitigation,
            "{} deletion_scheduled",
            resource_id
        );
        assert_eq!(failed.error.unwrap().description, action_error.message);
    }
}

#[tokio::test]
async fn test_chain_error_inside_action_abandons() {
    let ctx = TestContext::new(fast_config()).await;
    ctx.insert_resource(Resource::new(ObjectType::ServiceInstance, "i-1"))
        .await;
    let op = ctx
        .pending_operation(ObjectType::ServiceInstance, "i-1", OperationType::Create)
        .await;

    // The resource already exists, so the create inside the action fails
    ctx.scheduler
        .schedule(Job::new(op.clone(), create_resource))
        .await
        .unwrap();

    let failed = ctx
        .wait_for_operation(&op.id, |o| o.state == OperationState::Failed)
        .await;
    assert!(failed.is_terminal());
    assert_eq!(failed.error.unwrap().error, "ALREADY_EXISTS");
}

#[tokio::test]
async fn test_panic_contained_and_worker_reused() {
    let ctx = TestContext::new(single_worker_config()).await;
    let op = ctx
        .pending_operation(ObjectType::ServiceInstance, "i-1", OperationType::Create)
        .await;

    ctx.scheduler
        .schedule(Job::new(op.clone(), |_ctx| async move {
            if true {
                panic!("remote client bug");
            }
            Ok(None)
        }))
        .await
        .unwrap();

    let failed = ctx
        .wait_for_operation(&op.id, |o| o.state == OperationState::Failed)
        .await;
    let error = failed.error.clone().unwrap();
    assert_eq!(error.error, "JobInterrupted");
    assert!(error.description.contains("job interrupted"));
    assert!(failed.is_terminal());

    let pool = ctx
        .scheduler
        .pool_status()
        .into_iter()
        .find(|p| p.name == "service_instance")
        .unwrap();
    assert_eq!(pool.panics_contained, 1);

    // The single worker slot is free again
    let follow_up = ctx
        .pending_operation(ObjectType::ServiceInstance, "i-2", OperationType::Create)
        .await;
    ctx.scheduler
        .schedule(Job::new(follow_up.clone(), create_resource))
        .await
        .expect("pool should accept work after a panic");
    ctx.wait_for_operation(&follow_up.id, |o| o.state == OperationState::Succeeded)
        .await;
}

#[tokio::test]
async fn test_full_pool_rejects_with_overloaded() {
    let ctx = TestContext::new(single_worker_config()).await;
    let first = ctx
        .pending_operation(ObjectType::ServiceInstance, "i-1", OperationType::Create)
        .await;
    let second = ctx
        .pending_operation(ObjectType::ServiceInstance, "i-2", OperationType::Create)
        .await;

    let (job, release) = gated_job(first.clone());
    ctx.scheduler.schedule(job).await.unwrap();

    let err = ctx
        .scheduler
        .schedule(sleeping_job(second.clone(), Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Overloaded { ref pool } if pool == "service_instance"));
    assert_eq!(err.status_code(), 503);

    // The rejected operation was never started
    assert_eq!(ctx.operation(&second.id).await.state, OperationState::Pending);

    // Other resource types use the default pool and are unaffected
    let broker = ctx
        .pending_operation(ObjectType::Broker, "b-1", OperationType::Create)
        .await;
    ctx.scheduler
        .schedule(sleeping_job(broker.clone(), Duration::ZERO))
        .await
        .expect("default pool has capacity");

    // The admitted job still completes
    release.send(()).unwrap();
    ctx.wait_for_operation(&first.id, |o| o.state == OperationState::Succeeded)
        .await;

    let idle = wait_for(Duration::from_secs(2), || {
        let idle = ctx.scheduler.pool_status().iter().all(|p| p.in_use == 0);
        async move { idle.then_some(()) }
    })
    .await;
    assert!(idle.is_some(), "worker slots should be released");
}

#[tokio::test]
async fn test_timeout_policy_per_category() {
    let config = OperationsConfig {
        action_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let ctx = TestContext::new(config).await;

    let cases = [
        ("i-1", OperationType::Create, false, false, true),
        ("i-2", OperationType::Update, false, false, false),
        ("i-3", OperationType::Delete, false, false, true),
        ("i-4", OperationType::Create, true, true, false),
    ];

    for (resource_id, operation_type, resumable, reschedule, mitigation) in cases {
        let op = Operation::new(ObjectType::ServiceInstance, resource_id, operation_type)
            .resumable(resumable);
        ctx.repository.create_operation(&op).await.unwrap();

        ctx.scheduler
            .schedule(sleeping_job(op.clone(), Duration::from_secs(30)))
            .await
            .unwrap();

        let failed = ctx
            .wait_for_operation(&op.id, |o| o.state == OperationState::Failed)
            .await;
        assert_eq!(failed.error.as_ref().unwrap().error, "ActionTimeout");
        assert_eq!(failed.reschedule, reschedule, "{} reschedule", resource_id);
        assert_eq!(
            failed.awaits_mitigation(),
            mitigation,
            "{} deletion_scheduled",
            resource_id
        );
    }

    // Timed out actions were cancelled and released their slots
    let idle = wait_for(Duration::from_secs(2), || {
        let idle = ctx.scheduler.pool_status().iter().all(|p| p.in_use == 0);
        async move { idle.then_some(()) }
    })
    .await;
    assert!(idle.is_some());
}

#[tokio::test]
async fn test_one_operation_in_flight_per_resource() {
    let ctx = TestContext::new(fast_config()).await;
    let first = ctx
        .pending_operation(ObjectType::ServiceInstance, "i-1", OperationType::Update)
        .await;
    let second = ctx
        .pending_operation(ObjectType::ServiceInstance, "i-1", OperationType::Update)
        .await;

    let (job, release) = gated_job(first.clone());
    ctx.scheduler.schedule(job).await.unwrap();

    let err = ctx
        .scheduler
        .schedule(sleeping_job(second.clone(), Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ResourceBusy { ref resource_id } if resource_id == "i-1"));
    assert_eq!(ctx.operation(&second.id).await.state, OperationState::Pending);

    // New operations for the busy resource are refused as well
    let third = Operation::new(ObjectType::ServiceInstance, "i-1", OperationType::Delete);
    let err = ctx.repository.create_operation(&third).await.unwrap_err();
    assert!(matches!(err, Error::ResourceBusy { .. }));

    release.send(()).unwrap();
    ctx.wait_for_operation(&first.id, |o| o.state == OperationState::Succeeded)
        .await;

    // Once the first finished the resource accepts work again
    let second = ctx.operation(&second.id).await;
    ctx.scheduler
        .schedule(sleeping_job(second.clone(), Duration::ZERO))
        .await
        .unwrap();
    ctx.wait_for_operation(&second.id, |o| o.state == OperationState::Succeeded)
        .await;
}

#[tokio::test]
async fn test_reconciled_submission_waits_for_result() {
    let ctx = TestContext::new(fast_config()).await;
    let op = ctx
        .pending_operation(ObjectType::ServiceBinding, "b-1", OperationType::Create)
        .await;

    let created = ctx
        .scheduler
        .schedule_reconciled(Job::new(op.clone(), create_resource))
        .await
        .expect("reconciled create should succeed")
        .expect("action returns the created resource");
    assert_eq!(created.id, "b-1");

    // Already recorded by the time the caller gets the result
    let done = ctx.operation(&op.id).await;
    assert_eq!(done.state, OperationState::Succeeded);
}
