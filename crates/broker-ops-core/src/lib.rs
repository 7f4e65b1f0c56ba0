// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker Ops Core - Operation Lifecycle Engine
//!
//! Tracks every create, update and delete of a service-broker resource as a
//! durable [`Operation`], runs the work on bounded worker pools, wraps the
//! storage write in a configurable interceptor chain, and repairs whatever a
//! crash or timeout leaves behind.
//!
//! # Architecture
//!
//! ```text
//!                 protocol layer (not in this crate)
//!                          │ Job (operation + action)
//!                          ▼
//! ┌─────────────────────────┐  resume  ┌──────────────────────────────┐
//! │        Scheduler        │◄─────────│          Maintainer          │
//! │ per-type pools,         │          │ stale detection, resumption, │
//! │ admission, timeouts     │          │ orphan mitigation, retention │
//! └─────────────────────────┘          └──────────────────────────────┘
//!              │ action                               │
//!              ▼                                      │
//! ┌─────────────────────────┐                         │
//! │ InterceptableRepository │ around-tx, tx, on-tx    │
//! └─────────────────────────┘                         │
//!              │                                      │
//!              ▼                                      ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Repository (SQLite)                          │
//! │               resources + operations, CAS transitions               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Operation States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `pending` | Created, waiting for admission |
//! | `in progress` | Running on a worker |
//! | `succeeded` | Finished; the resource is ready for create/update |
//! | `failed` | Finished with an error; may be resumable or awaiting mitigation |
//!
//! See [`operation`] for the full state machine.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `BROKER_OPS_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `BROKER_OPS_HTTP_PORT` | No | `8080` | Health endpoint port |
//! | `BROKER_OPS_ACTION_TIMEOUT_SECS` | No | `900` | Max runtime of one action |
//! | `BROKER_OPS_RECONCILIATION_OPERATION_TIMEOUT_SECS` | No | `10` | Synchronous wait for reconciled jobs |
//! | `BROKER_OPS_ADMISSION_TIMEOUT_MS` | No | `100` | Wait for a free worker |
//! | `BROKER_OPS_MAINTAINER_RETRY_INTERVAL_SECS` | No | `60` | Maintenance cycle period |
//! | `BROKER_OPS_RESCHEDULING_TIMEOUT_SECS` | No | `43200` | How long failures are resumed |
//! | `BROKER_OPS_CLEANUP_INTERVAL_SECS` | No | `3600` | Retention cleanup period |
//! | `BROKER_OPS_OPERATIONS_LIFESPAN_SECS` | No | `604800` | Age after which terminal operations are deleted |
//! | `BROKER_OPS_DELETE_OPERATIONS_BATCH_SIZE` | No | `100` | Rows per cleanup batch |
//! | `BROKER_OPS_DEFAULT_POOL_SIZE` | No | `20` | Workers of the default pool |
//! | `BROKER_OPS_POOLS` | No | - | Per-type pools, e.g. `service_instance=10,service_binding=5` |
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`object`]: Resource model, labels and criteria
//! - [`operation`]: Operation records and their state machine
//! - [`persistence`]: Storage traits and the SQLite backend
//! - [`interceptors`]: Interceptor traits, ordering and registry
//! - [`interceptable`]: Repository facade running mutations through the chain
//! - [`scheduler`]: Worker pools, admission control and action execution
//! - [`recovery`]: Resumers and orphan mitigators used by the maintainer
//! - [`maintainer`]: Background reconciliation and retention
//! - [`health`]: Health report and HTTP endpoint

#![deny(missing_docs)]

use chrono::{DateTime, SubsecRound, Utc};

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Health report and optional HTTP endpoint.
pub mod health;

/// Repository facade that runs mutations through the interceptor chain.
pub mod interceptable;

/// Interceptor traits, ordering directives and registry.
pub mod interceptors;

/// Background reconciliation of operation records.
pub mod maintainer;

/// Embedded schema migrations.
pub mod migrations;

/// Resource model, labels and criteria.
pub mod object;

/// Operation records and their state machine.
pub mod operation;

/// Storage traits and the SQLite backend.
pub mod persistence;

/// Resumers and orphan mitigators.
pub mod recovery;

/// Worker pools, admission control and action execution.
pub mod scheduler;

pub use config::{Config, OperationsConfig};
pub use error::{Error, Result};
pub use interceptable::InterceptableRepository;
pub use interceptors::{InterceptContext, InterceptorRegistry};
pub use maintainer::Maintainer;
pub use object::{Criterion, ObjectType, Resource};
pub use operation::{FailurePolicy, Operation, OperationError, OperationState, OperationType};
pub use persistence::{Repository, SqliteRepository};
pub use recovery::ActionRegistry;
pub use scheduler::{Action, ActionContext, ActionError, Job, Scheduler, SchedulerError};

/// Current time at the precision storage keeps, so compare-and-set on
/// `updated_at` matches what was read back.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
