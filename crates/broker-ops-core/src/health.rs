// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health reporting: storage connectivity and worker pool liveness.

#[cfg(feature = "http")]
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::persistence::Repository;
use crate::scheduler::{PoolStatus, Scheduler};

/// Snapshot of the engine's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `UP` when storage answers and no pool is stalled, otherwise `DOWN`.
    pub status: &'static str,
    /// Whether the storage round trip succeeded.
    pub storage: bool,
    /// Load of every worker pool.
    pub pools: Vec<PoolStatus>,
}

impl HealthReport {
    /// Ping storage and read pool load.
    pub async fn collect(repository: &dyn Repository, scheduler: &Scheduler) -> Self {
        debug!("Health check requested");

        let storage = match repository.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(error = %e, "Storage health check failed");
                false
            }
        };

        Self::new(storage, scheduler.pool_status())
    }

    fn new(storage: bool, pools: Vec<PoolStatus>) -> Self {
        let stalled: Vec<&str> = pools
            .iter()
            .filter(|p| p.stalled)
            .map(|p| p.name.as_str())
            .collect();
        if !stalled.is_empty() {
            warn!(pools = ?stalled, "Worker pools stalled");
        }

        let up = storage && stalled.is_empty();
        Self {
            status: if up { "UP" } else { "DOWN" },
            storage,
            pools,
        }
    }

    /// Whether the engine can serve requests.
    pub fn is_up(&self) -> bool {
        self.status == "UP"
    }
}

#[cfg(feature = "http")]
#[derive(Clone)]
struct HealthState {
    repository: Arc<dyn Repository>,
    scheduler: Scheduler,
}

/// Router serving `GET /healthz`; answers 503 while the report is `DOWN`.
#[cfg(feature = "http")]
pub fn router(repository: Arc<dyn Repository>, scheduler: Scheduler) -> axum::Router {
    axum::Router::new()
        .route("/healthz", axum::routing::get(healthz))
        .with_state(HealthState {
            repository,
            scheduler,
        })
}

#[cfg(feature = "http")]
async fn healthz(
    axum::extract::State(state): axum::extract::State<HealthState>,
) -> (axum::http::StatusCode, axum::Json<HealthReport>) {
    let report = HealthReport::collect(state.repository.as_ref(), &state.scheduler).await;
    let status = if report.is_up() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(report))
}
