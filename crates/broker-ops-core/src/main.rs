// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker Ops Core - standalone engine process
//!
//! Runs the maintainer loop against a SQLite database and serves the health
//! endpoint. Resource actions, resumers and mitigators are registered by the
//! embedding product and this process has none, so it fails crashed
//! operations, applies the rescheduling timeout and enforces retention.
//! Reschedulable operations and pending orphan mitigations are left for a
//! process that registers the actions.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use broker_ops_core::config::Config;
use broker_ops_core::interceptable::InterceptableRepository;
use broker_ops_core::interceptors::InterceptorRegistry;
use broker_ops_core::maintainer::Maintainer;
use broker_ops_core::persistence::{Repository, SqliteRepository};
use broker_ops_core::recovery::ActionRegistry;
use broker_ops_core::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("broker_ops_core=info".parse()?),
        )
        .init();

    info!("Starting Broker Ops Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        default_pool_size = config.operations.default_pool_size,
        dedicated_pools = config.operations.pools.len(),
        action_timeout_secs = config.operations.action_timeout.as_secs(),
        "Configuration loaded"
    );

    // Connect to database and run migrations
    info!("Connecting to database...");
    let sqlite = SqliteRepository::connect(&config.database_url).await?;
    info!("Database connection established, migrations completed");

    let repository: Arc<dyn Repository> = Arc::new(sqlite.clone());
    let registry = Arc::new(InterceptorRegistry::default());
    let interceptable = InterceptableRepository::new(repository.clone(), registry);
    let scheduler = Scheduler::new(interceptable.clone(), config.operations.clone());

    // Start maintainer; without registered actions it neither resumes nor mitigates
    let maintainer = Maintainer::new(interceptable, scheduler.clone(), ActionRegistry::new());
    let maintainer_shutdown = maintainer.shutdown_handle();
    let maintainer_handle = tokio::spawn(async move {
        maintainer.run().await;
    });

    // Start health endpoint
    #[cfg(feature = "http")]
    let http_handle = {
        let app = broker_ops_core::health::router(repository.clone(), scheduler.clone());
        let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
        info!(addr = %config.http_addr, "Health endpoint listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Health endpoint error: {}", e);
            }
        })
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    maintainer_shutdown.notify_one();
    if let Err(e) = maintainer_handle.await {
        error!("Maintainer task failed: {}", e);
    }

    #[cfg(feature = "http")]
    http_handle.abort();

    sqlite.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}
