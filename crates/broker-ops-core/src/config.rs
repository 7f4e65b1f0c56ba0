// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::object::ObjectType;

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Address of the health endpoint
    pub http_addr: SocketAddr,
    /// Scheduler and maintainer settings
    pub operations: OperationsConfig,
}

/// Timeouts, intervals and pool sizes of the lifecycle engine.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationsConfig {
    /// Wall-clock limit for one action, also the staleness threshold for IN_PROGRESS records.
    pub action_timeout: Duration,
    /// How long a reconciled submission waits for the action before giving up.
    pub reconciliation_operation_timeout: Duration,
    /// How long a submission waits for a free worker before being rejected.
    pub admission_timeout: Duration,
    /// Period of stale detection, resumption and orphan mitigation.
    pub maintainer_retry_interval: Duration,
    /// Age after which a reschedulable failure is no longer resumed.
    pub rescheduling_timeout: Duration,
    /// Period of retention cleanup.
    pub cleanup_interval: Duration,
    /// Age after which terminal operations become eligible for deletion.
    pub lifespan: Duration,
    /// Operations deleted per cleanup batch.
    pub delete_operations_batch_size: i64,
    /// Size of the shared worker pool.
    pub default_pool_size: usize,
    /// Dedicated pools per resource type.
    pub pools: HashMap<ObjectType, usize>,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(900),
            reconciliation_operation_timeout: Duration::from_secs(10),
            admission_timeout: Duration::from_millis(100),
            maintainer_retry_interval: Duration::from_secs(60),
            rescheduling_timeout: Duration::from_secs(12 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            lifespan: Duration::from_secs(7 * 24 * 60 * 60),
            delete_operations_batch_size: 100,
            default_pool_size: 20,
            pools: HashMap::new(),
        }
    }
}

impl OperationsConfig {
    /// Load from `BROKER_OPS_*` variables; absent values keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            action_timeout: Duration::from_secs(env_or(
                "BROKER_OPS_ACTION_TIMEOUT_SECS",
                defaults.action_timeout.as_secs(),
                "must be a number of seconds",
            )?),
            reconciliation_operation_timeout: Duration::from_secs(env_or(
                "BROKER_OPS_RECONCILIATION_OPERATION_TIMEOUT_SECS",
                defaults.reconciliation_operation_timeout.as_secs(),
                "must be a number of seconds",
            )?),
            admission_timeout: Duration::from_millis(env_or(
                "BROKER_OPS_ADMISSION_TIMEOUT_MS",
                defaults.admission_timeout.as_millis() as u64,
                "must be a number of milliseconds",
            )?),
            maintainer_retry_interval: Duration::from_secs(env_or(
                "BROKER_OPS_MAINTAINER_RETRY_INTERVAL_SECS",
                defaults.maintainer_retry_interval.as_secs(),
                "must be a number of seconds",
            )?),
            rescheduling_timeout: Duration::from_secs(env_or(
                "BROKER_OPS_RESCHEDULING_TIMEOUT_SECS",
                defaults.rescheduling_timeout.as_secs(),
                "must be a number of seconds",
            )?),
            cleanup_interval: Duration::from_secs(env_or(
                "BROKER_OPS_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval.as_secs(),
                "must be a number of seconds",
            )?),
            lifespan: Duration::from_secs(env_or(
                "BROKER_OPS_OPERATIONS_LIFESPAN_SECS",
                defaults.lifespan.as_secs(),
                "must be a number of seconds",
            )?),
            delete_operations_batch_size: env_or(
                "BROKER_OPS_DELETE_OPERATIONS_BATCH_SIZE",
                defaults.delete_operations_batch_size,
                "must be a positive integer",
            )?,
            default_pool_size: env_or(
                "BROKER_OPS_DEFAULT_POOL_SIZE",
                defaults.default_pool_size,
                "must be a positive integer",
            )?,
            pools: match std::env::var("BROKER_OPS_POOLS") {
                Ok(raw) => parse_pools(&raw)?,
                Err(_) => defaults.pools,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            (self.action_timeout, "BROKER_OPS_ACTION_TIMEOUT_SECS"),
            (
                self.reconciliation_operation_timeout,
                "BROKER_OPS_RECONCILIATION_OPERATION_TIMEOUT_SECS",
            ),
            (self.admission_timeout, "BROKER_OPS_ADMISSION_TIMEOUT_MS"),
            (
                self.maintainer_retry_interval,
                "BROKER_OPS_MAINTAINER_RETRY_INTERVAL_SECS",
            ),
            (self.rescheduling_timeout, "BROKER_OPS_RESCHEDULING_TIMEOUT_SECS"),
            (self.cleanup_interval, "BROKER_OPS_CLEANUP_INTERVAL_SECS"),
            (self.lifespan, "BROKER_OPS_OPERATIONS_LIFESPAN_SECS"),
        ];
        for (value, name) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::Invalid(name, "must be greater than zero"));
            }
        }

        if self.delete_operations_batch_size <= 0 {
            return Err(ConfigError::Invalid(
                "BROKER_OPS_DELETE_OPERATIONS_BATCH_SIZE",
                "must be greater than zero",
            ));
        }
        if self.default_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "BROKER_OPS_DEFAULT_POOL_SIZE",
                "must be greater than zero",
            ));
        }
        if self.pools.values().any(|size| *size == 0) {
            return Err(ConfigError::Invalid(
                "BROKER_OPS_POOLS",
                "pool sizes must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `BROKER_OPS_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `BROKER_OPS_HTTP_PORT`: health endpoint port (default: 8080)
    /// - every `BROKER_OPS_*` setting read by [`OperationsConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("BROKER_OPS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("BROKER_OPS_DATABASE_URL"))?;

        let http_port: u16 = env_or(
            "BROKER_OPS_HTTP_PORT",
            8080,
            "must be a valid port number",
        )?;

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            operations: OperationsConfig::from_env()?,
        })
    }
}

fn env_or<T: FromStr>(
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, message)),
        Err(_) => Ok(default),
    }
}

/// Parse `service_instance=10,service_binding=5`.
fn parse_pools(raw: &str) -> Result<HashMap<ObjectType, usize>, ConfigError> {
    let invalid = || {
        ConfigError::Invalid(
            "BROKER_OPS_POOLS",
            "must be a comma separated list of <object_type>=<size>",
        )
    };

    let mut pools = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, size) = entry.split_once('=').ok_or_else(invalid)?;
        let object_type: ObjectType = name.trim().parse().map_err(|_| invalid())?;
        let size: usize = size.trim().parse().map_err(|_| invalid())?;
        pools.insert(object_type, size);
    }
    Ok(pools)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: [&str; 11] = [
        "BROKER_OPS_HTTP_PORT",
        "BROKER_OPS_ACTION_TIMEOUT_SECS",
        "BROKER_OPS_RECONCILIATION_OPERATION_TIMEOUT_SECS",
        "BROKER_OPS_ADMISSION_TIMEOUT_MS",
        "BROKER_OPS_MAINTAINER_RETRY_INTERVAL_SECS",
        "BROKER_OPS_RESCHEDULING_TIMEOUT_SECS",
        "BROKER_OPS_CLEANUP_INTERVAL_SECS",
        "BROKER_OPS_OPERATIONS_LIFESPAN_SECS",
        "BROKER_OPS_DELETE_OPERATIONS_BATCH_SIZE",
        "BROKER_OPS_DEFAULT_POOL_SIZE",
        "BROKER_OPS_POOLS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        /// Start from a clean slate: database URL set, every optional variable unset.
        fn baseline() -> Self {
            let mut guard = Self::new();
            guard.set("BROKER_OPS_DATABASE_URL", "sqlite::memory:");
            for key in OPTIONAL_VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::baseline();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.operations, OperationsConfig::default());
        assert_eq!(config.operations.action_timeout, Duration::from_secs(900));
        assert_eq!(config.operations.default_pool_size, 20);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::baseline();

        guard.set("BROKER_OPS_DATABASE_URL", "sqlite:/var/lib/ops.db");
        guard.set("BROKER_OPS_HTTP_PORT", "9090");
        guard.set("BROKER_OPS_ACTION_TIMEOUT_SECS", "30");
        guard.set("BROKER_OPS_RECONCILIATION_OPERATION_TIMEOUT_SECS", "2");
        guard.set("BROKER_OPS_ADMISSION_TIMEOUT_MS", "250");
        guard.set("BROKER_OPS_MAINTAINER_RETRY_INTERVAL_SECS", "5");
        guard.set("BROKER_OPS_RESCHEDULING_TIMEOUT_SECS", "600");
        guard.set("BROKER_OPS_CLEANUP_INTERVAL_SECS", "120");
        guard.set("BROKER_OPS_OPERATIONS_LIFESPAN_SECS", "3600");
        guard.set("BROKER_OPS_DELETE_OPERATIONS_BATCH_SIZE", "7");
        guard.set("BROKER_OPS_DEFAULT_POOL_SIZE", "3");
        guard.set("BROKER_OPS_POOLS", "service_instance=10, service_binding=5");

        let config = Config::from_env().unwrap();
        let ops = &config.operations;

        assert_eq!(config.database_url, "sqlite:/var/lib/ops.db");
        assert_eq!(config.http_addr.port(), 9090);
        assert_eq!(ops.action_timeout, Duration::from_secs(30));
        assert_eq!(ops.reconciliation_operation_timeout, Duration::from_secs(2));
        assert_eq!(ops.admission_timeout, Duration::from_millis(250));
        assert_eq!(ops.maintainer_retry_interval, Duration::from_secs(5));
        assert_eq!(ops.rescheduling_timeout, Duration::from_secs(600));
        assert_eq!(ops.cleanup_interval, Duration::from_secs(120));
        assert_eq!(ops.lifespan, Duration::from_secs(3600));
        assert_eq!(ops.delete_operations_batch_size, 7);
        assert_eq!(ops.default_pool_size, 3);
        assert_eq!(ops.pools.len(), 2);
        assert_eq!(ops.pools[&ObjectType::ServiceInstance], 10);
        assert_eq!(ops.pools[&ObjectType::ServiceBinding], 5);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::baseline();

        guard.remove("BROKER_OPS_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BROKER_OPS_DATABASE_URL")));
        assert!(err.to_string().contains("BROKER_OPS_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_http_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::baseline();

        guard.set("BROKER_OPS_HTTP_PORT", "99999"); // > 65535

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("BROKER_OPS_HTTP_PORT", _)));
    }

    #[test]
    fn test_config_invalid_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::baseline();

        guard.set("BROKER_OPS_ACTION_TIMEOUT_SECS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("BROKER_OPS_ACTION_TIMEOUT_SECS", _)
        ));
    }

    #[test]
    fn test_config_rejects_zero_values() {
        let _lock = ENV_MUTEX.lock().unwrap();

        for key in [
            "BROKER_OPS_ACTION_TIMEOUT_SECS",
            "BROKER_OPS_CLEANUP_INTERVAL_SECS",
            "BROKER_OPS_DELETE_OPERATIONS_BATCH_SIZE",
            "BROKER_OPS_DEFAULT_POOL_SIZE",
        ] {
            let mut guard = EnvGuard::baseline();
            guard.set(key, "0");

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid(name, _) if name == key),
                "{} = 0 should be rejected, got {:?}",
                key,
                err
            );
        }
    }

    #[test]
    fn test_config_invalid_pools() {
        let _lock = ENV_MUTEX.lock().unwrap();

        for raw in ["plan=3", "service_instance", "service_instance=x", "broker=0"] {
            let mut guard = EnvGuard::baseline();
            guard.set("BROKER_OPS_POOLS", raw);

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid("BROKER_OPS_POOLS", _)),
                "{:?} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_parse_pools_ignores_empty_entries() {
        let pools = parse_pools("broker=2,,").unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[&ObjectType::Broker], 2);
        assert!(parse_pools("").unwrap().is_empty());
    }

    #[test]
    fn test_default_operations_config_is_valid() {
        assert!(OperationsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
