// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for broker-ops-core.
//!
//! Provides a unified error type with stable machine-readable codes that the
//! external protocol layer maps onto its own responses.

use thiserror::Error;

use crate::object::ObjectType;

/// Result type using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by storage, the interceptor chain and configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A resource was not found.
    #[error("{object_type} '{id}' not found")]
    NotFound {
        /// Collection the lookup targeted.
        object_type: ObjectType,
        /// The missing identifier.
        id: String,
    },

    /// A record with the same identifier already exists.
    #[error("{object_type} '{id}' already exists")]
    AlreadyExists {
        /// Collection the insert targeted.
        object_type: ObjectType,
        /// The duplicate identifier.
        id: String,
    },

    /// An operation was not found.
    #[error("Operation '{operation_id}' not found")]
    OperationNotFound {
        /// The missing operation id.
        operation_id: String,
    },

    /// An operation with the same id already exists.
    #[error("Operation '{operation_id}' already exists")]
    OperationAlreadyExists {
        /// The duplicate operation id.
        operation_id: String,
    },

    /// Another operation is already in progress for the resource.
    #[error("Resource '{resource_id}' already has an operation in progress")]
    ResourceBusy {
        /// The resource with an in-flight operation.
        resource_id: String,
    },

    /// The requested state change is not allowed by the operation state machine.
    #[error("Operation '{operation_id}' cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        /// The operation being changed.
        operation_id: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// An interceptor rejected the mutation; the whole chain was aborted.
    #[error("Interceptor '{interceptor}' aborted the operation: {message}")]
    InterceptorAborted {
        /// Name of the rejecting interceptor.
        interceptor: String,
        /// Reason given by the interceptor.
        message: String,
    },

    /// Interceptor registrations could not be resolved into a total order.
    #[error("Invalid interceptor configuration: {0}")]
    InterceptorConfiguration(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::Database(_) | Self::Migration(_) => "DATABASE_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::NotFound { .. } | Self::OperationNotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } | Self::OperationAlreadyExists { .. } => "ALREADY_EXISTS",
            Self::ResourceBusy { .. } => "RESOURCE_BUSY",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InterceptorAborted { .. } => "INTERCEPTOR_ABORTED",
            Self::InterceptorConfiguration(_) => "INTERCEPTOR_CONFIGURATION",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Shorthand used by interceptors to reject a mutation.
    pub fn aborted(interceptor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InterceptorAborted {
            interceptor: interceptor.into(),
            message: message.into(),
        }
    }
}
