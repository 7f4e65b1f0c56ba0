// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interceptor chain around resource mutations.
//!
//! Every create, update and delete of a resource type runs through two nested
//! layers of named hooks:
//!
//! ```text
//! around-tx hooks (outer → inner)
//!   └─ begin transaction
//!        on-tx hooks (outer → inner)
//!          └─ storage write
//!        on-tx hooks unwind (inner → outer)
//!      commit (or roll back on any error)
//! around-tx hooks unwind (inner → outer)
//! ```
//!
//! Hooks are continuation-style: each receives a `Next` value and decides
//! what runs before and after calling it. Returning an error aborts the
//! mutation; outer hooks still observe the error as it unwinds, and the
//! transaction is rolled back.
//!
//! Order is fixed when [`InterceptorRegistryBuilder::build`] resolves the
//! position directives of each (resource type, phase); see [`ordering`].

mod create;
mod delete;
pub mod ordering;
mod registry;
mod update;

pub use create::{CreateAroundTxNext, CreateInterceptor, CreateOnTxNext};
pub use delete::{DeleteAroundTxNext, DeleteInterceptor, DeleteOnTxNext};
pub use registry::{InterceptorRegistry, InterceptorRegistryBuilder, RegistrationBuilder};
pub use update::{UpdateAroundTxNext, UpdateInterceptor, UpdateOnTxNext};

use std::fmt;

use crate::operation::Operation;

/// Mutation phase a hook is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Resource creation.
    Create,
    /// Resource update.
    Update,
    /// Resource deletion.
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Nesting level of a hook relative to the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Outside the transaction.
    AroundTx,
    /// Inside the transaction.
    OnTx,
}

/// Request-scoped information handed to every hook.
#[derive(Debug, Clone, Default)]
pub struct InterceptContext {
    /// Operation driving the mutation, if any.
    pub operation_id: Option<String>,
    /// Correlation id of the originating request.
    pub correlation_id: Option<String>,
    /// Platform the request came from.
    pub platform_id: Option<String>,
}

impl InterceptContext {
    /// Context for a mutation performed on behalf of an operation.
    pub fn for_operation(operation: &Operation) -> Self {
        Self {
            operation_id: Some(operation.id.clone()),
            correlation_id: Some(operation.correlation_id.clone()),
            platform_id: Some(operation.platform_id.clone()),
        }
    }
}
