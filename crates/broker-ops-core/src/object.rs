// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource model shared by the interceptor chain, storage and actions.
//!
//! Resources are the externally visible records (brokers, platforms, service
//! instances, bindings) whose mutations are tracked by operations. The entity
//! type is a closed enum so that interceptor lookup never dispatches on strings.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label set of a resource: key to ordered, de-duplicated values.
pub type Labels = BTreeMap<String, Vec<String>>;

/// Known entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    /// A registered service broker.
    Broker,
    /// A platform (origin of requests) attached to the system.
    Platform,
    /// A provisioned service instance.
    ServiceInstance,
    /// A binding to a service instance.
    ServiceBinding,
    /// A notification record written for platforms to consume.
    Notification,
}

impl ObjectType {
    /// All entity types, in declaration order.
    pub const ALL: [ObjectType; 5] = [
        ObjectType::Broker,
        ObjectType::Platform,
        ObjectType::ServiceInstance,
        ObjectType::ServiceBinding,
        ObjectType::Notification,
    ];

    /// Returns the string representation used in storage and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broker => "broker",
            Self::Platform => "platform",
            Self::ServiceInstance => "service_instance",
            Self::ServiceBinding => "service_binding",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown object type '{}'", s))
    }
}

/// A stored resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique identifier.
    pub id: String,
    /// Entity type of the resource.
    pub object_type: ObjectType,
    /// Labels attached to the resource.
    pub labels: Labels,
    /// Whether the resource is externally visible.
    pub ready: bool,
    /// Type-specific body (broker URL, plan id, parameters, ...).
    pub payload: serde_json::Value,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last written.
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Create a new, not yet ready resource with an empty payload.
    pub fn new(object_type: ObjectType, id: impl Into<String>) -> Self {
        let now = crate::now();
        Self {
            id: id.into(),
            object_type,
            labels: Labels::new(),
            ready: false,
            payload: serde_json::Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Add a label value.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        add_label_values(&mut self.labels, key.into(), vec![value.into()]);
        self
    }

    /// Look up a top-level field for criteria matching.
    ///
    /// `id` and `ready` are record fields, everything else is read from the payload.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "ready" => Some(self.ready.to_string()),
            _ => match self.payload.get(name)? {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            },
        }
    }
}

/// One step of a label update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LabelChange {
    /// Add a key with values, merging into existing values.
    Add {
        /// Label key.
        key: String,
        /// Values to add.
        values: Vec<String>,
    },
    /// Add values to a key, creating it if missing.
    AddValues {
        /// Label key.
        key: String,
        /// Values to add.
        values: Vec<String>,
    },
    /// Remove a key entirely.
    Remove {
        /// Label key.
        key: String,
    },
    /// Remove values from a key; the key disappears once empty.
    RemoveValues {
        /// Label key.
        key: String,
        /// Values to remove.
        values: Vec<String>,
    },
}

/// Apply label changes in order.
pub fn apply_label_changes(labels: &mut Labels, changes: &[LabelChange]) {
    for change in changes {
        match change {
            LabelChange::Add { key, values } | LabelChange::AddValues { key, values } => {
                add_label_values(labels, key.clone(), values.clone());
            }
            LabelChange::Remove { key } => {
                labels.remove(key);
            }
            LabelChange::RemoveValues { key, values } => {
                if let Some(existing) = labels.get_mut(key) {
                    existing.retain(|v| !values.contains(v));
                    if existing.is_empty() {
                        labels.remove(key);
                    }
                }
            }
        }
    }
}

fn add_label_values(labels: &mut Labels, key: String, values: Vec<String>) {
    let existing = labels.entry(key).or_default();
    for value in values {
        if !existing.contains(&value) {
            existing.push(value);
        }
    }
}

/// Whether a criterion targets a record field or a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    /// Matches [`Resource::field`].
    Field,
    /// Matches label values.
    Label,
}

/// Comparison applied by a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Value equals the single right operand.
    Equals,
    /// Value differs from the single right operand.
    NotEquals,
    /// Value is one of the right operands.
    In,
    /// Value is none of the right operands.
    NotIn,
    /// The field or label key is present.
    Exists,
}

/// A filter condition used by list and delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    /// Field or label.
    pub kind: CriterionKind,
    /// Field name or label key.
    pub left: String,
    /// Comparison.
    pub operator: Operator,
    /// Right operands.
    pub right: Vec<String>,
}

impl Criterion {
    /// `field == value`.
    pub fn field_equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: CriterionKind::Field,
            left: field.into(),
            operator: Operator::Equals,
            right: vec![value.into()],
        }
    }

    /// `field IN values`.
    pub fn field_in(field: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            kind: CriterionKind::Field,
            left: field.into(),
            operator: Operator::In,
            right: values,
        }
    }

    /// Label `key` carries `value`.
    pub fn label_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: CriterionKind::Label,
            left: key.into(),
            operator: Operator::Equals,
            right: vec![value.into()],
        }
    }

    /// Label `key` carries none of `values`.
    pub fn label_not_in(key: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            kind: CriterionKind::Label,
            left: key.into(),
            operator: Operator::NotIn,
            right: values,
        }
    }

    /// Evaluate the criterion against a resource.
    pub fn matches(&self, resource: &Resource) -> bool {
        let values: Vec<String> = match self.kind {
            CriterionKind::Field => resource.field(&self.left).into_iter().collect(),
            CriterionKind::Label => resource.labels.get(&self.left).cloned().unwrap_or_default(),
        };

        match self.operator {
            Operator::Exists => !values.is_empty(),
            Operator::Equals => self
                .right
                .first()
                .is_some_and(|expected| values.contains(expected)),
            Operator::NotEquals => self
                .right
                .first()
                .is_none_or(|expected| !values.contains(expected)),
            Operator::In => values.iter().any(|v| self.right.contains(v)),
            Operator::NotIn => !values.iter().any(|v| self.right.contains(v)),
        }
    }
}

/// True when every criterion matches.
pub fn matches_all(criteria: &[Criterion], resource: &Resource) -> bool {
    criteria.iter().all(|c| c.matches(resource))
}
