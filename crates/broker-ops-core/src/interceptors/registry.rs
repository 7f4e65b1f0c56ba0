// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interceptor registration and the finalized, ordered registry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::ordering::{Anchor, resolve};
use super::{CreateInterceptor, DeleteInterceptor, Layer, Phase, UpdateInterceptor};
use crate::error::{Error, Result};
use crate::object::ObjectType;

#[derive(Debug, Clone, Default)]
struct Position {
    around: Option<Anchor>,
    on_tx: Option<Anchor>,
}

struct Registration<T: ?Sized> {
    object_type: ObjectType,
    name: String,
    hook: Arc<T>,
    position: Position,
}

/// Ordered hooks of one (resource type, phase).
pub(crate) struct Chain<T: ?Sized> {
    pub(crate) around: Vec<Arc<T>>,
    pub(crate) on_tx: Vec<Arc<T>>,
    around_names: Vec<String>,
    on_tx_names: Vec<String>,
}

impl<T: ?Sized> Chain<T> {
    fn names(&self, layer: Layer) -> Vec<&str> {
        let names = match layer {
            Layer::AroundTx => &self.around_names,
            Layer::OnTx => &self.on_tx_names,
        };
        names.iter().map(String::as_str).collect()
    }
}

/// Collects interceptor registrations during startup.
///
/// ```ignore
/// let mut builder = InterceptorRegistry::builder();
/// builder
///     .create(ObjectType::ServiceInstance, "labels", LabelEnricher)
///     .register();
/// builder
///     .create(ObjectType::ServiceInstance, "notifications", Notifier)
///     .after("labels")
///     .register();
/// let registry = builder.build()?;
/// ```
#[derive(Default)]
pub struct InterceptorRegistryBuilder {
    create: Vec<Registration<dyn CreateInterceptor>>,
    update: Vec<Registration<dyn UpdateInterceptor>>,
    delete: Vec<Registration<dyn DeleteInterceptor>>,
}

impl InterceptorRegistryBuilder {
    /// Start registering a create interceptor.
    pub fn create(
        &mut self,
        object_type: ObjectType,
        name: impl Into<String>,
        hook: impl CreateInterceptor + 'static,
    ) -> RegistrationBuilder<'_, dyn CreateInterceptor> {
        RegistrationBuilder::new(&mut self.create, object_type, name.into(), Arc::new(hook))
    }

    /// Start registering an update interceptor.
    pub fn update(
        &mut self,
        object_type: ObjectType,
        name: impl Into<String>,
        hook: impl UpdateInterceptor + 'static,
    ) -> RegistrationBuilder<'_, dyn UpdateInterceptor> {
        RegistrationBuilder::new(&mut self.update, object_type, name.into(), Arc::new(hook))
    }

    /// Start registering a delete interceptor.
    pub fn delete(
        &mut self,
        object_type: ObjectType,
        name: impl Into<String>,
        hook: impl DeleteInterceptor + 'static,
    ) -> RegistrationBuilder<'_, dyn DeleteInterceptor> {
        RegistrationBuilder::new(&mut self.delete, object_type, name.into(), Arc::new(hook))
    }

    /// Resolve every chain into its execution order.
    ///
    /// Fails on duplicate names within a (type, phase), on directives naming an
    /// unknown interceptor and on cyclic directives.
    pub fn build(self) -> Result<InterceptorRegistry> {
        let registry = InterceptorRegistry {
            create: finalize(Phase::Create, self.create)?,
            update: finalize(Phase::Update, self.update)?,
            delete: finalize(Phase::Delete, self.delete)?,
        };
        debug!(
            create_chains = registry.create.len(),
            update_chains = registry.update.len(),
            delete_chains = registry.delete.len(),
            "Interceptor registry built"
        );
        Ok(registry)
    }
}

/// A pending registration; nothing is recorded until [`register`](Self::register).
#[must_use = "call register() to add the interceptor"]
pub struct RegistrationBuilder<'a, T: ?Sized> {
    target: &'a mut Vec<Registration<T>>,
    registration: Registration<T>,
}

impl<'a, T: ?Sized> RegistrationBuilder<'a, T> {
    fn new(
        target: &'a mut Vec<Registration<T>>,
        object_type: ObjectType,
        name: String,
        hook: Arc<T>,
    ) -> Self {
        Self {
            target,
            registration: Registration {
                object_type,
                name,
                hook,
                position: Position::default(),
            },
        }
    }

    /// Run immediately before `name`, in both layers.
    pub fn before(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.registration.position.around = Some(Anchor::Before(name.clone()));
        self.registration.position.on_tx = Some(Anchor::Before(name));
        self
    }

    /// Run immediately after `name`, in both layers.
    pub fn after(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.registration.position.around = Some(Anchor::After(name.clone()));
        self.registration.position.on_tx = Some(Anchor::After(name));
        self
    }

    /// Place the around hook immediately before `name`'s around hook.
    pub fn around_tx_before(mut self, name: impl Into<String>) -> Self {
        self.registration.position.around = Some(Anchor::Before(name.into()));
        self
    }

    /// Place the around hook immediately after `name`'s around hook.
    pub fn around_tx_after(mut self, name: impl Into<String>) -> Self {
        self.registration.position.around = Some(Anchor::After(name.into()));
        self
    }

    /// Place the on-transaction hook immediately before `name`'s on-transaction hook.
    pub fn tx_before(mut self, name: impl Into<String>) -> Self {
        self.registration.position.on_tx = Some(Anchor::Before(name.into()));
        self
    }

    /// Place the on-transaction hook immediately after `name`'s on-transaction hook.
    pub fn tx_after(mut self, name: impl Into<String>) -> Self {
        self.registration.position.on_tx = Some(Anchor::After(name.into()));
        self
    }

    /// Record the registration.
    pub fn register(self) {
        self.target.push(self.registration);
    }
}

fn finalize<T: ?Sized>(
    phase: Phase,
    registrations: Vec<Registration<T>>,
) -> Result<HashMap<ObjectType, Chain<T>>> {
    let mut by_type: BTreeMap<ObjectType, Vec<Registration<T>>> = BTreeMap::new();
    for registration in registrations {
        by_type
            .entry(registration.object_type)
            .or_default()
            .push(registration);
    }

    let mut chains = HashMap::with_capacity(by_type.len());
    for (object_type, group) in by_type {
        let context = |e: Error| match e {
            Error::InterceptorConfiguration(msg) => Error::InterceptorConfiguration(format!(
                "{} interceptors of {}: {}",
                phase, object_type, msg
            )),
            other => other,
        };

        let mut seen = HashSet::new();
        for registration in &group {
            if !seen.insert(registration.name.as_str()) {
                return Err(context(Error::InterceptorConfiguration(format!(
                    "interceptor '{}' registered twice",
                    registration.name
                ))));
            }
        }

        let around_entries: Vec<(&str, Option<&Anchor>)> = group
            .iter()
            .map(|r| (r.name.as_str(), r.position.around.as_ref()))
            .collect();
        let on_tx_entries: Vec<(&str, Option<&Anchor>)> = group
            .iter()
            .map(|r| (r.name.as_str(), r.position.on_tx.as_ref()))
            .collect();
        let around_order = resolve(&around_entries).map_err(context)?;
        let on_tx_order = resolve(&on_tx_entries).map_err(context)?;

        chains.insert(
            object_type,
            Chain {
                around: around_order.iter().map(|&i| group[i].hook.clone()).collect(),
                on_tx: on_tx_order.iter().map(|&i| group[i].hook.clone()).collect(),
                around_names: around_order.iter().map(|&i| group[i].name.clone()).collect(),
                on_tx_names: on_tx_order.iter().map(|&i| group[i].name.clone()).collect(),
            },
        );
    }
    Ok(chains)
}

/// Finalized interceptor chains, one per resource type and phase.
///
/// Built once at startup and shared by reference; execution never re-sorts.
#[derive(Default)]
pub struct InterceptorRegistry {
    create: HashMap<ObjectType, Chain<dyn CreateInterceptor>>,
    update: HashMap<ObjectType, Chain<dyn UpdateInterceptor>>,
    delete: HashMap<ObjectType, Chain<dyn DeleteInterceptor>>,
}

impl InterceptorRegistry {
    /// Start collecting registrations.
    pub fn builder() -> InterceptorRegistryBuilder {
        InterceptorRegistryBuilder::default()
    }

    /// Interceptor names of one chain layer, in execution order.
    pub fn order(&self, object_type: ObjectType, phase: Phase, layer: Layer) -> Vec<&str> {
        let chain_names = match phase {
            Phase::Create => self.create.get(&object_type).map(|c| c.names(layer)),
            Phase::Update => self.update.get(&object_type).map(|c| c.names(layer)),
            Phase::Delete => self.delete.get(&object_type).map(|c| c.names(layer)),
        };
        chain_names.unwrap_or_default()
    }

    pub(crate) fn create_chain(
        &self,
        object_type: ObjectType,
    ) -> (&[Arc<dyn CreateInterceptor>], &[Arc<dyn CreateInterceptor>]) {
        match self.create.get(&object_type) {
            Some(chain) => (chain.around.as_slice(), chain.on_tx.as_slice()),
            None => (&[][..], &[][..]),
        }
    }

    pub(crate) fn update_chain(
        &self,
        object_type: ObjectType,
    ) -> (&[Arc<dyn UpdateInterceptor>], &[Arc<dyn UpdateInterceptor>]) {
        match self.update.get(&object_type) {
            Some(chain) => (chain.around.as_slice(), chain.on_tx.as_slice()),
            None => (&[][..], &[][..]),
        }
    }

    pub(crate) fn delete_chain(
        &self,
        object_type: ObjectType,
    ) -> (&[Arc<dyn DeleteInterceptor>], &[Arc<dyn DeleteInterceptor>]) {
        match self.delete.get(&object_type) {
            Some(chain) => (chain.around.as_slice(), chain.on_tx.as_slice()),
            None => (&[][..], &[][..]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl CreateInterceptor for Noop {}
    impl UpdateInterceptor for Noop {}
    impl DeleteInterceptor for Noop {}

    #[test]
    fn test_empty_registry_has_no_hooks() {
        let registry = InterceptorRegistry::builder().build().unwrap();
        let (around, on_tx) = registry.create_chain(ObjectType::Broker);
        assert!(around.is_empty());
        assert!(on_tx.is_empty());
        assert!(
            registry
                .order(ObjectType::Broker, Phase::Delete, Layer::OnTx)
                .is_empty()
        );
    }

    #[test]
    fn test_plain_directives_order_both_layers() {
        let mut builder = InterceptorRegistry::builder();
        builder.create(ObjectType::Platform, "1", Noop).register();
        builder
            .create(ObjectType::Platform, "0", Noop)
            .before("1")
            .register();
        builder
            .create(ObjectType::Platform, "2", Noop)
            .after("1")
            .register();
        let registry = builder.build().unwrap();

        for layer in [Layer::AroundTx, Layer::OnTx] {
            assert_eq!(
                registry.order(ObjectType::Platform, Phase::Create, layer),
                vec!["0", "1", "2"]
            );
        }
    }

    #[test]
    fn test_around_directive_leaves_on_tx_hook_appended() {
        let mut builder = InterceptorRegistry::builder();
        builder.update(ObjectType::Broker, "a", Noop).register();
        builder.update(ObjectType::Broker, "b", Noop).register();
        builder
            .update(ObjectType::Broker, "c", Noop)
            .around_tx_before("a")
            .register();
        let registry = builder.build().unwrap();

        assert_eq!(
            registry.order(ObjectType::Broker, Phase::Update, Layer::AroundTx),
            vec!["c", "a", "b"]
        );
        assert_eq!(
            registry.order(ObjectType::Broker, Phase::Update, Layer::OnTx),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_chains_are_scoped_per_type_and_phase() {
        let mut builder = InterceptorRegistry::builder();
        builder.delete(ObjectType::ServiceInstance, "x", Noop).register();
        builder.delete(ObjectType::ServiceBinding, "x", Noop).register();
        builder.create(ObjectType::ServiceInstance, "x", Noop).register();
        let registry = builder.build().unwrap();

        assert_eq!(registry.delete_chain(ObjectType::ServiceInstance).1.len(), 1);
        assert_eq!(registry.delete_chain(ObjectType::ServiceBinding).1.len(), 1);
        assert!(registry.update_chain(ObjectType::ServiceInstance).1.is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut builder = InterceptorRegistry::builder();
        builder.create(ObjectType::Broker, "dup", Noop).register();
        builder.create(ObjectType::Broker, "dup", Noop).register();

        let err = builder.build().err().unwrap();
        assert!(matches!(err, Error::InterceptorConfiguration(ref msg) if msg.contains("dup")));
    }

    #[test]
    fn test_unknown_anchor_rejected_with_context() {
        let mut builder = InterceptorRegistry::builder();
        builder
            .delete(ObjectType::Notification, "a", Noop)
            .tx_after("ghost")
            .register();

        let err = builder.build().err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("ghost"), "{}", msg);
        assert!(msg.contains("notification"), "{}", msg);
        assert!(msg.contains("delete"), "{}", msg);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut builder = InterceptorRegistry::builder();
        builder
            .create(ObjectType::Broker, "a", Noop)
            .after("b")
            .register();
        builder
            .create(ObjectType::Broker, "b", Noop)
            .after("a")
            .register();

        assert!(builder.build().is_err());
    }

    #[test]
    fn test_unregistered_builder_records_nothing() {
        let mut builder = InterceptorRegistry::builder();
        let _ = builder.create(ObjectType::Broker, "forgotten", Noop);
        let registry = builder.build().unwrap();
        assert!(
            registry
                .order(ObjectType::Broker, Phase::Create, Layer::OnTx)
                .is_empty()
        );
    }
}
