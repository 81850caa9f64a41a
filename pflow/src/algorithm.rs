//! The stage contract and its registry: every reconstruction stage implements
//! [`Algorithm`], is created by a factory registered under its type name, and runs
//! against an [`EventContext`] that also lets it invoke child stages by instance
//! name.

use super::config::Config;
use super::error::{Error, Result};
use super::geometry::Detector;
use super::store::EventStore;
use std::collections::BTreeMap;

/// A reconstruction stage. Stages are configured once via [`Algorithm::read_settings`],
/// prepared via [`Algorithm::initialize`] and then invoked once per event.
pub trait Algorithm {
    /// Pull named options and child-stage declarations from the configuration node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for malformed or out-of-range options.
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()>;

    /// One-time setup after settings have been read.
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn initialize(&mut self, detector: &Detector) -> Result<()> {
        let _ = detector;
        Ok(())
    }

    /// Process the current event.
    ///
    /// # Errors
    ///
    /// Any error aborts the event; the driver rolls back open contexts.
    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()>;
}

/// Factory callable producing a fresh, unconfigured stage instance.
pub type AlgorithmFactory = Box<dyn Fn() -> Box<dyn Algorithm>>;

/// Process-wide registry mapping stage type names to factories. User-defined types
/// may be added any time before event processing begins.
#[derive(Default)]
pub struct AlgorithmRegistry {
    factories: BTreeMap<String, AlgorithmFactory>,
}

impl AlgorithmRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a type name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] when the type name is already taken.
    pub fn register(
        &mut self,
        type_name: &str,
        factory: impl Fn() -> Box<dyn Algorithm> + 'static,
    ) -> Result<()> {
        if self.factories.contains_key(type_name) {
            return Err(Error::NotAllowed("algorithm type name already registered"));
        }

        self.factories.insert(type_name.to_owned(), Box::new(factory));
        Ok(())
    }

    /// Whether a type name is registered.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Create a fresh instance of the given stage type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown type name.
    pub fn create(&self, type_name: &str) -> Result<Box<dyn Algorithm>> {
        self.factories
            .get(type_name)
            .map(|factory| factory())
            .ok_or_else(|| Error::OutOfRange(format!("algorithm type {type_name}")))
    }
}

/// Pool of configured stage instances, keyed by instance name.
#[derive(Default)]
pub struct AlgorithmPool {
    instances: BTreeMap<String, Option<Box<dyn Algorithm>>>,
    counter: u32,
}

impl AlgorithmPool {
    /// An empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn unique_name(&mut self, type_name: &str) -> String {
        self.counter += 1;
        format!("{type_name}#{}", self.counter)
    }

    fn insert(&mut self, instance_name: String, algorithm: Box<dyn Algorithm>) {
        self.instances.insert(instance_name, Some(algorithm));
    }

    fn take(&mut self, instance_name: &str) -> Result<Box<dyn Algorithm>> {
        self.instances
            .get_mut(instance_name)
            .ok_or_else(|| Error::OutOfRange(format!("algorithm instance {instance_name}")))?
            .take()
            .ok_or(Error::NotAllowed("stage instance is already running"))
    }

    fn put_back(&mut self, instance_name: &str, algorithm: Box<dyn Algorithm>) {
        if let Some(slot) = self.instances.get_mut(instance_name) {
            *slot = Some(algorithm);
        }
    }

    /// One-time initialisation of every instance, after all settings were read.
    ///
    /// # Errors
    ///
    /// Propagates the first failing [`Algorithm::initialize`].
    pub fn initialize_all(&mut self, detector: &Detector) -> Result<()> {
        for slot in self.instances.values_mut() {
            if let Some(algorithm) = slot.as_mut() {
                algorithm.initialize(detector)?;
            }
        }

        Ok(())
    }
}

/// Creates child stages during `read_settings`: a stage declaration node is resolved
/// through the registry, configured recursively and parked in the pool; the caller
/// stores the returned instance name and runs the child by it later.
pub struct StageBuilder<'a> {
    registry: &'a AlgorithmRegistry,
    pool: &'a mut AlgorithmPool,
}

impl<'a> StageBuilder<'a> {
    /// Build a stage builder over a registry and pool.
    #[must_use]
    pub fn new(registry: &'a AlgorithmRegistry, pool: &'a mut AlgorithmPool) -> Self {
        Self { registry, pool }
    }

    /// Create and configure the stage declared by `node`; returns its instance name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown stage type and propagates the
    /// child's `read_settings` errors.
    pub fn create_stage(&mut self, node: &Config) -> Result<String> {
        let type_name = node.stage_type()?;
        let mut algorithm = self.registry.create(&type_name)?;
        let instance_name = self.pool.unique_name(&type_name);

        algorithm.read_settings(node, self)?;
        self.pool.insert(instance_name.clone(), algorithm);

        Ok(instance_name)
    }

    /// Create and configure the stage declared under `key`, when present.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::create_stage`] errors.
    pub fn create_optional_stage(&mut self, config: &Config, key: &str) -> Result<Option<String>> {
        config.child(key).map_or(Ok(None), |node| self.create_stage(&node).map(Some))
    }

    /// Create and configure every stage declared in the sequence under `key`.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::create_stage`] errors.
    pub fn create_stage_list(&mut self, config: &Config, key: &str) -> Result<Vec<String>> {
        config
            .children(key)
            .iter()
            .map(|node| self.create_stage(node))
            .collect()
    }
}

/// Everything a running stage may touch: the mutable object store, the immutable
/// detector, and the pool for child-stage invocation.
pub struct EventContext<'a> {
    /// The per-event object store.
    pub store: &'a mut EventStore,
    /// The detector context.
    pub detector: &'a Detector,
    pool: &'a mut AlgorithmPool,
}

impl<'a> EventContext<'a> {
    /// Build an event context.
    #[must_use]
    pub fn new(
        store: &'a mut EventStore,
        detector: &'a Detector,
        pool: &'a mut AlgorithmPool,
    ) -> Self {
        Self { store, detector, pool }
    }

    /// Run a child stage by instance name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] on re-entrant invocation and propagates the
    /// child's `run` error.
    pub fn run_stage(&mut self, instance_name: &str) -> Result<()> {
        let mut algorithm = self.pool.take(instance_name)?;
        let result = algorithm.run(&mut EventContext {
            store: &mut *self.store,
            detector: self.detector,
            pool: &mut *self.pool,
        });
        self.pool.put_back(instance_name, algorithm);

        result
    }

    /// Run a clustering child stage against a fresh temporary cluster list, which
    /// becomes current; returns the temporary list name.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::run_stage`] errors; the temporary list is left in place for
    /// the caller or the enclosing context to clean up.
    pub fn run_clustering_stage(&mut self, instance_name: &str) -> Result<String> {
        let list_name = self.store.begin_temporary_cluster_list()?;
        self.run_stage(instance_name)?;
        Ok(list_name)
    }
}
