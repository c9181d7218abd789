//! Registry of live sequencers.
//!
//! Writers are serialised by a mutex and publish a new snapshot vector on
//! every structural change. Readers load the current snapshot through
//! `ArcSwap` without blocking writers or each other; a snapshot never changes
//! once handed out.

use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use crate::config::SequencerConfig;
use crate::error::RegistryError;
use crate::path::PathExpression;
use crate::sequencer::{Sequencer, SequencerFactory};

/// Immutable view of the registry.
pub type RegistrySnapshot = Arc<Vec<Arc<Registration>>>;

/// One live sequencer with the configuration it was built from.
pub struct Registration {
    config: SequencerConfig,
    sequencer: Arc<dyn Sequencer>,
    path_expressions: Vec<PathExpression>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.config.name())
            .field("path_expressions", &self.path_expressions)
            .finish_non_exhaustive()
    }
}

impl Registration {
    /// Builds, configures and validates a sequencer for `config`.
    ///
    /// # Errors
    ///
    /// Any failure to compile a path expression, create the instance,
    /// configure it, or have it report the configuration back.
    pub fn instantiate(config: SequencerConfig, factory: &dyn SequencerFactory) -> Result<Self, RegistryError> {
        let path_expressions =
            config
                .compile_path_expressions()
                .map_err(|source| RegistryError::InvalidPathExpression {
                    sequencer: config.name().to_string(),
                    source,
                })?;

        let mut sequencer = factory.create(config.implementation())?;
        sequencer
            .configure(config.clone())
            .map_err(|e| RegistryError::Instantiation {
                sequencer: config.name().to_string(),
                message: e.to_string(),
            })?;

        let retained = sequencer
            .configuration()
            .is_some_and(|c| c.is_same(&config) && !c.has_changed(&config));
        if !retained {
            return Err(RegistryError::ConfigurationNotRetained {
                sequencer: config.name().to_string(),
            });
        }

        Ok(Self {
            config,
            sequencer: Arc::from(sequencer),
            path_expressions,
        })
    }

    /// Configured sequencer name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Configuration this entry was built from.
    #[must_use]
    pub const fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// The live sequencer instance.
    #[must_use]
    pub fn sequencer(&self) -> &Arc<dyn Sequencer> {
        &self.sequencer
    }

    /// Compiled path expressions, in configuration order.
    #[must_use]
    pub fn path_expressions(&self) -> &[PathExpression] {
        &self.path_expressions
    }

    /// True when some expression matches the node path or one of the
    /// `<node>/@<property>` paths. A registration without expressions
    /// applies to every node.
    #[must_use]
    pub fn applies_to(&self, node_path: &str, properties: &[String]) -> bool {
        self.path_expressions.is_empty()
            || candidate_paths(node_path, properties)
                .iter()
                .any(|path| self.path_expressions.iter().any(|e| e.is_match(path)))
    }

    /// Output locations for one node, in expression order without duplicates.
    ///
    /// Falls back to the node path when no expression selects anything.
    #[must_use]
    pub fn output_paths(&self, node_path: &str, properties: &[String]) -> Vec<String> {
        let candidates = candidate_paths(node_path, properties);
        let mut outputs: Vec<String> = Vec::new();
        for expression in &self.path_expressions {
            for candidate in &candidates {
                if let Some(output) = expression.matches(candidate) {
                    let output = owning_node(&output).to_string();
                    if !outputs.contains(&output) {
                        outputs.push(output);
                    }
                }
            }
        }
        if outputs.is_empty() {
            outputs.push(node_path.to_string());
        }
        outputs
    }
}

fn candidate_paths(node_path: &str, properties: &[String]) -> Vec<String> {
    let base = node_path.trim_end_matches('/');
    let mut paths = Vec::with_capacity(properties.len() + 1);
    paths.push(if base.is_empty() { "/".to_string() } else { base.to_string() });
    paths.extend(properties.iter().map(|p| format!("{base}/@{p}")));
    paths
}

/// Strips a trailing `@property` segment so outputs always name nodes.
fn owning_node(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) if path[idx + 1..].starts_with('@') => {
            if idx == 0 {
                "/"
            } else {
                &path[..idx]
            }
        }
        _ => path,
    }
}

/// Registry of sequencers keyed by configuration name.
pub struct SequencerRegistry {
    factory: Arc<dyn SequencerFactory>,
    write_lock: Mutex<()>,
    entries: ArcSwap<Vec<Arc<Registration>>>,
}

impl std::fmt::Debug for SequencerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencerRegistry")
            .field("entries", &self.entries.load().len())
            .finish_non_exhaustive()
    }
}

impl SequencerRegistry {
    /// Creates an empty registry that instantiates sequencers with `factory`.
    pub fn new(factory: impl SequencerFactory + 'static) -> Self {
        Self::with_factory(Arc::new(factory))
    }

    /// Creates an empty registry sharing an existing factory.
    #[must_use]
    pub fn with_factory(factory: Arc<dyn SequencerFactory>) -> Self {
        Self {
            factory,
            write_lock: Mutex::new(()),
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    fn lock_writers(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`; a panic in another writer leaves nothing to repair.
        self.write_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Adds a sequencer, or replaces the live one with the same name when the
    /// configuration changed.
    ///
    /// Returns `Ok(false)` when an identical configuration is already live.
    ///
    /// # Errors
    ///
    /// Instantiation failures leave the registry unchanged.
    pub fn add(&self, config: SequencerConfig) -> Result<bool, RegistryError> {
        let _guard = self.lock_writers();
        let current = self.entries.load_full();
        let existing = current.iter().position(|r| r.config.is_same(&config));
        if let Some(idx) = existing {
            if !current[idx].config.has_changed(&config) {
                debug!(sequencer = %config.name(), "sequencer configuration unchanged");
                return Ok(false);
            }
        }

        let name = config.name().to_string();
        let registration = match Registration::instantiate(config, self.factory.as_ref()) {
            Ok(registration) => Arc::new(registration),
            Err(e) => {
                warn!(sequencer = %name, error = %e, "failed to instantiate sequencer");
                return Err(e);
            }
        };

        let mut next: Vec<Arc<Registration>> = current.as_ref().clone();
        match existing {
            Some(idx) => {
                next[idx] = registration;
                info!(sequencer = %name, "replaced sequencer");
            }
            None => {
                next.push(registration);
                info!(sequencer = %name, "added sequencer");
            }
        }
        self.entries.store(Arc::new(next));
        Ok(true)
    }

    /// Same as [`add`](Self::add).
    ///
    /// # Errors
    ///
    /// See [`add`](Self::add).
    pub fn update(&self, config: SequencerConfig) -> Result<bool, RegistryError> {
        self.add(config)
    }

    /// Removes the entry with the same name; returns true if one was removed.
    pub fn remove(&self, config: &SequencerConfig) -> bool {
        self.remove_named(config.name())
    }

    /// Removes the entry named `name`; returns true if one was removed.
    pub fn remove_named(&self, name: &str) -> bool {
        let _guard = self.lock_writers();
        let current = self.entries.load_full();
        let next: Vec<Arc<Registration>> = current.iter().filter(|r| r.name() != name).cloned().collect();
        if next.len() == current.len() {
            return false;
        }
        self.entries.store(Arc::new(next));
        info!(sequencer = %name, "removed sequencer");
        true
    }

    /// The current entries, in registration order.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.entries.load_full()
    }

    /// Live entry named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Registration>> {
        self.entries.load().iter().find(|r| r.name() == name).cloned()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Configurations of the live entries.
    #[must_use]
    pub fn configurations(&self) -> Vec<SequencerConfig> {
        self.entries.load().iter().map(|r| r.config.clone()).collect()
    }
}
