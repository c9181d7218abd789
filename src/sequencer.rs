//! The sequencer plugin contract.
//!
//! A sequencer extracts content from a changed node and writes derived nodes
//! through the session it is handed. Instances are shared across worker
//! threads, so `execute` takes `&self` and must not keep per-node state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ImplementationRef, SequencerConfig};
use crate::error::{RegistryError, SequencerError};
use crate::store::{ContentNode, Session};

/// Cancellation handle passed to a running sequencer.
///
/// Clones share state. A monitor created with a deadline reports itself
/// cancelled once the deadline passes.
#[derive(Debug, Clone, Default)]
pub struct ProgressMonitor {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl ProgressMonitor {
    /// Creates a monitor without a deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a monitor that expires `budget` from now.
    #[must_use]
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(budget),
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancelled or past the deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.is_expired()
    }

    /// True once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Instant after which the monitor reports cancellation.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `Err(Cancelled)` once cancelled; sequencers call this between units of work.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::Cancelled`] when cancellation was requested
    /// or the deadline has passed.
    pub fn check(&self) -> Result<(), SequencerError> {
        if self.is_cancelled() {
            Err(SequencerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything a sequencer knows about the change it is running for.
#[derive(Debug, Clone)]
pub struct SequencerContext {
    workspace: String,
    input_path: String,
    output_paths: Vec<String>,
    properties: Vec<String>,
    monitor: ProgressMonitor,
}

impl SequencerContext {
    /// Creates a context whose only output path is the input path.
    #[must_use]
    pub fn new(workspace: impl Into<String>, input_path: impl Into<String>, monitor: ProgressMonitor) -> Self {
        let input_path = input_path.into();
        Self {
            workspace: workspace.into(),
            output_paths: vec![input_path.clone()],
            input_path,
            properties: Vec::new(),
            monitor,
        }
    }

    /// Replaces the output paths; an empty list keeps the input path.
    #[must_use]
    pub fn with_output_paths(mut self, output_paths: Vec<String>) -> Self {
        if !output_paths.is_empty() {
            self.output_paths = output_paths;
        }
        self
    }

    /// Sets the names of the properties touched by the change.
    #[must_use]
    pub fn with_properties(mut self, properties: Vec<String>) -> Self {
        self.properties = properties;
        self
    }

    /// Workspace of the node being sequenced.
    #[must_use]
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// Path of the changed node.
    #[must_use]
    pub fn input_path(&self) -> &str {
        &self.input_path
    }

    /// Nodes under which output should be written. Never empty.
    #[must_use]
    pub fn output_paths(&self) -> &[String] {
        &self.output_paths
    }

    /// Properties of the input node that changed.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Progress monitor shared by every sequencer of this node.
    #[must_use]
    pub const fn monitor(&self) -> &ProgressMonitor {
        &self.monitor
    }
}

/// A content sequencer.
pub trait Sequencer: Send + Sync {
    /// Applies a configuration. Called once, before the first `execute`.
    fn configure(&mut self, config: SequencerConfig) -> Result<(), SequencerError>;

    /// The configuration last applied.
    fn configuration(&self) -> Option<&SequencerConfig>;

    /// Sequences one node, writing output through `session`.
    ///
    /// The session is saved by the caller after this returns successfully.
    fn execute(&self, node: &ContentNode, session: &mut dyn Session, ctx: &SequencerContext) -> Result<(), SequencerError>;
}

/// Builds sequencer instances for an [`ImplementationRef`].
pub trait SequencerFactory: Send + Sync {
    /// Creates a fresh, unconfigured instance.
    fn create(&self, implementation: &ImplementationRef) -> Result<Box<dyn Sequencer>, RegistryError>;
}

/// Constructor registered with a [`FactoryRegistry`].
pub type SequencerConstructor = dyn Fn() -> Result<Box<dyn Sequencer>, SequencerError> + Send + Sync;

/// Factory that maps implementation names to constructors.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    constructors: HashMap<String, Arc<SequencerConstructor>>,
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("FactoryRegistry").field("implementations", &names).finish()
    }
}

impl FactoryRegistry {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor, replacing any previous one with the same name.
    pub fn register<F>(&mut self, implementation: impl Into<String>, constructor: F)
    where
        F: Fn() -> Result<Box<dyn Sequencer>, SequencerError> + Send + Sync + 'static,
    {
        self.constructors.insert(implementation.into(), Arc::new(constructor));
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with<F>(mut self, implementation: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Sequencer>, SequencerError> + Send + Sync + 'static,
    {
        self.register(implementation, constructor);
        self
    }

    /// True when a constructor is registered under `implementation`.
    #[must_use]
    pub fn contains(&self, implementation: &str) -> bool {
        self.constructors.contains_key(implementation)
    }
}

impl SequencerFactory for FactoryRegistry {
    fn create(&self, implementation: &ImplementationRef) -> Result<Box<dyn Sequencer>, RegistryError> {
        let constructor = self
            .constructors
            .get(&implementation.name)
            .ok_or_else(|| RegistryError::UnknownImplementation {
                implementation: implementation.name.clone(),
            })?;
        constructor().map_err(|e| RegistryError::Instantiation {
            sequencer: implementation.name.clone(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop {
        config: Option<SequencerConfig>,
    }

    impl Sequencer for Noop {
        fn configure(&mut self, config: SequencerConfig) -> Result<(), SequencerError> {
            self.config = Some(config);
            Ok(())
        }

        fn configuration(&self) -> Option<&SequencerConfig> {
            self.config.as_ref()
        }

        fn execute(&self, _: &ContentNode, _: &mut dyn Session, ctx: &SequencerContext) -> Result<(), SequencerError> {
            ctx.monitor().check()
        }
    }

    #[test]
    fn test_monitor_cancel_is_shared() {
        let monitor = ProgressMonitor::new();
        let clone = monitor.clone();
        assert!(monitor.check().is_ok());
        clone.cancel();
        assert!(monitor.is_cancelled());
        assert!(matches!(monitor.check(), Err(SequencerError::Cancelled)));
    }

    #[test]
    fn test_monitor_budget_expires() {
        let monitor = ProgressMonitor::with_budget(Duration::ZERO);
        assert!(monitor.is_expired());
        assert!(monitor.is_cancelled());

        let monitor = ProgressMonitor::with_budget(Duration::from_secs(3600));
        assert!(!monitor.is_cancelled());
        assert!(monitor.deadline().is_some());
    }

    #[test]
    fn test_context_output_paths_default_to_input() {
        let ctx = SequencerContext::new("default", "/a/b", ProgressMonitor::new());
        assert_eq!(ctx.output_paths(), ["/a/b"]);
        let ctx = ctx.with_output_paths(Vec::new());
        assert_eq!(ctx.output_paths(), ["/a/b"]);
        let ctx = ctx
            .with_output_paths(vec!["/out".to_string()])
            .with_properties(vec!["title".to_string()]);
        assert_eq!(ctx.output_paths(), ["/out"]);
        assert_eq!(ctx.properties(), ["title"]);
        assert_eq!(ctx.input_path(), "/a/b");
    }

    #[test]
    fn test_factory_resolves_by_name() {
        let factory = FactoryRegistry::new()
            .with("noop", || Ok(Box::new(Noop { config: None }) as Box<dyn Sequencer>))
            .with("broken", || Err(SequencerError::execution("broken", "no codec")));
        assert!(factory.contains("noop"));

        let seq = factory.create(&ImplementationRef::new("noop")).unwrap();
        assert!(seq.configuration().is_none());

        let err = factory.create(&ImplementationRef::new("missing")).err().unwrap();
        assert!(matches!(err, RegistryError::UnknownImplementation { .. }));

        let err = factory.create(&ImplementationRef::new("broken")).err().unwrap();
        assert!(format!("{err}").contains("no codec"));
    }
}
