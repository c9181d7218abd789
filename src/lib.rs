//! # sequencing - change-driven content sequencing
//!
//! Watches a hierarchical content store for change notifications and, for
//! every changed node, runs the registered sequencers that apply to it on a
//! worker pool. Sequencers derive additional content from a node and save it
//! through a store session.
//!
//! ## Core Concepts
//!
//! - **PathExpression**: a compiled routing rule mapping a changed path to an
//!   optional output path
//! - **SequencerRegistry**: live sequencer instances, hot-swapped by name
//! - **SequencingSystem**: lifecycle, batch ingress, de-duplication and dispatch
//! - **ContentStore**: the store abstraction, with an in-memory implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sequencing::{
//!     ChangeListener, FactoryRegistry, InMemoryContentStore, SequencerConfig,
//!     SequencerRegistry, SequencingConfig, SequencingSystem,
//! };
//!
//! let factory = FactoryRegistry::new().with("thumbnails", || Ok(Box::new(Thumbnails::default())));
//! let registry = Arc::new(SequencerRegistry::new(factory));
//! registry.add(
//!     SequencerConfig::builder()
//!         .name("thumbnails")
//!         .implementation("thumbnails")
//!         .path_expression("/thumbs/$1[//(*.png)]")
//!         .build()?,
//! )?;
//!
//! let store = InMemoryContentStore::with_workspace("default");
//! let system = Arc::new(SequencingSystem::new(registry, SequencingConfig::default()));
//! system.set_content_store(Arc::new(store.clone()))?;
//! system.start()?;
//!
//! let listener = ChangeListener::new(&system);
//! listener.register(Arc::new(store), ChangeListener::default_filter("default"))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod path;
pub mod registry;
pub mod sequencer;
pub mod sequencing;
pub mod store;

pub use config::{ImplementationRef, SequencerConfig, SequencerConfigBuilder, SequencingConfig};
pub use error::{
    LifecycleError, PathExpressionError, RegistryError, SequencerError, SequencingError, SequencingResult, StoreError,
};
pub use path::PathExpression;
pub use registry::{Registration, RegistrySnapshot, SequencerRegistry};
pub use sequencer::{FactoryRegistry, ProgressMonitor, Sequencer, SequencerContext, SequencerFactory};
pub use sequencing::{
    ChangeListener, DispatcherState, EventFilter, EventTypeFilter, PathExpressionSelector, Selector, SequencingSystem,
    Statistics, StatisticsSnapshot,
};
pub use store::{
    ChangeEvent, ContentNode, ContentStore, EventSink, EventTypes, InMemoryContentStore, Session, SubscriptionFilter,
};
