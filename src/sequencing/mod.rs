//! Event-to-task sequencing pipeline.
//!
//! A [`ChangeListener`] delivers store change batches to a
//! [`SequencingSystem`], which filters and de-duplicates them per node and
//! runs the selected sequencers for each node on a worker pool.

pub mod dispatcher;
pub mod listener;
mod pool;
pub mod selector;
pub mod stats;
pub mod task;

#[cfg(test)]
mod fixtures;

pub use dispatcher::{DispatcherState, SequencingSystem};
pub use listener::ChangeListener;
pub use selector::{AcceptAll, DefaultSelector, EventFilter, EventTypeFilter, PathExpressionSelector, Selector};
pub use stats::{Statistics, StatisticsSnapshot};
pub use task::{process_node_change, ChangedNode, NodeChange, SessionGuard, TaskEnv, TaskOutcome};
