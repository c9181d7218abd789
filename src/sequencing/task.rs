//! Per-node sequencing task.
//!
//! A task is a plain [`NodeChange`] value; [`process_node_change`] runs every
//! selected sequencer against it. Errors never escape a task: they are logged,
//! counted and turned into [`TaskOutcome::Failed`].

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::error::{SequencerError, SequencingError};
use crate::registry::SequencerRegistry;
use crate::sequencer::{ProgressMonitor, SequencerContext};
use crate::store::{ChangeEvent, ContentStore, EventTypes, NodeId, Session};

use super::selector::Selector;
use super::stats::Statistics;

/// Identity of a changed node: workspace plus path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangedNode {
    workspace: String,
    path: String,
}

impl ChangedNode {
    /// Creates an identity; the path is trimmed.
    #[must_use]
    pub fn new(workspace: impl Into<String>, path: &str) -> Self {
        Self {
            workspace: workspace.into(),
            path: path.trim().to_string(),
        }
    }

    /// Workspace name.
    #[must_use]
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// Trimmed absolute path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Everything observed about one node within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChange {
    node: ChangedNode,
    event_types: EventTypes,
    properties: Vec<String>,
    node_id: Option<NodeId>,
}

impl NodeChange {
    /// Starts a change record for `node` with no events.
    #[must_use]
    pub fn new(node: ChangedNode) -> Self {
        Self {
            node,
            event_types: EventTypes::empty(),
            properties: Vec::new(),
            node_id: None,
        }
    }

    /// Folds one event about this node into the record.
    pub fn absorb(&mut self, event: &ChangeEvent) {
        self.event_types |= event.event_type;
        if let Some(name) = event.property_name() {
            if !self.properties.iter().any(|p| p == name) {
                self.properties.push(name.to_string());
            }
        }
        if self.node_id.is_none() {
            self.node_id = event.node_id;
        }
    }

    /// Identity of the changed node.
    #[must_use]
    pub const fn node(&self) -> &ChangedNode {
        &self.node
    }

    /// Workspace name.
    #[must_use]
    pub fn workspace(&self) -> &str {
        &self.node.workspace
    }

    /// Absolute node path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.node.path
    }

    /// Union of the event types seen for this node.
    #[must_use]
    pub const fn event_types(&self) -> EventTypes {
        self.event_types
    }

    /// True when any of `types` was observed.
    #[must_use]
    pub const fn includes(&self, types: EventTypes) -> bool {
        self.event_types.intersects(types)
    }

    /// Names of the properties added, changed or removed.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Identifier from the first event that carried one.
    #[must_use]
    pub const fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }
}

/// Session that is logged out when dropped.
pub struct SessionGuard(Box<dyn Session>);

impl SessionGuard {
    /// Wraps an open session.
    #[must_use]
    pub fn new(session: Box<dyn Session>) -> Self {
        Self(session)
    }
}

impl Deref for SessionGuard {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.0.is_live() {
            self.0.logout();
        }
    }
}

/// Collaborators a task runs against.
pub struct TaskEnv<'a> {
    /// Store sessions are opened on.
    pub store: &'a dyn ContentStore,
    /// Sequencers to choose from.
    pub registry: &'a SequencerRegistry,
    /// Chooses the sequencers for each node.
    pub selector: &'a dyn Selector,
    /// Counters the outcome is recorded in.
    pub stats: &'a Statistics,
    /// Budget for all sequencers of one node.
    pub task_timeout: Option<Duration>,
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every selected sequencer ran; carries how many.
    Sequenced(usize),
    /// No sequencer was selected.
    Skipped,
    /// Resolution, a sequencer or a save failed.
    Failed,
}

/// Processes one node change and records the outcome in the statistics.
///
/// Each failure is logged once: sequencer failures with the sequencer name,
/// resolution failures without one.
pub fn process_node_change(env: &TaskEnv<'_>, change: &NodeChange) -> TaskOutcome {
    match run(env, change) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                workspace = %change.workspace(),
                path = %change.path(),
                error = %e,
                "failed to sequence node"
            );
            env.stats.record_node_failed();
            TaskOutcome::Failed
        }
    }
}

fn run(env: &TaskEnv<'_>, change: &NodeChange) -> Result<TaskOutcome, SequencingError> {
    let mut session = SessionGuard::new(env.store.open_session(change.workspace())?);
    let node = session.node(change.path())?;

    let snapshot = env.registry.snapshot();
    let selected = env.selector.select(&snapshot, &node, change);
    if selected.is_empty() {
        debug!(workspace = %change.workspace(), path = %change.path(), "no sequencers selected");
        env.stats.record_node_skipped();
        return Ok(TaskOutcome::Skipped);
    }

    let monitor = env.task_timeout.map_or_else(ProgressMonitor::new, ProgressMonitor::with_budget);
    for registration in &selected {
        if monitor.is_cancelled() {
            warn!(
                workspace = %change.workspace(),
                path = %change.path(),
                sequencer = %registration.name(),
                "time budget exhausted; skipping remaining sequencers"
            );
            env.stats.record_node_failed();
            return Ok(TaskOutcome::Failed);
        }

        let ctx = SequencerContext::new(change.workspace(), change.path(), monitor.clone())
            .with_output_paths(registration.output_paths(change.path(), change.properties()))
            .with_properties(change.properties().to_vec());
        trace!(
            path = %change.path(),
            sequencer = %registration.name(),
            outputs = ?ctx.output_paths(),
            "running sequencer"
        );

        let result = registration
            .sequencer()
            .execute(&node, &mut *session, &ctx)
            .and_then(|()| session.save().map_err(SequencerError::from));
        if let Err(e) = result {
            error!(
                workspace = %change.workspace(),
                path = %change.path(),
                sequencer = %registration.name(),
                error = %e,
                "sequencer failed"
            );
            env.stats.record_node_failed();
            return Ok(TaskOutcome::Failed);
        }
    }

    debug!(
        workspace = %change.workspace(),
        path = %change.path(),
        sequencers = selected.len(),
        "sequenced node"
    );
    env.stats.record_node_sequenced();
    Ok(TaskOutcome::Sequenced(selected.len()))
}
