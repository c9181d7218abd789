//! Pluggable selection of sequencers and filtering of raw events.

use std::sync::Arc;

use crate::registry::Registration;
use crate::store::{ChangeEvent, ContentNode, EventTypes};

use super::task::NodeChange;

/// Chooses which registered sequencers run for a node, and in what order.
pub trait Selector: Send + Sync {
    /// Returns the ordered subset of `registrations` to run against `node`.
    fn select(
        &self,
        registrations: &[Arc<Registration>],
        node: &ContentNode,
        change: &NodeChange,
    ) -> Vec<Arc<Registration>>;
}

/// Selects every registered sequencer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSelector;

impl Selector for DefaultSelector {
    fn select(&self, registrations: &[Arc<Registration>], _: &ContentNode, _: &NodeChange) -> Vec<Arc<Registration>> {
        registrations.to_vec()
    }
}

/// Selects sequencers whose path expressions match the changed node or one of
/// its changed properties. Sequencers without expressions always run.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathExpressionSelector;

impl Selector for PathExpressionSelector {
    fn select(
        &self,
        registrations: &[Arc<Registration>],
        _: &ContentNode,
        change: &NodeChange,
    ) -> Vec<Arc<Registration>> {
        registrations
            .iter()
            .filter(|r| r.applies_to(change.path(), change.properties()))
            .cloned()
            .collect()
    }
}

/// Decides whether a raw event is worth turning into a node change.
pub trait EventFilter: Send + Sync {
    /// True when `event` should be sequenced.
    fn include(&self, event: &ChangeEvent) -> bool;
}

/// Accepts every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl EventFilter for AcceptAll {
    fn include(&self, _: &ChangeEvent) -> bool {
        true
    }
}

impl<F> EventFilter for F
where
    F: Fn(&ChangeEvent) -> bool + Send + Sync,
{
    fn include(&self, event: &ChangeEvent) -> bool {
        self(event)
    }
}

/// Accepts events whose type is in a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypeFilter(pub EventTypes);

impl EventTypeFilter {
    /// Added nodes and added or changed properties.
    #[must_use]
    pub const fn content() -> Self {
        Self(EventTypes::CONTENT)
    }
}

impl EventFilter for EventTypeFilter {
    fn include(&self, event: &ChangeEvent) -> bool {
        self.0.contains(event.event_type)
    }
}
