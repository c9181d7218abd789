//! Content store contract.
//!
//! The sequencing system never talks to a concrete repository. It opens
//! sessions, resolves nodes and receives change batches through these traits.
//! [`super::InMemoryContentStore`] implements them for tests and embedding.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

bitflags! {
    /// Kinds of change a store can report.
    ///
    /// A single [`ChangeEvent`] carries exactly one flag; subscriptions and
    /// filters use unions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventTypes: u32 {
        /// A node was created.
        const NODE_ADDED = 1 << 0;
        /// A node was removed.
        const NODE_REMOVED = 1 << 1;
        /// A property was set for the first time.
        const PROPERTY_ADDED = 1 << 2;
        /// A property was removed.
        const PROPERTY_REMOVED = 1 << 3;
        /// An existing property got a new value.
        const PROPERTY_CHANGED = 1 << 4;

        /// Every property event.
        const PROPERTY = Self::PROPERTY_ADDED.bits() | Self::PROPERTY_REMOVED.bits()
                       | Self::PROPERTY_CHANGED.bits();
        /// Changes that can produce new content worth sequencing.
        const CONTENT = Self::NODE_ADDED.bits() | Self::PROPERTY_ADDED.bits()
                      | Self::PROPERTY_CHANGED.bits();
    }
}

impl Default for EventTypes {
    fn default() -> Self {
        Self::all()
    }
}

/// Unique identifier for a content node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a new random node id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// One raw change reported by a store.
///
/// For node events `path` is the node's path; for property events it is the
/// path of the property, i.e. the owning node's path followed by `/name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// A single event type flag.
    pub event_type: EventTypes,
    /// Absolute path of the node or property.
    pub path: String,
    /// User whose session produced the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Identifier of the node the change belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

impl ChangeEvent {
    /// Creates an event without user or node information.
    #[must_use]
    pub fn new(event_type: EventTypes, path: impl Into<String>) -> Self {
        Self {
            event_type,
            path: path.into(),
            user_id: None,
            node_id: None,
        }
    }

    /// Sets the user whose save produced the event.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the identifier of the affected node.
    #[must_use]
    pub const fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// True for the three property event types.
    #[must_use]
    pub fn is_property_event(&self) -> bool {
        EventTypes::PROPERTY.contains(self.event_type) && !self.event_type.is_empty()
    }

    /// Path of the node the event is about; the owning node for property events.
    #[must_use]
    pub fn node_path(&self) -> &str {
        let path = self.path.trim();
        if !self.is_property_event() {
            return path;
        }
        match path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &path[..idx],
        }
    }

    /// Name of the property, for property events.
    #[must_use]
    pub fn property_name(&self) -> Option<&str> {
        if !self.is_property_event() {
            return None;
        }
        let path = self.path.trim();
        path.rfind('/').map(|idx| &path[idx + 1..]).filter(|name| !name.is_empty())
    }
}

/// A resolved node, as seen through a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    /// Stable identifier.
    pub id: NodeId,
    /// Workspace the node lives in.
    pub workspace: String,
    /// Absolute path, `/` for the root.
    pub path: String,
    /// Primary node type name.
    pub primary_type: String,
    /// Property values by name.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ContentNode {
    /// The last path segment; empty for the root.
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// Value of property `name`.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }
}

/// Criteria a subscription applies before delivering events.
///
/// Restrictions are combined: an event is delivered only when it satisfies all
/// of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Workspace being observed.
    pub workspace: String,
    /// Event types to deliver.
    pub event_types: EventTypes,
    /// Root of the observed subtree; `None` observes the whole workspace.
    pub absolute_path: Option<String>,
    /// Include nodes below `absolute_path`, not just the node itself.
    pub deep: bool,
    /// Only nodes with one of these ids, when non-empty.
    #[serde(default)]
    pub node_ids: BTreeSet<NodeId>,
    /// Only nodes with one of these primary types, when non-empty.
    #[serde(default)]
    pub node_types: BTreeSet<String>,
    /// Ignore changes made by the subscribing user.
    pub no_local: bool,
    /// The subscribing user, compared against event user ids when `no_local` is set.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl SubscriptionFilter {
    /// Observes every event in a workspace.
    #[must_use]
    pub fn workspace(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            event_types: EventTypes::all(),
            absolute_path: None,
            deep: true,
            node_ids: BTreeSet::new(),
            node_types: BTreeSet::new(),
            no_local: false,
            user_id: None,
        }
    }

    /// True when `path` is the observed node or, for deep filters, below it.
    #[must_use]
    pub fn covers_path(&self, path: &str) -> bool {
        let Some(root) = self.absolute_path.as_deref() else {
            return true;
        };
        let root = root.trim_end_matches('/');
        let path = path.trim_end_matches('/');
        if path == root {
            return true;
        }
        self.deep && (root.is_empty() || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/')))
    }
}

/// Receives change batches from a store.
pub trait EventSink: Send + Sync {
    /// Called once per saved batch with the events the subscription is entitled to.
    fn on_events(&self, workspace: &str, events: &[ChangeEvent]);
}

/// A unit of work against one workspace.
///
/// Changes made through a session become visible, and are reported to
/// subscribers, when [`save`](Session::save) is called.
pub trait Session: Send {
    /// Workspace this session is bound to.
    fn workspace(&self) -> &str;

    /// Resolves the node at an absolute path.
    fn node(&self, path: &str) -> Result<ContentNode, StoreError>;

    /// Creates a child node and returns it.
    fn add_node(&mut self, parent_path: &str, name: &str, primary_type: &str) -> Result<ContentNode, StoreError>;

    /// Sets a property on the node at `path`.
    fn set_property(&mut self, path: &str, name: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Persists outstanding changes.
    fn save(&mut self) -> Result<(), StoreError>;

    /// Discards outstanding changes and closes the session.
    fn logout(&mut self);

    /// False once logged out.
    fn is_live(&self) -> bool;
}

/// Access to a hierarchical content store.
pub trait ContentStore: Send + Sync {
    /// Opens a session on a workspace.
    fn open_session(&self, workspace: &str) -> Result<Box<dyn Session>, StoreError>;

    /// Registers a sink for changes matching `filter`.
    fn subscribe(&self, filter: SubscriptionFilter, sink: Arc<dyn EventSink>) -> Result<SubscriptionId, StoreError>;

    /// Removes a subscription; returns false when it was not registered.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}
