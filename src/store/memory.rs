//! In-memory content store.
//!
//! Thread-safe implementation of the content store traits, intended for
//! embedded usage, tests and as a reference implementation. Each workspace is
//! a map from absolute path to node. Sessions buffer their changes until
//! `save`, which applies them under the write lock and then delivers one
//! batch of events to every subscription entitled to some of them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use super::traits::{
    ChangeEvent, ContentNode, ContentStore, EventSink, EventTypes, NodeId, Session, SubscriptionFilter,
    SubscriptionId,
};
use crate::error::StoreError;

/// Primary type given to workspace roots.
pub const ROOT_NODE_TYPE: &str = "rep:root";

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

fn normalize_path(path: &str) -> Result<String, StoreError> {
    let path = path.trim();
    if !path.starts_with('/') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }
    if trimmed.contains("//") {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[derive(Debug, Clone)]
struct StoredNode {
    id: NodeId,
    primary_type: String,
    properties: BTreeMap<String, serde_json::Value>,
}

impl StoredNode {
    fn to_content_node(&self, workspace: &str, path: &str) -> ContentNode {
        ContentNode {
            id: self.id,
            workspace: workspace.to_string(),
            path: path.to_string(),
            primary_type: self.primary_type.clone(),
            properties: self.properties.clone(),
        }
    }
}

type Workspace = BTreeMap<String, StoredNode>;

struct Subscription {
    filter: SubscriptionFilter,
    sink: Arc<dyn EventSink>,
}

#[derive(Default)]
struct Inner {
    workspaces: RwLock<HashMap<String, Workspace>>,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
}

/// Thread-safe in-memory content store.
#[derive(Clone, Default)]
pub struct InMemoryContentStore {
    inner: Arc<Inner>,
    default_user: Option<String>,
}

impl std::fmt::Debug for InMemoryContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryContentStore")
            .field("default_user", &self.default_user)
            .finish_non_exhaustive()
    }
}

impl InMemoryContentStore {
    /// Create a new store without workspaces.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with one empty workspace.
    #[must_use]
    pub fn with_workspace(name: &str) -> Self {
        let store = Self::new();
        // A fresh lock cannot be poisoned.
        let _ = store.create_workspace(name);
        store
    }

    /// Returns a handle on the same store whose sessions act as `user`.
    #[must_use]
    pub fn as_user(&self, user: impl Into<String>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            default_user: Some(user.into()),
        }
    }

    /// Creates a workspace containing only its root node.
    ///
    /// Returns false if the workspace already existed.
    pub fn create_workspace(&self, name: &str) -> Result<bool, StoreError> {
        let mut workspaces = self.inner.workspaces.write().map_err(|_| lock_err("workspace.create"))?;
        if workspaces.contains_key(name) {
            return Ok(false);
        }
        let mut nodes = Workspace::new();
        nodes.insert(
            "/".to_string(),
            StoredNode {
                id: NodeId::new(),
                primary_type: ROOT_NODE_TYPE.to_string(),
                properties: BTreeMap::new(),
            },
        );
        workspaces.insert(name.to_string(), nodes);
        Ok(true)
    }

    /// Opens a session acting as `user_id`.
    pub fn open_session_as(&self, workspace: &str, user_id: Option<&str>) -> Result<MemorySession, StoreError> {
        let workspaces = self.inner.workspaces.read().map_err(|_| lock_err("session.open"))?;
        if !workspaces.contains_key(workspace) {
            return Err(StoreError::WorkspaceNotFound(workspace.to_string()));
        }
        Ok(MemorySession {
            inner: Arc::clone(&self.inner),
            workspace: workspace.to_string(),
            user_id: user_id.map(str::to_string),
            pending: Vec::new(),
            live: true,
        })
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Number of nodes in a workspace, including the root.
    pub fn node_count(&self, workspace: &str) -> Result<usize, StoreError> {
        let workspaces = self.inner.workspaces.read().map_err(|_| lock_err("workspace.node_count"))?;
        workspaces
            .get(workspace)
            .map(BTreeMap::len)
            .ok_or_else(|| StoreError::WorkspaceNotFound(workspace.to_string()))
    }
}

impl ContentStore for InMemoryContentStore {
    fn open_session(&self, workspace: &str) -> Result<Box<dyn Session>, StoreError> {
        let session = self.open_session_as(workspace, self.default_user.as_deref())?;
        Ok(Box::new(session))
    }

    fn subscribe(&self, filter: SubscriptionFilter, sink: Arc<dyn EventSink>) -> Result<SubscriptionId, StoreError> {
        let id = SubscriptionId::new();
        let mut subscriptions = self.inner.subscriptions.write().map_err(|_| lock_err("subscribe"))?;
        debug!(subscription = ?id, workspace = %filter.workspace, "registered change subscription");
        subscriptions.insert(id, Subscription { filter, sink });
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.inner.subscriptions.write() {
            Ok(mut subscriptions) => subscriptions.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        }
    }
}

#[derive(Debug, Clone)]
enum PendingChange {
    AddNode {
        path: String,
        node: StoredNode,
    },
    SetProperty {
        path: String,
        name: String,
        value: serde_json::Value,
    },
}

/// Session on an [`InMemoryContentStore`] workspace.
pub struct MemorySession {
    inner: Arc<Inner>,
    workspace: String,
    user_id: Option<String>,
    pending: Vec<PendingChange>,
    live: bool,
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("workspace", &self.workspace)
            .field("user_id", &self.user_id)
            .field("pending", &self.pending.len())
            .field("live", &self.live)
            .finish()
    }
}

impl MemorySession {
    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.live {
            Ok(())
        } else {
            Err(StoreError::SessionClosed(self.workspace.clone()))
        }
    }

    /// Node as seen by this session: committed state plus pending changes.
    fn view(&self, path: &str) -> Result<Option<StoredNode>, StoreError> {
        let workspaces = self.inner.workspaces.read().map_err(|_| lock_err("session.view"))?;
        let nodes = workspaces
            .get(&self.workspace)
            .ok_or_else(|| StoreError::WorkspaceNotFound(self.workspace.clone()))?;
        let mut node = nodes.get(path).cloned();
        for change in &self.pending {
            match change {
                PendingChange::AddNode { path: added, node: new } if added == path => {
                    node = Some(new.clone());
                }
                PendingChange::SetProperty { path: target, name, value } if target == path => {
                    if let Some(node) = node.as_mut() {
                        node.properties.insert(name.clone(), value.clone());
                    }
                }
                _ => {}
            }
        }
        Ok(node)
    }

    /// Picks `name`, or `name[n]` when siblings with that name exist.
    fn free_child_path(&self, parent: &str, name: &str) -> Result<String, StoreError> {
        let first = child_path(parent, name);
        if self.view(&first)?.is_none() {
            return Ok(first);
        }
        let mut index = 2usize;
        loop {
            let candidate = child_path(parent, &format!("{name}[{index}]"));
            if self.view(&candidate)?.is_none() {
                return Ok(candidate);
            }
            index += 1;
        }
    }

    fn deliver(&self, events: &[(ChangeEvent, String)]) -> Result<(), StoreError> {
        let targets: Vec<(SubscriptionFilter, Arc<dyn EventSink>)> = {
            let subscriptions = self.inner.subscriptions.read().map_err(|_| lock_err("session.deliver"))?;
            subscriptions
                .values()
                .filter(|s| s.filter.workspace == self.workspace)
                .map(|s| (s.filter.clone(), Arc::clone(&s.sink)))
                .collect()
        };

        for (filter, sink) in targets {
            let batch: Vec<ChangeEvent> = events
                .iter()
                .filter(|(event, primary_type)| entitled(&filter, event, primary_type))
                .map(|(event, _)| event.clone())
                .collect();
            if batch.is_empty() {
                continue;
            }
            trace!(workspace = %self.workspace, events = batch.len(), "delivering change batch");
            sink.on_events(&self.workspace, &batch);
        }
        Ok(())
    }
}

fn entitled(filter: &SubscriptionFilter, event: &ChangeEvent, primary_type: &str) -> bool {
    if !filter.event_types.contains(event.event_type) {
        return false;
    }
    if !filter.covers_path(event.node_path()) {
        return false;
    }
    if !filter.node_ids.is_empty() && !event.node_id.is_some_and(|id| filter.node_ids.contains(&id)) {
        return false;
    }
    if !filter.node_types.is_empty() && !filter.node_types.contains(primary_type) {
        return false;
    }
    if filter.no_local && filter.user_id.is_some() && event.user_id == filter.user_id {
        return false;
    }
    true
}

impl Session for MemorySession {
    fn workspace(&self) -> &str {
        &self.workspace
    }

    fn node(&self, path: &str) -> Result<ContentNode, StoreError> {
        self.ensure_live()?;
        let path = normalize_path(path)?;
        self.view(&path)?
            .map(|node| node.to_content_node(&self.workspace, &path))
            .ok_or_else(|| StoreError::NodeNotFound {
                workspace: self.workspace.clone(),
                path,
            })
    }

    fn add_node(&mut self, parent_path: &str, name: &str, primary_type: &str) -> Result<ContentNode, StoreError> {
        self.ensure_live()?;
        let parent = normalize_path(parent_path)?;
        let name = name.trim();
        if name.is_empty() || name.contains(&['/', '[', ']'][..]) {
            return Err(StoreError::InvalidPath(child_path(&parent, name)));
        }
        if self.view(&parent)?.is_none() {
            return Err(StoreError::NodeNotFound {
                workspace: self.workspace.clone(),
                path: parent,
            });
        }
        let path = self.free_child_path(&parent, name)?;
        let node = StoredNode {
            id: NodeId::new(),
            primary_type: primary_type.to_string(),
            properties: BTreeMap::new(),
        };
        let content = node.to_content_node(&self.workspace, &path);
        self.pending.push(PendingChange::AddNode { path, node });
        Ok(content)
    }

    fn set_property(&mut self, path: &str, name: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.ensure_live()?;
        let path = normalize_path(path)?;
        if self.view(&path)?.is_none() {
            return Err(StoreError::NodeNotFound {
                workspace: self.workspace.clone(),
                path,
            });
        }
        self.pending.push(PendingChange::SetProperty {
            path,
            name: name.trim().to_string(),
            value,
        });
        Ok(())
    }

    fn save(&mut self) -> Result<(), StoreError> {
        self.ensure_live()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let mut events = Vec::with_capacity(pending.len());
        {
            let mut workspaces = self.inner.workspaces.write().map_err(|_| lock_err("session.save"))?;
            let nodes = workspaces
                .get_mut(&self.workspace)
                .ok_or_else(|| StoreError::WorkspaceNotFound(self.workspace.clone()))?;
            for change in pending {
                match change {
                    PendingChange::AddNode { path, node } => {
                        let event = ChangeEvent::new(EventTypes::NODE_ADDED, path.clone()).with_node_id(node.id);
                        events.push((self.stamp(event), node.primary_type.clone()));
                        nodes.insert(path, node);
                    }
                    PendingChange::SetProperty { path, name, value } => {
                        let Some(node) = nodes.get_mut(&path) else {
                            return Err(StoreError::NodeNotFound {
                                workspace: self.workspace.clone(),
                                path,
                            });
                        };
                        let event_type = if node.properties.contains_key(&name) {
                            EventTypes::PROPERTY_CHANGED
                        } else {
                            EventTypes::PROPERTY_ADDED
                        };
                        node.properties.insert(name.clone(), value);
                        let event = ChangeEvent::new(event_type, child_path(&path, &name)).with_node_id(node.id);
                        events.push((self.stamp(event), node.primary_type.clone()));
                    }
                }
            }
        }
        debug!(workspace = %self.workspace, events = events.len(), "saved session changes");
        self.deliver(&events)
    }

    fn logout(&mut self) {
        self.pending.clear();
        self.live = false;
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

impl MemorySession {
    fn stamp(&self, event: ChangeEvent) -> ChangeEvent {
        match &self.user_id {
            Some(user) => event.with_user(user.clone()),
            None => event,
        }
    }
}
