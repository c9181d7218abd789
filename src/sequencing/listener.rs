//! Bridge from store change subscriptions to a [`SequencingSystem`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{ChangeEvent, ContentStore, EventSink, EventTypes, SubscriptionFilter, SubscriptionId};

use super::dispatcher::{DispatcherState, SequencingSystem};

struct Registered {
    store: Arc<dyn ContentStore>,
    filter: SubscriptionFilter,
    id: SubscriptionId,
}

/// Store subscription feeding change batches into a sequencing system.
///
/// The listener only holds a weak reference to the system. Once the system is
/// shut down, the next delivered batch is counted as ignored and unregisters
/// the listener. A dropped system just unregisters it.
pub struct ChangeListener {
    system: Weak<SequencingSystem>,
    registered: Mutex<Option<Registered>>,
}

impl fmt::Debug for ChangeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeListener")
            .field("subscription", &self.subscription())
            .finish_non_exhaustive()
    }
}

impl ChangeListener {
    /// Creates an unregistered listener for `system`.
    #[must_use]
    pub fn new(system: &Arc<SequencingSystem>) -> Arc<Self> {
        Arc::new(Self {
            system: Arc::downgrade(system),
            registered: Mutex::new(None),
        })
    }

    /// Deep subscription on a whole workspace for added nodes and added or
    /// changed properties.
    #[must_use]
    pub fn default_filter(workspace: impl Into<String>) -> SubscriptionFilter {
        SubscriptionFilter {
            event_types: EventTypes::CONTENT,
            absolute_path: Some("/".to_string()),
            ..SubscriptionFilter::workspace(workspace)
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Registered>> {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to `store`, replacing any existing subscription.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the listener is then unregistered.
    pub fn register(
        self: &Arc<Self>,
        store: Arc<dyn ContentStore>,
        filter: SubscriptionFilter,
    ) -> Result<SubscriptionId, StoreError> {
        self.unregister();
        let sink: Arc<dyn EventSink> = Arc::clone(self) as Arc<dyn EventSink>;
        let id = store.subscribe(filter.clone(), sink)?;
        info!(subscription = ?id, workspace = %filter.workspace, "change listener registered");
        *self.lock() = Some(Registered { store, filter, id });
        Ok(id)
    }

    /// Removes the subscription; returns false when none was active.
    pub fn unregister(&self) -> bool {
        let Some(registered) = self.lock().take() else {
            return false;
        };
        let removed = registered.store.unsubscribe(registered.id);
        info!(subscription = ?registered.id, workspace = %registered.filter.workspace, "change listener unregistered");
        removed
    }

    /// Subscribes again with the last store and filter, e.g. after the
    /// store restarted. Returns `None` when the listener was never registered.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the listener is then unregistered.
    pub fn reregister(self: &Arc<Self>) -> Result<Option<SubscriptionId>, StoreError> {
        let previous = {
            let guard = self.lock();
            guard.as_ref().map(|r| (Arc::clone(&r.store), r.filter.clone()))
        };
        match previous {
            Some((store, filter)) => self.register(store, filter).map(Some),
            None => Ok(None),
        }
    }

    /// Active subscription id.
    #[must_use]
    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.lock().as_ref().map(|r| r.id)
    }

    /// True while subscribed to a store.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.lock().is_some()
    }
}

impl EventSink for ChangeListener {
    fn on_events(&self, workspace: &str, events: &[ChangeEvent]) {
        let Some(system) = self.system.upgrade() else {
            debug!(workspace, "sequencing system dropped; dropping change listener");
            self.unregister();
            return;
        };
        system.on_change_batch(workspace, events);
        if system.state() == DispatcherState::Shutdown {
            debug!(workspace, "sequencing system shut down; dropping change listener");
            self.unregister();
        }
    }
}
