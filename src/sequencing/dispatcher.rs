//! Sequencing system: lifecycle, ingress and task dispatch.
//!
//! Change batches arrive on the store's delivery thread. Filtering and
//! per-node de-duplication run there synchronously; everything that may block
//! (sessions, node resolution, sequencers) runs on the worker pool.
//!
//! The lifecycle mutex guards the state and the pool together, so transitions
//! are exclusive. Ingress filters a batch without the lock and holds it while
//! submitting, so nothing is queued once `shutdown` has returned.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::config::SequencingConfig;
use crate::error::LifecycleError;
use crate::registry::SequencerRegistry;
use crate::store::{ChangeEvent, ContentStore};

use super::pool::{self, Handler, PanicHook, Rejected, Termination, WorkerPool};
use super::selector::{AcceptAll, DefaultSelector, EventFilter, Selector};
use super::stats::{Statistics, StatisticsSnapshot};
use super::task::{process_node_change, ChangedNode, NodeChange, TaskEnv};

/// Lifecycle state of a [`SequencingSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatcherState {
    /// Accepting and processing change batches.
    Started,
    /// Ignoring change batches; queued tasks still finish.
    Paused,
    /// Terminal.
    Shutdown,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Paused => write!(f, "paused"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// State shared with worker threads.
struct Shared {
    registry: Arc<SequencerRegistry>,
    store: RwLock<Option<Arc<dyn ContentStore>>>,
    selector: RwLock<Arc<dyn Selector>>,
    filter: RwLock<Arc<dyn EventFilter>>,
    stats: Statistics,
}

impl Shared {
    fn content_store(&self) -> Option<Arc<dyn ContentStore>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn selector(&self) -> Arc<dyn Selector> {
        Arc::clone(&self.selector.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn event_filter(&self) -> Arc<dyn EventFilter> {
        Arc::clone(&self.filter.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn run_task(&self, change: &NodeChange, task_timeout: Option<Duration>) {
        let Some(store) = self.content_store() else {
            error!(
                workspace = %change.workspace(),
                path = %change.path(),
                "no content store configured; dropping node"
            );
            self.stats.record_node_failed();
            return;
        };
        let selector = self.selector();
        let env = TaskEnv {
            store: store.as_ref(),
            registry: &self.registry,
            selector: selector.as_ref(),
            stats: &self.stats,
            task_timeout,
        };
        let outcome = process_node_change(&env, change);
        trace!(workspace = %change.workspace(), path = %change.path(), ?outcome, "node task finished");
    }
}

struct Lifecycle {
    state: DispatcherState,
    config: SequencingConfig,
    pool: Option<WorkerPool>,
    /// Pools closed by shutdown or reconfiguration whose workers may still run.
    retired: Vec<Termination>,
}

/// Watches change batches and runs the registered sequencers on changed nodes.
///
/// A new system is [`Paused`](DispatcherState::Paused). [`start`](Self::start)
/// requires a content store and creates the worker pool on first use.
/// Shutdown is terminal: afterwards `start` and `pause` return
/// [`LifecycleError::Shutdown`].
pub struct SequencingSystem {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for SequencingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencingSystem")
            .field("state", &self.state())
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}

impl SequencingSystem {
    /// Creates a paused system over `registry`.
    #[must_use]
    pub fn new(registry: Arc<SequencerRegistry>, config: SequencingConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                store: RwLock::new(None),
                selector: RwLock::new(Arc::new(DefaultSelector)),
                filter: RwLock::new(Arc::new(AcceptAll)),
                stats: Statistics::new(),
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: DispatcherState::Paused,
                config,
                pool: None,
                retired: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_pool(&self, config: &SequencingConfig) -> Result<WorkerPool, LifecycleError> {
        let shared = Arc::clone(&self.shared);
        let task_timeout = config.task_timeout;
        let handler: Handler = Arc::new(move |change: NodeChange| shared.run_task(&change, task_timeout));
        let shared = Arc::clone(&self.shared);
        let on_panic: PanicHook = Arc::new(move |_: &str| shared.stats.record_node_failed());
        WorkerPool::start(config, handler, on_panic)
    }

    /// Starts processing change batches.
    ///
    /// Starting a started system is a no-op.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::MissingContentStore`] when no store is configured,
    /// [`LifecycleError::Shutdown`] after shutdown, and
    /// [`LifecycleError::PoolUnavailable`] when worker threads cannot be spawned.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut lifecycle = self.lock();
        match lifecycle.state {
            DispatcherState::Shutdown => return Err(LifecycleError::Shutdown),
            DispatcherState::Started => return Ok(()),
            DispatcherState::Paused => {}
        }
        if self.shared.content_store().is_none() {
            return Err(LifecycleError::MissingContentStore);
        }
        if lifecycle.pool.is_none() {
            let pool = self.spawn_pool(&lifecycle.config)?;
            lifecycle.pool = Some(pool);
        }
        lifecycle.state = DispatcherState::Started;
        info!(
            workers = lifecycle.config.workers,
            sequencers = self.shared.registry.len(),
            "sequencing system started"
        );
        Ok(())
    }

    /// Stops accepting change batches. Tasks already queued still run.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Shutdown`] after shutdown.
    pub fn pause(&self) -> Result<(), LifecycleError> {
        let mut lifecycle = self.lock();
        match lifecycle.state {
            DispatcherState::Shutdown => Err(LifecycleError::Shutdown),
            DispatcherState::Paused => Ok(()),
            DispatcherState::Started => {
                lifecycle.state = DispatcherState::Paused;
                info!("sequencing system paused");
                Ok(())
            }
        }
    }

    /// Enters the terminal state and releases the worker pool.
    ///
    /// Queued tasks still drain; this call does not wait for them. Use
    /// [`await_termination`](Self::await_termination) for that. Repeated calls
    /// are no-ops.
    pub fn shutdown(&self) {
        let mut lifecycle = self.lock();
        if lifecycle.state == DispatcherState::Shutdown {
            return;
        }
        lifecycle.state = DispatcherState::Shutdown;
        if let Some(pool) = lifecycle.pool.take() {
            let termination = pool.close();
            lifecycle.retired.push(termination);
        }
        info!("sequencing system shut down");
    }

    /// Waits up to `timeout` for every released worker to exit.
    ///
    /// Returns true when no worker of a released pool is still running. A pool
    /// that is still live (the system was never shut down) never terminates,
    /// so the result is false in that case.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let (signals, live) = {
            let lifecycle = self.lock();
            let signals: Vec<_> = lifecycle.retired.iter().map(Termination::exit_signal).collect();
            (signals, lifecycle.pool.is_some())
        };

        let deadline = Instant::now() + timeout;
        for signal in &signals {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !pool::wait_for_exit(signal, remaining) {
                return false;
            }
        }

        let finished: Vec<Termination> = {
            let mut lifecycle = self.lock();
            let (finished, running): (Vec<_>, Vec<_>) =
                lifecycle.retired.drain(..).partition(Termination::is_finished);
            lifecycle.retired = running;
            finished
        };
        for termination in finished {
            termination.join();
        }
        !live
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.lock().state
    }

    /// True while change batches are being accepted.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state() == DispatcherState::Started
    }

    /// Sets the store sessions are opened on.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Started`] while started, [`LifecycleError::Shutdown`]
    /// after shutdown.
    pub fn set_content_store(&self, store: Arc<dyn ContentStore>) -> Result<(), LifecycleError> {
        let lifecycle = self.lock();
        match lifecycle.state {
            DispatcherState::Started => Err(LifecycleError::Started { what: "the content store" }),
            DispatcherState::Shutdown => Err(LifecycleError::Shutdown),
            DispatcherState::Paused => {
                *self.shared.store.write().unwrap_or_else(PoisonError::into_inner) = Some(store);
                debug!("content store configured");
                Ok(())
            }
        }
    }

    /// Replaces the worker pool configuration.
    ///
    /// An existing pool is released (its queued tasks still run) and a new one
    /// is created on the next [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Started`] while started, [`LifecycleError::Shutdown`]
    /// after shutdown.
    pub fn set_worker_pool_config(&self, config: SequencingConfig) -> Result<(), LifecycleError> {
        let mut lifecycle = self.lock();
        match lifecycle.state {
            DispatcherState::Started => return Err(LifecycleError::Started { what: "the worker pool" }),
            DispatcherState::Shutdown => return Err(LifecycleError::Shutdown),
            DispatcherState::Paused => {}
        }
        if let Some(pool) = lifecycle.pool.take() {
            let termination = pool.close();
            lifecycle.retired.push(termination);
        }
        lifecycle.config = config;
        Ok(())
    }

    /// Current worker pool configuration.
    #[must_use]
    pub fn worker_pool_config(&self) -> SequencingConfig {
        self.lock().config.clone()
    }

    /// Installs a selector; `None` restores [`DefaultSelector`].
    pub fn set_selector(&self, selector: Option<Arc<dyn Selector>>) {
        let selector = selector.unwrap_or_else(|| Arc::new(DefaultSelector));
        *self.shared.selector.write().unwrap_or_else(PoisonError::into_inner) = selector;
    }

    /// Installs an event filter; `None` restores [`AcceptAll`].
    pub fn set_event_filter(&self, filter: Option<Arc<dyn EventFilter>>) {
        let filter = filter.unwrap_or_else(|| Arc::new(AcceptAll));
        *self.shared.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
    }

    /// Registry of sequencers this system runs.
    #[must_use]
    pub fn registry(&self) -> &Arc<SequencerRegistry> {
        &self.shared.registry
    }

    /// Live counters.
    #[must_use]
    pub fn statistics(&self) -> &Statistics {
        &self.shared.stats
    }

    /// Copy of the counters.
    #[must_use]
    pub fn statistics_snapshot(&self) -> StatisticsSnapshot {
        self.shared.stats.snapshot()
    }

    fn ignore_batch(&self, workspace: &str, events: &[ChangeEvent]) {
        trace!(workspace, events = events.len(), "ignoring change batch");
        self.shared.stats.record_events_ignored(events.len() as u64);
    }

    /// Handles one batch of change events from `workspace`.
    ///
    /// When not started the batch is counted as ignored. Otherwise events
    /// rejected by the event filter are counted as skipped, the rest are
    /// folded into one [`NodeChange`] per node (property events count against
    /// their owning node) and submitted in first-seen order.
    pub fn on_change_batch(&self, workspace: &str, events: &[ChangeEvent]) {
        if !self.is_started() {
            self.ignore_batch(workspace, events);
            return;
        }

        let filter = self.shared.event_filter();
        let mut changes: Vec<NodeChange> = Vec::new();
        let mut index: HashMap<ChangedNode, usize> = HashMap::new();
        let mut skipped = 0u64;
        for event in events {
            if !filter.include(event) {
                skipped += 1;
                continue;
            }
            let node = ChangedNode::new(workspace, event.node_path());
            let slot = *index.entry(node.clone()).or_insert_with(|| {
                changes.push(NodeChange::new(node));
                changes.len() - 1
            });
            changes[slot].absorb(event);
        }

        // The state may have changed while filtering.
        let lifecycle = self.lock();
        let pool = match (lifecycle.state, lifecycle.pool.as_ref()) {
            (DispatcherState::Started, Some(pool)) => pool,
            _ => {
                self.ignore_batch(workspace, events);
                return;
            }
        };

        let enqueued = events.len() as u64 - skipped;
        self.shared.stats.record_events(enqueued, skipped);
        debug!(workspace, enqueued, skipped, nodes = changes.len(), "received change batch");

        let mut submitted = 0u64;
        for change in changes {
            let path = change.path().to_string();
            match pool.try_submit(change) {
                Ok(()) => submitted += 1,
                Err(Rejected::Full { capacity }) => {
                    warn!(workspace, path = %path, capacity, "sequencing queue full; dropping node");
                    self.shared.stats.record_task_rejected();
                }
                Err(Rejected::Closed) => {
                    warn!(workspace, path = %path, "worker pool closed; dropping node");
                    self.shared.stats.record_task_rejected();
                }
            }
        }
        drop(lifecycle);
        self.shared.stats.record_nodes_enqueued(submitted);
    }
}

impl Drop for SequencingSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
