//! Worker pool executing node tasks.
//!
//! N named threads share one crossbeam queue. Closing the pool drops the
//! sender: workers drain what is queued, then exit. Each worker also holds a
//! clone of a "done" sender, so waiting for termination with a timeout is a
//! `recv_timeout` on a channel that disconnects once the last worker exits.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error};

use crate::config::SequencingConfig;
use crate::error::LifecycleError;

use super::task::NodeChange;

/// Work function run by every worker.
pub(crate) type Handler = Arc<dyn Fn(NodeChange) + Send + Sync>;

/// Called with the node path when a task panics.
pub(crate) type PanicHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Why a task was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejected {
    Full { capacity: usize },
    Closed,
}

pub(crate) struct WorkerPool {
    tx: Sender<NodeChange>,
    queue_capacity: Option<usize>,
    termination: Termination,
}

impl WorkerPool {
    pub(crate) fn start(
        config: &SequencingConfig,
        handler: Handler,
        on_panic: PanicHook,
    ) -> Result<Self, LifecycleError> {
        let workers = config.workers.max(1);
        let queue_capacity = config.queue_capacity.map(|c| c.max(1));
        let (tx, rx) = match queue_capacity {
            Some(capacity) => bounded::<NodeChange>(capacity),
            None => unbounded::<NodeChange>(),
        };
        let (done_tx, done_rx) = bounded::<()>(0);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<NodeChange> = rx.clone();
            let handler = Arc::clone(&handler);
            let on_panic = Arc::clone(&on_panic);
            let done = done_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{idx}", config.thread_name))
                .spawn(move || worker_loop(&rx, &handler, &on_panic, done));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    drop(tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(LifecycleError::PoolUnavailable { reason: e.to_string() });
                }
            }
        }
        debug!(workers, capacity = ?queue_capacity, "started sequencing worker pool");

        Ok(Self {
            tx,
            queue_capacity,
            termination: Termination { done_rx, handles },
        })
    }

    /// Queues `change` without blocking.
    pub(crate) fn try_submit(&self, change: NodeChange) -> Result<(), Rejected> {
        match self.tx.try_send(change) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Rejected::Full {
                capacity: self.queue_capacity.unwrap_or(0),
            }),
            Err(TrySendError::Disconnected(_)) => Err(Rejected::Closed),
        }
    }

    /// Stops accepting work; queued tasks still run.
    pub(crate) fn close(self) -> Termination {
        drop(self.tx);
        self.termination
    }
}

fn worker_loop(rx: &Receiver<NodeChange>, handler: &Handler, on_panic: &PanicHook, _done: Sender<()>) {
    while let Ok(change) = rx.recv() {
        let path = change.path().to_string();
        if panic::catch_unwind(AssertUnwindSafe(|| handler(change))).is_err() {
            error!(path = %path, "sequencing task panicked");
            on_panic(&path);
        }
    }
}

/// Outstanding workers of a closed pool.
pub(crate) struct Termination {
    done_rx: Receiver<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Termination {
    /// Receiver that disconnects when the workers are gone.
    pub(crate) fn exit_signal(&self) -> Receiver<()> {
        self.done_rx.clone()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }

    pub(crate) fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Waits until every sender of `done_rx` is gone; false on timeout.
pub(crate) fn wait_for_exit(done_rx: &Receiver<()>, timeout: Duration) -> bool {
    loop {
        match done_rx.recv_timeout(timeout) {
            Ok(()) => continue,
            Err(RecvTimeoutError::Disconnected) => return true,
            Err(RecvTimeoutError::Timeout) => return false,
        }
    }
}
