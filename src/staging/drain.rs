//! Drain controller
//!
//! `Running -> Draining -> Finished`. The first `drain()` call does the
//! work; later calls return immediately. No internal deadline: the caller
//! wraps the whole drain in its own timeout.

use super::fast_path::FastPathHandle;
use super::reconcile::{ReconcileReport, Reconciler};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Running,
    Draining,
    Finished,
}

impl std::fmt::Display for DrainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainState::Running => write!(f, "running"),
            DrainState::Draining => write!(f, "draining"),
            DrainState::Finished => write!(f, "finished"),
        }
    }
}

#[derive(Debug)]
pub enum DrainOutcome {
    /// Another call already started (or finished) the drain
    AlreadyRequested,
    Completed(ReconcileReport),
}

pub struct DrainController {
    state: watch::Sender<DrainState>,
    requested: AtomicBool,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    fast_path: Arc<FastPathHandle>,
    reconciler: Arc<Reconciler>,
}

impl DrainController {
    pub fn new(
        shutdown: CancellationToken,
        workers: Vec<JoinHandle<()>>,
        fast_path: Arc<FastPathHandle>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        let (state, _) = watch::channel(DrainState::Running);
        DrainController {
            state,
            requested: AtomicBool::new(false),
            shutdown,
            workers: Mutex::new(workers),
            fast_path,
            reconciler,
        }
    }

    pub fn state(&self) -> DrainState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.state.subscribe()
    }

    /// Stop periodic work, flush the fast path, and reconcile once
    pub async fn drain(&self) -> DrainOutcome {
        if self.requested.swap(true, Ordering::SeqCst) {
            return DrainOutcome::AlreadyRequested;
        }
        self.state.send_replace(DrainState::Draining);
        info!("Draining: stopping aggregation workers");

        self.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Aggregation worker panicked");
            }
        }

        self.fast_path.close().await;
        let report = self.reconciler.process_remaining().await;

        self.state.send_replace(DrainState::Finished);
        info!(clean = report.is_clean(), "Drain finished");
        DrainOutcome::Completed(report)
    }

    /// Resolve once the drain has finished
    pub async fn wait_finished(&self) {
        let mut rx = self.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|state| *state == DrainState::Finished).await;
    }
}
