//! Shutdown coordination.
//!
//! Moves linearly through `Running -> ShuttingDown -> Stopped`. Entering
//! `ShuttingDown` cancels the one broadcast token every worker observes;
//! it happens exactly once no matter how many signals arrive.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    phase: Mutex<Phase>,
    token: CancellationToken,
    tracker: TaskTracker,
    spawned: AtomicUsize,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Running),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Capture SIGINT and SIGTERM; either one triggers shutdown.
    ///
    /// The returned task ends once shutdown has begun for any reason.
    pub fn arm(self: &std::sync::Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let coordinator = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                let reason = tokio::select! {
                    _ = coordinator.token.cancelled() => return,
                    _ = interrupt.recv() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                };
                coordinator.trigger(reason);
            }
        }))
    }

    /// Begin shutdown. Returns true only for the call that performed the transition.
    pub fn trigger(&self, reason: &str) -> bool {
        let mut phase = self.lock_phase();
        if *phase != Phase::Running {
            debug!(reason, phase = ?*phase, "Shutdown already in progress");
            return false;
        }

        info!(reason, "Shutting down");
        *phase = Phase::ShuttingDown;
        self.tracker.close();
        self.token.cancel();
        true
    }

    /// Spawn a long-running worker. Refused once shutdown has begun.
    pub fn spawn<F>(&self, task: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let phase = self.lock_phase();
        if *phase != Phase::Running {
            warn!("Refusing to start worker during shutdown");
            return None;
        }
        self.spawned.fetch_add(1, Ordering::Relaxed);
        Some(self.tracker.spawn(task))
    }

    /// Wait until every spawned worker has exited.
    pub async fn wait_for_workers(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Mark teardown complete.
    pub fn finish(&self) {
        let mut phase = self.lock_phase();
        if *phase == Phase::Running {
            self.tracker.close();
            self.token.cancel();
        }
        *phase = Phase::Stopped;
    }

    /// The broadcast cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.lock_phase()
    }

    /// Total workers ever spawned.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Workers still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }
}
