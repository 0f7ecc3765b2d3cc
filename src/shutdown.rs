//! Cooperative shutdown: `Running -> Draining -> Terminated`.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::runner::queue::SeedQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Running,
    Draining,
    Terminated,
}

/// Shared by every worker, the queue owner and the resource monitor.
///
/// Carries two flags: "termination requested" (the phase leaving `Running`)
/// and "force now". Both only ever move forward.
#[derive(Debug)]
pub struct ShutdownContext {
    phase: watch::Sender<Phase>,
    force: watch::Sender<bool>,
    reason: OnceLock<String>,
}

impl Default for ShutdownContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownContext {
    pub fn new() -> Self {
        Self {
            phase: watch::Sender::new(Phase::Running),
            force: watch::Sender::new(false),
            reason: OnceLock::new(),
        }
    }

    /// Ask the engine to drain. Returns `true` only for the request that
    /// actually moved the engine out of `Running`.
    pub fn request(&self, reason: &str) -> bool {
        let moved = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Running {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        });
        if moved {
            let _ = self.reason.set(reason.to_string());
            info!(reason, "shutdown requested, draining workers");
        }
        moved
    }

    /// Kill whatever is still running.
    pub fn force_now(&self) {
        let _ = self
            .force
            .send_if_modified(|force| !std::mem::replace(force, true));
    }

    pub fn mark_terminated(&self) {
        self.phase.send_replace(Phase::Terminated);
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn termination_requested(&self) -> bool {
        self.phase() != Phase::Running
    }

    pub fn force_requested(&self) -> bool {
        *self.force.borrow()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// Resolves once the phase has left `Running`.
    pub async fn requested(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase != Phase::Running).await;
    }

    /// Resolves once the force flag is set.
    pub async fn forced(&self) {
        let mut rx = self.force.subscribe();
        let _ = rx.wait_for(|force| *force).await;
    }
}

/// Map SIGINT/SIGTERM to shutdown requests. A second signal while draining
/// forces termination.
pub fn listen_for_signals(ctx: Arc<ShutdownContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                warn!("failed to install signal handlers: {e}");
                return;
            }
        };
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            if ctx.phase() == Phase::Terminated {
                return;
            }
            if !ctx.request(&format!("received {name}")) {
                warn!(signal = name, "second signal while draining, forcing termination");
                ctx.force_now();
            }
        }
    })
}

/// Request shutdown once `budget` has elapsed.
pub fn arm_deadline(ctx: Arc<ShutdownContext>, budget: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(budget) => {
                ctx.request("time budget exhausted");
            }
            _ = ctx.requested() => {}
        }
    })
}

/// Drives the pool to `Terminated`.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    ctx: Arc<ShutdownContext>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(ctx: Arc<ShutdownContext>, grace: Duration) -> Self {
        Self { ctx, grace }
    }

    /// Wait for the workers to run out of work, or for a shutdown request.
    ///
    /// On a request: close the queue so idle workers leave, give busy workers
    /// `grace` to finish their run, then force-kill the rest. `workers_done`
    /// is called again after each step; it must be cancel safe.
    pub async fn run<F, Fut>(&self, queue: &SeedQueue, mut workers_done: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        tokio::select! {
            _ = workers_done() => {
                info!("seed queue exhausted");
            }
            _ = self.ctx.requested() => {
                queue.close().await;
                if tokio::time::timeout(self.grace, workers_done()).await.is_err() {
                    warn!(
                        grace_secs = self.grace.as_secs_f64(),
                        "grace period expired, force-terminating remaining runs"
                    );
                    self.ctx.force_now();
                    workers_done().await;
                }
            }
        }
        self.ctx.mark_terminated();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_is_idempotent() {
        let ctx = ShutdownContext::new();
        assert_eq!(ctx.phase(), Phase::Running);
        assert!(ctx.request("first"));
        assert!(!ctx.request("second"));
        assert_eq!(ctx.phase(), Phase::Draining);
        assert_eq!(ctx.reason(), Some("first"));
        ctx.requested().await;
        assert!(!ctx.force_requested());

        ctx.mark_terminated();
        assert!(!ctx.request("third"));
        assert_eq!(ctx.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn forced_wakes_waiters() {
        let ctx = Arc::new(ShutdownContext::new());
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.forced().await })
        };
        ctx.force_now();
        waiter.await.unwrap();
        assert!(ctx.force_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_requests_shutdown() {
        let ctx = Arc::new(ShutdownContext::new());
        let handle = arm_deadline(ctx.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        handle.await.unwrap();
        assert_eq!(ctx.phase(), Phase::Draining);
        assert_eq!(ctx.reason(), Some("time budget exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_forces_after_grace() {
        let ctx = Arc::new(ShutdownContext::new());
        let queue = SeedQueue::new();
        let coordinator = ShutdownCoordinator::new(ctx.clone(), Duration::from_secs(5));
        ctx.request("test");

        // "workers" only finish once forced
        let done = {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move { ctx.forced().await }
            }
        };
        coordinator.run(&queue, done).await;
        assert!(ctx.force_requested());
        assert!(queue.is_closed().await);
        assert_eq!(ctx.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn coordinator_terminates_cleanly_when_idle() {
        let ctx = Arc::new(ShutdownContext::new());
        let queue = SeedQueue::new();
        let coordinator = ShutdownCoordinator::new(ctx.clone(), Duration::from_secs(5));
        coordinator.run(&queue, || async {}).await;
        assert!(!ctx.force_requested());
        assert_eq!(ctx.phase(), Phase::Terminated);
    }
}
