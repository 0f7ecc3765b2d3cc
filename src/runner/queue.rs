use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};

/// One seed file waiting to be fuzzed. Identity is `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedTask {
    pub path: PathBuf,
    pub solver_name: String,
    pub oracle_name: String,
    pub attempt_count: u32,
}

impl SeedTask {
    pub fn new(path: impl Into<PathBuf>, solver_name: &str, oracle_name: &str) -> Self {
        Self {
            path: path.into(),
            solver_name: solver_name.to_string(),
            oracle_name: oracle_name.to_string(),
            attempt_count: 0,
        }
    }

    /// The same seed, one attempt later.
    pub fn next_attempt(mut self) -> Self {
        self.attempt_count += 1;
        self
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<SeedTask>,
    /// Paths that are pending or leased; guards against duplicates.
    live: HashSet<PathBuf>,
    leased: usize,
    closed: bool,
}

/// FIFO of seed tasks shared by every worker.
///
/// A dequeued task stays *leased* until the worker either requeues it or
/// finishes it. An empty queue with no leases can never refill, so blocked
/// callers are released with `None`.
#[derive(Debug, Default)]
pub struct SeedQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SeedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if intake is closed or the seed is already queued or
    /// in flight.
    pub async fn enqueue(&self, task: SeedTask) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.closed || !state.live.insert(task.path.clone()) {
                return false;
            }
            state.pending.push_back(task);
        }
        self.notify.notify_waiters();
        true
    }

    /// Wait for the next task. `None` once the queue is closed or exhausted.
    pub async fn dequeue(&self) -> Option<SeedTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(task) = state.pending.pop_front() {
                    state.leased += 1;
                    return Some(task);
                }
                if state.leased == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Put a leased task back at the end of the line. Honored after `close`
    /// so the task shows up in [`SeedQueue::drain`]; returns `false` in that
    /// case since it will not be handed out again.
    pub async fn requeue(&self, task: SeedTask) -> bool {
        let open = {
            let mut state = self.state.lock().await;
            state.leased = state.leased.saturating_sub(1);
            state.live.insert(task.path.clone());
            state.pending.push_back(task);
            !state.closed
        };
        self.notify.notify_waiters();
        open
    }

    /// Release a leased task for good.
    pub async fn finish(&self, task: &SeedTask) {
        {
            let mut state = self.state.lock().await;
            state.leased = state.leased.saturating_sub(1);
            state.live.remove(&task.path);
        }
        self.notify.notify_waiters();
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.leased
    }

    /// Stop intake and release every blocked `dequeue`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Take whatever is still pending.
    pub async fn drain(&self) -> Vec<SeedTask> {
        let mut state = self.state.lock().await;
        let drained: Vec<SeedTask> = state.pending.drain(..).collect();
        for task in &drained {
            state.live.remove(&task.path);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(name: &str) -> SeedTask {
        SeedTask::new(name, "z3", "cvc5")
    }

    #[tokio::test]
    async fn fifo_with_requeue_at_back() {
        let queue = SeedQueue::new();
        assert!(queue.enqueue(task("a")).await);
        assert!(queue.enqueue(task("b")).await);

        let a = queue.dequeue().await.unwrap();
        assert_eq!(a.path, PathBuf::from("a"));
        queue.requeue(a.next_attempt()).await;

        let b = queue.dequeue().await.unwrap();
        assert_eq!(b.path, PathBuf::from("b"));
        queue.finish(&b).await;

        let a = queue.dequeue().await.unwrap();
        assert_eq!(a.attempt_count, 1);
        queue.finish(&a).await;

        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test]
    async fn rejects_duplicates_while_live() {
        let queue = SeedQueue::new();
        assert!(queue.enqueue(task("a")).await);
        assert!(!queue.enqueue(task("a")).await);

        let a = queue.dequeue().await.unwrap();
        assert!(!queue.enqueue(task("a")).await, "leased task counts as live");
        queue.finish(&a).await;
        assert!(queue.enqueue(task("a")).await);
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn dequeue_waits_for_in_flight_requeue() {
        let queue = Arc::new(SeedQueue::new());
        queue.enqueue(task("a")).await;
        let a = queue.dequeue().await.unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.requeue(a.next_attempt()).await;
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.attempt_count, 1);
    }

    #[tokio::test]
    async fn waiters_released_when_last_lease_finishes() {
        let queue = Arc::new(SeedQueue::new());
        queue.enqueue(task("a")).await;
        let a = queue.dequeue().await.unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.finish(&a).await;
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_stops_intake_but_keeps_requeues() {
        let queue = Arc::new(SeedQueue::new());
        queue.enqueue(task("a")).await;
        queue.enqueue(task("b")).await;
        let a = queue.dequeue().await.unwrap();

        queue.close().await;
        assert!(!queue.enqueue(task("c")).await);
        assert_eq!(queue.dequeue().await, None);

        assert!(!queue.requeue(a.next_attempt()).await);
        let rest = queue.drain().await;
        let names: Vec<_> = rest.iter().map(|t| t.path.clone()).collect();
        assert_eq!(names, vec![PathBuf::from("b"), PathBuf::from("a")]);
        assert_eq!(queue.size().await, 0);
    }
}
