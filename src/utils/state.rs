use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::fuzzers::plugin::Action;

/// Running counters for one engine run, shared by every worker.
#[derive(Debug, Default)]
pub struct EngineStats {
    processed: AtomicUsize,
    bugs_found: AtomicUsize,
    requeued: AtomicUsize,
    removed: AtomicUsize,
    continued: AtomicUsize,
    errored: AtomicUsize,
    killed: AtomicUsize,
    abandoned: AtomicUsize,
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: usize,
    pub bugs_found: usize,
    pub requeued: usize,
    /// Dropped as unsupported by the solver.
    pub removed: usize,
    pub continued: usize,
    pub errored: usize,
    /// Runs cut short by a timeout or resource cap.
    pub killed: usize,
    /// Dropped on reaching the attempt cap.
    pub abandoned: usize,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one completed run.
    pub fn record_run(&self, action: Action, bugs: usize, killed: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.bugs_found.fetch_add(bugs, Ordering::Relaxed);
        if killed {
            self.killed.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match action {
            Action::Requeue => &self.requeued,
            Action::Remove => &self.removed,
            Action::Continue => &self.continued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            bugs_found: self.bugs_found.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            continued: self.continued.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            killed: self.killed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_action() {
        let stats = EngineStats::new();
        stats.record_run(Action::Requeue, 2, false);
        stats.record_run(Action::Remove, 0, false);
        stats.record_run(Action::Continue, 0, true);
        stats.record_error();
        stats.record_abandoned();

        let snap = stats.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.bugs_found, 2);
        assert_eq!(snap.requeued, 1);
        assert_eq!(snap.removed, 1);
        assert_eq!(snap.continued, 1);
        assert_eq!(snap.killed, 1);
        assert_eq!(snap.errored, 1);
        assert_eq!(snap.abandoned, 1);
    }
}
