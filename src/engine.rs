//! Wires the queue, worker pool, monitor, collector and shutdown
//! coordinator into one run.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bugs::{BugArtifact, BugCollector};
use crate::fuzzers::plugin::FuzzerPlugin;
use crate::runner::monitor::{MonitorConfig, ResourceMonitor};
use crate::runner::pool::{PoolContext, RunSettings, TaskRecord, WorkerPool};
use crate::runner::queue::{SeedQueue, SeedTask};
use crate::shutdown::{ShutdownContext, ShutdownCoordinator, arm_deadline, listen_for_signals};
use crate::utils::state::{EngineStats, StatsSnapshot};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub solver_name: String,
    pub oracle_name: String,
    pub settings: RunSettings,
    pub monitor: MonitorConfig,
    /// How long busy workers get to finish once shutdown is requested.
    pub grace: Duration,
    /// Request shutdown after this long.
    pub time_budget: Option<Duration>,
    /// Install SIGINT/SIGTERM handlers for the run.
    pub handle_signals: bool,
}

/// Everything a finished run has to say.
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub stats: StatsSnapshot,
    /// Final attempts of every task that left the engine.
    pub records: Vec<TaskRecord>,
    pub bugs: Vec<BugArtifact>,
    /// Tasks still queued when the run ended.
    pub remaining: Vec<SeedTask>,
    pub stop_reason: Option<String>,
}

pub struct Engine {
    config: EngineConfig,
    plugin: Arc<dyn FuzzerPlugin>,
    shutdown: Arc<ShutdownContext>,
}

impl Engine {
    pub fn new(config: EngineConfig, plugin: Arc<dyn FuzzerPlugin>) -> Self {
        Self {
            config,
            plugin,
            shutdown: Arc::new(ShutdownContext::new()),
        }
    }

    /// Handle for requesting shutdown from outside the run.
    pub fn shutdown_handle(&self) -> Arc<ShutdownContext> {
        self.shutdown.clone()
    }

    /// Fuzz `seeds` until the queue is exhausted or shutdown completes.
    pub async fn run(self, seeds: Vec<PathBuf>) -> anyhow::Result<EngineReport> {
        let Engine {
            config,
            plugin,
            shutdown,
        } = self;

        let collector = Arc::new(
            BugCollector::load(config.settings.roots.bugs_root.clone(), plugin.bug_patterns())
                .await
                .context("failed to open bugs folder")?,
        );

        // all seeds go in before any worker starts; an empty queue with
        // nothing in flight reads as exhausted
        let queue = Arc::new(SeedQueue::new());
        for seed in seeds {
            let task = SeedTask::new(seed, &config.solver_name, &config.oracle_name);
            let path = task.path.clone();
            if !queue.enqueue(task).await {
                warn!(seed = %path.display(), "duplicate seed ignored");
            }
        }
        let queued = queue.size().await;
        info!(
            seeds = queued,
            workers = config.workers,
            fuzzer = plugin.name(),
            solver = %config.solver_name,
            oracle = %config.oracle_name,
            "starting fuzzing run"
        );

        let signals = config
            .handle_signals
            .then(|| listen_for_signals(shutdown.clone()));
        let deadline = config.time_budget.map(|budget| {
            info!(budget_secs = budget.as_secs(), "time budget armed");
            arm_deadline(shutdown.clone(), budget)
        });

        let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone()));
        let watcher = tokio::spawn(monitor.clone().watch_system(shutdown.clone()));

        let ctx = Arc::new(PoolContext {
            queue: queue.clone(),
            plugin,
            monitor,
            collector: collector.clone(),
            shutdown: shutdown.clone(),
            stats: EngineStats::new(),
            records: Mutex::new(Vec::new()),
            settings: config.settings.clone(),
        });
        let pool = WorkerPool::spawn(config.workers, ctx.clone());

        ShutdownCoordinator::new(shutdown.clone(), config.grace)
            .run(&queue, || pool.all_stopped())
            .await;
        pool.join().await;

        watcher.abort();
        for handle in signals.into_iter().chain(deadline) {
            handle.abort();
        }

        collector.flush().await.context("failed to flush bug index")?;

        let remaining = queue.drain().await;
        let records = std::mem::take(&mut *ctx.records.lock().await);
        let report = EngineReport {
            stats: ctx.stats.snapshot(),
            records,
            bugs: collector.artifacts().await,
            remaining,
            stop_reason: shutdown.reason().map(str::to_string),
        };
        info!(
            processed = report.stats.processed,
            bugs = report.bugs.len(),
            remaining = report.remaining.len(),
            "fuzzing run finished"
        );
        Ok(report)
    }
}

impl EngineReport {
    /// Human-readable end-of-run summary, bug contents included.
    pub fn write_summary<W: Write>(&self, out: &mut W, job_id: Option<&str>) -> io::Result<()> {
        let rule = "=".repeat(60);
        let thin = "-".repeat(60);
        writeln!(out)?;
        writeln!(out, "{rule}")?;
        match job_id {
            Some(job) => writeln!(out, "FINAL BUG SUMMARY FOR JOB {job}")?,
            None => writeln!(out, "FINAL BUG SUMMARY")?,
        }
        writeln!(out, "{rule}")?;

        if self.bugs.is_empty() {
            writeln!(out, "No bugs found.")?;
        } else {
            writeln!(out, "\nFound {} bug(s):", self.bugs.len())?;
            for (i, bug) in self.bugs.iter().enumerate() {
                writeln!(out, "\nBug #{}: {}", i + 1, bug.stored_path.display())?;
                writeln!(out, "  seed: {}  hash: {}", bug.seed.display(), bug.content_hash)?;
                writeln!(out, "{thin}")?;
                match std::fs::read(&bug.stored_path) {
                    Ok(content) => writeln!(out, "{}", String::from_utf8_lossy(&content))?,
                    Err(err) => writeln!(out, "Error reading bug file: {err}")?,
                }
                writeln!(out, "{thin}")?;
            }
        }

        let stats = &self.stats;
        writeln!(out)?;
        writeln!(out, "Statistics:")?;
        writeln!(out, "  Tests processed: {}", stats.processed)?;
        writeln!(out, "  Bugs found: {}", stats.bugs_found)?;
        writeln!(out, "  Tests requeued: {}", stats.requeued)?;
        writeln!(out, "  Tests removed (unsupported): {}", stats.removed)?;
        writeln!(out, "  Tests continued: {}", stats.continued)?;
        writeln!(out, "  Runs killed (timeout/resources): {}", stats.killed)?;
        writeln!(out, "  Tests errored: {}", stats.errored)?;
        writeln!(out, "  Tests abandoned (attempt cap): {}", stats.abandoned)?;
        writeln!(out, "  Tests still queued: {}", self.remaining.len())?;
        if let Some(reason) = &self.stop_reason {
            writeln!(out, "  Stopped early: {reason}")?;
        }
        writeln!(out, "{rule}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_bugs_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let stored = dir.path().join("crash1.smt2");
        std::fs::write(&stored, "(assert false)").unwrap();
        let report = EngineReport {
            stats: StatsSnapshot {
                processed: 4,
                bugs_found: 1,
                ..StatsSnapshot::default()
            },
            records: Vec::new(),
            bugs: vec![BugArtifact {
                source_path: dir.path().join("worker_0/crash1.smt2"),
                stored_path: stored,
                content_hash: "abc".into(),
                seed: "regress/a.smt2".into(),
                solver_name: "z3".into(),
                oracle_name: "cvc5".into(),
                discovered_at: chrono::Utc::now(),
            }],
            remaining: Vec::new(),
            stop_reason: Some("received SIGINT".into()),
        };

        let mut out = Vec::new();
        report.write_summary(&mut out, Some("42")).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("FINAL BUG SUMMARY FOR JOB 42"));
        assert!(text.contains("Found 1 bug(s):"));
        assert!(text.contains("(assert false)"));
        assert!(text.contains("Tests processed: 4"));
        assert!(text.contains("Stopped early: received SIGINT"));
    }

    #[test]
    fn summary_without_bugs() {
        let report = EngineReport {
            stats: StatsSnapshot::default(),
            records: Vec::new(),
            bugs: Vec::new(),
            remaining: Vec::new(),
            stop_reason: None,
        };
        let mut out = Vec::new();
        report.write_summary(&mut out, None).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("No bugs found."));
        assert!(!text.contains("Stopped early"));
    }
}
