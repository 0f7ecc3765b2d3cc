use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use serde::Serialize;
use tokio::fs;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bugs::BugCollector;
use crate::fuzzers::plugin::{
    Action, DirKind, DirRoots, FuzzerPlugin, Invocation, Params, RunDirs, RunOutcome,
};
use crate::runner::monitor::{ResourceMonitor, SystemStatus};
use crate::runner::process::{ExecutionStatus, FuzzProcess};
use crate::runner::queue::{SeedQueue, SeedTask};
use crate::shutdown::ShutdownContext;
use crate::utils::state::EngineStats;

/// Per-run inputs that stay fixed for the whole engine run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Seed paths are relative to this directory.
    pub tests_root: PathBuf,
    pub roots: DirRoots,
    pub solver_cli: String,
    pub oracle_cli: String,
    /// Already merged: plugin defaults < solver overrides < caller overrides.
    pub params: Params,
    pub max_attempts: Option<u32>,
}

/// State shared by every worker loop.
pub struct PoolContext {
    pub queue: Arc<SeedQueue>,
    pub plugin: Arc<dyn FuzzerPlugin>,
    pub monitor: Arc<ResourceMonitor>,
    pub collector: Arc<BugCollector>,
    pub shutdown: Arc<ShutdownContext>,
    pub stats: EngineStats,
    pub records: Mutex<Vec<TaskRecord>>,
    pub settings: RunSettings,
}

/// How a task left the engine for good.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Fate {
    Outcome(RunOutcome),
    Errored(String),
}

/// The final attempt of a task that will not run again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task: SeedTask,
    pub worker_id: usize,
    pub fate: Fate,
    /// Dropped on reaching the attempt cap rather than by its outcome.
    pub abandoned: bool,
}

/// What one worker is doing right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSlot {
    pub id: usize,
    pub current_task: Option<SeedTask>,
    pub pid: Option<i32>,
    pub start_time: Option<Instant>,
}

struct Worker {
    id: usize,
    slot: Arc<Mutex<WorkerSlot>>,
    ctx: Arc<PoolContext>,
}

/// Decrements the live-worker count however the loop exits.
struct LiveGuard(Arc<watch::Sender<usize>>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|live| *live = live.saturating_sub(1));
    }
}

struct Execution {
    outcome: RunOutcome,
    forced: bool,
}

impl Worker {
    async fn run(self) {
        let ctx = self.ctx.clone();
        while let Some(task) = ctx.queue.dequeue().await {
            if ctx.shutdown.termination_requested() {
                // raced with close; leave it for the final report
                ctx.queue.requeue(task).await;
                break;
            }
            match ctx.monitor.system_status() {
                SystemStatus::Critical => {
                    warn!(worker = self.id, "system load critical, pausing");
                    ctx.queue.requeue(task).await;
                    self.pause(ctx.monitor.config().pause_duration).await;
                    continue;
                }
                SystemStatus::Warning => {
                    debug!(worker = self.id, "system load high, backing off");
                    self.pause(ctx.monitor.config().warning_backoff).await;
                    if ctx.shutdown.termination_requested() {
                        ctx.queue.requeue(task).await;
                        break;
                    }
                }
                SystemStatus::Normal => {}
            }
            {
                let mut slot = self.slot.lock().await;
                slot.current_task = Some(task.clone());
                slot.start_time = Some(Instant::now());
            }
            debug!(
                worker = self.id,
                task = %task.path.display(),
                attempt = task.attempt_count,
                "starting run"
            );

            let result = self.execute(&task).await;
            self.settle(task, result).await;

            let mut slot = self.slot.lock().await;
            slot.current_task = None;
            slot.pid = None;
            slot.start_time = None;
        }
        debug!(worker = self.id, "worker stopped");
    }

    /// Sleep for `duration`, or less if shutdown is requested.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.ctx.shutdown.requested() => {}
        }
    }

    async fn execute(&self, task: &SeedTask) -> anyhow::Result<Execution> {
        let settings = &self.ctx.settings;
        let plugin = &self.ctx.plugin;

        let seed_path = settings.tests_root.join(&task.path);
        if fs::metadata(&seed_path).await.is_err() {
            bail!("seed file not found: {}", seed_path.display());
        }

        let dirs = RunDirs::resolve(plugin.dirs(), self.id, &settings.roots);
        prepare_dirs(&dirs).await?;

        let invocation = Invocation {
            worker_id: self.id,
            seed_path: &seed_path,
            solver_cli: &settings.solver_cli,
            oracle_cli: &settings.oracle_cli,
            dirs: &dirs,
            params: &settings.params,
        };
        let result = match plugin.build_command(&invocation) {
            Ok(argv) => self.run_process(&argv, &dirs).await,
            Err(err) => Err(err.context("failed to build fuzzer command")),
        };
        remove_temp_dirs(&dirs).await;
        let (status, wall_time, forced) = result?;

        let bugs_dir = dirs
            .of_kind(DirKind::Output)
            .next()
            .unwrap_or(settings.roots.bugs_root.as_path());
        let outcome = plugin.parse_result(status.exit_code(), wall_time, bugs_dir);
        Ok(Execution { outcome, forced })
    }

    async fn run_process(
        &self,
        argv: &[String],
        dirs: &RunDirs,
    ) -> anyhow::Result<(ExecutionStatus, Duration, bool)> {
        let monitor = &self.ctx.monitor;
        let mut process = FuzzProcess::spawn(argv, dirs.get("log_dir"))?;
        self.slot.lock().await.pid = Some(process.pid());
        let mut supervision = monitor.supervise(self.id, &process);

        let mut forced = false;
        let status = tokio::select! {
            status = process.wait() => {
                status.context("failed to wait for fuzzer process")?
            }
            limit = supervision.limit_exceeded() => {
                warn!(worker = self.id, pid = process.pid(), "{limit}, killing run");
                monitor.terminate(&mut process).await
            }
            _ = self.ctx.shutdown.forced() => {
                warn!(worker = self.id, pid = process.pid(), "force-terminating run");
                forced = true;
                monitor.terminate(&mut process).await
            }
        };
        Ok((status, process.started().elapsed(), forced))
    }

    /// Requeue, drop or record `task` according to how its run went.
    async fn settle(&self, task: SeedTask, result: anyhow::Result<Execution>) {
        let ctx = &self.ctx;
        let execution = match result {
            Ok(execution) if execution.forced => {
                ctx.stats.record_error();
                self.record(&task, Fate::Errored("terminated during shutdown".into()), false)
                    .await;
                ctx.queue.finish(&task).await;
                return;
            }
            Ok(execution) => execution,
            Err(err) => {
                error!(
                    worker = self.id,
                    task = %task.path.display(),
                    "run failed: {:#}", err
                );
                ctx.stats.record_error();
                self.record(&task, Fate::Errored(format!("{err:#}")), false)
                    .await;
                ctx.queue.finish(&task).await;
                return;
            }
        };

        let outcome = execution.outcome;
        let mut bugs = 0;
        let output_dirs: Vec<PathBuf> = RunDirs::resolve(ctx.plugin.dirs(), self.id, &ctx.settings.roots)
            .of_kind(DirKind::Output)
            .map(Path::to_path_buf)
            .collect();
        for dir in &output_dirs {
            match ctx.collector.collect(dir, &task).await {
                Ok(found) => bugs += found.len(),
                Err(err) => warn!(worker = self.id, "bug collection failed in {:?}: {:#}", dir, err),
            }
        }
        if outcome.bug_found && bugs == 0 {
            debug!(worker = self.id, task = %task.path.display(), "bug reported, no new artifacts");
        }
        ctx.stats.record_run(outcome.action, bugs, outcome.killed());
        info!(
            worker = self.id,
            task = %task.path.display(),
            attempt = task.attempt_count,
            exit_code = outcome.exit_code,
            action = ?outcome.action,
            bugs,
            wall_secs = outcome.wall_time.as_secs_f64(),
            "run finished"
        );

        match outcome.action {
            Action::Requeue => {
                let next = task.attempt_count + 1;
                if ctx.settings.max_attempts.is_some_and(|cap| next >= cap) {
                    info!(
                        worker = self.id,
                        task = %task.path.display(),
                        attempts = next,
                        "attempt cap reached, abandoning"
                    );
                    ctx.stats.record_abandoned();
                    self.record(&task, Fate::Outcome(outcome), true).await;
                    ctx.queue.finish(&task).await;
                } else {
                    let accepted = ctx.queue.requeue(task.clone().next_attempt()).await;
                    if !accepted || ctx.shutdown.termination_requested() {
                        // it will not run again in this engine run
                        self.record(&task, Fate::Outcome(outcome), false).await;
                    }
                }
            }
            Action::Remove | Action::Continue => {
                self.record(&task, Fate::Outcome(outcome), false).await;
                ctx.queue.finish(&task).await;
            }
        }
    }

    async fn record(&self, task: &SeedTask, fate: Fate, abandoned: bool) {
        self.ctx.records.lock().await.push(TaskRecord {
            task: task.clone(),
            worker_id: self.id,
            fate,
            abandoned,
        });
    }
}

/// Recreate temp directories and make sure output directories exist.
async fn prepare_dirs(dirs: &RunDirs) -> anyhow::Result<()> {
    for (name, path, kind) in dirs.iter() {
        if kind == DirKind::Temp {
            match fs::remove_dir_all(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to clear {name} {:?}", path));
                }
            }
        }
        fs::create_dir_all(path)
            .await
            .with_context(|| format!("failed to create {name} {:?}", path))?;
    }
    Ok(())
}

async fn remove_temp_dirs(dirs: &RunDirs) {
    for path in dirs.of_kind(DirKind::Temp) {
        match fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove temp dir {:?}: {}", path, err),
        }
    }
}

/// N independent worker loops over one shared queue.
pub struct WorkerPool {
    slots: Vec<Arc<Mutex<WorkerSlot>>>,
    handles: Vec<JoinHandle<()>>,
    live: Arc<watch::Sender<usize>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, ctx: Arc<PoolContext>) -> Self {
        let live = Arc::new(watch::Sender::new(workers));
        let mut slots = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let slot = Arc::new(Mutex::new(WorkerSlot {
                id,
                ..WorkerSlot::default()
            }));
            let worker = Worker {
                id,
                slot: slot.clone(),
                ctx: ctx.clone(),
            };
            let guard = LiveGuard(live.clone());
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                worker.run().await;
            }));
            slots.push(slot);
        }
        info!(workers, "worker pool started");
        Self {
            slots,
            handles,
            live,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub async fn slots(&self) -> Vec<WorkerSlot> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            out.push(slot.lock().await.clone());
        }
        out
    }

    /// Resolves once every worker loop has returned. Cancel safe.
    pub fn all_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.live.subscribe();
        async move {
            let _ = rx.wait_for(|live| *live == 0).await;
        }
    }

    /// Wait for the loops and report any that panicked.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!("worker task failed: {:?}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzers::plugin::{DirSpec, ExitRule};
    use crate::fuzzers::template::{FuzzerProfile, TemplateFuzzer};
    use crate::runner::monitor::MonitorConfig;
    use std::collections::{BTreeMap, HashSet};

    async fn context(root: &Path, script: &str, seeds: &[&str]) -> Arc<PoolContext> {
        let tests_root = root.join("tests");
        std::fs::create_dir_all(&tests_root).unwrap();
        for seed in seeds {
            std::fs::write(tests_root.join(seed), "(check-sat)").unwrap();
        }

        let mut profile = FuzzerProfile::bare("script");
        profile.command = ["sh", "-c", script, "fuzz", "{seed_path}", "{bugs_dir}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        profile.exit_codes = BTreeMap::from([
            (0, ExitRule::new(false, Action::Requeue)),
            (3, ExitRule::new(false, Action::Remove)),
        ]);
        profile.dirs = BTreeMap::from([
            (
                "bugs_dir".to_string(),
                DirSpec::new("{bugs_root}/worker_{worker_id}", DirKind::Output),
            ),
            (
                "log_dir".to_string(),
                DirSpec::new("{work_root}/logs_{worker_id}", DirKind::Temp),
            ),
        ]);
        profile.bug_patterns = vec!["*.smt2".into()];

        let bugs_root = root.join("bugs");
        let queue = Arc::new(SeedQueue::new());
        for seed in seeds {
            queue.enqueue(SeedTask::new(*seed, "z3", "cvc5")).await;
        }
        Arc::new(PoolContext {
            queue,
            plugin: Arc::new(TemplateFuzzer::new(profile)),
            monitor: Arc::new(ResourceMonitor::new(MonitorConfig::default())),
            collector: Arc::new(
                BugCollector::load(bugs_root.clone(), &["*.smt2".to_string()])
                    .await
                    .unwrap(),
            ),
            shutdown: Arc::new(ShutdownContext::new()),
            stats: EngineStats::new(),
            records: Mutex::new(Vec::new()),
            settings: RunSettings {
                tests_root,
                roots: DirRoots {
                    bugs_root,
                    work_root: root.join("work"),
                },
                solver_cli: "z3".into(),
                oracle_cli: "cvc5".into(),
                params: Params::new(),
                max_attempts: None,
            },
        })
    }

    #[tokio::test]
    async fn a_task_is_held_by_at_most_one_slot() {
        let root = tempfile::tempdir().unwrap();
        let seeds = ["a.smt2", "b.smt2", "c.smt2", "d.smt2", "e.smt2", "f.smt2"];
        let ctx = context(root.path(), "sleep 0.1; exit 3", &seeds).await;
        let pool = WorkerPool::spawn(3, ctx.clone());

        let done = pool.all_stopped();
        tokio::pin!(done);
        loop {
            tokio::select! {
                _ = &mut done => break,
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    let slots = pool.slots().await;
                    let held: Vec<_> = slots.iter().filter_map(|s| s.current_task.clone()).collect();
                    let unique: HashSet<_> = held.iter().map(|t| t.path.clone()).collect();
                    assert_eq!(held.len(), unique.len());
                }
            }
        }
        pool.join().await;

        let records = ctx.records.lock().await;
        assert_eq!(records.len(), seeds.len());
        assert!(records.iter().all(|r| matches!(
            &r.fate,
            Fate::Outcome(outcome) if outcome.action == Action::Remove
        )));
        assert_eq!(ctx.stats.snapshot().removed, seeds.len());
    }

    #[tokio::test]
    async fn missing_seed_is_errored_and_loop_continues() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path(), "exit 3", &["present.smt2"]).await;
        ctx.queue
            .enqueue(SeedTask::new("missing.smt2", "z3", "cvc5"))
            .await;
        let pool = WorkerPool::spawn(1, ctx.clone());
        pool.all_stopped().await;
        pool.join().await;

        let records = ctx.records.lock().await;
        assert_eq!(records.len(), 2);
        let missing = records
            .iter()
            .find(|r| r.task.path == PathBuf::from("missing.smt2"))
            .unwrap();
        assert!(matches!(&missing.fate, Fate::Errored(reason) if reason.contains("not found")));
        assert_eq!(ctx.stats.snapshot().errored, 1);
    }

    #[tokio::test]
    async fn attempt_cap_abandons_requeued_task() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = context(root.path(), "exit 0", &["loop.smt2"]).await;
        Arc::get_mut(&mut ctx).unwrap().settings.max_attempts = Some(3);
        let pool = WorkerPool::spawn(2, ctx.clone());
        pool.all_stopped().await;
        pool.join().await;

        let records = ctx.records.lock().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].abandoned);
        assert_eq!(records[0].task.attempt_count, 2);
        let stats = ctx.stats.snapshot();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.requeued, 3);
        assert_eq!(stats.abandoned, 1);
    }

    #[tokio::test]
    async fn critical_load_hands_task_back_until_it_clears() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = context(root.path(), "exit 3", &["s.smt2"]).await;
        Arc::get_mut(&mut ctx).unwrap().monitor = Arc::new(ResourceMonitor::new(MonitorConfig {
            pause_duration: Duration::from_millis(50),
            ..MonitorConfig::default()
        }));
        ctx.monitor.set_system_status(SystemStatus::Critical);
        let pool = WorkerPool::spawn(1, ctx.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ctx.stats.snapshot().processed, 0);
        assert!(ctx.records.lock().await.is_empty());
        assert!(!root.path().join("work/logs_0").exists());

        ctx.monitor.set_system_status(SystemStatus::Normal);
        pool.all_stopped().await;
        pool.join().await;

        let records = ctx.records.lock().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task.attempt_count, 0);
    }

    #[tokio::test]
    async fn temp_dirs_are_removed_and_output_dirs_kept() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path(), "echo hi; exit 3", &["s.smt2"]).await;
        let pool = WorkerPool::spawn(1, ctx.clone());
        pool.all_stopped().await;
        pool.join().await;

        assert!(!root.path().join("work/logs_0").exists());
        assert!(root.path().join("bugs/worker_0").is_dir());
    }
}
