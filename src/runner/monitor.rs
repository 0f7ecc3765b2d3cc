//! Per-run resource supervision.
//!
//! Every fuzzer run gets its own sampler task that reads the run's process
//! group from `/proc` at a fixed interval and reports the first limit it
//! crosses. A separate system watch tracks machine-wide CPU and memory:
//! workers back off or pause while the machine is saturated, the memory
//! ceiling drops under memory pressure, and shutdown is requested when the
//! machine is about to run out of RAM.

use std::fmt;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::runner::process::{ExecutionStatus, FuzzProcess};
use crate::shutdown::ShutdownContext;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sample_interval: Duration,
    /// Wall-clock cap for a single run.
    pub run_timeout: Option<Duration>,
    /// RSS cap for a run's process group.
    pub max_rss_bytes: Option<u64>,
    /// Stricter RSS cap used while the system is short on memory.
    pub pressure_rss_bytes: Option<u64>,
    pub max_cpu_percent: Option<f64>,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    pub memory_warning_available: u64,
    pub memory_critical_available: u64,
    /// Machine-wide CPU usage at which workers back off before each run.
    pub cpu_warning_percent: Option<f64>,
    /// Machine-wide CPU usage at which workers hand their task back and pause.
    pub cpu_critical_percent: Option<f64>,
    pub warning_backoff: Duration,
    pub pause_duration: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(2),
            run_timeout: None,
            max_rss_bytes: Some(2048 * MIB),
            pressure_rss_bytes: Some(1536 * MIB),
            max_cpu_percent: None,
            kill_grace: Duration::from_secs(5),
            memory_warning_available: 2048 * MIB,
            memory_critical_available: 512 * MIB,
            cpu_warning_percent: Some(85.0),
            cpu_critical_percent: Some(95.0),
            warning_backoff: Duration::from_secs(2),
            pause_duration: Duration::from_secs(10),
        }
    }
}

/// Machine-wide load as seen by the system watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemStatus {
    Normal = 0,
    Warning = 1,
    Critical = 2,
}

impl SystemStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            2 => SystemStatus::Critical,
            1 => SystemStatus::Warning,
            _ => SystemStatus::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub worker_id: usize,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub sampled_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitExceeded {
    WallClock { elapsed: Duration, limit: Duration },
    Memory { rss_bytes: u64, limit: u64 },
    Cpu { percent: f64, limit: f64 },
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitExceeded::WallClock { elapsed, limit } => write!(
                f,
                "timeout after {:.1}s (limit {:.1}s)",
                elapsed.as_secs_f64(),
                limit.as_secs_f64()
            ),
            LimitExceeded::Memory { rss_bytes, limit } => write!(
                f,
                "using {:.1}MB RAM (limit {}MB)",
                *rss_bytes as f64 / MIB as f64,
                limit / MIB
            ),
            LimitExceeded::Cpu { percent, limit } => {
                write!(f, "using {percent:.0}% CPU (limit {limit:.0}%)")
            }
        }
    }
}

#[derive(Debug)]
pub struct ResourceMonitor {
    config: MonitorConfig,
    memory_pressure: AtomicBool,
    status: AtomicU8,
    procfs: bool,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let procfs = fs::metadata("/proc/self/stat").is_ok();
        if !procfs {
            warn!("/proc not available, enforcing wall-clock limits only");
        }
        Self {
            config,
            memory_pressure: AtomicBool::new(false),
            status: AtomicU8::new(SystemStatus::Normal as u8),
            procfs,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn under_memory_pressure(&self) -> bool {
        self.memory_pressure.load(Ordering::Relaxed)
    }

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    pub(crate) fn set_system_status(&self, status: SystemStatus) {
        let previous = self.status.swap(status as u8, Ordering::Relaxed);
        if previous != status as u8 {
            info!(status = ?status, "system load status changed");
        }
    }

    /// Status for an average CPU usage (`None` before the first delta).
    pub fn classify(&self, cpu_percent: Option<f64>) -> SystemStatus {
        let at_least = |limit: Option<f64>| {
            matches!((cpu_percent, limit), (Some(cpu), Some(limit)) if cpu >= limit)
        };
        if at_least(self.config.cpu_critical_percent) {
            SystemStatus::Critical
        } else if at_least(self.config.cpu_warning_percent) || self.under_memory_pressure() {
            SystemStatus::Warning
        } else {
            SystemStatus::Normal
        }
    }

    pub fn rss_ceiling(&self) -> Option<u64> {
        if self.under_memory_pressure() {
            self.config.pressure_rss_bytes.or(self.config.max_rss_bytes)
        } else {
            self.config.max_rss_bytes
        }
    }

    /// The first limit `sample` (taken `elapsed` into the run) violates.
    pub fn check(&self, sample: &ResourceSample, elapsed: Duration) -> Option<LimitExceeded> {
        if let Some(limit) = self.config.run_timeout {
            if elapsed >= limit {
                return Some(LimitExceeded::WallClock { elapsed, limit });
            }
        }
        if let Some(limit) = self.rss_ceiling() {
            if sample.rss_bytes > limit {
                return Some(LimitExceeded::Memory {
                    rss_bytes: sample.rss_bytes,
                    limit,
                });
            }
        }
        if let Some(limit) = self.config.max_cpu_percent {
            if sample.cpu_percent > limit {
                return Some(LimitExceeded::Cpu {
                    percent: sample.cpu_percent,
                    limit,
                });
            }
        }
        None
    }

    /// Start sampling `process` for `worker_id`. The sampler stops when the
    /// returned [`Supervision`] is dropped.
    pub fn supervise(self: &Arc<Self>, worker_id: usize, process: &FuzzProcess) -> Supervision {
        let (verdict_tx, verdict_rx) = oneshot::channel();
        let monitor = self.clone();
        let pgid = process.pgid();
        let started = process.started();
        let task = tokio::spawn(async move {
            if let Some(limit) = monitor.sample_loop(worker_id, pgid, started).await {
                let _ = verdict_tx.send(limit);
            }
        });
        Supervision {
            verdict: Some(verdict_rx),
            task,
        }
    }

    async fn sample_loop(&self, worker_id: usize, pgid: i32, started: Instant) -> Option<LimitExceeded> {
        let deadline = self
            .config
            .run_timeout
            .map(|limit| tokio::time::Instant::from_std(started + limit));
        let mut interval = tokio::time::interval(self.config.sample_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut previous: Option<(u64, Instant)> = None;

        loop {
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    interval.tick().await;
                }
            }

            let now = Instant::now();
            let usage = if self.procfs {
                tokio::task::spawn_blocking(move || group_usage(pgid))
                    .await
                    .ok()
                    .flatten()
            } else {
                None
            };
            let (cpu, rss_bytes) = match usage {
                Some(usage) => {
                    let percent = previous
                        .map(|(ticks, at)| cpu_percent(ticks, usage.cpu_ticks, now - at))
                        .unwrap_or(0.0);
                    previous = Some((usage.cpu_ticks, now));
                    (percent, usage.rss_bytes)
                }
                None => (0.0, 0),
            };
            let sample = ResourceSample {
                worker_id,
                cpu_percent: cpu,
                rss_bytes,
                sampled_at: now,
            };
            debug!(
                worker = worker_id,
                pgid,
                cpu_percent = sample.cpu_percent,
                rss_mb = sample.rss_bytes / MIB,
                "resource sample"
            );
            if let Some(limit) = self.check(&sample, started.elapsed()) {
                return Some(limit);
            }
        }
    }

    /// Terminate `process` through the graceful-then-forced kill path.
    pub async fn terminate(&self, process: &mut FuzzProcess) -> ExecutionStatus {
        process.terminate(self.config.kill_grace).await
    }

    /// Watch system CPU and memory until shutdown is requested.
    pub async fn watch_system(self: Arc<Self>, ctx: Arc<ShutdownContext>) {
        if !self.procfs {
            return;
        }
        let mut interval = tokio::time::interval(self.config.sample_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut previous_cpu: Option<CpuTimes> = None;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = ctx.requested() => return,
            }
            let (cpu_times, available) = tokio::task::spawn_blocking(|| (cpu_times(), mem_available_bytes()))
                .await
                .unwrap_or((None, None));

            let cpu = match (previous_cpu, cpu_times) {
                (Some(before), Some(now)) => before.busy_percent(&now),
                _ => None,
            };
            if cpu_times.is_some() {
                previous_cpu = cpu_times;
            }

            let Some(available) = available else {
                self.set_system_status(self.classify(cpu));
                continue;
            };
            let pressure = available < self.config.memory_warning_available;
            if self.memory_pressure.swap(pressure, Ordering::Relaxed) != pressure {
                info!(
                    available_mb = available / MIB,
                    pressure, "system memory pressure changed"
                );
            }
            if available < self.config.memory_critical_available {
                error!(
                    available_mb = available / MIB,
                    "critical RAM, stopping to preserve bugs"
                );
                ctx.request("system memory critically low");
                return;
            }
            self.set_system_status(self.classify(cpu));
        }
    }
}

/// Handle on one run's sampler.
#[derive(Debug)]
pub struct Supervision {
    verdict: Option<oneshot::Receiver<LimitExceeded>>,
    task: JoinHandle<()>,
}

impl Supervision {
    /// Resolves with the first crossed limit; pends forever if none is.
    /// Cancel safe.
    pub async fn limit_exceeded(&mut self) -> LimitExceeded {
        if let Some(rx) = self.verdict.as_mut() {
            if let Ok(limit) = rx.await {
                return limit;
            }
            self.verdict = None;
        }
        std::future::pending().await
    }
}

impl Drop for Supervision {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct GroupUsage {
    cpu_ticks: u64,
    rss_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    pgrp: i32,
    cpu_ticks: u64,
    rss_pages: u64,
}

/// Parse the fields we need out of a `/proc/<pid>/stat` line.
fn parse_stat(line: &str) -> Option<ProcStat> {
    // comm may contain spaces and parens; everything after the last ')' is
    // whitespace separated starting at field 3 (state)
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let pgrp = fields.get(2)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss_pages = fields.get(21)?.parse::<i64>().ok()?.max(0) as u64;
    Some(ProcStat {
        pgrp,
        cpu_ticks: utime + stime,
        rss_pages,
    })
}

/// Sum CPU ticks and RSS over every live process in group `pgid`.
fn group_usage(pgid: i32) -> Option<GroupUsage> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(1) as u64;
    let mut usage = GroupUsage::default();
    let mut found = false;
    for entry in fs::read_dir("/proc").ok()?.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };
        let Ok(line) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some(stat) = parse_stat(&line).filter(|stat| stat.pgrp == pgid) {
            usage.cpu_ticks += stat.cpu_ticks;
            usage.rss_bytes += stat.rss_pages * page_size;
            found = true;
        }
    }
    found.then_some(usage)
}

fn cpu_percent(previous_ticks: u64, ticks: u64, elapsed: Duration) -> f64 {
    let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as f64;
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    ticks.saturating_sub(previous_ticks) as f64 / clock_ticks / secs * 100.0
}

/// Aggregate jiffies from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

impl CpuTimes {
    /// Average busy percentage across all cores between two readings.
    fn busy_percent(&self, later: &CpuTimes) -> Option<f64> {
        let total = later.total.checked_sub(self.total)?;
        if total == 0 {
            return None;
        }
        let busy = later.busy.saturating_sub(self.busy);
        Some(busy as f64 / total as f64 * 100.0)
    }
}

fn parse_proc_stat(contents: &str) -> Option<CpuTimes> {
    let line = contents.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|field| field.parse().ok())
        .collect::<Option<_>>()?;
    // user nice system idle iowait irq softirq steal
    let idle = fields.get(3)? + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn cpu_times() -> Option<CpuTimes> {
    parse_proc_stat(&fs::read_to_string("/proc/stat").ok()?)
}

fn parse_meminfo(contents: &str) -> Option<u64> {
    let line = contents.lines().find(|line| line.starts_with("MemAvailable:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

fn mem_available_bytes() -> Option<u64> {
    parse_meminfo(&fs::read_to_string("/proc/meminfo").ok()?)
}
