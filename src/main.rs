use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use commitfuzz::config::{
    ConfigRoot, merge_params, parse_param_override, parse_seed_list, time_remaining_for_job,
    validate_binary,
};
use commitfuzz::engine::{Engine, EngineConfig};
use commitfuzz::error::EngineError;
use commitfuzz::fuzzers::get_fuzzer;
use commitfuzz::fuzzers::plugin::{DirRoots, Params};
use commitfuzz::runner::monitor::MonitorConfig;
use commitfuzz::runner::pool::RunSettings;

const MIB: u64 = 1024 * 1024;

/// Runs a mutation fuzzer over a solver's regression tests, in parallel.
#[derive(Parser, Debug)]
#[command(name = "commitfuzz", version)]
struct Args {
    /// Solver name (needs <config-dir>/solvers/<name>/solver.json)
    #[arg(long)]
    solver: String,

    /// Oracle solver name (default: from solver config, fallback: cvc5)
    #[arg(long)]
    oracle: Option<String>,

    /// Fuzzer name (default: from solver config, fallback: typefuzz)
    #[arg(long)]
    fuzzer: Option<String>,

    /// JSON array of seed paths, relative to the tests root
    #[arg(long)]
    tests_json: String,

    /// Override a fuzzer parameter
    #[arg(long = "fuzzer-param", value_name = "KEY=VALUE")]
    fuzzer_params: Vec<String>,

    #[arg(long, default_value = "scripts")]
    config_dir: PathBuf,

    /// Directory seed paths are relative to (default: solver's test_dir)
    #[arg(long)]
    tests_root: Option<PathBuf>,

    #[arg(long, default_value = "bugs")]
    bugs_folder: PathBuf,

    /// Where per-worker scratch and log directories go
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Number of workers (default: CPU count)
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    job_id: Option<String>,

    /// Drop a seed after this many runs
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Seconds available for fuzzing
    #[arg(long, conflicts_with = "job_start_time")]
    time_remaining: Option<u64>,

    /// Unix timestamp at which the surrounding CI job started
    #[arg(long)]
    job_start_time: Option<f64>,

    #[arg(long, default_value_t = 5)]
    stop_buffer_minutes: u64,

    /// Seconds busy workers get to finish once shutdown starts
    #[arg(long, default_value_t = 5.0)]
    grace_secs: f64,

    /// Wall-clock limit for a single fuzzer run, in seconds
    #[arg(long)]
    run_timeout: Option<f64>,

    #[arg(long, default_value_t = 2048)]
    max_memory_mb: u64,

    #[arg(long)]
    max_cpu_percent: Option<f64>,

    #[arg(long, default_value_t = 2.0)]
    sample_interval_secs: f64,

    /// System CPU usage at which workers back off before starting a run
    #[arg(long, default_value_t = 85.0)]
    cpu_warning_percent: f64,

    /// System CPU usage at which workers stop taking tasks for a while
    #[arg(long, default_value_t = 95.0)]
    cpu_critical_percent: f64,

    /// How long workers stay paused under critical load, in seconds
    #[arg(long, default_value_t = 10.0)]
    pause_secs: f64,

    /// Seconds between SIGTERM and SIGKILL
    #[arg(long, default_value_t = 5.0)]
    kill_grace_secs: f64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            if err.downcast_ref::<EngineError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config_root = ConfigRoot::new(&args.config_dir);
    let solver = config_root.solver(&args.solver)?;
    let oracle_name = solver.oracle_name(args.oracle.as_deref());
    let oracle = config_root.solver(&oracle_name)?;
    let fuzzer_name = solver.fuzzer_name(args.fuzzer.as_deref());

    validate_binary(&args.solver, &solver.binary_path)?;
    validate_binary(&oracle_name, &oracle.binary_path)?;

    let fuzzer_config = config_root.fuzzer(&fuzzer_name)?;
    let plugin = get_fuzzer(&fuzzer_name, fuzzer_config.as_ref())?;

    let mut cli_params = Params::new();
    for raw in &args.fuzzer_params {
        let (key, value) = parse_param_override(raw)?;
        cli_params.insert(key, value);
    }
    let params = merge_params(&[plugin.default_params(), &solver.fuzzer_overrides, &cli_params]);

    let seeds = parse_seed_list(&args.tests_json)?;
    if seeds.is_empty() {
        warn!("no seeds given, nothing to fuzz");
    }

    let workers = worker_count(args.workers);
    let time_budget = match (args.time_remaining, args.job_start_time) {
        (Some(secs), _) => Some(Duration::from_secs(secs)),
        (None, Some(job_start)) => {
            let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
            Some(time_remaining_for_job(
                job_start,
                now,
                args.stop_buffer_minutes,
            ))
        }
        (None, None) => None,
    };

    let max_rss = args.max_memory_mb * MIB;
    let monitor = MonitorConfig {
        sample_interval: Duration::from_secs_f64(args.sample_interval_secs.max(0.1)),
        run_timeout: args.run_timeout.map(Duration::from_secs_f64),
        max_rss_bytes: Some(max_rss),
        pressure_rss_bytes: Some(max_rss / 4 * 3),
        max_cpu_percent: args.max_cpu_percent,
        kill_grace: Duration::from_secs_f64(args.kill_grace_secs.max(0.0)),
        cpu_warning_percent: Some(args.cpu_warning_percent),
        cpu_critical_percent: Some(args.cpu_critical_percent),
        pause_duration: Duration::from_secs_f64(args.pause_secs.max(0.0)),
        ..MonitorConfig::default()
    };

    info!(
        job = args.job_id.as_deref().unwrap_or("-"),
        solver = %solver.cli(),
        oracle = %oracle.cli(),
        fuzzer = %fuzzer_name,
        ?params,
        "resolved configuration"
    );

    let config = EngineConfig {
        workers,
        solver_name: args.solver.clone(),
        oracle_name: oracle_name.clone(),
        settings: RunSettings {
            tests_root: args.tests_root.clone().unwrap_or_else(|| solver.test_dir()),
            roots: DirRoots {
                bugs_root: args.bugs_folder.clone(),
                work_root: args.work_dir.clone(),
            },
            solver_cli: solver.cli(),
            oracle_cli: oracle.cli(),
            params,
            max_attempts: args.max_attempts,
        },
        monitor,
        grace: Duration::from_secs_f64(args.grace_secs.max(0.0)),
        time_budget,
        handle_signals: true,
    };

    let report = Engine::new(config, plugin).run(seeds).await?;
    report.write_summary(&mut std::io::stdout().lock(), args.job_id.as_deref())?;
    Ok(())
}

/// Requested worker count, capped at the number of cores.
fn worker_count(requested: Option<usize>) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    match requested {
        Some(0) => {
            warn!("--workers 0 is not useful, using 1");
            1
        }
        Some(n) if n > cores => {
            warn!(requested = n, cores, "more workers than cores, capping");
            cores
        }
        Some(n) => n,
        None => cores,
    }
}
