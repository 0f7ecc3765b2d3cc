//! Solver and fuzzer configuration.
//!
//! Solvers live at `<root>/solvers/<name>/solver.json`, fuzzers at
//! `<root>/fuzzers/<name>/fuzzer.json`. Only the files for the names asked
//! for are read.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::fuzzers::plugin::{DirSpec, ExitRule, Params};
use crate::fuzzers::template::FuzzerProfile;

pub const DEFAULT_ORACLE: &str = "cvc5";
pub const DEFAULT_FUZZER: &str = "typefuzz";
pub const DEFAULT_TEST_DIR: &str = "test/regress/cli";

/// Hard wall-clock limit of a CI job.
const JOB_TIMEOUT_SECS: f64 = 21600.0;
const MIN_REMAINING_SECS: f64 = 600.0;

#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    pub binary_path: PathBuf,
    #[serde(default)]
    pub solver_flags: String,
    pub default_oracle: Option<String>,
    pub default_fuzzer: Option<String>,
    #[serde(default)]
    pub fuzzer_overrides: Params,
    pub test_dir: Option<PathBuf>,
}

impl SolverConfig {
    /// `"<binary> <flags>"`, trimmed.
    pub fn cli(&self) -> String {
        format!("{} {}", self.binary_path.display(), self.solver_flags)
            .trim()
            .to_string()
    }

    pub fn oracle_name(&self, requested: Option<&str>) -> String {
        requested
            .or(self.default_oracle.as_deref())
            .unwrap_or(DEFAULT_ORACLE)
            .to_string()
    }

    pub fn fuzzer_name(&self, requested: Option<&str>) -> String {
        requested
            .or(self.default_fuzzer.as_deref())
            .unwrap_or(DEFAULT_FUZZER)
            .to_string()
    }

    pub fn test_dir(&self) -> PathBuf {
        self.test_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEST_DIR))
    }
}

/// Contents of a `fuzzer.json`.
///
/// Every `default_<param>` key contributes a parameter default. The remaining
/// keys, when present, replace the matching part of the fuzzer's profile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FuzzerConfig {
    pub command: Option<Vec<String>>,
    #[serde(default, deserialize_with = "exit_code_table")]
    pub exit_codes: Option<BTreeMap<i32, ExitRule>>,
    pub default_exit_action: Option<ExitRule>,
    pub dirs: Option<BTreeMap<String, DirSpec>>,
    pub bug_patterns: Option<Vec<String>>,
    pub solver_clis_separator: Option<String>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

impl FuzzerConfig {
    pub fn defaults(&self) -> Params {
        self.rest
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix("default_")
                    .map(|param| (param.to_string(), value.clone()))
            })
            .collect()
    }

    pub fn defines_command(&self) -> bool {
        self.command.as_ref().is_some_and(|cmd| !cmd.is_empty())
    }

    /// A new profile: `base` with this file's values layered on top.
    pub fn overlay(&self, base: FuzzerProfile) -> FuzzerProfile {
        let mut profile = base;
        profile.params = merge_params(&[&profile.params, &self.defaults()]);
        if let Some(command) = &self.command {
            profile.command = command.clone();
        }
        if let Some(exit_codes) = &self.exit_codes {
            profile.exit_codes = exit_codes.clone();
        }
        if let Some(rule) = self.default_exit_action {
            profile.default_exit_action = rule;
        }
        if let Some(dirs) = &self.dirs {
            profile.dirs = dirs.clone();
        }
        if let Some(patterns) = &self.bug_patterns {
            profile.bug_patterns = patterns.clone();
        }
        if let Some(separator) = &self.solver_clis_separator {
            profile.solver_clis_separator = separator.clone();
        }
        profile
    }
}

/// JSON object keys are strings; exit codes are not.
fn exit_code_table<'de, D>(deserializer: D) -> Result<Option<BTreeMap<i32, ExitRule>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, ExitRule>> = Option::deserialize(deserializer)?;
    raw.map(|table| {
        table
            .into_iter()
            .map(|(code, rule)| {
                code.trim()
                    .parse::<i32>()
                    .map(|code| (code, rule))
                    .map_err(|_| serde::de::Error::custom(format!("invalid exit code {code:?}")))
            })
            .collect()
    })
    .transpose()
}

/// Handle on a configuration directory.
#[derive(Debug, Clone)]
pub struct ConfigRoot {
    root: PathBuf,
}

impl ConfigRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn solver(&self, name: &str) -> EngineResult<SolverConfig> {
        let path = self.root.join("solvers").join(name).join("solver.json");
        if !path.exists() {
            return Err(EngineError::Configuration(format!(
                "solver config not found: {} (available solvers: {:?})",
                path.display(),
                self.list("solvers", "solver.json")
            )));
        }
        read_json(&path)
    }

    /// `Ok(None)` when the fuzzer has no `fuzzer.json`.
    pub fn fuzzer(&self, name: &str) -> EngineResult<Option<FuzzerConfig>> {
        let path = self.root.join("fuzzers").join(name).join("fuzzer.json");
        if !path.exists() {
            debug!(fuzzer = name, path = %path.display(), "no fuzzer.json, using built-in profile");
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn list(&self, kind: &str, file: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.root.join(kind)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(file).exists())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> EngineResult<T> {
    let blob = fs::read(path).map_err(|e| EngineError::io(path, e))?;
    serde_json::from_slice(&blob).map_err(|e| {
        EngineError::Configuration(format!("invalid JSON in {}: {e}", path.display()))
    })
}

/// Merge parameter layers; later layers win.
pub fn merge_params(layers: &[&Params]) -> Params {
    layers
        .iter()
        .flat_map(|layer| layer.iter())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Parse one `--fuzzer-param key=value`. Values become integers, then floats,
/// then strings, whichever parses first.
pub fn parse_param_override(raw: &str) -> EngineResult<(String, serde_json::Value)> {
    let (key, value) = raw.split_once('=').unwrap_or((raw, ""));
    let key = key.trim();
    if key.is_empty() {
        return Err(EngineError::Configuration(format!(
            "invalid --fuzzer-param {raw:?}, expected KEY=VALUE"
        )));
    }
    let value = if let Ok(int) = value.parse::<i64>() {
        serde_json::Value::from(int)
    } else if let Some(float) = value
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
    {
        serde_json::Value::Number(float)
    } else {
        serde_json::Value::String(value.to_string())
    };
    Ok((key.to_string(), value))
}

/// Parse the `--tests-json` array of seed paths.
pub fn parse_seed_list(raw: &str) -> EngineResult<Vec<PathBuf>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| EngineError::SeedList(format!("invalid JSON in --tests-json: {e}")))?;
    let serde_json::Value::Array(items) = value else {
        return Err(EngineError::SeedList(
            "tests-json must be a JSON array".to_string(),
        ));
    };
    items
        .into_iter()
        .map(|item| match item {
            serde_json::Value::String(path) => Ok(PathBuf::from(path)),
            other => Err(EngineError::SeedList(format!(
                "seed descriptors must be strings, got {other}"
            ))),
        })
        .collect()
}

/// The binary must exist as given or be found on `PATH`.
pub fn validate_binary(name: &str, binary: &Path) -> EngineResult<()> {
    if binary.exists() || find_on_path(binary).is_some() {
        return Ok(());
    }
    Err(EngineError::MissingBinary {
        name: name.to_string(),
        path: binary.to_path_buf(),
    })
}

fn find_on_path(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() != 1 {
        return None;
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Time left for fuzzing in a CI job that started at `job_start` (unix
/// seconds), given that this process started at `now` and must stop
/// `stop_buffer_minutes` before the job limit.
pub fn time_remaining_for_job(job_start: f64, now: f64, stop_buffer_minutes: u64) -> Duration {
    let setup_time = now - job_start;
    let remaining = JOB_TIMEOUT_SECS - setup_time - (stop_buffer_minutes * 60) as f64;
    if remaining < MIN_REMAINING_SECS {
        debug!(
            remaining,
            "computed remaining time below minimum, using {MIN_REMAINING_SECS}s"
        );
        return Duration::from_secs_f64(MIN_REMAINING_SECS);
    }
    Duration::from_secs(remaining as u64)
}
