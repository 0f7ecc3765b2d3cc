use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exit status reported for a run the engine killed (timeout, resource cap,
/// forced shutdown). Plugins may map it in their exit-code table.
pub const KILLED_EXIT_CODE: i32 = -1;

/// Merged fuzzer parameters (iterations, modulo, timeout, ...).
pub type Params = BTreeMap<String, serde_json::Value>;

/// What happens to a task after one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Back of the queue, attempt count bumped.
    Requeue,
    /// Never run again (e.g. the seed uses unsupported features).
    Remove,
    /// Drop without blame.
    Continue,
}

/// One row of a plugin's exit-code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRule {
    pub bug_found: bool,
    pub action: Action,
}

impl ExitRule {
    /// Used for every exit code the table does not declare.
    pub const SAFE_DEFAULT: ExitRule = ExitRule {
        bug_found: false,
        action: Action::Continue,
    };

    pub const fn new(bug_found: bool, action: Action) -> Self {
        Self { bug_found, action }
    }
}

/// The classified result of a single fuzzer invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub wall_time: Duration,
    pub bug_found: bool,
    pub action: Action,
}

impl RunOutcome {
    pub fn killed(&self) -> bool {
        self.exit_code == KILLED_EXIT_CODE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirKind {
    /// Kept across runs; scanned for bug artifacts.
    Output,
    /// Recreated before and deleted after every run.
    Temp,
}

/// A per-worker directory template such as `{work_root}/scratch_{worker_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirSpec {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: DirKind,
}

impl DirSpec {
    pub fn new(path: &str, kind: DirKind) -> Self {
        Self {
            path: path.to_string(),
            kind,
        }
    }
}

/// Where per-worker directories get rooted.
#[derive(Debug, Clone)]
pub struct DirRoots {
    pub bugs_root: PathBuf,
    pub work_root: PathBuf,
}

/// Concrete directories for one worker, keyed by the plugin's directory name
/// (`bugs_dir`, `scratch_dir`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunDirs {
    entries: BTreeMap<String, (PathBuf, DirKind)>,
}

impl RunDirs {
    pub fn resolve(
        specs: &BTreeMap<String, DirSpec>,
        worker_id: usize,
        roots: &DirRoots,
    ) -> Self {
        let worker = worker_id.to_string();
        let bugs_root = roots.bugs_root.to_string_lossy();
        let work_root = roots.work_root.to_string_lossy();
        let entries = specs
            .iter()
            .map(|(name, spec)| {
                let path = spec
                    .path
                    .replace("{worker_id}", &worker)
                    .replace("{bugs_root}", &bugs_root)
                    .replace("{work_root}", &work_root);
                (name.clone(), (PathBuf::from(path), spec.kind))
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.entries.get(name).map(|(path, _)| path.as_path())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path, DirKind)> {
        self.entries
            .iter()
            .map(|(name, (path, kind))| (name.as_str(), path.as_path(), *kind))
    }

    pub fn of_kind(&self, kind: DirKind) -> impl Iterator<Item = &Path> {
        self.iter()
            .filter(move |(_, _, k)| *k == kind)
            .map(|(_, path, _)| path)
    }
}

/// Everything a plugin sees when building one command line.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub worker_id: usize,
    pub seed_path: &'a Path,
    pub solver_cli: &'a str,
    pub oracle_cli: &'a str,
    pub dirs: &'a RunDirs,
    pub params: &'a Params,
}

/// A swappable fuzzer integration.
///
/// Implementations hold immutable defaults; per-invocation overrides arrive
/// through [`Invocation::params`] and are never written back.
pub trait FuzzerPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn default_params(&self) -> &Params;

    fn dirs(&self) -> &BTreeMap<String, DirSpec>;

    /// File-name globs (`*.smt2`) identifying bug artifacts in output dirs.
    fn bug_patterns(&self) -> &[String];

    /// Deterministic, side-effect free.
    fn build_command(&self, invocation: &Invocation<'_>) -> anyhow::Result<Vec<String>>;

    /// The declared table entry for `exit_code`, if any.
    fn exit_rule(&self, exit_code: i32) -> Option<ExitRule>;

    fn parse_result(&self, exit_code: i32, wall_time: Duration, _bugs_dir: &Path) -> RunOutcome {
        let rule = self.exit_rule(exit_code).unwrap_or(ExitRule::SAFE_DEFAULT);
        RunOutcome {
            exit_code,
            wall_time,
            bug_found: rule.bug_found,
            action: rule.action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_dirs_substitute_worker_and_roots() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "bugs_dir".to_string(),
            DirSpec::new("{bugs_root}/worker_{worker_id}", DirKind::Output),
        );
        specs.insert(
            "scratch_dir".to_string(),
            DirSpec::new("{work_root}/scratch_{worker_id}", DirKind::Temp),
        );
        let roots = DirRoots {
            bugs_root: PathBuf::from("/tmp/bugs"),
            work_root: PathBuf::from("/tmp/work"),
        };
        let dirs = RunDirs::resolve(&specs, 3, &roots);
        assert_eq!(dirs.get("bugs_dir"), Some(Path::new("/tmp/bugs/worker_3")));
        assert_eq!(dirs.get("scratch_dir"), Some(Path::new("/tmp/work/scratch_3")));
        assert_eq!(dirs.of_kind(DirKind::Temp).count(), 1);
        assert_eq!(
            dirs.of_kind(DirKind::Output).collect::<Vec<_>>(),
            vec![Path::new("/tmp/bugs/worker_3")]
        );
    }

    #[test]
    fn exit_rule_deserializes_from_table_entry() {
        let rule: ExitRule =
            serde_json::from_str(r#"{"bug_found": true, "action": "requeue"}"#).unwrap();
        assert_eq!(rule, ExitRule::new(true, Action::Requeue));
    }
}
