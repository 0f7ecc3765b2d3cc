use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::fuzzers::plugin::{DirSpec, ExitRule, FuzzerPlugin, Invocation, Params, RunOutcome};

/// Immutable description of a command-line fuzzer.
///
/// Built once per plugin variant (from code or from a `fuzzer.json`) and
/// shared read-only by every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzerProfile {
    pub name: String,
    pub params: Params,
    /// Tokens with `{placeholder}` slots.
    pub command: Vec<String>,
    pub exit_codes: BTreeMap<i32, ExitRule>,
    pub default_exit_action: ExitRule,
    pub dirs: BTreeMap<String, DirSpec>,
    pub bug_patterns: Vec<String>,
    pub solver_clis_separator: String,
}

impl FuzzerProfile {
    /// An empty profile, meant to be filled from a `fuzzer.json`.
    pub fn bare(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Params::new(),
            command: Vec::new(),
            exit_codes: BTreeMap::new(),
            default_exit_action: ExitRule::SAFE_DEFAULT,
            dirs: BTreeMap::new(),
            bug_patterns: Vec::new(),
            solver_clis_separator: ";".into(),
        }
    }
}

/// A fuzzer driven entirely by its [`FuzzerProfile`].
#[derive(Debug, Clone)]
pub struct TemplateFuzzer {
    profile: FuzzerProfile,
}

impl TemplateFuzzer {
    pub fn new(profile: FuzzerProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &FuzzerProfile {
        &self.profile
    }

    fn context(&self, invocation: &Invocation<'_>) -> BTreeMap<String, String> {
        let mut ctx: BTreeMap<String, String> = invocation
            .params
            .iter()
            .map(|(key, value)| (key.clone(), param_to_string(value)))
            .collect();
        ctx.insert(
            "seed_path".into(),
            invocation.seed_path.to_string_lossy().into_owned(),
        );
        ctx.insert("solver_cli".into(), invocation.solver_cli.to_string());
        ctx.insert("oracle_cli".into(), invocation.oracle_cli.to_string());
        ctx.insert(
            "solver_clis".into(),
            [invocation.solver_cli, invocation.oracle_cli].join(self.profile.solver_clis_separator.as_str()),
        );
        ctx.insert("worker_id".into(), invocation.worker_id.to_string());
        for (name, path, _) in invocation.dirs.iter() {
            ctx.insert(name.to_string(), path.to_string_lossy().into_owned());
        }
        ctx
    }
}

impl FuzzerPlugin for TemplateFuzzer {
    fn name(&self) -> &str {
        &self.profile.name
    }

    fn default_params(&self) -> &Params {
        &self.profile.params
    }

    fn dirs(&self) -> &BTreeMap<String, DirSpec> {
        &self.profile.dirs
    }

    fn bug_patterns(&self) -> &[String] {
        &self.profile.bug_patterns
    }

    fn build_command(&self, invocation: &Invocation<'_>) -> anyhow::Result<Vec<String>> {
        let ctx = self.context(invocation);
        self.profile
            .command
            .iter()
            .map(|token| render(token, &ctx))
            .collect()
    }

    fn exit_rule(&self, exit_code: i32) -> Option<ExitRule> {
        self.profile.exit_codes.get(&exit_code).copied()
    }

    fn parse_result(&self, exit_code: i32, wall_time: Duration, _bugs_dir: &Path) -> RunOutcome {
        let rule = self
            .exit_rule(exit_code)
            .unwrap_or(self.profile.default_exit_action);
        RunOutcome {
            exit_code,
            wall_time,
            bug_found: rule.bug_found,
            action: rule.action,
        }
    }
}

pub(crate) fn param_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute every `{key}` in `token`; unknown keys are an error.
fn render(token: &str, ctx: &BTreeMap<String, String>) -> anyhow::Result<String> {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| anyhow!("unterminated placeholder in {token:?}"))?;
        let key = &after[..end];
        let value = ctx
            .get(key)
            .ok_or_else(|| anyhow!("unknown placeholder {{{key}}} in {token:?}"))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzers::plugin::{Action, DirKind, DirRoots, RunDirs};
    use std::path::PathBuf;

    fn echo_profile() -> FuzzerProfile {
        let mut params = Params::new();
        params.insert("rounds".into(), serde_json::json!(5));
        let mut dirs = BTreeMap::new();
        dirs.insert(
            "out_dir".into(),
            DirSpec::new("{bugs_root}/w{worker_id}", DirKind::Output),
        );
        let mut exit_codes = BTreeMap::new();
        exit_codes.insert(1, ExitRule::new(true, Action::Remove));
        FuzzerProfile {
            name: "echo".into(),
            params,
            command: vec![
                "echo".into(),
                "-n{rounds}".into(),
                "{solver_clis}".into(),
                "--out={out_dir}".into(),
                "{seed_path}".into(),
            ],
            exit_codes,
            default_exit_action: ExitRule::SAFE_DEFAULT,
            dirs,
            bug_patterns: vec!["*.smt2".into()],
            solver_clis_separator: "|".into(),
        }
    }

    #[test]
    fn render_fills_every_placeholder() {
        let fuzzer = TemplateFuzzer::new(echo_profile());
        let roots = DirRoots {
            bugs_root: PathBuf::from("bugs"),
            work_root: PathBuf::from("."),
        };
        let dirs = RunDirs::resolve(fuzzer.dirs(), 0, &roots);
        let params = fuzzer.default_params().clone();
        let invocation = Invocation {
            worker_id: 0,
            seed_path: Path::new("tests/a.smt2"),
            solver_cli: "z3 smt.arith=1",
            oracle_cli: "cvc5 -q",
            dirs: &dirs,
            params: &params,
        };
        let cmd = fuzzer.build_command(&invocation).unwrap();
        assert_eq!(
            cmd,
            vec![
                "echo",
                "-n5",
                "z3 smt.arith=1|cvc5 -q",
                "--out=bugs/w0",
                "tests/a.smt2"
            ]
        );
        assert_eq!(cmd, fuzzer.build_command(&invocation).unwrap());
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let ctx = BTreeMap::new();
        assert!(render("{missing}", &ctx).is_err());
        assert!(render("{open", &ctx).is_err());
        assert_eq!(render("plain", &ctx).unwrap(), "plain");
    }

    #[test]
    fn unmapped_exit_code_uses_profile_default() {
        let fuzzer = TemplateFuzzer::new(echo_profile());
        let outcome = fuzzer.parse_result(42, Duration::from_secs(1), Path::new("bugs"));
        assert!(!outcome.bug_found);
        assert_eq!(outcome.action, Action::Continue);

        let outcome = fuzzer.parse_result(1, Duration::from_secs(1), Path::new("bugs"));
        assert!(outcome.bug_found);
        assert_eq!(outcome.action, Action::Remove);
    }
}
