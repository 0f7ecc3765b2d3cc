use std::collections::BTreeMap;

use crate::fuzzers::plugin::{Action, DirKind, DirSpec, ExitRule, Params};
use crate::fuzzers::template::FuzzerProfile;

/// yinyang's type-aware SMT formula mutator.
pub fn profile() -> FuzzerProfile {
    let mut params = Params::new();
    params.insert("iterations".into(), 250.into());
    params.insert("modulo".into(), 2.into());
    params.insert("timeout".into(), 120.into());

    let command = [
        "typefuzz",
        "-i", "{iterations}",
        "-m", "{modulo}",
        "--timeout", "{timeout}",
        "--bugs", "{bugs_dir}",
        "--scratch", "{scratch_dir}",
        "--logfolder", "{log_dir}",
        "{solver_clis}",
        "{seed_path}",
    ]
    .iter()
    .map(|token| token.to_string())
    .collect();

    let exit_codes = BTreeMap::from([
        (10, ExitRule::new(true, Action::Requeue)),
        (3, ExitRule::new(false, Action::Remove)),
        (0, ExitRule::new(false, Action::Requeue)),
    ]);

    let dirs = BTreeMap::from([
        (
            "bugs_dir".to_string(),
            DirSpec::new("{bugs_root}/worker_{worker_id}", DirKind::Output),
        ),
        (
            "scratch_dir".to_string(),
            DirSpec::new("{work_root}/scratch_{worker_id}", DirKind::Temp),
        ),
        (
            "log_dir".to_string(),
            DirSpec::new("{work_root}/logs_{worker_id}", DirKind::Temp),
        ),
    ]);

    FuzzerProfile {
        name: "typefuzz".into(),
        params,
        command,
        exit_codes,
        default_exit_action: ExitRule::SAFE_DEFAULT,
        dirs,
        bug_patterns: vec!["*.smt2".into(), "*.smt".into()],
        solver_clis_separator: ";".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzers::plugin::{DirRoots, FuzzerPlugin, Invocation, RunDirs};
    use crate::fuzzers::template::TemplateFuzzer;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    #[test]
    fn builds_yinyang_command_line() {
        let fuzzer = TemplateFuzzer::new(profile());
        let roots = DirRoots {
            bugs_root: PathBuf::from("bugs"),
            work_root: PathBuf::from("run"),
        };
        let dirs = RunDirs::resolve(fuzzer.dirs(), 2, &roots);
        let mut params = fuzzer.default_params().clone();
        params.insert("iterations".into(), 500.into());
        let cmd = fuzzer
            .build_command(&Invocation {
                worker_id: 2,
                seed_path: Path::new("regress/t.smt2"),
                solver_cli: "/opt/z3 model_validate=true",
                oracle_cli: "/opt/cvc5 --check-models",
                dirs: &dirs,
                params: &params,
            })
            .unwrap();
        assert_eq!(
            cmd,
            vec![
                "typefuzz",
                "-i", "500",
                "-m", "2",
                "--timeout", "120",
                "--bugs", "bugs/worker_2",
                "--scratch", "run/scratch_2",
                "--logfolder", "run/logs_2",
                "/opt/z3 model_validate=true;/opt/cvc5 --check-models",
                "regress/t.smt2",
            ]
        );
    }

    #[test]
    fn exit_table_matches_yinyang_conventions() {
        let fuzzer = TemplateFuzzer::new(profile());
        let bugs = Path::new("bugs/worker_0");
        let wall = Duration::from_secs(3);

        let found = fuzzer.parse_result(10, wall, bugs);
        assert!(found.bug_found);
        assert_eq!(found.action, Action::Requeue);

        let unsupported = fuzzer.parse_result(3, wall, bugs);
        assert_eq!(unsupported.action, Action::Remove);

        let clean = fuzzer.parse_result(0, wall, bugs);
        assert!(!clean.bug_found);
        assert_eq!(clean.action, Action::Requeue);

        let killed = fuzzer.parse_result(crate::fuzzers::plugin::KILLED_EXIT_CODE, wall, bugs);
        assert_eq!((killed.bug_found, killed.action), (false, Action::Continue));
        assert!(killed.killed());
    }
}
